use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use parlor_store::{Conversation, Message};

use super::error::{FixtureParseSnafu, GatewayResult};

/// Seed data for [`crate::MemoryGateway`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayFixture {
    #[serde(default)]
    pub conversations: Vec<FixtureConversation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureConversation {
    #[serde(flatten)]
    pub conversation: Conversation,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl GatewayFixture {
    pub fn from_json(raw: &str) -> GatewayResult<Self> {
        serde_json::from_str(raw).context(FixtureParseSnafu {
            stage: "parse-gateway-fixture",
        })
    }
}

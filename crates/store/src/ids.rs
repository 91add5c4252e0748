use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use uuid::Uuid;

use super::error::{InvalidMessageIdSnafu, StoreResult};

/// Prefix carried by every client-minted message id.
pub const LOCAL_MESSAGE_ID_PREFIX: &str = "local-";

// Gateway ids are opaque strings, so every wrapper shares one shape.
macro_rules! define_string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl FromStr for $name {
            type Err = Infallible;

            fn from_str(raw: &str) -> Result<Self, Self::Err> {
                Ok(Self::new(raw))
            }
        }
    };
}

define_string_id!(
    /// Identity of one participant.
    UserId
);
define_string_id!(
    /// Stable identifier of one conversation.
    ConversationId
);
define_string_id!(
    /// Server-assigned id for confirmed messages, `local-<uuid>` for optimistic ones.
    MessageId
);

impl MessageId {
    /// Mints a placeholder id for a message that has not been confirmed by the gateway.
    ///
    /// UUID v7 keeps ids unique even when two sends land in the same millisecond.
    pub fn local() -> Self {
        Self(format!("{LOCAL_MESSAGE_ID_PREFIX}{}", Uuid::now_v7()))
    }

    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_MESSAGE_ID_PREFIX)
    }

    /// Returns the UUID embedded in a local placeholder id.
    pub fn local_uuid(&self) -> StoreResult<Uuid> {
        let raw = self
            .0
            .strip_prefix(LOCAL_MESSAGE_ID_PREFIX)
            .unwrap_or(self.0.as_str());

        Uuid::parse_str(raw).context(InvalidMessageIdSnafu {
            stage: "parse-local-message-id",
            raw: self.0.clone(),
        })
    }
}

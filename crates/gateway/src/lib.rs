//! Boundary to the remote messaging API.
//!
//! The messenger core only ever talks to [`Gateway`]; the HTTP client behind it lives
//! outside this workspace. [`MemoryGateway`] is a scriptable stand-in used by tests and
//! the QA runner.

use std::future::Future;
use std::pin::Pin;

use parlor_store::{Conversation, ConversationId, Message};

mod error;
mod fixture;
mod memory;

pub use error::{GatewayError, GatewayResult};
pub use fixture::{FixtureConversation, GatewayFixture};
pub use memory::MemoryGateway;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait Gateway: Send + Sync {
    fn list_conversations<'a>(&'a self) -> BoxFuture<'a, GatewayResult<Vec<Conversation>>>;

    fn list_messages<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
    ) -> BoxFuture<'a, GatewayResult<Vec<Message>>>;

    /// Delivers a message carrying its client-chosen id, sender, content and timestamp.
    fn send_message<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
        message: &'a Message,
    ) -> BoxFuture<'a, GatewayResult<()>>;
}

//! In-memory session store for the messaging core: the data model shared with the
//! gateway and the per-session message cache.

pub mod cache;
pub mod error;
pub mod ids;
pub mod types;

pub use cache::{MessageCache, SharedMessageCache};
pub use error::{StoreError, StoreResult};
pub use ids::{ConversationId, LOCAL_MESSAGE_ID_PREFIX, MessageId, UserId};
pub use types::{Conversation, DEFAULT_CONVERSATION_TITLE, Message, Participant};

#![deny(unsafe_code)]
//! Conversation session core: cached message histories, optimistic sends and the
//! date-grouped timeline a chat view renders.

pub mod clock;
pub mod error;
pub mod events;
pub mod projector;
pub mod selector;
pub mod send;
pub mod session;
pub mod settings;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{MessengerError, MessengerResult};
pub use events::{Notice, NoticeId, NoticeKind, SessionEvent, SessionSignals};
pub use projector::{
    DateHeader, Direction, MessageView, ProjectionContext, TimelineEntry, project,
};
pub use selector::{ConversationSelector, FetchState, SelectedConversation};
pub use send::{PendingSend, SendCoordinator};
pub use session::{ConversationSummary, MessengerSession, SessionSnapshot};
pub use settings::{MessengerSettings, SettingsError, SettingsStore};

pub use parlor_gateway::{Gateway, GatewayError, GatewayFixture, MemoryGateway};
pub use parlor_store::{
    Conversation, ConversationId, Message, MessageId, Participant, SharedMessageCache, UserId,
};

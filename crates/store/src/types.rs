use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ConversationId, MessageId, UserId};

/// Title used when a conversation has neither a stored title nor named participants.
pub const DEFAULT_CONVERSATION_TITLE: &str = "Untitled conversation";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: UserId,
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl Participant {
    pub fn new(id: impl Into<UserId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            avatar_url: None,
        }
    }

    pub fn with_avatar(mut self, avatar_url: impl Into<String>) -> Self {
        self.avatar_url = Some(avatar_url.into());
        self
    }
}

/// A thread between a fixed set of participants.
///
/// Conversations are fetched once per session and never mutated afterwards; their
/// message history lives in the message cache, not here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub title: Option<String>,
}

impl Conversation {
    pub fn new(id: impl Into<ConversationId>, participants: Vec<Participant>) -> Self {
        Self {
            id: id.into(),
            participants,
            title: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Human-readable title as seen by `viewer`.
    ///
    /// A two-person conversation is named after the other participant. Anything else
    /// uses the stored title, falling back to the participant names.
    pub fn display_title(&self, viewer: &UserId) -> String {
        if let [first, second] = self.participants.as_slice() {
            let other = if &first.id == viewer { second } else { first };
            return other.display_name.clone();
        }

        if let Some(title) = self.title.as_deref().map(str::trim)
            && !title.is_empty()
        {
            return title.to_string();
        }

        let names = self
            .participants
            .iter()
            .map(|participant| participant.display_name.trim())
            .filter(|name| !name.is_empty())
            .collect::<Vec<_>>();

        if names.is_empty() {
            DEFAULT_CONVERSATION_TITLE.to_string()
        } else {
            names.join(", ")
        }
    }

    pub fn participant(&self, user_id: &UserId) -> Option<&Participant> {
        self.participants
            .iter()
            .find(|participant| &participant.id == user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    pub sender_name: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(
        id: impl Into<MessageId>,
        sender: &Participant,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            sender_id: sender.id.clone(),
            sender_name: sender.display_name.clone(),
            content: content.into(),
            timestamp,
        }
    }

    /// Synthesizes an unconfirmed message with a fresh local id.
    pub fn outgoing(
        sender: &Participant,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self::new(MessageId::local(), sender, content, timestamp)
    }

    pub fn is_from(&self, user_id: &UserId) -> bool {
        &self.sender_id == user_id
    }
}

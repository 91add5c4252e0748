use std::fmt::{self, Write};

use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Utc};

use parlor_store::{Message, MessageId, UserId};

use crate::settings::{DEFAULT_DATE_LABEL_FORMAT, DEFAULT_TIME_LABEL_FORMAT, MessengerSettings};

/// Display alignment of one message; carries no business meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Sent,
    Received,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateHeader {
    pub date: NaiveDate,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageView {
    pub id: MessageId,
    pub sender_id: UserId,
    pub sender_name: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub time_label: String,
    pub direction: Direction,
    /// The message is an optimistic send still waiting for the gateway.
    pub pending: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimelineEntry {
    DateHeader(DateHeader),
    Message(MessageView),
}

impl TimelineEntry {
    pub fn as_message(&self) -> Option<&MessageView> {
        match self {
            Self::Message(view) => Some(view),
            Self::DateHeader(_) => None,
        }
    }

    pub fn as_date_header(&self) -> Option<&DateHeader> {
        match self {
            Self::DateHeader(header) => Some(header),
            Self::Message(_) => None,
        }
    }
}

/// Everything the projection depends on besides the message list itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectionContext {
    pub current_user: UserId,
    pub utc_offset: FixedOffset,
    pub date_label_format: String,
    pub time_label_format: String,
    pub pending_message: Option<MessageId>,
}

impl ProjectionContext {
    pub fn new(current_user: impl Into<UserId>) -> Self {
        Self {
            current_user: current_user.into(),
            utc_offset: Utc.fix(),
            date_label_format: DEFAULT_DATE_LABEL_FORMAT.to_string(),
            time_label_format: DEFAULT_TIME_LABEL_FORMAT.to_string(),
            pending_message: None,
        }
    }

    pub fn from_settings(current_user: impl Into<UserId>, settings: &MessengerSettings) -> Self {
        Self {
            utc_offset: settings.display_offset(),
            date_label_format: settings.date_label_format.clone(),
            time_label_format: settings.time_label_format.clone(),
            ..Self::new(current_user)
        }
    }

    pub fn with_pending_message(mut self, pending_message: Option<MessageId>) -> Self {
        self.pending_message = pending_message;
        self
    }

    pub fn with_utc_offset(mut self, utc_offset: FixedOffset) -> Self {
        self.utc_offset = utc_offset;
        self
    }
}

/// Groups `messages` under date headers, in stored order.
///
/// A header is emitted before the first message and before every message whose calendar
/// day (in the context's offset) differs from the previous message's. The output depends
/// only on the inputs, so it can be recomputed after any cache mutation.
pub fn project(messages: &[Message], context: &ProjectionContext) -> Vec<TimelineEntry> {
    let mut entries = Vec::with_capacity(messages.len() + 1);
    let mut previous_date = None;

    for message in messages {
        let local = message.timestamp.with_timezone(&context.utc_offset);
        let date = local.date_naive();

        if previous_date != Some(date) {
            entries.push(TimelineEntry::DateHeader(DateHeader {
                date,
                label: render_label(&date.format(&context.date_label_format))
                    .unwrap_or_else(|| date.format(DEFAULT_DATE_LABEL_FORMAT).to_string()),
            }));
            previous_date = Some(date);
        }

        let direction = if message.is_from(&context.current_user) {
            Direction::Sent
        } else {
            Direction::Received
        };

        entries.push(TimelineEntry::Message(MessageView {
            id: message.id.clone(),
            sender_id: message.sender_id.clone(),
            sender_name: message.sender_name.clone(),
            content: message.content.clone(),
            timestamp: message.timestamp,
            time_label: render_label(&local.format(&context.time_label_format))
                .unwrap_or_else(|| local.format(DEFAULT_TIME_LABEL_FORMAT).to_string()),
            direction,
            pending: context.pending_message.as_ref() == Some(&message.id),
        }));
    }

    entries
}

// `to_string` panics on an invalid strftime item; writing reports it instead.
fn render_label(formatted: &impl fmt::Display) -> Option<String> {
    let mut label = String::new();
    write!(label, "{formatted}").ok()?;
    Some(label)
}

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use snafu::OptionExt;

use super::error::{InvalidStateSnafu, StoreResult};
use super::ids::{ConversationId, MessageId};
use super::types::Message;

/// Conversation id -> fetched message history for the current session.
///
/// An entry exists if and only if the conversation was fetched at least once. An empty
/// entry means "fetched, no messages yet" and must never trigger another fetch.
#[derive(Debug, Default, Clone)]
pub struct MessageCache {
    entries: HashMap<ConversationId, Vec<Message>>,
}

impl MessageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, conversation_id: &ConversationId) -> Option<&[Message]> {
        self.entries.get(conversation_id).map(Vec::as_slice)
    }

    pub fn contains(&self, conversation_id: &ConversationId) -> bool {
        self.entries.contains_key(conversation_id)
    }

    /// Replaces the entry wholesale with a freshly fetched history.
    pub fn set(&mut self, conversation_id: ConversationId, messages: Vec<Message>) {
        let messages = into_timestamp_order(&conversation_id, messages);
        self.entries.insert(conversation_id, messages);
    }

    /// Populates the entry only when none exists and returns whatever entry survives.
    pub fn insert_if_absent(
        &mut self,
        conversation_id: ConversationId,
        messages: Vec<Message>,
    ) -> &[Message] {
        if self.entries.contains_key(&conversation_id) {
            tracing::debug!(
                conversation_id = %conversation_id,
                "cache entry populated concurrently; keeping existing messages"
            );
        }

        self.entries
            .entry(conversation_id)
            .or_insert_with_key(|conversation_id| into_timestamp_order(conversation_id, messages))
            .as_slice()
    }

    /// Adds one message at the tail of an existing entry.
    pub fn append(
        &mut self,
        conversation_id: &ConversationId,
        message: Message,
    ) -> StoreResult<()> {
        let messages = self
            .entries
            .get_mut(conversation_id)
            .context(InvalidStateSnafu {
                stage: "cache-append",
                conversation_id: conversation_id.to_string(),
            })?;

        if messages
            .last()
            .is_some_and(|last| last.timestamp > message.timestamp)
        {
            // Appends never reorder; a skewed clock only shows up in the logs.
            tracing::debug!(
                conversation_id = %conversation_id,
                message_id = %message.id,
                "appended message is older than the current tail"
            );
        }

        messages.push(message);
        Ok(())
    }

    /// Removes exactly one message with `message_id`.
    ///
    /// Returns `false` when the message (or the whole entry) is already gone, so repeated
    /// rollbacks stay harmless.
    pub fn remove(&mut self, conversation_id: &ConversationId, message_id: &MessageId) -> bool {
        let Some(messages) = self.entries.get_mut(conversation_id) else {
            return false;
        };

        match messages.iter().position(|message| &message.id == message_id) {
            Some(index) => {
                messages.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn conversation_ids(&self) -> impl Iterator<Item = &ConversationId> {
        self.entries.keys()
    }
}

fn into_timestamp_order(
    conversation_id: &ConversationId,
    mut messages: Vec<Message>,
) -> Vec<Message> {
    let ordered = messages
        .windows(2)
        .all(|pair| pair[0].timestamp <= pair[1].timestamp);

    if !ordered {
        tracing::debug!(
            conversation_id = %conversation_id,
            message_count = messages.len(),
            "fetched messages were out of order; sorting by timestamp"
        );
        // Stable sort keeps gateway order for equal timestamps.
        messages.sort_by_key(|message| message.timestamp);
    }

    messages
}

/// Clonable handle to one session's cache.
///
/// Every operation takes the lock for its own duration only, so each per-key mutation is
/// atomic and no lock is ever held across an await point.
#[derive(Debug, Default, Clone)]
pub struct SharedMessageCache {
    inner: Arc<RwLock<MessageCache>>,
}

impl SharedMessageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, conversation_id: &ConversationId) -> Option<Vec<Message>> {
        self.inner.read().get(conversation_id).map(<[Message]>::to_vec)
    }

    pub fn contains(&self, conversation_id: &ConversationId) -> bool {
        self.inner.read().contains(conversation_id)
    }

    pub fn message_count(&self, conversation_id: &ConversationId) -> Option<usize> {
        self.inner
            .read()
            .get(conversation_id)
            .map(<[Message]>::len)
    }

    pub fn last_message(&self, conversation_id: &ConversationId) -> Option<Message> {
        self.inner
            .read()
            .get(conversation_id)
            .and_then(<[Message]>::last)
            .cloned()
    }

    pub fn set(&self, conversation_id: ConversationId, messages: Vec<Message>) {
        self.inner.write().set(conversation_id, messages);
    }

    pub fn insert_if_absent(
        &self,
        conversation_id: ConversationId,
        messages: Vec<Message>,
    ) -> Vec<Message> {
        self.inner
            .write()
            .insert_if_absent(conversation_id, messages)
            .to_vec()
    }

    pub fn append(&self, conversation_id: &ConversationId, message: Message) -> StoreResult<()> {
        self.inner.write().append(conversation_id, message)
    }

    pub fn remove(&self, conversation_id: &ConversationId, message_id: &MessageId) -> bool {
        self.inner.write().remove(conversation_id, message_id)
    }

    /// Runs `read` against the cached entry without cloning it.
    pub fn with_messages<T>(
        &self,
        conversation_id: &ConversationId,
        read: impl FnOnce(&[Message]) -> T,
    ) -> Option<T> {
        self.inner.read().get(conversation_id).map(read)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};

    use super::*;
    use crate::error::StoreError;
    use crate::types::Participant;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0)
            .single()
            .expect("valid fixture timestamp")
    }

    fn message(id: &str, hour: u32) -> Message {
        Message::new(id, &Participant::new("u2", "Bob"), format!("m{id}"), at(hour))
    }

    fn ids(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|message| message.id.as_str()).collect()
    }

    #[test]
    fn absent_and_empty_entries_are_distinct() {
        let mut cache = MessageCache::new();
        let conversation_id = ConversationId::new("c1");

        assert!(cache.get(&conversation_id).is_none());

        cache.set(conversation_id.clone(), Vec::new());
        assert_eq!(cache.get(&conversation_id).map(<[Message]>::len), Some(0));
        assert!(cache.contains(&conversation_id));
    }

    #[test]
    fn append_requires_a_fetched_entry() {
        let mut cache = MessageCache::new();
        let conversation_id = ConversationId::new("c1");

        let error = cache
            .append(&conversation_id, message("1", 10))
            .expect_err("append before fetch must fail");
        assert!(matches!(error, StoreError::InvalidState { .. }));
        assert!(!cache.contains(&conversation_id));
    }

    #[test]
    fn append_pushes_to_the_tail_without_reordering() {
        let mut cache = MessageCache::new();
        let conversation_id = ConversationId::new("c1");
        cache.set(conversation_id.clone(), vec![message("1", 10), message("2", 12)]);

        cache
            .append(&conversation_id, message("3", 11))
            .expect("append to fetched entry");

        assert_eq!(ids(cache.get(&conversation_id).unwrap_or_default()), ["1", "2", "3"]);
    }

    #[test]
    fn set_orders_fetched_history_by_timestamp() {
        let mut cache = MessageCache::new();
        let conversation_id = ConversationId::new("c1");

        cache.set(
            conversation_id.clone(),
            vec![message("b", 12), message("a", 10), message("c", 12)],
        );

        assert_eq!(ids(cache.get(&conversation_id).unwrap_or_default()), ["a", "b", "c"]);
    }

    #[test]
    fn remove_is_exact_and_idempotent() {
        let mut cache = MessageCache::new();
        let conversation_id = ConversationId::new("c1");
        cache.set(
            conversation_id.clone(),
            vec![message("1", 10), message("2", 11), message("3", 12)],
        );

        assert!(cache.remove(&conversation_id, &MessageId::new("2")));
        assert!(!cache.remove(&conversation_id, &MessageId::new("2")));
        assert!(!cache.remove(&ConversationId::new("missing"), &MessageId::new("1")));
        assert_eq!(ids(cache.get(&conversation_id).unwrap_or_default()), ["1", "3"]);
    }

    #[test]
    fn insert_if_absent_keeps_an_existing_entry() {
        let mut cache = MessageCache::new();
        let conversation_id = ConversationId::new("c1");
        cache.set(conversation_id.clone(), vec![message("1", 10)]);

        let surviving = cache.insert_if_absent(conversation_id.clone(), Vec::new());
        assert_eq!(ids(surviving), ["1"]);

        let fresh = cache.insert_if_absent(ConversationId::new("c2"), vec![message("9", 9)]);
        assert_eq!(ids(fresh), ["9"]);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn shared_handles_observe_the_same_entries() {
        let cache = SharedMessageCache::new();
        let other_handle = cache.clone();
        let conversation_id = ConversationId::new("c1");

        cache.set(conversation_id.clone(), vec![message("1", 10)]);
        other_handle
            .append(&conversation_id, message("2", 11))
            .expect("append through clone");

        assert_eq!(cache.message_count(&conversation_id), Some(2));
        assert_eq!(
            cache.last_message(&conversation_id).map(|message| message.id),
            Some(MessageId::new("2"))
        );
        assert_eq!(
            cache.with_messages(&conversation_id, |messages| ids(messages).join(",")),
            Some("1,2".to_string())
        );
    }
}

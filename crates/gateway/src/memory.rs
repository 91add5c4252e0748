use std::collections::{HashMap, HashSet};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::watch;

use parlor_store::{Conversation, ConversationId, Message};

use super::error::{GatewayError, GatewayResult};
use super::fixture::GatewayFixture;
use super::{BoxFuture, Gateway};

#[derive(Debug, Default)]
struct MemoryState {
    conversations: Vec<Conversation>,
    messages: HashMap<ConversationId, Vec<Message>>,
    list_conversations_calls: usize,
    list_messages_calls: HashMap<ConversationId, usize>,
    send_calls: usize,
    fail_list_conversations: bool,
    failing_message_lists: HashSet<ConversationId>,
    message_list_delays: HashMap<ConversationId, Duration>,
    pending_send_failures: usize,
}

/// Gateway backed by process memory, with call counters and scripted failures.
#[derive(Debug)]
pub struct MemoryGateway {
    state: RwLock<MemoryState>,
    sends_paused: watch::Sender<bool>,
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGateway {
    pub fn new() -> Self {
        let (sends_paused, _) = watch::channel(false);
        Self {
            state: RwLock::new(MemoryState::default()),
            sends_paused,
        }
    }

    pub fn from_fixture(fixture: GatewayFixture) -> Self {
        let gateway = Self::new();
        for entry in fixture.conversations {
            gateway.insert_conversation(entry.conversation, entry.messages);
        }
        gateway
    }

    pub fn from_fixture_json(raw: &str) -> GatewayResult<Self> {
        Ok(Self::from_fixture(GatewayFixture::from_json(raw)?))
    }

    /// Adds (or replaces) a conversation together with its server-side history.
    pub fn insert_conversation(&self, conversation: Conversation, messages: Vec<Message>) {
        let mut state = self.state.write();
        let conversation_id = conversation.id.clone();

        match state
            .conversations
            .iter_mut()
            .find(|existing| existing.id == conversation_id)
        {
            Some(existing) => *existing = conversation,
            None => state.conversations.push(conversation),
        }
        state.messages.insert(conversation_id, messages);
    }

    pub fn list_conversations_calls(&self) -> usize {
        self.state.read().list_conversations_calls
    }

    pub fn list_messages_calls(&self, conversation_id: &ConversationId) -> usize {
        self.state
            .read()
            .list_messages_calls
            .get(conversation_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn send_calls(&self) -> usize {
        self.state.read().send_calls
    }

    /// Messages the gateway has accepted for `conversation_id`, seed history included.
    pub fn delivered_messages(&self, conversation_id: &ConversationId) -> Vec<Message> {
        self.state
            .read()
            .messages
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn fail_list_conversations(&self, fail: bool) {
        self.state.write().fail_list_conversations = fail;
    }

    pub fn fail_list_messages(&self, conversation_id: &ConversationId, fail: bool) {
        let mut state = self.state.write();
        if fail {
            state.failing_message_lists.insert(conversation_id.clone());
        } else {
            state.failing_message_lists.remove(conversation_id);
        }
    }

    /// Delays every `list_messages` call for one conversation.
    pub fn delay_list_messages(&self, conversation_id: &ConversationId, delay: Duration) {
        self.state
            .write()
            .message_list_delays
            .insert(conversation_id.clone(), delay);
    }

    /// The next `count` sends are rejected when they resolve.
    pub fn fail_next_sends(&self, count: usize) {
        self.state.write().pending_send_failures = count;
    }

    pub fn fail_next_send(&self) {
        self.fail_next_sends(1);
    }

    /// Holds every in-flight and future send until [`Self::resume_sends`] is called.
    pub fn pause_sends(&self) {
        self.sends_paused.send_replace(true);
    }

    pub fn resume_sends(&self) {
        self.sends_paused.send_replace(false);
    }

    async fn wait_until_sends_resume(&self) -> GatewayResult<()> {
        let mut paused = self.sends_paused.subscribe();
        paused
            .wait_for(|paused| !*paused)
            .await
            .map(|_| ())
            .map_err(|source| GatewayError::Unavailable {
                stage: "memory-send-wait-resume",
                operation: "send_message",
                details: source.to_string(),
            })
    }
}

impl Gateway for MemoryGateway {
    fn list_conversations<'a>(&'a self) -> BoxFuture<'a, GatewayResult<Vec<Conversation>>> {
        Box::pin(async move {
            let mut state = self.state.write();
            state.list_conversations_calls += 1;

            if state.fail_list_conversations {
                return Err(GatewayError::Unavailable {
                    stage: "memory-list-conversations",
                    operation: "list_conversations",
                    details: "scripted failure".to_string(),
                });
            }

            Ok(state.conversations.clone())
        })
    }

    fn list_messages<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
    ) -> BoxFuture<'a, GatewayResult<Vec<Message>>> {
        Box::pin(async move {
            let delay = {
                let mut state = self.state.write();
                *state
                    .list_messages_calls
                    .entry(conversation_id.clone())
                    .or_insert(0) += 1;
                state.message_list_delays.get(conversation_id).copied()
            };

            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let state = self.state.read();
            if state.failing_message_lists.contains(conversation_id) {
                return Err(GatewayError::Unavailable {
                    stage: "memory-list-messages",
                    operation: "list_messages",
                    details: format!("scripted failure for conversation '{conversation_id}'"),
                });
            }

            state
                .messages
                .get(conversation_id)
                .cloned()
                .ok_or_else(|| GatewayError::ConversationNotFound {
                    stage: "memory-list-messages",
                    conversation_id: conversation_id.to_string(),
                })
        })
    }

    fn send_message<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
        message: &'a Message,
    ) -> BoxFuture<'a, GatewayResult<()>> {
        Box::pin(async move {
            self.state.write().send_calls += 1;
            self.wait_until_sends_resume().await?;

            let mut state = self.state.write();
            if state.pending_send_failures > 0 {
                state.pending_send_failures -= 1;
                tracing::debug!(
                    conversation_id = %conversation_id,
                    message_id = %message.id,
                    "memory gateway rejecting scripted send"
                );
                return Err(GatewayError::Rejected {
                    stage: "memory-send-message",
                    operation: "send_message",
                    reason: "scripted failure".to_string(),
                });
            }

            let Some(history) = state.messages.get_mut(conversation_id) else {
                return Err(GatewayError::ConversationNotFound {
                    stage: "memory-send-message",
                    conversation_id: conversation_id.to_string(),
                });
            };

            history.push(message.clone());
            Ok(())
        })
    }
}

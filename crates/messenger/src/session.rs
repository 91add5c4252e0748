use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use parlor_gateway::Gateway;
use parlor_store::{
    Conversation, ConversationId, Message, MessageId, Participant, SharedMessageCache,
};

use crate::clock::{Clock, SystemClock};
use crate::error::{MessengerError, MessengerResult};
use crate::events::{Notice, NoticeId, NoticeKind, SessionEvent, SessionSignals};
use crate::projector::{ProjectionContext, TimelineEntry, project};
use crate::selector::{ConversationSelector, FetchState, SelectedConversation, bounded_fetch};
use crate::send::{PendingSend, SendCoordinator};
use crate::settings::MessengerSettings;

/// One row of the conversation list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    pub conversation_id: ConversationId,
    pub title: String,
    pub last_message_preview: Option<String>,
    pub last_activity: Option<DateTime<Utc>>,
    pub active: bool,
    pub send_pending: bool,
}

/// Everything a view needs to render one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub revision: u64,
    pub active_conversation_id: Option<ConversationId>,
    pub active_title: Option<String>,
    pub timeline: Vec<TimelineEntry>,
    /// The input control must reject submissions while this is set.
    pub input_disabled: bool,
    pub notices: Vec<Notice>,
}

#[derive(Debug, Default)]
struct SelectionState {
    conversations: Vec<Conversation>,
    active: Option<ConversationId>,
    // Bumped on every selection request; only the latest request may set `active`.
    ticket: u64,
}

/// A signed-in user's view onto their conversations.
///
/// Cheap to clone; clones share the cache, pending sends and notices.
#[derive(Clone)]
pub struct MessengerSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    current_user: Participant,
    gateway: Arc<dyn Gateway>,
    settings: Arc<MessengerSettings>,
    cache: SharedMessageCache,
    signals: Arc<SessionSignals>,
    selector: ConversationSelector,
    sender: SendCoordinator,
    selection: Mutex<SelectionState>,
}

impl MessengerSession {
    pub fn new(
        current_user: Participant,
        gateway: Arc<dyn Gateway>,
        settings: Arc<MessengerSettings>,
    ) -> Self {
        Self::with_clock(current_user, gateway, settings, Arc::new(SystemClock))
    }

    pub fn with_clock(
        current_user: Participant,
        gateway: Arc<dyn Gateway>,
        settings: Arc<MessengerSettings>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let cache = SharedMessageCache::new();
        let signals = Arc::new(SessionSignals::new(settings.event_buffer));
        let selector = ConversationSelector::new(
            cache.clone(),
            Arc::clone(&gateway),
            Arc::clone(&signals),
            settings.fetch_timeout(),
        );
        let sender = SendCoordinator::new(
            cache.clone(),
            Arc::clone(&gateway),
            Arc::clone(&signals),
            clock,
            settings.send_timeout(),
        );

        Self {
            inner: Arc::new(SessionInner {
                current_user,
                gateway,
                settings,
                cache,
                signals,
                selector,
                sender,
                selection: Mutex::new(SelectionState::default()),
            }),
        }
    }

    pub fn current_user(&self) -> &Participant {
        &self.inner.current_user
    }

    pub fn settings(&self) -> &MessengerSettings {
        &self.inner.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.signals.subscribe()
    }

    pub fn revision(&self) -> u64 {
        self.inner.signals.revision()
    }

    /// Fetches the conversation list and, when configured, selects the first entry.
    ///
    /// On failure the list is left empty and a dismissible notice is raised.
    pub async fn load_conversations(&self) -> MessengerResult<Vec<Conversation>> {
        let fetched = bounded_fetch(
            self.inner.settings.fetch_timeout(),
            "list_conversations",
            "session-list-conversations",
            self.inner.gateway.list_conversations(),
        )
        .await;

        let conversations = match fetched {
            Ok(conversations) => conversations,
            Err(error) => {
                tracing::warn!(%error, "failed to load conversation list");
                self.inner.selection.lock().conversations.clear();
                self.inner.signals.raise(
                    NoticeKind::FetchFailed {
                        conversation_id: None,
                    },
                    format!("Could not load conversations: {error}"),
                    error.is_retryable(),
                );
                return Err(error);
            }
        };

        self.inner.selection.lock().conversations = conversations.clone();
        tracing::info!(count = conversations.len(), "loaded conversation list");
        self.inner.signals.emit(SessionEvent::ConversationsLoaded {
            count: conversations.len(),
        });

        if self.inner.settings.auto_select_first
            && let Some(first) = conversations.first()
        {
            // A failed auto-selection is already reported through a notice.
            if let Err(error) = self.select_conversation(first).await {
                tracing::debug!(%error, "auto-selection of first conversation failed");
            }
        }

        Ok(conversations)
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.inner.selection.lock().conversations.clone()
    }

    pub fn conversation(&self, conversation_id: &ConversationId) -> Option<Conversation> {
        self.inner
            .selection
            .lock()
            .conversations
            .iter()
            .find(|conversation| &conversation.id == conversation_id)
            .cloned()
    }

    /// Makes `conversation` active once its messages are available.
    ///
    /// When selections overlap, only the most recently requested one becomes active; an
    /// earlier request that finishes later still populates the cache. A failed fetch keeps
    /// the previous selection.
    pub async fn select_conversation(
        &self,
        conversation: &Conversation,
    ) -> MessengerResult<SelectedConversation> {
        let ticket = {
            let mut selection = self.inner.selection.lock();
            selection.ticket += 1;
            selection.ticket
        };

        let selected = self.inner.selector.select(conversation).await?;

        let activated = {
            let mut selection = self.inner.selection.lock();
            if selection.ticket == ticket {
                selection.active = Some(conversation.id.clone());
                true
            } else {
                false
            }
        };

        if activated {
            tracing::debug!(conversation_id = %conversation.id, "conversation selected");
            self.inner.signals.emit(SessionEvent::ConversationSelected {
                conversation_id: conversation.id.clone(),
            });
        } else {
            tracing::debug!(
                conversation_id = %conversation.id,
                "selection superseded before its fetch completed"
            );
        }

        Ok(selected)
    }

    pub async fn select_conversation_by_id(
        &self,
        conversation_id: &ConversationId,
    ) -> MessengerResult<SelectedConversation> {
        let Some(conversation) = self.conversation(conversation_id) else {
            return Err(MessengerError::UnknownConversation {
                stage: "select-conversation-by-id",
                conversation_id: conversation_id.to_string(),
            });
        };
        self.select_conversation(&conversation).await
    }

    pub fn active_conversation_id(&self) -> Option<ConversationId> {
        self.inner.selection.lock().active.clone()
    }

    pub fn active_conversation(&self) -> Option<Conversation> {
        let active = self.active_conversation_id()?;
        self.conversation(&active)
    }

    pub fn fetch_state(&self, conversation_id: &ConversationId) -> FetchState {
        self.inner.selector.fetch_state(conversation_id)
    }

    pub fn messages(&self, conversation_id: &ConversationId) -> Option<Vec<Message>> {
        self.inner.cache.get(conversation_id)
    }

    /// Starts a send as the current user. See [`SendCoordinator::begin`].
    pub fn begin_send(
        &self,
        conversation_id: &ConversationId,
        text: &str,
    ) -> MessengerResult<Option<PendingSend>> {
        self.inner
            .sender
            .begin(conversation_id, &self.inner.current_user, text)
    }

    pub async fn send_message(
        &self,
        conversation_id: &ConversationId,
        text: &str,
    ) -> MessengerResult<Option<MessageId>> {
        self.inner
            .sender
            .send(conversation_id, &self.inner.current_user, text)
            .await
    }

    /// Sends on behalf of another participant, e.g. when replaying a transcript.
    pub async fn send_message_as(
        &self,
        conversation_id: &ConversationId,
        sender: &Participant,
        text: &str,
    ) -> MessengerResult<Option<MessageId>> {
        self.inner.sender.send(conversation_id, sender, text).await
    }

    pub fn is_send_pending(&self, conversation_id: &ConversationId) -> bool {
        self.inner.sender.is_pending(conversation_id)
    }

    pub fn projection_context(&self, conversation_id: &ConversationId) -> ProjectionContext {
        ProjectionContext::from_settings(self.inner.current_user.id.clone(), &self.inner.settings)
            .with_pending_message(self.inner.sender.pending_message(conversation_id))
    }

    /// Timeline for `conversation_id`, recomputed from the current cache contents.
    pub fn projected_view(&self, conversation_id: &ConversationId) -> Vec<TimelineEntry> {
        let context = self.projection_context(conversation_id);
        self.inner
            .cache
            .with_messages(conversation_id, |messages| project(messages, &context))
            .unwrap_or_default()
    }

    pub fn active_view(&self) -> Vec<TimelineEntry> {
        self.active_conversation_id()
            .map(|conversation_id| self.projected_view(&conversation_id))
            .unwrap_or_default()
    }

    pub fn conversation_summaries(&self) -> Vec<ConversationSummary> {
        let (conversations, active) = {
            let selection = self.inner.selection.lock();
            (selection.conversations.clone(), selection.active.clone())
        };

        conversations
            .into_iter()
            .map(|conversation| {
                let last_message = self.inner.cache.last_message(&conversation.id);
                ConversationSummary {
                    title: conversation.display_title(&self.inner.current_user.id),
                    last_message_preview: last_message
                        .as_ref()
                        .map(|message| message.content.clone()),
                    last_activity: last_message.map(|message| message.timestamp),
                    active: active.as_ref() == Some(&conversation.id),
                    send_pending: self.inner.sender.is_pending(&conversation.id),
                    conversation_id: conversation.id,
                }
            })
            .collect()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let revision = self.revision();
        let active = self.active_conversation();

        let (active_conversation_id, active_title, timeline, input_disabled) = match active {
            Some(conversation) => (
                Some(conversation.id.clone()),
                Some(conversation.display_title(&self.inner.current_user.id)),
                self.projected_view(&conversation.id),
                self.is_send_pending(&conversation.id),
            ),
            None => (None, None, Vec::new(), true),
        };

        SessionSnapshot {
            revision,
            active_conversation_id,
            active_title,
            timeline,
            input_disabled,
            notices: self.notices(),
        }
    }

    pub fn notices(&self) -> Vec<Notice> {
        self.inner.signals.notices()
    }

    pub fn dismiss_notice(&self, notice_id: NoticeId) -> bool {
        self.inner.signals.dismiss(notice_id)
    }
}

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use snafu::ResultExt;

use parlor_gateway::{Gateway, GatewayResult};
use parlor_store::{Conversation, ConversationId, Message, SharedMessageCache};

use crate::error::{FetchSnafu, FetchTimedOutSnafu, MessengerResult};
use crate::events::{NoticeKind, SessionEvent, SessionSignals};

/// Fetch lifecycle of one conversation's messages within a session.
///
/// `Fetched` is terminal: nothing in a session invalidates a cached entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchState {
    Unfetched,
    Fetching,
    Fetched,
    FetchFailed,
}

/// A conversation together with its cached message history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedConversation {
    pub conversation: Conversation,
    pub messages: Vec<Message>,
    /// `true` when the messages came straight from the cache.
    pub from_cache: bool,
}

/// Read-through access to the message cache.
#[derive(Clone)]
pub struct ConversationSelector {
    cache: SharedMessageCache,
    gateway: Arc<dyn Gateway>,
    signals: Arc<SessionSignals>,
    fetch_timeout: Option<Duration>,
    fetches: Arc<Mutex<HashMap<ConversationId, FetchLedger>>>,
}

/// Fetches currently running for one conversation and how the last one ended.
#[derive(Debug, Default)]
struct FetchLedger {
    in_flight: usize,
    last_outcome: Option<FetchState>,
}

impl ConversationSelector {
    pub fn new(
        cache: SharedMessageCache,
        gateway: Arc<dyn Gateway>,
        signals: Arc<SessionSignals>,
        fetch_timeout: Option<Duration>,
    ) -> Self {
        Self {
            cache,
            gateway,
            signals,
            fetch_timeout,
            fetches: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns `conversation` with its messages, fetching them only on a cache miss.
    ///
    /// A hit completes on the first poll without touching the gateway. A failed fetch
    /// leaves the cache untouched and raises a dismissible notice.
    pub async fn select(
        &self,
        conversation: &Conversation,
    ) -> MessengerResult<SelectedConversation> {
        let conversation_id = &conversation.id;

        if let Some(messages) = self.cache.get(conversation_id) {
            tracing::debug!(
                conversation_id = %conversation_id,
                message_count = messages.len(),
                "message cache hit"
            );
            return Ok(SelectedConversation {
                conversation: conversation.clone(),
                messages,
                from_cache: true,
            });
        }

        tracing::debug!(conversation_id = %conversation_id, "message cache miss, fetching");
        let fetch_guard = FetchingGuard::start(&self.fetches, conversation_id);

        let fetched = bounded_fetch(
            self.fetch_timeout,
            "list_messages",
            "select-list-messages",
            self.gateway.list_messages(conversation_id),
        )
        .await;

        match fetched {
            Ok(messages) => {
                fetch_guard.finish(FetchState::Fetched);
                let messages = self.cache.insert_if_absent(conversation_id.clone(), messages);
                tracing::info!(
                    conversation_id = %conversation_id,
                    message_count = messages.len(),
                    "populated message cache"
                );
                self.signals.emit(SessionEvent::MessagesChanged {
                    conversation_id: conversation_id.clone(),
                });

                Ok(SelectedConversation {
                    conversation: conversation.clone(),
                    messages,
                    from_cache: false,
                })
            }
            Err(error) => {
                fetch_guard.finish(FetchState::FetchFailed);
                tracing::warn!(
                    conversation_id = %conversation_id,
                    %error,
                    "failed to fetch conversation messages"
                );
                self.signals.raise(
                    NoticeKind::FetchFailed {
                        conversation_id: Some(conversation_id.clone()),
                    },
                    format!("Could not load messages: {error}"),
                    error.is_retryable(),
                );
                Err(error)
            }
        }
    }

    pub fn fetch_state(&self, conversation_id: &ConversationId) -> FetchState {
        if self.cache.contains(conversation_id) {
            return FetchState::Fetched;
        }

        match self.fetches.lock().get(conversation_id) {
            Some(ledger) if ledger.in_flight > 0 => FetchState::Fetching,
            Some(ledger) => ledger.last_outcome.unwrap_or(FetchState::Unfetched),
            None => FetchState::Unfetched,
        }
    }
}

/// Counts one running fetch; the conversation reads as `Fetching` while any is alive.
///
/// A fetch dropped before it settles leaves the previous outcome in place.
struct FetchingGuard<'a> {
    fetches: &'a Mutex<HashMap<ConversationId, FetchLedger>>,
    conversation_id: &'a ConversationId,
    settled: bool,
}

impl<'a> FetchingGuard<'a> {
    fn start(
        fetches: &'a Mutex<HashMap<ConversationId, FetchLedger>>,
        conversation_id: &'a ConversationId,
    ) -> Self {
        fetches
            .lock()
            .entry(conversation_id.clone())
            .or_default()
            .in_flight += 1;
        Self {
            fetches,
            conversation_id,
            settled: false,
        }
    }

    fn finish(mut self, outcome: FetchState) {
        self.settled = true;
        self.leave(Some(outcome));
    }

    fn leave(&self, outcome: Option<FetchState>) {
        let mut fetches = self.fetches.lock();
        if let Some(ledger) = fetches.get_mut(self.conversation_id) {
            ledger.in_flight = ledger.in_flight.saturating_sub(1);
            if outcome.is_some() {
                ledger.last_outcome = outcome;
            }
        }
    }
}

impl Drop for FetchingGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.leave(None);
        }
    }
}

/// Awaits a gateway read, bounded by `timeout` when one is configured.
pub(crate) async fn bounded_fetch<T>(
    timeout: Option<Duration>,
    operation: &'static str,
    stage: &'static str,
    request: impl Future<Output = GatewayResult<T>>,
) -> MessengerResult<T> {
    let Some(timeout) = timeout else {
        return request.await.context(FetchSnafu { stage, operation });
    };

    match tokio::time::timeout(timeout, request).await {
        Ok(result) => result.context(FetchSnafu { stage, operation }),
        Err(_) => FetchTimedOutSnafu {
            stage,
            operation,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
        .fail(),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use parlor_gateway::MemoryGateway;
    use parlor_store::Participant;

    use super::*;
    use crate::error::MessengerError;

    fn conversation(id: &str) -> Conversation {
        Conversation::new(
            id,
            vec![Participant::new("u1", "Alice"), Participant::new("u2", "Bob")],
        )
    }

    fn seeded_gateway() -> Arc<MemoryGateway> {
        let gateway = Arc::new(MemoryGateway::new());
        let timestamp = Utc
            .with_ymd_and_hms(2024, 1, 1, 10, 0, 0)
            .single()
            .expect("valid fixture timestamp");
        gateway.insert_conversation(
            conversation("c1"),
            vec![Message::new("1", &Participant::new("u2", "Bob"), "hi", timestamp)],
        );
        gateway.insert_conversation(conversation("c2"), Vec::new());
        gateway
    }

    fn selector(gateway: Arc<MemoryGateway>, timeout: Option<Duration>) -> ConversationSelector {
        ConversationSelector::new(
            SharedMessageCache::new(),
            gateway,
            Arc::new(SessionSignals::new(16)),
            timeout,
        )
    }

    #[tokio::test]
    async fn revisiting_a_conversation_does_not_refetch() {
        let gateway = seeded_gateway();
        let selector = selector(gateway.clone(), None);

        let first = selector.select(&conversation("c1")).await.expect("select c1");
        selector.select(&conversation("c2")).await.expect("select c2");
        let again = selector.select(&conversation("c1")).await.expect("reselect c1");

        assert!(!first.from_cache);
        assert!(again.from_cache);
        assert_eq!(again.messages, first.messages);
        assert_eq!(gateway.list_messages_calls(&ConversationId::new("c1")), 1);
    }

    #[tokio::test]
    async fn empty_history_is_cached_as_fetched() {
        let gateway = seeded_gateway();
        let selector = selector(gateway.clone(), None);
        let conversation_id = ConversationId::new("c2");

        assert_eq!(selector.fetch_state(&conversation_id), FetchState::Unfetched);
        selector.select(&conversation("c2")).await.expect("select c2");
        selector.select(&conversation("c2")).await.expect("reselect c2");

        assert_eq!(selector.fetch_state(&conversation_id), FetchState::Fetched);
        assert_eq!(gateway.list_messages_calls(&conversation_id), 1);
    }

    #[tokio::test]
    async fn failed_fetch_leaves_cache_untouched_and_raises_notice() {
        let gateway = seeded_gateway();
        let conversation_id = ConversationId::new("c1");
        gateway.fail_list_messages(&conversation_id, true);
        let selector = selector(gateway.clone(), None);

        let error = selector
            .select(&conversation("c1"))
            .await
            .expect_err("scripted failure");

        assert!(matches!(error, MessengerError::Fetch { .. }));
        assert!(!selector.cache.contains(&conversation_id));
        assert_eq!(selector.fetch_state(&conversation_id), FetchState::FetchFailed);
        assert_eq!(selector.signals.notices().len(), 1);

        gateway.fail_list_messages(&conversation_id, false);
        selector.select(&conversation("c1")).await.expect("manual retry");
        assert_eq!(selector.fetch_state(&conversation_id), FetchState::Fetched);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_fetch_does_not_hide_one_still_running() {
        let gateway = seeded_gateway();
        let conversation_id = ConversationId::new("c1");
        gateway.delay_list_messages(&conversation_id, Duration::from_secs(2));
        let selector = selector(gateway.clone(), None);

        let spawn_select = || {
            let selector = selector.clone();
            tokio::spawn(async move { selector.select(&conversation("c1")).await })
        };
        let abandoned = spawn_select();
        let surviving = spawn_select();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(gateway.list_messages_calls(&conversation_id), 2);

        abandoned.abort();
        assert!(abandoned.await.expect_err("task was aborted").is_cancelled());
        assert_eq!(selector.fetch_state(&conversation_id), FetchState::Fetching);

        surviving
            .await
            .expect("join surviving select")
            .expect("surviving select");
        assert_eq!(selector.fetch_state(&conversation_id), FetchState::Fetched);
    }

    #[tokio::test(start_paused = true)]
    async fn sole_cancelled_fetch_returns_to_unfetched() {
        let gateway = seeded_gateway();
        let conversation_id = ConversationId::new("c1");
        gateway.delay_list_messages(&conversation_id, Duration::from_secs(2));
        let selector = selector(gateway, None);

        let pending = {
            let selector = selector.clone();
            tokio::spawn(async move { selector.select(&conversation("c1")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(selector.fetch_state(&conversation_id), FetchState::Fetching);

        pending.abort();
        let _ = pending.await;
        assert_eq!(selector.fetch_state(&conversation_id), FetchState::Unfetched);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_fetch_times_out() {
        let gateway = seeded_gateway();
        let conversation_id = ConversationId::new("c1");
        gateway.delay_list_messages(&conversation_id, Duration::from_secs(60));
        let selector = selector(gateway, Some(Duration::from_secs(5)));

        let error = selector
            .select(&conversation("c1"))
            .await
            .expect_err("fetch must time out");

        assert!(matches!(
            error,
            MessengerError::FetchTimedOut {
                timeout_ms: 5_000,
                ..
            }
        ));
        assert!(!selector.cache.contains(&conversation_id));
    }
}

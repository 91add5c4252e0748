use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use snafu::ResultExt;

use parlor_gateway::Gateway;
use parlor_store::{ConversationId, Message, MessageId, Participant, SharedMessageCache};

use crate::clock::Clock;
use crate::error::{InvalidStateSnafu, MessengerResult, SendSnafu, SendTimedOutSnafu};
use crate::events::{NoticeKind, SessionEvent, SessionSignals};

/// Runs optimistic sends: append locally first, confirm or roll back when the gateway answers.
///
/// At most one send is in flight per conversation. Conversations are independent.
#[derive(Clone)]
pub struct SendCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    cache: SharedMessageCache,
    gateway: Arc<dyn Gateway>,
    signals: Arc<SessionSignals>,
    clock: Arc<dyn Clock>,
    send_timeout: Option<Duration>,
    pending: Mutex<HashMap<ConversationId, MessageId>>,
}

impl SendCoordinator {
    pub fn new(
        cache: SharedMessageCache,
        gateway: Arc<dyn Gateway>,
        signals: Arc<SessionSignals>,
        clock: Arc<dyn Clock>,
        send_timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                cache,
                gateway,
                signals,
                clock,
                send_timeout,
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Performs the synchronous half of a send.
    ///
    /// Returns `Ok(None)` without side effects when `text` is blank or a send is already
    /// pending for the conversation. Otherwise the optimistic message is already the cache
    /// tail and the conversation is marked pending when this returns.
    pub fn begin(
        &self,
        conversation_id: &ConversationId,
        sender: &Participant,
        text: &str,
    ) -> MessengerResult<Option<PendingSend>> {
        let content = text.trim();
        if content.is_empty() {
            tracing::debug!(conversation_id = %conversation_id, "ignoring blank message");
            return Ok(None);
        }

        let message = Message::outgoing(sender, content, self.inner.clock.now());

        {
            let mut pending = self.inner.pending.lock();
            if let Some(in_flight) = pending.get(conversation_id) {
                tracing::debug!(
                    conversation_id = %conversation_id,
                    in_flight = %in_flight,
                    "send already pending, ignoring"
                );
                return Ok(None);
            }

            // Gate check and append happen under one lock so concurrent callers cannot both pass.
            if let Err(error) = self
                .inner
                .cache
                .append(conversation_id, message.clone())
                .context(InvalidStateSnafu {
                    stage: "send-append-optimistic",
                })
            {
                tracing::error!(
                    conversation_id = %conversation_id,
                    %error,
                    "send attempted on a conversation without cached messages"
                );
                return Err(error);
            }

            pending.insert(conversation_id.clone(), message.id.clone());
        }

        tracing::info!(
            conversation_id = %conversation_id,
            message_id = %message.id,
            "appended optimistic message"
        );
        self.inner.signals.emit(SessionEvent::SendStateChanged {
            conversation_id: conversation_id.clone(),
            pending: true,
        });
        self.inner.signals.emit(SessionEvent::MessagesChanged {
            conversation_id: conversation_id.clone(),
        });

        Ok(Some(PendingSend {
            coordinator: self.clone(),
            conversation_id: conversation_id.clone(),
            message,
            unsent_text: text.to_string(),
            settled: false,
        }))
    }

    /// `begin` followed by `dispatch`. Returns the id of the delivered message.
    pub async fn send(
        &self,
        conversation_id: &ConversationId,
        sender: &Participant,
        text: &str,
    ) -> MessengerResult<Option<MessageId>> {
        match self.begin(conversation_id, sender, text)? {
            Some(pending_send) => pending_send.dispatch().await.map(Some),
            None => Ok(None),
        }
    }

    pub fn is_pending(&self, conversation_id: &ConversationId) -> bool {
        self.inner.pending.lock().contains_key(conversation_id)
    }

    pub fn pending_message(&self, conversation_id: &ConversationId) -> Option<MessageId> {
        self.inner.pending.lock().get(conversation_id).cloned()
    }

    fn clear_pending(&self, conversation_id: &ConversationId, message_id: &MessageId) {
        let cleared = {
            let mut pending = self.inner.pending.lock();
            if pending.get(conversation_id) == Some(message_id) {
                pending.remove(conversation_id);
                true
            } else {
                false
            }
        };

        if cleared {
            self.inner.signals.emit(SessionEvent::SendStateChanged {
                conversation_id: conversation_id.clone(),
                pending: false,
            });
        }
    }
}

/// A send whose optimistic message is in the cache but not yet confirmed.
///
/// Dropping it before `dispatch` completes rolls the optimistic message back.
#[must_use = "an undispatched send is rolled back when dropped"]
pub struct PendingSend {
    coordinator: SendCoordinator,
    conversation_id: ConversationId,
    message: Message,
    unsent_text: String,
    settled: bool,
}

impl PendingSend {
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Hands the message to the gateway and settles the optimistic state.
    ///
    /// On success the local message stays as-is. On rejection or timeout it is removed,
    /// leaving the cached list equal to what it was before `begin`.
    pub async fn dispatch(mut self) -> MessengerResult<MessageId> {
        let gateway = Arc::clone(&self.coordinator.inner.gateway);
        let send_timeout = self.coordinator.inner.send_timeout;
        let request = gateway.send_message(&self.conversation_id, &self.message);

        let outcome = match send_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, request).await {
                Ok(result) => result.context(SendSnafu {
                    stage: "dispatch-send-message",
                    conversation_id: self.conversation_id.to_string(),
                }),
                Err(_) => SendTimedOutSnafu {
                    stage: "dispatch-send-timeout",
                    conversation_id: self.conversation_id.to_string(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                }
                .fail(),
            },
            None => request.await.context(SendSnafu {
                stage: "dispatch-send-message",
                conversation_id: self.conversation_id.to_string(),
            }),
        };

        match outcome {
            Ok(()) => {
                self.settled = true;
                self.coordinator
                    .clear_pending(&self.conversation_id, &self.message.id);
                tracing::info!(
                    conversation_id = %self.conversation_id,
                    message_id = %self.message.id,
                    "send confirmed"
                );
                Ok(self.message.id.clone())
            }
            Err(error) => {
                tracing::warn!(
                    conversation_id = %self.conversation_id,
                    message_id = %self.message.id,
                    %error,
                    "send failed, rolling back"
                );
                self.roll_back();
                self.coordinator.inner.signals.raise(
                    NoticeKind::SendFailed {
                        conversation_id: self.conversation_id.clone(),
                        unsent_text: self.unsent_text.clone(),
                    },
                    format!("Message not sent: {error}"),
                    error.is_retryable(),
                );
                Err(error)
            }
        }
    }

    fn roll_back(&mut self) {
        self.settled = true;
        let inner = &self.coordinator.inner;

        if inner.cache.remove(&self.conversation_id, &self.message.id) {
            inner.signals.emit(SessionEvent::MessagesChanged {
                conversation_id: self.conversation_id.clone(),
            });
        }
        self.coordinator
            .clear_pending(&self.conversation_id, &self.message.id);
    }
}

impl Drop for PendingSend {
    fn drop(&mut self) {
        if !self.settled {
            tracing::info!(
                conversation_id = %self.conversation_id,
                message_id = %self.message.id,
                "send abandoned before completion, rolling back"
            );
            self.roll_back();
        }
    }
}

impl std::fmt::Debug for PendingSend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingSend")
            .field("conversation_id", &self.conversation_id)
            .field("message_id", &self.message.id)
            .field("settled", &self.settled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use futures::FutureExt;
    use pretty_assertions::assert_eq;

    use parlor_gateway::MemoryGateway;
    use parlor_store::Conversation;

    use super::*;
    use crate::clock::ManualClock;
    use crate::error::MessengerError;

    struct Harness {
        gateway: Arc<MemoryGateway>,
        cache: SharedMessageCache,
        signals: Arc<SessionSignals>,
        coordinator: SendCoordinator,
    }

    fn alice() -> Participant {
        Participant::new("u1", "Alice")
    }

    fn c1() -> ConversationId {
        ConversationId::new("c1")
    }

    fn c2() -> ConversationId {
        ConversationId::new("c2")
    }

    fn harness(send_timeout: Option<Duration>) -> Harness {
        let start = Utc
            .with_ymd_and_hms(2024, 1, 1, 12, 0, 0)
            .single()
            .expect("valid fixture timestamp");
        let bob = Participant::new("u2", "Bob");
        let history = vec![Message::new("1", &bob, "hello", start)];

        let gateway = Arc::new(MemoryGateway::new());
        let carol = Participant::new("u3", "Carol");
        gateway.insert_conversation(Conversation::new("c1", vec![alice(), bob]), history.clone());
        gateway.insert_conversation(Conversation::new("c2", vec![alice(), carol]), Vec::new());

        let cache = SharedMessageCache::new();
        cache.set(c1(), history);
        cache.set(c2(), Vec::new());
        let signals = Arc::new(SessionSignals::new(32));
        let coordinator = SendCoordinator::new(
            cache.clone(),
            gateway.clone(),
            signals.clone(),
            Arc::new(ManualClock::new(start)),
            send_timeout,
        );

        Harness {
            gateway,
            cache,
            signals,
            coordinator,
        }
    }

    #[test]
    fn begin_appends_before_any_await() {
        let harness = harness(None);

        let pending_send = harness
            .coordinator
            .begin(&c1(), &alice(), "  hi  ")
            .expect("begin send")
            .expect("send accepted");

        let tail = harness.cache.last_message(&c1()).expect("cached tail");
        assert_eq!(&tail, pending_send.message());
        assert_eq!(tail.content, "hi");
        assert!(tail.id.is_local());
        assert!(harness.coordinator.is_pending(&c1()));
        assert_eq!(
            harness.coordinator.pending_message(&c1()),
            Some(tail.id.clone())
        );
    }

    #[tokio::test]
    async fn confirmed_send_keeps_the_local_message() {
        let harness = harness(None);

        let message_id = harness
            .coordinator
            .send(&c1(), &alice(), "hi")
            .await
            .expect("send succeeds")
            .expect("send accepted");

        assert!(message_id.is_local());
        assert_eq!(
            harness.cache.last_message(&c1()).map(|message| message.id),
            Some(message_id)
        );
        assert!(!harness.coordinator.is_pending(&c1()));
        assert_eq!(harness.gateway.delivered_messages(&c1()).len(), 2);
    }

    #[tokio::test]
    async fn rejected_send_restores_the_previous_list() {
        let harness = harness(None);
        let before = harness.cache.get(&c1()).expect("cached history");
        harness.gateway.fail_next_send();

        let error = harness
            .coordinator
            .send(&c1(), &alice(), "hi")
            .await
            .expect_err("scripted rejection");

        assert!(matches!(error, MessengerError::Send { .. }));
        assert_eq!(harness.cache.get(&c1()), Some(before));
        assert!(!harness.coordinator.is_pending(&c1()));

        let notices = harness.signals.notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(
            notices[0].kind,
            NoticeKind::SendFailed {
                conversation_id: c1(),
                unsent_text: "hi".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn second_send_is_ignored_while_one_is_pending() {
        let harness = harness(None);
        harness.gateway.pause_sends();

        let first = harness
            .coordinator
            .begin(&c1(), &alice(), "first")
            .expect("begin first")
            .expect("first accepted");
        let second = harness
            .coordinator
            .begin(&c1(), &alice(), "second")
            .expect("begin second");

        assert!(second.is_none());
        assert_eq!(harness.cache.message_count(&c1()), Some(2));

        let dispatch = tokio::spawn(first.dispatch());
        tokio::task::yield_now().await;
        harness.gateway.resume_sends();
        dispatch
            .await
            .expect("dispatch task")
            .expect("first send succeeds");

        assert!(!harness.coordinator.is_pending(&c1()));
        assert!(
            harness
                .coordinator
                .begin(&c1(), &alice(), "third")
                .expect("begin third")
                .is_some()
        );
    }

    #[tokio::test]
    async fn pending_send_does_not_block_other_conversations() {
        let harness = harness(None);
        harness.gateway.pause_sends();

        let in_c1 = harness
            .coordinator
            .begin(&c1(), &alice(), "for bob")
            .expect("begin c1")
            .expect("c1 accepted");
        let in_c2 = harness
            .coordinator
            .begin(&c2(), &alice(), "for carol")
            .expect("begin c2")
            .expect("c2 accepted while c1 is pending");
        assert!(harness.coordinator.is_pending(&c1()));
        assert!(harness.coordinator.is_pending(&c2()));
        let c1_id = in_c1.message().id.clone();
        let c2_id = in_c2.message().id.clone();

        let first = tokio::spawn(in_c1.dispatch());
        let second = tokio::spawn(in_c2.dispatch());
        tokio::task::yield_now().await;
        harness.gateway.resume_sends();

        assert_eq!(first.await.expect("join c1").expect("c1 confirmed"), c1_id);
        assert_eq!(second.await.expect("join c2").expect("c2 confirmed"), c2_id);
        assert!(!harness.coordinator.is_pending(&c1()));
        assert!(!harness.coordinator.is_pending(&c2()));
        assert_eq!(
            harness.cache.last_message(&c1()).map(|message| message.id),
            Some(c1_id)
        );
        assert_eq!(
            harness.cache.get(&c2()).map(|messages| messages.len()),
            Some(1)
        );
        assert_eq!(harness.gateway.delivered_messages(&c2()).len(), 1);
    }

    #[test]
    fn rolling_back_one_conversation_leaves_another_pending() {
        let harness = harness(None);
        harness.gateway.pause_sends();

        let in_c1 = harness
            .coordinator
            .begin(&c1(), &alice(), "keep me")
            .expect("begin c1")
            .expect("c1 accepted");
        let in_c2 = harness
            .coordinator
            .begin(&c2(), &alice(), "drop me")
            .expect("begin c2")
            .expect("c2 accepted");
        drop(in_c2);

        assert_eq!(harness.cache.get(&c2()), Some(Vec::new()));
        assert!(!harness.coordinator.is_pending(&c2()));
        assert!(harness.coordinator.is_pending(&c1()));
        assert_eq!(
            harness.cache.last_message(&c1()).as_ref(),
            Some(in_c1.message())
        );
    }

    #[test]
    fn blank_text_is_a_no_op() {
        let harness = harness(None);
        let revision = harness.signals.revision();

        let result = harness
            .coordinator
            .begin(&c1(), &alice(), " \n\t ")
            .expect("begin blank");

        assert!(result.is_none());
        assert_eq!(harness.cache.message_count(&c1()), Some(1));
        assert_eq!(harness.signals.revision(), revision);
    }

    #[test]
    fn send_without_cached_entry_is_an_invalid_state() {
        let harness = harness(None);

        let error = harness
            .coordinator
            .begin(&ConversationId::new("missing"), &alice(), "hi")
            .expect_err("no cache entry");

        assert!(matches!(error, MessengerError::InvalidState { .. }));
        assert!(!harness.coordinator.is_pending(&ConversationId::new("missing")));
    }

    #[test]
    fn dropping_an_undispatched_send_rolls_back() {
        let harness = harness(None);
        let before = harness.cache.get(&c1()).expect("cached history");

        let pending_send = harness
            .coordinator
            .begin(&c1(), &alice(), "hi")
            .expect("begin send")
            .expect("send accepted");
        drop(pending_send);

        assert_eq!(harness.cache.get(&c1()), Some(before));
        assert!(!harness.coordinator.is_pending(&c1()));
        assert!(harness.signals.notices().is_empty());
    }

    #[test]
    fn cancelling_an_in_flight_dispatch_rolls_back() {
        let harness = harness(None);
        harness.gateway.pause_sends();
        let before = harness.cache.get(&c1()).expect("cached history");

        let pending_send = harness
            .coordinator
            .begin(&c1(), &alice(), "hi")
            .expect("begin send")
            .expect("send accepted");
        let mut dispatch = Box::pin(pending_send.dispatch());
        assert!(dispatch.as_mut().now_or_never().is_none());
        drop(dispatch);

        assert_eq!(harness.cache.get(&c1()), Some(before));
        assert!(!harness.coordinator.is_pending(&c1()));
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_send_rolls_back() {
        let harness = harness(Some(Duration::from_secs(3)));
        harness.gateway.pause_sends();
        let before = harness.cache.get(&c1()).expect("cached history");

        let error = harness
            .coordinator
            .send(&c1(), &alice(), "hi")
            .await
            .expect_err("send must time out");

        assert!(matches!(
            error,
            MessengerError::SendTimedOut {
                timeout_ms: 3_000,
                ..
            }
        ));
        assert_eq!(harness.cache.get(&c1()), Some(before));
        assert!(!harness.coordinator.is_pending(&c1()));
    }
}

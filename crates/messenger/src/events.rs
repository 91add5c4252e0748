use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::broadcast;

use parlor_store::ConversationId;

/// Emitted after every mutation the view may need to re-render for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    ConversationsLoaded { count: usize },
    ConversationSelected { conversation_id: ConversationId },
    /// The cached message list of a conversation changed (populate, append or rollback).
    MessagesChanged { conversation_id: ConversationId },
    /// A send started or settled; `pending` gates the input control.
    SendStateChanged {
        conversation_id: ConversationId,
        pending: bool,
    },
    NoticeRaised { notice_id: NoticeId },
    NoticeDismissed { notice_id: NoticeId },
}

/// Identifier of one dismissible notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NoticeId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoticeKind {
    FetchFailed {
        conversation_id: Option<ConversationId>,
    },
    /// The optimistic message was rolled back; `unsent_text` is what the user typed.
    SendFailed {
        conversation_id: ConversationId,
        unsent_text: String,
    },
}

/// User-visible, non-fatal failure report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub id: NoticeId,
    pub kind: NoticeKind,
    pub message: String,
    pub retryable: bool,
}

/// Change feed, revision counter and notice board shared by one session's components.
#[derive(Debug)]
pub struct SessionSignals {
    events: broadcast::Sender<SessionEvent>,
    revision: AtomicU64,
    notices: Mutex<NoticeBoard>,
}

#[derive(Debug, Default)]
struct NoticeBoard {
    next_id: u64,
    visible: Vec<Notice>,
}

impl SessionSignals {
    pub fn new(buffer: usize) -> Self {
        let (events, _) = broadcast::channel(buffer.max(1));
        Self {
            events,
            revision: AtomicU64::new(0),
            notices: Mutex::new(NoticeBoard::default()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Monotonic counter bumped on every emitted event, for polling views.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    pub fn emit(&self, event: SessionEvent) {
        self.revision.fetch_add(1, Ordering::AcqRel);
        // No subscribers is fine: polling views read the revision instead.
        let _ = self.events.send(event);
    }

    pub fn raise(&self, kind: NoticeKind, message: impl Into<String>, retryable: bool) -> NoticeId {
        let notice_id = {
            let mut board = self.notices.lock();
            board.next_id = board.next_id.saturating_add(1);
            let notice_id = NoticeId(board.next_id);
            board.visible.push(Notice {
                id: notice_id,
                kind,
                message: message.into(),
                retryable,
            });
            notice_id
        };

        self.emit(SessionEvent::NoticeRaised { notice_id });
        notice_id
    }

    /// Returns `false` when the notice was already dismissed.
    pub fn dismiss(&self, notice_id: NoticeId) -> bool {
        let removed = {
            let mut board = self.notices.lock();
            let before = board.visible.len();
            board.visible.retain(|notice| notice.id != notice_id);
            board.visible.len() != before
        };

        if removed {
            self.emit(SessionEvent::NoticeDismissed { notice_id });
        }
        removed
    }

    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().visible.clone()
    }
}

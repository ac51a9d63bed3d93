use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use lectern_proto::JsonObject;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

const TEACHER_CLIENT_ID: &str = "teacher";
const TEACHER_EMAIL: &str = "Teacher Dashboard";
const DEFAULT_STUDENT_EMAIL: &str = "N/A";

/// Role a session settles into after its first identifying frame. The
/// transition out of `Unassigned` happens at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Unassigned,
    Student,
    Teacher,
}

/// Outcome of a non-blocking outbox insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Sent,
    /// Outbox at capacity; the frame was dropped, the session stays up.
    Full,
    /// Outbox already closed; the session is on its way out.
    Closed,
}

#[derive(Debug)]
struct Identity {
    role: Role,
    client_id: Option<String>,
    email: String,
}

/// One websocket connection's shared state. Producers on any task enqueue
/// frames without blocking; the connection's writer task owns the receiving
/// half and is the only code that touches the socket.
pub struct Session {
    connection_id: Uuid,
    identity: RwLock<Identity>,
    last_active: AtomicU64,
    tabs: RwLock<JsonObject>,
    outbox: Mutex<Option<mpsc::Sender<String>>>,
    closed: watch::Sender<bool>,
}

impl Session {
    /// Creates a session plus the receiving half of its outbox. The receiver
    /// goes to the writer task; everyone else holds the `Arc`.
    pub fn new(outbox_capacity: usize) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(outbox_capacity);
        let (closed, _) = watch::channel(false);
        let session = Arc::new(Self {
            connection_id: Uuid::new_v4(),
            identity: RwLock::new(Identity {
                role: Role::Unassigned,
                client_id: None,
                email: String::new(),
            }),
            last_active: AtomicU64::new(now_millis()),
            tabs: RwLock::new(JsonObject::new()),
            outbox: Mutex::new(Some(tx)),
            closed,
        });
        (session, rx)
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Settles the session as a student. Returns false (and changes nothing)
    /// if an identity was already assigned.
    pub fn assign_student(&self, client_id: String, email: Option<String>) -> bool {
        let mut identity = self.identity.write();
        if identity.role != Role::Unassigned {
            return false;
        }
        identity.role = Role::Student;
        identity.client_id = Some(client_id);
        identity.email = email.unwrap_or_else(|| DEFAULT_STUDENT_EMAIL.to_string());
        true
    }

    /// Settles the session as the teacher dashboard.
    pub fn assign_teacher(&self) -> bool {
        let mut identity = self.identity.write();
        if identity.role != Role::Unassigned {
            return false;
        }
        identity.role = Role::Teacher;
        identity.client_id = Some(TEACHER_CLIENT_ID.to_string());
        identity.email = TEACHER_EMAIL.to_string();
        true
    }

    pub fn role(&self) -> Role {
        self.identity.read().role
    }

    pub fn client_id(&self) -> Option<String> {
        self.identity.read().client_id.clone()
    }

    pub fn email(&self) -> String {
        self.identity.read().email.clone()
    }

    /// Non-blocking enqueue onto the session's outbox. A full outbox drops
    /// the new frame, never an already queued one.
    pub fn enqueue(&self, frame: String) -> EnqueueOutcome {
        let guard = self.outbox.lock();
        let Some(tx) = guard.as_ref() else {
            return EnqueueOutcome::Closed;
        };
        match tx.try_send(frame) {
            Ok(()) => EnqueueOutcome::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => EnqueueOutcome::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => EnqueueOutcome::Closed,
        }
    }

    /// Closes the outbox: queued frames still drain, then the writer sees the
    /// channel end. Safe to call more than once.
    pub fn close_outbox(&self) {
        self.outbox.lock().take();
        self.closed.send_replace(true);
    }

    /// Watchable closed flag; the reader task selects on this so a writer-side
    /// teardown stops the reader promptly.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Stamps the session as active now.
    pub fn touch(&self) {
        self.last_active.store(now_millis(), Ordering::Relaxed);
    }

    pub fn last_active_ms(&self) -> u64 {
        self.last_active.load(Ordering::Relaxed)
    }

    /// Replaces the retained tab snapshot wholesale.
    pub fn set_tabs(&self, tabs: JsonObject) {
        *self.tabs.write() = tabs;
    }

    pub fn tabs(&self) -> JsonObject {
        self.tabs.read().clone()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("connection_id", &self.connection_id)
            .field("role", &self.role())
            .field("client_id", &self.client_id())
            .finish()
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbox_drops_newest_when_full() {
        let (session, mut rx) = Session::new(2);
        assert_eq!(session.enqueue("a".into()), EnqueueOutcome::Sent);
        assert_eq!(session.enqueue("b".into()), EnqueueOutcome::Sent);
        assert_eq!(session.enqueue("c".into()), EnqueueOutcome::Full);
        assert_eq!(rx.try_recv().unwrap(), "a");
        assert_eq!(rx.try_recv().unwrap(), "b");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn close_drains_queued_frames_then_disconnects() {
        let (session, mut rx) = Session::new(4);
        assert_eq!(session.enqueue("queued".into()), EnqueueOutcome::Sent);
        session.close_outbox();
        session.close_outbox();
        assert_eq!(session.enqueue("late".into()), EnqueueOutcome::Closed);
        assert!(session.is_closed());
        assert_eq!(rx.try_recv().unwrap(), "queued");
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn identity_settles_once() {
        let (session, _rx) = Session::new(1);
        assert_eq!(session.role(), Role::Unassigned);
        assert!(session.assign_student("s-1".into(), None));
        assert_eq!(session.role(), Role::Student);
        assert_eq!(session.client_id().as_deref(), Some("s-1"));
        assert_eq!(session.email(), "N/A");
        assert!(!session.assign_teacher());
        assert!(!session.assign_student("s-2".into(), Some("late@school.edu".into())));
        assert_eq!(session.client_id().as_deref(), Some("s-1"));
    }

    #[test]
    fn teacher_identity_uses_fixed_labels() {
        let (session, _rx) = Session::new(1);
        assert!(session.assign_teacher());
        assert_eq!(session.role(), Role::Teacher);
        assert_eq!(session.client_id().as_deref(), Some("teacher"));
        assert_eq!(session.email(), "Teacher Dashboard");
    }

    #[test]
    fn tabs_snapshot_replaces_wholesale() {
        let (session, _rx) = Session::new(1);
        let mut first = JsonObject::new();
        first.insert("1".into(), serde_json::json!({"url": "https://a.example"}));
        session.set_tabs(first);
        let mut second = JsonObject::new();
        second.insert("2".into(), serde_json::json!({"url": "https://b.example"}));
        session.set_tabs(second.clone());
        assert_eq!(session.tabs(), second);
    }

    #[test]
    fn touch_advances_last_active() {
        let (session, _rx) = Session::new(1);
        let before = session.last_active_ms();
        session.touch();
        assert!(session.last_active_ms() >= before);
    }
}

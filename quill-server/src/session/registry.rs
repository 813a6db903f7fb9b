//! Session registry and task-event fan-out.
//!
//! Each live WebSocket session registers an outbound queue here.  The task
//! manager delivers events through the [`EventSink`] implementation, which
//! serializes them onto the owning session's queue.  Non-terminal events may
//! be dropped when a session's queue is full; terminal events that cannot be
//! enqueued close the session instead.

use dashmap::DashMap;
use quill_core::{EventSink, TaskEvent};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::ServerMessage;

pub struct SessionHandle {
    pub outbound: mpsc::Sender<ServerMessage>,
    pub cancel: CancellationToken,
}

pub struct SessionRegistry {
    sessions: DashMap<String, SessionHandle>,
    max_connections: usize,
}

impl SessionRegistry {
    pub fn new(max_connections: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            max_connections,
        }
    }

    /// Register a new session; refuses once the connection cap is reached.
    pub fn register(&self, connection_id: &str, handle: SessionHandle) -> bool {
        if self.sessions.len() >= self.max_connections {
            return false;
        }
        self.sessions.insert(connection_id.to_owned(), handle);
        true
    }

    pub fn remove(&self, connection_id: &str) {
        self.sessions.remove(connection_id);
        debug!(connection_id, "session removed");
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Close every live session (process shutdown).
    pub fn close_all(&self) {
        for entry in self.sessions.iter() {
            entry.cancel.cancel();
        }
    }
}

impl EventSink for SessionRegistry {
    fn deliver(&self, session_id: &str, event: &TaskEvent) {
        let Some(handle) = self.sessions.get(session_id) else {
            // Session went away; the task manager prunes it on disconnect,
            // but events already in flight can still land here.
            return;
        };
        let message = ServerMessage::from_event(event);
        match handle.outbound.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) if !event.is_terminal() => {
                warn!(
                    session_id,
                    task_id = event.task_id(),
                    "outbound queue full; dropping non-terminal event"
                );
            }
            Err(_) => {
                // Terminal events are never dropped: a session that cannot
                // take them is closed.
                warn!(
                    session_id,
                    task_id = event.task_id(),
                    "cannot deliver terminal event; closing session"
                );
                handle.cancel.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::TaskStatus;

    fn handle(capacity: usize) -> (SessionHandle, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            SessionHandle {
                outbound: tx,
                cancel: CancellationToken::new(),
            },
            rx,
        )
    }

    fn progress(task_id: &str) -> TaskEvent {
        TaskEvent::Progress {
            task_id: task_id.into(),
            progress: 0.0,
            status: TaskStatus::Processing,
            message: "working".into(),
        }
    }

    fn completed(task_id: &str) -> TaskEvent {
        TaskEvent::Completed {
            task_id: task_id.into(),
            payload: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn delivers_to_registered_session() {
        let registry = SessionRegistry::new(10);
        let (handle, mut rx) = handle(4);
        assert!(registry.register("s1", handle));

        registry.deliver("s1", &progress("t1"));
        let frame = rx.recv().await.unwrap();
        assert!(matches!(frame, ServerMessage::TaskProgress { .. }));
    }

    #[tokio::test]
    async fn full_queue_drops_progress_but_not_completion() {
        let registry = SessionRegistry::new(10);
        let (handle, mut rx) = handle(1);
        let cancel = handle.cancel.clone();
        registry.register("s1", handle);

        registry.deliver("s1", &progress("t1")); // fills the queue
        registry.deliver("s1", &progress("t1")); // dropped silently
        assert!(!cancel.is_cancelled());

        registry.deliver("s1", &completed("t1")); // undeliverable terminal
        assert!(cancel.is_cancelled(), "session should close");

        // Only the first event made it through.
        assert!(matches!(rx.try_recv(), Ok(ServerMessage::TaskProgress { .. })));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn connection_cap_refuses_registration() {
        let registry = SessionRegistry::new(1);
        let (h1, _rx1) = handle(1);
        let (h2, _rx2) = handle(1);
        assert!(registry.register("s1", h1));
        assert!(!registry.register("s2", h2));
        registry.remove("s1");
        let (h3, _rx3) = handle(1);
        assert!(registry.register("s3", h3));
    }

    #[test]
    fn deliver_to_unknown_session_is_a_no_op() {
        let registry = SessionRegistry::new(10);
        registry.deliver("ghost", &progress("t1"));
    }
}

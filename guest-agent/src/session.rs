//! Session registry.
//!
//! One session per accepted connection. The registry is the only state
//! shared between connection tasks; the lock is held only for map access,
//! never across I/O.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tokio::sync::Mutex;

/// Terminal state of a session. Set exactly once: Running transitions to
/// Exited or Failed and is never reversed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Running,
    Exited(i32),
    Failed(String),
}

#[derive(Debug)]
pub struct Session {
    pub id: u64,
    pub pid: Option<u32>,
    pub tty: bool,
    pub started_at: Instant,
    pub state: SessionState,
}

#[derive(Default)]
pub struct SessionRegistry {
    next_id: AtomicU64,
    sessions: Mutex<HashMap<u64, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly spawned session and return its id.
    pub async fn register(&self, pid: Option<u32>, tty: bool) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut sessions = self.sessions.lock().await;
        sessions.insert(
            id,
            Session {
                id,
                pid,
                tty,
                started_at: Instant::now(),
                state: SessionState::Running,
            },
        );
        id
    }

    /// Record a normal exit. Ignored if the session is already terminal.
    pub async fn finish(&self, id: u64, code: i32) {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get_mut(&id) {
            if session.state == SessionState::Running {
                session.state = SessionState::Exited(code);
            }
        }
    }

    /// Record a failure (spawn error, dropped connection). Ignored if the
    /// session is already terminal.
    pub async fn fail(&self, id: u64, reason: &str) {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get_mut(&id) {
            if session.state == SessionState::Running {
                session.state = SessionState::Failed(reason.to_string());
            }
        }
    }

    /// Drop a session after its outcome has been delivered (or the
    /// connection is gone).
    pub async fn remove(&self, id: u64) -> Option<Session> {
        self.sessions.lock().await.remove(&id)
    }

    /// Number of sessions currently tracked.
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Number of sessions still in the Running state.
    pub async fn running(&self) -> usize {
        self.sessions
            .lock()
            .await
            .values()
            .filter(|s| s.state == SessionState::Running)
            .count()
    }
}

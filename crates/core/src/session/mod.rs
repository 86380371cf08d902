//! Client-side RTSP session tracking (RFC 2326 §3, §12.37).
//!
//! A session is created by the server during SETUP and identified by the
//! `Session` header of the SETUP response. The client records:
//!
//! - The opaque session ID, echoed on every later request for the session.
//! - The timeout (default 60s, RFC 2326 §12.37). Some request must reach
//!   the server before it expires, which is what keep-alives are for.
//! - The transport contexts bound to it, one per SETUP that answered with
//!   this ID (aggregate control shares one session across streams).
//!
//! ## Session lifecycle
//!
//! ```text
//! SETUP response, unseen id   -> registered
//! SETUP response, known id    -> context bound to existing session
//! TEARDOWN / server TEARDOWN  -> contexts closed, then removed
//! idle longer than timeout    -> contexts closed, then removed
//! ```

pub mod transport;

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::transport::TransportContext;
pub use transport::TransportHeader;

/// Default session timeout in seconds (RFC 2326 §12.37).
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 60;

/// A server-assigned RTSP session.
///
/// Interior mutability via `RwLock` allows shared references across the
/// caller and the keep-alive worker.
#[derive(Debug)]
pub struct Session {
    /// Opaque session identifier from the `Session` header.
    pub id: String,
    /// Location SETUP was sent to when the session was created.
    pub control: String,
    pub created: Instant,
    timeout: RwLock<Duration>,
    contexts: RwLock<Vec<Arc<TransportContext>>>,
    keep_alive: AtomicBool,
    last_activity: RwLock<Instant>,
}

impl Session {
    pub fn new(id: &str, control: &str, timeout: Duration, keep_alive: bool) -> Self {
        let now = Instant::now();
        Session {
            id: id.to_string(),
            control: control.to_string(),
            created: now,
            timeout: RwLock::new(timeout),
            contexts: RwLock::new(Vec::new()),
            keep_alive: AtomicBool::new(keep_alive),
            last_activity: RwLock::new(now),
        }
    }

    pub fn timeout(&self) -> Duration {
        *self.timeout.read()
    }

    pub fn set_timeout(&self, timeout: Duration) {
        tracing::debug!(session_id = %self.id, timeout_secs = timeout.as_secs(), "session timeout updated");
        *self.timeout.write() = timeout;
    }

    pub fn keep_alive_enabled(&self) -> bool {
        self.keep_alive.load(Ordering::SeqCst)
    }

    pub fn set_keep_alive(&self, enabled: bool) {
        self.keep_alive.store(enabled, Ordering::SeqCst);
    }

    /// Bind a transport context created by SETUP.
    pub fn bind(&self, context: Arc<TransportContext>) {
        tracing::debug!(session_id = %self.id, control = %context.control, "transport bound");
        self.contexts.write().push(context);
    }

    /// Forget a context replaced by a later SETUP of the same stream.
    pub fn unbind(&self, context: &Arc<TransportContext>) -> bool {
        let mut contexts = self.contexts.write();
        let before = contexts.len();
        contexts.retain(|c| !Arc::ptr_eq(c, context));
        contexts.len() != before
    }

    pub fn contexts(&self) -> Vec<Arc<TransportContext>> {
        self.contexts.read().clone()
    }

    /// Record that the server answered a request for this session.
    pub fn touch(&self) {
        *self.last_activity.write() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.read().elapsed()
    }

    pub fn is_expired(&self) -> bool {
        self.idle_for() > self.timeout()
    }

    fn close_contexts(&self) {
        for context in self.contexts.write().drain(..) {
            context.close();
        }
    }
}

/// Thread-safe registry of the sessions this client holds.
///
/// Backed by `parking_lot::RwLock`; lookups happen on every request that
/// carries a `Session` header.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the session with `id`, creating it if unseen. The flag is
    /// true when the session was created by this call.
    pub fn register(
        &self,
        id: &str,
        control: &str,
        timeout: Duration,
        keep_alive: bool,
    ) -> (Arc<Session>, bool) {
        let mut sessions = self.sessions.write();
        if let Some(existing) = sessions.get(id) {
            return (existing.clone(), false);
        }
        let session = Arc::new(Session::new(id, control, timeout, keep_alive));
        sessions.insert(id.to_string(), session.clone());
        tracing::info!(session_id = %id, control, total_sessions = sessions.len(), "session created");
        (session, true)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    pub fn all(&self) -> Vec<Arc<Session>> {
        self.sessions.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Close the session's transport contexts, then drop the session.
    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        let session = self.get(id)?;
        session.close_contexts();
        let removed = self.sessions.write().remove(id);
        if removed.is_some() {
            tracing::debug!(session_id = %id, total_sessions = self.len(), "session removed");
        }
        removed
    }

    pub fn remove_all(&self) -> usize {
        let ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        ids.iter().filter(|id| self.remove(id).is_some()).count()
    }

    /// Remove sessions idle past their timeout. Returns the removed IDs.
    pub fn expire_idle(&self) -> Vec<String> {
        let expired: Vec<String> = self
            .sessions
            .read()
            .values()
            .filter(|s| s.is_expired())
            .map(|s| s.id.clone())
            .collect();
        for id in &expired {
            tracing::info!(session_id = %id, "session expired");
            self.remove(id);
        }
        expired
    }
}

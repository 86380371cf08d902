//! Keeps server sessions from timing out.
//!
//! Every interval the worker expires sessions that went silent past their
//! timeout, then sends one keep-alive request per remaining session. The
//! verb is the first of GET_PARAMETER, OPTIONS, PLAY the server is known to
//! support; a 501 removes a verb from that set so the next tick falls back.

use std::collections::HashSet;
use std::io;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::{ClientInner, idle};
use crate::protocol::{Message, Method};
use crate::session::Session;

/// Floor for the keep-alive period.
const MIN_INTERVAL: Duration = Duration::from_millis(100);

/// Verb used to refresh a session.
pub fn keep_alive_method(supported: &HashSet<Method>) -> Method {
    [Method::GetParameter, Method::Options, Method::Play]
        .into_iter()
        .find(|m| supported.contains(m))
        .unwrap_or(Method::Options)
}

/// Keep-alive period: the configured value, never more than half the
/// session timeout.
pub fn interval(session_timeout: Duration, configured: Option<Duration>) -> Duration {
    let half = session_timeout / 2;
    configured.map_or(half, |c| c.min(half)).max(MIN_INTERVAL)
}

/// Whether a refresh would be wasted: the play range ends before the next
/// tick, or the transport is being renegotiated.
pub fn suppressed(remaining: Option<Duration>, period: Duration, in_transition: bool) -> bool {
    in_transition || remaining.is_some_and(|r| r < period)
}

pub(crate) fn spawn(inner: Weak<ClientInner>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("rtsp-keepalive".into())
        .spawn(move || run(inner))
}

fn run(weak: Weak<ClientInner>) {
    tracing::debug!("keep-alive worker started");
    loop {
        let Some((period, slice)) = weak
            .upgrade()
            .map(|inner| (inner.keep_alive_interval(), inner.config.poll_interval))
        else {
            break;
        };
        if !idle(&weak, period, slice.max(Duration::from_millis(10))) {
            break;
        }
        let Some(inner) = weak.upgrade() else {
            break;
        };
        tick(&inner);
    }
    tracing::debug!("keep-alive worker stopped");
}

impl ClientInner {
    fn keep_alive_interval(&self) -> Duration {
        let timeout = self
            .sessions
            .all()
            .iter()
            .map(|s| s.timeout())
            .min()
            .unwrap_or(self.config.session_timeout);
        interval(timeout, self.config.keep_alive_interval)
    }
}

pub(crate) fn tick(inner: &ClientInner) {
    let expired = inner.sessions.expire_idle();
    if !expired.is_empty() && inner.sessions.is_empty() {
        tracing::warn!(expired = expired.len(), "every session expired");
        inner.play.lock().playing = false;
    }
    for context in inner.contexts.all().into_iter().filter(|c| c.is_closed()) {
        inner.contexts.remove(&context);
    }

    let period = inner.keep_alive_interval();
    let (remaining, in_transition) = {
        let play = inner.play.lock();
        (play.remaining(), play.in_transition)
    };
    if suppressed(remaining, period, in_transition) {
        tracing::trace!(?remaining, in_transition, "keep-alive suppressed");
        return;
    }

    let due: Vec<Arc<Session>> = inner
        .sessions
        .all()
        .into_iter()
        .filter(|s| s.keep_alive_enabled())
        .collect();
    if due.is_empty() {
        return;
    }

    let result = inner.with_engine(|engine| {
        let method = keep_alive_method(engine.supported());
        let single = inner.sessions.len() == 1;
        for session in &due {
            let uri = if single {
                inner.presentation(engine).to_string()
            } else {
                session.control.clone()
            };
            let request = Message::request(method.clone(), uri).with_header("Session", session.id.clone());
            match engine.send(request, true)? {
                Some(response) if response.status().is_some_and(|s| s.is_success()) => {
                    session.touch();
                    tracing::trace!(session_id = %session.id, %method, "keep-alive answered");
                }
                Some(response) => {
                    tracing::warn!(session_id = %session.id, %method, status = ?response.status(), "keep-alive refused");
                }
                None => tracing::warn!(session_id = %session.id, %method, "keep-alive unanswered"),
            }
        }
        Ok(())
    });
    if let Err(e) = result {
        tracing::warn!(error = %e, "keep-alive failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_get_parameter() {
        let mut supported = HashSet::new();
        assert_eq!(keep_alive_method(&supported), Method::Options);
        supported.insert(Method::Play);
        assert_eq!(keep_alive_method(&supported), Method::Play);
        supported.insert(Method::Options);
        assert_eq!(keep_alive_method(&supported), Method::Options);
        supported.insert(Method::GetParameter);
        assert_eq!(keep_alive_method(&supported), Method::GetParameter);
    }

    #[test]
    fn interval_is_at_most_half_the_timeout() {
        let timeout = Duration::from_secs(60);
        assert_eq!(interval(timeout, None), Duration::from_secs(30));
        assert_eq!(interval(timeout, Some(Duration::from_secs(10))), Duration::from_secs(10));
        assert_eq!(interval(timeout, Some(Duration::from_secs(50))), Duration::from_secs(30));
        assert_eq!(interval(Duration::ZERO, None), MIN_INTERVAL);
    }

    #[test]
    fn suppressed_near_range_end_or_in_transition() {
        let period = Duration::from_secs(30);
        assert!(!suppressed(None, period, false));
        assert!(!suppressed(Some(Duration::from_secs(45)), period, false));
        assert!(suppressed(Some(Duration::from_secs(10)), period, false));
        assert!(suppressed(None, period, true));
    }
}

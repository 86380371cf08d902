//! Media receive loop: polls UDP sockets of every live stream and, when any
//! stream is interleaved, reads the control connection between exchanges.

use std::io;
use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::ClientInner;

const MIN_SLICE: Duration = Duration::from_millis(1);
const IDLE_SLEEP: Duration = Duration::from_millis(5);

pub(crate) fn spawn(inner: Weak<ClientInner>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("rtsp-receiver".into())
        .spawn(move || run(inner))
}

fn run(weak: Weak<ClientInner>) {
    tracing::debug!("receiver started");
    let mut buf = Vec::new();
    loop {
        let Some(inner) = weak.upgrade() else {
            break;
        };
        if !inner.lifecycle.is_active() {
            break;
        }
        if buf.len() != inner.config.buffer_size {
            buf.resize(inner.config.buffer_size, 0);
        }
        if !receive(&inner, &mut buf) {
            drop(inner);
            thread::sleep(IDLE_SLEEP);
        }
    }
    tracing::debug!("receiver stopped");
}

/// One pass over every stream. Returns false when there was nothing to
/// wait on.
fn receive(inner: &ClientInner, buf: &mut [u8]) -> bool {
    let slice = inner.config.poll_interval.max(MIN_SLICE);
    let contexts: Vec<_> = inner
        .contexts
        .all()
        .into_iter()
        .filter(|c| !c.is_closed())
        .collect();
    let (interleaved, sockets): (Vec<_>, Vec<_>) = contexts.into_iter().partition(|c| c.is_interleaved());
    if interleaved.is_empty() && sockets.is_empty() {
        return false;
    }

    let waits = sockets.len() as u32 + u32::from(!interleaved.is_empty());
    let wait = (slice / waits.max(1)).max(MIN_SLICE);

    for context in &sockets {
        if let Err(e) = context.poll_sockets(buf, wait) {
            tracing::debug!(control = %context.control, error = %e, "media socket error");
        }
    }

    if !interleaved.is_empty() {
        let Some(mut engine) = inner.engine.try_lock_for(wait) else {
            return true;
        };
        if !engine.is_connected() {
            return false;
        }
        let result = engine.pump(wait);
        let events = engine.take_events();
        drop(engine);
        inner.apply_events(events);
        if let Err(e) = result {
            tracing::warn!(error = %e, "interleaved receive failed");
        }
    }
    true
}

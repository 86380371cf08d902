//! Watches the control connection and media flow.
//!
//! Each tick drains anything the server sent unprompted (pushed requests,
//! stray responses) when no exchange is running, then checks media
//! activity. When every stream of a playing presentation has stalled and
//! `alternate_transport` is set, the presentation is torn down and set up
//! again on the first untried rung of the transport ladder:
//!
//! ```text
//! Interleaved ──► Udp ──► Raw
//! ```
//!
//! Once every rung has been tried the monitor only reports.

use std::io;
use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::{ClientInner, TransactionEngine, idle};
use crate::error::Result;
use crate::protocol::NptRange;
use crate::transport::MediaTransport;

pub(crate) fn spawn(inner: Weak<ClientInner>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("rtsp-monitor".into())
        .spawn(move || run(inner))
}

fn run(weak: Weak<ClientInner>) {
    tracing::debug!("monitor started");
    loop {
        let Some((period, slice)) = weak
            .upgrade()
            .map(|inner| (inner.config.monitor_interval, inner.config.poll_interval))
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
    tracing::debug!("monitor stopped");
}

pub(crate) fn tick(inner: &ClientInner) {
    drain_unsolicited(inner);
    if inner.config.alternate_transport {
        check_activity(inner);
    }
}

fn drain_unsolicited(inner: &ClientInner) {
    let Some(mut engine) = inner.engine.try_lock() else {
        return;
    };
    if !engine.is_connected() {
        return;
    }
    let result = engine.pump(Duration::from_millis(1));
    let events = engine.take_events();
    drop(engine);
    inner.apply_events(events);
    match result {
        Ok(0) => {}
        Ok(n) => tracing::trace!(bytes = n, "unsolicited data"),
        Err(e) => tracing::warn!(error = %e, "control connection lost"),
    }
}

fn check_activity(inner: &ClientInner) {
    {
        let play = inner.play.lock();
        if !play.playing || play.in_transition || play.ladder_exhausted {
            return;
        }
    }
    let contexts: Vec<_> = inner
        .contexts
        .all()
        .into_iter()
        .filter(|c| !c.is_closed())
        .collect();
    let stalled = contexts.iter().filter(|c| c.is_stalled()).count();
    if contexts.is_empty() || stalled < contexts.len() {
        return;
    }

    tracing::warn!(streams = contexts.len(), "no media received on any stream");
    match fall_back(inner) {
        Ok(Some(transport)) => tracing::info!(?transport, "media transport switched"),
        Ok(None) => tracing::warn!("no transport left to try"),
        Err(e) => tracing::warn!(error = %e, "transport fallback failed"),
    }
}

/// Step one rung down the transport ladder and renegotiate every stream.
/// `Ok(None)` when every rung has been tried.
pub(crate) fn fall_back(inner: &ClientInner) -> Result<Option<MediaTransport>> {
    let mut engine = inner.engine.lock();
    let (next, resume) = {
        let mut play = inner.play.lock();
        let current = play.transport;
        if !play.tried.contains(&current) {
            play.tried.push(current);
        }
        let Some(next) = current.step_down(&play.tried) else {
            play.ladder_exhausted = true;
            return Ok(None);
        };
        play.in_transition = true;
        tracing::info!(from = ?current, to = ?next, "switching media transport");
        (next, play.resume_range())
    };

    let result = renegotiate(inner, &mut engine, next, resume);
    let events = engine.take_events();
    drop(engine);

    inner.play.lock().in_transition = false;
    inner.apply_events(events);
    result.map(Some)
}

/// TEARDOWN, SETUP every described media over `transport`, PLAY from
/// `resume`. Returns the transport the server finally accepted.
fn renegotiate(
    inner: &ClientInner,
    engine: &mut TransactionEngine,
    transport: MediaTransport,
    resume: Option<NptRange>,
) -> Result<MediaTransport> {
    inner.teardown_locked(engine)?;

    let media = {
        let mut play = inner.play.lock();
        play.transport = transport;
        play.description
            .as_ref()
            .map(|d| d.media.clone())
            .unwrap_or_default()
    };
    for m in &media {
        inner.setup_locked(engine, m)?;
    }
    inner.play_locked(engine, resume)?;

    let accepted = inner.play.lock().transport;
    if accepted != transport {
        inner.play.lock().tried.push(transport);
    }
    Ok(accepted)
}

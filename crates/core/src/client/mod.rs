//! RTSP client: control verbs over the [`TransactionEngine`], plus the
//! workers that keep sessions alive and media flowing.
//!
//! ## Threads
//!
//! ```text
//! caller ───────┐
//! keep-alive ───┼──► engine gate (one exchange at a time) ──► control connection
//! monitor ──────┤
//! receiver ─────┘     (receiver also polls UDP media sockets)
//! ```
//!
//! Workers hold a `Weak` reference to the client and exit once it starts
//! closing; [`Client::close`] (or drop) joins them before tearing down.
//!
//! Locks are always taken in the order engine gate → play state →
//! registries. Events pushed by the server are applied after the gate is
//! released.

pub mod config;
pub mod engine;
pub mod keepalive;
pub mod monitor;
pub mod negotiator;
pub mod push;
mod receiver;

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use url::Url;

use crate::error::{Result, RtspError};
use crate::lifecycle::{Lifecycle, SharedLifecycle};
use crate::media::Frame;
use crate::protocol::{
    Credentials, MediaDescription, Message, Method, NptRange, RtpInfo, SessionDescription,
    StatusCode,
};
use crate::session::{Session, SessionRegistry};
use crate::transport::{ContextTable, ControlProtocol, MediaTransport, TransportContext};

pub use config::ClientConfig;
pub use engine::{EngineStats, ExchangeState, TransactionEngine};
pub use negotiator::Negotiated;
pub use push::PushEvent;

/// Playback bookkeeping shared by the caller and the workers.
#[derive(Debug, Default)]
pub(crate) struct PlayState {
    description: Option<SessionDescription>,
    /// Base for per-media control locations (`Content-Base`).
    base: Option<Url>,
    transport: MediaTransport,
    tried: Vec<MediaTransport>,
    ladder_exhausted: bool,
    in_transition: bool,
    playing: bool,
    range: Option<NptRange>,
    started: Option<Instant>,
    /// Locations the server reported as finished.
    ended: Vec<String>,
}

impl PlayState {
    /// Play time left before the end of the range, when it has one.
    fn remaining(&self) -> Option<Duration> {
        let range = self.range?;
        let end = range.end?;
        let position = range.start.unwrap_or_default() + self.started?.elapsed();
        Some(end.saturating_sub(position))
    }

    /// Where a replay should resume.
    fn resume_range(&self) -> Option<NptRange> {
        let range = self.range?;
        range.end?;
        let elapsed = self.started.map(|s| s.elapsed()).unwrap_or_default();
        Some(NptRange {
            start: Some(range.start.unwrap_or_default() + elapsed),
            end: range.end,
        })
    }
}

pub(crate) struct ClientInner {
    config: Arc<ClientConfig>,
    lifecycle: Arc<SharedLifecycle>,
    engine: Mutex<TransactionEngine>,
    play: Mutex<PlayState>,
    sessions: SessionRegistry,
    contexts: ContextTable,
}

/// An RTSP client for one presentation.
///
/// ```no_run
/// use rtsp::{Client, ClientConfig};
///
/// let client = Client::new("rtsp://camera.local/live", ClientConfig::default())?;
/// client.start_playing(None)?;
/// for (control, frame) in client.frames() {
///     println!("{control}: {} packets", frame.count());
/// }
/// client.close();
/// # Ok::<(), rtsp::RtspError>(())
/// ```
pub struct Client {
    inner: Arc<ClientInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Client {
    /// Prepare a client for `location`. Nothing is sent until the first verb.
    ///
    /// Credentials in the URL are moved into the configuration unless it
    /// already has some.
    pub fn new(location: &str, config: ClientConfig) -> Result<Self> {
        let invalid = || RtspError::InvalidLocation(location.to_string());
        let mut url = Url::parse(location).map_err(|_| invalid())?;
        if url.host_str().is_none() {
            return Err(invalid());
        }
        let protocol = match config.control {
            Some(protocol) => protocol,
            None => ControlProtocol::from_scheme(url.scheme()).ok_or_else(invalid)?,
        };

        let mut config = config;
        if config.credentials.is_none() && !url.username().is_empty() {
            config.credentials = Some(Credentials::new(
                url.username(),
                url.password().unwrap_or_default(),
            ));
        }
        let _ = url.set_username("");
        let _ = url.set_password(None);

        let config = Arc::new(config);
        let lifecycle = Arc::new(SharedLifecycle::new());
        let contexts = ContextTable::new();
        let engine = TransactionEngine::new(
            config.clone(),
            protocol,
            url,
            contexts.clone(),
            lifecycle.clone(),
        );
        let play = PlayState {
            transport: config.media_transport,
            ..PlayState::default()
        };

        Ok(Client {
            inner: Arc::new(ClientInner {
                config,
                lifecycle,
                engine: Mutex::new(engine),
                play: Mutex::new(play),
                sessions: SessionRegistry::new(),
                contexts,
            }),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.inner.lifecycle.get()
    }

    /// Current target; follows redirects.
    pub fn location(&self) -> Url {
        self.inner.engine.lock().location().clone()
    }

    pub fn connect(&self) -> Result<()> {
        self.inner.ensure_active()?;
        self.inner.engine.lock().connect()
    }

    /// Send any request through the engine. `Ok(None)` means no response.
    pub fn send(&self, request: Message, expect_response: bool) -> Result<Option<Message>> {
        self.inner.ensure_active()?;
        self.inner.with_engine(|engine| engine.send(request, expect_response))
    }

    /// OPTIONS. The response is returned whatever its status.
    pub fn options(&self) -> Result<Message> {
        self.inner.ensure_active()?;
        self.inner.with_engine(|engine| {
            let request = Message::request(Method::Options, engine.location().as_str());
            engine.transact(request)
        })
    }

    /// DESCRIBE and parse the session description.
    pub fn describe(&self) -> Result<SessionDescription> {
        self.inner.ensure_active()?;
        let (response, location) = self.inner.with_engine(|engine| {
            let request = Message::request(Method::Describe, engine.location().as_str())
                .with_header("Accept", "application/sdp");
            let response = engine.transact(request)?;
            Ok((response, engine.location().clone()))
        })?;
        let response = expect_success(&Method::Describe, response)?;
        let description = SessionDescription::parse(&response.body_text())?;

        let base = response
            .header("Content-Base")
            .or_else(|| response.header("Content-Location"))
            .and_then(|b| location.join(b.trim()).ok())
            .unwrap_or(location);
        tracing::info!(media = description.media.len(), base = %base, "presentation described");

        let mut play = self.inner.play.lock();
        play.description = Some(description.clone());
        play.base = Some(base);
        Ok(description)
    }

    /// SETUP one media stream from the last description.
    pub fn setup(&self, media: &MediaDescription) -> Result<Negotiated> {
        self.inner.ensure_active()?;
        self.inner.with_engine(|engine| self.inner.setup_locked(engine, media))
    }

    /// PLAY every set-up stream from `range` (or where the server likes).
    pub fn play(&self, range: Option<NptRange>) -> Result<Message> {
        self.inner.ensure_active()?;
        self.inner.with_engine(|engine| self.inner.play_locked(engine, range))
    }

    pub fn pause(&self) -> Result<Message> {
        self.inner.ensure_active()?;
        let response = self.inner.with_engine(|engine| {
            let mut last = None;
            for (uri, session) in self.inner.targets(engine) {
                let request = Message::request(Method::Pause, uri).with_header("Session", session);
                last = Some(expect_success(&Method::Pause, engine.transact(request)?)?);
            }
            last.ok_or_else(|| RtspError::protocol("PAUSE without a session", None))
        })?;
        let mut play = self.inner.play.lock();
        play.playing = false;
        play.started = None;
        Ok(response)
    }

    /// TEARDOWN every session and release its transports.
    pub fn teardown(&self) -> Result<()> {
        self.inner.ensure_active()?;
        self.inner.with_engine(|engine| self.inner.teardown_locked(engine))
    }

    /// GET_PARAMETER on the presentation. An empty body makes it a ping.
    pub fn get_parameter(&self, names: &[&str]) -> Result<Message> {
        self.inner.ensure_active()?;
        self.inner.with_engine(|engine| {
            let uri = self.inner.presentation(engine);
            let mut request = Message::request(Method::GetParameter, uri.as_str());
            if !names.is_empty() {
                let body: String = names.iter().map(|n| format!("{n}\r\n")).collect();
                request = request.with_body("text/parameters", body);
            }
            expect_success(&Method::GetParameter, engine.transact(request)?)
        })
    }

    pub fn set_parameter(&self, name: &str, value: &str) -> Result<Message> {
        self.inner.ensure_active()?;
        self.inner.with_engine(|engine| {
            let uri = self.inner.presentation(engine);
            let request = Message::request(Method::SetParameter, uri.as_str())
                .with_body("text/parameters", format!("{name}: {value}\r\n"));
            expect_success(&Method::SetParameter, engine.transact(request)?)
        })
    }

    /// ANNOUNCE a session description to the server.
    pub fn announce(&self, description: &str) -> Result<Message> {
        self.inner.ensure_active()?;
        self.inner.with_engine(|engine| {
            let request = Message::request(Method::Announce, engine.location().as_str())
                .with_body("application/sdp", description.to_string());
            expect_success(&Method::Announce, engine.transact(request)?)
        })
    }

    /// OPTIONS, DESCRIBE, SETUP for every media, PLAY; then start the
    /// maintenance workers.
    pub fn start_playing(&self, range: Option<NptRange>) -> Result<()> {
        self.inner.ensure_active()?;
        self.connect()?;
        self.options()?;
        let description = self.describe()?;
        if description.media.is_empty() {
            return Err(RtspError::protocol("description lists no media", None));
        }
        for media in &description.media {
            self.setup(media)?;
        }
        self.play(range)?;
        self.start_workers()
    }

    /// TEARDOWN; workers keep running until the client closes.
    pub fn stop_playing(&self) -> Result<()> {
        self.teardown()
    }

    /// Spawn the keep-alive, monitor and receive workers if not running.
    pub fn start_workers(&self) -> Result<()> {
        self.inner.ensure_active()?;
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return Ok(());
        }
        let weak = Arc::downgrade(&self.inner);
        workers.push(receiver::spawn(weak.clone())?);
        workers.push(monitor::spawn(weak.clone())?);
        if self.inner.config.keep_alive {
            workers.push(keepalive::spawn(weak)?);
        }
        tracing::debug!(workers = workers.len(), "workers started");
        Ok(())
    }

    /// Renegotiate every stream on the next untried media transport.
    /// `Ok(None)` once every transport has been tried.
    pub fn step_down_transport(&self) -> Result<Option<MediaTransport>> {
        self.inner.ensure_active()?;
        monitor::fall_back(&self.inner)
    }

    /// Completed frames from every stream, tagged with the stream's
    /// control location.
    pub fn frames(&self) -> Vec<(String, Frame)> {
        self.inner
            .contexts
            .all()
            .into_iter()
            .flat_map(|context| {
                let control = context.control.clone();
                context
                    .drain_frames()
                    .into_iter()
                    .map(move |frame| (control.clone(), frame))
            })
            .collect()
    }

    pub fn supported_methods(&self) -> Vec<Method> {
        self.inner.engine.lock().supported().iter().cloned().collect()
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.inner.sessions.all()
    }

    pub fn contexts(&self) -> Vec<Arc<TransportContext>> {
        self.inner.contexts.all()
    }

    pub fn is_playing(&self) -> bool {
        self.inner.play.lock().playing
    }

    /// Media transport the next SETUP will offer.
    pub fn media_transport(&self) -> MediaTransport {
        self.inner.play.lock().transport
    }

    pub fn stats(&self) -> EngineStats {
        self.inner.engine.lock().stats()
    }

    /// Stop workers, tear down sessions and close the connection.
    /// Idempotent.
    pub fn close(&self) {
        if !self.inner.lifecycle.begin_close() {
            return;
        }
        tracing::info!("closing client");

        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if worker.join().is_err() {
                tracing::warn!("worker panicked");
            }
        }

        let mut engine = self.inner.engine.lock();
        if !self.inner.sessions.is_empty() && engine.is_connected() {
            if let Err(e) = self.inner.teardown_locked(&mut engine) {
                tracing::debug!(error = %e, "teardown on close failed");
            }
        }
        engine.disconnect();
        drop(engine);

        self.inner.sessions.remove_all();
        self.inner.contexts.clear();
        self.inner.lifecycle.finish_close();
        tracing::info!("client closed");
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

impl ClientInner {
    fn ensure_active(&self) -> Result<()> {
        if self.lifecycle.is_active() {
            Ok(())
        } else {
            Err(RtspError::Closed)
        }
    }

    /// Run `f` holding the engine gate, then apply pushed events.
    fn with_engine<T>(&self, f: impl FnOnce(&mut TransactionEngine) -> Result<T>) -> Result<T> {
        let mut engine = self.engine.lock();
        let result = f(&mut *engine);
        let events = engine.take_events();
        drop(engine);
        self.apply_events(events);
        result
    }

    /// Location for aggregate requests.
    fn presentation(&self, engine: &TransactionEngine) -> Url {
        let play = self.play.lock();
        let base = play.base.clone().unwrap_or_else(|| engine.location().clone());
        match &play.description {
            Some(description) => description.aggregate_control(&base),
            None => base,
        }
    }

    /// `(location, session id)` pairs aggregate verbs go to: the
    /// presentation for a single session, each session's own control
    /// location otherwise.
    fn targets(&self, engine: &TransactionEngine) -> Vec<(String, String)> {
        let sessions = self.sessions.all();
        match sessions.as_slice() {
            [] => Vec::new(),
            [session] => vec![(self.presentation(engine).to_string(), session.id.clone())],
            many => many
                .iter()
                .map(|s| (s.control.clone(), s.id.clone()))
                .collect(),
        }
    }

    fn setup_locked(&self, engine: &mut TransactionEngine, media: &MediaDescription) -> Result<Negotiated> {
        let (transport, base) = {
            let play = self.play.lock();
            (play.transport, play.base.clone())
        };
        let base = base.unwrap_or_else(|| engine.location().clone());
        let control = media.control_url(&base);
        let negotiated = negotiator::setup(
            engine,
            &self.config,
            &self.contexts,
            &self.sessions,
            media,
            &control,
            transport,
        )?;
        self.play.lock().transport = negotiated.transport;
        Ok(negotiated)
    }

    fn play_locked(&self, engine: &mut TransactionEngine, range: Option<NptRange>) -> Result<Message> {
        let targets = self.targets(engine);
        if targets.is_empty() {
            return Err(RtspError::protocol("PLAY without a session", None));
        }

        let mut last = None;
        for (uri, session) in targets {
            let mut request = Message::request(Method::Play, uri).with_header("Session", session);
            if let Some(range) = range {
                request.set_header("Range", range.to_header());
            }
            last = Some(expect_success(&Method::Play, engine.transact(request)?)?);
        }
        let response = last.ok_or_else(|| RtspError::protocol("PLAY without a session", None))?;

        let answered_range = response.header("Range").and_then(NptRange::parse);
        let range = {
            let mut play = self.play.lock();
            let described = play.description.as_ref().and_then(|d| d.range);
            play.range = answered_range.or(range).or(described);
            play.started = Some(Instant::now());
            play.playing = true;
            play.ended.clear();
            play.range
        };

        let contexts = self.contexts.all();
        if let Some(info) = response.header("RTP-Info") {
            for entry in RtpInfo::parse_list(info) {
                let (Some(url), Some(ssrc)) = (entry.url.as_deref(), entry.ssrc) else {
                    continue;
                };
                if let Some(context) = contexts.iter().find(|c| same_stream(&c.control, url)) {
                    context.set_remote_ssrc(ssrc);
                }
            }
        }
        if let Some(range) = range {
            for context in contexts.iter().filter(|c| c.media_end().is_none()) {
                context.set_range(range.start, range.end);
            }
        }
        for session in self.sessions.all() {
            session.touch();
        }
        tracing::info!(?range, streams = contexts.len(), "playing");
        Ok(response)
    }

    /// TEARDOWN every session. Refusals are logged; local state is
    /// released regardless.
    fn teardown_locked(&self, engine: &mut TransactionEngine) -> Result<()> {
        let mut first_error = None;
        for (uri, session) in self.targets(engine) {
            let request = Message::request(Method::Teardown, uri).with_header("Session", session.clone());
            match engine.send(request, true) {
                Ok(Some(response)) if !response.status().is_some_and(|s| s.is_success()) => {
                    tracing::debug!(session_id = %session, status = ?response.status(), "TEARDOWN refused");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(session_id = %session, error = %e, "TEARDOWN failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        engine.clear_session();

        let mut play = self.play.lock();
        play.playing = false;
        play.started = None;
        drop(play);
        let removed = self.sessions.remove_all();
        self.contexts.clear();
        tracing::info!(sessions = removed, "torn down");

        match first_error {
            Some(RtspError::Closed) => Err(RtspError::Closed),
            _ => Ok(()),
        }
    }

    fn drop_session(&self, id: &str) {
        let Some(session) = self.sessions.get(id) else {
            return;
        };
        let contexts = session.contexts();
        self.sessions.remove(id);
        for context in &contexts {
            self.contexts.remove(context);
        }
    }

    /// Apply server-pushed events. Never called with the engine gate held.
    fn apply_events(&self, events: Vec<PushEvent>) {
        for event in events {
            match event {
                PushEvent::Teardown { session, .. } => {
                    let mut engine = self.engine.lock();
                    if session.is_none() || engine.session().map(|s| &s.id) == session.as_ref() {
                        engine.clear_session();
                    }
                    drop(engine);
                    let mut play = self.play.lock();
                    match session {
                        Some(id) => self.drop_session(&id),
                        None => {
                            self.sessions.remove_all();
                            self.contexts.clear();
                        }
                    }
                    if self.sessions.is_empty() {
                        play.playing = false;
                        play.started = None;
                    }
                    tracing::info!(remaining_sessions = self.sessions.len(), "server tore down session");
                }
                PushEvent::EndOfStream { location, .. } => {
                    let mut play = self.play.lock();
                    match location {
                        Some(location) => play.ended.push(location),
                        None => play.playing = false,
                    }
                    let contexts = self.contexts.all();
                    let all_ended = contexts
                        .iter()
                        .all(|c| play.ended.iter().any(|e| same_stream(&c.control, e)));
                    if all_ended {
                        play.playing = false;
                    }
                    tracing::info!(playing = play.playing, "end of stream");
                }
            }
        }
    }
}

/// Run the worker body until the client goes away.
///
/// Sleeps `period` in `slice` steps; returns false once the client is gone
/// or no longer active.
fn idle(inner: &Weak<ClientInner>, period: Duration, slice: Duration) -> bool {
    let deadline = Instant::now() + period;
    loop {
        match inner.upgrade() {
            Some(inner) if inner.lifecycle.is_active() => {}
            _ => return false,
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return true;
        }
        thread::sleep(remaining.min(slice));
    }
}

/// Whether a control location and an `RTP-Info`/push location name the same
/// stream; servers echo either the absolute or the relative form.
fn same_stream(control: &str, location: &str) -> bool {
    let control = control.trim_end_matches('/');
    let location = location.trim_end_matches('/');
    control == location || control.ends_with(&format!("/{location}")) || location.ends_with(&format!("/{control}"))
}

fn expect_success(method: &Method, response: Message) -> Result<Message> {
    match response.status() {
        Some(status) if status.is_success() => Ok(response),
        Some(StatusCode::NOT_IMPLEMENTED | StatusCode::METHOD_NOT_ALLOWED) => {
            Err(RtspError::MethodNotSupported(method.to_string()))
        }
        Some(status) => Err(RtspError::protocol(
            format!("{} answered {} {}", method, status.0, status.reason()),
            Some(&response),
        )),
        None => Err(RtspError::protocol("expected a response", Some(&response))),
    }
}

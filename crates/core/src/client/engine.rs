//! One request/response exchange at a time over the control connection.
//!
//! ```text
//! Idle → Sending → AwaitingResponse → Completed
//!                        │
//!                        ├─ no answer in window → Retrying → Sending (unreliable only)
//!                        └─ budget exhausted     → Failed
//! ```
//!
//! The engine owns the receive buffer. Interleaved `$` frames found in front
//! of a response are split off as [`Bytes`](bytes::Bytes) and routed to the
//! transport context bound to their channel; requests pushed by the server
//! are answered in place and surface later as [`PushEvent`]s.

use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use url::Url;

use super::config::ClientConfig;
use super::push::{self, PushEvent};
use crate::error::{Result, RtspError};
use crate::lifecycle::{Lifecycle, SharedLifecycle};
use crate::protocol::headers::{SessionHeader, is_extension_header, parse_method_list};
use crate::protocol::{Authenticator, Challenge, Message, Method, Parsed, RTSP_VERSION, StatusCode};
use crate::transport::{self, Connection, ContextTable, ControlProtocol, is_reset};

/// Where the current exchange stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExchangeState {
    #[default]
    Idle,
    Sending,
    AwaitingResponse,
    Retrying,
    Completed,
    Failed,
}

/// Counters kept across exchanges.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineStats {
    pub requests_sent: u64,
    pub bytes_sent: u64,
    pub responses_received: u64,
    pub bytes_received: u64,
    pub retransmissions: u64,
    pub stale_responses: u64,
    pub pushed_requests: u64,
    pub reconnects: u64,
}

/// Why a request goes out again under a fresh CSeq.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Resend {
    Authenticate,
    Version(String),
    Redirect(Url),
}

enum Exchange {
    Answered(Message),
    Unanswered { request: Message, attempts: u32 },
}

pub struct TransactionEngine {
    config: Arc<ClientConfig>,
    protocol: ControlProtocol,
    location: Url,
    connection: Option<Box<dyn Connection>>,
    contexts: ContextTable,
    lifecycle: Arc<SharedLifecycle>,
    buffer: BytesMut,
    scratch: Vec<u8>,
    next_cseq: u32,
    last_push_cseq: Option<u32>,
    version: String,
    authenticator: Option<Authenticator>,
    session: Option<SessionHeader>,
    session_timeout: Duration,
    supported: HashSet<Method>,
    x_headers: Vec<(String, String)>,
    events: Vec<PushEvent>,
    state: ExchangeState,
    stats: EngineStats,
}

impl TransactionEngine {
    pub fn new(
        config: Arc<ClientConfig>,
        protocol: ControlProtocol,
        location: Url,
        contexts: ContextTable,
        lifecycle: Arc<SharedLifecycle>,
    ) -> Self {
        let scratch = vec![0u8; config.buffer_size.max(2048)];
        let session_timeout = config.session_timeout;
        TransactionEngine {
            config,
            protocol,
            location,
            connection: None,
            contexts,
            lifecycle,
            buffer: BytesMut::new(),
            scratch,
            next_cseq: 1,
            last_push_cseq: None,
            version: RTSP_VERSION.to_string(),
            authenticator: None,
            session: None,
            session_timeout,
            supported: HashSet::new(),
            x_headers: Vec::new(),
            events: Vec::new(),
            state: ExchangeState::Idle,
            stats: EngineStats::default(),
        }
    }

    /// Current target; changes when the server redirects.
    pub fn location(&self) -> &Url {
        &self.location
    }

    pub fn protocol(&self) -> ControlProtocol {
        self.protocol
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn is_reliable(&self) -> bool {
        match &self.connection {
            Some(connection) => connection.is_reliable(),
            None => self.protocol != ControlProtocol::Udp,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.connection.as_ref().map(|c| c.peer_addr())
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Session announced in the last successful response.
    pub fn session(&self) -> Option<&SessionHeader> {
        self.session.as_ref()
    }

    pub fn clear_session(&mut self) {
        self.session = None;
        self.session_timeout = self.config.session_timeout;
    }

    pub fn session_timeout(&self) -> Duration {
        self.session_timeout
    }

    /// Methods the server is known to accept.
    pub fn supported(&self) -> &HashSet<Method> {
        &self.supported
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    /// Events from requests the server pushed since the last call.
    pub fn take_events(&mut self) -> Vec<PushEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn connect(&mut self) -> Result<()> {
        if self.connection.is_some() {
            return Ok(());
        }
        let mut connection = transport::connect(self.protocol, &self.location, self.config.connect_timeout)
            .map_err(|e| match e {
                RtspError::Io(source) => RtspError::transport(
                    format!("cannot connect to {}", self.location),
                    None,
                    Some(source),
                ),
                other => other,
            })?;
        connection.set_write_timeout(self.config.write_timeout)?;
        self.connection = Some(connection);
        Ok(())
    }

    /// Use an already established control connection.
    pub fn attach(&mut self, connection: Box<dyn Connection>) {
        self.disconnect();
        self.connection = Some(connection);
    }

    pub fn reconnect(&mut self) -> Result<()> {
        self.disconnect();
        self.stats.reconnects += 1;
        tracing::info!(location = %self.location, "reconnecting control connection");
        self.connect()
    }

    pub fn disconnect(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.shutdown();
        }
        self.buffer.clear();
    }

    fn next_cseq(&mut self) -> u32 {
        let cseq = self.next_cseq;
        self.next_cseq = self.next_cseq.wrapping_add(1).max(1);
        cseq
    }

    /// Send `request` and, if `expect_response`, wait for its answer.
    ///
    /// `401`, `505` and redirects are answered by resending under a fresh
    /// CSeq. Returns `Ok(None)` when nothing correlated arrived within the
    /// attempt budget.
    pub fn send(&mut self, request: Message, expect_response: bool) -> Result<Option<Message>> {
        match self.run(request, expect_response)? {
            Exchange::Answered(response) => Ok(Some(response)),
            Exchange::Unanswered { .. } => Ok(None),
        }
    }

    /// Like [`send`](Self::send), but a missing response is a
    /// [`RtspError::Timeout`].
    pub fn transact(&mut self, request: Message) -> Result<Message> {
        match self.run(request, true)? {
            Exchange::Answered(response) => Ok(response),
            Exchange::Unanswered { request, attempts } => Err(RtspError::Timeout {
                cseq: request.cseq().unwrap_or_default(),
                attempts,
                request: Box::new(request),
            }),
        }
    }

    fn run(&mut self, mut request: Message, expect_response: bool) -> Result<Exchange> {
        let mut resent: Vec<Resend> = Vec::new();
        let mut redirects = 0;

        loop {
            let response = match self.exchange(&mut request, expect_response)? {
                Ok(response) => response,
                Err(attempts) => return Ok(Exchange::Unanswered { request, attempts }),
            };
            self.apply_status(&request, &response);

            let resend = match self.resend_for(&request, &response, &resent, redirects) {
                Ok(Some(resend)) => resend,
                Ok(None) => return Ok(Exchange::Answered(response)),
                Err(e) => {
                    self.state = ExchangeState::Failed;
                    return Err(e);
                }
            };
            tracing::debug!(?resend, cseq = ?request.cseq(), status = ?response.status(), "resending");
            match &resend {
                Resend::Authenticate => {}
                Resend::Version(version) => self.version = version.clone(),
                Resend::Redirect(target) => {
                    redirects += 1;
                    self.redirect(&mut request, target.clone())?;
                }
            }
            resent.push(resend);
            request.clear_cseq();
            request.clear_transferred();
        }
    }

    /// One CSeq: transmit, wait, back off and retransmit.
    ///
    /// The inner `Err` carries the number of attempts made without an
    /// answer.
    fn exchange(
        &mut self,
        request: &mut Message,
        expect_response: bool,
    ) -> Result<std::result::Result<Message, u32>> {
        if self.lifecycle.get() == Lifecycle::Closed {
            return Err(RtspError::Closed);
        }
        self.connect()?;
        if request.cseq().is_none() {
            let cseq = self.next_cseq();
            request.set_cseq(cseq);
        }
        self.prepare(request);
        let cseq = request.cseq().unwrap_or_default();

        let started = Instant::now();
        let mut wait = self.config.read_timeout;
        let mut attempts = 0;
        let mut reconnected = false;
        let mut transmit = true;
        if let Some(connection) = self.connection.as_mut() {
            connection.set_write_timeout(self.config.write_timeout)?;
        }

        loop {
            if transmit {
                self.state = ExchangeState::Sending;
                if let Err(e) = self.transmit(request) {
                    self.recover(e, request, &mut reconnected)?;
                    continue;
                }
                transmit = false;
            }
            attempts += 1;
            if !expect_response {
                self.state = ExchangeState::Completed;
                return Ok(Err(attempts));
            }

            self.state = ExchangeState::AwaitingResponse;
            match self.await_response(cseq, wait) {
                Ok(Some(response)) => {
                    self.state = ExchangeState::Completed;
                    return Ok(Ok(response));
                }
                Ok(None) => {}
                Err(RtspError::Io(e)) => {
                    self.recover(e, request, &mut reconnected)?;
                    transmit = true;
                    attempts -= 1;
                    continue;
                }
                Err(e) => {
                    self.state = ExchangeState::Failed;
                    return Err(e);
                }
            }

            let elapsed = started.elapsed();
            if attempts >= self.config.max_attempts || elapsed >= self.session_timeout / 2 {
                tracing::warn!(
                    cseq,
                    attempts,
                    elapsed_ms = elapsed.as_millis() as u64,
                    method = ?request.method(),
                    "no response"
                );
                self.state = ExchangeState::Failed;
                return Ok(Err(attempts));
            }

            self.state = ExchangeState::Retrying;
            wait = (wait * 2).min(self.config.max_timeout);
            if let Some(connection) = self.connection.as_mut() {
                connection.set_write_timeout(wait)?;
            }
            if !self.is_reliable() {
                request.clear_transferred();
                self.stats.retransmissions += 1;
                tracing::debug!(cseq, wait_ms = wait.as_millis() as u64, "retransmitting");
                transmit = true;
            }
        }
    }

    fn recover(&mut self, error: io::Error, request: &Message, reconnected: &mut bool) -> Result<()> {
        if !is_reset(&error) || !self.config.auto_reconnect || *reconnected {
            self.state = ExchangeState::Failed;
            return Err(RtspError::transport(
                "control connection failed",
                Some(request),
                Some(error),
            ));
        }
        *reconnected = true;
        tracing::warn!(error = %error, cseq = ?request.cseq(), "control connection lost");
        self.reconnect()
    }

    /// Headers every request gets, then the signature over the result.
    fn prepare(&mut self, request: &mut Message) {
        request.version = self.version.clone();
        if self.config.send_user_agent && !request.has_header("User-Agent") {
            request.set_header("User-Agent", self.config.user_agent.clone());
        }
        if self.config.date_requests {
            let date = chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT");
            request.set_header("Date", date.to_string());
        }
        if let Some(session) = &self.session {
            if !request.has_header("Session") {
                request.set_header("Session", session.id.clone());
            }
        }
        for (name, value) in self.config.additional_headers.iter().chain(&self.x_headers) {
            if !request.has_header(name) {
                request.set_header(name, value.clone());
            }
        }
        if let Some(authenticator) = self.authenticator.as_mut() {
            let method = request.method().cloned().unwrap_or(Method::Options);
            let uri = request.uri().unwrap_or("*").to_string();
            let authorization = authenticator.authorization(&method, &uri, &request.body);
            request.set_header("Authorization", authorization);
        }
    }

    fn transmit(&mut self, request: &mut Message) -> io::Result<()> {
        self.write_all(&request.serialize())?;
        request.mark_transferred();
        self.stats.requests_sent += 1;
        tracing::debug!(
            method = ?request.method(),
            cseq = ?request.cseq(),
            uri = ?request.uri(),
            "request sent"
        );
        Ok(())
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "not connected"))?;
        let mut offset = 0;
        let mut stalls = 0;
        while offset < bytes.len() {
            let n = connection.send(&bytes[offset..])?;
            if n == 0 {
                stalls += 1;
                if stalls >= self.config.max_attempts {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "send made no progress"));
                }
                continue;
            }
            offset += n;
        }
        self.stats.bytes_sent += bytes.len() as u64;
        Ok(())
    }

    fn await_response(&mut self, cseq: u32, wait: Duration) -> Result<Option<Message>> {
        let deadline = Instant::now() + wait;
        loop {
            while let Some(message) = self.next_message() {
                if message.is_request() {
                    self.answer_push(message)?;
                    continue;
                }
                if message.cseq() == Some(cseq) {
                    self.stats.responses_received += 1;
                    tracing::debug!(cseq, status = ?message.status(), "response received");
                    return Ok(Some(message));
                }
                self.stats.stale_responses += 1;
                tracing::debug!(expected = cseq, received = ?message.cseq(), "stale response discarded");
            }

            if self.lifecycle.get() == Lifecycle::Closed {
                return Err(RtspError::Closed);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            self.fill(remaining.min(self.config.poll_interval))?;
        }
    }

    fn fill(&mut self, wait: Duration) -> Result<usize> {
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "not connected"))?;
        let n = connection.recv(&mut self.scratch, wait)?;
        if n > 0 {
            self.buffer.extend_from_slice(&self.scratch[..n]);
            self.stats.bytes_received += n as u64;
        }
        Ok(n)
    }

    /// Next complete message in the receive buffer. Interleaved frames in
    /// front of it are routed to their transport contexts.
    fn next_message(&mut self) -> Option<Message> {
        loop {
            if self.buffer.first() == Some(&b'$') {
                if self.buffer.len() < 4 {
                    return None;
                }
                let channel = self.buffer[1];
                let len = u16::from_be_bytes([self.buffer[2], self.buffer[3]]) as usize;
                if self.buffer.len() < 4 + len {
                    return None;
                }
                self.buffer.advance(4);
                let payload = self.buffer.split_to(len).freeze();
                self.contexts.route_interleaved(channel, payload);
                continue;
            }
            if self.buffer.is_empty() {
                return None;
            }
            match Message::parse(&self.buffer) {
                Ok(Parsed::Complete(message, used)) => {
                    self.buffer.advance(used);
                    return Some(message);
                }
                Ok(Parsed::Incomplete) => return None,
                Err(e) => {
                    let skip = resync_point(&self.buffer);
                    tracing::warn!(error = %e, skipped = skip, "discarding unparseable data");
                    self.buffer.advance(skip);
                }
            }
        }
    }

    fn answer_push(&mut self, request: Message) -> Result<()> {
        self.stats.pushed_requests += 1;
        if let (Some(cseq), Some(last)) = (request.cseq(), self.last_push_cseq) {
            if cseq < last {
                tracing::debug!(cseq, last, "out-of-order server request ignored");
                return Ok(());
            }
        }
        if let Some(cseq) = request.cseq() {
            self.last_push_cseq = Some(cseq);
        }
        tracing::info!(method = ?request.method(), uri = ?request.uri(), "server request");

        let (response, event) = push::answer(&request, &self.version, self.config.echo_x_headers);
        self.write_all(&response.serialize())?;
        if let Some(event) = event {
            self.events.push(event);
        }
        Ok(())
    }

    /// Read whatever the server sent outside an exchange: interleaved
    /// media, pushed requests and late responses.
    pub fn pump(&mut self, wait: Duration) -> Result<usize> {
        if self.connection.is_none() {
            return Ok(0);
        }
        let n = match self.fill(wait) {
            Ok(n) => n,
            Err(RtspError::Io(e)) => {
                self.disconnect();
                return Err(RtspError::transport("control connection lost", None, Some(e)));
            }
            Err(e) => return Err(e),
        };
        while let Some(message) = self.next_message() {
            if message.is_request() {
                self.answer_push(message)?;
            } else {
                self.stats.stale_responses += 1;
                tracing::debug!(cseq = ?message.cseq(), "unsolicited response discarded");
            }
        }
        Ok(n)
    }

    fn apply_status(&mut self, request: &Message, response: &Message) {
        let Some(status) = response.status() else {
            return;
        };
        let method = request.method().cloned();

        if status.is_success() {
            if let Some(method) = method {
                self.supported.insert(method);
            }
            for value in response.header_values("Public").chain(response.header_values("Allow")) {
                self.supported.extend(parse_method_list(value));
            }
            if let Some(session) = response.header("Session").and_then(SessionHeader::parse) {
                if let Some(timeout) = session.timeout {
                    self.session_timeout = timeout;
                }
                if self.session.as_ref().map(|s| s.id.as_str()) != Some(session.id.as_str()) {
                    tracing::debug!(session_id = %session.id, "session announced");
                }
                self.session = Some(session);
            }
            if self.config.echo_x_headers {
                for (name, value) in response.headers() {
                    if !is_extension_header(name) {
                        continue;
                    }
                    match self.x_headers.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
                        Some(slot) => slot.1 = value.to_string(),
                        None => self.x_headers.push((name.to_string(), value.to_string())),
                    }
                }
            }
        } else if status == StatusCode::NOT_IMPLEMENTED {
            if let Some(method) = method {
                tracing::debug!(%method, "method not implemented by server");
                self.supported.remove(&method);
            }
        }
    }

    fn resend_for(
        &mut self,
        request: &Message,
        response: &Message,
        resent: &[Resend],
        redirects: u32,
    ) -> Result<Option<Resend>> {
        let Some(status) = response.status() else {
            return Ok(None);
        };
        match status {
            StatusCode::UNAUTHORIZED => {
                if resent.contains(&Resend::Authenticate) {
                    return Err(RtspError::authentication("credentials rejected", Some(response)));
                }
                let Some(credentials) = self.config.credentials.clone() else {
                    return Err(RtspError::authentication(
                        "server requires credentials",
                        Some(response),
                    ));
                };
                let challenge = Challenge::select(response.header_values("WWW-Authenticate"))
                    .map_err(|e| with_response(e, response))?;
                let authenticator =
                    Authenticator::new(credentials, challenge).map_err(|e| with_response(e, response))?;
                self.authenticator = Some(authenticator);
                Ok(Some(Resend::Authenticate))
            }
            StatusCode::VERSION_NOT_SUPPORTED => {
                let tried = resent.iter().any(|r| matches!(r, Resend::Version(_)));
                if tried || response.version == request.version {
                    return Ok(None);
                }
                Ok(Some(Resend::Version(response.version.clone())))
            }
            status if status.is_redirect() => {
                if redirects >= self.config.max_redirects {
                    return Err(RtspError::protocol(
                        format!("more than {} redirects", self.config.max_redirects),
                        Some(response),
                    ));
                }
                let Some(target) = response
                    .header("Location")
                    .or_else(|| response.header("Content-Base"))
                else {
                    return Ok(None);
                };
                let target = self
                    .location
                    .join(target.trim())
                    .map_err(|_| RtspError::InvalidLocation(target.to_string()))?;
                Ok(Some(Resend::Redirect(target)))
            }
            _ => Ok(None),
        }
    }

    fn redirect(&mut self, request: &mut Message, target: Url) -> Result<()> {
        let uri = request.uri().unwrap_or_default().to_string();
        let rewritten = rebase(&uri, &self.location, &target);
        let moved = target.host_str() != self.location.host_str() || target.port() != self.location.port();
        tracing::info!(from = %self.location, to = %target, "redirected");
        self.location = target;
        request.set_uri(rewritten);
        if moved {
            self.disconnect();
            self.connect()?;
        }
        Ok(())
    }
}

fn with_response(error: RtspError, response: &Message) -> RtspError {
    match error {
        RtspError::Authentication { message, response: None } => {
            RtspError::authentication(message, Some(response))
        }
        other => other,
    }
}

/// Move `uri` from under `from` to under `to`. Anything not below `from`
/// becomes `to`.
fn rebase(uri: &str, from: &Url, to: &Url) -> String {
    match uri.strip_prefix(from.as_str()) {
        Some(rest) if !rest.is_empty() => format!(
            "{}/{}",
            to.as_str().trim_end_matches('/'),
            rest.trim_start_matches('/')
        ),
        _ => to.to_string(),
    }
}

/// Offset of the next plausible message or frame start after a parse error.
fn resync_point(buf: &[u8]) -> usize {
    (1..buf.len())
        .find(|&i| buf[i] == b'$' || buf[i..].starts_with(b"RTSP/"))
        .unwrap_or(buf.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::NoopDepacketizer;
    use crate::media::rtp::Packet;
    use crate::protocol::Credentials;
    use crate::protocol::sdp::MediaDescription;
    use crate::transport::{ContextBinding, TransportContext};
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    type Responder = Box<dyn FnMut(&Message) -> Vec<Vec<u8>> + Send>;

    /// Connection answering each request through a closure.
    struct Scripted {
        reliable: bool,
        sent: Arc<Mutex<Vec<Message>>>,
        incoming: VecDeque<Vec<u8>>,
        respond: Responder,
    }

    impl Connection for Scripted {
        fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
            if let Ok(Parsed::Complete(message, _)) = Message::parse(buf) {
                if message.is_request() {
                    self.incoming.extend((self.respond)(&message));
                }
                self.sent.lock().push(message);
            }
            Ok(buf.len())
        }

        fn recv(&mut self, buf: &mut [u8], wait: Duration) -> io::Result<usize> {
            match self.incoming.pop_front() {
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None => {
                    std::thread::sleep(wait);
                    Ok(0)
                }
            }
        }

        fn is_reliable(&self) -> bool {
            self.reliable
        }

        fn set_write_timeout(&mut self, _: Duration) -> io::Result<()> {
            Ok(())
        }

        fn peer_addr(&self) -> SocketAddr {
            SocketAddr::from(([127, 0, 0, 1], 554))
        }

        fn shutdown(&mut self) {}
    }

    fn reply(request: &Message, status: u16, extra: &str) -> Vec<u8> {
        format!(
            "RTSP/1.0 {} X\r\nCSeq: {}\r\n{}\r\n",
            status,
            request.cseq().unwrap_or_default(),
            extra
        )
        .into_bytes()
    }

    fn engine_with(
        config: ClientConfig,
        reliable: bool,
        respond: Responder,
    ) -> (TransactionEngine, Arc<Mutex<Vec<Message>>>, ContextTable) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let contexts = ContextTable::new();
        let mut engine = TransactionEngine::new(
            Arc::new(config),
            ControlProtocol::Tcp,
            Url::parse("rtsp://127.0.0.1/live").unwrap(),
            contexts.clone(),
            Arc::new(SharedLifecycle::new()),
        );
        engine.attach(Box::new(Scripted {
            reliable,
            sent: sent.clone(),
            incoming: VecDeque::new(),
            respond,
        }));
        (engine, sent, contexts)
    }

    fn quick() -> ClientConfig {
        ClientConfig {
            read_timeout: Duration::from_millis(20),
            max_timeout: Duration::from_millis(40),
            poll_interval: Duration::from_millis(5),
            auto_reconnect: false,
            ..ClientConfig::default()
        }
    }

    fn options() -> Message {
        Message::request(Method::Options, "rtsp://127.0.0.1/live")
    }

    #[test]
    fn fresh_requests_get_increasing_cseq() {
        let (mut engine, sent, _) =
            engine_with(quick(), true, Box::new(|req: &Message| vec![reply(req, 200, "Public: OPTIONS, GET_PARAMETER\r\n")]));
        engine.transact(options()).unwrap();
        engine.transact(options()).unwrap();
        let cseqs: Vec<_> = sent.lock().iter().map(|m| m.cseq()).collect();
        assert_eq!(cseqs, vec![Some(1), Some(2)]);
        assert!(engine.supported().contains(&Method::GetParameter));
        assert_eq!(engine.state(), ExchangeState::Completed);
    }

    #[test]
    fn unreliable_retransmit_reuses_cseq() {
        let mut seen = 0;
        let (mut engine, sent, _) = engine_with(
            quick(),
            false,
            Box::new(move |req: &Message| {
                seen += 1;
                if seen == 1 { vec![] } else { vec![reply(req, 200, "")] }
            }),
        );
        let response = engine.transact(options()).unwrap();
        assert_eq!(response.cseq(), Some(1));
        let cseqs: Vec<_> = sent.lock().iter().map(|m| m.cseq()).collect();
        assert_eq!(cseqs, vec![Some(1), Some(1)]);
        assert_eq!(engine.stats().retransmissions, 1);
    }

    #[test]
    fn reliable_connection_waits_without_retransmitting() {
        let (mut engine, sent, _) = engine_with(quick(), true, Box::new(|_: &Message| vec![]));
        assert!(engine.send(options(), true).unwrap().is_none());
        assert_eq!(sent.lock().len(), 1);

        let err = engine.transact(options()).unwrap_err();
        match err {
            RtspError::Timeout { cseq, attempts, .. } => {
                assert_eq!(cseq, 2);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(engine.state(), ExchangeState::Failed);
    }

    #[test]
    fn stale_response_is_discarded() {
        let (mut engine, _, _) = engine_with(
            quick(),
            true,
            Box::new(|req: &Message| {
                let stale = format!("RTSP/1.0 200 OK\r\nCSeq: {}\r\n\r\n", req.cseq().unwrap() + 40);
                vec![stale.into_bytes(), reply(req, 404, "")]
            }),
        );
        let response = engine.transact(options()).unwrap();
        assert_eq!(response.status(), Some(StatusCode::NOT_FOUND));
        assert_eq!(engine.stats().stale_responses, 1);
    }

    #[test]
    fn interleaved_frames_reach_their_context() {
        let (mut engine, _, contexts) = engine_with(
            quick(),
            true,
            Box::new(|req: &Message| {
                let rtp = Packet::new(9, 3000, 0xABCD, 96, true, vec![1u8, 2, 3]).to_bytes();
                let mut framed = vec![b'$', 0, 0, rtp.len() as u8];
                framed.extend_from_slice(&rtp);
                framed.extend_from_slice(&reply(req, 200, ""));
                vec![framed]
            }),
        );
        let context = Arc::new(TransportContext::new(
            "rtsp://127.0.0.1/live/track1".into(),
            MediaDescription::default(),
            ContextBinding::Interleaved { data: 0, control: Some(1) },
            1,
            Box::new(NoopDepacketizer),
            4,
            Duration::from_secs(1),
        ));
        contexts.add(context.clone());

        engine.transact(options()).unwrap();
        assert_eq!(context.activity().packets_received, 1);
        assert_eq!(context.remote_ssrc(), Some(0xABCD));
        assert_eq!(context.flush_frames().len(), 1);
    }

    #[test]
    fn pushed_teardown_is_answered_while_waiting() {
        let (mut engine, sent, _) = engine_with(
            quick(),
            true,
            Box::new(|req: &Message| {
                if req.is_response() {
                    return vec![];
                }
                let push = b"TEARDOWN rtsp://127.0.0.1/live RTSP/1.0\r\nCSeq: 90\r\nSession: s1\r\n\r\n".to_vec();
                vec![push, reply(req, 200, "")]
            }),
        );
        engine.transact(options()).unwrap();

        let sent = sent.lock();
        let answer = sent.iter().find(|m| m.is_response()).unwrap();
        assert_eq!(answer.status(), Some(StatusCode::OK));
        assert_eq!(answer.cseq(), Some(90));
        drop(sent);
        assert!(matches!(
            engine.take_events().as_slice(),
            [PushEvent::Teardown { session: Some(id), .. }] if id == "s1"
        ));
    }

    #[test]
    fn digest_challenge_resends_with_fresh_cseq() {
        let config = ClientConfig {
            credentials: Some(Credentials::new("Mufasa", "Circle Of Life")),
            ..quick()
        };
        let (mut engine, sent, _) = engine_with(
            config,
            true,
            Box::new(|req: &Message| {
                if req.has_header("Authorization") {
                    vec![reply(req, 200, "")]
                } else {
                    vec![reply(
                        req,
                        401,
                        "WWW-Authenticate: Digest realm=\"cam\", nonce=\"abc\", qop=\"auth\"\r\n",
                    )]
                }
            }),
        );
        let response = engine.transact(options()).unwrap();
        assert_eq!(response.status(), Some(StatusCode::OK));

        let sent = sent.lock();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].cseq(), Some(2));
        let authorization = sent[1].header("Authorization").unwrap();
        assert!(authorization.starts_with("Digest "));
        assert!(authorization.contains("username=\"Mufasa\""));
    }

    #[test]
    fn repeated_unauthorized_is_an_authentication_fault() {
        let config = ClientConfig {
            credentials: Some(Credentials::new("user", "wrong")),
            ..quick()
        };
        let (mut engine, sent, _) = engine_with(
            config,
            true,
            Box::new(|req: &Message| vec![reply(req, 401, "WWW-Authenticate: Basic realm=\"cam\"\r\n")]),
        );
        let err = engine.transact(options()).unwrap_err();
        assert!(matches!(err, RtspError::Authentication { .. }));
        assert_eq!(err.message().and_then(|m| m.status()), Some(StatusCode::UNAUTHORIZED));
        assert_eq!(sent.lock().len(), 2);
    }

    #[test]
    fn version_not_supported_adopts_server_version() {
        let (mut engine, sent, _) = engine_with(
            quick(),
            true,
            Box::new(|req: &Message| {
                if req.version == "RTSP/2.0" {
                    vec![format!("RTSP/2.0 200 OK\r\nCSeq: {}\r\n\r\n", req.cseq().unwrap()).into_bytes()]
                } else {
                    vec![format!("RTSP/2.0 505 X\r\nCSeq: {}\r\n\r\n", req.cseq().unwrap()).into_bytes()]
                }
            }),
        );
        let response = engine.transact(options()).unwrap();
        assert_eq!(response.status(), Some(StatusCode::OK));
        assert_eq!(engine.version(), "RTSP/2.0");
        assert_eq!(sent.lock()[1].version, "RTSP/2.0");
    }

    #[test]
    fn not_implemented_removes_method() {
        let (mut engine, _, _) = engine_with(
            quick(),
            true,
            Box::new(|req: &Message| match req.method() {
                Some(Method::Options) => vec![reply(req, 200, "Public: OPTIONS, GET_PARAMETER\r\n")],
                _ => vec![reply(req, 501, "")],
            }),
        );
        engine.transact(options()).unwrap();
        assert!(engine.supported().contains(&Method::GetParameter));
        engine
            .transact(Message::request(Method::GetParameter, "rtsp://127.0.0.1/live"))
            .unwrap();
        assert!(!engine.supported().contains(&Method::GetParameter));
    }

    #[test]
    fn session_header_is_applied_after_success() {
        let (mut engine, sent, _) = engine_with(
            quick(),
            true,
            Box::new(|req: &Message| vec![reply(req, 200, "Session: 4711;timeout=30\r\n")]),
        );
        engine.transact(options()).unwrap();
        assert_eq!(engine.session_timeout(), Duration::from_secs(30));
        engine.transact(options()).unwrap();
        assert_eq!(sent.lock()[1].header("Session"), Some("4711"));

        engine.clear_session();
        assert!(engine.session().is_none());
    }

    #[test]
    fn garbage_is_skipped() {
        let (mut engine, _, _) = engine_with(
            quick(),
            true,
            Box::new(|req: &Message| {
                let mut data = b"\x01\x02garbage line\r\n\r\n".to_vec();
                data.extend_from_slice(&reply(req, 200, ""));
                vec![data]
            }),
        );
        assert!(engine.transact(options()).is_ok());
    }

    #[test]
    fn rebase_keeps_track_suffix() {
        let from = Url::parse("rtsp://a/live").unwrap();
        let to = Url::parse("rtsp://b:8554/other").unwrap();
        assert_eq!(rebase("rtsp://a/live/track1", &from, &to), "rtsp://b:8554/other/track1");
        assert_eq!(rebase("rtsp://a/live", &from, &to), "rtsp://b:8554/other");
    }
}

use std::fmt;
use std::time::Duration;

use crate::media::{DepacketizerFactory, noop_factory};
use crate::protocol::Credentials;
use crate::session::DEFAULT_SESSION_TIMEOUT_SECS;
use crate::transport::{ControlProtocol, MediaTransport};

/// Client-level configuration used by the transaction engine, the transport
/// negotiator and the maintenance workers.
#[derive(Clone)]
pub struct ClientConfig {
    /// Control connection kind. When `None`, taken from the URL scheme.
    pub control: Option<ControlProtocol>,
    /// First transport offered in SETUP.
    pub media_transport: MediaTransport,
    /// When `None`, taken from the `user:pass@` part of the URL.
    pub credentials: Option<Credentials>,
    pub user_agent: String,
    pub send_user_agent: bool,
    /// Add a `Date` header to every request.
    pub date_requests: bool,
    /// Reconnect once and resend when the control connection resets.
    pub auto_reconnect: bool,
    /// Transmissions per request before giving up.
    pub max_attempts: u32,
    pub connect_timeout: Duration,
    /// Initial wait for a response; doubles on every unanswered attempt.
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Upper bound for the doubled read/write timeouts.
    pub max_timeout: Duration,
    /// Granularity of blocking socket polls.
    pub poll_interval: Duration,
    /// Assumed until the server announces one in a `Session` header.
    pub session_timeout: Duration,
    /// Receive buffer size; also the largest `Blocksize` accepted.
    pub buffer_size: usize,
    /// `Blocksize` requested in SETUP.
    pub blocksize: Option<usize>,
    /// Feature tags sent in `Require`.
    pub require: Vec<String>,
    /// Added to every request that does not already carry them.
    pub additional_headers: Vec<(String, String)>,
    /// Repeat `X-*` headers from responses on later requests.
    pub echo_x_headers: bool,
    pub keep_alive: bool,
    /// When `None`, half the session timeout.
    pub keep_alive_interval: Option<Duration>,
    /// Step down the transport ladder when no media arrives.
    pub alternate_transport: bool,
    pub monitor_interval: Duration,
    pub max_redirects: u32,
    /// First local port probed for UDP media.
    pub first_udp_port: u16,
    /// How long a stream may stay silent after SETUP before it counts as
    /// stalled.
    pub receive_interval: Duration,
    /// Frames kept per stream while waiting for missing packets.
    pub max_pending_frames: usize,
    pub depacketizer: DepacketizerFactory,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            control: None,
            media_transport: MediaTransport::default(),
            credentials: None,
            user_agent: format!("rtsp-client/{}", env!("CARGO_PKG_VERSION")),
            send_user_agent: true,
            date_requests: false,
            auto_reconnect: true,
            max_attempts: 3,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(2),
            write_timeout: Duration::from_secs(2),
            max_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(20),
            session_timeout: Duration::from_secs(DEFAULT_SESSION_TIMEOUT_SECS),
            buffer_size: 64 * 1024,
            blocksize: None,
            require: Vec::new(),
            additional_headers: Vec::new(),
            echo_x_headers: false,
            keep_alive: true,
            keep_alive_interval: None,
            alternate_transport: true,
            monitor_interval: Duration::from_secs(1),
            max_redirects: 5,
            first_udp_port: 10000,
            receive_interval: Duration::from_secs(5),
            max_pending_frames: 16,
            depacketizer: noop_factory(),
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("control", &self.control)
            .field("media_transport", &self.media_transport)
            .field("credentials", &self.credentials)
            .field("user_agent", &self.user_agent)
            .field("auto_reconnect", &self.auto_reconnect)
            .field("max_attempts", &self.max_attempts)
            .field("read_timeout", &self.read_timeout)
            .field("max_timeout", &self.max_timeout)
            .field("session_timeout", &self.session_timeout)
            .field("keep_alive", &self.keep_alive)
            .field("alternate_transport", &self.alternate_transport)
            .finish_non_exhaustive()
    }
}

//! Network transport layer for RTSP signaling and RTP media reception.
//!
//! RTSP uses a split transport model:
//!
//! - **Control connection** ([`Connection`]): carries requests and
//!   responses. Either a TCP stream ([`tcp`]), a UDP datagram socket
//!   ([`udp`], `rtspu://`), or an HTTP tunnel ([`http`]) made of a GET leg
//!   for responses and a POST leg for base64-encoded requests.
//!
//! - **Media** ([`TransportContext`]): RTP/RTCP per negotiated stream,
//!   either interleaved on the TCP control connection using `$` framing
//!   (RFC 2326 §10.12) or on local UDP sockets (unicast or multicast).
//!
//! All I/O is blocking with bounded read timeouts; callers poll.

pub mod context;
pub mod http;
pub mod tcp;
pub mod udp;

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use url::Url;

use crate::error::{Result, RtspError};
pub use context::{Activity, ContextBinding, ContextTable, TransportContext};

/// How requests reach the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControlProtocol {
    #[default]
    Tcp,
    Udp,
    Http,
}

impl ControlProtocol {
    /// Protocol implied by the URL scheme (`rtspu` → UDP, `http` → tunnel).
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "rtsp" | "rtspt" => Some(Self::Tcp),
            "rtspu" => Some(Self::Udp),
            "http" | "rtsph" => Some(Self::Http),
            _ => None,
        }
    }
}

/// How media is requested in SETUP, from most to least reliable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MediaTransport {
    /// RTP/AVP/TCP interleaved on the control connection.
    Interleaved,
    /// RTP/AVP over UDP with an RTCP port (or muxed RTCP).
    #[default]
    Udp,
    /// RTP/AVP over UDP on a single port, no RTCP.
    Raw,
}

impl MediaTransport {
    /// Ladder order used when a transport delivers nothing.
    pub const LADDER: [MediaTransport; 3] = [Self::Interleaved, Self::Udp, Self::Raw];

    /// Next rung not yet tried, skipping `self`.
    pub fn step_down(self, tried: &[MediaTransport]) -> Option<MediaTransport> {
        Self::LADDER
            .into_iter()
            .find(|t| *t != self && !tried.contains(t))
    }

    pub fn is_reliable(self) -> bool {
        self == Self::Interleaved
    }
}

/// A control connection to the server.
pub trait Connection: Send {
    /// Write some of `buf`; returns how much was taken.
    fn send(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Read into `buf`, waiting at most `wait`. `Ok(0)` means nothing
    /// arrived; a closed peer is an error.
    fn recv(&mut self, buf: &mut [u8], wait: Duration) -> io::Result<usize>;

    /// Whether lost requests must be retransmitted by the sender.
    fn is_reliable(&self) -> bool;

    fn set_write_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    fn peer_addr(&self) -> SocketAddr;

    fn shutdown(&mut self);
}

/// Default port for a locator's scheme.
pub fn default_port(scheme: &str) -> u16 {
    match scheme.to_ascii_lowercase().as_str() {
        "http" | "rtsph" => 80,
        "rtsps" => 322,
        _ => 554,
    }
}

/// Resolve the server address of a locator.
pub fn resolve(location: &Url) -> Result<SocketAddr> {
    let host = location
        .host_str()
        .ok_or_else(|| RtspError::InvalidLocation(location.to_string()))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let port = location.port().unwrap_or_else(|| default_port(location.scheme()));
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| RtspError::InvalidLocation(location.to_string()))
}

/// Open a control connection of the given kind.
pub fn connect(
    protocol: ControlProtocol,
    location: &Url,
    timeout: Duration,
) -> Result<Box<dyn Connection>> {
    let addr = resolve(location)?;
    tracing::debug!(%addr, ?protocol, "connecting");
    let connection: Box<dyn Connection> = match protocol {
        ControlProtocol::Tcp => Box::new(tcp::TcpConnection::connect(addr, timeout)?),
        ControlProtocol::Udp => Box::new(udp::UdpConnection::connect(addr)?),
        ControlProtocol::Http => Box::new(http::HttpTunnel::connect(addr, location, timeout)?),
    };
    Ok(connection)
}

/// Errors that only mean "nothing yet".
pub(crate) fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

/// Errors after which the connection is unusable but may be re-established.
pub(crate) fn is_reset(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionRefused
    )
}

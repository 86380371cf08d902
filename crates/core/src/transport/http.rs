//! RTSP tunnelled over HTTP.
//!
//! Two HTTP connections share a random `x-sessioncookie`:
//!
//! ```text
//! GET  /stream HTTP/1.0          ← server → client: raw RTSP responses
//! POST /stream HTTP/1.0          → client → server: base64 RTSP requests
//! ```
//!
//! The GET leg stays open for the life of the tunnel; its HTTP response
//! head is consumed during connect and everything after it is RTSP.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use base64::Engine;
use url::Url;

use super::{Connection, is_transient};

const TUNNEL_CONTENT_TYPE: &str = "application/x-rtsp-tunnelled";

pub struct HttpTunnel {
    get: TcpStream,
    post: TcpStream,
    peer_addr: SocketAddr,
    /// RTSP bytes that arrived together with the GET response head.
    pending: Vec<u8>,
}

impl HttpTunnel {
    pub fn connect(addr: SocketAddr, location: &Url, timeout: Duration) -> io::Result<Self> {
        let cookie = format!("{:016x}", rand::random::<u64>());
        let path = match location.query() {
            Some(query) => format!("{}?{}", location.path(), query),
            None => location.path().to_string(),
        };
        let path = if path.is_empty() { "/".to_string() } else { path };

        let mut get = TcpStream::connect_timeout(&addr, timeout)?;
        get.set_nodelay(true)?;
        get.set_write_timeout(Some(timeout))?;
        let request = format!(
            "GET {path} HTTP/1.0\r\n\
             x-sessioncookie: {cookie}\r\n\
             Accept: {TUNNEL_CONTENT_TYPE}\r\n\
             Pragma: no-cache\r\n\
             Cache-Control: no-cache\r\n\r\n"
        );
        get.write_all(request.as_bytes())?;
        let pending = read_http_head(&mut get, timeout)?;

        let mut post = TcpStream::connect_timeout(&addr, timeout)?;
        post.set_nodelay(true)?;
        post.set_write_timeout(Some(timeout))?;
        let request = format!(
            "POST {path} HTTP/1.0\r\n\
             x-sessioncookie: {cookie}\r\n\
             Content-Type: {TUNNEL_CONTENT_TYPE}\r\n\
             Pragma: no-cache\r\n\
             Cache-Control: no-cache\r\n\
             Content-Length: 32767\r\n\
             Expires: Sun, 9 Jan 1972 00:00:00 GMT\r\n\r\n"
        );
        post.write_all(request.as_bytes())?;

        tracing::info!(peer_addr = %addr, "HTTP tunnel established");
        Ok(HttpTunnel {
            get,
            post,
            peer_addr: addr,
            pending,
        })
    }
}

/// Read the GET leg's response head; fail unless it is `200`. Returns any
/// bytes read past the head.
fn read_http_head(stream: &mut TcpStream, timeout: Duration) -> io::Result<Vec<u8>> {
    let deadline = Instant::now() + timeout;
    let mut head = Vec::new();
    let mut chunk = [0u8; 1024];

    let end = loop {
        if let Some(pos) = head.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no tunnel response"));
        }
        stream.set_read_timeout(Some(remaining))?;
        match stream.read(&mut chunk) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "tunnel closed during handshake",
                ));
            }
            Ok(n) => head.extend_from_slice(&chunk[..n]),
            Err(ref e) if is_transient(e) => {}
            Err(e) => return Err(e),
        }
    };

    let status_line = String::from_utf8_lossy(&head[..end]);
    let ok = status_line
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .is_some_and(|code| code == "200");
    if !ok {
        return Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!(
                "tunnel refused: {}",
                status_line.lines().next().unwrap_or_default()
            ),
        ));
    }
    Ok(head.split_off(end))
}

impl Connection for HttpTunnel {
    /// The whole buffer is encoded and written; partial base64 chunks would
    /// corrupt the stream.
    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(buf);
        self.post.write_all(encoded.as_bytes())?;
        self.post.flush()?;
        Ok(buf.len())
    }

    fn recv(&mut self, buf: &mut [u8], wait: Duration) -> io::Result<usize> {
        if !self.pending.is_empty() {
            let n = self.pending.len().min(buf.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            return Ok(n);
        }
        self.get
            .set_read_timeout(Some(wait.max(Duration::from_millis(1))))?;
        match self.get.read(buf) {
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "tunnel closed by server",
            )),
            Ok(n) => Ok(n),
            Err(ref e) if is_transient(e) => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn is_reliable(&self) -> bool {
        true
    }

    fn set_write_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.post
            .set_write_timeout(Some(timeout.max(Duration::from_millis(1))))
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn shutdown(&mut self) {
        let _ = self.post.shutdown(Shutdown::Both);
        let _ = self.get.shutdown(Shutdown::Both);
        tracing::debug!(peer_addr = %self.peer_addr, "HTTP tunnel closed");
    }
}

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

use super::{Connection, is_transient};

/// Persistent TCP control connection.
///
/// Interleaved RTP shares this stream; demultiplexing happens in the
/// transaction engine, which owns the receive buffer.
pub struct TcpConnection {
    stream: TcpStream,
    peer_addr: SocketAddr,
}

impl TcpConnection {
    pub fn connect(addr: SocketAddr, timeout: Duration) -> io::Result<Self> {
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_nodelay(true)?;
        stream.set_write_timeout(Some(timeout))?;
        tracing::info!(peer_addr = %addr, "control connection established");
        Ok(TcpConnection {
            stream,
            peer_addr: addr,
        })
    }
}

impl Connection for TcpConnection {
    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.stream.write(buf)?;
        self.stream.flush()?;
        Ok(n)
    }

    fn recv(&mut self, buf: &mut [u8], wait: Duration) -> io::Result<usize> {
        self.stream
            .set_read_timeout(Some(wait.max(Duration::from_millis(1))))?;
        match self.stream.read(buf) {
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "connection closed by server",
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
        self.stream.set_write_timeout(Some(timeout.max(Duration::from_millis(1))))
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn shutdown(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
        tracing::debug!(peer_addr = %self.peer_addr, "control connection closed");
    }
}

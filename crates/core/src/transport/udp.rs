use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use crate::error::{Result, RtspError};

use super::{Connection, is_transient};

/// Highest port the probe will try for RTP.
const PORT_MAX: u16 = 65534;

/// UDP control connection (`rtspu://`, RFC 2326 §10.1).
///
/// Unreliable: the transaction engine retransmits requests that go
/// unanswered.
pub struct UdpConnection {
    socket: UdpSocket,
    peer_addr: SocketAddr,
}

impl UdpConnection {
    pub fn connect(peer_addr: SocketAddr) -> io::Result<Self> {
        let bind: SocketAddr = match peer_addr {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind)?;
        socket.connect(peer_addr)?;
        tracing::info!(%peer_addr, "datagram control channel ready");
        Ok(UdpConnection { socket, peer_addr })
    }
}

impl Connection for UdpConnection {
    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.socket.send(buf)
    }

    fn recv(&mut self, buf: &mut [u8], wait: Duration) -> io::Result<usize> {
        self.socket
            .set_read_timeout(Some(wait.max(Duration::from_millis(1))))?;
        match self.socket.recv(buf) {
            Ok(n) => Ok(n),
            Err(ref e) if is_transient(e) => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn is_reliable(&self) -> bool {
        false
    }

    fn set_write_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.socket
            .set_write_timeout(Some(timeout.max(Duration::from_millis(1))))
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn shutdown(&mut self) {}
}

/// Bind local RTP (and unless `rtcp` is false, RTCP on the next port)
/// sockets, probing even ports upward from `first`.
///
/// Ports are probed by binding, and the bound sockets are returned, so no
/// other process can take them between probe and use.
pub fn bind_rtp_ports(first: u16, rtcp: bool) -> Result<(UdpSocket, Option<UdpSocket>)> {
    let mut port = first.max(1024);
    if port % 2 == 1 {
        port += 1;
    }

    while port <= PORT_MAX {
        if let Ok(rtp) = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)) {
            if !rtcp {
                tracing::trace!(rtp_port = port, "bound RTP port");
                return Ok((rtp, None));
            }
            if let Ok(rtcp) = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port + 1)) {
                tracing::trace!(rtp_port = port, rtcp_port = port + 1, "bound RTP/RTCP ports");
                return Ok((rtp, Some(rtcp)));
            }
        }
        port = match port.checked_add(2) {
            Some(next) => next,
            None => break,
        };
    }

    tracing::warn!(first, "no free local RTP port pair");
    Err(RtspError::PortRangeExhausted)
}

/// Bind `port` and join `group` (RFC 2326 §12.39 `multicast`).
pub fn join_multicast(group: IpAddr, port: u16, ttl: Option<u8>) -> io::Result<UdpSocket> {
    let socket = match group {
        IpAddr::V4(group) => {
            let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
            socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
            if let Some(ttl) = ttl {
                socket.set_multicast_ttl_v4(ttl as u32)?;
            }
            socket
        }
        IpAddr::V6(group) => {
            let socket = UdpSocket::bind((Ipv6Addr::UNSPECIFIED, port))?;
            socket.join_multicast_v6(&group, 0)?;
            socket
        }
    };
    tracing::info!(%group, port, "joined multicast group");
    Ok(socket)
}

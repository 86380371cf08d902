use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::error::{Result, RtspError};
use crate::lifecycle::SharedLifecycle;
use crate::media::{Depacketizer, Frame, FrameAssembler, Packet};
use crate::protocol::sdp::MediaDescription;

/// Where a stream's RTP and RTCP arrive.
#[derive(Debug)]
pub enum ContextBinding {
    /// `$`-framed on the control connection (RFC 2326 §10.12).
    Interleaved { data: u8, control: Option<u8> },
    /// Unicast datagrams on local sockets.
    Udp {
        rtp: UdpSocket,
        rtcp: Option<UdpSocket>,
        remote_rtp: Option<SocketAddr>,
        remote_rtcp: Option<SocketAddr>,
    },
    /// Datagrams sent to a joined multicast group.
    Multicast {
        rtp: UdpSocket,
        rtcp: Option<UdpSocket>,
        group: IpAddr,
        ttl: Option<u8>,
    },
}

/// Counters and timestamps for one stream.
#[derive(Debug, Clone, Copy)]
pub struct Activity {
    pub activated: Instant,
    pub last_sent: Option<Instant>,
    pub last_received: Option<Instant>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub rtcp_bytes_received: u64,
    pub invalid_packets: u64,
}

/// Transport state for one negotiated media stream.
///
/// Created by SETUP and owned by exactly one
/// [`Session`](crate::session::Session); closed on teardown or when the
/// transport is re-negotiated.
#[derive(Debug)]
pub struct TransportContext {
    /// Location SETUP was sent to for this stream.
    pub control: String,
    pub media: MediaDescription,
    binding: ContextBinding,
    local_ssrc: u32,
    remote_ssrc: RwLock<Option<u32>>,
    receive_interval: Duration,
    range: RwLock<(Option<Duration>, Option<Duration>)>,
    activity: Mutex<Activity>,
    assembler: Mutex<FrameAssembler>,
    state: SharedLifecycle,
}

impl TransportContext {
    pub fn new(
        control: String,
        media: MediaDescription,
        binding: ContextBinding,
        local_ssrc: u32,
        depacketizer: Box<dyn Depacketizer>,
        max_pending_frames: usize,
        receive_interval: Duration,
    ) -> Self {
        TransportContext {
            control,
            media,
            binding,
            local_ssrc,
            remote_ssrc: RwLock::new(None),
            receive_interval,
            range: RwLock::new((None, None)),
            activity: Mutex::new(Activity {
                activated: Instant::now(),
                last_sent: None,
                last_received: None,
                bytes_sent: 0,
                bytes_received: 0,
                packets_sent: 0,
                packets_received: 0,
                rtcp_bytes_received: 0,
                invalid_packets: 0,
            }),
            assembler: Mutex::new(FrameAssembler::new(depacketizer, max_pending_frames)),
            state: SharedLifecycle::new(),
        }
    }

    pub fn binding(&self) -> &ContextBinding {
        &self.binding
    }

    /// `(data, control)` channels when interleaved.
    pub fn channels(&self) -> Option<(u8, Option<u8>)> {
        match self.binding {
            ContextBinding::Interleaved { data, control } => Some((data, control)),
            _ => None,
        }
    }

    pub fn is_interleaved(&self) -> bool {
        self.channels().is_some()
    }

    pub fn is_multicast(&self) -> bool {
        matches!(self.binding, ContextBinding::Multicast { .. })
    }

    /// Local RTP and RTCP ports of a socket binding.
    pub fn local_ports(&self) -> Option<(u16, Option<u16>)> {
        let (rtp, rtcp) = match &self.binding {
            ContextBinding::Udp { rtp, rtcp, .. } | ContextBinding::Multicast { rtp, rtcp, .. } => {
                (rtp, rtcp)
            }
            ContextBinding::Interleaved { .. } => return None,
        };
        let rtp_port = rtp.local_addr().ok()?.port();
        let rtcp_port = rtcp
            .as_ref()
            .and_then(|s| s.local_addr().ok())
            .map(|a| a.port());
        Some((rtp_port, rtcp_port))
    }

    pub fn local_ssrc(&self) -> u32 {
        self.local_ssrc
    }

    pub fn remote_ssrc(&self) -> Option<u32> {
        *self.remote_ssrc.read()
    }

    pub fn set_remote_ssrc(&self, ssrc: u32) {
        tracing::debug!(control = %self.control, ssrc = format_args!("{:#010X}", ssrc), "remote SSRC bound");
        *self.remote_ssrc.write() = Some(ssrc);
    }

    /// Play range bounds reported by the server.
    pub fn set_range(&self, start: Option<Duration>, end: Option<Duration>) {
        *self.range.write() = (start, end);
    }

    pub fn media_end(&self) -> Option<Duration> {
        self.range.read().1
    }

    pub fn receive_interval(&self) -> Duration {
        self.receive_interval
    }

    pub fn activity(&self) -> Activity {
        *self.activity.lock()
    }

    /// Whether any media has moved in either direction.
    pub fn has_flow(&self) -> bool {
        let activity = self.activity.lock();
        activity.bytes_received > 0 || activity.bytes_sent > 0
    }

    /// No flow yet and the expected receive interval has passed.
    pub fn is_stalled(&self) -> bool {
        !self.has_flow() && self.activity.lock().activated.elapsed() > self.receive_interval
    }

    /// Feed one RTP packet. Returns false if it was not valid RTP or
    /// belongs to another source.
    pub fn ingest_rtp(&self, data: Bytes) -> bool {
        if !self.state.is_active() {
            return false;
        }
        let len = data.len() as u64;
        let packet = match Packet::parse(data) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::trace!(control = %self.control, error = %e, "invalid RTP dropped");
                self.activity.lock().invalid_packets += 1;
                return false;
            }
        };

        {
            let mut activity = self.activity.lock();
            activity.bytes_received += len;
            activity.packets_received += 1;
            activity.last_received = Some(Instant::now());
        }

        match self.remote_ssrc() {
            None => self.set_remote_ssrc(packet.ssrc()),
            Some(ssrc) if ssrc != packet.ssrc() => {
                tracing::trace!(control = %self.control, ssrc = packet.ssrc(), "foreign SSRC dropped");
                return false;
            }
            Some(_) => {}
        }

        tracing::trace!(
            control = %self.control,
            seq = packet.sequence_number(),
            timestamp = packet.timestamp(),
            marker = packet.marker(),
            "rtp"
        );
        self.assembler.lock().push(packet);
        true
    }

    /// RTCP is only counted.
    pub fn ingest_rtcp(&self, data: &[u8]) {
        let mut activity = self.activity.lock();
        activity.rtcp_bytes_received += data.len() as u64;
        activity.bytes_received += data.len() as u64;
        activity.last_received = Some(Instant::now());
    }

    /// Read whatever is waiting on the context's sockets, waiting at most
    /// `wait` on the RTP socket. Returns the number of datagrams taken.
    pub fn poll_sockets(&self, buf: &mut [u8], wait: Duration) -> io::Result<usize> {
        let (rtp, rtcp) = match &self.binding {
            ContextBinding::Udp { rtp, rtcp, .. } | ContextBinding::Multicast { rtp, rtcp, .. } => {
                (rtp, rtcp)
            }
            ContextBinding::Interleaved { .. } => return Ok(0),
        };
        if !self.state.is_active() {
            return Ok(0);
        }

        let mut taken = 0;
        rtp.set_read_timeout(Some(wait.max(Duration::from_millis(1))))?;
        match rtp.recv_from(buf) {
            Ok((n, _)) => {
                taken += 1;
                self.route_datagram(Bytes::copy_from_slice(&buf[..n]));
            }
            Err(e) if super::is_transient(&e) => {}
            Err(e) => return Err(e),
        }

        if let Some(rtcp) = rtcp {
            rtcp.set_nonblocking(true)?;
            loop {
                match rtcp.recv_from(buf) {
                    Ok((n, _)) => {
                        taken += 1;
                        self.ingest_rtcp(&buf[..n]);
                    }
                    Err(e) if super::is_transient(&e) => break,
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(taken)
    }

    /// With RTCP muxed on the RTP port, payload types 72–76 (with the
    /// marker bit set) are RTCP (RFC 5761 §4).
    fn route_datagram(&self, data: Bytes) {
        let muxed_rtcp = data.len() >= 2 && (200..=204).contains(&data[1]);
        if muxed_rtcp {
            self.ingest_rtcp(&data);
        } else {
            self.ingest_rtp(data);
        }
    }

    /// Completed (and released incomplete) frames, oldest first.
    pub fn drain_frames(&self) -> Vec<Frame> {
        self.assembler.lock().drain()
    }

    /// Hand out pending frames too.
    pub fn flush_frames(&self) -> Vec<Frame> {
        let mut assembler = self.assembler.lock();
        assembler.flush();
        assembler.drain()
    }

    pub fn dropped_packets(&self) -> u64 {
        self.assembler.lock().dropped_packets()
    }

    pub fn is_closed(&self) -> bool {
        !self.state.is_active()
    }

    /// Stop accepting media and leave any multicast group.
    pub fn close(&self) {
        if !self.state.begin_close() {
            return;
        }
        if let ContextBinding::Multicast { rtp, group, .. } = &self.binding {
            let left = match group {
                IpAddr::V4(g) => rtp.leave_multicast_v4(g, &std::net::Ipv4Addr::UNSPECIFIED),
                IpAddr::V6(g) => rtp.leave_multicast_v6(g, 0),
            };
            if let Err(e) = left {
                tracing::debug!(error = %e, "leaving multicast group failed");
            }
        }
        self.state.finish_close();
        tracing::debug!(control = %self.control, "transport context closed");
    }
}

/// Every live [`TransportContext`] of a client, for routing received data.
#[derive(Debug, Clone, Default)]
pub struct ContextTable {
    contexts: Arc<RwLock<Vec<Arc<TransportContext>>>>,
}

impl ContextTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, context: Arc<TransportContext>) {
        self.contexts.write().push(context);
    }

    pub fn all(&self) -> Vec<Arc<TransportContext>> {
        self.contexts.read().clone()
    }

    pub fn len(&self) -> usize {
        self.contexts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.read().is_empty()
    }

    pub fn last(&self) -> Option<Arc<TransportContext>> {
        self.contexts.read().last().cloned()
    }

    pub fn by_control(&self, control: &str) -> Option<Arc<TransportContext>> {
        self.contexts
            .read()
            .iter()
            .find(|c| c.control == control)
            .cloned()
    }

    pub fn by_remote_ssrc(&self, ssrc: u32) -> Option<Arc<TransportContext>> {
        self.contexts
            .read()
            .iter()
            .find(|c| c.remote_ssrc() == Some(ssrc))
            .cloned()
    }

    /// Next interleaved channel pair: one past the previous context's
    /// highest channel, starting at `0-1`. Fails once channel 255 is taken.
    pub fn next_channels(&self, rtcp_mux: bool) -> Result<(u8, Option<u8>)> {
        let data = self
            .contexts
            .read()
            .iter()
            .filter_map(|c| c.channels())
            .map(|(data, control)| u16::from(control.unwrap_or(data)) + 1)
            .max()
            .unwrap_or(0);
        let last = if rtcp_mux { data } else { data + 1 };
        match (u8::try_from(data), u8::try_from(last)) {
            (Ok(data), Ok(last)) => Ok((data, Some(last))),
            _ => Err(RtspError::negotiation("interleaved channels exhausted", None)),
        }
    }

    /// First local port to probe: past the highest port in use, or `first`.
    pub fn next_port(&self, first: u16) -> u16 {
        self.contexts
            .read()
            .iter()
            .filter_map(|c| c.local_ports())
            .map(|(rtp, rtcp)| rtcp.unwrap_or(rtp).saturating_add(1))
            .max()
            .unwrap_or(first)
            .max(first)
    }

    /// Route one `$` frame from the control connection.
    pub fn route_interleaved(&self, channel: u8, payload: Bytes) -> bool {
        let contexts = self.contexts.read();
        for context in contexts.iter() {
            let Some((data, control)) = context.channels() else {
                continue;
            };
            if channel == data {
                context.route_datagram(payload);
                return true;
            }
            if Some(channel) == control {
                context.ingest_rtcp(&payload);
                return true;
            }
        }
        tracing::trace!(channel, len = payload.len(), "interleaved data for unknown channel");
        false
    }

    pub fn remove(&self, context: &Arc<TransportContext>) {
        context.close();
        self.contexts.write().retain(|c| !Arc::ptr_eq(c, context));
    }

    /// Close and forget every context.
    pub fn clear(&self) {
        let drained: Vec<_> = self.contexts.write().drain(..).collect();
        for context in drained {
            context.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::Passthrough;
    use crate::media::test_support::PacketStream;

    fn interleaved(data: u8, control: Option<u8>) -> Arc<TransportContext> {
        Arc::new(TransportContext::new(
            format!("rtsp://cam/s/track{data}"),
            MediaDescription::default(),
            ContextBinding::Interleaved { data, control },
            7,
            Box::new(Passthrough),
            4,
            Duration::from_millis(10),
        ))
    }

    #[test]
    fn channel_pairs_follow_previous_context() {
        let table = ContextTable::new();
        assert_eq!(table.next_channels(false).unwrap(), (0, Some(1)));
        table.add(interleaved(0, Some(1)));
        assert_eq!(table.next_channels(false).unwrap(), (2, Some(3)));
        table.add(interleaved(2, Some(2)));
        assert_eq!(table.next_channels(true).unwrap(), (3, Some(3)));
    }

    #[test]
    fn channel_space_runs_out() {
        let table = ContextTable::new();
        table.add(interleaved(253, Some(254)));
        assert_eq!(table.next_channels(true).unwrap(), (255, Some(255)));
        assert!(matches!(
            table.next_channels(false),
            Err(RtspError::Negotiation { .. })
        ));
        table.add(interleaved(255, None));
        assert!(table.next_channels(true).is_err());
    }

    #[test]
    fn routes_rtp_and_rtcp_by_channel() {
        let table = ContextTable::new();
        let ctx = interleaved(0, Some(1));
        table.add(ctx.clone());

        let mut rtp = PacketStream::new(96, 0xCAFE);
        let packet = rtp.next_packet(true, vec![1, 2, 3]).to_bytes();
        assert!(table.route_interleaved(0, Bytes::from(packet)));
        assert!(table.route_interleaved(1, Bytes::from_static(&[0x80, 200, 0, 1])));
        assert!(!table.route_interleaved(9, Bytes::new()));

        let activity = ctx.activity();
        assert_eq!(activity.packets_received, 1);
        assert_eq!(activity.rtcp_bytes_received, 4);
        assert_eq!(ctx.remote_ssrc(), Some(0xCAFE));

        let mut frames = ctx.flush_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].buffer().unwrap()[..], &[1, 2, 3]);
    }

    #[test]
    fn foreign_ssrc_is_dropped() {
        let ctx = interleaved(0, Some(1));
        ctx.set_remote_ssrc(1);
        let packet = PacketStream::new(96, 2).next_packet(true, vec![0]).to_bytes();
        assert!(!ctx.ingest_rtp(Bytes::from(packet)));
    }

    #[test]
    fn stall_detection() {
        let ctx = interleaved(0, Some(1));
        assert!(!ctx.is_stalled());
        std::thread::sleep(Duration::from_millis(20));
        assert!(ctx.is_stalled());
        ctx.ingest_rtcp(&[0; 8]);
        assert!(!ctx.is_stalled());
    }

    #[test]
    fn udp_context_receives_datagrams() {
        let rtp_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = rtp_socket.local_addr().unwrap().port();
        let ctx = TransportContext::new(
            "rtsp://cam/s/track1".to_string(),
            MediaDescription::default(),
            ContextBinding::Udp {
                rtp: rtp_socket,
                rtcp: None,
                remote_rtp: None,
                remote_rtcp: None,
            },
            7,
            Box::new(Passthrough),
            4,
            Duration::from_secs(1),
        );

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        let packet = PacketStream::new(96, 5).next_packet(true, vec![42]).to_bytes();
        sender.send_to(&packet, ("127.0.0.1", port)).unwrap();

        let mut buf = vec![0u8; 2048];
        assert_eq!(ctx.poll_sockets(&mut buf, Duration::from_secs(1)).unwrap(), 1);
        assert_eq!(ctx.flush_frames().len(), 1);
        assert_eq!(ctx.local_ports(), Some((port, None)));
    }

    #[test]
    fn closed_context_ignores_media() {
        let table = ContextTable::new();
        let ctx = interleaved(0, Some(1));
        table.add(ctx.clone());
        table.clear();
        assert!(ctx.is_closed());
        assert!(table.is_empty());
        let packet = PacketStream::new(96, 5).next_packet(true, vec![0]).to_bytes();
        assert!(!ctx.ingest_rtp(Bytes::from(packet)));
    }
}

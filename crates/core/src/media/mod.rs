//! RTP packets, frame reassembly and depacketization.
//!
//! ## Receive path
//!
//! ```text
//! socket / interleaved frame
//!   → rtp::Packet::parse
//!   → FrameAssembler::push      (groups packets by SSRC + timestamp)
//!   → Frame::add                (circular sequence order, gap tracking)
//!   → Frame::depacketize        (payload-specific Depacketizer)
//!   → Frame::buffer             (concatenated payload)
//! ```
//!
//! A frame is complete once it has no sequence gaps and holds a packet with
//! the marker bit set (RFC 3550 §5.1). Payload formats plug in through the
//! [`Depacketizer`] trait; the default implementation yields nothing.

pub mod assembler;
pub mod frame;
pub mod rtp;
#[cfg(test)]
pub(crate) mod test_support;

use std::sync::Arc;

use bytes::Bytes;

pub use assembler::FrameAssembler;
pub use frame::{Frame, Segment};
pub use rtp::{Packet, Release};

use crate::protocol::sdp::MediaDescription;

/// One decodable unit extracted from a packet.
#[derive(Debug, Clone)]
pub struct Unit {
    pub data: Bytes,
    pub release: Release,
}

impl Unit {
    pub fn new(data: Bytes) -> Self {
        Unit {
            data,
            release: Release::Frame,
        }
    }

    pub fn with_release(mut self, release: Release) -> Self {
        self.release = release;
        self
    }
}

/// Payload-format specific depacketization.
///
/// Returned units are stored in the frame in the order given, after the
/// units of every packet that precedes this one in sequence order.
pub trait Depacketizer: Send {
    fn depacketize(&mut self, packet: &Packet) -> Vec<Unit> {
        let _ = packet;
        Vec::new()
    }
}

/// Yields nothing. Frames still track ordering and completeness.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDepacketizer;

impl Depacketizer for NoopDepacketizer {}

/// Emits each payload unchanged as a single unit.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl Depacketizer for Passthrough {
    fn depacketize(&mut self, packet: &Packet) -> Vec<Unit> {
        vec![Unit::new(packet.payload().clone())]
    }
}

/// Creates the depacketizer for a negotiated media stream.
pub type DepacketizerFactory = Arc<dyn Fn(&MediaDescription) -> Box<dyn Depacketizer> + Send + Sync>;

/// Factory that always returns [`NoopDepacketizer`].
pub fn noop_factory() -> DepacketizerFactory {
    Arc::new(|_| Box::new(NoopDepacketizer))
}

/// Factory that always returns [`Passthrough`].
pub fn passthrough_factory() -> DepacketizerFactory {
    Arc::new(|_| Box::new(Passthrough))
}

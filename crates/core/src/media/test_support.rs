use bytes::Bytes;

use super::Packet;

/// Running sequence number and timestamp of one synthetic RTP stream.
#[derive(Debug)]
pub struct PacketStream {
    payload_type: u8,
    ssrc: u32,
    sequence: u16,
    timestamp: u32,
}

impl PacketStream {
    pub fn new(payload_type: u8, ssrc: u32) -> Self {
        PacketStream {
            payload_type,
            ssrc,
            sequence: 0,
            timestamp: 0,
        }
    }

    pub fn starting_at(mut self, sequence: u16) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn next_packet(&mut self, marker: bool, payload: impl Into<Bytes>) -> Packet {
        let packet = Packet::new(
            self.sequence,
            self.timestamp,
            self.ssrc,
            self.payload_type,
            marker,
            payload,
        );
        self.sequence = self.sequence.wrapping_add(1);
        packet
    }

    pub fn advance_timestamp(&mut self, increment: u32) {
        self.timestamp = self.timestamp.wrapping_add(increment);
    }
}

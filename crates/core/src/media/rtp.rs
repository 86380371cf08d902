use bytes::Bytes;

use crate::error::{ParseErrorKind, Result, RtspError};

/// RTP fixed header (RFC 3550 §5.1).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             SSRC                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
pub const FIXED_HEADER_LEN: usize = 12;

/// Who frees a payload view once its frame lets go of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Release {
    /// The frame drops the bytes when the packet (or segment) is removed.
    #[default]
    Frame,
    /// The caller keeps the bytes alive; only a forced release drops them.
    Caller,
}

/// A received RTP packet.
///
/// The payload is a reference-counted view into the datagram or interleaved
/// frame it arrived in, so splitting it off the receive buffer is free.
#[derive(Debug, Clone)]
pub struct Packet {
    marker: bool,
    payload_type: u8,
    sequence_number: u16,
    timestamp: u32,
    ssrc: u32,
    csrc: Vec<u32>,
    payload: Bytes,
    release: Release,
    released: bool,
}

impl Packet {
    pub fn new(
        sequence_number: u16,
        timestamp: u32,
        ssrc: u32,
        payload_type: u8,
        marker: bool,
        payload: impl Into<Bytes>,
    ) -> Self {
        Packet {
            marker,
            payload_type: payload_type & 0x7f,
            sequence_number,
            timestamp,
            ssrc,
            csrc: Vec::new(),
            payload: payload.into(),
            release: Release::Frame,
            released: false,
        }
    }

    /// Parse a packet, honoring CSRC count, header extension and padding.
    pub fn parse(data: Bytes) -> Result<Self> {
        let invalid = || RtspError::parse(ParseErrorKind::InvalidRtpPacket);

        if data.len() < FIXED_HEADER_LEN || data[0] >> 6 != 2 {
            return Err(invalid());
        }

        let padding = data[0] & 0x20 != 0;
        let extension = data[0] & 0x10 != 0;
        let csrc_count = (data[0] & 0x0f) as usize;

        let mut offset = FIXED_HEADER_LEN + 4 * csrc_count;
        if data.len() < offset {
            return Err(invalid());
        }
        let csrc = data[FIXED_HEADER_LEN..offset]
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        if extension {
            if data.len() < offset + 4 {
                return Err(invalid());
            }
            let words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            offset += 4 + 4 * words;
            if data.len() < offset {
                return Err(invalid());
            }
        }

        let mut end = data.len();
        if padding {
            let pad = data[end - 1] as usize;
            if pad == 0 || offset + pad > end {
                return Err(invalid());
            }
            end -= pad;
        }

        Ok(Packet {
            marker: data[1] & 0x80 != 0,
            payload_type: data[1] & 0x7f,
            sequence_number: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            csrc,
            payload: data.slice(offset..end),
            release: Release::Frame,
            released: false,
        })
    }

    /// Serialize with a plain 12-byte header (no CSRC, extension or padding).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FIXED_HEADER_LEN + self.payload.len());
        out.extend_from_slice(&write_fixed_header(
            self.marker,
            self.payload_type,
            self.sequence_number,
            self.timestamp,
            self.ssrc,
        ));
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn with_release(mut self, release: Release) -> Self {
        self.release = release;
        self
    }

    pub fn marker(&self) -> bool {
        self.marker
    }

    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }

    pub fn sequence_number(&self) -> u16 {
        self.sequence_number
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn csrc(&self) -> &[u32] {
        &self.csrc
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn release_mode(&self) -> Release {
        self.release
    }

    /// Drop the payload view. Released packets are ignored by frames.
    pub fn release(&mut self) {
        self.payload = Bytes::new();
        self.released = true;
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

fn write_fixed_header(
    marker: bool,
    payload_type: u8,
    sequence_number: u16,
    timestamp: u32,
    ssrc: u32,
) -> [u8; FIXED_HEADER_LEN] {
    let mut header = [0u8; FIXED_HEADER_LEN];
    header[0] = 2 << 6;
    header[1] = ((marker as u8) << 7) | (payload_type & 0x7f);
    header[2..4].copy_from_slice(&sequence_number.to_be_bytes());
    header[4..8].copy_from_slice(&timestamp.to_be_bytes());
    header[8..12].copy_from_slice(&ssrc.to_be_bytes());
    header
}

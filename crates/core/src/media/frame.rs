//! Reassembly of the RTP packets that make up one media instant.
//!
//! All packets of a frame share SSRC and timestamp. They may arrive in any
//! order; the frame keeps them sorted by *circular* sequence order, where
//! `a` precedes `b` when `(b - a) as i16 > 0`. That keeps the order correct
//! across the 65535 → 0 wrap:
//!
//! ```text
//! arrival: 2 4 3 5 1 10 7 9 8 6 65535 65534 0
//! stored:  65534 65535 0 1 2 3 4 5 6 7 8 9 10
//! ```
//!
//! Depacketized payload units are kept in a map ordered by the position of
//! their source packet (relative to the first packet ever added) and the
//! unit's index inside that packet, so the key of a unit never changes when
//! other packets arrive or leave.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::time::Instant;

use bytes::{Bytes, BytesMut};

use crate::error::{ConsistencyKind, Result, RtspError};
use crate::lifecycle::Lifecycle;
use crate::media::Depacketizer;
use crate::media::rtp::{Packet, Release};

/// Upper bound on packets per frame.
pub const MAX_PACKETS: usize = 1024;

/// Depacketized bytes produced from one packet.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Sequence number of the packet the bytes came from.
    pub sequence_number: u16,
    pub data: Bytes,
    pub release: Release,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct SegmentKey {
    position: i32,
    part: u32,
}

#[derive(Debug)]
pub struct Frame {
    state: Lifecycle,
    created: Instant,
    packets: Vec<Packet>,
    ssrc: Option<u32>,
    timestamp: Option<u32>,
    payload_type: Option<u8>,
    allow_multiple_payload_types: bool,
    marker_count: usize,
    lowest: Option<u16>,
    highest: Option<u16>,
    anchor: Option<u16>,
    segments: BTreeMap<SegmentKey, Segment>,
    buffer: Option<Bytes>,
}

impl Frame {
    /// An empty frame; the first packet added fixes SSRC, timestamp and
    /// payload type.
    pub fn new() -> Self {
        Frame {
            state: Lifecycle::Active,
            created: Instant::now(),
            packets: Vec::new(),
            ssrc: None,
            timestamp: None,
            payload_type: None,
            allow_multiple_payload_types: false,
            marker_count: 0,
            lowest: None,
            highest: None,
            anchor: None,
            segments: BTreeMap::new(),
            buffer: None,
        }
    }

    /// A frame that only accepts packets with the given identity.
    pub fn expecting(ssrc: u32, timestamp: u32, payload_type: u8) -> Self {
        Frame {
            ssrc: Some(ssrc),
            timestamp: Some(timestamp),
            payload_type: Some(payload_type),
            ..Self::new()
        }
    }

    pub fn allow_multiple_payload_types(mut self, allow: bool) -> Self {
        self.allow_multiple_payload_types = allow;
        self
    }

    pub fn is_closed(&self) -> bool {
        self.state != Lifecycle::Active
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn ssrc(&self) -> Option<u32> {
        self.ssrc
    }

    pub fn timestamp(&self) -> Option<u32> {
        self.timestamp
    }

    pub fn payload_type(&self) -> Option<u8> {
        self.payload_type
    }

    pub fn count(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Stored packets in circular sequence order.
    pub fn packets(&self) -> &[Packet] {
        &self.packets
    }

    pub fn sequence_numbers(&self) -> impl Iterator<Item = u16> + '_ {
        self.packets.iter().map(Packet::sequence_number)
    }

    /// `None` when the frame is empty.
    pub fn lowest_sequence_number(&self) -> Option<u16> {
        self.lowest
    }

    /// `None` when the frame is empty.
    pub fn highest_sequence_number(&self) -> Option<u16> {
        self.highest
    }

    pub fn marker_count(&self) -> usize {
        self.marker_count
    }

    pub fn has_marker(&self) -> bool {
        self.marker_count > 0
    }

    pub fn index_of(&self, sequence_number: u16) -> Option<usize> {
        self.packets
            .iter()
            .position(|p| p.sequence_number() == sequence_number)
    }

    pub fn contains(&self, sequence_number: u16) -> bool {
        self.index_of(sequence_number).is_some()
    }

    /// Add with the usual options: packets after the marker are accepted,
    /// duplicates are not.
    pub fn push(&mut self, packet: Packet) -> Result<()> {
        self.add(packet, true, false)
    }

    /// Like [`add`](Self::add) but reports refusal as `false`.
    pub fn try_add(&mut self, packet: Packet, allow_after_marker: bool, allow_duplicates: bool) -> bool {
        if self.is_closed() || packet.is_released() {
            return false;
        }
        let before = self.packets.len();
        self.add(packet, allow_after_marker, allow_duplicates).is_ok() && self.packets.len() > before
    }

    /// Insert a packet in circular sequence order.
    ///
    /// Adding to a closed frame, or adding a released packet, does nothing.
    pub fn add(&mut self, packet: Packet, allow_after_marker: bool, allow_duplicates: bool) -> Result<()> {
        if self.is_closed() || packet.is_released() {
            return Ok(());
        }

        let sequence_number = packet.sequence_number();
        let refuse = |kind| RtspError::Consistency {
            kind,
            sequence_number,
        };

        match self.ssrc {
            None => self.ssrc = Some(packet.ssrc()),
            Some(ssrc) if ssrc != packet.ssrc() => {
                return Err(refuse(ConsistencyKind::SsrcMismatch));
            }
            Some(_) => {}
        }
        match self.timestamp {
            None => self.timestamp = Some(packet.timestamp()),
            Some(ts) if ts != packet.timestamp() => {
                return Err(refuse(ConsistencyKind::TimestampMismatch));
            }
            Some(_) => {}
        }
        match self.payload_type {
            None => self.payload_type = Some(packet.payload_type()),
            Some(pt) if pt != packet.payload_type() && !self.allow_multiple_payload_types => {
                return Err(refuse(ConsistencyKind::PayloadTypeMismatch));
            }
            Some(_) => {}
        }

        if !allow_duplicates && self.contains(sequence_number) {
            return Err(refuse(ConsistencyKind::Duplicate));
        }
        if !allow_after_marker && self.marker_count > 0 {
            return Err(refuse(ConsistencyKind::AfterMarker));
        }
        if self.packets.len() >= MAX_PACKETS {
            return Err(refuse(ConsistencyKind::FrameFull));
        }

        let index = self
            .packets
            .iter()
            .position(|p| (sequence_number.wrapping_sub(p.sequence_number()) as i16) < 0)
            .unwrap_or(self.packets.len());

        if packet.marker() {
            self.marker_count += 1;
        }
        self.anchor.get_or_insert(sequence_number);
        self.packets.insert(index, packet);

        self.lowest = self.packets.first().map(Packet::sequence_number);
        self.highest = self.packets.last().map(Packet::sequence_number);
        Ok(())
    }

    /// Remove and return the packet with the given sequence number.
    ///
    /// Depacketized segments from that packet are released too, unless they
    /// are caller-owned and the packet itself is not frame-owned.
    pub fn remove(&mut self, sequence_number: u16) -> Option<Packet> {
        if self.is_closed() {
            return None;
        }
        let index = self.index_of(sequence_number)?;
        let packet = self.packets.remove(index);

        match self.packets.len() {
            0 => {
                self.lowest = None;
                self.highest = None;
            }
            1 => {
                let only = self.packets[0].sequence_number();
                self.lowest = Some(only);
                self.highest = Some(only);
            }
            2 => match index {
                0 => self.lowest = Some(self.packets[0].sequence_number()),
                2 => self.highest = Some(self.packets[1].sequence_number()),
                _ => {}
            },
            remaining => {
                if index == 0 {
                    self.lowest = Some(self.packets[0].sequence_number());
                } else if index == remaining {
                    self.highest = Some(self.packets[remaining - 1].sequence_number());
                }
            }
        }

        if packet.marker() {
            self.marker_count = self.marker_count.saturating_sub(1);
        }

        self.free_segments(sequence_number, packet.release_mode() == Release::Frame);
        if self.packets.is_empty() && self.segments.is_empty() {
            self.anchor = None;
        }
        Some(packet)
    }

    fn free_segments(&mut self, sequence_number: u16, force: bool) {
        let before = self.segments.len();
        self.segments.retain(|_, segment| {
            segment.sequence_number != sequence_number
                || (!force && segment.release == Release::Caller)
        });
        if self.segments.len() != before {
            self.buffer = None;
        }
    }

    /// Whether a gap exists between the lowest and highest stored packets.
    ///
    /// Always `false` with fewer than two packets.
    pub fn is_missing_packets(&self) -> bool {
        match (self.packets.len(), self.lowest, self.highest) {
            (0 | 1, _, _) => false,
            (2, Some(lowest), Some(highest)) => highest.wrapping_sub(lowest) != 1,
            _ => self
                .packets
                .windows(2)
                .any(|w| w[1].sequence_number() != w[0].sequence_number().wrapping_add(1)),
        }
    }

    /// Active, gap-free, and holding at least one marker packet.
    pub fn is_complete(&self) -> bool {
        !self.is_closed() && !self.is_missing_packets() && self.marker_count > 0
    }

    fn position_of(&self, sequence_number: u16) -> i32 {
        let anchor = self.anchor.unwrap_or(sequence_number);
        sequence_number.wrapping_sub(anchor) as i16 as i32
    }

    /// Run every stored packet through `depacketizer`.
    ///
    /// Calling this again on an unchanged frame yields the same segments.
    pub fn depacketize(&mut self, depacketizer: &mut dyn Depacketizer) -> Result<()> {
        if self.is_closed() {
            return Err(RtspError::Closed);
        }
        for index in 0..self.packets.len() {
            self.depacketize_at(index, depacketizer);
        }
        Ok(())
    }

    /// Run a single stored packet through `depacketizer`. Returns false if
    /// no packet with that sequence number is stored.
    pub fn depacketize_packet(
        &mut self,
        sequence_number: u16,
        depacketizer: &mut dyn Depacketizer,
    ) -> Result<bool> {
        if self.is_closed() {
            return Err(RtspError::Closed);
        }
        match self.index_of(sequence_number) {
            Some(index) => {
                self.depacketize_at(index, depacketizer);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn depacketize_at(&mut self, index: usize, depacketizer: &mut dyn Depacketizer) {
        let packet = &self.packets[index];
        let sequence_number = packet.sequence_number();
        let position = self.position_of(sequence_number);
        let units = depacketizer.depacketize(packet);
        if units.is_empty() {
            return;
        }
        for (part, unit) in units.into_iter().enumerate() {
            self.segments.insert(
                SegmentKey {
                    position,
                    part: part as u32,
                },
                Segment {
                    sequence_number,
                    data: unit.data,
                    release: unit.release,
                },
            );
        }
        self.buffer = None;
    }

    /// Depacketized segments in decoding order.
    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.values()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// All segments concatenated. Built on first use and cached until the
    /// segment map changes.
    pub fn buffer(&mut self) -> Result<Bytes> {
        if self.is_closed() {
            return Err(RtspError::Closed);
        }
        if let Some(buffer) = &self.buffer {
            return Ok(buffer.clone());
        }
        let len = self.segments.values().map(|s| s.data.len()).sum();
        let mut out = BytesMut::with_capacity(len);
        for segment in self.segments.values() {
            out.extend_from_slice(&segment.data);
        }
        let buffer = out.freeze();
        self.buffer = Some(buffer.clone());
        Ok(buffer)
    }

    /// Seekable reader over [`buffer`](Self::buffer).
    pub fn reader(&mut self) -> Result<Cursor<Bytes>> {
        Ok(Cursor::new(self.buffer()?))
    }

    /// Drop every packet and segment, caller-owned ones included.
    pub fn clear(&mut self) {
        self.packets.clear();
        self.segments.clear();
        self.buffer = None;
        self.marker_count = 0;
        self.lowest = None;
        self.highest = None;
        self.anchor = None;
    }

    pub fn close(&mut self) {
        if self.is_closed() {
            return;
        }
        self.clear();
        self.state = Lifecycle::Closed;
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Seek, SeekFrom};

    use super::*;
    use crate::media::{Passthrough, Unit};

    fn packet(seq: u16, marker: bool) -> Packet {
        Packet::new(seq, 1000, 0x1234, 96, marker, vec![(seq & 0xff) as u8])
    }

    fn frame_of(sequence: &[u16]) -> Frame {
        let mut frame = Frame::new();
        for &seq in sequence {
            frame.push(packet(seq, false)).unwrap();
        }
        frame
    }

    #[test]
    fn out_of_order_then_wraparound() {
        let mut frame = Frame::new();
        for seq in [2, 4, 3, 5, 1] {
            frame.push(packet(seq, false)).unwrap();
        }
        frame.push(packet(10, true)).unwrap();
        for seq in [7, 9, 8, 6] {
            frame.push(packet(seq, false)).unwrap();
        }
        assert!(!frame.is_missing_packets());
        assert_eq!(frame.count(), 10);
        assert!(frame.has_marker());
        assert!(frame.is_complete());

        frame.push(packet(65535, false)).unwrap();
        assert!(frame.is_missing_packets());
        frame.push(packet(65534, false)).unwrap();
        assert!(frame.is_missing_packets());
        assert!(!frame.is_complete());

        frame.push(packet(0, false)).unwrap();
        assert!(!frame.is_missing_packets());
        let order: Vec<u16> = frame.sequence_numbers().collect();
        assert_eq!(order, vec![65534, 65535, 0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        assert_eq!(frame.lowest_sequence_number(), Some(65534));
        assert_eq!(frame.highest_sequence_number(), Some(10));
    }

    #[test]
    fn order_is_ascending_circular_for_any_arrival() {
        let arrivals: [&[u16]; 3] = [
            &[5, 1, 3, 2, 4],
            &[65533, 2, 65535, 0, 1, 65534],
            &[100, 99, 98, 97],
        ];
        for arrival in arrivals {
            let frame = frame_of(arrival);
            let lowest = frame.lowest_sequence_number().unwrap();
            let expected: Vec<u16> = (0..arrival.len() as u16)
                .map(|i| lowest.wrapping_add(i))
                .collect();
            assert_eq!(frame.sequence_numbers().collect::<Vec<_>>(), expected);
        }
    }

    #[test]
    fn missing_packets_short_circuits() {
        assert!(!Frame::new().is_missing_packets());
        assert!(!frame_of(&[7]).is_missing_packets());
        assert!(!frame_of(&[65535, 0]).is_missing_packets());
        assert!(frame_of(&[1, 3]).is_missing_packets());
    }

    #[test]
    fn empty_frame_is_not_complete() {
        let frame = Frame::new();
        assert!(!frame.is_complete());
        assert_eq!(frame.lowest_sequence_number(), None);
    }

    #[test]
    fn remove_down_to_one() {
        let mut frame = frame_of(&[10, 11, 12, 13]);
        assert_eq!(frame.remove(13).map(|p| p.sequence_number()), Some(13));
        assert_eq!(frame.highest_sequence_number(), Some(12));
        frame.remove(10);
        assert_eq!(frame.lowest_sequence_number(), Some(11));
        frame.remove(12);
        assert_eq!(frame.lowest_sequence_number(), Some(11));
        assert_eq!(frame.highest_sequence_number(), Some(11));
        frame.remove(11);
        assert_eq!(frame.lowest_sequence_number(), None);
        assert!(frame.remove(11).is_none());
    }

    #[test]
    fn remove_middle_keeps_bounds() {
        let mut frame = frame_of(&[1, 2, 3, 4, 5]);
        frame.remove(3);
        assert_eq!(frame.lowest_sequence_number(), Some(1));
        assert_eq!(frame.highest_sequence_number(), Some(5));
        assert!(frame.is_missing_packets());
    }

    #[test]
    fn marker_count_follows_removal() {
        let mut frame = Frame::new();
        frame.push(packet(1, false)).unwrap();
        frame.push(packet(2, true)).unwrap();
        frame.remove(2);
        assert!(!frame.has_marker());
    }

    #[test]
    fn consistency_faults() {
        let mut frame = Frame::new();
        frame.push(packet(1, true)).unwrap();

        let dup = frame.push(packet(1, false)).unwrap_err();
        assert!(matches!(
            dup,
            RtspError::Consistency {
                kind: ConsistencyKind::Duplicate,
                sequence_number: 1
            }
        ));
        assert!(frame.add(packet(1, false), true, true).is_ok());

        let after = frame.add(packet(2, false), false, false).unwrap_err();
        assert!(matches!(
            after,
            RtspError::Consistency {
                kind: ConsistencyKind::AfterMarker,
                ..
            }
        ));

        let other_ssrc = Packet::new(3, 1000, 0x9999, 96, false, vec![0]);
        assert!(frame.push(other_ssrc).is_err());
        let other_ts = Packet::new(3, 2000, 0x1234, 96, false, vec![0]);
        assert!(frame.push(other_ts).is_err());
        let other_pt = Packet::new(3, 1000, 0x1234, 97, false, vec![0]);
        assert!(!frame.try_add(other_pt.clone(), true, false));

        let mut permissive = Frame::new().allow_multiple_payload_types(true);
        permissive.push(packet(2, false)).unwrap();
        assert!(permissive.try_add(other_pt, true, false));
    }

    #[test]
    fn expecting_rejects_foreign_first_packet() {
        let mut frame = Frame::expecting(0x1234, 1000, 96);
        assert!(frame.push(packet(1, false)).is_ok());
        let mut frame = Frame::expecting(0x1, 1000, 96);
        assert!(frame.push(packet(1, false)).is_err());
    }

    #[test]
    fn closed_frame_ignores_adds() {
        let mut frame = frame_of(&[1, 2]);
        frame.close();
        assert!(frame.push(packet(3, false)).is_ok());
        assert_eq!(frame.count(), 0);
        assert!(frame.buffer().is_err());
        assert!(matches!(
            frame.depacketize(&mut Passthrough),
            Err(RtspError::Closed)
        ));
    }

    #[test]
    fn released_packet_is_ignored() {
        let mut frame = Frame::new();
        let mut released = packet(1, false);
        released.release();
        assert!(frame.push(released).is_ok());
        assert!(frame.is_empty());
    }

    #[test]
    fn buffer_is_in_sequence_order() {
        let mut frame = Frame::new();
        for seq in [3u16, 0, 4, 1, 2] {
            frame
                .push(Packet::new(seq, 0, 1, 96, seq == 4, vec![seq as u8]))
                .unwrap();
        }
        frame.depacketize(&mut Passthrough).unwrap();
        assert_eq!(&frame.buffer().unwrap()[..], &[0, 1, 2, 3, 4]);

        let mut reader = frame.reader().unwrap();
        reader.seek(SeekFrom::Start(3)).unwrap();
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, vec![3, 4]);
    }

    #[test]
    fn depacketize_twice_is_stable() {
        let mut frame = frame_of(&[5, 6, 7]);
        frame.depacketize(&mut Passthrough).unwrap();
        let first = frame.segment_count();
        frame.depacketize(&mut Passthrough).unwrap();
        assert_eq!(frame.segment_count(), first);
        assert_eq!(first, 3);
    }

    #[test]
    fn default_depacketizer_produces_nothing() {
        struct Ignore;
        impl Depacketizer for Ignore {}

        let mut frame = frame_of(&[1, 2]);
        frame.depacketize(&mut Ignore).unwrap();
        assert_eq!(frame.segment_count(), 0);
        assert!(frame.buffer().unwrap().is_empty());
    }

    #[test]
    fn buffer_rebuilds_after_removal() {
        let mut frame = frame_of(&[1, 2, 3]);
        frame.depacketize(&mut Passthrough).unwrap();
        assert_eq!(frame.buffer().unwrap().len(), 3);
        frame.remove(2);
        assert_eq!(&frame.buffer().unwrap()[..], &[1, 3]);
    }

    #[test]
    fn caller_owned_segments_survive_removal() {
        struct Split;
        impl Depacketizer for Split {
            fn depacketize(&mut self, packet: &Packet) -> Vec<Unit> {
                vec![
                    Unit::new(packet.payload().clone()),
                    Unit::new(Bytes::from_static(b"!")).with_release(Release::Caller),
                ]
            }
        }

        let mut frame = Frame::new();
        frame
            .push(packet(1, false).with_release(Release::Caller))
            .unwrap();
        frame.push(packet(2, false)).unwrap();
        frame.depacketize(&mut Split).unwrap();
        assert_eq!(&frame.buffer().unwrap()[..], b"\x01!\x02!");

        // Caller-owned packet: only the frame-owned unit goes.
        frame.remove(1);
        assert_eq!(&frame.buffer().unwrap()[..], b"!\x02!");

        // Frame-owned packet: everything from it goes.
        frame.remove(2);
        assert_eq!(&frame.buffer().unwrap()[..], b"!");

        frame.clear();
        assert_eq!(frame.segment_count(), 0);
    }
}

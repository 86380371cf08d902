use std::collections::{HashMap, VecDeque};

use crate::media::{Depacketizer, Frame, Packet};

/// Completed frames kept before the oldest is dropped.
const MAX_READY_FRAMES: usize = 512;

/// Groups the packets of one stream into [`Frame`]s.
///
/// Packets with the same SSRC and timestamp go to the same frame. A frame
/// moves to the ready queue, depacketized, once it is provably whole: it is
/// complete and its lowest sequence number directly follows the last frame
/// handed out for that SSRC. A complete frame is also released when a packet
/// with a newer timestamp of the same SSRC arrives. When too many frames are
/// pending the oldest is handed out incomplete; check [`Frame::is_complete`].
pub struct FrameAssembler {
    pending: VecDeque<Frame>,
    ready: VecDeque<Frame>,
    depacketizer: Box<dyn Depacketizer>,
    max_pending: usize,
    /// Highest sequence number handed out, per SSRC.
    last_highest: HashMap<u32, u16>,
    dropped_packets: u64,
    dropped_frames: u64,
}

impl FrameAssembler {
    pub fn new(depacketizer: Box<dyn Depacketizer>, max_pending: usize) -> Self {
        FrameAssembler {
            pending: VecDeque::new(),
            ready: VecDeque::new(),
            depacketizer,
            max_pending: max_pending.max(1),
            last_highest: HashMap::new(),
            dropped_packets: 0,
            dropped_frames: 0,
        }
    }

    pub fn push(&mut self, packet: Packet) {
        let (ssrc, timestamp) = (packet.ssrc(), packet.timestamp());
        let index = match self
            .pending
            .iter()
            .position(|f| f.ssrc() == Some(ssrc) && f.timestamp() == Some(timestamp))
        {
            Some(index) => index,
            None => {
                self.release_superseded(ssrc, timestamp);
                self.pending.push_back(Frame::new());
                self.pending.len() - 1
            }
        };

        let frame = &mut self.pending[index];
        if let Err(e) = frame.push(packet) {
            tracing::trace!(error = %e, "packet refused by frame");
            self.dropped_packets += 1;
            if frame.is_empty() {
                self.pending.remove(index);
            }
            return;
        }

        if self.is_whole(&self.pending[index]) {
            if let Some(frame) = self.pending.remove(index) {
                self.finish(frame);
            }
        }

        while self.pending.len() > self.max_pending {
            if let Some(stale) = self.pending.pop_front() {
                tracing::trace!(
                    timestamp = ?stale.timestamp(),
                    packets = stale.count(),
                    "releasing incomplete frame"
                );
                self.finish(stale);
            }
        }
    }

    fn is_whole(&self, frame: &Frame) -> bool {
        if !frame.is_complete() {
            return false;
        }
        let previous = frame.ssrc().and_then(|ssrc| self.last_highest.get(&ssrc));
        match (previous, frame.lowest_sequence_number()) {
            (Some(&highest), Some(lowest)) => lowest == highest.wrapping_add(1),
            _ => false,
        }
    }

    /// Finish complete frames of `ssrc` older than `timestamp`.
    fn release_superseded(&mut self, ssrc: u32, timestamp: u32) {
        let mut index = 0;
        while index < self.pending.len() {
            let frame = &self.pending[index];
            let older = frame
                .timestamp()
                .is_some_and(|t| (timestamp.wrapping_sub(t) as i32) > 0);
            if frame.ssrc() == Some(ssrc) && older && frame.is_complete() {
                if let Some(frame) = self.pending.remove(index) {
                    self.finish(frame);
                }
            } else {
                index += 1;
            }
        }
    }

    fn finish(&mut self, mut frame: Frame) {
        if let (Some(ssrc), Some(highest)) = (frame.ssrc(), frame.highest_sequence_number()) {
            let newer = self
                .last_highest
                .get(&ssrc)
                .is_none_or(|&last| (highest.wrapping_sub(last) as i16) > 0);
            if newer {
                self.last_highest.insert(ssrc, highest);
            }
        }
        if let Err(e) = frame.depacketize(self.depacketizer.as_mut()) {
            tracing::debug!(error = %e, "depacketize failed");
        }
        self.ready.push_back(frame);
        if self.ready.len() > MAX_READY_FRAMES {
            self.ready.pop_front();
            self.dropped_frames += 1;
        }
    }

    /// Oldest ready frame.
    pub fn pop(&mut self) -> Option<Frame> {
        self.ready.pop_front()
    }

    pub fn drain(&mut self) -> Vec<Frame> {
        self.ready.drain(..).collect()
    }

    /// Move every pending frame to the ready queue, complete or not.
    pub fn flush(&mut self) {
        while let Some(frame) = self.pending.pop_front() {
            self.finish(frame);
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn dropped_packets(&self) -> u64 {
        self.dropped_packets
    }

    /// Ready frames discarded because nobody drained them.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }
}

impl std::fmt::Debug for FrameAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameAssembler")
            .field("pending", &self.pending.len())
            .field("ready", &self.ready.len())
            .field("dropped_packets", &self.dropped_packets)
            .finish()
    }
}

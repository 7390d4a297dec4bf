//! Packet reordering ahead of fan-out
//!
//! The reorder buffer is an injected collaborator of the remote track: the
//! read loop pushes raw packets in arrival order and drains whatever the
//! buffer declares ready, sleeping until [`ReorderBuffer::next_deadline`]
//! when a gap is outstanding. The buffer itself never blocks or spawns;
//! all timing lives in the caller.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use webrtc::rtp::packet::Packet;

pub trait ReorderBuffer: Send {
    fn push(&mut self, packet: Packet, now: Instant);

    /// Next packet eligible for release, if any
    fn pop_ready(&mut self, now: Instant) -> Option<Packet>;

    /// Earliest instant at which `pop_ready` may yield something new;
    /// `None` while the buffer is empty
    fn next_deadline(&self) -> Option<Instant>;
}

/// Sequence-number-ordered reorder buffer with a bounded wait window
///
/// Packets are held at least `min_wait` to give late arrivals a chance to
/// slot in, and at most `max_wait`; after `max_wait` the head is released
/// even if it leaves a gap behind. Packets older than the release cursor
/// are passed through immediately.
pub struct SeqReorderBuffer {
    min_wait: Duration,
    max_wait: Duration,
    /// Extended (unwrapped) sequence number of the last push
    last_ext: Option<i64>,
    /// Extended sequence number the buffer releases next
    next_emit: i64,
    pending: BTreeMap<i64, (Packet, Instant)>,
    late: Vec<Packet>,
}

impl SeqReorderBuffer {
    #[must_use]
    pub fn new(min_wait: Duration, max_wait: Duration) -> Self {
        Self {
            min_wait,
            max_wait,
            last_ext: None,
            next_emit: 0,
            pending: BTreeMap::new(),
            late: Vec::new(),
        }
    }

    /// Unwrap a 16-bit sequence number onto a monotonic line
    fn extend(&mut self, seq: u16) -> i64 {
        match self.last_ext {
            None => {
                let ext = i64::from(seq);
                self.last_ext = Some(ext);
                self.next_emit = ext;
                ext
            }
            Some(last) => {
                let last_seq = (last & 0xffff) as u16;
                let diff = i64::from(seq.wrapping_sub(last_seq) as i16);
                let ext = last + diff;
                if ext > last {
                    self.last_ext = Some(ext);
                }
                ext
            }
        }
    }
}

impl ReorderBuffer for SeqReorderBuffer {
    fn push(&mut self, packet: Packet, now: Instant) {
        let ext = self.extend(packet.header.sequence_number);
        if ext < self.next_emit {
            // Arrived after its slot was given up; pass through as-is.
            self.late.push(packet);
            return;
        }
        self.pending.insert(ext, (packet, now));
    }

    fn pop_ready(&mut self, now: Instant) -> Option<Packet> {
        if !self.late.is_empty() {
            return Some(self.late.remove(0));
        }

        let (&ext, &(_, arrived)) = self.pending.iter().next().map(|(k, v)| (k, v))?;

        let wait = if ext == self.next_emit {
            self.min_wait
        } else {
            self.max_wait
        };
        if now.duration_since(arrived) < wait {
            return None;
        }

        let (packet, _) = self.pending.remove(&ext)?;
        self.next_emit = ext + 1;
        Some(packet)
    }

    fn next_deadline(&self) -> Option<Instant> {
        if !self.late.is_empty() {
            return Some(Instant::now());
        }
        let (&ext, &(_, arrived)) = self.pending.iter().next().map(|(k, v)| (k, v))?;
        let wait = if ext == self.next_emit {
            self.min_wait
        } else {
            self.max_wait
        };
        Some(arrived + wait)
    }
}

use super::sequence::{ExtendedSequence, SequenceTracker};
use crate::config::JitterConfig;
use crate::media::rtp::MediaPacket;

/// Receive-side reorder buffer.
///
/// Packets are stored in a ring by `seq % capacity` and released strictly in
/// sequence order by [`drain`](Self::drain). A missing packet holds back
/// everything after it until the newest media timestamp seen is more than
/// `max_wait_ms` of media time past the last released packet; then the hole
/// is skipped for good.
///
/// The wait is measured on the RTP clock, not the wall clock, so a stalled
/// sender never causes skips by itself.
#[derive(Debug)]
pub struct JitterBuffer {
    slots: Vec<Option<MediaPacket>>,
    max_wait_ticks: u32,
    /// Sequence number of the last released (or skipped) packet.
    cursor: Option<u16>,
    newest_timestamp: u32,
    released_timestamp: u32,
    released: SequenceTracker,
    last_released: Option<ExtendedSequence>,
    skipped: u64,
}

impl JitterBuffer {
    pub fn new(config: &JitterConfig, clock_rate: u32) -> Self {
        let capacity = config.capacity.max(1) as usize;
        let max_wait_ticks = (config.max_wait_ms as u64 * clock_rate as u64 / 1000) as u32;
        tracing::debug!(capacity, max_wait_ticks, clock_rate, "jitter buffer created");
        Self {
            slots: vec![None; capacity],
            max_wait_ticks,
            cursor: None,
            newest_timestamp: 0,
            released_timestamp: 0,
            released: SequenceTracker::new(),
            last_released: None,
            skipped: 0,
        }
    }

    /// Store a packet for ordered release.
    ///
    /// Returns `false` for a packet at or behind the release cursor, which
    /// could never be emitted.
    pub fn add(&mut self, packet: MediaPacket) -> bool {
        let seq = packet.sequence_number;

        match self.cursor {
            None => {
                self.cursor = Some(seq.wrapping_sub(1));
                self.released_timestamp = packet.timestamp;
                self.newest_timestamp = packet.timestamp;
            }
            Some(cursor) => {
                let ahead = seq.wrapping_sub(cursor);
                if ahead == 0 || ahead >= 0x8000 {
                    tracing::trace!(seq, cursor, "late packet ignored");
                    return false;
                }
                if (packet.timestamp.wrapping_sub(self.newest_timestamp) as i32) > 0 {
                    self.newest_timestamp = packet.timestamp;
                }
            }
        }

        let idx = seq as usize % self.slots.len();
        self.slots[idx] = Some(packet);
        true
    }

    /// Release packets in order. The cursor persists across calls, so the
    /// iterator can be dropped early and resumed by the next `drain`.
    pub fn drain(&mut self) -> Drain<'_> {
        Drain {
            buffer: self,
            skipped_here: 0,
        }
    }

    /// Extended sequence number of the last released packet.
    pub fn last_released(&self) -> Option<ExtendedSequence> {
        self.last_released
    }

    /// Total holes skipped since creation.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    fn take_next(&mut self, skipped_here: &mut usize) -> Option<MediaPacket> {
        loop {
            let cursor = self.cursor?;
            let next = cursor.wrapping_add(1);
            let idx = next as usize % self.slots.len();

            let hit = self.slots[idx]
                .as_ref()
                .is_some_and(|p| p.sequence_number == next);
            if hit {
                let packet = self.slots[idx].take()?;
                self.cursor = Some(next);
                self.released_timestamp = packet.timestamp;
                self.last_released = Some(self.released.update(next));
                return Some(packet);
            }

            let elapsed = self.newest_timestamp.wrapping_sub(self.released_timestamp) as i32;
            if elapsed <= self.max_wait_ticks as i32 || *skipped_here >= self.slots.len() {
                return None;
            }

            tracing::debug!(seq = next, elapsed, "jitter buffer skipping missing packet");
            self.cursor = Some(next);
            self.skipped += 1;
            *skipped_here += 1;
        }
    }
}

/// Ordered iterator returned by [`JitterBuffer::drain`].
pub struct Drain<'a> {
    buffer: &'a mut JitterBuffer,
    skipped_here: usize,
}

impl Iterator for Drain<'_> {
    type Item = MediaPacket;

    fn next(&mut self) -> Option<MediaPacket> {
        self.buffer.take_next(&mut self.skipped_here)
    }
}

use std::collections::VecDeque;
use std::time::Instant;

use crate::config::NackConfig;
use crate::media::rtp::MediaPacket;

/// Forward jumps at or beyond this distance resynchronize instead of
/// counting as loss.
const MAX_GAP: u16 = 0x0FFF;

/// One generic NACK entry (RFC 4585 §6.2.1).
///
/// `lost_packets` bit `i` set means `packet_id + 1 + i` was lost too.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NackPair {
    pub packet_id: u16,
    pub lost_packets: u16,
}

impl NackPair {
    /// Every sequence number this pair reports, `packet_id` first.
    pub fn sequence_numbers(&self) -> impl Iterator<Item = u16> + '_ {
        std::iter::once(self.packet_id).chain(
            (0..16u16)
                .filter(|bit| self.lost_packets & (1 << bit) != 0)
                .map(|bit| self.packet_id.wrapping_add(bit + 1)),
        )
    }
}

/// A missing sequence number awaiting retransmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NackInfo {
    pub sequence_number: u16,
    /// Creation time until the first send, then time of the last send.
    pub last_sent_at: Instant,
    pub retries: u8,
}

/// Detects gaps in an incoming RTP stream and schedules NACKs for them.
///
/// Feed every received packet to [`observe`](Self::observe) and call
/// [`build_feedback`](Self::build_feedback) periodically. Rounds are spaced
/// at least `interval` apart; a fresh loss waits `first_send_delay` before
/// its first report so ordinary reordering does not trigger a NACK; each
/// loss is reported at most `max_retries + 1` times, and never more than
/// `u8::MAX` times.
#[derive(Debug)]
pub struct LossTracker {
    config: NackConfig,
    media_ssrc: Option<u32>,
    latest: u16,
    /// Ring of recently received sequence numbers.
    received: Vec<Option<u16>>,
    pending: VecDeque<NackInfo>,
    last_round: Option<Instant>,
}

impl LossTracker {
    pub fn new(config: NackConfig) -> Self {
        let capacity = config.capacity.max(1) as usize;
        Self {
            config,
            media_ssrc: None,
            latest: 0,
            received: vec![None; capacity],
            pending: VecDeque::new(),
            last_round: None,
        }
    }

    /// SSRC of the observed stream, latched by the first packet.
    pub fn media_ssrc(&self) -> Option<u32> {
        self.media_ssrc
    }

    /// Losses currently awaiting a report or a retry.
    pub fn pending(&self) -> impl Iterator<Item = &NackInfo> {
        self.pending.iter()
    }

    /// Record an arriving packet. Returns how many new losses it revealed.
    pub fn observe(&mut self, packet: &MediaPacket, now: Instant) -> usize {
        let seq = packet.sequence_number;
        let idx = self.slot(seq);
        self.received[idx] = Some(seq);

        if self.media_ssrc.is_none() {
            self.media_ssrc = Some(packet.ssrc);
            self.latest = seq;
            return 0;
        }

        let distance = seq.wrapping_sub(self.latest);
        if distance == 0 || distance >= 0x8000 {
            // duplicate or retransmitted/reordered packet
            return 0;
        }
        if distance > MAX_GAP {
            tracing::debug!(
                from = self.latest,
                to = seq,
                "sequence jump, resynchronizing loss tracking"
            );
            self.latest = seq;
            return 0;
        }

        let capacity = self.received.len() as u16;
        let lost = distance - 1;
        let recorded = lost.min(capacity);
        let first = seq.wrapping_sub(recorded);
        for offset in 0..recorded {
            self.pending.push_back(NackInfo {
                sequence_number: first.wrapping_add(offset),
                last_sent_at: now,
                retries: 0,
            });
        }
        while self.pending.len() > capacity as usize {
            self.pending.pop_front();
        }
        if lost > 0 {
            tracing::trace!(lost, latest = self.latest, seq, "gap detected");
        }

        self.latest = seq;
        recorded as usize
    }

    /// Build the next NACK round, or `None` if gated or nothing is due.
    pub fn build_feedback(&mut self, now: Instant) -> Option<Vec<NackPair>> {
        if let Some(last) = self.last_round {
            if now.saturating_duration_since(last) < self.config.interval {
                return None;
            }
        }

        let max_retries = self.config.max_retries;
        let received = &self.received;
        self.pending.retain(|info| {
            let idx = info.sequence_number as usize % received.len();
            received[idx] != Some(info.sequence_number)
                && info.retries <= max_retries
                && info.retries < u8::MAX
        });

        let first_send_delay = self.config.first_send_delay;
        let mut pairs = Vec::new();
        let mut current: Option<NackPair> = None;

        for info in self.pending.iter_mut() {
            if info.retries == 0 && now.saturating_duration_since(info.last_sent_at) < first_send_delay {
                continue;
            }
            info.last_sent_at = now;
            info.retries = info.retries.saturating_add(1);

            let seq = info.sequence_number;
            match current.as_mut() {
                Some(pair) => {
                    let delta = seq.wrapping_sub(pair.packet_id).wrapping_sub(1);
                    if delta > 15 {
                        pairs.push(*pair);
                        *pair = NackPair {
                            packet_id: seq,
                            lost_packets: 0,
                        };
                    } else {
                        pair.lost_packets |= 1 << delta;
                    }
                }
                None => {
                    current = Some(NackPair {
                        packet_id: seq,
                        lost_packets: 0,
                    });
                }
            }
        }
        pairs.extend(current);

        if pairs.is_empty() {
            return None;
        }

        self.last_round = Some(now);
        tracing::debug!(
            pairs = pairs.len(),
            pending = self.pending.len(),
            "NACK round built"
        );
        Some(pairs)
    }

    fn slot(&self, seq: u16) -> usize {
        seq as usize % self.received.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;

    fn packet(seq: u16) -> MediaPacket {
        MediaPacket {
            sequence_number: seq,
            timestamp: 0,
            ssrc: 333_333_333,
            payload_type: 102,
            marker: false,
            is_key_frame: false,
            payload: Bytes::new(),
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn pair_sequence_numbers() {
        let pair = NackPair {
            packet_id: 65534,
            lost_packets: 0b101,
        };
        let seqs: Vec<u16> = pair.sequence_numbers().collect();
        assert_eq!(seqs, vec![65534, 65535, 1]);
    }

    #[test]
    fn pairs_split_when_distance_exceeds_16() {
        let t0 = Instant::now();
        let mut tracker = LossTracker::new(NackConfig::default());

        tracker.observe(&packet(9), t0);
        assert_eq!(tracker.observe(&packet(13), t0), 3);
        for seq in 14..=29 {
            assert_eq!(tracker.observe(&packet(seq), t0), 0);
        }
        assert_eq!(tracker.observe(&packet(31), t0), 1);

        let pairs = tracker.build_feedback(t0 + ms(10)).expect("losses due");
        assert_eq!(
            pairs,
            vec![
                NackPair {
                    packet_id: 10,
                    lost_packets: 0b11
                },
                NackPair {
                    packet_id: 30,
                    lost_packets: 0
                },
            ]
        );
    }

    #[test]
    fn first_send_waits_for_cooldown() {
        let t0 = Instant::now();
        let mut tracker = LossTracker::new(NackConfig::default());
        tracker.observe(&packet(1), t0);
        tracker.observe(&packet(3), t0);

        assert!(tracker.build_feedback(t0 + ms(2)).is_none());
        assert!(tracker.build_feedback(t0 + ms(6)).is_some());
    }

    #[test]
    fn rounds_are_rate_limited() {
        let t0 = Instant::now();
        let mut tracker = LossTracker::new(NackConfig::default());
        tracker.observe(&packet(1), t0);
        tracker.observe(&packet(3), t0);

        assert!(tracker.build_feedback(t0 + ms(10)).is_some());
        assert!(tracker.build_feedback(t0 + ms(20)).is_none());
        assert!(tracker.build_feedback(t0 + ms(30)).is_some());
    }

    #[test]
    fn received_packets_are_pruned() {
        let t0 = Instant::now();
        let mut tracker = LossTracker::new(NackConfig::default());
        tracker.observe(&packet(1), t0);
        tracker.observe(&packet(4), t0);
        tracker.observe(&packet(2), t0);

        let pairs = tracker.build_feedback(t0 + ms(10)).unwrap();
        assert_eq!(
            pairs,
            vec![NackPair {
                packet_id: 3,
                lost_packets: 0
            }]
        );
        assert_eq!(tracker.pending().count(), 1);

        tracker.observe(&packet(3), t0 + ms(15));
        assert!(tracker.build_feedback(t0 + ms(40)).is_none());
        assert_eq!(tracker.pending().count(), 0);
    }

    #[test]
    fn retries_exhaust() {
        let t0 = Instant::now();
        let config = NackConfig {
            max_retries: 2,
            ..NackConfig::default()
        };
        let mut tracker = LossTracker::new(config);
        tracker.observe(&packet(1), t0);
        tracker.observe(&packet(3), t0);

        let mut rounds = 0;
        for i in 1..10u64 {
            if tracker.build_feedback(t0 + ms(i * 25)).is_some() {
                rounds += 1;
            }
        }
        assert_eq!(rounds, 3, "initial send plus two retries");
        assert_eq!(tracker.pending().count(), 0);
    }

    #[test]
    fn retry_count_saturates_at_u8_max() {
        let t0 = Instant::now();
        let config = NackConfig {
            max_retries: u8::MAX,
            ..NackConfig::default()
        };
        let mut tracker = LossTracker::new(config);
        tracker.observe(&packet(1), t0);
        tracker.observe(&packet(3), t0);

        let mut rounds = 0;
        for i in 1..300u64 {
            if tracker.build_feedback(t0 + ms(i * 25)).is_some() {
                rounds += 1;
            }
        }
        assert_eq!(rounds, 255);
        assert_eq!(tracker.pending().count(), 0);
    }

    #[test]
    fn large_jump_is_not_loss() {
        let t0 = Instant::now();
        let mut tracker = LossTracker::new(NackConfig::default());
        tracker.observe(&packet(100), t0);
        assert_eq!(tracker.observe(&packet(100 + 0x2000), t0), 0);
        assert_eq!(tracker.observe(&packet(100 + 0x2002), t0), 1);
    }

    #[test]
    fn gap_across_wrap() {
        let t0 = Instant::now();
        let mut tracker = LossTracker::new(NackConfig::default());
        tracker.observe(&packet(65534), t0);
        assert_eq!(tracker.observe(&packet(1), t0), 2);
        let seqs: Vec<u16> = tracker.pending().map(|n| n.sequence_number).collect();
        assert_eq!(seqs, vec![65535, 0]);
    }

    #[test]
    fn pending_bounded_by_capacity() {
        let t0 = Instant::now();
        let config = NackConfig {
            capacity: 8,
            ..NackConfig::default()
        };
        let mut tracker = LossTracker::new(config);
        tracker.observe(&packet(0), t0);
        assert_eq!(tracker.observe(&packet(20), t0), 8);
        tracker.observe(&packet(30), t0);
        let seqs: Vec<u16> = tracker.pending().map(|n| n.sequence_number).collect();
        assert_eq!(seqs, (22..=29).collect::<Vec<u16>>());
    }
}

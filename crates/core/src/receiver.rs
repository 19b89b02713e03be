//! Receive side of one H.264 RTP stream.
//!
//! ```text
//! datagram -> MediaPacket::parse -> LossTracker ──> NACK rounds
//!                                 -> JitterBuffer -> H264Depacketizer -> NAL units
//! ```

use std::time::Instant;

use bytes::Bytes;

use crate::buffer::{ExtendedSequence, JitterBuffer, SequenceTracker};
use crate::config::{JitterConfig, NackConfig};
use crate::error::Result;
use crate::feedback::LossTracker;
use crate::feedback::rtcp::Nack;
use crate::media::depacketizer::H264Depacketizer;
use crate::media::rtp::MediaPacket;

/// Reorders, loss-tracks and depacketizes one incoming video stream.
#[derive(Debug)]
pub struct RtpReceiver {
    sender_ssrc: u32,
    arrivals: SequenceTracker,
    losses: LossTracker,
    jitter: JitterBuffer,
    depacketizer: H264Depacketizer,
    skipped_seen: u64,
    received: u64,
}

impl RtpReceiver {
    pub fn new(jitter: &JitterConfig, nack: NackConfig, clock_rate: u32) -> Self {
        Self {
            sender_ssrc: rand::random::<u32>(),
            arrivals: SequenceTracker::new(),
            losses: LossTracker::new(nack),
            jitter: JitterBuffer::new(jitter, clock_rate),
            depacketizer: H264Depacketizer::new(),
            skipped_seen: 0,
            received: 0,
        }
    }

    /// SSRC this receiver uses as the sender of its RTCP feedback.
    pub fn sender_ssrc(&self) -> u32 {
        self.sender_ssrc
    }

    /// SSRC of the received stream, latched by the first packet.
    pub fn media_ssrc(&self) -> Option<u32> {
        self.losses.media_ssrc()
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    /// Highest extended sequence number that has arrived.
    pub fn highest(&self) -> u32 {
        self.arrivals.highest()
    }

    /// Extended sequence number of the last packet handed to the depacketizer.
    pub fn last_released(&self) -> Option<ExtendedSequence> {
        self.jitter.last_released()
    }

    /// Packets given up on by the jitter buffer.
    pub fn skipped(&self) -> u64 {
        self.jitter.skipped()
    }

    /// Parse and push one RTP datagram.
    pub fn push_datagram(&mut self, buf: &[u8], now: Instant) -> Result<Vec<Bytes>> {
        let packet = MediaPacket::parse(buf)?;
        Ok(self.push(packet, now))
    }

    /// Push one packet and return every NAL unit it completes, in order.
    pub fn push(&mut self, packet: MediaPacket, now: Instant) -> Vec<Bytes> {
        if let Some(ssrc) = self.losses.media_ssrc() {
            if ssrc != packet.ssrc {
                tracing::trace!(expected = ssrc, got = packet.ssrc, "foreign ssrc dropped");
                return Vec::new();
            }
        }

        self.received += 1;
        self.arrivals.update(packet.sequence_number);
        self.losses.observe(&packet, now);
        if !self.jitter.add(packet) {
            return Vec::new();
        }

        let mut nals = Vec::new();
        loop {
            let Some(packet) = self.jitter.drain().next() else {
                break;
            };
            // a hole was skipped before this packet, so any open fragment is broken
            if self.jitter.skipped() != self.skipped_seen {
                self.skipped_seen = self.jitter.skipped();
                self.depacketizer.reset();
            }
            nals.extend(self.depacketizer.push(&packet.payload).nals);
        }
        nals
    }

    /// Next NACK round for the received stream, if one is due.
    pub fn poll_nack(&mut self, now: Instant) -> Option<Nack> {
        let media_ssrc = self.losses.media_ssrc()?;
        let pairs = self.losses.build_feedback(now)?;
        Some(Nack {
            sender_ssrc: self.sender_ssrc,
            media_ssrc,
            pairs,
        })
    }
}

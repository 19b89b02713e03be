use bytes::Bytes;

use super::rtp::{MediaPacket, RtpHeader};
use super::{MediaKind, Packetizer};

/// Opus RTP packetizer (RFC 7587).
///
/// One Opus frame maps to exactly one RTP packet, so every packet carries
/// the marker bit. The RTP clock is always 48 kHz regardless of the
/// encoder's internal sample rate (RFC 7587 §4.1).
#[derive(Debug)]
pub struct OpusPacketizer {
    header: RtpHeader,
    channels: u8,
}

impl OpusPacketizer {
    pub fn new(pt: u8, ssrc: u32, channels: u8) -> Self {
        Self {
            header: RtpHeader::randomized(pt, ssrc),
            channels,
        }
    }
}

impl Packetizer for OpusPacketizer {
    fn packetize(&mut self, encoded_data: &[u8], timestamp_increment: u32) -> Vec<MediaPacket> {
        self.header.advance_timestamp(timestamp_increment);
        if encoded_data.is_empty() {
            return Vec::new();
        }
        vec![
            self.header
                .stamp(Bytes::copy_from_slice(encoded_data), true, false),
        ]
    }

    fn kind(&self) -> MediaKind {
        MediaKind::Audio
    }

    fn codec_name(&self) -> &'static str {
        "opus"
    }

    fn clock_rate(&self) -> u32 {
        48000
    }

    fn payload_type(&self) -> u8 {
        self.header.pt
    }

    fn ssrc(&self) -> u32 {
        self.header.ssrc
    }

    /// `a=rtpmap` always advertises two channels (RFC 7587 §7); the
    /// `stereo` fmtp parameter carries the actual preference.
    fn sdp_attributes(&self) -> Vec<String> {
        let pt = self.payload_type();
        vec![
            format!("a=rtpmap:{} opus/48000/2", pt),
            format!("a=rtcp-fb:{} nack", pt),
            format!(
                "a=fmtp:{} minptime=10;useinbandfec=1;stereo={}",
                pt,
                u8::from(self.channels > 1)
            ),
        ]
    }
}

//! Media codecs, RTP packetization and depacketization.
//!
//! This module provides the [`Packetizer`] trait and codec-specific
//! implementations that convert encoded frames into [`rtp::MediaPacket`]s,
//! plus the receive-side [`depacketizer::H264Depacketizer`].
//!
//! ## RTP overview (RFC 3550)
//!
//! Each encoded frame is split into one or more RTP packets. Every packet
//! carries a 12-byte fixed header containing:
//!
//! - **Sequence number** (16-bit, wrapping): reordering and loss detection.
//! - **Timestamp** (32-bit): media clock, 90 kHz for video, 48 kHz for Opus.
//! - **SSRC** (32-bit): fixed per media kind so transports can route by it.
//! - **Marker bit**: set on the last packet of an access unit (frame).
//!
//! ## Supported codecs
//!
//! | Codec | Module | RFC |
//! |-------|--------|-----|
//! | H.264 | [`h264`] | [RFC 6184](https://tools.ietf.org/html/rfc6184) |
//! | Opus  | [`opus`] | [RFC 7587](https://tools.ietf.org/html/rfc7587) |

use std::fmt;

pub mod depacketizer;
pub mod h264;
pub mod opus;
pub mod rtp;

/// Media kind of a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    /// Media type token used on SDP `m=` lines.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Codec-specific RTP packetizer.
///
/// The generic RTP header is handled by [`rtp::RtpHeader`]; packetizers
/// compose it rather than reimplementing header state.
pub trait Packetizer: Send {
    /// Packetize one encoded frame into RTP packets.
    ///
    /// `timestamp_increment` advances the RTP timestamp *before* this frame
    /// is stamped, so it is the media-time distance from the previous frame
    /// in clock ticks. The first frame of a stream passes 0.
    fn packetize(&mut self, encoded_data: &[u8], timestamp_increment: u32) -> Vec<rtp::MediaPacket>;

    fn kind(&self) -> MediaKind;

    /// Codec name for the SDP `a=rtpmap` attribute (e.g. `"H264"`, `"opus"`).
    fn codec_name(&self) -> &'static str;

    /// RTP clock rate in Hz.
    fn clock_rate(&self) -> u32;

    /// RTP payload type number (RFC 3551). Dynamic types use 96–127.
    fn payload_type(&self) -> u8;

    fn ssrc(&self) -> u32;

    /// SDP media-level attribute lines for this codec, `a=` prefix included.
    fn sdp_attributes(&self) -> Vec<String>;
}

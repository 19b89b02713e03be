use bytes::Bytes;

use crate::error::{ParseErrorKind, RelayError, Result};

/// Length of the fixed RTP header (RFC 3550 §5.1) without CSRCs.
pub const RTP_HEADER_LEN: usize = 12;

/// Per-stream RTP header state (RFC 3550 §5.1).
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
///
/// Shared by all codec packetizers. It manages:
/// - **Sequence number**: 16-bit, wrapping, incremented on every packet.
/// - **Timestamp**: stored as u64 internally; the lower 32 bits are
///   written to the wire.
/// - **SSRC**: fixed per media type so transports can route by it.
#[derive(Debug)]
pub struct RtpHeader {
    /// RTP payload type (7-bit, RFC 3551).
    pub pt: u8,
    /// Synchronization source identifier (RFC 3550 §8.1).
    pub ssrc: u32,
    sequence: u16,
    timestamp: u64,
}

impl RtpHeader {
    /// Create header state starting at sequence 0.
    pub fn new(pt: u8, ssrc: u32) -> Self {
        tracing::debug!(
            pt,
            ssrc = format_args!("{:#010X}", ssrc),
            "RTP header state created"
        );
        Self {
            pt,
            ssrc,
            sequence: 0,
            timestamp: 0,
        }
    }

    /// Create header state with random initial sequence number and timestamp.
    ///
    /// RFC 3550 §5.1 recommends random starting values for both fields.
    pub fn randomized(pt: u8, ssrc: u32) -> Self {
        let mut header = Self::new(pt, ssrc);
        header.sequence = rand::random::<u16>();
        header.timestamp = rand::random::<u32>() as u64;
        header
    }

    /// Sequence number the next stamped packet will carry.
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Current timestamp (internal u64 representation).
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Wrap a payload into a [`MediaPacket`] and advance the sequence number.
    ///
    /// The `marker` bit signals the last packet of a frame (RFC 6184 §5.1).
    pub fn stamp(&mut self, payload: Bytes, marker: bool, is_key_frame: bool) -> MediaPacket {
        let packet = MediaPacket {
            sequence_number: self.sequence,
            timestamp: self.timestamp as u32,
            ssrc: self.ssrc,
            payload_type: self.pt,
            marker,
            is_key_frame,
            payload,
        };
        self.sequence = self.sequence.wrapping_add(1);
        packet
    }

    /// Advance the RTP timestamp by the given number of clock ticks.
    pub fn advance_timestamp(&mut self, increment: u32) {
        self.timestamp = self.timestamp.wrapping_add(increment as u64);
    }
}

/// One RTP packet as it travels through the relay.
///
/// Cloning is cheap: the payload is reference-counted, so the same packet
/// can sit in every subscriber's retransmission cache at once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaPacket {
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload_type: u8,
    pub marker: bool,
    /// Set on every packet belonging to a key-frame access unit.
    /// Not carried on the wire.
    pub is_key_frame: bool,
    pub payload: Bytes,
}

impl MediaPacket {
    /// Serialize the 12-byte fixed header.
    ///
    /// Version is always 2. Padding, extension and CSRC count are always 0.
    pub fn header_bytes(&self) -> [u8; RTP_HEADER_LEN] {
        let mut header = [0u8; RTP_HEADER_LEN];
        header[0] = 2 << 6;
        header[1] = ((self.marker as u8) << 7) | (self.payload_type & 0x7f);
        header[2..4].copy_from_slice(&self.sequence_number.to_be_bytes());
        header[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        header
    }

    /// Serialize header and payload into one datagram.
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(RTP_HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.header_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse an RTP datagram.
    ///
    /// CSRC entries and a header extension (RFC 3550 §5.3.1) are skipped;
    /// trailing padding is stripped.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < RTP_HEADER_LEN {
            return Err(RelayError::parse(ParseErrorKind::Truncated));
        }
        if buf[0] >> 6 != 2 {
            return Err(RelayError::parse(ParseErrorKind::InvalidVersion));
        }

        let has_padding = buf[0] & 0x20 != 0;
        let has_extension = buf[0] & 0x10 != 0;
        let csrc_count = (buf[0] & 0x0f) as usize;

        let mut offset = RTP_HEADER_LEN + csrc_count * 4;
        if has_extension {
            if buf.len() < offset + 4 {
                return Err(RelayError::parse(ParseErrorKind::Truncated));
            }
            let words = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
            offset += 4 + words * 4;
        }
        if buf.len() < offset {
            return Err(RelayError::parse(ParseErrorKind::Truncated));
        }

        let mut end = buf.len();
        if has_padding {
            let pad = buf[end - 1] as usize;
            if pad == 0 || offset + pad > end {
                return Err(RelayError::parse(ParseErrorKind::InvalidPadding));
            }
            end -= pad;
        }

        Ok(Self {
            sequence_number: u16::from_be_bytes([buf[2], buf[3]]),
            timestamp: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            ssrc: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            payload_type: buf[1] & 0x7f,
            marker: buf[1] & 0x80 != 0,
            is_key_frame: false,
            payload: Bytes::copy_from_slice(&buf[offset..end]),
        })
    }
}

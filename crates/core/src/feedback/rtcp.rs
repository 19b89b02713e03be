//! RTCP transport-layer and payload-specific feedback (RFC 4585 §6).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|   FMT   |       PT      |          length               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                  SSRC of packet sender                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                  SSRC of media source                         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! :            Feedback Control Information (FCI)                 :
//! ```
//!
//! Only generic NACK (PT 205, FMT 1) and PLI (PT 206, FMT 1) are decoded;
//! everything else in a compound packet is reported as
//! [`FeedbackPacket::Other`].

use super::nack::NackPair;
use crate::error::{ParseErrorKind, RelayError, Result};

pub const PT_RTPFB: u8 = 205;
pub const PT_PSFB: u8 = 206;
const FMT_GENERIC_NACK: u8 = 1;
const FMT_PLI: u8 = 1;
const FEEDBACK_HEADER_LEN: usize = 12;

/// Generic NACK: the sender of `media_ssrc` should resend the listed packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nack {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
    pub pairs: Vec<NackPair>,
}

impl Nack {
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = feedback_header(
            FMT_GENERIC_NACK,
            PT_RTPFB,
            self.pairs.len(),
            self.sender_ssrc,
            self.media_ssrc,
        );
        for pair in &self.pairs {
            out.extend_from_slice(&pair.packet_id.to_be_bytes());
            out.extend_from_slice(&pair.lost_packets.to_be_bytes());
        }
        out
    }

    /// All requested sequence numbers in report order.
    pub fn sequence_numbers(&self) -> impl Iterator<Item = u16> + '_ {
        self.pairs.iter().flat_map(|pair| pair.sequence_numbers())
    }
}

/// Picture loss indication: the receiver wants a key frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pli {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
}

impl Pli {
    pub fn marshal(&self) -> Vec<u8> {
        feedback_header(FMT_PLI, PT_PSFB, 0, self.sender_ssrc, self.media_ssrc)
    }
}

/// One decoded RTCP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedbackPacket {
    Nack(Nack),
    Pli(Pli),
    /// Any other RTCP packet, identified by its packet type.
    Other(u8),
}

/// RTP/RTCP demultiplexing on a shared port (RFC 5761 §4).
pub fn is_rtcp(buf: &[u8]) -> bool {
    buf.len() >= 2 && (192..=223).contains(&buf[1])
}

/// Parse a compound RTCP packet.
pub fn parse_compound(buf: &[u8]) -> Result<Vec<FeedbackPacket>> {
    let mut packets = Vec::new();
    let mut offset = 0usize;

    while offset < buf.len() {
        let rest = &buf[offset..];
        if rest.len() < 4 {
            return Err(RelayError::parse(ParseErrorKind::Truncated));
        }
        if rest[0] >> 6 != 2 {
            return Err(RelayError::parse(ParseErrorKind::InvalidVersion));
        }

        let fmt = rest[0] & 0x1f;
        let pt = rest[1];
        let len = (u16::from_be_bytes([rest[2], rest[3]]) as usize + 1) * 4;
        if len > rest.len() {
            return Err(RelayError::parse(ParseErrorKind::InvalidLength));
        }
        let packet = &rest[..len];

        packets.push(match (pt, fmt) {
            (PT_RTPFB, FMT_GENERIC_NACK) => FeedbackPacket::Nack(parse_nack(packet)?),
            (PT_PSFB, FMT_PLI) => FeedbackPacket::Pli(parse_pli(packet)?),
            _ => FeedbackPacket::Other(pt),
        });
        offset += len;
    }

    Ok(packets)
}

fn parse_ssrcs(packet: &[u8]) -> Result<(u32, u32)> {
    if packet.len() < FEEDBACK_HEADER_LEN {
        return Err(RelayError::parse(ParseErrorKind::Truncated));
    }
    Ok((
        u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]),
        u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]),
    ))
}

fn parse_nack(packet: &[u8]) -> Result<Nack> {
    let (sender_ssrc, media_ssrc) = parse_ssrcs(packet)?;
    let pairs = packet[FEEDBACK_HEADER_LEN..]
        .chunks_exact(4)
        .map(|fci| NackPair {
            packet_id: u16::from_be_bytes([fci[0], fci[1]]),
            lost_packets: u16::from_be_bytes([fci[2], fci[3]]),
        })
        .collect();
    Ok(Nack {
        sender_ssrc,
        media_ssrc,
        pairs,
    })
}

fn parse_pli(packet: &[u8]) -> Result<Pli> {
    let (sender_ssrc, media_ssrc) = parse_ssrcs(packet)?;
    Ok(Pli {
        sender_ssrc,
        media_ssrc,
    })
}

fn feedback_header(fmt: u8, pt: u8, fci_words: usize, sender: u32, media: u32) -> Vec<u8> {
    let length = (2 + fci_words) as u16;
    let mut out = Vec::with_capacity(FEEDBACK_HEADER_LEN + fci_words * 4);
    out.push((2 << 6) | (fmt & 0x1f));
    out.push(pt);
    out.extend_from_slice(&length.to_be_bytes());
    out.extend_from_slice(&sender.to_be_bytes());
    out.extend_from_slice(&media.to_be_bytes());
    out
}

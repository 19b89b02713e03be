//! SDP offer/answer bodies for plain RTP sessions (RFC 8866, RFC 3264).
//!
//! ```text
//! v=0                                          ← protocol version
//! o=- <sess-id> 1 IN IP4 <addr>                ← origin
//! s=rtmp-rtc-relay                             ← session name
//! c=IN IP4 <addr>                              ← connection address
//! t=0 0                                        ← timing (live stream)
//! a=tool:rtmp-rtc-relay
//! a=sendonly                                   ← direction
//! m=video <port> RTP/AVPF 102                  ← one section per track
//! a=mid:video
//! a=rtcp-mux                                   ← RTCP on the RTP port (RFC 5761)
//! a=rtpmap:102 H264/90000
//! a=rtcp-fb:102 nack                           ← generic NACK (RFC 4585)
//! a=fmtp:102 ...
//! ```

use std::net::{IpAddr, SocketAddr};

use super::TrackSpec;
use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::media::MediaKind;

const SESSION_NAME: &str = "rtmp-rtc-relay";

/// Media direction attribute (RFC 3264 §5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    SendOnly,
    RecvOnly,
    SendRecv,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SendOnly => "sendonly",
            Self::RecvOnly => "recvonly",
            Self::SendRecv => "sendrecv",
        }
    }
}

/// Generate a session description announcing `tracks` at `addr`.
///
/// All tracks share the one port (RTP and RTCP multiplexed).
pub fn generate_sdp(
    addr: SocketAddr,
    session_id: u64,
    direction: Direction,
    tracks: &[TrackSpec],
) -> String {
    let ip = addr.ip();
    let mut sdp: Vec<String> = Vec::new();

    sdp.push("v=0".to_string());
    sdp.push(format!("o=- {} 1 IN {} {}", session_id, addr_type(ip), ip));
    sdp.push(format!("s={}", SESSION_NAME));
    sdp.push(format!("c=IN {} {}", addr_type(ip), ip));
    sdp.push("t=0 0".to_string());
    sdp.push(format!("a=tool:{}", SESSION_NAME));
    sdp.push(format!("a={}", direction.as_str()));

    for track in tracks {
        sdp.push(format!(
            "m={} {} RTP/AVPF {}",
            track.kind,
            addr.port(),
            track.payload_type
        ));
        sdp.push(format!("a=mid:{}", track.kind));
        sdp.push("a=rtcp-mux".to_string());
        sdp.extend(track.sdp_attributes.iter().cloned());
        sdp.push(format!("a=ssrc:{} cname:{}", track.ssrc, SESSION_NAME));
    }

    tracing::trace!("SDP: {}", sdp.join("\r\n"));

    format!("{}\r\n", sdp.join("\r\n"))
}

/// Build a receive-only offer for a plain RTP receiver listening on `addr`.
pub fn receiver_offer(addr: SocketAddr, config: &RelayConfig, kinds: &[MediaKind]) -> String {
    let tracks: Vec<TrackSpec> = kinds
        .iter()
        .map(|&kind| {
            let (pt, clock_rate, rtpmap) = match kind {
                MediaKind::Video => (
                    config.video_payload_type,
                    config.video_clock_rate,
                    format!(
                        "a=rtpmap:{} H264/{}",
                        config.video_payload_type, config.video_clock_rate
                    ),
                ),
                MediaKind::Audio => (
                    config.audio_payload_type,
                    config.audio_clock_rate,
                    format!("a=rtpmap:{} opus/48000/2", config.audio_payload_type),
                ),
            };
            TrackSpec {
                kind,
                ssrc: rand::random::<u32>(),
                payload_type: pt,
                clock_rate,
                sdp_attributes: vec![rtpmap, format!("a=rtcp-fb:{} nack", pt)],
            }
        })
        .collect();

    generate_sdp(addr, rand::random::<u32>() as u64, Direction::RecvOnly, &tracks)
}

/// One accepted media section of a remote description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMedia {
    pub kind: MediaKind,
    /// Where RTP (and multiplexed RTCP) for this section is sent.
    pub addr: SocketAddr,
    pub payload_types: Vec<u8>,
}

/// Extract per-media endpoints from a remote description.
///
/// Sections with port 0 (rejected) and media other than audio/video are
/// skipped. A media-level `c=` overrides the session-level one.
pub fn parse_remote_media(sdp: &str) -> Result<Vec<RemoteMedia>> {
    let mut session_ip: Option<IpAddr> = None;
    let mut sections: Vec<PendingSection> = Vec::new();

    for line in sdp.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(rest) = line.strip_prefix("m=") {
            sections.push(parse_media_line(rest)?);
        } else if let Some(rest) = line.strip_prefix("c=") {
            let ip = parse_connection_line(rest)?;
            match sections.last_mut() {
                Some(section) => section.ip = Some(ip),
                None => session_ip = Some(ip),
            }
        }
    }

    let mut media = Vec::new();
    for section in sections {
        let Some(kind) = section.kind else {
            continue;
        };
        if section.port == 0 {
            tracing::debug!(%kind, "remote rejected media section");
            continue;
        }
        let ip = section.ip.or(session_ip).ok_or_else(|| {
            RelayError::Negotiation(format!("no connection address for {}", kind))
        })?;
        media.push(RemoteMedia {
            kind,
            addr: SocketAddr::new(ip, section.port),
            payload_types: section.payload_types,
        });
    }

    if media.is_empty() {
        return Err(RelayError::Negotiation(
            "remote description has no usable media".to_string(),
        ));
    }
    Ok(media)
}

struct PendingSection {
    kind: Option<MediaKind>,
    port: u16,
    payload_types: Vec<u8>,
    ip: Option<IpAddr>,
}

/// `<media> <port>[/<count>] <proto> <fmt> ...`
fn parse_media_line(rest: &str) -> Result<PendingSection> {
    let mut parts = rest.split_whitespace();
    let media = parts.next();
    let port = parts
        .next()
        .and_then(|p| p.split('/').next())
        .and_then(|p| p.parse::<u16>().ok())
        .ok_or_else(|| RelayError::Negotiation(format!("bad media line: m={}", rest)))?;
    let _proto = parts.next();
    let payload_types = parts.filter_map(|pt| pt.parse::<u8>().ok()).collect();

    let kind = match media {
        Some("video") => Some(MediaKind::Video),
        Some("audio") => Some(MediaKind::Audio),
        _ => None,
    };
    Ok(PendingSection {
        kind,
        port,
        payload_types,
        ip: None,
    })
}

/// `IN IP4 <addr>[/<ttl>]`
fn parse_connection_line(rest: &str) -> Result<IpAddr> {
    rest.split_whitespace()
        .nth(2)
        .and_then(|addr| addr.split('/').next())
        .and_then(|addr| addr.parse::<IpAddr>().ok())
        .ok_or_else(|| RelayError::Negotiation(format!("bad connection line: c={}", rest)))
}

fn addr_type(ip: IpAddr) -> &'static str {
    match ip {
        IpAddr::V4(_) => "IP4",
        IpAddr::V6(_) => "IP6",
    }
}

//! Peer session collaborators.
//!
//! A [`PeerSession`] is one negotiated media session with one subscriber:
//! it exchanges SDP, reports connection state, carries outbound RTP through
//! [`MediaTrack`]s and delivers inbound RTCP feedback. The relay core only
//! depends on these traits; [`crate::transport::udp`] provides a plain
//! RTP/UDP implementation.
//!
//! ## Connection lifecycle
//!
//! ```text
//! New -> Connecting -> Connected -> Disconnected -> Connected
//!                           \             \
//!                            +-> Failed    +-> Closed
//! ```

pub mod sdp;

use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::feedback::rtcp::FeedbackPacket;
use crate::media::MediaKind;
use crate::media::rtp::MediaPacket;

/// Connection state reported by a [`PeerSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpType {
    Offer,
    Answer,
}

impl SdpType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
        }
    }
}

/// An SDP body tagged with its role in the offer/answer exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Everything a session needs to announce and send one outbound track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackSpec {
    pub kind: MediaKind,
    pub ssrc: u32,
    pub payload_type: u8,
    pub clock_rate: u32,
    /// Media-level SDP lines (`a=rtpmap`, `a=fmtp`, `a=rtcp-fb`).
    pub sdp_attributes: Vec<String>,
}

pub type StateCallback = Box<dyn Fn(ConnectionState) + Send + Sync>;

/// Outbound media track of a session.
pub trait MediaTrack: Send + Sync {
    fn kind(&self) -> MediaKind;

    fn write_rtp(&self, packet: &MediaPacket) -> Result<()>;
}

/// One negotiated media session with a single peer.
pub trait PeerSession: Send + Sync {
    fn create_offer(&self) -> Result<SessionDescription>;

    /// Requires the remote offer to be set first.
    fn create_answer(&self) -> Result<SessionDescription>;

    fn set_local_description(&self, description: &SessionDescription) -> Result<()>;

    fn set_remote_description(&self, description: &SessionDescription) -> Result<()>;

    /// Register the connection state observer, replacing any previous one.
    fn on_connection_state_change(&self, callback: StateCallback);

    fn new_track(&self, spec: TrackSpec) -> Result<Arc<dyn MediaTrack>>;

    /// Block until RTCP arrives.
    ///
    /// Returns `Ok(Some(vec![]))` when a read times out without feedback so
    /// callers can check for cancellation, and `Ok(None)` once the session
    /// is closed.
    fn read_rtcp(&self) -> Result<Option<Vec<FeedbackPacket>>>;

    fn close(&self);
}

/// Creates one [`PeerSession`] per subscriber.
pub trait SessionFactory: Send + Sync {
    fn create_session(&self) -> Result<Arc<dyn PeerSession>>;
}

//! Error types for the relay library.

use std::fmt;

/// Errors that can occur in the relay library.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Source**: [`InvalidStreamUrl`](Self::InvalidStreamUrl),
///   [`Source`](Self::Source): dial/read failures on the ingest side.
/// - **Negotiation**: [`Negotiation`](Self::Negotiation): bad SDP or
///   session setup errors, surfaced to the signaling caller.
/// - **Delivery**: [`UnknownSsrc`](Self::UnknownSsrc),
///   [`TransportNotConfigured`](Self::TransportNotConfigured),
///   [`TransportClosed`](Self::TransportClosed).
/// - **Lifecycle**: [`RouterStopped`](Self::RouterStopped),
///   [`SubscriberNotFound`](Self::SubscriberNotFound),
///   [`StreamNotFound`](Self::StreamNotFound).
/// - **Wire**: [`Parse`](Self::Parse): malformed RTP/RTCP units.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream URL could not be mapped to a stream id.
    #[error("invalid stream url: {0}")]
    InvalidStreamUrl(String),

    /// The media source failed to connect or to deliver packets.
    #[error("source error: {0}")]
    Source(String),

    /// Offer/answer exchange or session setup failed.
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// A packet was written with an SSRC that maps to no track.
    #[error("no track for ssrc {0}")]
    UnknownSsrc(u32),

    /// A track was written before its remote endpoint was known.
    #[error("transport not configured: {0}")]
    TransportNotConfigured(String),

    /// The transport has been stopped or its session failed.
    #[error("transport closed: {0}")]
    TransportClosed(String),

    /// The router was stopped; no new subscribers are accepted.
    #[error("router stopped: {0}")]
    RouterStopped(String),

    /// No subscriber with the given id is attached.
    #[error("subscriber not found: {0}")]
    SubscriberNotFound(String),

    /// No router is registered for the given stream path.
    #[error("stream not found: {0}")]
    StreamNotFound(String),

    /// The audio transform collaborator rejected its input.
    #[error("audio transform error: {0}")]
    Transform(String),

    /// Failed to parse a wire unit.
    #[error("parse error: {kind}")]
    Parse { kind: ParseErrorKind },
}

impl RelayError {
    pub(crate) fn parse(kind: ParseErrorKind) -> Self {
        Self::Parse { kind }
    }
}

/// Specific kind of wire parse failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// Buffer shorter than the fixed header or a declared length.
    Truncated,
    /// RTP/RTCP version field was not 2.
    InvalidVersion,
    /// Padding count larger than the remaining payload.
    InvalidPadding,
    /// RTCP length field did not match the buffer.
    InvalidLength,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "truncated packet"),
            Self::InvalidVersion => write!(f, "invalid version"),
            Self::InvalidPadding => write!(f, "invalid padding"),
            Self::InvalidLength => write!(f, "invalid length"),
        }
    }
}

/// Convenience alias for `Result<T, RelayError>`.
pub type Result<T> = std::result::Result<T, RelayError>;

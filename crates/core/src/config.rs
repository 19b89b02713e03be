use std::time::Duration;

/// Fixed synthetic SSRC stamped on every outbound video packet.
pub const VIDEO_SSRC: u32 = 333_333_333;
/// Fixed synthetic SSRC stamped on every outbound audio packet.
pub const AUDIO_SSRC: u32 = 111_111_111;

/// Relay-wide configuration shared by routers and transports.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Slots per retransmission cache (one cache per track per subscriber).
    pub cache_capacity: u16,
    /// Maximum size of an outbound RTP packet, header included.
    pub mtu: usize,
    /// Payload type advertised for H.264.
    pub video_payload_type: u8,
    /// Payload type advertised for Opus.
    pub audio_payload_type: u8,
    pub video_ssrc: u32,
    pub audio_ssrc: u32,
    /// RTP clock rate for video (RFC 6184 §8.1).
    pub video_clock_rate: u32,
    /// RTP clock rate for Opus (RFC 7587 §4.1).
    pub audio_clock_rate: u32,
    /// Samples per Opus frame at `audio_clock_rate` (20 ms).
    pub audio_frame_samples: u32,
    /// Output channel count requested from the audio transform.
    pub audio_channels: u8,
    /// Opus encoder bitrate in bits per second.
    pub audio_bitrate: u32,
    /// Upper bound on connecting to a source.
    pub dial_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 512,
            mtu: 1200,
            video_payload_type: 102,
            audio_payload_type: 111,
            video_ssrc: VIDEO_SSRC,
            audio_ssrc: AUDIO_SSRC,
            video_clock_rate: 90_000,
            audio_clock_rate: 48_000,
            audio_frame_samples: 960,
            audio_channels: 2,
            audio_bitrate: 64_000,
            dial_timeout: Duration::from_secs(3),
        }
    }
}

/// Receiver-side reorder buffer settings.
#[derive(Debug, Clone)]
pub struct JitterConfig {
    pub capacity: u16,
    /// How long (in media time) a hole may hold back later packets.
    pub max_wait_ms: u32,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            capacity: 512,
            max_wait_ms: 100,
        }
    }
}

/// NACK generation settings (RFC 4585 §6.2.1).
#[derive(Debug, Clone)]
pub struct NackConfig {
    /// Size of the received-sequence ring and cap on pending losses.
    pub capacity: u16,
    /// Minimum spacing between two feedback rounds.
    pub interval: Duration,
    /// A freshly detected loss is not reported before this delay.
    pub first_send_delay: Duration,
    /// Entries retried more often than this are given up.
    pub max_retries: u8,
}

impl Default for NackConfig {
    fn default() -> Self {
        Self {
            capacity: 512,
            interval: Duration::from_millis(20),
            first_send_delay: Duration::from_millis(5),
            max_retries: 20,
        }
    }
}

//! Ingest-side collaborators.
//!
//! A [`SourceConnector`] dials a stream URL and yields a [`MediaSource`]
//! delivering demuxed [`AccessUnit`]s: the shape an RTMP demuxer hands out.
//! Audio is re-encoded through an [`AudioTransform`] before packetization.

pub mod file;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::error::Result;

pub use file::{AnnexBFileSource, FileConnector};

/// One demuxed frame from the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessUnit {
    /// Index into [`MediaSource::codec_parameters`].
    pub stream_index: usize,
    /// Presentation time relative to the start of the stream.
    pub media_time: Duration,
    pub is_key_frame: bool,
    pub payload: Bytes,
}

/// Sample layout of PCM audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    /// Interleaved signed 16-bit.
    S16,
    /// Planar 32-bit float.
    FltP,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u8,
    pub sample_format: SampleFormat,
}

/// Codec description of one source stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecParam {
    /// H.264 video with its parameter sets (NAL units without start codes).
    H264 { sps: Bytes, pps: Bytes },
    /// AAC audio.
    Aac(AudioFormat),
    /// Anything the relay does not forward.
    Other(String),
}

impl fmt::Display for CodecParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::H264 { sps, pps } => {
                write!(f, "H264 (sps {} bytes, pps {} bytes)", sps.len(), pps.len())
            }
            Self::Aac(format) => write!(
                f,
                "AAC {} Hz, {} channel(s)",
                format.sample_rate, format.channels
            ),
            Self::Other(name) => write!(f, "{}", name),
        }
    }
}

/// A connected ingest stream.
///
/// `read_packet` blocks until the next access unit is available. `close`
/// may be called from another thread and must make a pending or later
/// `read_packet` return promptly.
pub trait MediaSource: Send + Sync {
    fn codec_parameters(&self) -> Result<Vec<CodecParam>>;

    /// Next access unit, or `Ok(None)` at end of stream.
    fn read_packet(&self) -> Result<Option<AccessUnit>>;

    fn close(&self);
}

/// Dials stream URLs.
pub trait SourceConnector: Send + Sync {
    fn connect(&self, url: &str, timeout: Duration) -> Result<Arc<dyn MediaSource>>;
}

/// Audio re-encoding stage, AAC in and Opus out.
pub trait AudioTransform: Send {
    fn configure(&mut self, input: &AudioFormat, output: &AudioFormat, bitrate: u32) -> Result<()>;

    /// Transform one input unit into zero or more encoded output frames.
    fn transform(&mut self, unit: &AccessUnit) -> Result<Vec<AccessUnit>>;

    fn close(&mut self);
}

/// Creates one [`AudioTransform`] per router.
pub trait TransformFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn AudioTransform>>;
}

impl<F> TransformFactory for F
where
    F: Fn() -> Result<Box<dyn AudioTransform>> + Send + Sync,
{
    fn create(&self) -> Result<Box<dyn AudioTransform>> {
        self()
    }
}

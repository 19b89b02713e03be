use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use super::{AccessUnit, CodecParam, MediaSource, SourceConnector};
use crate::error::{RelayError, Result};
use crate::media::h264::{NalUnitType, extract_nal_units};

const FILE_SCHEME: &str = "file://";

/// Connects `file://` URLs to H.264 Annex B elementary stream files.
#[derive(Debug, Clone)]
pub struct FileConnector {
    fps: u32,
    paced: bool,
}

impl FileConnector {
    /// Access units are released in real time at `fps`.
    pub fn new(fps: u32) -> Self {
        Self {
            fps: fps.max(1),
            paced: true,
        }
    }

    /// Release access units as fast as they are read.
    pub fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }
}

impl SourceConnector for FileConnector {
    fn connect(&self, url: &str, _timeout: Duration) -> Result<Arc<dyn MediaSource>> {
        let path = url
            .strip_prefix(FILE_SCHEME)
            .ok_or_else(|| RelayError::InvalidStreamUrl(url.to_string()))?;
        let data = std::fs::read(path)
            .map_err(|e| RelayError::Source(format!("cannot open {}: {}", path, e)))?;
        let source = AnnexBFileSource::from_bytes(&data, self.fps, self.paced)?;
        tracing::info!(
            path,
            access_units = source.units.len(),
            fps = self.fps,
            "file source opened"
        );
        Ok(Arc::new(source))
    }
}

#[derive(Debug)]
struct Cursor {
    next: usize,
    started: Option<Instant>,
}

/// Replays an H.264 Annex B file as a live source.
///
/// The bitstream is split into access units the way an RTMP demuxer would
/// deliver them: SPS/PPS are lifted into the codec parameters and every
/// access unit payload is AVCC framed (4-byte lengths).
#[derive(Debug)]
pub struct AnnexBFileSource {
    sps: Bytes,
    pps: Bytes,
    units: Vec<AccessUnit>,
    paced: bool,
    cursor: Mutex<Cursor>,
    closed: AtomicBool,
}

impl AnnexBFileSource {
    pub fn from_bytes(data: &[u8], fps: u32, paced: bool) -> Result<Self> {
        let fps = fps.max(1) as u64;
        let mut sps = None;
        let mut pps = None;
        let mut units = Vec::new();
        let mut current = Picture::default();

        for nal in extract_nal_units(data) {
            let nal_type = NalUnitType::from_header(nal[0]);
            match nal_type {
                NalUnitType::Sps => {
                    sps.get_or_insert_with(|| Bytes::copy_from_slice(nal));
                }
                NalUnitType::Pps => {
                    pps.get_or_insert_with(|| Bytes::copy_from_slice(nal));
                }
                NalUnitType::Aud | NalUnitType::Filler => {}
                t if t.is_vcl() => {
                    // first_mb_in_slice == 0 is coded as a single '1' bit
                    let starts_picture = nal.get(1).is_some_and(|b| b & 0x80 != 0);
                    if starts_picture && current.has_vcl {
                        units.push(current.finish(units.len() as u64, fps));
                    }
                    current.push(nal, t);
                }
                t => {
                    if current.has_vcl {
                        units.push(current.finish(units.len() as u64, fps));
                    }
                    current.push(nal, t);
                }
            }
        }
        if current.has_vcl {
            units.push(current.finish(units.len() as u64, fps));
        }

        let (Some(sps), Some(pps)) = (sps, pps) else {
            return Err(RelayError::Source(
                "no SPS/PPS found in H.264 stream".to_string(),
            ));
        };

        Ok(Self {
            sps,
            pps,
            units,
            paced,
            cursor: Mutex::new(Cursor {
                next: 0,
                started: None,
            }),
            closed: AtomicBool::new(false),
        })
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

impl MediaSource for AnnexBFileSource {
    fn codec_parameters(&self) -> Result<Vec<CodecParam>> {
        Ok(vec![CodecParam::H264 {
            sps: self.sps.clone(),
            pps: self.pps.clone(),
        }])
    }

    fn read_packet(&self) -> Result<Option<AccessUnit>> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(None);
        }

        let (unit, started) = {
            let mut cursor = self.cursor.lock();
            let Some(unit) = self.units.get(cursor.next).cloned() else {
                return Ok(None);
            };
            cursor.next += 1;
            (unit, *cursor.started.get_or_insert_with(Instant::now))
        };

        if self.paced {
            let wait = (started + unit.media_time).saturating_duration_since(Instant::now());
            if !wait.is_zero() {
                std::thread::sleep(wait);
            }
            if self.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }
        }

        Ok(Some(unit))
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("file source closed");
        }
    }
}

#[derive(Default)]
struct Picture {
    payload: Vec<u8>,
    has_vcl: bool,
    is_key_frame: bool,
}

impl Picture {
    fn push(&mut self, nal: &[u8], nal_type: NalUnitType) {
        self.payload
            .extend_from_slice(&(nal.len() as u32).to_be_bytes());
        self.payload.extend_from_slice(nal);
        self.has_vcl |= nal_type.is_vcl();
        self.is_key_frame |= nal_type == NalUnitType::CodedSliceIdr;
    }

    fn finish(&mut self, index: u64, fps: u64) -> AccessUnit {
        let picture = std::mem::take(self);
        AccessUnit {
            stream_index: 0,
            media_time: Duration::from_nanos(index * 1_000_000_000 / fps),
            is_key_frame: picture.is_key_frame,
            payload: Bytes::from(picture.payload),
        }
    }
}

//! One inbound stream fanned out to many subscribers.
//!
//! A [`Router`] dials its source on creation and runs one read loop thread:
//!
//! ```text
//! source.read_packet()
//!   ├─ video AU ─> Annex B assembly ─> H264Packetizer ─┐
//!   └─ audio AU ─> AudioTransform ───> OpusPacketizer ─┴─> every Transport
//! ```
//!
//! Fan-out snapshots the subscriber map under a read lock and writes outside
//! it, so subscribing never waits on network sends and every subscriber
//! sees packets in production order.
//!
//! ## Lifecycle
//!
//! `Created -> Streaming -> Stopped`. Stopping is terminal and idempotent:
//! it cancels the read loop, closes the source, and stops every attached
//! transport. The read loop stops the router itself when the source ends
//! or fails.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::cancel::CancellationToken;
use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::media::h264::{H264Packetizer, assemble_access_unit};
use crate::media::opus::OpusPacketizer;
use crate::media::rtp::MediaPacket;
use crate::media::Packetizer;
use crate::registry::{extract_stream_path, stream_id};
use crate::session::{SessionFactory, TrackSpec};
use crate::source::{
    AccessUnit, AudioFormat, AudioTransform, CodecParam, MediaSource, SampleFormat,
    SourceConnector,
};
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterState {
    Created,
    Streaming,
    Stopped,
}

impl fmt::Display for RouterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Streaming => "streaming",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

struct VideoStream {
    index: usize,
    sps: Bytes,
    pps: Bytes,
}

struct Inner {
    stream_id: String,
    url: String,
    config: RelayConfig,
    source: Arc<dyn MediaSource>,
    sessions: Arc<dyn SessionFactory>,
    video: Option<VideoStream>,
    /// Source stream index of the audio track, if it is forwarded.
    audio_index: Option<usize>,
    video_packetizer: Mutex<Box<dyn Packetizer>>,
    audio_packetizer: Mutex<Box<dyn Packetizer>>,
    transports: RwLock<HashMap<String, Arc<Transport>>>,
    state: Mutex<RouterState>,
    on_stopped: Mutex<Option<StoppedHook>>,
    cancel: CancellationToken,
}

/// Runs once, after the router has stopped and released its subscribers.
pub type StoppedHook = Box<dyn FnOnce() + Send>;

/// Relays one source stream to any number of [`Transport`]s.
pub struct Router {
    inner: Arc<Inner>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Router {
    /// Dial `url` and start streaming.
    ///
    /// Audio is forwarded only when the source has an AAC stream and a
    /// transform is supplied and accepts the configuration.
    pub fn connect(
        url: &str,
        connector: &dyn SourceConnector,
        sessions: Arc<dyn SessionFactory>,
        transform: Option<Box<dyn AudioTransform>>,
        config: RelayConfig,
    ) -> Result<Self> {
        let path = extract_stream_path(url)
            .ok_or_else(|| RelayError::InvalidStreamUrl(url.to_string()))?;
        let stream_id = stream_id(&path).to_string();

        let source = connector.connect(url, config.dial_timeout)?;
        let codecs = match source.codec_parameters() {
            Ok(codecs) => codecs,
            Err(e) => {
                source.close();
                return Err(e);
            }
        };

        let video = codecs.iter().enumerate().find_map(|(index, codec)| match codec {
            CodecParam::H264 { sps, pps } => Some(VideoStream {
                index,
                sps: sps.clone(),
                pps: pps.clone(),
            }),
            _ => None,
        });
        let aac = codecs.iter().enumerate().find_map(|(index, codec)| match codec {
            CodecParam::Aac(format) => Some((index, *format)),
            _ => None,
        });

        for (index, codec) in codecs.iter().enumerate() {
            tracing::debug!(stream_id = %stream_id, index, codec = %codec, "source stream");
        }

        let mut h264 = H264Packetizer::new(config.video_payload_type, config.video_ssrc, config.mtu);
        if let Some(video) = &video {
            h264.set_parameter_sets(&video.sps, &video.pps);
        }
        let opus = OpusPacketizer::new(
            config.audio_payload_type,
            config.audio_ssrc,
            config.audio_channels,
        );

        let (audio_index, transform) = match (aac, transform) {
            (Some((index, input)), Some(mut transform)) => {
                let output = AudioFormat {
                    sample_rate: config.audio_clock_rate,
                    channels: config.audio_channels,
                    sample_format: SampleFormat::S16,
                };
                match transform.configure(&input, &output, config.audio_bitrate) {
                    Ok(()) => (Some(index), Some(transform)),
                    Err(e) => {
                        tracing::warn!(stream_id = %stream_id, error = %e, "audio transform rejected, audio disabled");
                        transform.close();
                        (None, None)
                    }
                }
            }
            (Some(_), None) => {
                tracing::debug!(stream_id = %stream_id, "no audio transform, audio disabled");
                (None, None)
            }
            (None, transform) => {
                if let Some(mut transform) = transform {
                    transform.close();
                }
                (None, None)
            }
        };

        let inner = Arc::new(Inner {
            stream_id,
            url: url.to_string(),
            config,
            source,
            sessions,
            video,
            audio_index,
            video_packetizer: Mutex::new(Box::new(h264)),
            audio_packetizer: Mutex::new(Box::new(opus)),
            transports: RwLock::new(HashMap::new()),
            state: Mutex::new(RouterState::Created),
            on_stopped: Mutex::new(None),
            cancel: CancellationToken::new(),
        });

        let loop_inner = inner.clone();
        let spawned = thread::Builder::new()
            .name(format!("router-{}", inner.stream_id))
            .spawn(move || read_loop(loop_inner, transform));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                inner.source.close();
                return Err(e.into());
            }
        };

        {
            let mut state = inner.state.lock();
            if *state == RouterState::Created {
                *state = RouterState::Streaming;
            }
        }
        tracing::info!(stream_id = %inner.stream_id, url = %inner.url, "router streaming");

        Ok(Self {
            inner,
            reader: Mutex::new(Some(handle)),
        })
    }

    pub fn stream_id(&self) -> &str {
        &self.inner.stream_id
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn state(&self) -> RouterState {
        *self.inner.state.lock()
    }

    /// Register the hook run when the router stops, replacing any previous
    /// one. Runs immediately if the router has already stopped.
    pub fn on_stopped(&self, hook: StoppedHook) {
        let run_now = {
            let mut slot = self.inner.on_stopped.lock();
            if self.state() == RouterState::Stopped {
                Some(hook)
            } else {
                *slot = Some(hook);
                None
            }
        };
        if let Some(hook) = run_now {
            hook();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.transports.read().len()
    }

    pub fn subscriber(&self, id: &str) -> Option<Arc<Transport>> {
        self.inner.transports.read().get(id).cloned()
    }

    /// Outbound track descriptions handed to new sessions.
    pub fn track_specs(&self) -> Vec<TrackSpec> {
        let mut specs = Vec::with_capacity(2);
        if self.inner.video.is_some() {
            specs.push(track_spec(&**self.inner.video_packetizer.lock()));
        }
        if self.inner.audio_index.is_some() {
            specs.push(track_spec(&**self.inner.audio_packetizer.lock()));
        }
        specs
    }

    /// Attach a new subscriber and return its transport.
    pub fn create_subscriber(&self) -> Result<Arc<Transport>> {
        if self.state() == RouterState::Stopped {
            return Err(RelayError::RouterStopped(self.inner.stream_id.clone()));
        }

        let session = self.inner.sessions.create_session()?;
        let transport = Arc::new(Transport::new(
            session,
            self.track_specs(),
            self.inner.config.cache_capacity,
        )?);
        let id = transport.id().to_string();

        let total = {
            let mut transports = self.inner.transports.write();
            transports.insert(id.clone(), transport.clone());
            transports.len()
        };

        // lost a race with stop(): it may have drained the map already
        if self.state() == RouterState::Stopped {
            self.inner.transports.write().remove(&id);
            transport.stop();
            return Err(RelayError::RouterStopped(self.inner.stream_id.clone()));
        }

        tracing::info!(stream_id = %self.inner.stream_id, transport_id = %id, total, "subscriber added");
        Ok(transport)
    }

    /// Detach and stop one subscriber.
    pub fn stop_subscriber(&self, id: &str) -> Result<()> {
        let removed = self.inner.transports.write().remove(id);
        let transport = removed.ok_or_else(|| RelayError::SubscriberNotFound(id.to_string()))?;
        transport.stop();
        tracing::info!(
            stream_id = %self.inner.stream_id,
            transport_id = %id,
            remaining = self.subscriber_count(),
            "subscriber removed"
        );
        Ok(())
    }

    /// Stop streaming and every subscriber. Idempotent.
    pub fn stop(&self) {
        self.inner.shutdown();
        if let Some(handle) = self.reader.lock().take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                tracing::warn!(stream_id = %self.inner.stream_id, "read loop panicked");
            }
        }
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("stream_id", &self.inner.stream_id)
            .field("state", &self.state())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

fn track_spec(packetizer: &dyn Packetizer) -> TrackSpec {
    TrackSpec {
        kind: packetizer.kind(),
        ssrc: packetizer.ssrc(),
        payload_type: packetizer.payload_type(),
        clock_rate: packetizer.clock_rate(),
        sdp_attributes: packetizer.sdp_attributes(),
    }
}

/// Convert a media-time delta to RTP clock ticks.
fn media_ticks(delta: Duration, clock_rate: u32) -> u32 {
    (delta.as_nanos() * clock_rate as u128 / 1_000_000_000) as u32
}

impl Inner {
    fn shutdown(&self) {
        if !self.cancel.cancel() {
            return;
        }
        *self.state.lock() = RouterState::Stopped;
        self.source.close();

        let transports: Vec<Arc<Transport>> = self
            .transports
            .write()
            .drain()
            .map(|(_, transport)| transport)
            .collect();
        for transport in &transports {
            transport.stop();
        }
        tracing::info!(
            stream_id = %self.stream_id,
            subscribers = transports.len(),
            "router stopped"
        );

        // state is already Stopped, so a hook registered after this take runs inline
        let hook = self.on_stopped.lock().take();
        if let Some(hook) = hook {
            hook();
        }
    }

    fn fan_out(&self, packets: &[MediaPacket]) {
        if packets.is_empty() {
            return;
        }
        let snapshot: Vec<Arc<Transport>> = self.transports.read().values().cloned().collect();

        let mut closed = Vec::new();
        for transport in &snapshot {
            for packet in packets {
                match transport.write_rtp(packet) {
                    Ok(()) => {}
                    Err(RelayError::TransportClosed(_)) => {
                        closed.push(transport.clone());
                        break;
                    }
                    Err(e) => {
                        tracing::trace!(transport_id = %transport.id(), error = %e, "write failed");
                    }
                }
            }
        }

        if !closed.is_empty() {
            {
                let mut transports = self.transports.write();
                for transport in &closed {
                    transports.remove(transport.id());
                }
            }
            for transport in closed {
                tracing::info!(stream_id = %self.stream_id, transport_id = %transport.id(), "closed subscriber removed");
                transport.stop();
            }
        }
    }
}

/// Per-loop media clock state.
#[derive(Default)]
struct Clocks {
    last_video: Option<Duration>,
    audio_started: bool,
}

fn read_loop(inner: Arc<Inner>, mut transform: Option<Box<dyn AudioTransform>>) {
    let _guard = SourceGuard(inner.source.clone());
    let mut clocks = Clocks::default();

    while !inner.cancel.is_cancelled() {
        match inner.source.read_packet() {
            Ok(Some(unit)) => route(&inner, &mut clocks, transform.as_deref_mut(), unit),
            Ok(None) => {
                tracing::info!(stream_id = %inner.stream_id, "source ended");
                break;
            }
            Err(e) => {
                if !inner.cancel.is_cancelled() {
                    tracing::warn!(stream_id = %inner.stream_id, error = %e, "source read failed");
                }
                break;
            }
        }
    }

    if let Some(mut transform) = transform {
        transform.close();
    }
    inner.shutdown();
}

fn route(
    inner: &Inner,
    clocks: &mut Clocks,
    transform: Option<&mut (dyn AudioTransform + 'static)>,
    unit: AccessUnit,
) {
    if let Some(video) = inner.video.as_ref().filter(|v| v.index == unit.stream_index) {
        let increment = match clocks.last_video {
            Some(last) => media_ticks(
                unit.media_time.saturating_sub(last),
                inner.config.video_clock_rate,
            ),
            None => 0,
        };
        clocks.last_video = Some(unit.media_time);

        let frame = assemble_access_unit(
            &unit.payload,
            unit.is_key_frame,
            Some((&video.sps[..], &video.pps[..])),
        );
        let packets = inner.video_packetizer.lock().packetize(&frame, increment);
        inner.fan_out(&packets);
        return;
    }

    if inner.audio_index == Some(unit.stream_index) {
        let Some(transform) = transform else {
            return;
        };
        let frames = match transform.transform(&unit) {
            Ok(frames) => frames,
            Err(e) => {
                tracing::warn!(stream_id = %inner.stream_id, error = %e, "audio transform failed, unit dropped");
                return;
            }
        };
        for frame in frames {
            let increment = if clocks.audio_started {
                inner.config.audio_frame_samples
            } else {
                0
            };
            clocks.audio_started = true;
            let packets = inner
                .audio_packetizer
                .lock()
                .packetize(&frame.payload, increment);
            inner.fan_out(&packets);
        }
        return;
    }

    tracing::trace!(
        stream_id = %inner.stream_id,
        index = unit.stream_index,
        "unit from unforwarded stream dropped"
    );
}

/// Closes the source when the read loop exits, however it exits.
struct SourceGuard(Arc<dyn MediaSource>);

impl Drop for SourceGuard {
    fn drop(&mut self) {
        self.0.close();
    }
}

//! Per-subscriber outbound media transport.
//!
//! A [`Transport`] wraps one [`PeerSession`] and owns, per outbound track,
//! a [`RetransmitCache`] of recently sent packets. Packets are routed to a
//! track by their fixed synthetic SSRC. A background feedback thread reads
//! RTCP from the session and answers NACKs out of the cache.
//!
//! ## State machine
//!
//! ```text
//! Negotiating --(session connected)--> Connected
//!      |                                   |
//!      +------(stop / session failed)------+--> Closed
//! ```
//!
//! Writes while `Negotiating` are dropped, not queued. Every transition is
//! published on the channel returned by [`Transport::state_events`].

pub mod udp;

use std::fmt;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};

use crate::buffer::RetransmitCache;
use crate::cancel::CancellationToken;
use crate::error::{RelayError, Result};
use crate::feedback::rtcp::{FeedbackPacket, Nack};
use crate::media::MediaKind;
use crate::media::rtp::MediaPacket;
use crate::session::{ConnectionState, MediaTrack, PeerSession, SdpType, SessionDescription, TrackSpec};

pub use udp::{UdpPeerSession, UdpSessionFactory, UdpTrack};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Negotiating,
    Connected,
    Closed,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Negotiating => "negotiating",
            Self::Connected => "connected",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// One outbound track with its retransmission cache.
struct Lane {
    kind: MediaKind,
    ssrc: u32,
    track: Arc<dyn MediaTrack>,
    cache: RwLock<RetransmitCache>,
}

struct Inner {
    id: String,
    session: Arc<dyn PeerSession>,
    lanes: Vec<Lane>,
    state: Mutex<TransportState>,
    events_tx: Sender<TransportState>,
    events_rx: Receiver<TransportState>,
    local: Mutex<Option<SessionDescription>>,
    cancel: CancellationToken,
}

/// One subscriber's media session plus its retransmission state.
pub struct Transport {
    inner: Arc<Inner>,
    feedback: Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    /// Create tracks for `tracks` on `session` and start serving feedback.
    pub fn new(
        session: Arc<dyn PeerSession>,
        tracks: Vec<TrackSpec>,
        cache_capacity: u16,
    ) -> Result<Self> {
        let id = format!("{:016X}", rand::random::<u64>());

        let mut lanes = Vec::with_capacity(tracks.len());
        for spec in tracks {
            let kind = spec.kind;
            let ssrc = spec.ssrc;
            let track = session.new_track(spec)?;
            lanes.push(Lane {
                kind,
                ssrc,
                track,
                cache: RwLock::new(RetransmitCache::new(cache_capacity)),
            });
        }

        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let inner = Arc::new(Inner {
            id,
            session,
            lanes,
            state: Mutex::new(TransportState::Negotiating),
            events_tx,
            events_rx,
            local: Mutex::new(None),
            cancel: CancellationToken::new(),
        });

        let weak: Weak<Inner> = Arc::downgrade(&inner);
        inner
            .session
            .on_connection_state_change(Box::new(move |state| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_session_state(state);
                }
            }));

        let loop_inner = inner.clone();
        let handle = thread::Builder::new()
            .name(format!("rtcp-{}", &inner.id[..8]))
            .spawn(move || feedback_loop(loop_inner))?;

        tracing::debug!(
            transport_id = %inner.id,
            tracks = inner.lanes.len(),
            "transport created"
        );

        Ok(Self {
            inner,
            feedback: Mutex::new(Some(handle)),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn state(&self) -> TransportState {
        *self.inner.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == TransportState::Connected
    }

    /// Channel of state transitions, in order.
    pub fn state_events(&self) -> Receiver<TransportState> {
        self.inner.events_rx.clone()
    }

    /// Send one packet on the track matching its SSRC.
    ///
    /// Packets written before the session connects are dropped and `Ok` is
    /// returned. Connected packets are cached before they are sent.
    pub fn write_rtp(&self, packet: &MediaPacket) -> Result<()> {
        let lane = self.inner.lane(packet.ssrc)?;

        match self.state() {
            TransportState::Negotiating => {
                tracing::trace!(
                    transport_id = %self.inner.id,
                    seq = packet.sequence_number,
                    "not connected, packet dropped"
                );
                Ok(())
            }
            TransportState::Closed => Err(RelayError::TransportClosed(self.inner.id.clone())),
            TransportState::Connected => {
                lane.cache.write().put(packet.clone());
                lane.track.write_rtp(packet)
            }
        }
    }

    /// Local SDP, created as an offer or answer on first use and cached.
    pub fn local_description(&self, sdp_type: SdpType) -> Result<SessionDescription> {
        let mut local = self.inner.local.lock();
        if let Some(description) = local.as_ref() {
            return Ok(description.clone());
        }

        let description = match sdp_type {
            SdpType::Offer => self.inner.session.create_offer()?,
            SdpType::Answer => self.inner.session.create_answer()?,
        };
        self.inner.session.set_local_description(&description)?;
        *local = Some(description.clone());
        Ok(description)
    }

    pub fn set_remote_description(&self, description: &SessionDescription) -> Result<()> {
        self.inner.session.set_remote_description(description)
    }

    /// Packet cached for `ssrc`/`seq`, if still held.
    pub fn cached(&self, ssrc: u32, seq: u16) -> Option<MediaPacket> {
        let lane = self.inner.lane(ssrc).ok()?;
        let cache = lane.cache.read();
        cache.get(seq).cloned()
    }

    /// Close the session and stop the feedback thread. Idempotent.
    pub fn stop(&self) {
        if !self.inner.cancel.cancel() {
            return;
        }
        self.inner.transition(TransportState::Closed);
        self.inner.session.close();

        if let Some(handle) = self.feedback.lock().take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                tracing::warn!(transport_id = %self.inner.id, "feedback thread panicked");
            }
        }
        tracing::debug!(transport_id = %self.inner.id, "transport stopped");
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Inner {
    fn lane(&self, ssrc: u32) -> Result<&Lane> {
        self.lanes
            .iter()
            .find(|lane| lane.ssrc == ssrc)
            .ok_or(RelayError::UnknownSsrc(ssrc))
    }

    /// Apply a transition if it is allowed from the current state.
    fn transition(&self, to: TransportState) -> bool {
        let mut state = self.state.lock();
        let allowed = matches!(
            (*state, to),
            (TransportState::Negotiating, TransportState::Connected)
                | (TransportState::Negotiating, TransportState::Closed)
                | (TransportState::Connected, TransportState::Closed)
        );
        if !allowed {
            return false;
        }

        tracing::debug!(transport_id = %self.id, from = %*state, to = %to, "transport state");
        *state = to;
        // the receiver lives as long as `self`, so send cannot fail
        let _ = self.events_tx.send(to);
        true
    }

    fn on_session_state(&self, state: ConnectionState) {
        tracing::debug!(transport_id = %self.id, %state, "session state changed");
        match state {
            ConnectionState::Connected => {
                self.transition(TransportState::Connected);
            }
            ConnectionState::Failed | ConnectionState::Closed => {
                self.transition(TransportState::Closed);
            }
            _ => {}
        }
    }

    fn serve_nack(&self, nack: &Nack) {
        let Ok(lane) = self.lane(nack.media_ssrc) else {
            tracing::debug!(
                transport_id = %self.id,
                media_ssrc = nack.media_ssrc,
                "NACK for unknown media ssrc"
            );
            return;
        };

        let mut resent = 0usize;
        let mut missed = 0usize;
        for seq in nack.sequence_numbers() {
            let packet = lane.cache.read().get(seq).cloned();
            match packet {
                Some(packet) => match lane.track.write_rtp(&packet) {
                    Ok(()) => resent += 1,
                    Err(e) => {
                        tracing::debug!(transport_id = %self.id, seq, error = %e, "resend failed");
                    }
                },
                None => missed += 1,
            }
        }

        tracing::debug!(
            transport_id = %self.id,
            kind = %lane.kind,
            resent,
            missed,
            "NACK served"
        );
    }
}

fn feedback_loop(inner: Arc<Inner>) {
    while !inner.cancel.is_cancelled() {
        match inner.session.read_rtcp() {
            Ok(Some(packets)) => {
                for packet in packets {
                    match packet {
                        FeedbackPacket::Nack(nack) => inner.serve_nack(&nack),
                        FeedbackPacket::Pli(pli) => tracing::debug!(
                            transport_id = %inner.id,
                            media_ssrc = pli.media_ssrc,
                            "PLI received"
                        ),
                        FeedbackPacket::Other(pt) => {
                            tracing::trace!(transport_id = %inner.id, pt, "RTCP ignored")
                        }
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                if !inner.cancel.is_cancelled() {
                    tracing::warn!(transport_id = %inner.id, error = %e, "RTCP read failed");
                }
                break;
            }
        }
    }
    tracing::trace!(transport_id = %inner.id, "feedback loop exited");
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::time::Duration;

    use bytes::Bytes;
    use parking_lot::Condvar;

    use super::*;
    use crate::feedback::NackPair;
    use crate::session::StateCallback;

    /// In-memory session: records written packets and replays queued RTCP.
    #[derive(Default)]
    pub(crate) struct MockSession {
        pub written: Mutex<Vec<MediaPacket>>,
        callback: Mutex<Option<Arc<dyn Fn(ConnectionState) + Send + Sync>>>,
        rtcp: Mutex<VecDeque<Vec<FeedbackPacket>>>,
        rtcp_ready: Condvar,
        closed: Mutex<bool>,
        pub remote: Mutex<Option<SessionDescription>>,
        pub offers: Mutex<usize>,
    }

    impl MockSession {
        pub fn fire(&self, state: ConnectionState) {
            let callback = self.callback.lock().clone();
            if let Some(callback) = callback {
                callback(state);
            }
        }

        pub fn push_rtcp(&self, packets: Vec<FeedbackPacket>) {
            self.rtcp.lock().push_back(packets);
            self.rtcp_ready.notify_all();
        }

        pub fn is_closed(&self) -> bool {
            *self.closed.lock()
        }
    }

    pub(crate) struct MockTrack {
        kind: MediaKind,
        session: Arc<MockSession>,
    }

    impl MediaTrack for MockTrack {
        fn kind(&self) -> MediaKind {
            self.kind
        }

        fn write_rtp(&self, packet: &MediaPacket) -> Result<()> {
            self.session.written.lock().push(packet.clone());
            Ok(())
        }
    }

    /// Lets tests keep a typed handle while the transport holds `dyn PeerSession`.
    pub(crate) struct SharedMock(pub Arc<MockSession>);

    impl PeerSession for SharedMock {
        fn create_offer(&self) -> Result<SessionDescription> {
            *self.0.offers.lock() += 1;
            Ok(SessionDescription::offer("v=0\r\n"))
        }

        fn create_answer(&self) -> Result<SessionDescription> {
            if self.0.remote.lock().is_none() {
                return Err(RelayError::Negotiation("no remote offer".to_string()));
            }
            Ok(SessionDescription::answer("v=0\r\n"))
        }

        fn set_local_description(&self, _description: &SessionDescription) -> Result<()> {
            Ok(())
        }

        fn set_remote_description(&self, description: &SessionDescription) -> Result<()> {
            if !description.sdp.starts_with("v=0") {
                return Err(RelayError::Negotiation("not SDP".to_string()));
            }
            *self.0.remote.lock() = Some(description.clone());
            Ok(())
        }

        fn on_connection_state_change(&self, callback: StateCallback) {
            *self.0.callback.lock() = Some(Arc::from(callback));
        }

        fn new_track(&self, spec: TrackSpec) -> Result<Arc<dyn MediaTrack>> {
            Ok(Arc::new(MockTrack {
                kind: spec.kind,
                session: self.0.clone(),
            }))
        }

        fn read_rtcp(&self) -> Result<Option<Vec<FeedbackPacket>>> {
            let mut queue = self.0.rtcp.lock();
            if *self.0.closed.lock() {
                return Ok(None);
            }
            if queue.is_empty() {
                self.0
                    .rtcp_ready
                    .wait_for(&mut queue, Duration::from_millis(20));
            }
            Ok(Some(queue.pop_front().unwrap_or_default()))
        }

        fn close(&self) {
            *self.0.closed.lock() = true;
            self.0.rtcp_ready.notify_all();
        }
    }

    pub(crate) fn video_spec() -> TrackSpec {
        TrackSpec {
            kind: MediaKind::Video,
            ssrc: crate::config::VIDEO_SSRC,
            payload_type: 102,
            clock_rate: 90000,
            sdp_attributes: Vec::new(),
        }
    }

    pub(crate) fn audio_spec() -> TrackSpec {
        TrackSpec {
            kind: MediaKind::Audio,
            ssrc: crate::config::AUDIO_SSRC,
            payload_type: 111,
            clock_rate: 48000,
            sdp_attributes: Vec::new(),
        }
    }

    fn packet(ssrc: u32, seq: u16) -> MediaPacket {
        MediaPacket {
            sequence_number: seq,
            timestamp: 0,
            ssrc,
            payload_type: 102,
            marker: true,
            is_key_frame: false,
            payload: Bytes::from_static(&[0x41, 0x01]),
        }
    }

    fn transport() -> (Transport, Arc<MockSession>) {
        let mock = Arc::new(MockSession::default());
        let t = Transport::new(
            Arc::new(SharedMock(mock.clone())),
            vec![video_spec(), audio_spec()],
            512,
        )
        .unwrap();
        (t, mock)
    }

    fn wait_until(mut f: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if f() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn drops_packets_before_connect() {
        let (t, mock) = transport();
        assert_eq!(t.state(), TransportState::Negotiating);
        assert!(!t.is_connected());
        t.write_rtp(&packet(crate::config::VIDEO_SSRC, 1)).unwrap();
        assert!(mock.written.lock().is_empty());
        assert!(t.cached(crate::config::VIDEO_SSRC, 1).is_none(), "dropped, not queued");

        mock.fire(ConnectionState::Connected);
        assert!(t.is_connected());
        t.write_rtp(&packet(crate::config::VIDEO_SSRC, 2)).unwrap();
        assert_eq!(mock.written.lock().len(), 1);
        assert!(t.cached(crate::config::VIDEO_SSRC, 2).is_some());
        t.stop();
    }

    #[test]
    fn unknown_ssrc_is_error() {
        let (t, mock) = transport();
        mock.fire(ConnectionState::Connected);
        assert!(matches!(
            t.write_rtp(&packet(42, 1)),
            Err(RelayError::UnknownSsrc(42))
        ));
        t.stop();
    }

    #[test]
    fn state_events_in_order() {
        let (t, mock) = transport();
        let events = t.state_events();
        mock.fire(ConnectionState::Connecting);
        mock.fire(ConnectionState::Connected);
        mock.fire(ConnectionState::Connected);
        mock.fire(ConnectionState::Failed);

        let seen: Vec<TransportState> = events.try_iter().collect();
        assert_eq!(seen, vec![TransportState::Connected, TransportState::Closed]);
        assert!(matches!(
            t.write_rtp(&packet(crate::config::VIDEO_SSRC, 1)),
            Err(RelayError::TransportClosed(_))
        ));
        t.stop();
    }

    #[test]
    fn nack_resends_cached_hits_only() {
        let (t, mock) = transport();
        mock.fire(ConnectionState::Connected);
        for seq in 10..15 {
            t.write_rtp(&packet(crate::config::VIDEO_SSRC, seq)).unwrap();
        }
        mock.written.lock().clear();

        mock.push_rtcp(vec![FeedbackPacket::Nack(Nack {
            sender_ssrc: 1,
            media_ssrc: crate::config::VIDEO_SSRC,
            // 11, 12 and 40 (miss)
            pairs: vec![
                NackPair {
                    packet_id: 11,
                    lost_packets: 0b1,
                },
                NackPair {
                    packet_id: 40,
                    lost_packets: 0,
                },
            ],
        })]);

        assert!(wait_until(|| mock.written.lock().len() >= 2));
        let resent: Vec<u16> = mock
            .written
            .lock()
            .iter()
            .map(|p| p.sequence_number)
            .collect();
        assert_eq!(resent, vec![11, 12]);
        t.stop();
    }

    #[test]
    fn local_description_is_cached() {
        let (t, mock) = transport();
        let first = t.local_description(SdpType::Offer).unwrap();
        let second = t.local_description(SdpType::Offer).unwrap();
        assert_eq!(first, second);
        assert_eq!(*mock.offers.lock(), 1);
        t.stop();
    }

    #[test]
    fn stop_is_idempotent_and_closes_session() {
        let (t, mock) = transport();
        let events = t.state_events();
        t.stop();
        t.stop();
        assert!(mock.is_closed());
        assert_eq!(t.state(), TransportState::Closed);
        assert_eq!(events.try_iter().count(), 1);
    }
}

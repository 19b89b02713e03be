use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::error::{RelayError, Result};
use crate::feedback::rtcp::{self, FeedbackPacket};
use crate::media::MediaKind;
use crate::media::rtp::MediaPacket;
use crate::session::sdp::{self, Direction};
use crate::session::{
    ConnectionState, MediaTrack, PeerSession, SessionDescription, SessionFactory,
    StateCallback, TrackSpec,
};

const DEFAULT_RTCP_READ_TIMEOUT: Duration = Duration::from_millis(100);
const MAX_DATAGRAM: usize = 1500;

type SharedCallback = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Creates [`UdpPeerSession`]s, one ephemeral socket each.
#[derive(Debug, Clone)]
pub struct UdpSessionFactory {
    bind_ip: IpAddr,
    /// Address advertised in SDP when it differs from the bind address.
    public_ip: Option<IpAddr>,
    rtcp_read_timeout: Duration,
}

impl UdpSessionFactory {
    pub fn new(bind_ip: IpAddr) -> Self {
        Self {
            bind_ip,
            public_ip: None,
            rtcp_read_timeout: DEFAULT_RTCP_READ_TIMEOUT,
        }
    }

    pub fn with_public_ip(mut self, ip: IpAddr) -> Self {
        self.public_ip = Some(ip);
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.rtcp_read_timeout = timeout;
        self
    }
}

impl SessionFactory for UdpSessionFactory {
    fn create_session(&self) -> Result<Arc<dyn PeerSession>> {
        let session = UdpPeerSession::bind(self.bind_ip, self.public_ip, self.rtcp_read_timeout)?;
        Ok(Arc::new(session))
    }
}

/// Plain RTP/AVPF session over one UDP socket.
///
/// RTP and RTCP share the socket (`a=rtcp-mux`). The session counts as
/// connected as soon as both the local and the remote description are set.
pub struct UdpPeerSession {
    socket: Arc<UdpSocket>,
    advertised: SocketAddr,
    session_id: u64,
    tracks: Mutex<Vec<TrackSpec>>,
    endpoints: Arc<RwLock<HashMap<MediaKind, SocketAddr>>>,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    state: Mutex<ConnectionState>,
    callback: Mutex<Option<SharedCallback>>,
    closed: AtomicBool,
}

impl UdpPeerSession {
    pub fn bind(bind_ip: IpAddr, public_ip: Option<IpAddr>, read_timeout: Duration) -> Result<Self> {
        let socket = UdpSocket::bind(SocketAddr::new(bind_ip, 0))?;
        socket.set_read_timeout(Some(read_timeout))?;
        let local_addr = socket.local_addr()?;

        let ip = match public_ip {
            Some(ip) => ip,
            None if bind_ip.is_unspecified() => {
                tracing::warn!(%bind_ip, "no public address configured, advertising loopback");
                IpAddr::V4(Ipv4Addr::LOCALHOST)
            }
            None => bind_ip,
        };
        let advertised = SocketAddr::new(ip, local_addr.port());

        tracing::debug!(local = %local_addr, %advertised, "UDP session bound");

        Ok(Self {
            socket: Arc::new(socket),
            advertised,
            session_id: rand::random::<u32>() as u64,
            tracks: Mutex::new(Vec::new()),
            endpoints: Arc::new(RwLock::new(HashMap::new())),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            state: Mutex::new(ConnectionState::New),
            callback: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Address peers should send RTCP to.
    pub fn advertised_addr(&self) -> SocketAddr {
        self.advertised
    }

    fn set_state(&self, next: ConnectionState) {
        {
            let mut state = self.state.lock();
            if *state == next || *state == ConnectionState::Closed {
                return;
            }
            *state = next;
        }
        let callback = self.callback.lock().clone();
        if let Some(callback) = callback {
            callback(next);
        }
    }

    fn update_state(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let local = self.local.lock().is_some();
        let remote = self.remote.lock().is_some();
        match (local, remote) {
            (true, true) => self.set_state(ConnectionState::Connected),
            (true, false) | (false, true) => self.set_state(ConnectionState::Connecting),
            (false, false) => {}
        }
    }

    /// Unblock a pending `recv_from` with an empty datagram to ourselves.
    fn wake_reader(&self) {
        let Ok(mut addr) = self.socket.local_addr() else {
            return;
        };
        if addr.ip().is_unspecified() {
            addr.set_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
        }
        let _ = self.socket.send_to(&[], addr);
    }
}

impl PeerSession for UdpPeerSession {
    fn create_offer(&self) -> Result<SessionDescription> {
        let tracks = self.tracks.lock();
        Ok(SessionDescription::offer(sdp::generate_sdp(
            self.advertised,
            self.session_id,
            Direction::SendOnly,
            &tracks,
        )))
    }

    fn create_answer(&self) -> Result<SessionDescription> {
        let remote = self
            .remote
            .lock()
            .clone()
            .ok_or_else(|| RelayError::Negotiation("answer requested before offer".to_string()))?;
        let offered = sdp::parse_remote_media(&remote.sdp)?;

        let tracks: Vec<TrackSpec> = self
            .tracks
            .lock()
            .iter()
            .filter(|t| offered.iter().any(|m| m.kind == t.kind))
            .cloned()
            .collect();
        if tracks.is_empty() {
            return Err(RelayError::Negotiation(
                "offer accepts none of the relay's tracks".to_string(),
            ));
        }

        Ok(SessionDescription::answer(sdp::generate_sdp(
            self.advertised,
            self.session_id,
            Direction::SendOnly,
            &tracks,
        )))
    }

    fn set_local_description(&self, description: &SessionDescription) -> Result<()> {
        *self.local.lock() = Some(description.clone());
        self.update_state();
        Ok(())
    }

    fn set_remote_description(&self, description: &SessionDescription) -> Result<()> {
        let media = sdp::parse_remote_media(&description.sdp)?;
        {
            let mut endpoints = self.endpoints.write();
            endpoints.clear();
            for m in &media {
                endpoints.entry(m.kind).or_insert(m.addr);
            }
        }
        tracing::debug!(
            sdp_type = ?description.sdp_type,
            media = media.len(),
            "remote description set"
        );
        *self.remote.lock() = Some(description.clone());
        self.update_state();
        Ok(())
    }

    fn on_connection_state_change(&self, callback: StateCallback) {
        *self.callback.lock() = Some(Arc::from(callback));
    }

    fn new_track(&self, spec: TrackSpec) -> Result<Arc<dyn MediaTrack>> {
        let kind = spec.kind;
        self.tracks.lock().push(spec);
        Ok(Arc::new(UdpTrack {
            kind,
            socket: self.socket.clone(),
            endpoints: self.endpoints.clone(),
        }))
    }

    fn read_rtcp(&self) -> Result<Option<Vec<FeedbackPacket>>> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(None);
        }

        let mut buf = [0u8; MAX_DATAGRAM];
        match self.socket.recv_from(&mut buf) {
            Ok((n, from)) => {
                if self.closed.load(Ordering::SeqCst) {
                    return Ok(None);
                }
                let data = &buf[..n];
                if !rtcp::is_rtcp(data) {
                    tracing::trace!(%from, len = n, "non-RTCP datagram ignored");
                    return Ok(Some(Vec::new()));
                }
                match rtcp::parse_compound(data) {
                    Ok(packets) => Ok(Some(packets)),
                    Err(e) => {
                        tracing::warn!(%from, error = %e, "malformed RTCP dropped");
                        Ok(Some(Vec::new()))
                    }
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                if self.closed.load(Ordering::SeqCst) {
                    Ok(None)
                } else {
                    Ok(Some(Vec::new()))
                }
            }
            Err(e) => {
                if self.closed.load(Ordering::SeqCst) {
                    Ok(None)
                } else {
                    Err(e.into())
                }
            }
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.wake_reader();
        let callback = self.callback.lock().clone();
        *self.state.lock() = ConnectionState::Closed;
        if let Some(callback) = callback {
            callback(ConnectionState::Closed);
        }
        tracing::debug!(advertised = %self.advertised, "UDP session closed");
    }
}

/// Sends one media kind to the endpoint the remote description named for it.
pub struct UdpTrack {
    kind: MediaKind,
    socket: Arc<UdpSocket>,
    endpoints: Arc<RwLock<HashMap<MediaKind, SocketAddr>>>,
}

impl MediaTrack for UdpTrack {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn write_rtp(&self, packet: &MediaPacket) -> Result<()> {
        let addr = self.endpoints.read().get(&self.kind).copied().ok_or_else(|| {
            RelayError::TransportNotConfigured(format!("no remote endpoint for {}", self.kind))
        })?;
        self.socket.send_to(&packet.marshal(), addr)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::config::{RelayConfig, VIDEO_SSRC};
    use crate::feedback::NackPair;
    use crate::feedback::rtcp::Nack;

    fn loopback() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    fn spec() -> TrackSpec {
        TrackSpec {
            kind: MediaKind::Video,
            ssrc: VIDEO_SSRC,
            payload_type: 102,
            clock_rate: 90000,
            sdp_attributes: vec!["a=rtpmap:102 H264/90000".to_string()],
        }
    }

    fn receiver() -> (UdpSocket, String) {
        let socket = UdpSocket::bind((loopback(), 0)).unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let offer = sdp::receiver_offer(
            socket.local_addr().unwrap(),
            &RelayConfig::default(),
            &[MediaKind::Video],
        );
        (socket, offer)
    }

    #[test]
    fn factory_advertises_public_ip() {
        let public = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));
        let factory = UdpSessionFactory::new(loopback())
            .with_public_ip(public)
            .with_read_timeout(Duration::from_millis(10));
        let session = factory.create_session().unwrap();

        let offer = session.create_offer().unwrap();
        assert!(offer.sdp.contains("c=IN IP4 203.0.113.7"));

        // short timeout: an idle read returns promptly with no feedback
        let started = std::time::Instant::now();
        assert_eq!(session.read_rtcp().unwrap(), Some(Vec::new()));
        assert!(started.elapsed() < Duration::from_secs(1));
        session.close();
    }

    #[test]
    fn connects_after_both_descriptions() {
        let session = UdpPeerSession::bind(loopback(), None, Duration::from_millis(20)).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        session.on_connection_state_change(Box::new(move |s| sink.lock().push(s)));
        session.new_track(spec()).unwrap();

        let (_socket, offer) = receiver();
        session
            .set_remote_description(&SessionDescription::offer(offer))
            .unwrap();
        let answer = session.create_answer().unwrap();
        assert_eq!(answer.sdp_type.as_str(), "answer");
        assert!(answer.sdp.contains("m=video"));
        session.set_local_description(&answer).unwrap();

        session.close();
        assert_eq!(
            *seen.lock(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Closed
            ]
        );
    }

    #[test]
    fn track_sends_to_remote_and_rtcp_comes_back() {
        let session = UdpPeerSession::bind(loopback(), None, Duration::from_millis(20)).unwrap();
        let track = session.new_track(spec()).unwrap();

        let packet = MediaPacket {
            sequence_number: 7,
            timestamp: 9000,
            ssrc: VIDEO_SSRC,
            payload_type: 102,
            marker: true,
            is_key_frame: true,
            payload: Bytes::from_static(&[0x65, 0x01]),
        };
        assert!(matches!(
            track.write_rtp(&packet),
            Err(RelayError::TransportNotConfigured(_))
        ));

        let (socket, offer) = receiver();
        session
            .set_remote_description(&SessionDescription::offer(offer))
            .unwrap();
        track.write_rtp(&packet).unwrap();

        let mut buf = [0u8; 1500];
        let (n, from) = socket.recv_from(&mut buf).unwrap();
        let received = MediaPacket::parse(&buf[..n]).unwrap();
        assert_eq!(received.sequence_number, 7);
        assert_eq!(from.port(), session.advertised_addr().port());

        let nack = Nack {
            sender_ssrc: 5,
            media_ssrc: VIDEO_SSRC,
            pairs: vec![NackPair {
                packet_id: 7,
                lost_packets: 0,
            }],
        };
        socket.send_to(&nack.marshal(), from).unwrap();

        let mut feedback = Vec::new();
        for _ in 0..100 {
            feedback = session.read_rtcp().unwrap().unwrap();
            if !feedback.is_empty() {
                break;
            }
        }
        assert_eq!(feedback, vec![FeedbackPacket::Nack(nack)]);
    }

    #[test]
    fn read_returns_none_after_close() {
        let session = UdpPeerSession::bind(loopback(), None, Duration::from_millis(20)).unwrap();
        assert_eq!(session.read_rtcp().unwrap(), Some(Vec::new()));
        session.close();
        assert_eq!(session.read_rtcp().unwrap(), None);
    }

    #[test]
    fn answer_without_offer_fails() {
        let session = UdpPeerSession::bind(loopback(), None, Duration::from_millis(20)).unwrap();
        session.new_track(spec()).unwrap();
        assert!(matches!(
            session.create_answer(),
            Err(RelayError::Negotiation(_))
        ));
    }
}

use std::sync::Arc;

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::registry::{RouterRegistry, extract_stream_path};
use crate::router::Router;
use crate::session::{SdpType, SessionDescription, SessionFactory};
use crate::source::{AudioTransform, SourceConnector, TransformFactory};

/// Result of a successful [`Relay::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub stream_path: String,
    pub transport_id: String,
    /// SDP answer to return to the subscriber.
    pub answer: String,
}

/// Signaling-facing entry point: maps `{offer, stream_url}` requests onto
/// routers, creating a router the first time a stream is requested.
///
/// ```ignore
/// let relay = Relay::new(connector, sessions, RelayConfig::default());
/// let sub = relay.subscribe("rtmp://localhost/live/cam1", &offer_sdp)?;
/// send_to_browser(&sub.answer);
/// ```
pub struct Relay {
    registry: RouterRegistry,
    connector: Arc<dyn SourceConnector>,
    sessions: Arc<dyn SessionFactory>,
    transforms: Option<Arc<dyn TransformFactory>>,
    config: RelayConfig,
}

impl Relay {
    pub fn new(
        connector: Arc<dyn SourceConnector>,
        sessions: Arc<dyn SessionFactory>,
        config: RelayConfig,
    ) -> Self {
        Self {
            registry: RouterRegistry::new(),
            connector,
            sessions,
            transforms: None,
            config,
        }
    }

    /// Enable audio forwarding through transforms built by `factory`.
    pub fn with_audio_transform(mut self, factory: Arc<dyn TransformFactory>) -> Self {
        self.transforms = Some(factory);
        self
    }

    pub fn registry(&self) -> &RouterRegistry {
        &self.registry
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Router serving `stream`, which may be a URL or a stream path.
    pub fn router(&self, stream: &str) -> Option<Arc<Router>> {
        let path = extract_stream_path(stream)?;
        self.registry.get(&path)
    }

    /// Answer a subscriber's SDP offer for `stream_url`.
    ///
    /// Reuses the live router for the stream path or dials a new one.
    /// Negotiation failures detach the new subscriber again.
    pub fn subscribe(&self, stream_url: &str, offer: &str) -> Result<Subscription> {
        let path = extract_stream_path(stream_url)
            .ok_or_else(|| RelayError::InvalidStreamUrl(stream_url.to_string()))?;
        let router = self.router_for(&path, stream_url)?;

        let transport = router.create_subscriber()?;
        let negotiated = transport
            .set_remote_description(&SessionDescription::offer(offer))
            .and_then(|()| transport.local_description(SdpType::Answer));

        let answer = match negotiated {
            Ok(answer) => answer,
            Err(e) => {
                // already gone if the router stopped meanwhile
                let _ = router.stop_subscriber(transport.id());
                tracing::warn!(path = %path, error = %e, "negotiation failed");
                return Err(match e {
                    RelayError::Negotiation(reason) => RelayError::Negotiation(reason),
                    other => RelayError::Negotiation(other.to_string()),
                });
            }
        };

        tracing::info!(path = %path, transport_id = %transport.id(), "subscribed");
        Ok(Subscription {
            stream_path: path,
            transport_id: transport.id().to_string(),
            answer: answer.sdp,
        })
    }

    pub fn unsubscribe(&self, stream: &str, transport_id: &str) -> Result<()> {
        let router = self
            .router(stream)
            .ok_or_else(|| RelayError::StreamNotFound(stream.to_string()))?;
        router.stop_subscriber(transport_id)
    }

    /// Source unpublished: stop its router and forget it.
    pub fn stop_stream(&self, stream: &str) -> Result<()> {
        let path = extract_stream_path(stream)
            .ok_or_else(|| RelayError::InvalidStreamUrl(stream.to_string()))?;
        let router = self
            .registry
            .remove(&path)
            .ok_or(RelayError::StreamNotFound(path))?;
        router.stop();
        Ok(())
    }

    /// Stop every router.
    pub fn shutdown(&self) {
        let routers = self.registry.drain();
        let count = routers.len();
        for router in routers {
            router.stop();
        }
        tracing::info!(routers = count, "relay shut down");
    }

    fn router_for(&self, path: &str, url: &str) -> Result<Arc<Router>> {
        if let Some(router) = self.registry.get_live(path) {
            return Ok(router);
        }

        let transform = self.create_transform();
        let router = Arc::new(Router::connect(
            url,
            self.connector.as_ref(),
            self.sessions.clone(),
            transform,
            self.config.clone(),
        )?);

        let registered = self.registry.register(path, router.clone());
        if !Arc::ptr_eq(&registered, &router) {
            tracing::debug!(path, "router created concurrently, using the registered one");
            router.stop();
            return Ok(registered);
        }

        let registry = self.registry.clone();
        let weak = Arc::downgrade(&router);
        let key = path.to_string();
        router.on_stopped(Box::new(move || {
            if let Some(router) = weak.upgrade() {
                registry.remove_router(&key, &router);
            }
        }));
        Ok(router)
    }

    fn create_transform(&self) -> Option<Box<dyn AudioTransform>> {
        let factory = self.transforms.as_ref()?;
        match factory.create() {
            Ok(transform) => Some(transform),
            Err(e) => {
                tracing::warn!(error = %e, "audio transform unavailable");
                None
            }
        }
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::router::RouterState;
    use crate::session::PeerSession;
    use crate::source::{AnnexBFileSource, MediaSource};
    use crate::transport::tests::{MockSession, SharedMock};

    /// Serves an Annex B stream of `frames` key frames from memory.
    struct MemoryConnector {
        dials: Mutex<usize>,
        frames: usize,
        paced: bool,
    }

    impl SourceConnector for MemoryConnector {
        fn connect(&self, _url: &str, _timeout: Duration) -> Result<Arc<dyn MediaSource>> {
            *self.dials.lock() += 1;
            const PICTURE: [&[u8]; 3] = [
                &[0x67, 0x42, 0x00, 0x1e],
                &[0x68, 0xce, 0x38, 0x80],
                &[0x65, 0x88, 0x84, 0x00],
            ];
            let mut stream: Vec<u8> = Vec::new();
            for _ in 0..self.frames {
                for nal in PICTURE {
                    stream.extend_from_slice(&[0, 0, 0, 1]);
                    stream.extend_from_slice(nal);
                }
            }
            Ok(Arc::new(AnnexBFileSource::from_bytes(&stream, 25, self.paced)?))
        }
    }

    #[derive(Default)]
    struct MockFactory {
        sessions: Mutex<Vec<Arc<MockSession>>>,
    }

    impl SessionFactory for MockFactory {
        fn create_session(&self) -> Result<Arc<dyn PeerSession>> {
            let mock = Arc::new(MockSession::default());
            self.sessions.lock().push(mock.clone());
            Ok(Arc::new(SharedMock(mock)))
        }
    }

    fn relay() -> (Relay, Arc<MemoryConnector>) {
        relay_with(250, true)
    }

    fn relay_with(frames: usize, paced: bool) -> (Relay, Arc<MemoryConnector>) {
        let connector = Arc::new(MemoryConnector {
            dials: Mutex::new(0),
            frames,
            paced,
        });
        let relay = Relay::new(
            connector.clone(),
            Arc::new(MockFactory::default()),
            RelayConfig::default(),
        );
        (relay, connector)
    }

    #[test]
    fn subscribers_share_one_router() {
        let (relay, connector) = relay();
        let a = relay.subscribe("rtmp://localhost/live/cam1", "v=0\r\n").unwrap();
        let b = relay.subscribe("rtmp://localhost/live/cam1?token=1", "v=0\r\n").unwrap();

        assert_eq!(a.stream_path, "/live/cam1");
        assert_eq!(b.stream_path, "/live/cam1");
        assert_ne!(a.transport_id, b.transport_id);
        assert!(a.answer.starts_with("v=0"));
        assert_eq!(*connector.dials.lock(), 1);

        let router = relay.router("/live/cam1").unwrap();
        assert_eq!(router.subscriber_count(), 2);

        relay.unsubscribe("/live/cam1", &a.transport_id).unwrap();
        assert_eq!(router.subscriber_count(), 1);
        relay.shutdown();
        assert_eq!(router.state(), RouterState::Stopped);
        assert!(relay.registry().is_empty());
    }

    #[test]
    fn invalid_url_rejected() {
        let (relay, connector) = relay();
        assert!(matches!(
            relay.subscribe("rtmp://localhost/cam1", "v=0\r\n"),
            Err(RelayError::InvalidStreamUrl(_))
        ));
        assert_eq!(*connector.dials.lock(), 0);
    }

    #[test]
    fn bad_offer_detaches_subscriber() {
        let (relay, _) = relay();
        let err = relay.subscribe("rtmp://localhost/live/cam1", "garbage").err();
        assert!(matches!(err, Some(RelayError::Negotiation(_))));

        let router = relay.router("rtmp://localhost/live/cam1").unwrap();
        assert_eq!(router.subscriber_count(), 0);
        assert_eq!(router.state(), RouterState::Streaming);
    }

    #[test]
    fn stopped_stream_is_redialed() {
        let (relay, connector) = relay();
        relay.subscribe("rtmp://localhost/live/cam1", "v=0\r\n").unwrap();
        let first = relay.router("/live/cam1").unwrap();
        first.stop();

        relay.subscribe("rtmp://localhost/live/cam1", "v=0\r\n").unwrap();
        let second = relay.router("/live/cam1").unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.state(), RouterState::Streaming);
        assert_eq!(*connector.dials.lock(), 2);
    }

    #[test]
    fn stop_stream_unknown_and_known() {
        let (relay, _) = relay();
        assert!(matches!(
            relay.stop_stream("/live/none"),
            Err(RelayError::StreamNotFound(_))
        ));

        relay.subscribe("rtmp://localhost/live/cam1", "v=0\r\n").unwrap();
        let router = relay.router("/live/cam1").unwrap();
        relay.stop_stream("rtmp://localhost/live/cam1").unwrap();
        assert_eq!(router.state(), RouterState::Stopped);
        assert!(relay.router("/live/cam1").is_none());
        assert!(matches!(
            relay.unsubscribe("/live/cam1", "x"),
            Err(RelayError::StreamNotFound(_))
        ));
    }

    #[test]
    fn ended_streams_leave_the_registry() {
        let (relay, connector) = relay_with(1, false);
        for i in 0..20 {
            // the one-frame source may end before the subscriber attaches
            let _ = relay.subscribe(&format!("rtmp://localhost/live/cam{}", i), "v=0\r\n");
        }
        assert_eq!(*connector.dials.lock(), 20);

        let mut emptied = false;
        for _ in 0..400 {
            if relay.registry().is_empty() {
                emptied = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(emptied, "{} routers left", relay.registry().len());
    }

    #[test]
    fn replacement_router_survives_old_stop() {
        let (relay, _) = relay();
        relay.subscribe("rtmp://localhost/live/cam1", "v=0\r\n").unwrap();
        let first = relay.router("/live/cam1").unwrap();
        first.stop();
        assert!(relay.router("/live/cam1").is_none());

        relay.subscribe("rtmp://localhost/live/cam1", "v=0\r\n").unwrap();
        let second = relay.router("/live/cam1").unwrap();
        assert!(!relay.registry().remove_router("/live/cam1", &first));
        assert!(Arc::ptr_eq(&relay.router("/live/cam1").unwrap(), &second));
    }
}

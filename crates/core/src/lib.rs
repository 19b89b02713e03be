pub mod buffer;
pub mod cancel;
pub mod config;
pub mod error;
pub mod feedback;
pub mod media;
pub mod receiver;
pub mod registry;
pub mod relay;
pub mod router;
pub mod session;
pub mod source;
pub mod transport;

pub use config::{AUDIO_SSRC, JitterConfig, NackConfig, RelayConfig, VIDEO_SSRC};
pub use error::{RelayError, Result};
pub use media::{MediaKind, Packetizer};
pub use receiver::RtpReceiver;
pub use registry::RouterRegistry;
pub use relay::{Relay, Subscription};
pub use router::{Router, RouterState};
pub use transport::{Transport, TransportState};

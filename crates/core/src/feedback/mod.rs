//! Loss detection and RTCP feedback.
//!
//! [`nack::LossTracker`] runs on the receiving side and decides which
//! sequence numbers to request again; [`rtcp`] carries those requests (and
//! PLIs) on the wire.

pub mod nack;
pub mod rtcp;

pub use nack::{LossTracker, NackInfo, NackPair};
pub use rtcp::{FeedbackPacket, Nack, Pli};

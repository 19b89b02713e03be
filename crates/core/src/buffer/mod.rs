//! Sequence-indexed packet storage.
//!
//! Both buffers here are fixed-capacity rings addressed by
//! `sequence_number % capacity`. A slot is overwritten unconditionally by the
//! next packet mapping to it, so memory stays bounded at `capacity` packets
//! and lookback is at most `capacity` sequence numbers. A lookup only hits
//! when the slot still holds the exact sequence number asked for.

pub mod jitter;
pub mod retransmit;
pub mod sequence;

pub use jitter::{Drain, JitterBuffer};
pub use retransmit::RetransmitCache;
pub use sequence::{ExtendedSequence, SequenceTracker};

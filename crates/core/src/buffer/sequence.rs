use std::fmt;

/// Low sequence numbers that count as "just wrapped".
const WRAP_LOW: u16 = 0x0FFF;
/// High sequence numbers that count as "about to wrap".
const WRAP_HIGH: u32 = 0xF000;

/// A 16-bit RTP sequence number extended with a rollover count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct ExtendedSequence {
    pub cycles: u32,
    pub base_seq: u16,
}

impl ExtendedSequence {
    pub fn value(self) -> u32 {
        (self.cycles << 16) | self.base_seq as u32
    }
}

impl fmt::Display for ExtendedSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.cycles, self.base_seq)
    }
}

/// Converts 16-bit sequence numbers into extended sequence numbers
/// (RFC 3550 §A.1).
///
/// A rollover is counted when a sequence below `0x0FFF` arrives while the
/// highest extended sequence seen so far sits above `0xF000` in its low 16
/// bits. The highest value only moves forward, so a straggler from before
/// the wrap does not count a second rollover on its own.
#[derive(Debug, Default, Clone)]
pub struct SequenceTracker {
    highest: u32,
    cycles: u32,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `seq` and return its extended form under the current cycle count.
    pub fn update(&mut self, seq: u16) -> ExtendedSequence {
        if seq < WRAP_LOW && (self.highest & 0xFFFF) > WRAP_HIGH {
            self.cycles = self.cycles.wrapping_add(1);
            tracing::trace!(seq, cycles = self.cycles, "sequence rollover");
        }

        let extended = ExtendedSequence {
            cycles: self.cycles,
            base_seq: seq,
        };
        if extended.value() > self.highest {
            self.highest = extended.value();
        }
        extended
    }

    /// Highest extended sequence number recorded so far.
    pub fn highest(&self) -> u32 {
        self.highest
    }

    pub fn cycles(&self) -> u32 {
        self.cycles
    }
}

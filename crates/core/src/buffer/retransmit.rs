use crate::media::rtp::MediaPacket;

/// Ring of the most recently sent packets of one SSRC, served on NACK.
///
/// Slot index is `seq % capacity`. `put` overwrites whatever the slot held;
/// `get` hits only if the slot still holds that exact sequence number.
#[derive(Debug)]
pub struct RetransmitCache {
    ssrc: Option<u32>,
    slots: Vec<Option<MediaPacket>>,
    stored: u64,
}

impl RetransmitCache {
    /// A zero capacity is raised to one slot.
    pub fn new(capacity: u16) -> Self {
        let capacity = capacity.max(1) as usize;
        Self {
            ssrc: None,
            slots: vec![None; capacity],
            stored: 0,
        }
    }

    pub fn capacity(&self) -> u16 {
        self.slots.len() as u16
    }

    /// SSRC latched by the first stored packet.
    pub fn ssrc(&self) -> Option<u32> {
        self.ssrc
    }

    /// Total packets ever stored.
    pub fn stored(&self) -> u64 {
        self.stored
    }

    pub fn put(&mut self, packet: MediaPacket) {
        if self.ssrc.is_none() {
            self.ssrc = Some(packet.ssrc);
        }
        let idx = self.slot(packet.sequence_number);
        self.slots[idx] = Some(packet);
        self.stored += 1;
    }

    pub fn get(&self, seq: u16) -> Option<&MediaPacket> {
        self.slots[self.slot(seq)]
            .as_ref()
            .filter(|packet| packet.sequence_number == seq)
    }

    fn slot(&self, seq: u16) -> usize {
        seq as usize % self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn packet(seq: u16) -> MediaPacket {
        MediaPacket {
            sequence_number: seq,
            timestamp: seq as u32 * 3000,
            ssrc: 333_333_333,
            payload_type: 102,
            marker: true,
            is_key_frame: false,
            payload: Bytes::from(vec![seq as u8; 4]),
        }
    }

    #[test]
    fn put_then_get() {
        let mut cache = RetransmitCache::new(512);
        cache.put(packet(10));
        assert_eq!(cache.get(10), Some(&packet(10)));
        assert!(cache.get(11).is_none());
        assert_eq!(cache.ssrc(), Some(333_333_333));
    }

    #[test]
    fn ring_overwrite_loses_old_sequence() {
        let mut cache = RetransmitCache::new(512);
        cache.put(packet(5));
        cache.put(packet(5 + 512));
        assert!(cache.get(5).is_none(), "slot now holds 517");
        assert_eq!(cache.get(517).map(|p| p.sequence_number), Some(517));
        assert_eq!(cache.stored(), 2);
    }

    #[test]
    fn wraps_with_sequence_numbers() {
        let mut cache = RetransmitCache::new(16);
        for seq in (u16::MAX - 3)..=u16::MAX {
            cache.put(packet(seq));
        }
        cache.put(packet(0));
        cache.put(packet(1));
        assert!(cache.get(u16::MAX).is_some());
        assert!(cache.get(1).is_some());
        assert!(cache.get(2).is_none());
    }

    #[test]
    fn ssrc_latched_once() {
        let mut cache = RetransmitCache::new(8);
        cache.put(packet(1));
        let mut other = packet(2);
        other.ssrc = 42;
        cache.put(other);
        assert_eq!(cache.ssrc(), Some(333_333_333));
        assert_eq!(cache.get(2).map(|p| p.ssrc), Some(42));
    }
}

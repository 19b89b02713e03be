use bytes::{Bytes, BytesMut};

use super::h264::NalUnitType;

/// Output of one [`H264Depacketizer::push`] call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Depacketized {
    /// NAL units completed by this payload, without start codes.
    pub nals: Vec<Bytes>,
    /// `false` while an FU-A fragmented NAL unit is still being assembled.
    pub complete: bool,
}

/// H.264 RTP depacketizer (RFC 6184).
///
/// Reverses the three payload structures the sender may use:
///
/// - **Single NAL unit** (§5.6): payload emitted verbatim.
/// - **STAP-A** (§5.7.1): a one-byte STAP-A header followed by
///   `[size: u16][NAL]` pairs, each NAL emitted in order.
/// - **FU-A** (§5.8): fragments are accumulated and the original NAL header
///   is rebuilt from the FU indicator's F|NRI bits and the FU header's type.
///
/// Fragments must arrive in order; reordering is the jitter buffer's job.
#[derive(Debug, Default)]
pub struct H264Depacketizer {
    fragment: Option<BytesMut>,
}

impl H264Depacketizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one RTP payload.
    pub fn push(&mut self, payload: &[u8]) -> Depacketized {
        let Some(&first) = payload.first() else {
            return self.output(Vec::new());
        };

        match NalUnitType::from_header(first) {
            NalUnitType::FuA => self.push_fragment(payload),
            NalUnitType::StapA => self.output(split_stap_a(payload)),
            _ => self.output(vec![Bytes::copy_from_slice(payload)]),
        }
    }

    /// Drop a partially assembled fragment, e.g. after a skipped packet.
    pub fn reset(&mut self) {
        self.fragment = None;
    }

    fn push_fragment(&mut self, payload: &[u8]) -> Depacketized {
        if payload.len() < 2 {
            tracing::warn!(len = payload.len(), "FU-A payload too short, dropped");
            return self.output(Vec::new());
        }

        let fu_indicator = payload[0];
        let fu_header = payload[1];
        let start = fu_header & 0x80 != 0;
        let end = fu_header & 0x40 != 0;
        let data = &payload[2..];

        if start {
            if self.fragment.is_some() {
                tracing::debug!("FU-A start before previous end, discarding partial NAL");
            }
            let mut buf = BytesMut::with_capacity(1 + data.len() * 4);
            buf.extend_from_slice(&[(fu_indicator & 0xe0) | (fu_header & 0x1f)]);
            buf.extend_from_slice(data);
            self.fragment = Some(buf);
        } else {
            match self.fragment.as_mut() {
                Some(buf) => buf.extend_from_slice(data),
                None => {
                    tracing::trace!("FU-A continuation without start fragment, dropped");
                    return self.output(Vec::new());
                }
            }
        }

        if end {
            let nals = self
                .fragment
                .take()
                .map(|buf| vec![buf.freeze()])
                .unwrap_or_default();
            return self.output(nals);
        }

        self.output(Vec::new())
    }

    fn output(&self, nals: Vec<Bytes>) -> Depacketized {
        Depacketized {
            nals,
            complete: self.fragment.is_none(),
        }
    }
}

/// Split a STAP-A payload. Stops at the first truncated or zero length.
fn split_stap_a(payload: &[u8]) -> Vec<Bytes> {
    let mut nals = Vec::new();
    let mut offset = 1usize;

    while offset + 2 <= payload.len() {
        let size = u16::from_be_bytes([payload[offset], payload[offset + 1]]) as usize;
        offset += 2;
        if size == 0 || offset + size > payload.len() {
            tracing::warn!(size, offset, "STAP-A entry truncated, stopping");
            break;
        }
        nals.push(Bytes::copy_from_slice(&payload[offset..offset + size]));
        offset += size;
    }

    nals
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::Packetizer;
    use crate::media::h264::H264Packetizer;

    #[test]
    fn single_nal_passes_through() {
        let mut d = H264Depacketizer::new();
        let out = d.push(&[0x41, 0x9A, 0x02]);
        assert!(out.complete);
        assert_eq!(out.nals, vec![Bytes::from_static(&[0x41, 0x9A, 0x02])]);
    }

    #[test]
    fn fu_a_round_trip_300_bytes() {
        let mut nal = vec![0x65];
        nal.extend((0..299).map(|i| i as u8));
        let mut frame = vec![0, 0, 0, 1];
        frame.extend_from_slice(&nal);

        // 100-byte fragments: start, middle and end
        let mut p = H264Packetizer::new(102, 1, 114);
        let packets = p.packetize(&frame, 0);
        assert_eq!(packets.len(), 3);
        let fu_header: Vec<u8> = packets.iter().map(|pkt| pkt.payload[1] & 0xc0).collect();
        assert_eq!(fu_header, vec![0x80, 0x00, 0x40]);

        let mut d = H264Depacketizer::new();
        let mut emitted = Vec::new();
        for (i, pkt) in packets.iter().enumerate() {
            let out = d.push(&pkt.payload);
            if i + 1 < packets.len() {
                assert!(!out.complete);
                assert!(out.nals.is_empty());
            } else {
                assert!(out.complete);
            }
            emitted.extend(out.nals);
        }
        assert_eq!(emitted.len(), 1);
        assert_eq!(&emitted[0][..], &nal[..]);
    }

    #[test]
    fn stap_a_splits_5_and_10() {
        let a = [0x67, 1, 2, 3, 4];
        let b = [0x68, 9, 8, 7, 6, 5, 4, 3, 2, 1];
        let mut payload = vec![0x18];
        payload.extend_from_slice(&(a.len() as u16).to_be_bytes());
        payload.extend_from_slice(&a);
        payload.extend_from_slice(&(b.len() as u16).to_be_bytes());
        payload.extend_from_slice(&b);

        let out = H264Depacketizer::new().push(&payload);
        assert!(out.complete);
        assert_eq!(out.nals.len(), 2);
        assert_eq!(&out.nals[0][..], &a);
        assert_eq!(&out.nals[1][..], &b);
    }

    #[test]
    fn stap_a_truncated_keeps_parsed_prefix() {
        let payload = [0x18, 0, 2, 0x67, 0x01, 0, 9, 0x68];
        let out = H264Depacketizer::new().push(&payload);
        assert_eq!(out.nals, vec![Bytes::from_static(&[0x67, 0x01])]);
    }

    #[test]
    fn orphan_fragment_dropped() {
        let mut d = H264Depacketizer::new();
        // middle fragment, no start seen
        let out = d.push(&[0x7C, 0x05, 0xAA]);
        assert!(out.nals.is_empty());
        assert!(out.complete);
    }

    #[test]
    fn new_start_discards_unfinished_fragment() {
        let mut d = H264Depacketizer::new();
        d.push(&[0x7C, 0x85, 0x01]);
        d.push(&[0x7C, 0x81, 0x02]);
        let out = d.push(&[0x7C, 0x41, 0x03]);
        assert_eq!(out.nals, vec![Bytes::from_static(&[0x61, 0x02, 0x03])]);
    }
}

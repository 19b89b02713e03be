use std::fmt;

use base64::prelude::{BASE64_STANDARD, Engine as _};
use bytes::Bytes;

use super::rtp::{MediaPacket, RTP_HEADER_LEN, RtpHeader};
use super::{MediaKind, Packetizer};

/// Annex B start code written in front of every NAL unit the relay emits.
pub const ANNEX_B_START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Profile used in SDP when no SPS has been seen yet (Constrained Baseline 3.1).
const DEFAULT_PROFILE_LEVEL_ID: &str = "42e01f";

/// H.264 NAL unit types (ITU-T H.264 Table 7-1) plus the RFC 6184
/// aggregation and fragmentation types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalUnitType {
    Unspecified,
    CodedSliceNonIdr,
    CodedSliceDataPartitionA,
    CodedSliceDataPartitionB,
    CodedSliceDataPartitionC,
    CodedSliceIdr,
    Sei,
    Sps,
    Pps,
    Aud,
    EndOfSequence,
    EndOfStream,
    Filler,
    SpsExt,
    CodedSliceAux,
    /// RFC 6184 §5.7.1 single-time aggregation packet.
    StapA,
    /// RFC 6184 §5.8 fragmentation unit.
    FuA,
    Other(u8),
}

impl NalUnitType {
    /// Classify from the first byte of a NAL unit (low five bits).
    pub fn from_header(byte: u8) -> Self {
        match byte & 0x1f {
            0 => Self::Unspecified,
            1 => Self::CodedSliceNonIdr,
            2 => Self::CodedSliceDataPartitionA,
            3 => Self::CodedSliceDataPartitionB,
            4 => Self::CodedSliceDataPartitionC,
            5 => Self::CodedSliceIdr,
            6 => Self::Sei,
            7 => Self::Sps,
            8 => Self::Pps,
            9 => Self::Aud,
            10 => Self::EndOfSequence,
            11 => Self::EndOfStream,
            12 => Self::Filler,
            13 => Self::SpsExt,
            19 => Self::CodedSliceAux,
            24 => Self::StapA,
            28 => Self::FuA,
            other => Self::Other(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Unspecified => 0,
            Self::CodedSliceNonIdr => 1,
            Self::CodedSliceDataPartitionA => 2,
            Self::CodedSliceDataPartitionB => 3,
            Self::CodedSliceDataPartitionC => 4,
            Self::CodedSliceIdr => 5,
            Self::Sei => 6,
            Self::Sps => 7,
            Self::Pps => 8,
            Self::Aud => 9,
            Self::EndOfSequence => 10,
            Self::EndOfStream => 11,
            Self::Filler => 12,
            Self::SpsExt => 13,
            Self::CodedSliceAux => 19,
            Self::StapA => 24,
            Self::FuA => 28,
            Self::Other(t) => t,
        }
    }

    /// Video coding layer NAL units carry picture data.
    pub fn is_vcl(self) -> bool {
        matches!(
            self,
            Self::CodedSliceNonIdr
                | Self::CodedSliceDataPartitionA
                | Self::CodedSliceDataPartitionB
                | Self::CodedSliceDataPartitionC
                | Self::CodedSliceIdr
        )
    }
}

impl fmt::Display for NalUnitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unspecified => "Unspecified",
            Self::CodedSliceNonIdr => "CodedSliceNonIdr",
            Self::CodedSliceDataPartitionA => "CodedSliceDataPartitionA",
            Self::CodedSliceDataPartitionB => "CodedSliceDataPartitionB",
            Self::CodedSliceDataPartitionC => "CodedSliceDataPartitionC",
            Self::CodedSliceIdr => "CodedSliceIdr",
            Self::Sei => "SEI",
            Self::Sps => "SPS",
            Self::Pps => "PPS",
            Self::Aud => "AUD",
            Self::EndOfSequence => "EndOfSequence",
            Self::EndOfStream => "EndOfStream",
            Self::Filler => "Filler",
            Self::SpsExt => "SpsExt",
            Self::CodedSliceAux => "CodedSliceAux",
            Self::StapA => "STAP-A",
            Self::FuA => "FU-A",
            Self::Other(_) => "Unknown",
        };
        write!(f, "{}({})", name, self.as_u8())
    }
}

/// Extract NAL units from an H.264 Annex B bitstream.
///
/// Scans for start codes (both 4-byte `00 00 00 01` and 3-byte
/// `00 00 01`) and returns the NAL data between them, excluding
/// the start codes themselves.
///
/// The start code length is tracked per-NAL to ensure boundaries
/// between adjacent NALs are computed correctly when mixed 3-byte
/// and 4-byte start codes appear.
pub fn extract_nal_units(data: &[u8]) -> Vec<&[u8]> {
    let mut nal_units = Vec::new();
    let mut i = 0usize;

    // (nal_data_start_index, start_code_length)
    let mut start_entries: Vec<(usize, usize)> = Vec::new();

    while i < data.len() {
        if i + 3 < data.len() && data[i..i + 4] == [0, 0, 0, 1] {
            start_entries.push((i + 4, 4));
            i += 4;
        } else if i + 2 < data.len() && data[i..i + 3] == [0, 0, 1] {
            start_entries.push((i + 3, 3));
            i += 3;
        } else {
            i += 1;
        }
    }

    for (idx, &(start, _)) in start_entries.iter().enumerate() {
        let end = if idx + 1 < start_entries.len() {
            let (next_start, next_sc_len) = start_entries[idx + 1];
            next_start - next_sc_len
        } else {
            data.len()
        };

        if start < end {
            nal_units.push(&data[start..end]);
        }
    }

    nal_units
}

/// Whether a payload already carries Annex B framing.
pub fn is_annex_b(data: &[u8]) -> bool {
    data.starts_with(&ANNEX_B_START_CODE)
}

/// Split an AVCC payload (4-byte big-endian length before every NAL unit),
/// as carried in RTMP/FLV video tags.
///
/// Returns `None` when the lengths do not tile the payload exactly.
pub fn split_avcc(data: &[u8]) -> Option<Vec<&[u8]>> {
    let mut nal_units = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        if rest.len() < 4 {
            return None;
        }
        let len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        if len == 0 || rest.len() - 4 < len {
            return None;
        }
        nal_units.push(&rest[4..4 + len]);
        rest = &rest[4 + len..];
    }
    if nal_units.is_empty() {
        None
    } else {
        Some(nal_units)
    }
}

/// Build one Annex B access unit from a source video payload.
///
/// Key frames get the stored SPS/PPS prepended. Payloads that already start
/// with a start code pass through unmodified; AVCC payloads are re-framed;
/// anything else is treated as one raw NAL unit.
pub fn assemble_access_unit(
    payload: &[u8],
    is_key_frame: bool,
    parameter_sets: Option<(&[u8], &[u8])>,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 64);

    if is_key_frame {
        if let Some((sps, pps)) = parameter_sets {
            out.extend_from_slice(&ANNEX_B_START_CODE);
            out.extend_from_slice(sps);
            out.extend_from_slice(&ANNEX_B_START_CODE);
            out.extend_from_slice(pps);
        }
    }

    if is_annex_b(payload) {
        out.extend_from_slice(payload);
    } else if let Some(nal_units) = split_avcc(payload) {
        for nal in nal_units {
            out.extend_from_slice(&ANNEX_B_START_CODE);
            out.extend_from_slice(nal);
        }
    } else if !payload.is_empty() {
        out.extend_from_slice(&ANNEX_B_START_CODE);
        out.extend_from_slice(payload);
    }

    out
}

/// H.264 RTP packetizer (RFC 6184).
///
/// Converts H.264 Annex B access units into RTP packets. Supports two
/// packetization modes from RFC 6184:
///
/// - **Single NAL Unit** (§5.6): NALs that fit within the MTU are sent
///   as-is in a single RTP packet (12-byte header + NAL bytes).
///
/// - **FU-A Fragmentation** (§5.8): NALs exceeding the MTU are split
///   across multiple RTP packets. Each fragment carries a 2-byte FU
///   header (FU indicator + FU header) before the NAL payload:
///
///   ```text
///   FU indicator:  [F|NRI|Type=28]     (1 byte)
///   FU header:     [S|E|R|NAL_Type]    (1 byte)
///   Fragment data: [...]               (up to MTU - 14 bytes)
///   ```
///
/// Access unit delimiters and filler data are not forwarded.
///
/// The RTP marker bit is set on the last packet of each access unit, and
/// every packet of an access unit containing an IDR slice is flagged as a
/// key-frame packet.
#[derive(Debug)]
pub struct H264Packetizer {
    header: RtpHeader,
    max_payload: usize,
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
}

impl H264Packetizer {
    /// Create with explicit payload type, SSRC and MTU (whole RTP packet).
    pub fn new(pt: u8, ssrc: u32, mtu: usize) -> Self {
        Self {
            header: RtpHeader::randomized(pt, ssrc),
            max_payload: mtu.saturating_sub(RTP_HEADER_LEN).max(3),
            sps: None,
            pps: None,
        }
    }

    /// Provide SPS/PPS from the source's codec parameters.
    pub fn set_parameter_sets(&mut self, sps: &[u8], pps: &[u8]) {
        self.sps = Some(sps.to_vec());
        self.pps = Some(pps.to_vec());
    }

    /// Derive profile-level-id from SPS NAL (RFC 6184 §8.1): bytes 1–3 are profile_idc, constraint_set, level_idc.
    fn profile_level_id(&self) -> String {
        match self.sps.as_deref() {
            Some(sps) if sps.len() >= 4 => {
                format!("{:02x}{:02x}{:02x}", sps[1], sps[2], sps[3])
            }
            _ => DEFAULT_PROFILE_LEVEL_ID.to_string(),
        }
    }

    fn sprop_parameter_sets(&self) -> Option<String> {
        let sps = self.sps.as_deref()?;
        let pps = self.pps.as_deref()?;
        Some(format!(
            "{},{}",
            BASE64_STANDARD.encode(sps),
            BASE64_STANDARD.encode(pps)
        ))
    }

    /// Packetize a single NAL unit into one or more RTP packets.
    fn packetize_nal(
        &mut self,
        nal_unit: &[u8],
        is_last_nal: bool,
        is_key_frame: bool,
    ) -> Vec<MediaPacket> {
        let mut packets = Vec::new();

        if nal_unit.is_empty() {
            return packets;
        }

        if nal_unit.len() <= self.max_payload {
            // Single NAL Unit mode (RFC 6184 §5.6)
            let payload = Bytes::copy_from_slice(nal_unit);
            packets.push(self.header.stamp(payload, is_last_nal, is_key_frame));
        } else {
            // FU-A fragmentation (RFC 6184 §5.8)
            let nal_header = nal_unit[0];
            let nal_type = nal_header & 0x1f;
            let fu_indicator = (nal_header & 0xe0) | 28;
            let payload = &nal_unit[1..];

            let max_fragment = self.max_payload - 2;
            let mut offset = 0usize;
            let mut first = true;

            while offset < payload.len() {
                let remaining = payload.len() - offset;
                let last_fragment = remaining <= max_fragment;
                let chunk_size = std::cmp::min(max_fragment, remaining);
                let chunk = &payload[offset..offset + chunk_size];

                let start_bit = if first { 0x80 } else { 0x00 };
                let end_bit = if last_fragment { 0x40 } else { 0x00 };
                let fu_header = start_bit | end_bit | nal_type;

                let mut fragment = Vec::with_capacity(2 + chunk.len());
                fragment.push(fu_indicator);
                fragment.push(fu_header);
                fragment.extend_from_slice(chunk);

                let marker = is_last_nal && last_fragment;
                packets.push(
                    self.header
                        .stamp(Bytes::from(fragment), marker, is_key_frame),
                );

                offset += chunk_size;
                first = false;
            }

            tracing::trace!(
                nal_type,
                nal_size = nal_unit.len(),
                fragments = packets.len(),
                "FU-A fragmented NAL unit"
            );
        }

        packets
    }
}

impl Packetizer for H264Packetizer {
    fn packetize(&mut self, encoded_data: &[u8], timestamp_increment: u32) -> Vec<MediaPacket> {
        self.header.advance_timestamp(timestamp_increment);

        let nal_units: Vec<&[u8]> = extract_nal_units(encoded_data)
            .into_iter()
            .filter(|nal| {
                !matches!(
                    NalUnitType::from_header(nal[0]),
                    NalUnitType::Aud | NalUnitType::Filler
                )
            })
            .collect();

        let mut is_key_frame = false;
        for nal in &nal_units {
            match NalUnitType::from_header(nal[0]) {
                NalUnitType::CodedSliceIdr => is_key_frame = true,
                NalUnitType::Sps if self.sps.as_deref() != Some(*nal) => {
                    self.sps = Some(nal.to_vec());
                    tracing::debug!("H.264 SPS captured from bitstream ({} bytes)", nal.len());
                }
                NalUnitType::Pps if self.pps.as_deref() != Some(*nal) => {
                    self.pps = Some(nal.to_vec());
                    tracing::debug!("H.264 PPS captured from bitstream ({} bytes)", nal.len());
                }
                _ => {}
            }
        }

        let mut packets = Vec::new();
        for (i, nal) in nal_units.iter().enumerate() {
            let is_last = i == nal_units.len() - 1;
            packets.append(&mut self.packetize_nal(nal, is_last, is_key_frame));
        }

        tracing::trace!(
            nal_count = nal_units.len(),
            rtp_packets = packets.len(),
            frame_bytes = encoded_data.len(),
            key_frame = is_key_frame,
            seq = self.header.sequence(),
            ts = self.header.timestamp(),
            "frame packetized"
        );

        packets
    }

    fn kind(&self) -> MediaKind {
        MediaKind::Video
    }

    fn codec_name(&self) -> &'static str {
        "H264"
    }

    /// 90 kHz clock rate per RFC 6184 §8.1.
    fn clock_rate(&self) -> u32 {
        90000
    }

    fn payload_type(&self) -> u8 {
        self.header.pt
    }

    fn ssrc(&self) -> u32 {
        self.header.ssrc
    }

    /// SDP attributes per RFC 6184 §8.2.1.
    ///
    /// `a=rtpmap` defines the payload type and must precede the `a=fmtp`
    /// line that references it.
    fn sdp_attributes(&self) -> Vec<String> {
        let pt = self.payload_type();
        let mut fmtp = format!(
            "a=fmtp:{} level-asymmetry-allowed=1;packetization-mode=1;profile-level-id={}",
            pt,
            self.profile_level_id()
        );
        if let Some(sprop) = self.sprop_parameter_sets() {
            fmtp.push_str(&format!(";sprop-parameter-sets={}", sprop));
        }

        vec![
            format!("a=rtpmap:{} {}/{}", pt, self.codec_name(), self.clock_rate()),
            format!("a=rtcp-fb:{} nack", pt),
            format!("a=rtcp-fb:{} nack pli", pt),
            fmtp,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_packetizer() -> H264Packetizer {
        H264Packetizer::new(102, 0xAABBCCDD, 1200)
    }

    // --- NAL extraction ---

    #[test]
    fn extract_single_nal_4byte_sc() {
        let data = [0, 0, 0, 1, 0x65, 0xAA, 0xBB];
        let nals = extract_nal_units(&data);
        assert_eq!(nals, vec![&[0x65, 0xAA, 0xBB][..]]);
    }

    #[test]
    fn extract_mixed_start_codes() {
        let mut data = vec![0, 0, 0, 1, 0x67, 0x42];
        data.extend_from_slice(&[0, 0, 1, 0x68, 0xCE]);
        let nals = extract_nal_units(&data);
        assert_eq!(nals.len(), 2);
        assert_eq!(nals[0], &[0x67, 0x42]);
        assert_eq!(nals[1], &[0x68, 0xCE]);
    }

    #[test]
    fn extract_no_start_code() {
        assert!(extract_nal_units(&[]).is_empty());
        assert!(extract_nal_units(&[0xFF, 0xFE]).is_empty());
    }

    // --- Access unit assembly ---

    #[test]
    fn avcc_split_and_reject() {
        let data = [0, 0, 0, 2, 0x65, 0x01, 0, 0, 0, 1, 0x06];
        let nals = split_avcc(&data).unwrap();
        assert_eq!(nals, vec![&[0x65, 0x01][..], &[0x06][..]]);

        // length runs past the end
        assert!(split_avcc(&[0, 0, 0, 9, 0x65]).is_none());
    }

    #[test]
    fn key_frame_gets_parameter_sets_prepended() {
        let avcc = [0, 0, 0, 2, 0x65, 0x88];
        let out = assemble_access_unit(&avcc, true, Some((&[0x67, 0x42], &[0x68, 0xCE])));
        assert_eq!(
            out,
            vec![0, 0, 0, 1, 0x67, 0x42, 0, 0, 0, 1, 0x68, 0xCE, 0, 0, 0, 1, 0x65, 0x88]
        );
    }

    #[test]
    fn annex_b_payload_passes_through() {
        let annex_b = [0, 0, 0, 1, 0x41, 0x9A];
        let out = assemble_access_unit(&annex_b, false, Some((&[0x67], &[0x68])));
        assert_eq!(out, annex_b.to_vec());
    }

    #[test]
    fn nal_type_names() {
        assert_eq!(NalUnitType::from_header(0x65), NalUnitType::CodedSliceIdr);
        assert_eq!(NalUnitType::from_header(0x7c), NalUnitType::FuA);
        assert_eq!(NalUnitType::Sps.to_string(), "SPS(7)");
        assert_eq!(NalUnitType::from_header(0x1e).to_string(), "Unknown(30)");
        assert!(NalUnitType::CodedSliceNonIdr.is_vcl());
        assert!(!NalUnitType::Pps.is_vcl());
    }

    // --- Packetization ---

    #[test]
    fn small_nal_single_packet() {
        let mut p = make_packetizer();
        let nal = vec![0x65, 0xAA, 0xBB, 0xCC];
        let packets = p.packetize_nal(&nal, true, true);
        assert_eq!(packets.len(), 1);
        assert_eq!(&packets[0].payload[..], &nal[..]);
        assert!(packets[0].marker);
    }

    #[test]
    fn large_nal_fragmented() {
        let mut p = make_packetizer();
        let mut nal = vec![0x65];
        nal.extend(vec![0xAA; 3000]);
        let packets = p.packetize_nal(&nal, true, true);
        assert!(packets.len() > 1);
        assert!(packets.iter().all(|pkt| pkt.marshal().len() <= 1200));

        assert_eq!(packets[0].payload[0] & 0x1f, 28); // FU-A type
        assert_eq!(packets[0].payload[0] & 0x60, 0x60); // NRI kept
        assert_eq!(packets[0].payload[1] & 0x80, 0x80); // Start bit
        assert_eq!(packets[0].payload[1] & 0x1f, 5); // original type

        let last = packets.last().unwrap();
        assert_eq!(last.payload[1] & 0x40, 0x40); // End bit
        assert!(last.marker);
        assert!(packets[..packets.len() - 1].iter().all(|pkt| !pkt.marker));
    }

    #[test]
    fn packetize_advances_timestamp_before_stamping() {
        let mut p = make_packetizer();
        let frame = [0, 0, 0, 1, 0x41, 0xAA, 0xBB];
        let first = p.packetize(&frame, 0);
        let second = p.packetize(&frame, 3000);
        assert_eq!(
            second[0].timestamp.wrapping_sub(first[0].timestamp),
            3000
        );
        assert_eq!(
            second[0].sequence_number,
            first[0].sequence_number.wrapping_add(1)
        );
    }

    #[test]
    fn drops_aud_and_flags_key_frames() {
        let mut p = make_packetizer();
        let frame = [
            &[0u8, 0, 0, 1, 0x09, 0xF0][..], // AUD
            &[0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1e][..],
            &[0, 0, 0, 1, 0x68, 0xce, 0x38, 0x80][..],
            &[0, 0, 0, 1, 0x65, 0x88, 0x00][..],
        ]
        .concat();
        let packets = p.packetize(&frame, 0);
        assert_eq!(packets.len(), 3);
        assert!(packets.iter().all(|pkt| pkt.is_key_frame));
        assert!(packets[2].marker);

        let delta = p.packetize(&[0, 0, 0, 1, 0x41, 0x01], 3000);
        assert!(!delta[0].is_key_frame);
    }

    #[test]
    fn sdp_attributes_use_captured_sps() {
        let mut p = make_packetizer();
        let attrs = p.sdp_attributes();
        assert!(attrs[0] == "a=rtpmap:102 H264/90000");
        assert!(attrs.iter().any(|a| a.contains("profile-level-id=42e01f")));
        assert!(attrs.iter().any(|a| a == "a=rtcp-fb:102 nack pli"));

        p.set_parameter_sets(&[0x67, 0x64, 0x00, 0x28], &[0x68, 0xee]);
        let fmtp = p
            .sdp_attributes()
            .into_iter()
            .find(|a| a.starts_with("a=fmtp:"))
            .expect("fmtp line");
        assert!(fmtp.contains("profile-level-id=640028"));
        assert!(fmtp.contains("sprop-parameter-sets="));
    }
}

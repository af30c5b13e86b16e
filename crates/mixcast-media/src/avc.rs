// crates/mixcast-media/src/avc.rs
//
// Annex-B H.264 bitstream utilities: start-code scanning, IDR detection,
// SPS/PPS/SEI extraction, Annex-B → AVCC repackaging, and the
// AVCDecoderConfigurationRecord the FLV sequence header carries.
//
// Start codes are 00 00 01 or 00 00 00 01; NAL payloads follow until the
// next start code. The scanner returns the position of the 3-byte form and
// the callers skip leading zeros themselves, so both forms parse the same.

use mixcast_core::packet::{nal_priority, EncoderPacket, PacketType};

pub const NAL_SLICE: u8 = 1;
pub const NAL_SLICE_IDR: u8 = 5;
pub const NAL_SEI: u8 = 6;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;

/// Index of the next start code at or after `from`, or `data.len()`.
///
/// The returned index points at the first byte of the start code,
/// including the extra zero of a 4-byte code.
pub fn find_startcode(data: &[u8], from: usize) -> usize {
    let mut i = from;
    let end = data.len();
    while i + 3 <= end {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            // fold a preceding zero into the start code (4-byte form)
            if i > from && data[i - 1] == 0 {
                return i - 1;
            }
            return i;
        }
        i += 1;
    }
    end
}

/// Iterate NAL units of an Annex-B stream as `(code_start, payload)` —
/// `code_start` includes the unit's start code, `payload` does not.
pub fn nal_units(data: &[u8]) -> impl Iterator<Item = (usize, &[u8])> {
    let mut pos = find_startcode(data, 0);
    std::iter::from_fn(move || {
        loop {
            if pos >= data.len() {
                return None;
            }
            let code_start = pos;
            let mut payload_start = pos;
            while payload_start < data.len() && data[payload_start] == 0 {
                payload_start += 1;
            }
            payload_start += 1; // the 0x01
            if payload_start >= data.len() {
                return None;
            }
            let next = find_startcode(data, payload_start);
            pos = next;
            if next > payload_start {
                return Some((code_start, &data[payload_start..next]));
            }
            // zero-length unit (back-to-back start codes): skip
        }
    })
}

/// True iff the first VCL NAL of the packet is an IDR slice.
pub fn is_keyframe(data: &[u8]) -> bool {
    for (_, nal) in nal_units(data) {
        let ty = nal[0] & 0x1F;
        if ty == NAL_SLICE_IDR || ty == NAL_SLICE {
            return ty == NAL_SLICE_IDR;
        }
    }
    false
}

/// Repackage an Annex-B packet as AVCC (4-byte big-endian length prefixes)
/// and re-derive keyframe / priority from the slice NAL. The original
/// packet's timestamps and flags carry over; `drop_priority` follows the
/// slice's nal_ref_idc.
pub fn parse_packet(src: &EncoderPacket) -> EncoderPacket {
    debug_assert_eq!(src.ptype, PacketType::Video);

    let mut out = Vec::with_capacity(src.data.len() + 16);
    let mut keyframe = src.keyframe;
    let mut priority = src.priority;

    for (_, nal) in nal_units(&src.data) {
        let ty = nal[0] & 0x1F;
        if ty == NAL_SLICE_IDR || ty == NAL_SLICE {
            keyframe = ty == NAL_SLICE_IDR;
            priority = (nal[0] >> 5) as i32;
        }
        out.extend_from_slice(&(nal.len() as u32).to_be_bytes());
        out.extend_from_slice(nal);
    }

    let mut packet = src.clone();
    packet.data = std::sync::Arc::new(out);
    packet.keyframe = keyframe;
    packet.priority = priority;
    packet.drop_priority = priority;
    packet
}

/// Split an Annex-B packet into (payload, SPS/PPS header data, SEI data),
/// each still in Annex-B framing.
pub fn extract_headers(packet: &[u8]) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
    let mut payload = Vec::with_capacity(packet.len());
    let mut header = Vec::new();
    let mut sei = Vec::new();

    let mut starts: Vec<usize> = nal_units(packet).map(|(s, _)| s).collect();
    starts.push(packet.len());

    for (idx, (_, nal)) in nal_units(packet).enumerate() {
        let unit = &packet[starts[idx]..starts[idx + 1]];
        match nal[0] & 0x1F {
            NAL_SPS | NAL_PPS => header.extend_from_slice(unit),
            NAL_SEI => sei.extend_from_slice(unit),
            _ => payload.extend_from_slice(unit),
        }
    }

    (payload, header, sei)
}

/// First SPS and PPS payloads (no start codes) found in `data`.
pub fn sps_pps(data: &[u8]) -> (Option<&[u8]>, Option<&[u8]>) {
    let mut sps = None;
    let mut pps = None;
    for (_, nal) in nal_units(data) {
        match nal[0] & 0x1F {
            NAL_SPS if sps.is_none() => sps = Some(nal),
            NAL_PPS if pps.is_none() => pps = Some(nal),
            _ => {}
        }
    }
    (sps, pps)
}

/// Build the AVCDecoderConfigurationRecord from Annex-B extradata:
///
/// ```text
/// 01 | profile (SPS[1]) | constraint (SPS[2]) | level (SPS[3]) |
/// FF (lengthSizeMinusOne = 3) | E1 (one SPS) | sps_len:u16 | sps |
/// 01 (one PPS) | pps_len:u16 | pps
/// ```
///
/// Extradata that is not Annex-B framed is assumed to already be a config
/// record and passes through unchanged. Returns None when no usable
/// SPS/PPS pair is present.
pub fn header_to_avcc(extradata: &[u8]) -> Option<Vec<u8>> {
    if extradata.len() <= 6 {
        return None;
    }
    if !has_start_code(extradata) {
        return Some(extradata.to_vec());
    }

    let (sps, pps) = sps_pps(extradata);
    let (sps, pps) = (sps?, pps?);
    if sps.len() < 4 {
        return None;
    }

    let mut out = Vec::with_capacity(11 + sps.len() + pps.len());
    out.push(0x01);
    out.extend_from_slice(&sps[1..4]);
    out.push(0xFF);
    out.push(0xE1);
    out.extend_from_slice(&(sps.len() as u16).to_be_bytes());
    out.extend_from_slice(sps);
    out.push(0x01);
    out.extend_from_slice(&(pps.len() as u16).to_be_bytes());
    out.extend_from_slice(pps);
    Some(out)
}

fn has_start_code(data: &[u8]) -> bool {
    data.len() >= 4
        && data[0] == 0
        && data[1] == 0
        && (data[2] == 1 || (data[2] == 0 && data[3] == 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn annexb(units: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for u in units {
            out.extend_from_slice(&[0, 0, 0, 1]);
            out.extend_from_slice(u);
        }
        out
    }

    #[test]
    fn finds_three_and_four_byte_codes() {
        let data = [0, 0, 1, 0xAA, 0, 0, 0, 1, 0xBB];
        assert_eq!(find_startcode(&data, 0), 0);
        assert_eq!(find_startcode(&data, 3), 3); // 4-byte form, zero folded in
    }

    #[test]
    fn keyframe_detection() {
        let idr = annexb(&[&[0x06, 0x05], &[0x65, 0x88]]);
        let non = annexb(&[&[0x41, 0x9A]]);
        assert!(is_keyframe(&idr));
        assert!(!is_keyframe(&non));
    }

    #[test]
    fn avcc_repack_prefixes_lengths() {
        let mut src = EncoderPacket::new(PacketType::Video, annexb(&[&[0x65, 1, 2, 3]]));
        src.keyframe = false;
        let out = parse_packet(&src);
        assert_eq!(&out.data[..], &[0, 0, 0, 4, 0x65, 1, 2, 3]);
        assert!(out.keyframe);
        assert_eq!(out.priority, 0x65 >> 5);
        assert_eq!(out.drop_priority, out.priority);
    }

    #[test]
    fn header_split_routes_nal_types() {
        let sps = [0x67, 0x42, 0xC0, 0x1F];
        let pps = [0x68, 0xCE, 0x3C, 0x80];
        let sei = [0x06, 0x05, 0x01];
        let idr = [0x65, 0xAA];
        let data = annexb(&[&sps, &pps, &sei, &idr]);
        let (payload, header, sei_out) = extract_headers(&data);
        assert_eq!(payload, annexb(&[&idr]));
        assert_eq!(header, annexb(&[&sps, &pps]));
        assert_eq!(sei_out, annexb(&[&sei]));
    }

    #[test]
    fn avcc_config_record_layout() {
        // 20-byte SPS starting 67 42 C0 1F, 4-byte PPS 68 CE 3C 80
        let mut sps = vec![0x67, 0x42, 0xC0, 0x1F];
        sps.extend_from_slice(&[0u8; 16]);
        let pps = vec![0x68, 0xCE, 0x3C, 0x80];
        let extradata = annexb(&[&sps, &pps]);

        let rec = header_to_avcc(&extradata).expect("config record");
        let mut expect = vec![0x01, 0x42, 0xC0, 0x1F, 0xFF, 0xE1, 0x00, 0x14];
        expect.extend_from_slice(&sps);
        expect.extend_from_slice(&[0x01, 0x00, 0x04]);
        expect.extend_from_slice(&pps);
        assert_eq!(rec, expect);
    }

    #[test]
    fn non_annexb_extradata_passes_through() {
        let avcc = vec![0x01, 0x42, 0xC0, 0x1F, 0xFF, 0xE1, 0x00];
        assert_eq!(header_to_avcc(&avcc).unwrap(), avcc);
    }

    #[test]
    fn packet_larger_than_one_nal_roundtrips() {
        let a = [0x41, 0x10, 0x20];
        let b = [0x01, 0x30];
        let src = EncoderPacket::new(PacketType::Video, annexb(&[&a, &b]));
        let out = parse_packet(&src);
        // deinterleave by length prefixes and compare
        let d = &out.data;
        let la = u32::from_be_bytes([d[0], d[1], d[2], d[3]]) as usize;
        assert_eq!(&d[4..4 + la], &a);
        let lb_off = 4 + la;
        let lb = u32::from_be_bytes([
            d[lb_off],
            d[lb_off + 1],
            d[lb_off + 2],
            d[lb_off + 3],
        ]) as usize;
        assert_eq!(&d[lb_off + 4..lb_off + 4 + lb], &b);
    }
}

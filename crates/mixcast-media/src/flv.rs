// crates/mixcast-media/src/flv.rs
//
// FLV tag construction for the RTMP backend: the onMetaData script tag,
// AVC / AAC tag bodies, and whole-tag serialization for file-style sinks.
//
// The RTMP sender hands tag *bodies* plus a millisecond timestamp to the
// protocol session (which frames them into chunks); flv_packet_mux emits
// the complete 11-byte-header + trailing-size form used when the FLV
// stream is written directly.
//
// Hard-coded to H.264 + AAC, like the pipeline feeding it.

use mixcast_core::packet::{EncoderPacket, PacketType};

const TAG_AUDIO: u8 = 0x08;
const TAG_VIDEO: u8 = 0x09;
const TAG_SCRIPT: u8 = 0x12;

const AMF_NUMBER: u8 = 0x00;
const AMF_BOOLEAN: u8 = 0x01;
const AMF_STRING: u8 = 0x02;
const AMF_ECMA_ARRAY: u8 = 0x08;
const AMF_OBJECT_END: u8 = 0x09;

const VIDEOCODECID_AVC: f64 = 7.0;
const AUDIOCODECID_AAC: f64 = 10.0;

// ── byte writer ───────────────────────────────────────────────────────────────

fn w8(out: &mut Vec<u8>, v: u8) {
    out.push(v);
}

fn wb16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn wb24(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes()[1..]);
}

fn wb32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

// ── AMF0 ──────────────────────────────────────────────────────────────────────

fn amf_string(out: &mut Vec<u8>, s: &str) {
    w8(out, AMF_STRING);
    wb16(out, s.len() as u16);
    out.extend_from_slice(s.as_bytes());
}

fn amf_prop_name(out: &mut Vec<u8>, name: &str) {
    wb16(out, name.len() as u16);
    out.extend_from_slice(name.as_bytes());
}

fn amf_num_val(out: &mut Vec<u8>, name: &str, v: f64) {
    amf_prop_name(out, name);
    w8(out, AMF_NUMBER);
    out.extend_from_slice(&v.to_be_bytes());
}

fn amf_bool_val(out: &mut Vec<u8>, name: &str, v: bool) {
    amf_prop_name(out, name);
    w8(out, AMF_BOOLEAN);
    w8(out, v as u8);
}

fn amf_str_val(out: &mut Vec<u8>, name: &str, v: &str) {
    amf_prop_name(out, name);
    amf_string(out, v);
}

// ── metadata ──────────────────────────────────────────────────────────────────

/// The onMetaData body: "@setDataFrame", "onMetaData", then a 20-entry
/// ECMA array describing the stream.
fn build_meta_data(
    width: u32,
    height: u32,
    video_kbps: u32,
    frame_rate: u32,
    channels: u32,
    sample_rate: u32,
    audio_kbps: u32,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(512);

    amf_string(&mut out, "@setDataFrame");
    amf_string(&mut out, "onMetaData");

    w8(&mut out, AMF_ECMA_ARRAY);
    wb32(&mut out, 20);

    amf_num_val(&mut out, "duration", 0.0);
    amf_num_val(&mut out, "fileSize", 0.0);

    amf_num_val(&mut out, "width", width as f64);
    amf_num_val(&mut out, "height", height as f64);

    amf_num_val(&mut out, "videocodecid", VIDEOCODECID_AVC);
    amf_num_val(&mut out, "videodatarate", video_kbps as f64);
    amf_num_val(&mut out, "framerate", frame_rate as f64);

    amf_num_val(&mut out, "audiocodecid", AUDIOCODECID_AAC);
    amf_num_val(&mut out, "audiodatarate", audio_kbps as f64);
    amf_num_val(&mut out, "audiosamplerate", sample_rate as f64);
    amf_num_val(&mut out, "audiosamplesize", 16.0);
    amf_num_val(&mut out, "audiochannels", channels as f64);

    amf_bool_val(&mut out, "stereo", channels == 2);
    amf_bool_val(&mut out, "2.1", channels == 3);
    amf_bool_val(&mut out, "3.1", channels == 4);
    amf_bool_val(&mut out, "4.0", channels == 4);
    amf_bool_val(&mut out, "4.1", channels == 5);
    amf_bool_val(&mut out, "5.1", channels == 6);
    amf_bool_val(&mut out, "7.1", channels == 8);

    amf_str_val(&mut out, "encoder", "mixcast rtmp output");

    wb16(&mut out, 0);
    w8(&mut out, AMF_OBJECT_END);

    out
}

/// The complete metadata script tag. With `write_header` the 9-byte FLV
/// file header and zero previous-tag-size precede it (file sinks only;
/// RTMP never writes the file header).
pub fn flv_meta_data(
    width: u32,
    height: u32,
    video_kbps: u32,
    frame_rate: u32,
    channels: u32,
    sample_rate: u32,
    audio_kbps: u32,
    write_header: bool,
) -> Vec<u8> {
    let meta = build_meta_data(
        width,
        height,
        video_kbps,
        frame_rate,
        channels,
        sample_rate,
        audio_kbps,
    );

    let mut out = Vec::with_capacity(meta.len() + 32);
    if write_header {
        out.extend_from_slice(b"FLV");
        w8(&mut out, 1);
        w8(&mut out, 5); // audio + video present
        wb32(&mut out, 9);
        wb32(&mut out, 0);
    }

    let start = out.len();
    w8(&mut out, TAG_SCRIPT);
    wb24(&mut out, meta.len() as u32);
    wb32(&mut out, 0); // timestamp + extended byte
    wb24(&mut out, 0); // stream id
    out.extend_from_slice(&meta);
    wb32(&mut out, (out.len() - start - 1) as u32);

    out
}

/// The raw metadata body (no tag framing) — what an RTMP data message
/// carries.
pub fn flv_meta_body(
    width: u32,
    height: u32,
    video_kbps: u32,
    frame_rate: u32,
    channels: u32,
    sample_rate: u32,
    audio_kbps: u32,
) -> Vec<u8> {
    build_meta_data(
        width,
        height,
        video_kbps,
        frame_rate,
        channels,
        sample_rate,
        audio_kbps,
    )
}

// ── media tag bodies ──────────────────────────────────────────────────────────

/// VIDEODATA body: frame type | codec id, AVCPacketType, cts24, payload.
/// Returns the body and the tag timestamp in ms (dts, offset applied).
pub fn flv_video_body(
    packet: &EncoderPacket,
    dts_offset_ms: i64,
    is_header: bool,
) -> (Vec<u8>, u32) {
    debug_assert_eq!(packet.ptype, PacketType::Video);
    let cts = packet.ms_time(packet.pts - packet.dts);
    let time_ms = (packet.ms_time(packet.dts) - dts_offset_ms) as u32;

    let mut body = Vec::with_capacity(packet.data.len() + 5);
    w8(&mut body, if packet.keyframe { 0x17 } else { 0x27 });
    w8(&mut body, if is_header { 0 } else { 1 });
    wb24(&mut body, cts as u32);
    body.extend_from_slice(&packet.data);
    (body, time_ms)
}

/// AUDIODATA body for stereo 16-bit AAC: 0xAF, AACPacketType, payload.
pub fn flv_audio_body(
    packet: &EncoderPacket,
    dts_offset_ms: i64,
    is_header: bool,
) -> (Vec<u8>, u32) {
    debug_assert_eq!(packet.ptype, PacketType::Audio);
    let time_ms = (packet.ms_time(packet.dts) - dts_offset_ms) as u32;

    let mut body = Vec::with_capacity(packet.data.len() + 2);
    w8(&mut body, 0xAF);
    w8(&mut body, if is_header { 0 } else { 1 });
    body.extend_from_slice(&packet.data);
    (body, time_ms)
}

// ── whole tags ────────────────────────────────────────────────────────────────

/// Serialize one packet as a complete FLV tag (header, body, trailing tag
/// size). Timestamps wrap per FLV: 24 low bits plus an extension byte
/// masked to 7 bits.
pub fn flv_packet_mux(packet: &EncoderPacket, dts_offset_ms: i64, is_header: bool) -> Vec<u8> {
    if packet.data.is_empty() {
        return Vec::new();
    }

    let (tag_type, (body, time_ms)) = match packet.ptype {
        PacketType::Video => (TAG_VIDEO, flv_video_body(packet, dts_offset_ms, is_header)),
        PacketType::Audio => (TAG_AUDIO, flv_audio_body(packet, dts_offset_ms, is_header)),
    };

    let mut out = Vec::with_capacity(body.len() + 16);
    w8(&mut out, tag_type);
    wb24(&mut out, body.len() as u32);
    wb24(&mut out, time_ms & 0x00FF_FFFF);
    w8(&mut out, ((time_ms >> 24) & 0x7F) as u8);
    wb24(&mut out, 0);
    out.extend_from_slice(&body);
    wb32(&mut out, out.len() as u32 - 1);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    // Minimal AMF0 reader, enough to verify what we wrote.
    struct AmfReader<'a> {
        data: &'a [u8],
        pos: usize,
    }

    impl<'a> AmfReader<'a> {
        fn new(data: &'a [u8]) -> Self {
            Self { data, pos: 0 }
        }

        fn u8(&mut self) -> u8 {
            let v = self.data[self.pos];
            self.pos += 1;
            v
        }

        fn u16(&mut self) -> u16 {
            let v = u16::from_be_bytes([self.data[self.pos], self.data[self.pos + 1]]);
            self.pos += 2;
            v
        }

        fn u32(&mut self) -> u32 {
            let v = u32::from_be_bytes(self.data[self.pos..self.pos + 4].try_into().unwrap());
            self.pos += 4;
            v
        }

        fn f64(&mut self) -> f64 {
            let v = f64::from_be_bytes(self.data[self.pos..self.pos + 8].try_into().unwrap());
            self.pos += 8;
            v
        }

        fn string(&mut self) -> String {
            assert_eq!(self.u8(), AMF_STRING);
            let len = self.u16() as usize;
            let s = String::from_utf8(self.data[self.pos..self.pos + len].to_vec()).unwrap();
            self.pos += len;
            s
        }

        fn prop_name(&mut self) -> String {
            let len = self.u16() as usize;
            let s = String::from_utf8(self.data[self.pos..self.pos + len].to_vec()).unwrap();
            self.pos += len;
            s
        }
    }

    #[test]
    fn meta_data_tag_for_720p30() {
        // 1280×720 @ 30 fps, stereo 48 kHz, 4 Mbps video / 160 kbps audio
        let tag = flv_meta_data(1280, 720, 4000, 30, 2, 48_000, 160, false);

        assert_eq!(tag[0], TAG_SCRIPT);
        let body_len = u32::from_be_bytes([0, tag[1], tag[2], tag[3]]) as usize;
        let body = &tag[11..11 + body_len];
        // the tag wraps exactly the raw data-message body
        assert_eq!(body, flv_meta_body(1280, 720, 4000, 30, 2, 48_000, 160));

        let mut r = AmfReader::new(body);
        assert_eq!(r.string(), "@setDataFrame");
        assert_eq!(r.string(), "onMetaData");
        assert_eq!(r.u8(), AMF_ECMA_ARRAY);
        assert_eq!(r.u32(), 20);

        let mut nums = std::collections::HashMap::new();
        let mut bools = std::collections::HashMap::new();
        loop {
            let name = r.prop_name();
            if name.is_empty() {
                assert_eq!(r.u8(), AMF_OBJECT_END);
                break;
            }
            match r.u8() {
                AMF_NUMBER => {
                    nums.insert(name, r.f64());
                }
                AMF_BOOLEAN => {
                    bools.insert(name, r.u8() != 0);
                }
                AMF_STRING => {
                    let len = r.u16() as usize;
                    r.pos += len;
                }
                other => panic!("unexpected AMF marker {other:#x} for {name}"),
            }
        }

        assert_eq!(nums["width"], 1280.0);
        assert_eq!(nums["height"], 720.0);
        assert_eq!(nums["videocodecid"], 7.0);
        assert_eq!(nums["audiocodecid"], 10.0);
        assert_eq!(nums["audiodatarate"], 160.0);
        assert_eq!(nums["audiosamplerate"], 48_000.0);
        assert_eq!(nums["audiosamplesize"], 16.0);
        assert_eq!(nums["framerate"], 30.0);
        assert!(bools["stereo"]);
        assert!(!bools["5.1"]);

        // trailing tag size covers header + body
        let trail =
            u32::from_be_bytes(tag[tag.len() - 4..].try_into().unwrap()) as usize;
        assert_eq!(trail, tag.len() - 1);
    }

    #[test]
    fn file_header_precedes_when_requested() {
        let tag = flv_meta_data(640, 360, 1000, 25, 2, 44_100, 128, true);
        assert_eq!(&tag[0..3], b"FLV");
        assert_eq!(tag[3], 1);
        assert_eq!(tag[4], 5);
        assert_eq!(tag[13], TAG_SCRIPT);
    }

    fn packet(ptype: PacketType, dts_ms: i64, keyframe: bool, data: &[u8]) -> EncoderPacket {
        let mut p = EncoderPacket::new(ptype, data.to_vec());
        p.pts = dts_ms;
        p.dts = dts_ms;
        p.timebase_num = 1;
        p.timebase_den = 1000;
        p.keyframe = keyframe;
        p.refresh_dts_usec();
        p
    }

    #[test]
    fn video_tag_roundtrip() {
        let p = packet(PacketType::Video, 1234, true, &[0, 0, 0, 2, 0x65, 0x88]);
        let tag = flv_packet_mux(&p, 0, false);

        assert_eq!(tag[0], TAG_VIDEO);
        let size = u32::from_be_bytes([0, tag[1], tag[2], tag[3]]) as usize;
        assert_eq!(size, p.data.len() + 5);
        let ts = u32::from_be_bytes([tag[7], tag[4], tag[5], tag[6]]);
        assert_eq!(ts, 1234);
        assert_eq!(tag[11], 0x17); // keyframe | AVC
        assert_eq!(tag[12], 1); // NALU
        assert_eq!(&tag[16..16 + p.data.len()], &p.data[..]);
    }

    #[test]
    fn interframe_flag_and_offset() {
        let p = packet(PacketType::Video, 5000, false, &[1, 2, 3]);
        let tag = flv_packet_mux(&p, 4000, false);
        let ts = u32::from_be_bytes([tag[7], tag[4], tag[5], tag[6]]);
        assert_eq!(ts, 1000);
        assert_eq!(tag[11], 0x27);
    }

    #[test]
    fn audio_tag_layout() {
        let p = packet(PacketType::Audio, 40, false, &[0xDE, 0xAD]);
        let tag = flv_packet_mux(&p, 0, false);
        assert_eq!(tag[0], TAG_AUDIO);
        assert_eq!(tag[11], 0xAF);
        assert_eq!(tag[12], 1);
        assert_eq!(&tag[13..15], &[0xDE, 0xAD]);
    }

    #[test]
    fn sequence_headers_use_type_zero() {
        let v = packet(PacketType::Video, 0, true, &[0x01, 0x42]);
        assert_eq!(flv_packet_mux(&v, 0, true)[12], 0);
        let a = packet(PacketType::Audio, 0, false, &[0x12, 0x10]);
        assert_eq!(flv_packet_mux(&a, 0, true)[12], 0);
    }

    #[test]
    fn empty_packet_produces_no_tag() {
        let mut p = packet(PacketType::Video, 0, true, &[]);
        p.data = Arc::new(Vec::new());
        assert!(flv_packet_mux(&p, 0, false).is_empty());
    }
}

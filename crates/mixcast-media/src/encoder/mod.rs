// crates/mixcast-media/src/encoder/mod.rs
//
// The encoder variants and the video/audio pairing gate.
//
// Encoders are a closed set of tagged variants — the dispatch surface
// (create / encode / extradata / update_bitrate / frame_size) is fixed and
// the per-arm state lives inside the arm. A platform texture encoder would
// be one more arm whose gpu_encode_available() returns true; both shipped
// arms consume CPU frames.

pub mod aac;
pub mod h264;

use mixcast_core::frame::{ColorRange, ColorSpace, PixelFormat, SpeakerLayout};
use mixcast_core::packet::{EncoderPacket, PacketType};

pub use aac::AacEncoder;
pub use h264::H264Encoder;

#[derive(Debug, Clone)]
pub struct VideoEncoderSettings {
    pub width: u32,
    pub height: u32,
    pub fps_num: u32,
    pub fps_den: u32,
    pub bitrate_kbps: u32,
    pub format: PixelFormat,
    pub color_space: ColorSpace,
    pub color_range: ColorRange,
}

#[derive(Debug, Clone)]
pub struct AudioEncoderSettings {
    pub bitrate_kbps: u32,
    pub sample_rate: u32,
    pub layout: SpeakerLayout,
    /// Audio mix this encoder consumes.
    pub mixer_idx: usize,
}

/// One encoder of either type, for call sites that hold them uniformly.
pub enum Encoder {
    Video(H264Encoder),
    Audio(AacEncoder),
}

impl Encoder {
    pub fn ptype(&self) -> PacketType {
        match self {
            Encoder::Video(_) => PacketType::Video,
            Encoder::Audio(_) => PacketType::Audio,
        }
    }

    /// Codec configuration bytes, once known (SPS/PPS Annex-B for video,
    /// AudioSpecificConfig for audio). None until the codec reports them.
    pub fn extradata(&self) -> Option<&[u8]> {
        match self {
            Encoder::Video(v) => v.extradata(),
            Encoder::Audio(a) => a.extradata(),
        }
    }

    /// Whether this arm consumes GPU textures instead of CPU frames.
    pub fn gpu_encode_available(&self) -> bool {
        match self {
            Encoder::Video(v) => v.gpu_encode_available(),
            Encoder::Audio(_) => false,
        }
    }
}

// ── Pairing ───────────────────────────────────────────────────────────────────

/// Aligns a paired audio encoder's start to the video encoder's.
///
/// Until the first video packet's dts is known, audio packets are held.
/// Once known, held audio older than the video start is dropped and the
/// remainder released; from then on audio passes straight through.
pub struct PairGate {
    video_start_dts_usec: Option<i64>,
    held_audio: Vec<EncoderPacket>,
}

impl Default for PairGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PairGate {
    pub fn new() -> Self {
        Self {
            video_start_dts_usec: None,
            held_audio: Vec::new(),
        }
    }

    /// Feed one packet; returns the packets cleared for the interleaver,
    /// in order.
    pub fn submit(&mut self, packet: EncoderPacket) -> Vec<EncoderPacket> {
        match packet.ptype {
            PacketType::Video => {
                let mut out = Vec::with_capacity(1 + self.held_audio.len());
                let start = *self.video_start_dts_usec.get_or_insert(packet.dts_usec);
                out.push(packet);
                if !self.held_audio.is_empty() {
                    let held = std::mem::take(&mut self.held_audio);
                    out.extend(held.into_iter().filter(|a| a.dts_usec >= start));
                }
                out
            }
            PacketType::Audio => match self.video_start_dts_usec {
                Some(start) if packet.dts_usec >= start => vec![packet],
                Some(_) => Vec::new(),
                None => {
                    self.held_audio.push(packet);
                    Vec::new()
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkt(ptype: PacketType, dts_usec: i64) -> EncoderPacket {
        let mut p = EncoderPacket::new(ptype, vec![0]);
        p.dts_usec = dts_usec;
        p
    }

    #[test]
    fn audio_is_held_until_video_arrives() {
        let mut gate = PairGate::new();
        assert!(gate.submit(pkt(PacketType::Audio, 0)).is_empty());
        assert!(gate.submit(pkt(PacketType::Audio, 21_333)).is_empty());

        let out = gate.submit(pkt(PacketType::Video, 10_000));
        let types: Vec<_> = out.iter().map(|p| (p.ptype, p.dts_usec)).collect();
        // video first, then the audio at/after the video start; older dropped
        assert_eq!(
            types,
            vec![(PacketType::Video, 10_000), (PacketType::Audio, 21_333)]
        );
    }

    #[test]
    fn late_audio_older_than_start_is_dropped() {
        let mut gate = PairGate::new();
        gate.submit(pkt(PacketType::Video, 50_000));
        assert!(gate.submit(pkt(PacketType::Audio, 49_000)).is_empty());
        assert_eq!(gate.submit(pkt(PacketType::Audio, 50_000)).len(), 1);
    }

    #[test]
    fn video_always_passes() {
        let mut gate = PairGate::new();
        assert_eq!(gate.submit(pkt(PacketType::Video, 0)).len(), 1);
        assert_eq!(gate.submit(pkt(PacketType::Video, 33_333)).len(), 1);
    }
}

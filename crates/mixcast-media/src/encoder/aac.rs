// crates/mixcast-media/src/encoder/aac.rs
//
// AAC encoding of mixer ticks.
//
// AAC wants exactly frame_size() samples (1024) per input frame and the
// mixer delivers exactly that, but the sizes are negotiated independently,
// so the tick still drains through a per-channel FIFO and full frames are
// popped off the front. pts is a monotone sample counter in 1/sample_rate.

use ffmpeg_the_third as ffmpeg;
use ffmpeg::codec::{self, Id as CodecId};
use ffmpeg::encoder;
use ffmpeg::format::sample::Type as SampleType;
use ffmpeg::format::Sample;
use ffmpeg::util::channel_layout::{ChannelLayout, ChannelLayoutMask};
use ffmpeg::util::frame::audio::Audio as FfAudioFrame;
use ffmpeg::Packet;

use mixcast_core::clock::now_usec;
use mixcast_core::frame::SpeakerLayout;
use mixcast_core::packet::{EncoderPacket, PacketType};
use mixcast_core::{log_info, CircularBuffer, MixError};

use crate::mixer::AudioTick;

use super::AudioEncoderSettings;

pub struct AacEncoder {
    enc: ffmpeg::encoder::Audio,
    settings: AudioEncoderSettings,
    extradata: Vec<u8>,
    /// Samples per encoded block, typically 1024.
    frame_size: usize,
    /// Per-channel f32 FIFOs feeding fixed-size frames.
    fifo: Vec<CircularBuffer>,
    /// pts of the next output frame, in samples.
    sample_idx: i64,
    first_packet_pending: bool,
}

impl AacEncoder {
    pub fn create(settings: AudioEncoderSettings) -> Result<Self, MixError> {
        if settings.sample_rate == 0 || settings.bitrate_kbps == 0 {
            return Err(MixError::BadConfig(
                "aac encoder needs nonzero sample rate and bitrate".into(),
            ));
        }

        let aac = encoder::find(CodecId::AAC)
            .ok_or_else(|| MixError::BadConfig("AAC encoder not found".into()))?;

        let enc_ctx = codec::context::Context::new_with_codec(aac);
        let mut enc = enc_ctx
            .encoder()
            .audio()
            .map_err(|e| MixError::EncodeError(format!("create audio encoder context: {e}")))?;

        enc.set_rate(settings.sample_rate as i32);
        enc.set_ch_layout(match settings.layout {
            SpeakerLayout::Mono => ChannelLayout::MONO,
            SpeakerLayout::Stereo => ChannelLayout::STEREO,
        });
        enc.set_format(Sample::F32(SampleType::Planar));
        enc.set_bit_rate(settings.bitrate_kbps as usize * 1000);
        enc.set_flags(codec::Flags::GLOBAL_HEADER);

        let enc = enc
            .open_as_with(aac, ffmpeg::Dictionary::new())
            .map_err(|e| MixError::EncodeError(format!("open AAC encoder: {e}")))?;

        let frame_size = (enc.frame_size() as usize).max(1024);

        // AudioSpecificConfig, present thanks to GLOBAL_HEADER.
        let extradata = unsafe {
            let ctx = enc.as_ptr() as *const ffmpeg::ffi::AVCodecContext;
            let ptr = (*ctx).extradata;
            let size = (*ctx).extradata_size;
            if ptr.is_null() || size <= 0 {
                Vec::new()
            } else {
                std::slice::from_raw_parts(ptr, size as usize).to_vec()
            }
        };

        let channels = settings.layout.channels();
        // a second of float samples per channel
        let fifo_cap = settings.sample_rate as usize * 4;

        log_info!(
            "aac encoder up: {} Hz, {} ch, {} kbps, frame {}",
            settings.sample_rate,
            channels,
            settings.bitrate_kbps,
            frame_size
        );

        Ok(Self {
            enc,
            settings,
            extradata,
            frame_size,
            fifo: (0..channels).map(|_| CircularBuffer::new(fifo_cap)).collect(),
            sample_idx: 0,
            first_packet_pending: true,
        })
    }

    pub fn settings(&self) -> &AudioEncoderSettings {
        &self.settings
    }

    pub fn bitrate_kbps(&self) -> u32 {
        self.settings.bitrate_kbps
    }

    pub fn extradata(&self) -> Option<&[u8]> {
        (!self.extradata.is_empty()).then_some(self.extradata.as_slice())
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Encode one mixer tick; returns zero or more packets.
    pub fn encode_tick(&mut self, tick: &AudioTick) -> Result<Vec<EncoderPacket>, MixError> {
        if tick.planes.is_empty() {
            return Ok(Vec::new());
        }
        for (chan, fifo) in self.fifo.iter_mut().enumerate() {
            // mono tick into a stereo encoder duplicates channel 0
            let plane = tick.planes.get(chan).unwrap_or(&tick.planes[0]);
            fifo.push(f32_bytes(plane));
        }
        self.drain_fifo(false)
    }

    /// Flush: zero-pad the FIFO tail into a final frame, then drain the
    /// codec.
    pub fn finish(&mut self) -> Result<Vec<EncoderPacket>, MixError> {
        let mut out = self.drain_fifo(true)?;
        self.enc
            .send_eof()
            .map_err(|e| MixError::EncodeError(format!("send EOF to aac: {e}")))?;
        out.extend(self.receive_packets()?);
        Ok(out)
    }

    fn drain_fifo(&mut self, flush: bool) -> Result<Vec<EncoderPacket>, MixError> {
        let mut out = Vec::new();
        let frame_bytes = self.frame_size * 4;

        while self.fifo[0].len() >= frame_bytes || (flush && !self.fifo[0].is_empty()) {
            let mut frame = FfAudioFrame::new(
                Sample::F32(SampleType::Planar),
                self.frame_size,
                match self.settings.layout {
                    SpeakerLayout::Mono => ChannelLayoutMask::MONO,
                    SpeakerLayout::Stereo => ChannelLayoutMask::STEREO,
                },
            );
            frame.set_rate(self.settings.sample_rate);
            frame.set_pts(Some(self.sample_idx));

            for (chan, fifo) in self.fifo.iter_mut().enumerate() {
                let data = frame.data_mut(chan);
                let got = fifo.pop(&mut data[..frame_bytes]);
                if got < frame_bytes {
                    data[got..frame_bytes].fill(0);
                }
            }
            self.sample_idx += self.frame_size as i64;

            self.enc
                .send_frame(&frame)
                .map_err(|e| MixError::EncodeError(format!("send frame to aac: {e}")))?;
            out.extend(self.receive_packets()?);
        }
        Ok(out)
    }

    fn receive_packets(&mut self) -> Result<Vec<EncoderPacket>, MixError> {
        let mut out = Vec::new();
        let mut pkt = Packet::empty();
        while self.enc.receive_packet(&mut pkt).is_ok() {
            let data = pkt.data().unwrap_or_default();
            if data.is_empty() {
                continue;
            }
            let mut packet = EncoderPacket::new(PacketType::Audio, data.to_vec());
            packet.pts = pkt.pts().unwrap_or(self.sample_idx);
            packet.dts = pkt.dts().unwrap_or(packet.pts);
            packet.timebase_num = 1;
            packet.timebase_den = self.settings.sample_rate;
            packet.track_idx = self.settings.mixer_idx;
            packet.refresh_dts_usec();
            packet.sys_dts_usec = now_usec();
            packet.encoder_first_packet = self.first_packet_pending;
            self.first_packet_pending = false;
            out.push(packet);
        }
        Ok(out)
    }
}

/// f32 slice → bytes without copying. The FIFO stores raw sample bytes.
fn f32_bytes(plane: &[f32]) -> &[u8] {
    unsafe { std::slice::from_raw_parts(plane.as_ptr() as *const u8, plane.len() * 4) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zeroed_config() {
        let settings = AudioEncoderSettings {
            bitrate_kbps: 0,
            sample_rate: 48_000,
            layout: SpeakerLayout::Stereo,
            mixer_idx: 0,
        };
        assert!(matches!(
            AacEncoder::create(settings),
            Err(MixError::BadConfig(_))
        ));
    }

    #[test]
    fn f32_bytes_view_is_exact() {
        let samples = [1.0f32, -0.5];
        let bytes = f32_bytes(&samples);
        assert_eq!(bytes.len(), 8);
        assert_eq!(&bytes[0..4], &1.0f32.to_ne_bytes());
    }
}

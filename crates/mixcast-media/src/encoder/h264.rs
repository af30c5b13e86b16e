// crates/mixcast-media/src/encoder/h264.rs
//
// Software H.264 encoding through libx264 (via ffmpeg-the-third).
//
// The encoder is opened with GLOBAL_HEADER so SPS/PPS land in extradata
// (Annex-B) instead of repeating in-band; packets leave here still in
// Annex-B framing — the RTMP backend repackages to AVCC, the mpegts and
// file muxers take Annex-B as-is.
//
// tune=zerolatency keeps x264 from reordering (no B-frames), so pts == dts
// and the FLV composition-time offset stays zero. Bitrate re-arm has no
// native path in libx264: update_bitrate() tears the codec context down
// and reopens it at the same frame counter, and the fresh context's first
// packet is an IDR, which is exactly what a mid-stream bitrate change
// needs anyway.

use ffmpeg_the_third as ffmpeg;
use ffmpeg::codec::{self, Id as CodecId};
use ffmpeg::encoder;
use ffmpeg::format::Pixel;
use ffmpeg::util::frame::video::Video as FfVideoFrame;
use ffmpeg::util::rational::Rational;
use ffmpeg::Packet;

use mixcast_core::clock::now_usec;
use mixcast_core::frame::{PixelFormat, VideoFrame};
use mixcast_core::packet::{nal_priority, EncoderPacket, PacketType};
use mixcast_core::{log_info, MixError};

use crate::avc;
use crate::helpers::yuv;

use super::VideoEncoderSettings;

pub struct H264Encoder {
    enc: ffmpeg::encoder::video::Video,
    settings: VideoEncoderSettings,
    extradata: Vec<u8>,
    sei: Option<Vec<u8>>,
    sei_rate: u32,
    /// Output pts of the next frame, in 1/fps ticks. Survives re-arm.
    frame_idx: i64,
    encodes: u64,
    first_packet_pending: bool,
}

fn ff_pixel(format: PixelFormat) -> Result<Pixel, MixError> {
    match format {
        PixelFormat::I420 => Ok(Pixel::YUV420P),
        PixelFormat::Nv12 => Ok(Pixel::NV12),
        PixelFormat::I444 => Ok(Pixel::YUV444P),
        other => Err(MixError::BadConfig(format!(
            "h264 encoder cannot take {other:?} input"
        ))),
    }
}

fn open_encoder(
    settings: &VideoEncoderSettings,
) -> Result<(ffmpeg::encoder::video::Video, Vec<u8>), MixError> {
    if settings.width == 0 || settings.height == 0 || settings.bitrate_kbps == 0 {
        return Err(MixError::BadConfig(
            "h264 encoder needs nonzero dimensions and bitrate".into(),
        ));
    }

    let h264 = encoder::find(CodecId::H264)
        .ok_or_else(|| MixError::BadConfig("H.264 encoder not found — is libx264 available?".into()))?;

    let enc_ctx = codec::context::Context::new_with_codec(h264);
    let mut enc = enc_ctx
        .encoder()
        .video()
        .map_err(|e| MixError::EncodeError(format!("create video encoder context: {e}")))?;

    let time_base = Rational::new(settings.fps_den as i32, settings.fps_num as i32);
    let bit_rate = settings.bitrate_kbps as usize * 1000;

    enc.set_width(settings.width);
    enc.set_height(settings.height);
    enc.set_format(ff_pixel(settings.format)?);
    enc.set_time_base(time_base);
    enc.set_frame_rate(Some(Rational::new(
        settings.fps_num as i32,
        settings.fps_den as i32,
    )));
    enc.set_bit_rate(bit_rate);
    enc.set_max_bit_rate(bit_rate);
    // one keyframe every two seconds
    enc.set_gop(settings.fps_num * 2 / settings.fps_den.max(1));
    enc.set_max_b_frames(0);
    enc.set_flags(codec::Flags::GLOBAL_HEADER);

    let mut opts = ffmpeg::Dictionary::new();
    opts.set("preset", "veryfast");
    opts.set("tune", "zerolatency");

    let enc = enc
        .open_as_with(h264, opts)
        .map_err(|e| MixError::EncodeError(format!("open H.264 encoder: {e}")))?;

    // GLOBAL_HEADER puts Annex-B SPS/PPS into the opened context's
    // extradata. No safe accessor exists; read the AVCodecContext field.
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

    Ok((enc, extradata))
}

impl H264Encoder {
    pub fn create(settings: VideoEncoderSettings) -> Result<Self, MixError> {
        let (enc, extradata) = open_encoder(&settings)?;
        log_info!(
            "h264 encoder up: {}x{} @ {}/{} fps, {} kbps",
            settings.width,
            settings.height,
            settings.fps_num,
            settings.fps_den,
            settings.bitrate_kbps
        );
        Ok(Self {
            enc,
            settings,
            extradata,
            sei: None,
            sei_rate: 0,
            frame_idx: 0,
            encodes: 0,
            first_packet_pending: true,
        })
    }

    pub fn settings(&self) -> &VideoEncoderSettings {
        &self.settings
    }

    pub fn bitrate_kbps(&self) -> u32 {
        self.settings.bitrate_kbps
    }

    /// Annex-B SPS/PPS.
    pub fn extradata(&self) -> Option<&[u8]> {
        (!self.extradata.is_empty()).then_some(self.extradata.as_slice())
    }

    pub fn sei_data(&self) -> Option<&[u8]> {
        self.sei.as_deref()
    }

    /// Install an SEI NAL (Annex-B framed) to prepend to every `rate`-th
    /// encoded packet.
    pub fn set_sei(&mut self, sei: Vec<u8>, rate: u32) {
        self.sei = Some(sei);
        self.sei_rate = rate.max(1);
    }

    pub fn gpu_encode_available(&self) -> bool {
        false
    }

    /// Re-arm the encoder at a new target bitrate. The next packet out is
    /// an IDR from the fresh codec context; pts continues uninterrupted.
    pub fn update_bitrate(&mut self, kbps: u32) -> Result<(), MixError> {
        if kbps == 0 || kbps == self.settings.bitrate_kbps {
            return Ok(());
        }
        let mut settings = self.settings.clone();
        settings.bitrate_kbps = kbps;
        let (enc, extradata) = open_encoder(&settings)?;
        log_info!(
            "h264 bitrate re-armed: {} -> {} kbps",
            self.settings.bitrate_kbps,
            kbps
        );
        self.enc = enc;
        // headers are frozen once streaming began; keep the original
        // extradata unless none was captured yet
        if self.extradata.is_empty() {
            self.extradata = extradata;
        }
        self.settings = settings;
        Ok(())
    }

    /// Encode one raw frame; returns zero or more packets in encode order.
    pub fn encode(&mut self, frame: &VideoFrame) -> Result<Vec<EncoderPacket>, MixError> {
        if frame.format != self.settings.format
            || frame.width != self.settings.width
            || frame.height != self.settings.height
        {
            return Err(MixError::EncodeError(format!(
                "frame {}x{} {:?} does not match encoder {}x{} {:?}",
                frame.width,
                frame.height,
                frame.format,
                self.settings.width,
                self.settings.height,
                self.settings.format
            )));
        }

        let mut ff_frame = FfVideoFrame::new(
            ff_pixel(self.settings.format)?,
            self.settings.width,
            self.settings.height,
        );
        yuv::copy_into_ff_frame(frame, &mut ff_frame);
        ff_frame.set_pts(Some(self.frame_idx));
        self.frame_idx += 1;
        self.encodes += 1;

        self.enc
            .send_frame(&ff_frame)
            .map_err(|e| MixError::EncodeError(format!("send frame to x264: {e}")))?;

        self.drain_packets()
    }

    fn drain_packets(&mut self) -> Result<Vec<EncoderPacket>, MixError> {
        let mut out = Vec::new();
        let mut pkt = Packet::empty();
        while self.enc.receive_packet(&mut pkt).is_ok() {
            let data = pkt.data().unwrap_or_default();
            if data.is_empty() {
                continue;
            }

            let mut payload = Vec::with_capacity(data.len());
            if let Some(sei) = self.sei.as_deref() {
                if self.sei_rate > 0 && self.encodes % self.sei_rate as u64 == 0 {
                    payload.extend_from_slice(sei);
                }
            }
            payload.extend_from_slice(data);

            let keyframe = avc::is_keyframe(&payload);
            let priority = slice_priority(&payload).unwrap_or(if keyframe {
                nal_priority::HIGHEST
            } else {
                nal_priority::HIGH
            });

            let mut packet = EncoderPacket::new(PacketType::Video, payload);
            packet.pts = pkt.pts().unwrap_or(self.frame_idx - 1);
            packet.dts = pkt.dts().unwrap_or(packet.pts);
            packet.timebase_num = self.settings.fps_den;
            packet.timebase_den = self.settings.fps_num;
            packet.keyframe = keyframe;
            packet.priority = priority;
            packet.drop_priority = priority;
            packet.refresh_dts_usec();
            packet.sys_dts_usec = now_usec();
            packet.encoder_first_packet = self.first_packet_pending;
            self.first_packet_pending = false;
            out.push(packet);
        }
        Ok(out)
    }

    /// Flush any frames the codec is still holding.
    pub fn finish(&mut self) -> Result<Vec<EncoderPacket>, MixError> {
        self.enc
            .send_eof()
            .map_err(|e| MixError::EncodeError(format!("send EOF to x264: {e}")))?;
        self.drain_packets()
    }
}

/// nal_ref_idc of the first slice NAL, if any.
fn slice_priority(data: &[u8]) -> Option<i32> {
    for (_, nal) in avc::nal_units(data) {
        let ty = nal[0] & 0x1F;
        if ty == avc::NAL_SLICE || ty == avc::NAL_SLICE_IDR {
            return Some((nal[0] >> 5) as i32);
        }
    }
    None
}

// The encoder itself needs libx264 at runtime, so coverage for this file
// lives in the Annex-B helpers it leans on (avc.rs) and in the pipeline
// tests of the output crate.
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zeroed_config() {
        let settings = VideoEncoderSettings {
            width: 0,
            height: 720,
            fps_num: 30,
            fps_den: 1,
            bitrate_kbps: 4000,
            format: PixelFormat::I420,
            color_space: Default::default(),
            color_range: Default::default(),
        };
        assert!(matches!(
            H264Encoder::create(settings),
            Err(MixError::BadConfig(_))
        ));
    }

    #[test]
    fn slice_priority_reads_ref_idc() {
        let data = [0u8, 0, 0, 1, 0x65, 0xAA];
        assert_eq!(slice_priority(&data), Some(3));
        let non_vcl = [0u8, 0, 0, 1, 0x67, 0x42];
        assert_eq!(slice_priority(&non_vcl), None);
    }
}

// crates/mixcast-media/src/resample.rs
//
// PCM conversion between arbitrary (rate, format, layout) triples and the
// mixer's canonical format, with residual-delay accounting so source
// timestamps stay aligned after conversion.
//
// Identical src/dst is a true passthrough — no SwrContext is created and
// the samples are copied through unchanged.

use anyhow::{anyhow, Result};

use ffmpeg_the_third as ffmpeg;
use ffmpeg::format::sample::Type as SampleType;
use ffmpeg::format::Sample;
use ffmpeg::software::resampling;
use ffmpeg::util::channel_layout::{ChannelLayout, ChannelLayoutMask};
use ffmpeg::util::frame::audio::Audio as FfAudioFrame;

use mixcast_core::frame::{AudioFormat, SpeakerLayout};

/// One side of a resampler: everything that identifies a PCM stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioInfo {
    pub format: AudioFormat,
    pub layout: SpeakerLayout,
    pub sample_rate: u32,
}

impl AudioInfo {
    fn ff_sample(&self) -> Sample {
        match self.format {
            AudioFormat::F32Planar => Sample::F32(SampleType::Planar),
            AudioFormat::F32 => Sample::F32(SampleType::Packed),
            AudioFormat::S16Planar => Sample::I16(SampleType::Planar),
            AudioFormat::S16 => Sample::I16(SampleType::Packed),
        }
    }

    fn ff_layout_mask(&self) -> ChannelLayoutMask {
        match self.layout {
            SpeakerLayout::Mono => ChannelLayoutMask::MONO,
            SpeakerLayout::Stereo => ChannelLayoutMask::STEREO,
        }
    }

    /// Planes a frame of this format carries.
    pub fn plane_count(&self) -> usize {
        if self.format.is_planar() {
            self.layout.channels()
        } else {
            1
        }
    }

    /// Bytes per plane for `frames` samples.
    pub fn plane_bytes(&self, frames: usize) -> usize {
        let per_sample = self.format.bytes_per_sample();
        if self.format.is_planar() {
            frames * per_sample
        } else {
            frames * per_sample * self.layout.channels()
        }
    }
}

/// Converted PCM plus the conversion latency attributable to it.
pub struct Resampled {
    pub planes: Vec<Vec<u8>>,
    pub frames: usize,
    /// Residual delay the SwrContext is still holding, in nanoseconds of
    /// the destination clock. Subtract from the source timestamp.
    pub delay_ns: u64,
}

pub struct AudioResampler {
    src: AudioInfo,
    dst: AudioInfo,
    ctx: Option<resampling::Context>,
}

impl AudioResampler {
    pub fn new(src: AudioInfo, dst: AudioInfo) -> Result<Self> {
        let ctx = if src == dst {
            None
        } else {
            let src_layout = match src.layout {
                SpeakerLayout::Mono => ChannelLayout::MONO,
                SpeakerLayout::Stereo => ChannelLayout::STEREO,
            };
            let dst_layout = match dst.layout {
                SpeakerLayout::Mono => ChannelLayout::MONO,
                SpeakerLayout::Stereo => ChannelLayout::STEREO,
            };
            Some(
                resampling::Context::get2(
                    src.ff_sample(),
                    src_layout,
                    src.sample_rate,
                    dst.ff_sample(),
                    dst_layout,
                    dst.sample_rate,
                )
                .map_err(|e| anyhow!("create swresample context: {e}"))?,
            )
        };
        Ok(Self { src, dst, ctx })
    }

    pub fn src(&self) -> &AudioInfo {
        &self.src
    }

    pub fn dst(&self) -> &AudioInfo {
        &self.dst
    }

    pub fn passthrough(&self) -> bool {
        self.ctx.is_none()
    }

    /// Convert `frames` samples held in `planes` (one slice per source
    /// plane) into the destination format.
    pub fn resample(&mut self, planes: &[&[u8]], frames: usize) -> Result<Resampled> {
        if frames == 0 {
            return Ok(Resampled {
                planes: vec![Vec::new(); self.dst.plane_count()],
                frames: 0,
                delay_ns: 0,
            });
        }

        let ctx = match self.ctx.as_mut() {
            None => {
                // byte-identical passthrough
                let expected = self.src.plane_bytes(frames);
                let out = planes
                    .iter()
                    .map(|p| p[..expected.min(p.len())].to_vec())
                    .collect();
                return Ok(Resampled {
                    planes: out,
                    frames,
                    delay_ns: 0,
                });
            }
            Some(ctx) => ctx,
        };

        let mut input = FfAudioFrame::new(self.src.ff_sample(), frames, self.src.ff_layout_mask());
        input.set_rate(self.src.sample_rate);
        let in_bytes = self.src.plane_bytes(frames);
        for (idx, plane) in planes.iter().enumerate().take(self.src.plane_count()) {
            let n = in_bytes.min(plane.len());
            input.data_mut(idx)[..n].copy_from_slice(&plane[..n]);
        }

        let mut output = FfAudioFrame::empty();
        ctx.run(&input, &mut output)
            .map_err(|e| anyhow!("swresample run: {e}"))?;

        let out_frames = output.samples();
        let out_bytes = self.dst.plane_bytes(out_frames);
        let mut out_planes = Vec::with_capacity(self.dst.plane_count());
        for idx in 0..self.dst.plane_count() {
            out_planes.push(output.data(idx)[..out_bytes].to_vec());
        }

        let delay_ns = ctx
            .delay()
            .map(|d| d.milliseconds.max(0) as u64 * 1_000_000)
            .unwrap_or(0);

        Ok(Resampled {
            planes: out_planes,
            frames: out_frames,
            delay_ns,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_stereo(rate: u32) -> AudioInfo {
        AudioInfo {
            format: AudioFormat::F32Planar,
            layout: SpeakerLayout::Stereo,
            sample_rate: rate,
        }
    }

    #[test]
    fn identical_info_is_passthrough() {
        let mut rs = AudioResampler::new(f32_stereo(48_000), f32_stereo(48_000)).unwrap();
        assert!(rs.passthrough());

        let left: Vec<u8> = (0..64u32).flat_map(|i| (i as f32).to_ne_bytes()).collect();
        let right = left.clone();
        let out = rs.resample(&[&left, &right], 64).unwrap();
        assert_eq!(out.frames, 64);
        assert_eq!(out.delay_ns, 0);
        assert_eq!(out.planes[0], left);
        assert_eq!(out.planes[1], right);
    }

    #[test]
    fn plane_accounting() {
        let planar = f32_stereo(48_000);
        assert_eq!(planar.plane_count(), 2);
        assert_eq!(planar.plane_bytes(1024), 4096);

        let interleaved = AudioInfo {
            format: AudioFormat::S16,
            layout: SpeakerLayout::Stereo,
            sample_rate: 44_100,
        };
        assert_eq!(interleaved.plane_count(), 1);
        assert_eq!(interleaved.plane_bytes(1024), 4096);
    }
}

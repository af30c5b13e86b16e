// crates/mixcast-media/src/audio_source.rs
//
// PCM ingest for one source: resample to the mixer's canonical format,
// align the stream to the global clock, buffer per mix until the mixer
// tick consumes it.
//
// Timestamp repair happens here, not in the mixer: a source whose incoming
// timestamp drifts more than TS_SLACK_NS from where its buffered samples
// say it should be is cleared and re-seeded at the new timestamp. The
// mixer then only has to bridge small gaps with silence.

use std::sync::Arc;

use parking_lot::Mutex;

use mixcast_core::frame::{AudioFormat, SpeakerLayout, MAX_AUDIO_MIXES};
use mixcast_core::log_debug;
use mixcast_core::CircularBuffer;

use crate::resample::{AudioInfo, AudioResampler};

/// Allowed drift between a frame's timestamp and the buffered stream's
/// expected continuation before the source is re-seeded.
pub const TS_SLACK_NS: u64 = 70_000_000;

/// Buffered audio per source: 1 s per channel at the canonical rate.
const BUFFER_SECONDS: usize = 1;

pub(crate) struct AudioSourceState {
    dst: AudioInfo,
    resampler: Option<AudioResampler>,
    /// [mix][channel] sample FIFOs, f32 bytes.
    bufs: Vec<Vec<CircularBuffer>>,
    /// Which mixes this source feeds (bit per mix).
    pub mixes: u32,
    /// Timestamp of the front buffered sample; valid when `have_data`.
    pub start_ts: u64,
    pub have_data: bool,
}

impl AudioSourceState {
    fn new(dst: AudioInfo) -> Self {
        let cap = dst.sample_rate as usize * BUFFER_SECONDS * 4;
        let bufs = (0..MAX_AUDIO_MIXES)
            .map(|_| (0..dst.layout.channels()).map(|_| CircularBuffer::new(cap)).collect())
            .collect();
        Self {
            dst,
            resampler: None,
            bufs,
            mixes: 1,
            start_ts: 0,
            have_data: false,
        }
    }

    /// Samples currently buffered (mix 0 is authoritative — all routed
    /// mixes receive identical pushes).
    pub fn buffered_frames(&self) -> usize {
        self.bufs[0][0].len() / 4
    }

    pub fn expected_ts(&self) -> u64 {
        self.start_ts
            + self.buffered_frames() as u64 * 1_000_000_000 / self.dst.sample_rate as u64
    }

    fn reset_to(&mut self, ts: u64) {
        for mix in &mut self.bufs {
            for chan in mix {
                chan.clear();
            }
        }
        self.start_ts = ts;
        self.have_data = true;
    }

    fn push_planes(&mut self, planes: &[Vec<u8>]) {
        for mix_idx in 0..MAX_AUDIO_MIXES {
            if self.mixes & (1 << mix_idx) == 0 {
                continue;
            }
            for (chan, plane) in planes.iter().enumerate().take(self.dst.layout.channels()) {
                self.bufs[mix_idx][chan].push(plane);
            }
        }
    }

    /// Pop up to `frames` samples for `mix_idx` into `out` (one f32 slice
    /// per channel), mixing by addition starting at `offset` samples.
    /// Returns how many were consumed.
    pub fn mix_into(&mut self, mix_idx: usize, out: &mut [Vec<f32>], offset: usize, frames: usize) -> usize {
        if self.mixes & (1 << mix_idx) == 0 || !self.have_data {
            return 0;
        }
        let avail = self.bufs[mix_idx][0].len() / 4;
        let take = frames.min(avail);
        if take == 0 {
            return 0;
        }
        let mut scratch = vec![0u8; take * 4];
        for (chan, out_plane) in out.iter_mut().enumerate().take(self.dst.layout.channels()) {
            let got = self.bufs[mix_idx][chan].pop(&mut scratch);
            for (i, bytes) in scratch[..got].chunks_exact(4).enumerate() {
                out_plane[offset + i] += f32::from_ne_bytes(bytes.try_into().unwrap());
            }
        }
        self.start_ts += take as u64 * 1_000_000_000 / self.dst.sample_rate as u64;
        take
    }

    /// Drop `frames` samples from the front of every routed mix.
    pub fn discard_frames(&mut self, frames: usize) {
        let n = frames.min(self.buffered_frames());
        for mix_idx in 0..MAX_AUDIO_MIXES {
            for chan in &mut self.bufs[mix_idx] {
                chan.discard(n * 4);
            }
        }
        self.start_ts += n as u64 * 1_000_000_000 / self.dst.sample_rate as u64;
    }
}

/// Handle through which an embedder feeds PCM. Clone-cheap; the mixer
/// holds the same state and drains it on its tick cadence.
#[derive(Clone)]
pub struct AudioSource {
    pub(crate) state: Arc<Mutex<AudioSourceState>>,
}

impl AudioSource {
    pub(crate) fn new(dst: AudioInfo) -> Self {
        Self {
            state: Arc::new(Mutex::new(AudioSourceState::new(dst))),
        }
    }

    /// Route this source to a different mix bitmask (bit 0 = mix 0).
    pub fn set_mixes(&self, mask: u32) {
        self.state.lock().mixes = mask;
    }

    /// Ingest one chunk of PCM stamped `timestamp_ns` on the global clock.
    ///
    /// `planes` carries one slice per channel for planar formats, a single
    /// interleaved slice otherwise.
    pub fn output_audio(
        &self,
        planes: &[&[u8]],
        frames: usize,
        format: AudioFormat,
        layout: SpeakerLayout,
        sample_rate: u32,
        timestamp_ns: u64,
    ) {
        if frames == 0 || planes.is_empty() {
            return;
        }
        let src = AudioInfo {
            format,
            layout,
            sample_rate,
        };

        let mut state = self.state.lock();

        // (re)build the resampler when the source format changes
        let needs_new = match &state.resampler {
            Some(rs) => *rs.src() != src,
            None => true,
        };
        if needs_new {
            match AudioResampler::new(src, state.dst) {
                Ok(rs) => state.resampler = Some(rs),
                Err(e) => {
                    log_debug!("audio source resampler rebuild failed: {e}");
                    return;
                }
            }
        }

        let resampled = {
            let rs = state.resampler.as_mut().unwrap();
            match rs.resample(planes, frames) {
                Ok(r) => r,
                Err(e) => {
                    log_debug!("audio resample failed: {e}");
                    return;
                }
            }
        };
        if resampled.frames == 0 {
            return;
        }

        let ts = timestamp_ns.saturating_sub(resampled.delay_ns);

        if state.have_data {
            let expected = state.expected_ts();
            let drift = expected.abs_diff(ts);
            if drift > TS_SLACK_NS {
                log_debug!("audio source drifted {} ms, re-seeding", drift / 1_000_000);
                state.reset_to(ts);
            }
        } else {
            state.reset_to(ts);
        }

        state.push_planes(&resampled.planes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canonical() -> AudioInfo {
        AudioInfo {
            format: AudioFormat::F32Planar,
            layout: SpeakerLayout::Stereo,
            sample_rate: 48_000,
        }
    }

    fn samples(n: usize, value: f32) -> Vec<u8> {
        std::iter::repeat(value)
            .take(n)
            .flat_map(f32::to_ne_bytes)
            .collect()
    }

    #[test]
    fn continuous_pushes_accumulate() {
        let src = AudioSource::new(canonical());
        let plane = samples(480, 0.5);
        src.output_audio(
            &[&plane, &plane],
            480,
            AudioFormat::F32Planar,
            SpeakerLayout::Stereo,
            48_000,
            1_000_000,
        );
        // exactly contiguous: 480 samples = 10 ms
        src.output_audio(
            &[&plane, &plane],
            480,
            AudioFormat::F32Planar,
            SpeakerLayout::Stereo,
            48_000,
            11_000_000,
        );
        let state = src.state.lock();
        assert_eq!(state.buffered_frames(), 960);
        assert_eq!(state.start_ts, 1_000_000);
    }

    #[test]
    fn large_drift_reseeds() {
        let src = AudioSource::new(canonical());
        let plane = samples(480, 0.1);
        src.output_audio(
            &[&plane, &plane],
            480,
            AudioFormat::F32Planar,
            SpeakerLayout::Stereo,
            48_000,
            0,
        );
        // jump 500 ms forward — well past the slack bound
        src.output_audio(
            &[&plane, &plane],
            480,
            AudioFormat::F32Planar,
            SpeakerLayout::Stereo,
            48_000,
            500_000_000,
        );
        let state = src.state.lock();
        assert_eq!(state.buffered_frames(), 480);
        assert_eq!(state.start_ts, 500_000_000);
    }

    #[test]
    fn mix_into_adds_and_advances() {
        let src = AudioSource::new(canonical());
        let plane = samples(100, 0.25);
        src.output_audio(
            &[&plane, &plane],
            100,
            AudioFormat::F32Planar,
            SpeakerLayout::Stereo,
            48_000,
            0,
        );
        let mut out = vec![vec![0.25f32; 100], vec![0.25f32; 100]];
        let mut state = src.state.lock();
        let took = state.mix_into(0, &mut out, 0, 100);
        assert_eq!(took, 100);
        assert!((out[0][0] - 0.5).abs() < 1e-6);
        assert_eq!(state.buffered_frames(), 0);
    }
}

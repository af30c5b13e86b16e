// crates/mixcast-media/src/mixer.rs
//
// The audio output mixer: a wall-clock-paced thread that pulls fixed
// 1024-sample ticks out of every source's per-mix buffers, sums them, and
// fans the result out to subscribers (encoders, raw listeners).
//
// Tick timestamps come from a monotone sample counter, never from the
// wall clock directly: ts(k) = start_ns + k * 1024 * 1e9 / rate. The wall
// clock only decides *when* a tick is produced, so a slow scheduler can
// never bend the audio timeline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

use mixcast_core::clock::{now_ns, sleep_to_ns};
use mixcast_core::frame::{AudioFormat, SpeakerLayout, AUDIO_OUTPUT_FRAMES, MAX_AUDIO_MIXES};
use mixcast_core::log_info;

use crate::audio_source::{AudioSource, AudioSourceState};
use crate::resample::AudioInfo;

/// One mixed tick: f32 planar, AUDIO_OUTPUT_FRAMES samples per channel.
pub struct AudioTick {
    pub timestamp_ns: u64,
    pub mix_idx: usize,
    pub planes: Vec<Vec<f32>>,
    pub frames: usize,
}

struct MixSubscriber {
    mix_idx: usize,
    tx: Sender<Arc<AudioTick>>,
}

struct MixerShared {
    sample_rate: u32,
    layout: SpeakerLayout,
    sources: Mutex<Vec<Arc<Mutex<AudioSourceState>>>>,
    subscribers: Mutex<Vec<MixSubscriber>>,
    shutdown: AtomicBool,
}

/// Owns the mixer thread. Dropping stops it.
pub struct AudioMixer {
    shared: Arc<MixerShared>,
    thread: Option<JoinHandle<()>>,
}

impl AudioMixer {
    pub fn new(sample_rate: u32, layout: SpeakerLayout) -> Self {
        let shared = Arc::new(MixerShared {
            sample_rate,
            layout,
            sources: Mutex::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
        });

        let thread_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("mixcast-audio".into())
            .spawn(move || mixer_thread(thread_shared))
            .expect("spawn audio mixer thread");

        log_info!("audio mixer up: {sample_rate} Hz, {} ch", layout.channels());
        Self {
            shared,
            thread: Some(thread),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.shared.sample_rate
    }

    pub fn channels(&self) -> usize {
        self.shared.layout.channels()
    }

    pub fn canonical_info(&self) -> AudioInfo {
        AudioInfo {
            format: AudioFormat::F32Planar,
            layout: self.shared.layout,
            sample_rate: self.shared.sample_rate,
        }
    }

    /// Create a source feeding this mixer (routed to mix 0 by default).
    pub fn create_source(&self) -> AudioSource {
        let source = AudioSource::new(self.canonical_info());
        self.shared.sources.lock().push(Arc::clone(&source.state));
        source
    }

    /// Subscribe to mixed ticks of `mix_idx`. The channel is bounded; a
    /// subscriber that stops draining loses ticks, never blocks the mixer.
    pub fn subscribe(&self, mix_idx: usize) -> Receiver<Arc<AudioTick>> {
        // ~0.5 s of headroom at 48 kHz
        let (tx, rx) = bounded(24);
        self.shared
            .subscribers
            .lock()
            .push(MixSubscriber { mix_idx, tx });
        rx
    }
}

impl Drop for AudioMixer {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

fn mixer_thread(shared: Arc<MixerShared>) {
    let rate = shared.sample_rate as u64;
    let channels = shared.layout.channels();
    let start_ns = now_ns();
    let mut ticks_out: u64 = 0;

    while !shared.shutdown.load(Ordering::Relaxed) {
        let tick_start =
            start_ns + ticks_out * AUDIO_OUTPUT_FRAMES as u64 * 1_000_000_000 / rate;
        let tick_end =
            start_ns + (ticks_out + 1) * AUDIO_OUTPUT_FRAMES as u64 * 1_000_000_000 / rate;
        sleep_to_ns(tick_end);
        if shared.shutdown.load(Ordering::Relaxed) {
            break;
        }

        for mix_idx in 0..MAX_AUDIO_MIXES {
            if !mix_has_subscribers(&shared, mix_idx) {
                continue;
            }

            let mut planes = vec![vec![0f32; AUDIO_OUTPUT_FRAMES]; channels];
            {
                let sources = shared.sources.lock();
                for source in sources.iter() {
                    let mut s = source.lock();
                    mix_source_tick(&mut s, mix_idx, tick_start, rate, &mut planes);
                }
            }

            let tick = Arc::new(AudioTick {
                timestamp_ns: tick_start,
                mix_idx,
                planes,
                frames: AUDIO_OUTPUT_FRAMES,
            });

            let mut subs = shared.subscribers.lock();
            subs.retain(|sub| {
                if sub.mix_idx != mix_idx {
                    return true;
                }
                match sub.tx.try_send(Arc::clone(&tick)) {
                    Ok(()) => true,
                    Err(crossbeam_channel::TrySendError::Full(_)) => true, // tick lost, subscriber lags
                    Err(crossbeam_channel::TrySendError::Disconnected(_)) => false,
                }
            });
        }

        ticks_out += 1;
    }
}

fn mix_has_subscribers(shared: &MixerShared, mix_idx: usize) -> bool {
    shared
        .subscribers
        .lock()
        .iter()
        .any(|s| s.mix_idx == mix_idx)
}

/// Pull this source's contribution to one tick, repairing small gaps with
/// silence and discarding samples that fell behind the tick window.
fn mix_source_tick(
    state: &mut AudioSourceState,
    mix_idx: usize,
    tick_start: u64,
    rate: u64,
    out: &mut [Vec<f32>],
) {
    if !state.have_data || state.buffered_frames() == 0 {
        return;
    }

    let frames = AUDIO_OUTPUT_FRAMES;
    let tick_dur = frames as u64 * 1_000_000_000 / rate;
    let tick_end = tick_start + tick_dur;

    if state.start_ts >= tick_end {
        // source data starts after this tick — silence for now
        return;
    }

    if state.start_ts < tick_start {
        // behind the window: drop what the mixer already passed
        let behind = tick_start - state.start_ts;
        let drop = (behind * rate / 1_000_000_000) as usize;
        state.discard_frames(drop);
        if state.buffered_frames() == 0 {
            return;
        }
    }

    // leading silence inside the tick, then real samples
    let offset = if state.start_ts > tick_start {
        ((state.start_ts - tick_start) * rate / 1_000_000_000) as usize
    } else {
        0
    };
    if offset >= frames {
        return;
    }
    state.mix_into(mix_idx, out, offset, frames - offset);
}

#[cfg(test)]
mod tests {
    use super::*;
    use mixcast_core::frame::AudioFormat;

    fn feed(source: &AudioSource, value: f32, frames: usize, ts: u64) {
        let plane: Vec<u8> = std::iter::repeat(value)
            .take(frames)
            .flat_map(f32::to_ne_bytes)
            .collect();
        source.output_audio(
            &[&plane, &plane],
            frames,
            AudioFormat::F32Planar,
            SpeakerLayout::Stereo,
            48_000,
            ts,
        );
    }

    fn canonical() -> AudioInfo {
        AudioInfo {
            format: AudioFormat::F32Planar,
            layout: SpeakerLayout::Stereo,
            sample_rate: 48_000,
        }
    }

    #[test]
    fn two_sources_sum_per_sample() {
        let a = AudioSource::new(canonical());
        let b = AudioSource::new(canonical());
        feed(&a, 0.25, AUDIO_OUTPUT_FRAMES, 0);
        feed(&b, 0.5, AUDIO_OUTPUT_FRAMES, 0);

        let mut out = vec![vec![0f32; AUDIO_OUTPUT_FRAMES]; 2];
        mix_source_tick(&mut a.state.lock(), 0, 0, 48_000, &mut out);
        mix_source_tick(&mut b.state.lock(), 0, 0, 48_000, &mut out);
        assert!((out[0][0] - 0.75).abs() < 1e-6);
        assert!((out[1][AUDIO_OUTPUT_FRAMES - 1] - 0.75).abs() < 1e-6);
    }

    #[test]
    fn source_ahead_of_clock_pads_with_leading_silence() {
        let s = AudioSource::new(canonical());
        // data starts 512 samples into the tick
        let half_tick_ns = 512 * 1_000_000_000 / 48_000;
        feed(&s, 1.0, AUDIO_OUTPUT_FRAMES, half_tick_ns);

        let mut out = vec![vec![0f32; AUDIO_OUTPUT_FRAMES]; 2];
        mix_source_tick(&mut s.state.lock(), 0, 0, 48_000, &mut out);
        assert_eq!(out[0][0], 0.0);
        assert!((out[0][AUDIO_OUTPUT_FRAMES - 1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn source_behind_clock_is_caught_up() {
        let s = AudioSource::new(canonical());
        feed(&s, 1.0, AUDIO_OUTPUT_FRAMES * 2, 0);

        // tick window starts one full tick into the buffered data
        let tick_ns = AUDIO_OUTPUT_FRAMES as u64 * 1_000_000_000 / 48_000;
        let mut out = vec![vec![0f32; AUDIO_OUTPUT_FRAMES]; 2];
        mix_source_tick(&mut s.state.lock(), 0, tick_ns, 48_000, &mut out);
        assert!((out[0][0] - 1.0).abs() < 1e-6);
        // nearly all of the first tick's worth was discarded
        assert!(s.state.lock().buffered_frames() <= 2);
    }
}

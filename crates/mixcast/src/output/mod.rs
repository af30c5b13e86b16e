// crates/mixcast/src/output/mod.rs
//
// The output framework: state machine, packet routing from the paired
// encoders through the pair gate and interleaver to a backend, and the
// start/stop choreography.
//
// A backend owns its transport and sender thread. The framework owns the
// lifecycle: Connecting on a short-lived connect thread, Active once the
// backend is up, Stopping while it drains. Fatal conditions reach the
// embedder exactly once through SignalHub::signal_stop, whichever side
// detects them first.

pub mod file;
pub mod interleave;
pub mod mpegts;
pub mod rtmp;

pub(crate) mod avmux;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use mixcast_core::packet::EncoderPacket;
use mixcast_core::signal::{OutputSignal, SignalHub};
use mixcast_core::{log_info, MixError, StopCode};
use mixcast_media::encoder::{AacEncoder, H264Encoder, PairGate};

use self::interleave::Interleaver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputState {
    Idle,
    Connecting,
    Active,
    Reconnecting,
    Stopping,
}

#[derive(Debug, Clone)]
pub struct VideoStreamInfo {
    pub width: u32,
    pub height: u32,
    pub fps_num: u32,
    pub fps_den: u32,
    pub bitrate_kbps: u32,
}

#[derive(Debug, Clone)]
pub struct AudioStreamInfo {
    pub sample_rate: u32,
    pub channels: u32,
    pub bitrate_kbps: u32,
}

/// Everything a backend needs from its surroundings. Clone-cheap.
#[derive(Clone)]
pub struct OutputContext {
    pub signals: SignalHub,
    pub state: Arc<Mutex<OutputState>>,
    pub video_info: VideoStreamInfo,
    pub audio_info: AudioStreamInfo,
    pub video_encoder: Arc<Mutex<H264Encoder>>,
    pub audio_encoder: Arc<Mutex<AacEncoder>>,
}

impl OutputContext {
    pub fn set_state(&self, state: OutputState) {
        *self.state.lock() = state;
    }

    pub fn state(&self) -> OutputState {
        *self.state.lock()
    }

    /// Annex-B SPS/PPS of the video encoder.
    pub fn video_extradata(&self) -> Vec<u8> {
        self.video_encoder
            .lock()
            .extradata()
            .map(|d| d.to_vec())
            .unwrap_or_default()
    }

    /// AudioSpecificConfig of the audio encoder.
    pub fn audio_extradata(&self) -> Vec<u8> {
        self.audio_encoder
            .lock()
            .extradata()
            .map(|d| d.to_vec())
            .unwrap_or_default()
    }

    /// Best-effort bitrate re-arm on the video encoder (DBR).
    pub fn update_video_bitrate(&self, kbps: u32) {
        if let Err(e) = self.video_encoder.lock().update_bitrate(kbps) {
            mixcast_core::log_warn!("bitrate update to {kbps} kbps failed: {e}");
        }
    }
}

/// One output backend: RTMP, MPEG-TS, or a container file.
pub trait OutputBackend: Send {
    fn name(&self) -> &'static str;

    /// Blocking connect + bring-up. Runs on the connect thread.
    fn start(&mut self, ctx: &OutputContext) -> Result<(), MixError>;

    /// One interleaved packet, already offset-normalized.
    fn encoded_packet(&mut self, packet: EncoderPacket, ctx: &OutputContext);

    /// Begin shutdown. `ts_usec == 0` stops immediately; otherwise drain
    /// packets with `sys_dts_usec < ts_usec` bounded by the backend's
    /// shutdown budget. The backend signals the final Stop itself.
    fn stop(&mut self, ts_usec: u64, ctx: &OutputContext);

    fn total_bytes(&self) -> u64 {
        0
    }

    fn dropped_frames(&self) -> u32 {
        0
    }
}

struct OutputShared {
    backend: Mutex<Box<dyn OutputBackend>>,
    gate: Mutex<PairGate>,
    interleaver: Mutex<Interleaver>,
    ctx: OutputContext,
    active: AtomicBool,
}

/// Handle to a running output. Clone-cheap; all clones drive one output.
#[derive(Clone)]
pub struct StreamOutput {
    shared: Arc<OutputShared>,
}

impl StreamOutput {
    pub fn new(backend: Box<dyn OutputBackend>, ctx: OutputContext) -> Self {
        Self {
            shared: Arc::new(OutputShared {
                backend: Mutex::new(backend),
                gate: Mutex::new(PairGate::new()),
                interleaver: Mutex::new(Interleaver::new()),
                ctx,
                active: AtomicBool::new(false),
            }),
        }
    }

    pub fn ctx(&self) -> &OutputContext {
        &self.shared.ctx
    }

    /// Data capture is live: encoder threads may submit packets.
    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Kick off the connect thread. Returns immediately; outcome arrives
    /// through the signal channel.
    pub fn start(&self) {
        let this = self.clone();
        let ctx = self.shared.ctx.clone();
        ctx.signals.reset();
        ctx.signals.emit(OutputSignal::Starting);
        ctx.set_state(OutputState::Connecting);

        std::thread::Builder::new()
            .name("mixcast-connect".into())
            .spawn(move || {
                let result = this.shared.backend.lock().start(&ctx);
                match result {
                    Ok(()) => {
                        ctx.set_state(OutputState::Active);
                        this.shared.active.store(true, Ordering::Release);
                        ctx.signals.emit(OutputSignal::Connected);
                        ctx.signals.emit(OutputSignal::Start);
                        ctx.signals.emit(OutputSignal::Activate);
                        log_info!("output '{}' connected", this.shared.backend.lock().name());
                    }
                    Err(e) => {
                        ctx.set_state(OutputState::Idle);
                        ctx.signals.signal_stop(StopCode::from(&e), e.to_string());
                    }
                }
            })
            .expect("spawn connect thread");
    }

    /// Route one encoder packet through pairing and interleaving to the
    /// backend. Called from the encoder threads.
    pub fn submit_packet(&self, packet: EncoderPacket) {
        if !self.is_active() {
            return;
        }
        let released = self.shared.gate.lock().submit(packet);
        if released.is_empty() {
            return;
        }
        let mut emitted = Vec::new();
        {
            let mut interleaver = self.shared.interleaver.lock();
            for p in released {
                emitted.extend(interleaver.submit(p));
            }
        }
        if emitted.is_empty() {
            return;
        }
        let mut backend = self.shared.backend.lock();
        for p in emitted {
            backend.encoded_packet(p, &self.shared.ctx);
        }
    }

    /// Stop the output. Immediate when `ts_usec == 0`; otherwise drains
    /// packets older than `ts_usec` first. The final Stop signal comes
    /// from the backend when draining completes.
    pub fn stop(&self, ts_usec: u64) {
        let ctx = &self.shared.ctx;
        if ctx.state() == OutputState::Idle {
            ctx.signals.signal_stop(StopCode::Success, "output was not running");
            return;
        }
        ctx.signals.emit(OutputSignal::Stopping);
        ctx.set_state(OutputState::Stopping);
        self.shared.active.store(false, Ordering::Release);
        self.shared.backend.lock().stop(ts_usec, ctx);
        ctx.signals.emit(OutputSignal::Deactivate);
        ctx.set_state(OutputState::Idle);
    }

    pub fn total_bytes(&self) -> u64 {
        self.shared.backend.lock().total_bytes()
    }

    pub fn dropped_frames(&self) -> u32 {
        self.shared.backend.lock().dropped_frames()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use mixcast_core::packet::PacketType;
    use parking_lot::Mutex as PlMutex;

    /// Backend that records what reaches it.
    struct RecordingBackend {
        received: Arc<PlMutex<Vec<(PacketType, i64)>>>,
        stopped_at: Arc<PlMutex<Option<u64>>>,
    }

    impl OutputBackend for RecordingBackend {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn start(&mut self, _ctx: &OutputContext) -> Result<(), MixError> {
            Ok(())
        }

        fn encoded_packet(&mut self, packet: EncoderPacket, _ctx: &OutputContext) {
            self.received.lock().push((packet.ptype, packet.dts_usec));
        }

        fn stop(&mut self, ts_usec: u64, ctx: &OutputContext) {
            *self.stopped_at.lock() = Some(ts_usec);
            ctx.signals.signal_stop(StopCode::Success, "stopped");
        }
    }

    fn test_ctx() -> (OutputContext, crossbeam_channel::Receiver<OutputSignal>) {
        let (tx, rx) = unbounded();
        // encoders need real codecs; the framework tests only touch the
        // routing, so build the context around unused encoder slots via
        // the settings-only constructor path
        let video = Arc::new(Mutex::new(
            H264Encoder::create(mixcast_media::VideoEncoderSettings {
                width: 64,
                height: 64,
                fps_num: 30,
                fps_den: 1,
                bitrate_kbps: 500,
                format: mixcast_core::frame::PixelFormat::I420,
                color_space: Default::default(),
                color_range: Default::default(),
            })
            .expect("h264 encoder"),
        ));
        let audio = Arc::new(Mutex::new(
            AacEncoder::create(mixcast_media::AudioEncoderSettings {
                bitrate_kbps: 128,
                sample_rate: 48_000,
                layout: mixcast_core::frame::SpeakerLayout::Stereo,
                mixer_idx: 0,
            })
            .expect("aac encoder"),
        ));
        let ctx = OutputContext {
            signals: SignalHub::new(tx),
            state: Arc::new(Mutex::new(OutputState::Idle)),
            video_info: VideoStreamInfo {
                width: 64,
                height: 64,
                fps_num: 30,
                fps_den: 1,
                bitrate_kbps: 500,
            },
            audio_info: AudioStreamInfo {
                sample_rate: 48_000,
                channels: 2,
                bitrate_kbps: 128,
            },
            video_encoder: video,
            audio_encoder: audio,
        };
        (ctx, rx)
    }

    fn pkt(ptype: PacketType, dts_ms: i64, keyframe: bool) -> EncoderPacket {
        let mut p = EncoderPacket::new(ptype, vec![1]);
        p.pts = dts_ms;
        p.dts = dts_ms;
        p.timebase_num = 1;
        p.timebase_den = 1000;
        p.keyframe = keyframe;
        p.refresh_dts_usec();
        p
    }

    #[test]
    fn packets_flow_only_while_active() {
        let received = Arc::new(PlMutex::new(Vec::new()));
        let stopped_at = Arc::new(PlMutex::new(None));
        let (ctx, rx) = test_ctx();
        let output = StreamOutput::new(
            Box::new(RecordingBackend {
                received: Arc::clone(&received),
                stopped_at: Arc::clone(&stopped_at),
            }),
            ctx,
        );

        // not started: everything is discarded
        output.submit_packet(pkt(PacketType::Video, 0, true));
        assert!(received.lock().is_empty());

        output.start();
        // wait for the connect thread to flip active
        for _ in 0..100 {
            if output.is_active() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(output.is_active());

        output.submit_packet(pkt(PacketType::Video, 0, true));
        output.submit_packet(pkt(PacketType::Audio, 2, false));
        output.submit_packet(pkt(PacketType::Audio, 23, false));
        output.submit_packet(pkt(PacketType::Video, 33, false));
        output.submit_packet(pkt(PacketType::Audio, 44, false));
        assert!(!received.lock().is_empty());

        output.stop(0);
        assert_eq!(*stopped_at.lock(), Some(0));

        let signals: Vec<_> = rx.try_iter().collect();
        assert!(signals.iter().any(|s| matches!(s, OutputSignal::Start)));
        assert!(signals
            .iter()
            .any(|s| matches!(s, OutputSignal::Stop { code: StopCode::Success, .. })));
        // exactly one stop
        assert_eq!(
            signals
                .iter()
                .filter(|s| matches!(s, OutputSignal::Stop { .. }))
                .count(),
            1
        );
    }
}

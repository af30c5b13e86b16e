// crates/mixcast/src/api.rs
//
// The embedder-facing surface: one MixcastApi owns the compositor, the
// audio mixer, and at most one running output, and wires them together on
// start_output:
//
//   compositor ring ──► video encoder thread ─┐
//   mixer ticks     ──► audio encoder thread ─┴─► StreamOutput ─► backend
//
// Encoder threads are subscribers; they discard frames until the backend
// connects (data capture begins with the connection, like any broadcast
// pipeline) and join on stop_output.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender};
use parking_lot::Mutex;

use mixcast_core::frame::{ColorRange, ColorSpace, PixelFormat, SpeakerLayout};
use mixcast_core::signal::{OutputSignal, SignalHub};
use mixcast_core::{log_error, log_info, MixError, StopCode};
use mixcast_media::encoder::{AacEncoder, H264Encoder};
use mixcast_media::{AudioEncoderSettings, AudioMixer, AudioSource, VideoEncoderSettings};
use mixcast_render::{Compositor, CompositorConfig, ExternalTexture, VideoSourceControl};

use crate::endpoint::{parse_endpoint, Endpoint};
use crate::output::file::FileOutput;
use crate::output::mpegts::MpegTsOutput;
use crate::output::rtmp::{RtmpOutput, RtmpSettings};
use crate::output::{
    AudioStreamInfo, OutputBackend, OutputContext, OutputState, StreamOutput, VideoStreamInfo,
};

/// Input to reset_video. Output dimensions default to the canvas size.
#[derive(Debug, Clone)]
pub struct VideoSettings {
    pub width: u32,
    pub height: u32,
    pub fps_num: u32,
    pub fps_den: u32,
    pub output_width: u32,
    pub output_height: u32,
    pub format: PixelFormat,
    pub color_space: ColorSpace,
    pub color_range: ColorRange,
}

impl VideoSettings {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width,
            height,
            fps_num: fps,
            fps_den: 1,
            output_width: width,
            output_height: height,
            format: PixelFormat::I420,
            color_space: ColorSpace::Default,
            color_range: ColorRange::Default,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaSourceKind {
    /// Texture / still-image video source.
    Video,
    /// Video source fed timestamped decoded frames.
    VideoAsync,
    Audio,
}

/// One ingest handle of either medium.
pub enum MediaSource {
    Video(VideoSourceControl),
    Audio(AudioSource),
}

struct ActiveOutput {
    stream: StreamOutput,
    shutdown: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

#[derive(Default)]
struct ApiInner {
    compositor: Mutex<Option<Compositor>>,
    mixer: Mutex<Option<AudioMixer>>,
    active: Mutex<Option<ActiveOutput>>,
}

/// The library entry point. Everything hangs off one of these; dropping
/// it tears the whole pipeline down.
#[derive(Clone, Default)]
pub struct MixcastApi {
    inner: Arc<ApiInner>,
}

impl MixcastApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install (or replace) the compositor. Fails with BadConfig while an
    /// output is running — resolution changes mid-stream are rejected,
    /// not deferred.
    pub fn reset_video(&self, settings: VideoSettings) -> Result<(), MixError> {
        if self.output_running() {
            return Err(MixError::BadConfig(
                "reset_video while an output is running".into(),
            ));
        }

        let cfg = CompositorConfig {
            width: settings.width,
            height: settings.height,
            output_width: settings.output_width,
            output_height: settings.output_height,
            fps_num: settings.fps_num,
            fps_den: settings.fps_den,
            format: settings.format,
            color_space: settings.color_space,
            color_range: settings.color_range,
        };
        let compositor = Compositor::start(cfg)?;
        *self.inner.compositor.lock() = Some(compositor);
        Ok(())
    }

    /// Install (or replace) the audio mixer. False while an output runs
    /// or on a zero sample rate.
    pub fn reset_audio(&self, sample_rate: u32) -> bool {
        if sample_rate == 0 || self.output_running() {
            return false;
        }
        *self.inner.mixer.lock() = Some(AudioMixer::new(sample_rate, SpeakerLayout::Stereo));
        true
    }

    pub fn create_source(&self, kind: MediaSourceKind) -> Result<MediaSource, MixError> {
        match kind {
            MediaSourceKind::Video | MediaSourceKind::VideoAsync => {
                Ok(MediaSource::Video(self.create_video_source()?))
            }
            MediaSourceKind::Audio => Ok(MediaSource::Audio(self.create_audio_source()?)),
        }
    }

    pub fn create_video_source(&self) -> Result<VideoSourceControl, MixError> {
        self.inner
            .compositor
            .lock()
            .as_ref()
            .map(|c| c.create_source())
            .ok_or_else(|| MixError::BadConfig("reset_video has not run".into()))
    }

    pub fn create_audio_source(&self) -> Result<AudioSource, MixError> {
        self.inner
            .mixer
            .lock()
            .as_ref()
            .map(|m| m.create_source())
            .ok_or_else(|| MixError::BadConfig("reset_audio has not run".into()))
    }

    /// Texture handle for sources fed by an external renderer.
    pub fn create_shared_texture(&self, width: u32, height: u32) -> Result<ExternalTexture, MixError> {
        self.inner
            .compositor
            .lock()
            .as_ref()
            .ok_or_else(|| MixError::BadConfig("reset_video has not run".into()))?
            .create_texture(width, height)
    }

    /// Start streaming to `endpoint`. Lifecycle lands on `signal_tx`;
    /// the return only covers synchronous setup.
    pub fn start_output(
        &self,
        endpoint: &str,
        video_kbps: u32,
        audio_kbps: u32,
        signal_tx: Sender<OutputSignal>,
    ) -> bool {
        let signals = SignalHub::new(signal_tx);
        match self.start_output_inner(endpoint, video_kbps, audio_kbps, signals.clone()) {
            Ok(()) => true,
            Err(e) => {
                log_error!("start_output failed: {e}");
                signals.signal_stop(StopCode::from(&e), e.to_string());
                false
            }
        }
    }

    fn start_output_inner(
        &self,
        endpoint: &str,
        video_kbps: u32,
        audio_kbps: u32,
        signals: SignalHub,
    ) -> Result<(), MixError> {
        if video_kbps == 0 || audio_kbps == 0 {
            return Err(MixError::BadConfig("bitrates must be nonzero".into()));
        }
        if self.output_running() {
            return Err(MixError::BadConfig("an output is already running".into()));
        }

        let parsed = parse_endpoint(endpoint)?;

        let compositor_guard = self.inner.compositor.lock();
        let compositor = compositor_guard
            .as_ref()
            .ok_or_else(|| MixError::BadConfig("reset_video has not run".into()))?;
        let mixer_guard = self.inner.mixer.lock();
        let mixer = mixer_guard
            .as_ref()
            .ok_or_else(|| MixError::BadConfig("reset_audio has not run".into()))?;

        let ccfg = compositor.config().clone();

        // encoders, paired for the run
        let video_encoder = Arc::new(Mutex::new(H264Encoder::create(VideoEncoderSettings {
            width: ccfg.output_width,
            height: ccfg.output_height,
            fps_num: ccfg.fps_num,
            fps_den: ccfg.fps_den,
            bitrate_kbps: video_kbps,
            format: ccfg.format,
            color_space: ccfg.color_space,
            color_range: ccfg.color_range,
        })?));
        let audio_encoder = Arc::new(Mutex::new(AacEncoder::create(AudioEncoderSettings {
            bitrate_kbps: audio_kbps,
            sample_rate: mixer.sample_rate(),
            layout: SpeakerLayout::Stereo,
            mixer_idx: 0,
        })?));

        let ctx = OutputContext {
            signals,
            state: Arc::new(Mutex::new(OutputState::Idle)),
            video_info: VideoStreamInfo {
                width: ccfg.output_width,
                height: ccfg.output_height,
                fps_num: ccfg.fps_num,
                fps_den: ccfg.fps_den,
                bitrate_kbps: video_kbps,
            },
            audio_info: AudioStreamInfo {
                sample_rate: mixer.sample_rate(),
                channels: mixer.channels() as u32,
                bitrate_kbps: audio_kbps,
            },
            video_encoder: Arc::clone(&video_encoder),
            audio_encoder: Arc::clone(&audio_encoder),
        };

        let backend: Box<dyn OutputBackend> = match parsed {
            Endpoint::Rtmp(target) => Box::new(RtmpOutput::new(
                RtmpSettings::new(target),
                video_kbps,
                audio_kbps,
            )),
            Endpoint::MpegTs { url, transport } => Box::new(MpegTsOutput::new(url, transport)),
            Endpoint::File(path) => Box::new(FileOutput::new(path)),
        };

        let stream = StreamOutput::new(backend, ctx);
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut threads = Vec::new();

        // video: either the GPU texture queue (texture-taking encoders)
        // or the CPU frame ring
        if video_encoder.lock().gpu_encode_available() {
            let ring = compositor.ring();
            ring.add_texture_subscriber();
            let queue = compositor.gpu_queue();
            let stream_cl = stream.clone();
            let shutdown_cl = Arc::clone(&shutdown);
            threads.push(
                std::thread::Builder::new()
                    .name("mixcast-venc-gpu".into())
                    .spawn(move || {
                        while !shutdown_cl.load(Ordering::Relaxed) {
                            // a texture-taking arm would encode (ts, slot)
                            // pairs here; both shipped arms are CPU-frame
                            // consumers, so this drains defensively
                            if queue.pop_blocking().is_none() {
                                break;
                            }
                            let _ = &stream_cl;
                        }
                    })
                    .expect("spawn gpu encode thread"),
            );
        } else {
            let rx = compositor.ring().connect();
            let encoder = Arc::clone(&video_encoder);
            let stream_cl = stream.clone();
            let shutdown_cl = Arc::clone(&shutdown);
            threads.push(
                std::thread::Builder::new()
                    .name("mixcast-venc".into())
                    .spawn(move || {
                        video_encoder_loop(rx, encoder, stream_cl, shutdown_cl);
                    })
                    .expect("spawn video encoder thread"),
            );
        }

        {
            let rx = mixer.subscribe(0);
            let encoder = Arc::clone(&audio_encoder);
            let stream_cl = stream.clone();
            let shutdown_cl = Arc::clone(&shutdown);
            threads.push(
                std::thread::Builder::new()
                    .name("mixcast-aenc".into())
                    .spawn(move || {
                        audio_encoder_loop(rx, encoder, stream_cl, shutdown_cl);
                    })
                    .expect("spawn audio encoder thread"),
            );
        }

        stream.start();
        log_info!("output starting toward {endpoint}");

        *self.inner.active.lock() = Some(ActiveOutput {
            stream,
            shutdown,
            threads,
        });
        Ok(())
    }

    /// Immediate stop: close, join, report Success.
    pub fn stop_output(&self) {
        self.stop_output_at(0);
    }

    /// Graceful stop: drain packets with `sys_dts_usec < ts_usec` first
    /// (bounded by the backend's shutdown budget).
    pub fn stop_output_at(&self, ts_usec: u64) {
        let Some(mut active) = self.inner.active.lock().take() else {
            return;
        };
        active.stream.stop(ts_usec);
        active.shutdown.store(true, Ordering::Relaxed);
        for t in active.threads.drain(..) {
            let _ = t.join();
        }
    }

    pub fn output_running(&self) -> bool {
        self.inner.active.lock().is_some()
    }
}

impl Drop for ApiInner {
    fn drop(&mut self) {
        // outputs first, then the producers they subscribe to
        if let Some(mut active) = self.active.lock().take() {
            active.stream.stop(0);
            active.shutdown.store(true, Ordering::Relaxed);
            for t in active.threads.drain(..) {
                let _ = t.join();
            }
        }
    }
}

fn video_encoder_loop(
    rx: crossbeam_channel::Receiver<Arc<mixcast_core::frame::VideoFrame>>,
    encoder: Arc<Mutex<H264Encoder>>,
    stream: StreamOutput,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::Relaxed) {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(frame) => {
                if !stream.is_active() {
                    continue;
                }
                match encoder.lock().encode(&frame) {
                    Ok(packets) => {
                        for p in packets {
                            stream.submit_packet(p);
                        }
                    }
                    Err(e) => {
                        log_error!("video encode failed: {e}");
                        stream
                            .ctx()
                            .signals
                            .signal_stop(StopCode::EncodeError, e.to_string());
                        return;
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

fn audio_encoder_loop(
    rx: crossbeam_channel::Receiver<Arc<mixcast_media::AudioTick>>,
    encoder: Arc<Mutex<AacEncoder>>,
    stream: StreamOutput,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::Relaxed) {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(tick) => {
                if !stream.is_active() {
                    continue;
                }
                match encoder.lock().encode_tick(&tick) {
                    Ok(packets) => {
                        for p in packets {
                            stream.submit_packet(p);
                        }
                    }
                    Err(e) => {
                        log_error!("audio encode failed: {e}");
                        stream
                            .ctx()
                            .signals
                            .signal_stop(StopCode::EncodeError, e.to_string());
                        return;
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

// crates/mixcast/src/lib.rs
//
// mixcast: a live media compositor and streaming pipeline.
//
// Video and audio sources are mixed on a GPU canvas, encoded to H.264 and
// AAC, interleaved, and streamed over RTMP (FLV), MPEG-TS (UDP/TCP/HTTP/
// SRT) or into a local container file, with congestion response and
// reconnection on the RTMP path.
//
//   let api = MixcastApi::new();
//   api.reset_video(VideoSettings::new(1280, 720, 30))?;
//   api.reset_audio(48_000);
//   let camera = api.create_video_source()?;
//   let mic = api.create_audio_source()?;
//   let (tx, rx) = crossbeam_channel::unbounded();
//   api.start_output("rtmp://example.com/live/key", 4000, 160, tx);

pub mod api;
pub mod endpoint;
pub mod output;

pub use api::{MediaSource, MediaSourceKind, MixcastApi, VideoSettings};
pub use endpoint::{parse_endpoint, Endpoint, RtmpTarget, TsTransport};
pub use output::{OutputBackend, OutputContext, OutputState, StreamOutput};

pub use mixcast_core::log::{set_log_handler, LogLevel};
pub use mixcast_core::signal::OutputSignal;
pub use mixcast_core::{MixError, StopCode};
pub use mixcast_media::AudioSource;
pub use mixcast_render::{ExternalTexture, VideoSourceControl};

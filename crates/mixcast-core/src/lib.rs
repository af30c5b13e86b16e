// crates/mixcast-core/src/lib.rs
//
// Plain data types shared by every mixcast crate: frames, packets, the
// monotonic clock, the circular audio buffer, source transforms, errors,
// output signals, and the process-wide log fan-out.
// No ffmpeg, no wgpu — crates above this one own those.

pub mod audio_buf;
pub mod clock;
pub mod error;
pub mod frame;
pub mod log;
pub mod packet;
pub mod signal;
pub mod transform;

pub use audio_buf::CircularBuffer;
pub use error::{MixError, StopCode};
pub use frame::{
    AudioFormat, AudioFrame, ColorRange, ColorSpace, PixelFormat, SpeakerLayout, VideoFrame,
    AUDIO_OUTPUT_FRAMES, MAX_AUDIO_MIXES, MAX_AV_PLANES,
};
pub use packet::{EncoderPacket, PacketType};
pub use signal::{OutputSignal, SignalHub};
pub use transform::{OrderMovement, RenderBox, ScaleFit, SourceTransform};

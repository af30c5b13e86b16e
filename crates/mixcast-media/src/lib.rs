// crates/mixcast-media/src/lib.rs

pub mod audio_source;
pub mod avc;
pub mod encoder;
pub mod flv;
pub mod mixer;
pub mod resample;
mod helpers; // internal — not pub, not re-exported

pub use audio_source::AudioSource;
pub use encoder::{AacEncoder, AudioEncoderSettings, H264Encoder, PairGate, VideoEncoderSettings};
pub use mixer::{AudioMixer, AudioTick};
pub use resample::{AudioInfo, AudioResampler};

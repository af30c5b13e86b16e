// crates/mixcast-render/src/lib.rs
//
// GPU compositing: device bring-up, textures and stage surfaces, the
// shader program set, video sources, the frame ring, and the compositor's
// render thread. Everything here is wgpu; codec work lives in
// mixcast-media and never touches this crate.

pub mod compositor;
pub mod device;
pub mod matrices;
pub mod program;
pub mod ring;
pub mod source;
pub mod stack;
pub mod stage;
pub mod texture;

mod shaders;
mod vertex;

pub use compositor::{Compositor, CompositorConfig};
pub use ring::{GpuEncodeQueue, VideoRing};
pub use source::{ExternalTexture, VideoSourceControl};

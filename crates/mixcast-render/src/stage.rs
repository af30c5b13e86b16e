// crates/mixcast-render/src/stage.rs
//
// Stage surfaces: CPU-readable mirrors of plane textures.
//
// A stage surface is a MAP_READ buffer sized for the texture with rows
// padded to wgpu's 256-byte copy alignment. stage() records the GPU→buffer
// copy; map() blocks until the copy has landed and yields the bytes plus
// their padded linesize. Mapping is guarded — a second map before the
// guard drops fails with MappingBusy and the caller skips the frame.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mixcast_core::MixError;

use crate::texture::Texture;

const ROW_ALIGN: u32 = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT; // 256

pub struct StageSurface {
    buffer: wgpu::Buffer,
    pub width: u32,
    pub height: u32,
    pub padded_bytes_per_row: u32,
    mapped: Arc<AtomicBool>,
}

impl StageSurface {
    pub fn new(device: &wgpu::Device, label: &str, width: u32, height: u32, bpp: u32) -> Self {
        let padded = (width * bpp).div_ceil(ROW_ALIGN) * ROW_ALIGN;
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: padded as u64 * height as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        Self {
            buffer,
            width,
            height,
            padded_bytes_per_row: padded,
            mapped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Record the texture→buffer copy for this frame.
    pub fn stage(&self, encoder: &mut wgpu::CommandEncoder, src: &Texture) {
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &src.tex,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &self.buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(self.padded_bytes_per_row),
                    rows_per_image: Some(self.height),
                },
            },
            wgpu::Extent3d {
                width: src.width,
                height: src.height,
                depth_or_array_layers: 1,
            },
        );
    }

    /// Pin the staged bytes for CPU reading. Blocks until the device has
    /// finished the copy. Fails with MappingBusy while a previous guard is
    /// still alive.
    pub fn map<'a>(&'a self, device: &wgpu::Device) -> Result<MappedPlane<'a>, MixError> {
        if self.mapped.swap(true, Ordering::AcqRel) {
            return Err(MixError::MappingBusy);
        }

        let slice = self.buffer.slice(..);
        let (tx, rx) = crossbeam_channel::bounded(1);
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = device.poll(wgpu::PollType::wait_indefinitely());

        match rx.recv() {
            Ok(Ok(())) => {}
            _ => {
                self.mapped.store(false, Ordering::Release);
                return Err(MixError::OutOfResources("stage surface map failed".into()));
            }
        }

        Ok(MappedPlane {
            surface: self,
            view: Some(slice.get_mapped_range()),
            linesize: self.padded_bytes_per_row as usize,
        })
    }
}

/// Mapped view of a stage surface. Unmaps on drop.
pub struct MappedPlane<'a> {
    surface: &'a StageSurface,
    view: Option<wgpu::BufferView>,
    pub linesize: usize,
}

impl MappedPlane<'_> {
    pub fn data(&self) -> &[u8] {
        self.view.as_ref().expect("mapped view alive")
    }
}

impl Drop for MappedPlane<'_> {
    fn drop(&mut self) {
        drop(self.view.take());
        self.surface.buffer.unmap();
        self.surface.mapped.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    // Row padding math is the only piece that runs without a device.
    #[test]
    fn rows_pad_to_copy_alignment() {
        let pad = |w: u32, bpp: u32| (w * bpp).div_ceil(super::ROW_ALIGN) * super::ROW_ALIGN;
        assert_eq!(pad(1280, 1), 1280); // already aligned
        assert_eq!(pad(1280, 4), 5120);
        assert_eq!(pad(640, 1), 640);
        assert_eq!(pad(321, 1), 512);
        assert_eq!(pad(960, 2), 1920);
    }
}

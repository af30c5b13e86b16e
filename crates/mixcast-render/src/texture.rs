// crates/mixcast-render/src/texture.rs
//
// Texture wrapper: creation with {dynamic, render_target} flags, dynamic
// uploads, and same-format blits.

use mixcast_core::MixError;

#[derive(Debug, Clone, Copy, Default)]
pub struct TextureFlags {
    /// Re-uploaded from the CPU during the run.
    pub dynamic: bool,
    /// Used as a render pass color attachment.
    pub render_target: bool,
}

pub struct Texture {
    pub tex: wgpu::Texture,
    pub view: wgpu::TextureView,
    pub width: u32,
    pub height: u32,
    pub format: wgpu::TextureFormat,
}

impl Texture {
    pub fn new(
        device: &wgpu::Device,
        label: &str,
        width: u32,
        height: u32,
        format: wgpu::TextureFormat,
        flags: TextureFlags,
    ) -> Result<Self, MixError> {
        if width == 0 || height == 0 {
            return Err(MixError::OutOfResources(format!(
                "texture '{label}' with zero dimension"
            )));
        }

        let mut usage = wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_SRC;
        if flags.dynamic {
            usage |= wgpu::TextureUsages::COPY_DST;
        }
        if flags.render_target {
            usage |= wgpu::TextureUsages::RENDER_ATTACHMENT;
        }

        let tex = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage,
            view_formats: &[],
        });
        let view = tex.create_view(&wgpu::TextureViewDescriptor::default());

        Ok(Self {
            tex,
            view,
            width,
            height,
            format,
        })
    }

    /// Upload a full image; `bytes_per_row` is the source stride.
    pub fn upload(&self, queue: &wgpu::Queue, data: &[u8], bytes_per_row: u32) {
        queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &self.tex,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(bytes_per_row),
                rows_per_image: Some(self.height),
            },
            wgpu::Extent3d {
                width: self.width,
                height: self.height,
                depth_or_array_layers: 1,
            },
        );
    }

    /// Blit `src` into self. Formats and dimensions must match.
    pub fn copy_from(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        src: &Texture,
    ) -> Result<(), MixError> {
        if src.format != self.format || src.width != self.width || src.height != self.height {
            return Err(MixError::BadConfig(format!(
                "texture copy mismatch: {}x{} {:?} -> {}x{} {:?}",
                src.width, src.height, src.format, self.width, self.height, self.format
            )));
        }
        encoder.copy_texture_to_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &src.tex,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyTextureInfo {
                texture: &self.tex,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::Extent3d {
                width: self.width,
                height: self.height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }
}

/// Bytes per pixel of the formats the compositor renders into.
pub fn format_bpp(format: wgpu::TextureFormat) -> u32 {
    match format {
        wgpu::TextureFormat::R8Unorm => 1,
        wgpu::TextureFormat::Rg8Unorm => 2,
        _ => 4,
    }
}

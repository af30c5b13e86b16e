// crates/mixcast-render/src/program.rs
//
// Pipeline construction and the two uniform paths.
//
// Sprite-style draws get a fresh 256-byte slot in a per-frame uniform
// arena (bound with a dynamic offset — many draws, one buffer). The
// conversion programs keep a dedicated uniform whose contents change only
// on reconfiguration; set_params marks it dirty and upload(changed_only)
// writes it just when needed.

use mixcast_core::MixError;

use crate::matrices::ConversionRows;
use crate::shaders;
use crate::vertex;

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct SpriteUniform {
    pub mvp: [[f32; 4]; 4],
    pub params: [f32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct PackUniform {
    pub row0: [f32; 4],
    pub row1: [f32; 4],
    pub row2: [f32; 4],
    pub texel: [f32; 4],
}

impl PackUniform {
    pub fn from_rows(rows: ConversionRows, texel_x: f32) -> Self {
        Self {
            row0: rows.row0,
            row1: rows.row1,
            row2: rows.row2,
            texel: [texel_x, 0.0, 0.0, 0.0],
        }
    }
}

/// Uniform slot stride: one slot per draw, aligned for dynamic offsets.
pub const UNIFORM_STRIDE: u32 = 256;

// ── Arena for per-draw uniforms ───────────────────────────────────────────────

pub struct UniformArena {
    pub buffer: wgpu::Buffer,
    capacity: u32,
    used: u32,
}

impl UniformArena {
    pub fn new(device: &wgpu::Device, max_draws: u32) -> Self {
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("mixcast draw uniforms"),
            size: max_draws as u64 * UNIFORM_STRIDE as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Self {
            buffer,
            capacity: max_draws,
            used: 0,
        }
    }

    pub fn begin_frame(&mut self) {
        self.used = 0;
    }

    /// Write one draw's uniform; returns its dynamic offset, or None when
    /// the frame has exhausted the arena (the draw is skipped and logged
    /// by the caller).
    pub fn push(&mut self, queue: &wgpu::Queue, value: &SpriteUniform) -> Option<u32> {
        if self.used >= self.capacity {
            return None;
        }
        let offset = self.used * UNIFORM_STRIDE;
        queue.write_buffer(&self.buffer, offset as u64, bytemuck::bytes_of(value));
        self.used += 1;
        Some(offset)
    }
}

// ── Programs ──────────────────────────────────────────────────────────────────

pub struct Program {
    pub pipeline: wgpu::RenderPipeline,
    pub bind_layout: wgpu::BindGroupLayout,
}

/// A conversion program plus its dirty-tracked static uniform.
pub struct PackProgram {
    pub program: Program,
    pub uniform: wgpu::Buffer,
    current: PackUniform,
    dirty: bool,
}

impl PackProgram {
    fn new(device: &wgpu::Device, label: &str, program: Program) -> Self {
        let uniform = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: std::mem::size_of::<PackUniform>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Self {
            program,
            uniform,
            current: PackUniform::from_rows(
                ConversionRows {
                    row0: [0.0; 4],
                    row1: [0.0; 4],
                    row2: [0.0; 4],
                },
                0.0,
            ),
            dirty: true,
        }
    }

    pub fn set_params(&mut self, value: PackUniform) {
        if self.current != value {
            self.current = value;
            self.dirty = true;
        }
    }

    pub fn upload(&mut self, queue: &wgpu::Queue, changed_only: bool) {
        if changed_only && !self.dirty {
            return;
        }
        queue.write_buffer(&self.uniform, 0, bytemuck::bytes_of(&self.current));
        self.dirty = false;
    }
}

fn uniform_entry(binding: u32, dynamic: bool, size: u64) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: dynamic,
            min_binding_size: wgpu::BufferSize::new(size),
        },
        count: None,
    }
}

fn texture_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: true },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        count: None,
    }
}

fn sampler_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
        count: None,
    }
}

struct PipelineSpec<'a> {
    label: &'a str,
    source: &'a str,
    fs_entry: &'a str,
    target: wgpu::TextureFormat,
    blend: Option<wgpu::BlendState>,
    /// uniform is (dynamic, size); texture count follows.
    dynamic_uniform: bool,
    uniform_size: u64,
    textures: u32,
}

fn build_program(device: &wgpu::Device, spec: &PipelineSpec) -> Result<Program, MixError> {
    let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(spec.label),
        source: wgpu::ShaderSource::Wgsl(spec.source.into()),
    });

    let mut entries = vec![uniform_entry(0, spec.dynamic_uniform, spec.uniform_size)];
    for i in 0..spec.textures {
        entries.push(texture_entry(1 + i));
    }
    entries.push(sampler_entry(1 + spec.textures));

    let bind_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some(spec.label),
        entries: &entries,
    });

    let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(spec.label),
        bind_group_layouts: &[&bind_layout],
        immediate_size: 0,
    });

    let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(spec.label),
        layout: Some(&layout),
        vertex: wgpu::VertexState {
            module: &shader,
            entry_point: Some("vs_main"),
            buffers: &[vertex::vertex_layout()],
            compilation_options: Default::default(),
        },
        fragment: Some(wgpu::FragmentState {
            module: &shader,
            entry_point: Some(spec.fs_entry),
            targets: &[Some(wgpu::ColorTargetState {
                format: spec.target,
                blend: spec.blend,
                write_mask: wgpu::ColorWrites::ALL,
            })],
            compilation_options: Default::default(),
        }),
        primitive: wgpu::PrimitiveState {
            topology: wgpu::PrimitiveTopology::TriangleList,
            strip_index_format: None,
            front_face: wgpu::FrontFace::Ccw,
            cull_mode: None,
            polygon_mode: wgpu::PolygonMode::Fill,
            unclipped_depth: false,
            conservative: false,
        },
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        multiview_mask: None,
        cache: None,
    });

    Ok(Program {
        pipeline,
        bind_layout,
    })
}

/// Every pipeline of the compositor, plus the shared sampler, quad and
/// draw-uniform arena.
pub struct ProgramSet {
    pub sprite: Program,
    pub bicubic: Program,
    pub pack_y: PackProgram,
    pub pack_u: PackProgram,
    pub pack_v: PackProgram,
    pub pack_uv: PackProgram,
    pub unpack_i420: PackProgram,
    pub unpack_nv12: PackProgram,
    pub sampler: wgpu::Sampler,
    pub quad: wgpu::Buffer,
    pub arena: UniformArena,
}

impl ProgramSet {
    pub fn create(device: &wgpu::Device) -> Result<Self, MixError> {
        let sprite_size = std::mem::size_of::<SpriteUniform>() as u64;
        let pack_size = std::mem::size_of::<PackUniform>() as u64;

        let sprite = build_program(
            device,
            &PipelineSpec {
                label: "mixcast sprite",
                source: shaders::SPRITE,
                fs_entry: "fs_main",
                target: wgpu::TextureFormat::Rgba8Unorm,
                blend: Some(wgpu::BlendState::ALPHA_BLENDING),
                dynamic_uniform: true,
                uniform_size: sprite_size,
                textures: 1,
            },
        )?;

        let bicubic = build_program(
            device,
            &PipelineSpec {
                label: "mixcast bicubic scale",
                source: shaders::BICUBIC,
                fs_entry: "fs_main",
                target: wgpu::TextureFormat::Rgba8Unorm,
                blend: Some(wgpu::BlendState::REPLACE),
                dynamic_uniform: true,
                uniform_size: sprite_size,
                textures: 1,
            },
        )?;

        let pack = |label, entry, target| PipelineSpec {
            label,
            source: shaders::PACK,
            fs_entry: entry,
            target,
            blend: Some(wgpu::BlendState::REPLACE),
            dynamic_uniform: false,
            uniform_size: pack_size,
            textures: 1,
        };

        let pack_y = PackProgram::new(
            device,
            "pack y uniform",
            build_program(device, &pack("mixcast pack y", "fs_y", wgpu::TextureFormat::R8Unorm))?,
        );
        let pack_u = PackProgram::new(
            device,
            "pack u uniform",
            build_program(device, &pack("mixcast pack u", "fs_u", wgpu::TextureFormat::R8Unorm))?,
        );
        let pack_v = PackProgram::new(
            device,
            "pack v uniform",
            build_program(device, &pack("mixcast pack v", "fs_v", wgpu::TextureFormat::R8Unorm))?,
        );
        let pack_uv = PackProgram::new(
            device,
            "pack uv uniform",
            build_program(
                device,
                &pack("mixcast pack uv", "fs_uv", wgpu::TextureFormat::Rg8Unorm),
            )?,
        );

        let unpack_i420 = PackProgram::new(
            device,
            "unpack i420 uniform",
            build_program(
                device,
                &PipelineSpec {
                    label: "mixcast unpack i420",
                    source: shaders::UNPACK_I420,
                    fs_entry: "fs_main",
                    target: wgpu::TextureFormat::Rgba8Unorm,
                    blend: Some(wgpu::BlendState::REPLACE),
                    dynamic_uniform: false,
                    uniform_size: pack_size,
                    textures: 3,
                },
            )?,
        );
        let unpack_nv12 = PackProgram::new(
            device,
            "unpack nv12 uniform",
            build_program(
                device,
                &PipelineSpec {
                    label: "mixcast unpack nv12",
                    source: shaders::UNPACK_NV12,
                    fs_entry: "fs_main",
                    target: wgpu::TextureFormat::Rgba8Unorm,
                    blend: Some(wgpu::BlendState::REPLACE),
                    dynamic_uniform: false,
                    uniform_size: pack_size,
                    textures: 2,
                },
            )?,
        );

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("mixcast sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::MipmapFilterMode::Nearest,
            ..Default::default()
        });

        Ok(Self {
            sprite,
            bicubic,
            pack_y,
            pack_u,
            pack_v,
            pack_uv,
            unpack_i420,
            unpack_nv12,
            sampler,
            quad: vertex::create_quad_buffer(device),
            arena: UniformArena::new(device, 256),
        })
    }
}

/// Bind group for a single-texture program (sprite, bicubic, pack).
pub fn single_texture_bind_group(
    device: &wgpu::Device,
    program: &Program,
    uniform: wgpu::BufferBinding,
    view: &wgpu::TextureView,
    sampler: &wgpu::Sampler,
) -> wgpu::BindGroup {
    device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: None,
        layout: &program.bind_layout,
        entries: &[
            wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::Buffer(uniform),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: wgpu::BindingResource::TextureView(view),
            },
            wgpu::BindGroupEntry {
                binding: 2,
                resource: wgpu::BindingResource::Sampler(sampler),
            },
        ],
    })
}

/// Bind group for the unpack programs (2 or 3 plane textures).
pub fn multi_texture_bind_group(
    device: &wgpu::Device,
    program: &Program,
    uniform: wgpu::BufferBinding,
    views: &[&wgpu::TextureView],
    sampler: &wgpu::Sampler,
) -> wgpu::BindGroup {
    let mut entries = vec![wgpu::BindGroupEntry {
        binding: 0,
        resource: wgpu::BindingResource::Buffer(uniform),
    }];
    for (i, view) in views.iter().enumerate() {
        entries.push(wgpu::BindGroupEntry {
            binding: 1 + i as u32,
            resource: wgpu::BindingResource::TextureView(view),
        });
    }
    entries.push(wgpu::BindGroupEntry {
        binding: 1 + views.len() as u32,
        resource: wgpu::BindingResource::Sampler(sampler),
    });
    device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: None,
        layout: &program.bind_layout,
        entries: &entries,
    })
}

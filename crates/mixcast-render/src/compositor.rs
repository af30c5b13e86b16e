// crates/mixcast-render/src/compositor.rs
//
// The render thread: paces at the output frame rate, draws every source
// in z-order into the canvas, scales to the output size, packs RGBA into
// the planar output format, stages the planes for readback, and publishes
// finished frames to the video ring.
//
// Readback runs one frame behind: frame N's stage copies are submitted,
// then the stage set written by frame N−1 is mapped and published. Two
// stage sets alternate, so the map never waits on work submitted in the
// same frame.
//
// Startup failures (device, shaders, textures) are fatal and reported
// through the init channel. Per-frame failures are logged and the frame
// is skipped; the pacer keeps the clock on-grid regardless.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use uuid::Uuid;

use mixcast_core::clock::FramePacer;
use mixcast_core::frame::{ColorRange, ColorSpace, PixelFormat, VideoFrame};
use mixcast_core::transform::{
    apply_movement, mat4_mul, mat4_ortho, mat4_scale, SourceTransform,
};
use mixcast_core::{log_debug, log_error, log_info, MixError};

use crate::device::RenderDevice;
use crate::matrices;
use crate::program::{
    multi_texture_bind_group, single_texture_bind_group, PackUniform, ProgramSet, SpriteUniform,
};
use crate::ring::{GpuEncodeQueue, VideoRing, MAX_GPU_QUEUE};
use crate::source::{CompositorCommand, ExternalTexture, VideoSourceControl, VideoSourceShared};
use crate::stack::TransformStack;
use crate::stage::StageSurface;
use crate::texture::{format_bpp, Texture, TextureFlags};

/// Frames in flight between stage copy and readback.
const NUM_STAGES: usize = 2;

/// Output dims within this many pixels of the canvas use the passthrough
/// scaler instead of bicubic.
const PASSTHROUGH_SLACK: u32 = 16;

#[derive(Debug, Clone)]
pub struct CompositorConfig {
    pub width: u32,
    pub height: u32,
    pub output_width: u32,
    pub output_height: u32,
    pub fps_num: u32,
    pub fps_den: u32,
    pub format: PixelFormat,
    pub color_space: ColorSpace,
    pub color_range: ColorRange,
}

impl CompositorConfig {
    fn validate(&self) -> Result<(), MixError> {
        if self.width == 0
            || self.height == 0
            || self.output_width == 0
            || self.output_height == 0
            || self.fps_num == 0
            || self.fps_den == 0
        {
            return Err(MixError::BadConfig("compositor dimensions and fps must be nonzero".into()));
        }
        if !(1..=120).contains(&(self.fps_num / self.fps_den)) {
            return Err(MixError::BadConfig(format!(
                "fps {}/{} outside 1..=120",
                self.fps_num, self.fps_den
            )));
        }
        if !self.format.is_planar_yuv() {
            return Err(MixError::BadConfig(format!(
                "output format {:?} is not a planar YUV format",
                self.format
            )));
        }
        Ok(())
    }
}

pub struct Compositor {
    cfg: CompositorConfig,
    cmd_tx: Sender<CompositorCommand>,
    ring: Arc<VideoRing>,
    gpu_queue: Arc<GpuEncodeQueue>,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    device: wgpu::Device,
    queue: wgpu::Queue,
}

impl Compositor {
    /// Spawn the render thread and block until its GPU bring-up finishes.
    pub fn start(cfg: CompositorConfig) -> Result<Self, MixError> {
        cfg.validate()?;

        let (cmd_tx, cmd_rx) = unbounded();
        let (init_tx, init_rx) = bounded(1);
        let ring = Arc::new(VideoRing::new(4));
        let gpu_queue = Arc::new(GpuEncodeQueue::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread = {
            let cfg = cfg.clone();
            let ring = Arc::clone(&ring);
            let gpu_queue = Arc::clone(&gpu_queue);
            let shutdown = Arc::clone(&shutdown);
            std::thread::Builder::new()
                .name("mixcast-render".into())
                .spawn(move || render_thread(cfg, cmd_rx, ring, gpu_queue, shutdown, init_tx))
                .map_err(|e| MixError::OutOfResources(format!("spawn render thread: {e}")))?
        };

        let (device, queue) = match init_rx.recv() {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(MixError::OutOfResources("render thread died during init".into()));
            }
        };

        log_info!(
            "compositor up: canvas {}x{}, output {}x{} {:?} @ {}/{}",
            cfg.width,
            cfg.height,
            cfg.output_width,
            cfg.output_height,
            cfg.format,
            cfg.fps_num,
            cfg.fps_den
        );

        Ok(Self {
            cfg,
            cmd_tx,
            ring,
            gpu_queue,
            shutdown,
            thread: Some(thread),
            device,
            queue,
        })
    }

    pub fn config(&self) -> &CompositorConfig {
        &self.cfg
    }

    pub fn ring(&self) -> Arc<VideoRing> {
        Arc::clone(&self.ring)
    }

    pub fn gpu_queue(&self) -> Arc<GpuEncodeQueue> {
        Arc::clone(&self.gpu_queue)
    }

    /// New video source, appended at the top of the z-order.
    pub fn create_source(&self) -> VideoSourceControl {
        VideoSourceControl::new(self.cmd_tx.clone())
    }

    /// Texture an embedder can render/upload into and publish on a source.
    pub fn create_texture(&self, width: u32, height: u32) -> Result<ExternalTexture, MixError> {
        let tex = Texture::new(
            &self.device,
            "mixcast external texture",
            width,
            height,
            wgpu::TextureFormat::Rgba8Unorm,
            TextureFlags {
                dynamic: true,
                render_target: false,
            },
        )?;
        Ok(ExternalTexture::new(Arc::new(tex), self.queue.clone()))
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.gpu_queue.close();
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for Compositor {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Render thread ─────────────────────────────────────────────────────────────

/// One plane of the conversion output: target texture + its stage set.
struct PlaneTarget {
    tex: Texture,
    stages: Vec<StageSurface>,
}

/// GPU-side content of one source.
struct GpuSource {
    /// Composited RGBA content (unpacked YUV or uploaded RGBA).
    rgba: Option<Texture>,
    /// Upload textures for planar frames, matched to the last frame.
    planes: Vec<Texture>,
    plane_key: (u32, u32, PixelFormat),
    /// Per-source unpack coefficients (frames carry their own colorimetry).
    unpack_uniform: wgpu::Buffer,
    unpack_key: Option<(ColorSpace, ColorRange)>,
    /// External texture published by the embedder, drawn directly.
    external: Option<Arc<Texture>>,
}

struct RenderCtx {
    device: wgpu::Device,
    queue: wgpu::Queue,
    programs: ProgramSet,
    canvas: Texture,
    outputs: Vec<Texture>,
    planes: Vec<PlaneTarget>,
    cfg: CompositorConfig,
}

#[allow(clippy::too_many_arguments)]
fn render_thread(
    cfg: CompositorConfig,
    cmd_rx: Receiver<CompositorCommand>,
    ring: Arc<VideoRing>,
    gpu_queue: Arc<GpuEncodeQueue>,
    shutdown: Arc<AtomicBool>,
    init_tx: Sender<Result<(wgpu::Device, wgpu::Queue), MixError>>,
) {
    let mut ctx = match init_render(&cfg) {
        Ok(ctx) => ctx,
        Err(e) => {
            let _ = init_tx.send(Err(e));
            return;
        }
    };
    let _ = init_tx.send(Ok((ctx.device.clone(), ctx.queue.clone())));

    let mut sources: Vec<Arc<VideoSourceShared>> = Vec::new();
    let mut gpu_sources: HashMap<Uuid, GpuSource> = HashMap::new();
    let mut pacer = FramePacer::new(cfg.fps_num, cfg.fps_den);
    let mut frame_index: u64 = 0;
    // (timestamp, pacer count) of the frame staged into each stage set
    let mut staged_meta: [Option<(u64, u64)>; NUM_STAGES] = [None; NUM_STAGES];
    let mut out_slot = 0usize;

    while !shutdown.load(Ordering::Relaxed) {
        let tick = pacer.wait();
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        // order mutations take effect at this frame boundary
        for cmd in cmd_rx.try_iter() {
            match cmd {
                CompositorCommand::AddSource(s) => {
                    gpu_sources.insert(s.id, new_gpu_source(&ctx.device));
                    sources.push(s);
                }
                CompositorCommand::RemoveSource(id) => {
                    sources.retain(|s| s.id != id);
                    gpu_sources.remove(&id);
                }
                CompositorCommand::MoveSource(id, movement) => {
                    if let Some(idx) = sources.iter().position(|s| s.id == id) {
                        apply_movement(&mut sources, idx, movement);
                    }
                }
            }
        }

        // rotate the output texture while texture encoders are attached
        if ring.has_texture_subscribers() && ctx.outputs.len() < MAX_GPU_QUEUE {
            grow_outputs(&mut ctx);
        }
        out_slot = (out_slot + 1) % ctx.outputs.len();

        if let Err(e) = render_frame(
            &mut ctx,
            &sources,
            &mut gpu_sources,
            tick.frame_time_ns,
            frame_index,
            out_slot,
        ) {
            log_error!("frame {frame_index} skipped: {e}");
            frame_index += 1;
            continue;
        }
        staged_meta[(frame_index % NUM_STAGES as u64) as usize] =
            Some((tick.frame_time_ns, tick.count));

        if ring.has_texture_subscribers() {
            gpu_queue.push(tick.frame_time_ns, out_slot);
        }

        // publish the frame staged one submit ago
        if frame_index >= 1 {
            let prev = ((frame_index - 1) % NUM_STAGES as u64) as usize;
            if let Some((ts, count)) = staged_meta[prev].take() {
                publish_staged(&ctx, &ring, prev, ts, count);
            }
        }

        frame_index += 1;
    }
}

fn init_render(cfg: &CompositorConfig) -> Result<RenderCtx, MixError> {
    let rd = RenderDevice::create()?;
    let programs = ProgramSet::create(&rd.device)?;

    let canvas = Texture::new(
        &rd.device,
        "mixcast canvas",
        cfg.width,
        cfg.height,
        wgpu::TextureFormat::Rgba8Unorm,
        TextureFlags {
            dynamic: false,
            render_target: true,
        },
    )?;

    let outputs = vec![create_output_texture(&rd.device, cfg, 0)?];
    let planes = create_plane_targets(&rd.device, cfg)?;

    let mut ctx = RenderCtx {
        device: rd.device,
        queue: rd.queue,
        programs,
        canvas,
        outputs,
        planes,
        cfg: cfg.clone(),
    };
    configure_pack_uniforms(&mut ctx);
    Ok(ctx)
}

fn create_output_texture(
    device: &wgpu::Device,
    cfg: &CompositorConfig,
    slot: usize,
) -> Result<Texture, MixError> {
    Texture::new(
        device,
        &format!("mixcast output {slot}"),
        cfg.output_width,
        cfg.output_height,
        wgpu::TextureFormat::Rgba8Unorm,
        TextureFlags {
            dynamic: false,
            render_target: true,
        },
    )
}

fn grow_outputs(ctx: &mut RenderCtx) {
    while ctx.outputs.len() < MAX_GPU_QUEUE {
        match create_output_texture(&ctx.device, &ctx.cfg, ctx.outputs.len()) {
            Ok(t) => ctx.outputs.push(t),
            Err(e) => {
                log_error!("output texture pool growth failed: {e}");
                break;
            }
        }
    }
}

/// (width, height, format, uses 2-tap chroma) per conversion plane.
fn plane_layout(cfg: &CompositorConfig) -> Vec<(u32, u32, wgpu::TextureFormat)> {
    let (ow, oh) = (cfg.output_width, cfg.output_height);
    match cfg.format {
        PixelFormat::I420 => vec![
            (ow, oh, wgpu::TextureFormat::R8Unorm),
            (ow / 2, oh / 2, wgpu::TextureFormat::R8Unorm),
            (ow / 2, oh / 2, wgpu::TextureFormat::R8Unorm),
        ],
        PixelFormat::Nv12 => vec![
            (ow, oh, wgpu::TextureFormat::R8Unorm),
            (ow / 2, oh / 2, wgpu::TextureFormat::Rg8Unorm),
        ],
        PixelFormat::I444 => vec![
            (ow, oh, wgpu::TextureFormat::R8Unorm),
            (ow, oh, wgpu::TextureFormat::R8Unorm),
            (ow, oh, wgpu::TextureFormat::R8Unorm),
        ],
        _ => Vec::new(),
    }
}

fn create_plane_targets(
    device: &wgpu::Device,
    cfg: &CompositorConfig,
) -> Result<Vec<PlaneTarget>, MixError> {
    plane_layout(cfg)
        .into_iter()
        .enumerate()
        .map(|(i, (w, h, fmt))| {
            let tex = Texture::new(
                device,
                &format!("mixcast plane {i}"),
                w,
                h,
                fmt,
                TextureFlags {
                    dynamic: false,
                    render_target: true,
                },
            )?;
            let stages = (0..NUM_STAGES)
                .map(|s| StageSurface::new(device, &format!("mixcast stage {i}.{s}"), w, h, format_bpp(fmt)))
                .collect();
            Ok(PlaneTarget { tex, stages })
        })
        .collect()
}

fn configure_pack_uniforms(ctx: &mut RenderCtx) {
    let rows = matrices::rgb_to_yuv(ctx.cfg.color_space, ctx.cfg.color_range);
    let chroma_texel = match ctx.cfg.format {
        PixelFormat::I444 => 0.0,
        _ => 1.0 / ctx.cfg.output_width as f32,
    };
    ctx.programs.pack_y.set_params(PackUniform::from_rows(rows, 0.0));
    ctx.programs.pack_u.set_params(PackUniform::from_rows(rows, chroma_texel));
    ctx.programs.pack_v.set_params(PackUniform::from_rows(rows, chroma_texel));
    ctx.programs.pack_uv.set_params(PackUniform::from_rows(rows, chroma_texel));
}

fn new_gpu_source(device: &wgpu::Device) -> GpuSource {
    GpuSource {
        rgba: None,
        planes: Vec::new(),
        plane_key: (0, 0, PixelFormat::Rgba),
        unpack_uniform: device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("mixcast source unpack uniform"),
            size: std::mem::size_of::<PackUniform>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        }),
        unpack_key: None,
        external: None,
    }
}

struct SourceDraw {
    view_source: Uuid,
    transform: SourceTransform,
    width: f32,
    height: f32,
    clip: Option<(f32, f32, f32, f32)>,
}

#[allow(clippy::too_many_arguments)]
fn render_frame(
    ctx: &mut RenderCtx,
    sources: &[Arc<VideoSourceShared>],
    gpu_sources: &mut HashMap<Uuid, GpuSource>,
    frame_clock_ns: u64,
    frame_index: u64,
    out_slot: usize,
) -> Result<(), MixError> {
    let mut encoder = ctx
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("mixcast frame"),
        });
    ctx.programs.arena.begin_frame();

    // ── content upload + draw snapshot ────────────────────────────────────────
    let mut draws: Vec<SourceDraw> = Vec::with_capacity(sources.len());
    for shared in sources {
        let gpu = gpu_sources.entry(shared.id).or_insert_with(|| new_gpu_source(&ctx.device));

        let (transform, enabled) = {
            let mut state = shared.state.lock();
            if state.cleared {
                gpu.rgba = None;
                gpu.external = None;
                state.cleared = false;
            }
            if let Some(ext) = state.external.clone() {
                gpu.external = Some(ext);
            }
            if let Some(image) = state.pending_image.take() {
                upload_rgba_content(ctx, gpu, &image)?;
            }
            // newest queued frame at or before the frame clock
            let mut current: Option<VideoFrame> = None;
            while let Some(front) = state.pending_frames.front() {
                if front.timestamp_ns <= frame_clock_ns {
                    current = state.pending_frames.pop_front();
                } else {
                    break;
                }
            }
            if let Some(frame) = current {
                upload_frame_content(ctx, &mut encoder, gpu, &frame)?;
            }
            (state.transform.clone(), state.enabled)
        };

        let has_content = gpu.external.is_some() || gpu.rgba.is_some();
        if !enabled || !has_content {
            continue;
        }
        let (w, h) = match (&gpu.external, &gpu.rgba) {
            (Some(ext), _) => (ext.width as f32, ext.height as f32),
            (None, Some(t)) => (t.width as f32, t.height as f32),
            _ => unreachable!(),
        };
        draws.push(SourceDraw {
            view_source: shared.id,
            clip: transform.clip_rect(),
            transform,
            width: w,
            height: h,
        });
    }

    // ── canvas pass ───────────────────────────────────────────────────────────
    let sprite_size = std::mem::size_of::<SpriteUniform>() as u64;
    let mut xform = TransformStack::new();
    let mut projection = xform.push(&mat4_ortho(ctx.cfg.width as f32, ctx.cfg.height as f32));

    let mut canvas_draws = Vec::with_capacity(draws.len());
    for draw in &draws {
        let model = draw.transform.model_matrix(draw.width, draw.height);
        let scoped = projection.push(&model);
        let uniform = SpriteUniform {
            mvp: scoped.current(),
            params: [0.0; 4],
        };
        drop(scoped);
        let Some(offset) = ctx.programs.arena.push(&ctx.queue, &uniform) else {
            log_debug!("draw uniform arena exhausted, source draw skipped");
            continue;
        };
        let gpu = &gpu_sources[&draw.view_source];
        let view = match (&gpu.external, &gpu.rgba) {
            (Some(ext), _) => &ext.view,
            (None, Some(t)) => &t.view,
            _ => continue,
        };
        let bind = single_texture_bind_group(
            &ctx.device,
            &ctx.programs.sprite,
            wgpu::BufferBinding {
                buffer: &ctx.programs.arena.buffer,
                offset: 0,
                size: wgpu::BufferSize::new(sprite_size),
            },
            view,
            &ctx.programs.sampler,
        );
        canvas_draws.push((offset, bind, draw.clip));
    }

    {
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("mixcast canvas pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &ctx.canvas.view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                    store: wgpu::StoreOp::Store,
                },
                depth_slice: None,
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
            multiview_mask: None,
        });
        pass.set_pipeline(&ctx.programs.sprite.pipeline);
        pass.set_vertex_buffer(0, ctx.programs.quad.slice(..));
        for (offset, bind, clip) in &canvas_draws {
            if let Some((x, y, w, h)) = clip {
                let (cx, cy, cw, chh) = clamp_scissor(*x, *y, *w, *h, ctx.cfg.width, ctx.cfg.height);
                if cw == 0 || chh == 0 {
                    continue;
                }
                pass.set_scissor_rect(cx, cy, cw, chh);
            } else {
                pass.set_scissor_rect(0, 0, ctx.cfg.width, ctx.cfg.height);
            }
            pass.set_bind_group(0, bind, &[*offset]);
            pass.draw(0..6, 0..1);
        }
    }

    // ── scale pass ────────────────────────────────────────────────────────────
    let output = &ctx.outputs[out_slot];
    let same_dims =
        ctx.cfg.output_width == ctx.cfg.width && ctx.cfg.output_height == ctx.cfg.height;
    if same_dims {
        output.copy_from(&mut encoder, &ctx.canvas)?;
    } else {
        let near = ctx.cfg.output_width.abs_diff(ctx.cfg.width) <= PASSTHROUGH_SLACK
            && ctx.cfg.output_height.abs_diff(ctx.cfg.height) <= PASSTHROUGH_SLACK;
        let program = if near {
            &ctx.programs.sprite
        } else {
            &ctx.programs.bicubic
        };
        let (ow, oh) = (ctx.cfg.output_width as f32, ctx.cfg.output_height as f32);
        let uniform = SpriteUniform {
            mvp: mat4_mul(&mat4_ortho(ow, oh), &mat4_scale(ow, oh)),
            params: [
                1.0 / ctx.cfg.width as f32,
                1.0 / ctx.cfg.height as f32,
                0.0,
                0.0,
            ],
        };
        let offset = ctx
            .programs
            .arena
            .push(&ctx.queue, &uniform)
            .ok_or_else(|| MixError::OutOfResources("uniform arena exhausted".into()))?;
        let bind = single_texture_bind_group(
            &ctx.device,
            program,
            wgpu::BufferBinding {
                buffer: &ctx.programs.arena.buffer,
                offset: 0,
                size: wgpu::BufferSize::new(sprite_size),
            },
            &ctx.canvas.view,
            &ctx.programs.sampler,
        );
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("mixcast scale pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &output.view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                    store: wgpu::StoreOp::Store,
                },
                depth_slice: None,
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
            multiview_mask: None,
        });
        pass.set_pipeline(&program.pipeline);
        pass.set_vertex_buffer(0, ctx.programs.quad.slice(..));
        pass.set_bind_group(0, &bind, &[offset]);
        pass.draw(0..6, 0..1);
    }

    // ── conversion passes ─────────────────────────────────────────────────────
    ctx.programs.pack_y.upload(&ctx.queue, true);
    ctx.programs.pack_u.upload(&ctx.queue, true);
    ctx.programs.pack_v.upload(&ctx.queue, true);
    ctx.programs.pack_uv.upload(&ctx.queue, true);

    let pack_size = std::mem::size_of::<PackUniform>() as u64;
    let pack_order: Vec<&crate::program::PackProgram> = match ctx.cfg.format {
        PixelFormat::I420 | PixelFormat::I444 => {
            vec![&ctx.programs.pack_y, &ctx.programs.pack_u, &ctx.programs.pack_v]
        }
        PixelFormat::Nv12 => vec![&ctx.programs.pack_y, &ctx.programs.pack_uv],
        _ => Vec::new(),
    };

    for (plane, pack) in ctx.planes.iter().zip(pack_order) {
        let bind = single_texture_bind_group(
            &ctx.device,
            &pack.program,
            wgpu::BufferBinding {
                buffer: &pack.uniform,
                offset: 0,
                size: wgpu::BufferSize::new(pack_size),
            },
            &output.view,
            &ctx.programs.sampler,
        );
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("mixcast pack pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &plane.tex.view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                    store: wgpu::StoreOp::Store,
                },
                depth_slice: None,
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
            multiview_mask: None,
        });
        pass.set_pipeline(&pack.program.pipeline);
        pass.set_vertex_buffer(0, ctx.programs.quad.slice(..));
        pass.set_bind_group(0, &bind, &[]);
        pass.draw(0..6, 0..1);
    }

    // ── stage copies ──────────────────────────────────────────────────────────
    let set = (frame_index % NUM_STAGES as u64) as usize;
    for plane in &ctx.planes {
        plane.stages[set].stage(&mut encoder, &plane.tex);
    }

    ctx.queue.submit([encoder.finish()]);
    Ok(())
}

fn clamp_scissor(x: f32, y: f32, w: f32, h: f32, max_w: u32, max_h: u32) -> (u32, u32, u32, u32) {
    let x0 = x.max(0.0) as u32;
    let y0 = y.max(0.0) as u32;
    let x1 = ((x + w).max(0.0) as u32).min(max_w);
    let y1 = ((y + h).max(0.0) as u32).min(max_h);
    (x0.min(max_w), y0.min(max_h), x1.saturating_sub(x0), y1.saturating_sub(y0))
}

/// Upload a packed RGBA image/frame into the source's content texture.
fn upload_rgba_content(
    ctx: &RenderCtx,
    gpu: &mut GpuSource,
    frame: &VideoFrame,
) -> Result<(), MixError> {
    let needs_new = gpu
        .rgba
        .as_ref()
        .map(|t| t.width != frame.width || t.height != frame.height)
        .unwrap_or(true);
    if needs_new {
        gpu.rgba = Some(Texture::new(
            &ctx.device,
            "mixcast source content",
            frame.width,
            frame.height,
            wgpu::TextureFormat::Rgba8Unorm,
            TextureFlags {
                dynamic: true,
                render_target: true,
            },
        )?);
    }
    gpu.external = None;
    gpu.rgba
        .as_ref()
        .unwrap()
        .upload(&ctx.queue, &frame.planes[0], frame.linesize[0] as u32);
    Ok(())
}

/// Upload one async frame: RGBA directly, planar YUV through plane
/// textures plus an unpack pass.
fn upload_frame_content(
    ctx: &RenderCtx,
    encoder: &mut wgpu::CommandEncoder,
    gpu: &mut GpuSource,
    frame: &VideoFrame,
) -> Result<(), MixError> {
    match frame.format {
        PixelFormat::Rgba | PixelFormat::Bgra => return upload_rgba_content(ctx, gpu, frame),
        PixelFormat::I420 | PixelFormat::Nv12 => {}
        PixelFormat::I444 => {
            return Err(MixError::BadConfig("I444 source frames are not supported".into()))
        }
    }

    // (re)create plane upload textures on geometry change
    let key = (frame.width, frame.height, frame.format);
    if gpu.plane_key != key || gpu.planes.is_empty() {
        gpu.planes.clear();
        for idx in 0..frame.format.plane_count() {
            let (pw, ph) = frame.format.plane_dims(idx, frame.width, frame.height);
            let fmt = if frame.format == PixelFormat::Nv12 && idx == 1 {
                wgpu::TextureFormat::Rg8Unorm
            } else {
                wgpu::TextureFormat::R8Unorm
            };
            gpu.planes.push(Texture::new(
                &ctx.device,
                "mixcast source plane",
                pw,
                ph,
                fmt,
                TextureFlags {
                    dynamic: true,
                    render_target: false,
                },
            )?);
        }
        gpu.plane_key = key;
    }
    for (idx, tex) in gpu.planes.iter().enumerate() {
        tex.upload(&ctx.queue, &frame.planes[idx], frame.linesize[idx] as u32);
    }

    // content texture at frame dimensions
    let needs_new = gpu
        .rgba
        .as_ref()
        .map(|t| t.width != frame.width || t.height != frame.height)
        .unwrap_or(true);
    if needs_new {
        gpu.rgba = Some(Texture::new(
            &ctx.device,
            "mixcast source content",
            frame.width,
            frame.height,
            wgpu::TextureFormat::Rgba8Unorm,
            TextureFlags {
                dynamic: false,
                render_target: true,
            },
        )?);
    }
    gpu.external = None;

    // unpack coefficients follow the frame's colorimetry
    let unpack_key = (frame.color_space, frame.color_range);
    if gpu.unpack_key != Some(unpack_key) {
        let rows = matrices::yuv_to_rgb(frame.color_space, frame.color_range);
        ctx.queue.write_buffer(
            &gpu.unpack_uniform,
            0,
            bytemuck::bytes_of(&PackUniform::from_rows(rows, 0.0)),
        );
        gpu.unpack_key = Some(unpack_key);
    }

    let program = match frame.format {
        PixelFormat::I420 => &ctx.programs.unpack_i420,
        _ => &ctx.programs.unpack_nv12,
    };
    let views: Vec<&wgpu::TextureView> = gpu.planes.iter().map(|t| &t.view).collect();
    let bind = multi_texture_bind_group(
        &ctx.device,
        &program.program,
        wgpu::BufferBinding {
            buffer: &gpu.unpack_uniform,
            offset: 0,
            size: wgpu::BufferSize::new(std::mem::size_of::<PackUniform>() as u64),
        },
        &views,
        &ctx.programs.sampler,
    );

    let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
        label: Some("mixcast unpack pass"),
        color_attachments: &[Some(wgpu::RenderPassColorAttachment {
            view: &gpu.rgba.as_ref().unwrap().view,
            resolve_target: None,
            ops: wgpu::Operations {
                load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                store: wgpu::StoreOp::Store,
            },
            depth_slice: None,
        })],
        depth_stencil_attachment: None,
        timestamp_writes: None,
        occlusion_query_set: None,
        multiview_mask: None,
    });
    pass.set_pipeline(&program.program.pipeline);
    pass.set_vertex_buffer(0, ctx.programs.quad.slice(..));
    pass.set_bind_group(0, &bind, &[]);
    pass.draw(0..6, 0..1);

    Ok(())
}

/// Map one stage set and publish its planes to the ring.
fn publish_staged(ctx: &RenderCtx, ring: &VideoRing, set: usize, ts: u64, count: u64) {
    let layout = plane_layout(&ctx.cfg);
    let alloc = || {
        let mut frame = VideoFrame {
            timestamp_ns: 0,
            planes: Vec::new(),
            linesize: Vec::new(),
            width: ctx.cfg.output_width,
            height: ctx.cfg.output_height,
            format: ctx.cfg.format,
            color_space: ctx.cfg.color_space,
            color_range: ctx.cfg.color_range,
        };
        for (plane, (_, h, _)) in ctx.planes.iter().zip(&layout) {
            let stage = &plane.stages[set];
            frame
                .planes
                .push(vec![0u8; stage.padded_bytes_per_row as usize * *h as usize]);
            frame.linesize.push(stage.padded_bytes_per_row as usize);
        }
        frame
    };

    let Some(mut slot) = ring.lock_frame(count, ts, alloc) else {
        log_debug!("video ring full, staged frame at {ts} dropped");
        return;
    };

    for (idx, plane) in ctx.planes.iter().enumerate() {
        let stage = &plane.stages[set];
        let mapped = match stage.map(&ctx.device) {
            Ok(m) => m,
            Err(e) => {
                log_debug!("stage map failed, frame at {ts} dropped: {e}");
                return;
            }
        };
        let dst = &mut slot.frame.planes[idx];
        let src = mapped.data();
        if dst.len() != src.len() {
            dst.resize(src.len(), 0);
        }
        dst.copy_from_slice(src);
        slot.frame.linesize[idx] = mapped.linesize;
    }

    ring.unlock_frame(slot);
}

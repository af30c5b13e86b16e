// crates/mixcast-render/src/source.rs
//
// Video sources as the embedder sees them.
//
// A source is CPU-side state (transform, pending content) shared with the
// compositor, which uploads content to GPU textures on the render thread.
// Content variants mirror the ingest calls: an async frame queue (decoded
// YUV/RGBA frames with timestamps), a static RGBA image, or an externally
// updated texture.
//
// Transform setters write directly — the compositor snapshots them at
// frame start. Structural changes (add / remove / z-order) go through the
// compositor's command queue instead, so the order seen by frame N is
// exactly the order that existed when frame N began; a command issued
// mid-frame lands in frame N+1.

use std::collections::VecDeque;
use std::sync::Arc;

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use uuid::Uuid;

use mixcast_core::frame::{ColorRange, ColorSpace, PixelFormat, VideoFrame};
use mixcast_core::transform::{OrderMovement, RenderBox, ScaleFit, SourceTransform};

use crate::texture::Texture;

/// Buffered async frames per source; the oldest drop first on overflow.
const MAX_PENDING_FRAMES: usize = 16;

/// A texture the embedder renders into from outside the compositor.
/// Uploads are queue operations and safe from any thread.
#[derive(Clone)]
pub struct ExternalTexture {
    pub(crate) tex: Arc<Texture>,
    queue: wgpu::Queue,
}

impl ExternalTexture {
    pub(crate) fn new(tex: Arc<Texture>, queue: wgpu::Queue) -> Self {
        Self { tex, queue }
    }

    pub fn width(&self) -> u32 {
        self.tex.width
    }

    pub fn height(&self) -> u32 {
        self.tex.height
    }

    /// Replace the texture contents with tightly packed RGBA.
    pub fn upload_rgba(&self, data: &[u8]) {
        self.tex.upload(&self.queue, data, self.tex.width * 4);
    }
}

pub(crate) struct VideoSourceState {
    pub transform: SourceTransform,
    pub enabled: bool,
    pub pending_frames: VecDeque<VideoFrame>,
    pub pending_image: Option<VideoFrame>,
    pub external: Option<Arc<Texture>>,
    /// Set by clear_video(); the compositor drops the GPU content.
    pub cleared: bool,
}

pub(crate) struct VideoSourceShared {
    pub id: Uuid,
    pub state: Mutex<VideoSourceState>,
}

pub(crate) enum CompositorCommand {
    AddSource(Arc<VideoSourceShared>),
    RemoveSource(Uuid),
    MoveSource(Uuid, OrderMovement),
}

/// The embedder's handle to one video source. Cloneable; dropping the last
/// clone does not remove the source — removal is explicit.
#[derive(Clone)]
pub struct VideoSourceControl {
    pub(crate) shared: Arc<VideoSourceShared>,
    pub(crate) cmd_tx: Sender<CompositorCommand>,
}

impl VideoSourceControl {
    pub(crate) fn new(cmd_tx: Sender<CompositorCommand>) -> Self {
        let shared = Arc::new(VideoSourceShared {
            id: Uuid::new_v4(),
            state: Mutex::new(VideoSourceState {
                transform: SourceTransform::default(),
                enabled: true,
                pending_frames: VecDeque::new(),
                pending_image: None,
                external: None,
                cleared: false,
            }),
        });
        let _ = cmd_tx.send(CompositorCommand::AddSource(Arc::clone(&shared)));
        Self { shared, cmd_tx }
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Queue one decoded frame. Frame timestamps must be monotone; the
    /// compositor shows the newest frame at or before its frame clock.
    pub fn output_video_frame(
        &self,
        planes: Vec<Vec<u8>>,
        linesize: Vec<usize>,
        width: u32,
        height: u32,
        format: PixelFormat,
        color_range: ColorRange,
        color_space: ColorSpace,
        timestamp_ns: u64,
    ) {
        let frame = VideoFrame {
            timestamp_ns,
            planes,
            linesize,
            width,
            height,
            format,
            color_space,
            color_range,
        };
        let mut state = self.shared.state.lock();
        state.pending_image = None;
        state.external = None;
        if state.pending_frames.len() >= MAX_PENDING_FRAMES {
            state.pending_frames.pop_front();
        }
        state.pending_frames.push_back(frame);
    }

    /// Replace the source content with a static RGBA image.
    pub fn output_video_image(&self, rgba: Vec<u8>, width: u32, height: u32) {
        let mut frame = VideoFrame::alloc(0, 0, PixelFormat::Rgba);
        frame.planes = vec![rgba];
        frame.linesize = vec![width as usize * 4];
        frame.width = width;
        frame.height = height;

        let mut state = self.shared.state.lock();
        state.pending_image = Some(frame);
        state.external = None;
        state.pending_frames.clear();
    }

    /// Publish an externally managed texture as the source content.
    pub fn output_video_texture(&self, texture: &ExternalTexture) {
        let mut state = self.shared.state.lock();
        state.external = Some(Arc::clone(&texture.tex));
        state.pending_image = None;
        state.pending_frames.clear();
    }

    /// Drop the current content; the source renders nothing until new
    /// content arrives.
    pub fn clear_video(&self) {
        let mut state = self.shared.state.lock();
        state.pending_frames.clear();
        state.pending_image = None;
        state.external = None;
        state.cleared = true;
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.shared.state.lock().enabled = enabled;
    }

    pub fn set_position(&self, x: f32, y: f32) {
        self.shared.state.lock().transform.pos = (x, y);
    }

    pub fn set_scale(&self, sx: f32, sy: f32) {
        self.shared.state.lock().transform.scale = (sx, sy);
    }

    pub fn set_rotation(&self, degrees: f32) {
        self.shared.state.lock().transform.rotation_deg = degrees;
    }

    pub fn set_flip(&self, horizontal: bool, vertical: bool) {
        let mut state = self.shared.state.lock();
        state.transform.flip_h = horizontal;
        state.transform.flip_v = vertical;
    }

    pub fn set_render_box(&self, x: f32, y: f32, width: f32, height: f32, fit: ScaleFit) {
        self.shared.state.lock().transform.render_box = Some(RenderBox {
            x,
            y,
            width,
            height,
            fit,
        });
    }

    pub fn clear_render_box(&self) {
        self.shared.state.lock().transform.render_box = None;
    }

    /// Move this source in the z-order. Takes effect at the next frame.
    pub fn set_order(&self, movement: OrderMovement) {
        let _ = self
            .cmd_tx
            .send(CompositorCommand::MoveSource(self.shared.id, movement));
    }

    /// Remove the source from the compositor at the next frame boundary.
    pub fn remove(&self) {
        let _ = self
            .cmd_tx
            .send(CompositorCommand::RemoveSource(self.shared.id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn frame_queue_drops_oldest_on_overflow() {
        let (tx, _rx) = unbounded();
        let src = VideoSourceControl::new(tx);
        for i in 0..(MAX_PENDING_FRAMES + 4) as u64 {
            src.output_video_frame(
                vec![vec![0u8; 4]],
                vec![4],
                1,
                1,
                PixelFormat::Rgba,
                ColorRange::Default,
                ColorSpace::Default,
                i * 1000,
            );
        }
        let state = src.shared.state.lock();
        assert_eq!(state.pending_frames.len(), MAX_PENDING_FRAMES);
        assert_eq!(state.pending_frames.front().unwrap().timestamp_ns, 4000);
    }

    #[test]
    fn content_variants_are_exclusive() {
        let (tx, _rx) = unbounded();
        let src = VideoSourceControl::new(tx);
        src.output_video_frame(
            vec![vec![0u8; 4]],
            vec![4],
            1,
            1,
            PixelFormat::Rgba,
            ColorRange::Default,
            ColorSpace::Default,
            0,
        );
        src.output_video_image(vec![0u8; 4], 1, 1);
        {
            let state = src.shared.state.lock();
            assert!(state.pending_frames.is_empty());
            assert!(state.pending_image.is_some());
        }
        src.clear_video();
        let state = src.shared.state.lock();
        assert!(state.pending_image.is_none());
        assert!(state.cleared);
    }
}

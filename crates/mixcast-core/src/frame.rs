// crates/mixcast-core/src/frame.rs
//
// Raw video and audio frames as they travel between the compositor, the
// frame rings, and the encoders. Plain data — the GPU texture path hands
// (timestamp, texture-slot) pairs around separately and never goes through
// these types.

/// Samples per audio mixer tick, per channel. AAC consumes exactly this.
pub const AUDIO_OUTPUT_FRAMES: usize = 1024;

/// Logical audio buses. The pipeline runs one mix; the packet model keeps
/// the index so multi-mix encoders stay representable.
pub const MAX_AUDIO_MIXES: usize = 2;

/// Upper bound on planes in any frame format.
pub const MAX_AV_PLANES: usize = 8;

// ── Video ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelFormat {
    /// Planar 4:2:0 — Y full, U and V half/half.
    #[default]
    I420,
    /// Semi-planar 4:2:0 — Y full, interleaved UV half/half.
    Nv12,
    /// Planar 4:4:4 — Y, U, V all full resolution.
    I444,
    Rgba,
    Bgra,
}

impl PixelFormat {
    pub fn plane_count(self) -> usize {
        match self {
            PixelFormat::I420 | PixelFormat::I444 => 3,
            PixelFormat::Nv12 => 2,
            PixelFormat::Rgba | PixelFormat::Bgra => 1,
        }
    }

    pub fn is_planar_yuv(self) -> bool {
        matches!(self, PixelFormat::I420 | PixelFormat::Nv12 | PixelFormat::I444)
    }

    /// (width divisor, height divisor) of the chroma planes.
    pub fn chroma_subsampling(self) -> (u32, u32) {
        match self {
            PixelFormat::I420 | PixelFormat::Nv12 => (2, 2),
            _ => (1, 1),
        }
    }

    /// Byte size of plane `idx` for a `w × h` frame with a tight stride.
    ///
    /// ```
    /// use mixcast_core::frame::PixelFormat;
    /// assert_eq!(PixelFormat::I420.plane_size(0, 1280, 720), 1280 * 720);
    /// assert_eq!(PixelFormat::I420.plane_size(1, 1280, 720), 640 * 360);
    /// assert_eq!(PixelFormat::Nv12.plane_size(1, 1280, 720), 1280 * 360);
    /// assert_eq!(PixelFormat::Rgba.plane_size(0, 16, 16), 16 * 16 * 4);
    /// ```
    pub fn plane_size(self, idx: usize, w: u32, h: u32) -> usize {
        let (lw, lh) = self.plane_dims(idx, w, h);
        lw as usize * lh as usize * self.plane_bpp(idx)
    }

    /// Pixel dimensions of plane `idx`.
    pub fn plane_dims(self, idx: usize, w: u32, h: u32) -> (u32, u32) {
        let (cw, ch) = self.chroma_subsampling();
        match (self, idx) {
            (_, 0) => (w, h),
            (PixelFormat::Nv12, 1) => (w / cw, h / ch),
            (_, _) => (w / cw, h / ch),
        }
    }

    /// Bytes per pixel of plane `idx`.
    pub fn plane_bpp(self, idx: usize) -> usize {
        match (self, idx) {
            (PixelFormat::Rgba | PixelFormat::Bgra, _) => 4,
            (PixelFormat::Nv12, 1) => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorSpace {
    /// Resolves to BT.601.
    #[default]
    Default,
    Bt601,
    Bt709,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorRange {
    /// Resolves to partial (16–235 luma).
    #[default]
    Default,
    Partial,
    Full,
}

/// One CPU video frame. Planes are tightly owned; `linesize[i]` is the byte
/// stride of plane `i` (may exceed the visible width on readback frames,
/// where rows carry GPU copy alignment padding).
#[derive(Clone)]
pub struct VideoFrame {
    pub timestamp_ns: u64,
    pub planes: Vec<Vec<u8>>,
    pub linesize: Vec<usize>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub color_space: ColorSpace,
    pub color_range: ColorRange,
}

impl VideoFrame {
    /// Allocate a zeroed frame with tight strides.
    pub fn alloc(width: u32, height: u32, format: PixelFormat) -> Self {
        let mut planes = Vec::with_capacity(format.plane_count());
        let mut linesize = Vec::with_capacity(format.plane_count());
        for idx in 0..format.plane_count() {
            let (pw, _) = format.plane_dims(idx, width, height);
            planes.push(vec![0u8; format.plane_size(idx, width, height)]);
            linesize.push(pw as usize * format.plane_bpp(idx));
        }
        Self {
            timestamp_ns: 0,
            planes,
            linesize,
            width,
            height,
            format,
            color_space: ColorSpace::Default,
            color_range: ColorRange::Default,
        }
    }
}

// ── Audio ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AudioFormat {
    /// 32-bit float, one plane per channel — the mixer's canonical format.
    #[default]
    F32Planar,
    F32,
    S16Planar,
    S16,
}

impl AudioFormat {
    pub fn is_planar(self) -> bool {
        matches!(self, AudioFormat::F32Planar | AudioFormat::S16Planar)
    }

    pub fn bytes_per_sample(self) -> usize {
        match self {
            AudioFormat::F32Planar | AudioFormat::F32 => 4,
            AudioFormat::S16Planar | AudioFormat::S16 => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpeakerLayout {
    Mono,
    #[default]
    Stereo,
}

impl SpeakerLayout {
    pub fn channels(self) -> usize {
        match self {
            SpeakerLayout::Mono => 1,
            SpeakerLayout::Stereo => 2,
        }
    }
}

/// One chunk of PCM. Planar formats carry one plane per channel;
/// interleaved formats a single plane.
#[derive(Clone)]
pub struct AudioFrame {
    pub timestamp_ns: u64,
    pub planes: Vec<Vec<u8>>,
    /// Samples per channel.
    pub frames: usize,
    pub format: AudioFormat,
    pub layout: SpeakerLayout,
    pub sample_rate: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn i420_plane_layout() {
        let f = VideoFrame::alloc(1920, 1080, PixelFormat::I420);
        assert_eq!(f.planes.len(), 3);
        assert_eq!(f.planes[0].len(), 1920 * 1080);
        assert_eq!(f.planes[1].len(), 960 * 540);
        assert_eq!(f.planes[2].len(), 960 * 540);
        assert_eq!(f.linesize, vec![1920, 960, 960]);
    }

    #[test]
    fn nv12_interleaved_chroma() {
        let f = VideoFrame::alloc(1280, 720, PixelFormat::Nv12);
        assert_eq!(f.planes.len(), 2);
        assert_eq!(f.planes[1].len(), 640 * 360 * 2);
        assert_eq!(f.linesize[1], 1280);
    }

    #[test]
    fn i444_full_resolution_chroma() {
        let f = VideoFrame::alloc(64, 64, PixelFormat::I444);
        assert!(f.planes.iter().all(|p| p.len() == 64 * 64));
    }
}

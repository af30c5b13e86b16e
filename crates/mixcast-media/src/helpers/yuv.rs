// crates/mixcast-media/src/helpers/yuv.rs
//
// Plane copies between mixcast VideoFrames and ffmpeg AVFrames.
//
// Both sides are strided: readback frames carry GPU row alignment padding,
// and ffmpeg frames carry libavcodec's own alignment. Rows are copied
// individually at the visible width, so padding never crosses the
// boundary in either direction.

use ffmpeg_the_third as ffmpeg;
use ffmpeg::util::frame::video::Video as FfVideoFrame;

use mixcast_core::frame::VideoFrame;

/// Copy every plane of `src` into `dst`, which must already be allocated
/// with the same pixel format and dimensions.
pub fn copy_into_ff_frame(src: &VideoFrame, dst: &mut FfVideoFrame) {
    for (idx, plane) in src.planes.iter().enumerate() {
        let (pw, ph) = src.format.plane_dims(idx, src.width, src.height);
        let row_bytes = pw as usize * src.format.plane_bpp(idx);
        let src_stride = src.linesize[idx];
        let dst_stride = dst.stride(idx);
        let dst_data = dst.data_mut(idx);

        for row in 0..ph as usize {
            let s = row * src_stride;
            let d = row * dst_stride;
            dst_data[d..d + row_bytes].copy_from_slice(&plane[s..s + row_bytes]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ffmpeg::format::Pixel;
    use mixcast_core::frame::PixelFormat;

    #[test]
    fn strided_copy_drops_padding() {
        // 4×2 Y plane with an 8-byte stride: rows are [r, r, r, r, pad…]
        let mut frame = VideoFrame::alloc(4, 2, PixelFormat::I420);
        frame.planes[0] = vec![
            1, 2, 3, 4, 99, 99, 99, 99, //
            5, 6, 7, 8, 99, 99, 99, 99,
        ];
        frame.linesize[0] = 8;
        frame.planes[1] = vec![10, 11];
        frame.planes[2] = vec![20, 21];
        frame.linesize[1] = 2;
        frame.linesize[2] = 2;

        let mut ff = FfVideoFrame::new(Pixel::YUV420P, 4, 2);
        copy_into_ff_frame(&frame, &mut ff);

        let stride = ff.stride(0);
        assert_eq!(&ff.data(0)[..4], &[1, 2, 3, 4]);
        assert_eq!(&ff.data(0)[stride..stride + 4], &[5, 6, 7, 8]);
        assert_eq!(&ff.data(1)[..2], &[10, 11]);
        assert_eq!(&ff.data(2)[..2], &[20, 21]);
    }
}

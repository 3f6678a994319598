//! Pixel layout conversions between packed RGBA and planar I420.
//!
//! Both directions use BT.601 limited range, the matrix encoders assume for
//! untagged 8-bit input.

use yuvutils_rs::{
    BufferStoreMut, YuvConversionMode, YuvPlanarImage, YuvPlanarImageMut, YuvRange, YuvStandardMatrix,
};

use crate::source::frame::{FrameError, PlanarFrame};

const RANGE: YuvRange = YuvRange::Limited;
const MATRIX: YuvStandardMatrix = YuvStandardMatrix::Bt601;

/// Fill `frame` from a tightly packed RGBA buffer of the same size
pub fn rgba_to_i420(rgba: &[u8], frame: &mut PlanarFrame) -> Result<(), FrameError> {
    let (width, height) = (frame.width(), frame.height());
    let expected = width as usize * height as usize * 4;
    if rgba.len() != expected {
        return Err(FrameError::SizeMismatch {
            expected,
            actual: rgba.len(),
        });
    }

    let chroma_stride = frame.chroma_width();
    let (y, u, v) = frame.planes_mut();
    let mut planar = YuvPlanarImageMut {
        y_plane: BufferStoreMut::Borrowed(y),
        y_stride: width,
        u_plane: BufferStoreMut::Borrowed(u),
        u_stride: chroma_stride,
        v_plane: BufferStoreMut::Borrowed(v),
        v_stride: chroma_stride,
        width,
        height,
    };
    yuvutils_rs::rgba_to_yuv420(&mut planar, rgba, width * 4, RANGE, MATRIX, YuvConversionMode::Balanced)
        .map_err(|e| FrameError::Conversion(e.to_string()))
}

/// Expand a frame into packed RGBA with opaque alpha
pub fn i420_to_rgba(frame: &PlanarFrame) -> Result<Vec<u8>, FrameError> {
    let (width, height) = (frame.width(), frame.height());
    let chroma_stride = frame.chroma_width();
    let planar = YuvPlanarImage {
        y_plane: frame.y(),
        y_stride: width,
        u_plane: frame.u(),
        u_stride: chroma_stride,
        v_plane: frame.v(),
        v_stride: chroma_stride,
        width,
        height,
    };
    let mut rgba = vec![0; width as usize * height as usize * 4];
    yuvutils_rs::yuv420_to_rgba(&planar, &mut rgba, width * 4, RANGE, MATRIX)
        .map_err(|e| FrameError::Conversion(e.to_string()))?;
    Ok(rgba)
}

/// Copy `width` x `height` samples between planes with independent strides
pub fn copy_plane(
    src: &[u8],
    src_stride: usize,
    dst: &mut [u8],
    dst_stride: usize,
    width: usize,
    height: usize,
) {
    for row in 0..height {
        let from = &src[row * src_stride..row * src_stride + width];
        dst[row * dst_stride..row * dst_stride + width].copy_from_slice(from);
    }
}

/// Nearest-neighbour resample of one plane into a tightly packed destination
pub fn scale_plane(
    src: &[u8],
    src_stride: usize,
    src_width: usize,
    src_height: usize,
    dst: &mut [u8],
    dst_width: usize,
    dst_height: usize,
) {
    if src_width == 0 || src_height == 0 {
        dst.fill(0);
        return;
    }
    for row in 0..dst_height {
        let src_row = row * src_height / dst_height;
        let line = &src[src_row * src_stride..src_row * src_stride + src_width];
        for col in 0..dst_width {
            dst[row * dst_width + col] = line[col * src_width / dst_width];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_near(actual: &[u8], expected: u8) {
        for sample in actual {
            assert!(sample.abs_diff(expected) <= 1, "{actual:?} vs {expected}");
        }
    }

    #[test]
    fn black_and_white_map_to_limited_range() {
        let mut frame = PlanarFrame::new(2, 2).unwrap();
        rgba_to_i420(&[0, 0, 0, 255].repeat(4), &mut frame).unwrap();
        assert_near(frame.y(), 16);
        assert_near(frame.u(), 128);
        assert_near(frame.v(), 128);

        rgba_to_i420(&[255, 255, 255, 255].repeat(4), &mut frame).unwrap();
        assert_near(frame.y(), 235);
        assert_near(frame.u(), 128);
        assert_near(frame.v(), 128);
    }

    #[test]
    fn rgba_size_must_match_frame() {
        let mut frame = PlanarFrame::new(2, 2).unwrap();
        assert_eq!(
            rgba_to_i420(&[0; 12], &mut frame),
            Err(FrameError::SizeMismatch { expected: 16, actual: 12 })
        );
    }

    #[test]
    fn grey_survives_a_round_trip() {
        let mut frame = PlanarFrame::new(4, 4).unwrap();
        rgba_to_i420(&[128, 128, 128, 255].repeat(16), &mut frame).unwrap();
        let rgba = i420_to_rgba(&frame).unwrap();
        assert_eq!(rgba.len(), 64);
        for pixel in rgba.chunks_exact(4) {
            for channel in &pixel[..3] {
                assert!(channel.abs_diff(128) <= 2, "{pixel:?}");
            }
            assert_eq!(pixel[3], 255);
        }
    }

    #[test]
    fn saturated_red_keeps_its_hue() {
        let mut frame = PlanarFrame::new(2, 2).unwrap();
        rgba_to_i420(&[255, 0, 0, 255].repeat(4), &mut frame).unwrap();
        assert!(frame.v()[0] > 200, "{:?}", frame.v());
        assert!(frame.u()[0] < 128, "{:?}", frame.u());

        let rgba = i420_to_rgba(&frame).unwrap();
        for pixel in rgba.chunks_exact(4) {
            assert!(pixel[0] > 240 && pixel[1] < 16 && pixel[2] < 16, "{pixel:?}");
        }
    }

    #[test]
    fn copy_plane_drops_stride_padding() {
        let src = [1, 2, 0, 0, 3, 4, 0, 0];
        let mut dst = [9; 4];
        copy_plane(&src, 4, &mut dst, 2, 2, 2);
        assert_eq!(dst, [1, 2, 3, 4]);
    }

    #[test]
    fn scale_plane_doubles_each_sample() {
        let src = [1, 2, 3, 4];
        let mut dst = [0; 16];
        scale_plane(&src, 2, 2, 2, &mut dst, 4, 4);
        assert_eq!(dst, [1, 1, 2, 2, 1, 1, 2, 2, 3, 3, 4, 4, 3, 3, 4, 4]);
    }
}

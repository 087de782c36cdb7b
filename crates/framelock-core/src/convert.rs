//! Pixel normalization into the canonical presentation format.
//!
//! Every frame handed to a presenter is tightly packed RGBA. YUV input uses
//! BT.601 limited-range integer coefficients.

use crate::video::{CpuFrame, PixelFormat, Plane, VideoError};

/// Converts `frame` into tightly packed [`PixelFormat::CANONICAL`].
///
/// Already-canonical frames with no row padding are returned unchanged.
pub fn to_canonical(frame: CpuFrame) -> Result<CpuFrame, VideoError> {
    let width = frame.width as usize;
    let height = frame.height as usize;
    check_planes(&frame)?;

    let packed_stride = width * 4;
    let pixels = match frame.format {
        PixelFormat::Rgba => {
            if frame.planes[0].stride == packed_stride {
                return Ok(frame);
            }
            repack(&frame.planes[0], width, height, |src, dst| {
                dst.copy_from_slice(src);
            })
        }
        PixelFormat::Bgra => repack(&frame.planes[0], width, height, |src, dst| {
            dst.copy_from_slice(&[src[2], src[1], src[0], src[3]]);
        }),
        PixelFormat::Rgb24 => {
            let plane = &frame.planes[0];
            let mut out = Vec::with_capacity(packed_stride * height);
            for y in 0..height {
                let row = &plane.data[y * plane.stride..y * plane.stride + width * 3];
                for px in row.chunks_exact(3) {
                    out.extend_from_slice(&[px[0], px[1], px[2], 255]);
                }
            }
            out
        }
        PixelFormat::Yuv420p => {
            let (y, u, v) = (&frame.planes[0], &frame.planes[1], &frame.planes[2]);
            yuv_to_rgba(width, height, |col, row| {
                let c = (row / 2) * u.stride + col / 2;
                (
                    y.data[row * y.stride + col],
                    u.data[c],
                    v.data[(row / 2) * v.stride + col / 2],
                )
            })
        }
        PixelFormat::Nv12 => {
            let (y, uv) = (&frame.planes[0], &frame.planes[1]);
            yuv_to_rgba(width, height, |col, row| {
                let c = (row / 2) * uv.stride + (col / 2) * 2;
                (y.data[row * y.stride + col], uv.data[c], uv.data[c + 1])
            })
        }
    };

    Ok(CpuFrame::new(
        PixelFormat::CANONICAL,
        frame.width,
        frame.height,
        vec![Plane {
            data: pixels,
            stride: packed_stride,
        }],
    ))
}

fn check_planes(frame: &CpuFrame) -> Result<(), VideoError> {
    let width = frame.width as usize;
    let height = frame.height as usize;
    if frame.planes.len() < frame.format.num_planes() {
        return Err(VideoError::UnsupportedFormat(format!(
            "{:?} frame has {} planes",
            frame.format,
            frame.planes.len()
        )));
    }

    let chroma_w = width.div_ceil(2);
    let chroma_h = height.div_ceil(2);
    let required: Vec<(usize, usize)> = match frame.format {
        PixelFormat::Rgba | PixelFormat::Bgra => vec![(width * 4, height)],
        PixelFormat::Rgb24 => vec![(width * 3, height)],
        PixelFormat::Yuv420p => vec![(width, height), (chroma_w, chroma_h), (chroma_w, chroma_h)],
        PixelFormat::Nv12 => vec![(width, height), (chroma_w * 2, chroma_h)],
    };

    for (i, (row_bytes, rows)) in required.into_iter().enumerate() {
        let plane = &frame.planes[i];
        let needed = if rows == 0 {
            0
        } else {
            plane.stride * (rows - 1) + row_bytes
        };
        if plane.stride < row_bytes || plane.data.len() < needed {
            return Err(VideoError::UnsupportedFormat(format!(
                "{:?} plane {i} too small: stride {} len {} (need {needed})",
                frame.format,
                plane.stride,
                plane.data.len()
            )));
        }
    }
    Ok(())
}

fn repack(
    plane: &Plane,
    width: usize,
    height: usize,
    mut pixel: impl FnMut(&[u8], &mut [u8]),
) -> Vec<u8> {
    let mut out = vec![0u8; width * height * 4];
    for y in 0..height {
        let src = &plane.data[y * plane.stride..y * plane.stride + width * 4];
        let dst = &mut out[y * width * 4..(y + 1) * width * 4];
        for (s, d) in src.chunks_exact(4).zip(dst.chunks_exact_mut(4)) {
            pixel(s, d);
        }
    }
    out
}

fn yuv_to_rgba(width: usize, height: usize, sample: impl Fn(usize, usize) -> (u8, u8, u8)) -> Vec<u8> {
    let mut out = Vec::with_capacity(width * height * 4);
    for row in 0..height {
        for col in 0..width {
            let (y, u, v) = sample(col, row);
            let c = (y as i32 - 16).max(0) * 298;
            let d = u as i32 - 128;
            let e = v as i32 - 128;
            let r = (c + 409 * e + 128) >> 8;
            let g = (c - 100 * d - 208 * e + 128) >> 8;
            let b = (c + 516 * d + 128) >> 8;
            out.extend_from_slice(&[clamp_u8(r), clamp_u8(g), clamp_u8(b), 255]);
        }
    }
    out
}

#[inline]
fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nv12(width: u32, height: u32, luma: u8) -> CpuFrame {
        let w = width as usize;
        let h = height as usize;
        CpuFrame::new(
            PixelFormat::Nv12,
            width,
            height,
            vec![
                Plane {
                    data: vec![luma; w * h],
                    stride: w,
                },
                Plane {
                    data: vec![128; w.div_ceil(2) * 2 * h.div_ceil(2)],
                    stride: w.div_ceil(2) * 2,
                },
            ],
        )
    }

    #[test]
    fn test_nv12_grey_converts_to_grey() {
        let Ok(out) = to_canonical(nv12(4, 2, 235)) else {
            panic!("conversion failed");
        };
        assert_eq!(out.format, PixelFormat::Rgba);
        assert_eq!(out.planes[0].stride, 16);
        assert_eq!(&out.planes[0].data[0..4], &[255, 255, 255, 255]);

        let Ok(black) = to_canonical(nv12(2, 2, 16)) else {
            panic!("conversion failed");
        };
        assert_eq!(&black.planes[0].data[0..4], &[0, 0, 0, 255]);
    }

    #[test]
    fn test_yuv420p_odd_dimensions() {
        let frame = CpuFrame::new(
            PixelFormat::Yuv420p,
            3,
            3,
            vec![
                Plane { data: vec![128; 9], stride: 3 },
                Plane { data: vec![128; 4], stride: 2 },
                Plane { data: vec![128; 4], stride: 2 },
            ],
        );
        let Ok(out) = to_canonical(frame) else {
            panic!("conversion failed");
        };
        assert_eq!(out.planes[0].data.len(), 3 * 3 * 4);
    }

    #[test]
    fn test_bgra_swaps_channels_and_drops_padding() {
        let frame = CpuFrame::new(
            PixelFormat::Bgra,
            1,
            2,
            vec![Plane {
                data: vec![1, 2, 3, 4, 0, 0, 0, 0, 5, 6, 7, 8],
                stride: 8,
            }],
        );
        let Ok(out) = to_canonical(frame) else {
            panic!("conversion failed");
        };
        assert_eq!(out.planes[0].data, vec![3, 2, 1, 4, 7, 6, 5, 8]);
    }

    #[test]
    fn test_packed_rgba_is_passthrough() {
        let frame = CpuFrame::new(
            PixelFormat::Rgba,
            1,
            1,
            vec![Plane { data: vec![9, 8, 7, 6], stride: 4 }],
        );
        let Ok(out) = to_canonical(frame.clone()) else {
            panic!("conversion failed");
        };
        assert_eq!(out, frame);
    }

    #[test]
    fn test_short_plane_is_rejected() {
        let frame = CpuFrame::new(
            PixelFormat::Rgb24,
            4,
            4,
            vec![Plane { data: vec![0; 10], stride: 12 }],
        );
        assert!(matches!(
            to_canonical(frame),
            Err(VideoError::UnsupportedFormat(_))
        ));
    }
}

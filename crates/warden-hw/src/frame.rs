//! Raw buffer → RGB conversion and dark-frame detection.

use image::{ImageFormat, RgbImage};

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("MJPG decode failed: {0}")]
    Decode(String),
}

/// Convert packed YUYV (4:2:2) to RGB using BT.601 coefficients.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share U/V.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for chunk in yuyv[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&ycbcr_to_rgb(y0, u, v));
        rgb.extend_from_slice(&ycbcr_to_rgb(y1, u, v));
    }

    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidLength {
        expected,
        actual: yuyv.len(),
    })
}

fn ycbcr_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = y as f32;
    let cb = u as f32 - 128.0;
    let cr = v as f32 - 128.0;
    let r = y + 1.402 * cr;
    let g = y - 0.344_136 * cb - 0.714_136 * cr;
    let b = y + 1.772 * cb;
    [clamp_u8(r), clamp_u8(g), clamp_u8(b)]
}

fn clamp_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

/// Replicate 8-bit grey into three channels.
pub fn grey_to_rgb(grey: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let pixels = (width * height) as usize;
    if grey.len() < pixels {
        return Err(FrameError::InvalidLength {
            expected: pixels,
            actual: grey.len(),
        });
    }
    let rgb = grey[..pixels].iter().flat_map(|&p| [p, p, p]).collect();
    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidLength {
        expected: pixels,
        actual: grey.len(),
    })
}

/// Decode one MJPG buffer (a complete JPEG image).
pub fn mjpg_to_rgb(jpeg: &[u8]) -> Result<RgbImage, FrameError> {
    image::load_from_memory_with_format(jpeg, ImageFormat::Jpeg)
        .map(|img| img.to_rgb8())
        .map_err(|e| FrameError::Decode(e.to_string()))
}

/// Returns true if more than `threshold_pct` of pixels have luma below 32.
pub fn is_dark_frame(frame: &RgbImage, threshold_pct: f32) -> bool {
    let total = frame.width() as usize * frame.height() as usize;
    if total == 0 {
        return true;
    }
    let dark = frame
        .pixels()
        .filter(|p| {
            let [r, g, b] = p.0;
            let luma = 0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32;
            luma < 32.0
        })
        .count();
    (dark as f32 / total as f32) > threshold_pct
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use std::io::Cursor;

    #[test]
    fn test_yuyv_neutral_chroma_is_grey() {
        // 2x1 image: [Y0=100, U=128, Y1=200, V=128]
        let img = yuyv_to_rgb(&[100, 128, 200, 128], 2, 1).unwrap();
        assert_eq!(img.get_pixel(0, 0), &Rgb([100, 100, 100]));
        assert_eq!(img.get_pixel(1, 0), &Rgb([200, 200, 200]));
    }

    #[test]
    fn test_yuyv_red_chroma() {
        // Strong Cr pushes red up and green down.
        let img = yuyv_to_rgb(&[100, 128, 100, 228], 2, 1).unwrap();
        let Rgb([r, g, b]) = *img.get_pixel(0, 0);
        assert!(r > 200 && g < 50 && b == 100, "got {r} {g} {b}");
    }

    #[test]
    fn test_yuyv_invalid_length() {
        assert!(yuyv_to_rgb(&[100, 128], 2, 1).is_err());
    }

    #[test]
    fn test_grey_to_rgb() {
        let img = grey_to_rgb(&[0, 50, 255, 7], 2, 2).unwrap();
        assert_eq!(img.get_pixel(1, 0), &Rgb([50, 50, 50]));
        assert_eq!(img.get_pixel(1, 1), &Rgb([7, 7, 7]));
        assert!(grey_to_rgb(&[1, 2], 2, 2).is_err());
    }

    #[test]
    fn test_mjpg_roundtrip_dimensions() {
        let src = RgbImage::from_pixel(8, 6, Rgb([120, 60, 30]));
        let mut jpeg = Cursor::new(Vec::new());
        src.write_to(&mut jpeg, ImageFormat::Jpeg).unwrap();
        let img = mjpg_to_rgb(jpeg.get_ref()).unwrap();
        assert_eq!(img.dimensions(), (8, 6));
        assert!(mjpg_to_rgb(b"\xff\xd8garbage").is_err());
    }

    #[test]
    fn test_dark_frame_all_black() {
        assert!(is_dark_frame(&RgbImage::new(10, 10), 0.95));
    }

    #[test]
    fn test_dark_frame_normal() {
        assert!(!is_dark_frame(&RgbImage::from_pixel(10, 10, Rgb([128, 128, 128])), 0.95));
    }

    #[test]
    fn test_dark_frame_borderline_bright() {
        // 94% dark, 6% bright → not dark
        let mut img = RgbImage::from_pixel(100, 10, Rgb([10, 10, 10]));
        for x in 0..60 {
            img.put_pixel(x % 100, 9 - (x / 100), Rgb([128, 128, 128]));
        }
        assert!(!is_dark_frame(&img, 0.95));
    }

    #[test]
    fn test_dark_frame_empty() {
        assert!(is_dark_frame(&RgbImage::new(0, 0), 0.95));
    }
}

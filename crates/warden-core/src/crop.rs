//! Square face crop around the detected face.
//!
//! The crop is centred on the bounding rectangle of the anchor points
//! (face box corners and landmarks), enlarged by a relative margin, clamped
//! to the frame and resized to the embedder's square input.

use image::imageops::{self, FilterType};
use image::RgbImage;
use thiserror::Error;

pub const DEFAULT_CROP_MARGIN: f32 = 0.2;
pub const DEFAULT_CROP_SIZE: u32 = 160;

#[derive(Error, Debug, PartialEq)]
pub enum CropConfigError {
    #[error("crop size must be at least 1 pixel")]
    ZeroSize,
    #[error("crop margin must be finite and greater than -1, got {0}")]
    InvalidMargin(f32),
}

/// Crop parameters supplied at startup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CropConfig {
    /// Extra side length as a fraction of the larger anchor-box dimension.
    pub margin: f32,
    /// Output side length in pixels.
    pub size: u32,
}

impl Default for CropConfig {
    fn default() -> Self {
        Self {
            margin: DEFAULT_CROP_MARGIN,
            size: DEFAULT_CROP_SIZE,
        }
    }
}

impl CropConfig {
    /// Reject settings that would yield empty crops for every face.
    pub fn validate(&self) -> Result<(), CropConfigError> {
        if self.size == 0 {
            return Err(CropConfigError::ZeroSize);
        }
        if !self.margin.is_finite() || self.margin <= -1.0 {
            return Err(CropConfigError::InvalidMargin(self.margin));
        }
        Ok(())
    }
}

/// Pixel region inside a frame, already clamped to its bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Compute the square crop region for a set of anchor points.
///
/// The anchor rectangle uses integer pixel coordinates with inclusive
/// extent, so a single point has a 1×1 rectangle. Returns `None` when the
/// clamped region is empty (face entirely outside the frame).
pub fn square_region(
    points: &[(f32, f32)],
    frame_width: u32,
    frame_height: u32,
    margin: f32,
) -> Option<CropRegion> {
    if points.is_empty() || frame_width == 0 || frame_height == 0 {
        return None;
    }

    let xs = points.iter().map(|p| p.0.floor() as i64);
    let ys = points.iter().map(|p| p.1.floor() as i64);
    let (min_x, max_x) = xs.fold((i64::MAX, i64::MIN), |(lo, hi), v| (lo.min(v), hi.max(v)));
    let (min_y, max_y) = ys.fold((i64::MAX, i64::MIN), |(lo, hi), v| (lo.min(v), hi.max(v)));

    let w = (max_x - min_x + 1) as f32;
    let h = (max_y - min_y + 1) as f32;
    let cx = min_x as f32 + w / 2.0;
    let cy = min_y as f32 + h / 2.0;
    let side = (w.max(h) * (1.0 + margin)) as i64;

    let x1 = (cx - side as f32 / 2.0) as i64;
    let y1 = (cy - side as f32 / 2.0) as i64;
    let x2 = (x1 + side).min(frame_width as i64);
    let y2 = (y1 + side).min(frame_height as i64);
    let x1 = x1.max(0);
    let y1 = y1.max(0);

    if x2 <= x1 || y2 <= y1 {
        return None;
    }

    Some(CropRegion {
        x: x1 as u32,
        y: y1 as u32,
        width: (x2 - x1) as u32,
        height: (y2 - y1) as u32,
    })
}

/// Crop the face around `points` and resize it to `config.size` square.
pub fn crop_face(frame: &RgbImage, points: &[(f32, f32)], config: &CropConfig) -> Option<RgbImage> {
    let region = square_region(points, frame.width(), frame.height(), config.margin)?;
    let face = imageops::crop_imm(frame, region.x, region.y, region.width, region.height).to_image();
    Some(imageops::resize(&face, config.size, config.size, FilterType::Triangle))
}

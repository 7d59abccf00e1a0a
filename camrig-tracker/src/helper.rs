//! Frame orientation helpers.
//!
//! Cameras may be mounted sideways or upside down; `rotation_count` records
//! how many clockwise quarter turns bring a frame upright. Trackers detect
//! on the upright image and report coordinates in the raw frame, so the two
//! mappings here must stay exact inverses of each other.

use image::{GrayImage, RgbImage};
use nalgebra::Point2;

/// Rotate a frame upright by `rotation_count` clockwise quarter turns.
/// Negative counts rotate counter-clockwise.
pub fn apply_rotation(frame: &RgbImage, rotation_count: i8) -> RgbImage {
    match rotation_count.rem_euclid(4) {
        1 => image::imageops::rotate90(frame),
        2 => image::imageops::rotate180(frame),
        3 => image::imageops::rotate270(frame),
        _ => frame.clone(),
    }
}

/// Map a point detected on the rotated (upright) frame back into raw-frame
/// coordinates. `raw_size` is the (width, height) of the unrotated frame.
pub fn unrotate_point(
    p: Point2<f64>,
    rotation_count: i8,
    raw_size: (u32, u32),
) -> Point2<f64> {
    let (w, h) = (raw_size.0 as f64, raw_size.1 as f64);
    match rotation_count.rem_euclid(4) {
        // upright = rotate90(raw): raw (x, y) -> upright (h - 1 - y, x)
        1 => Point2::new(p.y, h - 1.0 - p.x),
        2 => Point2::new(w - 1.0 - p.x, h - 1.0 - p.y),
        // upright = rotate270(raw): raw (x, y) -> upright (y, w - 1 - x)
        3 => Point2::new(w - 1.0 - p.y, p.x),
        _ => p,
    }
}

/// Luma conversion of an RGB frame.
pub fn grayscale_of(frame: &RgbImage) -> GrayImage {
    image::imageops::grayscale(frame)
}

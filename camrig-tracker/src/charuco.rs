use std::sync::Arc;

use image::{GrayImage, RgbImage};
use nalgebra::{Point2, Vector3};

use camrig_board::BoardSpec;
use camrig_mvg::homography_dlt;
use camrig_types::{DrawInstructions, PointPacket, Port, Tracker};

use crate::helper::{apply_rotation, grayscale_of, unrotate_point};
use crate::subpix::refine_corner;

/// One fiducial marker found on a frame: dictionary id plus its corner quad
/// in image pixels, (tl, tr, br, bl) order.
#[derive(Debug, Clone)]
pub struct DetectedMarker {
    pub id: u32,
    pub corners: [Point2<f64>; 4],
}

/// External fiducial detector collaborator.
///
/// Quad extraction and dictionary decoding live outside the core, behind
/// this trait; the charuco tracker owns everything around it (orientation,
/// inversion, the mirrored retry, interpolation, refinement). Detectors must
/// be deterministic for identical images.
pub trait MarkerDetector: Send + Sync {
    fn detect_markers(&self, gray: &GrayImage) -> Vec<DetectedMarker>;
}

/// Tracks the interior corners of a charuco board.
///
/// Detection contract, per frame: convert to grayscale, invert if the board
/// is printed inverted, detect markers; with fewer than 4 markers flip the
/// image horizontally and retry, undoing the x-flip on anything found.
/// Marker corner correspondences seed a board-to-image homography; each
/// interior corner is projected through it and refined to sub-pixel accuracy
/// on the gray image. Returns an empty packet rather than failing.
pub struct CharucoTracker {
    board: BoardSpec,
    detector: Arc<dyn MarkerDetector>,
    half_window: u32,
    max_iterations: u32,
    eps: f64,
}

impl CharucoTracker {
    pub fn new(board: BoardSpec, detector: Arc<dyn MarkerDetector>) -> Self {
        Self {
            board,
            detector,
            // 11x11 convolution window, 30 iterations, 0.001 epsilon: the
            // original's cv2.cornerSubPix criteria
            half_window: 5,
            max_iterations: 30,
            eps: 1e-3,
        }
    }

    pub fn board(&self) -> &BoardSpec {
        &self.board
    }

    fn detect_with_mirror(&self, gray: &GrayImage) -> Option<(GrayImage, Vec<DetectedMarker>, bool)> {
        let markers = self.detector.detect_markers(gray);
        if markers.len() >= 4 {
            return Some((gray.clone(), markers, false));
        }
        // A board held up to a mirror-mode webcam reads back-to-front;
        // retry on the horizontally flipped image.
        let flipped = image::imageops::flip_horizontal(gray);
        let markers = self.detector.detect_markers(&flipped);
        if markers.len() >= 4 {
            tracing::debug!("charuco markers found on mirrored image");
            return Some((flipped, markers, true));
        }
        None
    }
}

impl Tracker for CharucoTracker {
    fn detect(&self, frame: &RgbImage, _port: Port, rotation_count: i8) -> PointPacket {
        let upright = apply_rotation(frame, rotation_count);
        let mut gray = grayscale_of(&upright);
        if self.board.inverted() {
            for px in gray.pixels_mut() {
                px.0[0] = 255 - px.0[0];
            }
        }

        let Some((gray, markers, mirrored)) = self.detect_with_mirror(&gray) else {
            return PointPacket::empty();
        };

        // board-to-image correspondences from every decoded marker corner
        let mut board_pts = Vec::with_capacity(markers.len() * 4);
        let mut img_pts = Vec::with_capacity(markers.len() * 4);
        for marker in &markers {
            let Some(quad) = self.board.marker_corners(marker.id) else {
                // id from some other board or a misread; skip it
                continue;
            };
            for (b, i) in quad.iter().zip(marker.corners.iter()) {
                board_pts.push(Point2::new(b.x, b.y));
                img_pts.push(*i);
            }
        }

        let Ok(h) = homography_dlt(&board_pts, &img_pts) else {
            return PointPacket::empty();
        };

        let (gw, gh) = gray.dimensions();
        let mut point_ids = Vec::new();
        let mut img_loc = Vec::new();
        for id in 0..self.board.corner_count() {
            let obj = self
                .board
                .object_corner(id)
                .expect("id ranges over corner_count");
            let v = h * Vector3::new(obj.x, obj.y, 1.0);
            if v.z.abs() < 1e-12 {
                continue;
            }
            let seed = Point2::new(v.x / v.z, v.y / v.z);
            let margin = self.half_window as f64 + 2.0;
            if seed.x < margin
                || seed.y < margin
                || seed.x > gw as f64 - margin
                || seed.y > gh as f64 - margin
            {
                continue;
            }
            let refined =
                refine_corner(&gray, seed, self.half_window, self.max_iterations, self.eps);

            let mut p = refined;
            if mirrored {
                p.x = gw as f64 - 1.0 - p.x;
            }
            let raw = unrotate_point(p, rotation_count, frame.dimensions());
            point_ids.push(id);
            img_loc.push(raw);
        }

        let obj_loc = Some(self.board.object_corners(&point_ids));
        match PointPacket::new(point_ids, img_loc, obj_loc) {
            Ok(packet) => packet,
            Err(_) => PointPacket::empty(),
        }
    }

    fn name(&self) -> &str {
        "charuco"
    }

    fn connected_points(&self) -> Vec<(u32, u32)> {
        self.board.connected_corners()
    }

    fn point_name(&self, point_id: u32) -> String {
        format!("corner_{point_id}")
    }

    fn draw_instructions(&self, _point_id: u32) -> DrawInstructions {
        DrawInstructions {
            radius: 5,
            color: (220, 0, 0),
            thickness: 3,
        }
    }
}

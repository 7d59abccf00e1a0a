use std::sync::Arc;

use image::RgbImage;
use nalgebra::Point2;

use camrig_types::{DrawInstructions, PointPacket, Port, Tracker};

use crate::charuco::MarkerDetector;
use crate::helper::{apply_rotation, grayscale_of, unrotate_point};

/// Tracks bare fiducial markers, one point per marker at its quad center.
///
/// Unlike the charuco tracker there is no board geometry, so `obj_loc` is
/// never populated; this tracker is for motion capture of tagged objects,
/// not for calibration.
pub struct ArucoTracker {
    detector: Arc<dyn MarkerDetector>,
}

impl ArucoTracker {
    pub fn new(detector: Arc<dyn MarkerDetector>) -> Self {
        Self { detector }
    }
}

impl Tracker for ArucoTracker {
    fn detect(&self, frame: &RgbImage, _port: Port, rotation_count: i8) -> PointPacket {
        let upright = apply_rotation(frame, rotation_count);
        let gray = grayscale_of(&upright);

        let markers = self.detector.detect_markers(&gray);
        let mut point_ids = Vec::with_capacity(markers.len());
        let mut img_loc = Vec::with_capacity(markers.len());
        for marker in markers {
            let center = Point2::new(
                marker.corners.iter().map(|c| c.x).sum::<f64>() / 4.0,
                marker.corners.iter().map(|c| c.y).sum::<f64>() / 4.0,
            );
            point_ids.push(marker.id);
            img_loc.push(unrotate_point(center, rotation_count, frame.dimensions()));
        }

        PointPacket::new(point_ids, img_loc, None).unwrap_or_else(|_| PointPacket::empty())
    }

    fn name(&self) -> &str {
        "aruco"
    }

    fn point_name(&self, point_id: u32) -> String {
        format!("marker_{point_id}")
    }

    fn draw_instructions(&self, _point_id: u32) -> DrawInstructions {
        DrawInstructions {
            radius: 4,
            color: (0, 180, 0),
            thickness: 2,
        }
    }
}

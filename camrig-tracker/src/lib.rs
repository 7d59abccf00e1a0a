//! Landmark trackers.
//!
//! A [`Tracker`](camrig_types::Tracker) turns a frame into a
//! [`PointPacket`](camrig_types::PointPacket). The charuco tracker here is
//! the one the calibration pipeline depends on; it orchestrates grayscale
//! conversion, board inversion, the mirrored-image retry, corner
//! interpolation and sub-pixel refinement around an external fiducial
//! detector (quad finding and dictionary decoding are not reimplemented
//! here, the same way video decoding is left to the demuxer).

mod helper;
pub use helper::{apply_rotation, grayscale_of, unrotate_point};

mod subpix;
pub use subpix::refine_corner;

mod charuco;
pub use charuco::{CharucoTracker, DetectedMarker, MarkerDetector};

mod aruco;
pub use aruco::ArucoTracker;

//! Camera geometry and multi-view geometry for the camrig pipeline.
//!
//! This crate provides the calibrated-camera model ([`CameraData`]), the
//! globally consistent camera set ([`CameraArray`]) with its pairwise-pose
//! composition ([`CameraArrayBuilder`]), planar calibration-target geometry
//! (homographies, Zhang-style intrinsic initialization, pose recovery), and
//! DLT triangulation.
//!
//! Camera modeling is built on [`cam-geom`](https://crates.io/crates/cam-geom)
//! with OpenCV-compatible lens distortion from
//! [`opencv-ros-camera`](https://crates.io/crates/opencv-ros-camera).
//!
//! ## Coordinate conventions
//!
//! - World frame: shared 3D frame, defined by the anchor camera.
//! - Camera frame: X right, Y down, Z along the optical axis.
//! - Extrinsics are stored world-to-camera: `x_cam = R * x_world + t`.

use thiserror::Error;

use camrig_types::Port;

#[derive(Error, Debug)]
pub enum MvgError {
    #[error("not enough points")]
    NotEnoughPoints,
    #[error("SVD failed")]
    SvdFailed,
    #[error("camera {0} has no extrinsics")]
    MissingExtrinsics(Port),
    #[error("unknown camera port {0}")]
    UnknownCamera(Port),
    #[error("degenerate geometry: {0}")]
    DegenerateGeometry(&'static str),
    #[error("camera pair graph is disconnected; isolated ports: {isolated:?}")]
    DisconnectedCameraGraph { isolated: Vec<Port> },
    #[error("no stereo pair poses to build an array from")]
    NoPairPoses,
}

pub type Result<T> = std::result::Result<T, MvgError>;

mod camera;
pub use camera::{CamExtrinsics, CameraData, UndistortOutput};

mod planar;
pub use planar::{homography_dlt, intrinsics_from_homographies, pose_from_homography};

mod triangulate;
pub use triangulate::{stereo_triangulate, triangulate_dlt};

mod array;
pub use array::{CameraArray, CameraArrayBuilder, PairPose};

#[cfg(test)]
pub(crate) mod test_support {
    use nalgebra::{Matrix3, Point3, Vector3, Vector5};

    use super::*;

    /// A pair of cameras with a 0.5 m baseline, 1000 px focal length and
    /// 1280x720 resolution, both looking down +Z.
    pub fn stereo_rig() -> (CameraData, CameraData) {
        let mut cam_a = CameraData::new(0, (1280, 720), 0);
        cam_a.set_intrinsics_from_params(1000.0, 1000.0, 640.0, 360.0, Vector5::zeros());
        cam_a.extrinsics = Some(CamExtrinsics::identity());

        let mut cam_b = CameraData::new(1, (1280, 720), 0);
        cam_b.set_intrinsics_from_params(1000.0, 1000.0, 640.0, 360.0, Vector5::zeros());
        // camera B sits 0.5 m to the right of camera A, same orientation:
        // world-to-camera translation is -0.5 on x.
        cam_b.extrinsics = Some(CamExtrinsics {
            rotation: Matrix3::identity(),
            translation: Vector3::new(-0.5, 0.0, 0.0),
        });
        (cam_a, cam_b)
    }

    /// A 10x10 grid of 3D points in front of the rig.
    pub fn world_grid() -> Vec<Point3<f64>> {
        let mut pts = Vec::new();
        for i in 0..10 {
            for j in 0..10 {
                pts.push(Point3::new(
                    -0.3 + i as f64 * 0.07,
                    -0.2 + j as f64 * 0.05,
                    2.0 + ((i * j) % 7) as f64 * 0.03,
                ));
            }
        }
        pts
    }
}

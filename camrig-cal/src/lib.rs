//! Camera calibration from accumulated board views.
//!
//! Two stages live here. The [`IntrinsicCalibrator`] estimates each camera's
//! focal length, principal point and lens distortion independently from its
//! own stream of board views. The [`StereoCalibrator`] then estimates the
//! relative pose of every camera pair from the views they share, with the
//! intrinsics held fixed. Both initialize from planar homography geometry
//! and refine by Levenberg-Marquardt on reprojection residuals.

use camrig_types::Port;

#[derive(thiserror::Error, Debug)]
pub enum CalError {
    #[error(
        "insufficient observations for port {port}: {usable} usable board views, need {needed}"
    )]
    InsufficientObservations {
        port: Port,
        usable: usize,
        needed: usize,
    },
    #[error(
        "insufficient observations for pair {pair:?}: {accumulated} accumulated grids, need {needed}"
    )]
    InsufficientPairObservations {
        pair: (Port, Port),
        accumulated: usize,
        needed: usize,
    },
    #[error("geometry error: {source}")]
    Mvg {
        #[from]
        source: camrig_mvg::MvgError,
    },
}

pub type Result<T> = std::result::Result<T, CalError>;

mod distortion;

mod mono;
pub use mono::IntrinsicCalibrator;

mod stereo_points;
pub use stereo_points::StereoPointsBuilder;

mod stereo;
pub use stereo::StereoCalibrator;

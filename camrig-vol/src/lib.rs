//! The capture volume: every camera pose and every triangulated landmark,
//! refined together.
//!
//! [`PointEstimates`] is the flat, indexed representation bundle adjustment
//! operates on; it is built once per calibration run by
//! [`build_point_estimates`] and then mutated in place. [`CaptureVolume`]
//! owns it together with the camera array and drives optimization; the
//! [`QualityController`] measures reprojection quality, filters outliers and
//! re-optimizes.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VolError {
    #[error("inconsistent point estimates: {0}")]
    Inconsistent(&'static str),
    #[error("camera array has no anchor; run the array builder first")]
    NoAnchor,
    #[error("no observations available")]
    NoObservations,
    #[error("no board points visible at sync index {0}")]
    NoBoardAtSyncIndex(u64),
    #[error("geometry error: {source}")]
    Mvg {
        #[from]
        source: camrig_mvg::MvgError,
    },
    #[error("bundle adjustment error: {source}")]
    BundleAdj {
        #[from]
        source: camrig_bundle_adj::Error,
    },
}

pub type Result<T> = std::result::Result<T, VolError>;

mod point_estimates;
pub use point_estimates::PointEstimates;

mod builder;
pub use builder::build_point_estimates;

mod capture_volume;
pub use capture_volume::CaptureVolume;

mod quality;
pub use quality::{DistanceError, ObservationQuality, QualityController};

//! Recording-session orchestration.
//!
//! A session is a directory of recorded videos (`port_{N}.mp4`), an optional
//! frame-time history, and a `config.toml` carrying the board description
//! and every calibration artifact. This crate wires the pipeline together:
//! streams → synchronizer → tracking pass → intrinsic calibration → pairwise
//! stereo → camera array → point estimates → bundle adjustment → quality
//! filtering → tabular exports.

use camrig_types::Port;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("no video file for port {0}")]
    MissingVideo(Port),
    #[error("no ports discovered in session directory")]
    NoPorts,
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("CSV error: {source}")]
    Csv {
        #[from]
        source: csv::Error,
    },
    #[error("TOML deserialization error: {source}")]
    TomlDe {
        #[from]
        source: toml::de::Error,
    },
    #[error("TOML serialization error: {source}")]
    TomlSer {
        #[from]
        source: toml::ser::Error,
    },
    #[error("stream error: {source}")]
    Stream {
        #[from]
        source: camrig_stream::StreamError,
    },
    #[error("calibration error: {source}")]
    Cal {
        #[from]
        source: camrig_cal::CalError,
    },
    #[error("geometry error: {source}")]
    Mvg {
        #[from]
        source: camrig_mvg::MvgError,
    },
    #[error("capture volume error: {source}")]
    Vol {
        #[from]
        source: camrig_vol::VolError,
    },
}

pub type Result<T> = std::result::Result<T, SessionError>;

mod config;
pub use config::{CameraConfig, CaptureVolumeConfig, CharucoConfig, Config, StereoPairConfig};

mod export;
pub use export::{write_trc, write_xy_csv, write_xyz_csv, write_xyz_wide_csv, XyzRow};

mod triangulator;
pub use triangulator::triangulate_sync_packet;

mod session;
pub use session::{AutoPopSettings, Session, TrackingPass};

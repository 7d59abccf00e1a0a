use std::path::Path;

use image::RgbImage;

use camrig_types::Port;

use crate::Result;

/// The decoding capability a recorded stream needs from a video file.
///
/// Decoding itself (codec, container) is an external collaborator; the core
/// only ever opens a file, seeks by frame index, reads frames sequentially
/// and queries fps and frame count. A stream exclusively owns its source for
/// its whole life; nothing else may touch the underlying file meanwhile.
pub trait VideoSource: Send {
    /// Source frame rate as encoded in the container.
    fn fps(&self) -> f64;

    /// Total number of frames.
    fn frame_count(&self) -> u64;

    /// Decode the next frame, or `None` when the source is exhausted.
    fn read_frame(&mut self) -> Option<RgbImage>;

    /// Position the read cursor so the next [`Self::read_frame`] returns
    /// `frame_index`.
    fn seek(&mut self, frame_index: u64) -> Result<()>;
}

/// Opens video sources for ports, given the recording naming convention
/// (`port_{N}.mp4` in a recording directory).
pub trait VideoSourceFactory: Send + Sync {
    fn open(&self, path: &Path, port: Port) -> Result<Box<dyn VideoSource>>;
}

//! In-memory video sources for tests, demos and dry runs.

use image::RgbImage;

use crate::{Result, StreamError, VideoSource};

/// A video source that serves identical solid-color frames at a fixed rate.
pub struct SyntheticVideoSource {
    fps: f64,
    frame_count: u64,
    size: (u32, u32),
    cursor: u64,
}

impl SyntheticVideoSource {
    pub fn new(fps: f64, frame_count: u64, size: (u32, u32)) -> Self {
        Self {
            fps,
            frame_count,
            size,
            cursor: 0,
        }
    }
}

impl VideoSource for SyntheticVideoSource {
    fn fps(&self) -> f64 {
        self.fps
    }

    fn frame_count(&self) -> u64 {
        self.frame_count
    }

    fn read_frame(&mut self) -> Option<RgbImage> {
        if self.cursor >= self.frame_count {
            return None;
        }
        self.cursor += 1;
        Some(RgbImage::from_pixel(
            self.size.0,
            self.size.1,
            image::Rgb([40, 40, 40]),
        ))
    }

    fn seek(&mut self, frame_index: u64) -> Result<()> {
        if frame_index >= self.frame_count {
            return Err(StreamError::SeekOutOfRange(frame_index));
        }
        self.cursor = frame_index;
        Ok(())
    }
}

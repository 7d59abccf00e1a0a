//! Recorded video streams and the frame synchronizer.
//!
//! One [`RecordedStream`] per video file plays frames onto subscriber
//! channels at a configurable cadence; the [`Synchronizer`] consumes one
//! channel per port and regroups the frames into temporally coherent
//! [`SyncPacket`](camrig_types::SyncPacket)s. Channels are the only
//! synchronization primitive crossing component boundaries; end-of-stream is
//! signaled in-band by sentinel packets and cancellation by cooperative stop
//! flags.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("stream is already playing")]
    AlreadyPlaying,
    #[error("seek to frame {0} outside the source")]
    SeekOutOfRange(u64),
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
}

pub type Result<T> = std::result::Result<T, StreamError>;

mod video;
pub use video::{VideoSource, VideoSourceFactory};

pub mod synthetic;

mod history;
pub use history::FrameTimeHistory;

mod stream;
pub use stream::RecordedStream;

mod synchronizer;
pub use synchronizer::{Synchronizer, DROPPED_FRAME_TRACK_WINDOW};

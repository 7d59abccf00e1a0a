//! Frame-time history: the authoritative per-frame timestamps of a
//! recording.
//!
//! Recordings made in real time start their streams at different wall
//! times; the persisted `{port, frame_index, frame_time}` table makes the
//! sync indices of a later playback comparable across recordings. When the
//! table is absent, timestamps are fabricated assuming constant inter-frame
//! spacing at the source fps.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use camrig_types::Port;

use crate::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct FrameTimeRow {
    port: Port,
    frame_index: i64,
    frame_time: f64,
}

/// Per-port frame timestamps, indexed by frame index.
#[derive(Debug, Clone, Default)]
pub struct FrameTimeHistory {
    by_port: BTreeMap<Port, BTreeMap<i64, f64>>,
}

impl FrameTimeHistory {
    /// Load the persisted comma-separated table.
    pub fn load(path: &Path) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)?;
        let mut by_port: BTreeMap<Port, BTreeMap<i64, f64>> = BTreeMap::new();
        for row in reader.deserialize() {
            let row: FrameTimeRow = row?;
            by_port
                .entry(row.port)
                .or_default()
                .insert(row.frame_index, row.frame_time);
        }
        Ok(Self { by_port })
    }

    /// Fabricate a history for one port: `frame_time = frame_index / fps`.
    pub fn synthesize(port: Port, frame_count: u64, fps: f64) -> Self {
        let mut times = BTreeMap::new();
        for i in 0..frame_count as i64 {
            times.insert(i, i as f64 / fps);
        }
        let mut by_port = BTreeMap::new();
        by_port.insert(port, times);
        Self { by_port }
    }

    /// Insert or replace one port's timestamps.
    pub fn set_port_times(&mut self, port: Port, times: impl IntoIterator<Item = (i64, f64)>) {
        self.by_port.insert(port, times.into_iter().collect());
    }

    pub fn frame_time(&self, port: Port, frame_index: i64) -> Option<f64> {
        self.by_port.get(&port)?.get(&frame_index).copied()
    }

    pub fn has_port(&self, port: Port) -> bool {
        self.by_port.contains_key(&port)
    }

    pub fn first_frame_index(&self, port: Port) -> Option<i64> {
        self.by_port.get(&port)?.keys().next().copied()
    }

    pub fn last_frame_index(&self, port: Port) -> Option<i64> {
        self.by_port.get(&port)?.keys().next_back().copied()
    }

    /// Write the table back out, rows ordered by (port, frame_index).
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for (port, times) in &self.by_port {
            for (frame_index, frame_time) in times {
                writer.serialize(FrameTimeRow {
                    port: *port,
                    frame_index: *frame_index,
                    frame_time: *frame_time,
                })?;
            }
        }
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthesized_history_spaces_frames_evenly() {
        let h = FrameTimeHistory::synthesize(2, 5, 25.0);
        assert_eq!(h.frame_time(2, 0), Some(0.0));
        assert_eq!(h.frame_time(2, 3), Some(0.12));
        assert_eq!(h.frame_time(2, 5), None);
        assert_eq!(h.last_frame_index(2), Some(4));
        assert!(!h.has_port(0));
    }

    #[test]
    fn csv_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame_time_history.csv");

        let mut h = FrameTimeHistory::default();
        h.set_port_times(0, [(0, 0.01), (1, 0.043)]);
        h.set_port_times(1, [(0, 0.02)]);
        h.save(&path).unwrap();

        let loaded = FrameTimeHistory::load(&path).unwrap();
        assert_eq!(loaded.frame_time(0, 1), Some(0.043));
        assert_eq!(loaded.frame_time(1, 0), Some(0.02));
        assert_eq!(loaded.first_frame_index(0), Some(0));
    }
}

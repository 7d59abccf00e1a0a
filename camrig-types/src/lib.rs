//! Core data types flowing through the camrig capture pipeline.
//!
//! The capture pipeline moves data through three packet layers:
//!
//! - [`PointPacket`]: the 2D landmarks a [`Tracker`] found on a single frame.
//! - [`FramePacket`]: one decoded frame from one port, with optional points.
//! - [`SyncPacket`]: the best temporal alignment of frame packets across all
//!   ports at one synchronization index.
//!
//! Sync indices are assigned exclusively by the synchronizer; no other
//! component may invent them.

use std::collections::BTreeMap;
use std::sync::Arc;

use image::RgbImage;
use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};

/// Camera port identifier.
///
/// Ports are small dense integers (one per video file / camera), so they are
/// also used directly as indices during optimization.
pub type Port = u8;

/// The in-band end-of-stream marker carried in [`FramePacket::frame_time`].
pub const EOS_FRAME_TIME: f64 = -1.0;

#[derive(thiserror::Error, Debug)]
pub enum TypesError {
    #[error("point packet arrays disagree in length: {ids} ids, {img} image points")]
    MismatchedPointArrays { ids: usize, img: usize },
    #[error("object locations present but wrong length: {obj} for {ids} ids")]
    MismatchedObjectArray { obj: usize, ids: usize },
}

pub type Result<T> = std::result::Result<T, TypesError>;

/// 2D landmark observations produced by a [`Tracker`] for one frame.
///
/// `obj_loc` is populated only by trackers whose landmarks have a known
/// position in an object frame of reference (the charuco tracker); it is the
/// board-frame coordinate of each corner and is consumed by the intrinsic and
/// stereo calibrators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointPacket {
    pub point_ids: Vec<u32>,
    pub img_loc: Vec<Point2<f64>>,
    pub obj_loc: Option<Vec<Point3<f64>>>,
}

impl PointPacket {
    /// Create a new packet, checking that all arrays share a leading dimension.
    pub fn new(
        point_ids: Vec<u32>,
        img_loc: Vec<Point2<f64>>,
        obj_loc: Option<Vec<Point3<f64>>>,
    ) -> Result<Self> {
        if point_ids.len() != img_loc.len() {
            return Err(TypesError::MismatchedPointArrays {
                ids: point_ids.len(),
                img: img_loc.len(),
            });
        }
        if let Some(obj) = &obj_loc {
            if obj.len() != point_ids.len() {
                return Err(TypesError::MismatchedObjectArray {
                    obj: obj.len(),
                    ids: point_ids.len(),
                });
            }
        }
        Ok(Self {
            point_ids,
            img_loc,
            obj_loc,
        })
    }

    pub fn empty() -> Self {
        Self {
            point_ids: Vec::new(),
            img_loc: Vec::new(),
            obj_loc: None,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.point_ids.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.point_ids.is_empty()
    }

    /// Index of `point_id` within this packet, if present.
    pub fn position(&self, point_id: u32) -> Option<usize> {
        self.point_ids.iter().position(|id| *id == point_id)
    }
}

/// One decoded frame from one port.
///
/// Within a port, frame packets are emitted in strictly increasing
/// `(frame_index, frame_time)` order. The frame payload is reference-counted
/// so that a single decode can be fanned out to many subscriber queues.
#[derive(Debug, Clone)]
pub struct FramePacket {
    pub port: Port,
    pub frame_index: i64,
    /// Seconds, monotonic within a port. `-1.0` marks end of stream.
    pub frame_time: f64,
    pub frame: Option<Arc<RgbImage>>,
    pub points: Option<PointPacket>,
}

impl FramePacket {
    /// The sentinel emitted once when a stream's source is exhausted.
    pub fn end_of_stream(port: Port, frame_index: i64) -> Self {
        Self {
            port,
            frame_index,
            frame_time: EOS_FRAME_TIME,
            frame: None,
            points: None,
        }
    }

    #[inline]
    pub fn is_end_of_stream(&self) -> bool {
        self.frame_time == EOS_FRAME_TIME
    }
}

/// The best-aligned frames across all ports at one sync index.
///
/// For each port the entry is either `None` (the port had no frame close
/// enough in time; a "dropped" frame) or a packet whose timestamp lies within
/// one inter-frame interval of every other non-`None` packet here.
#[derive(Debug, Clone)]
pub struct SyncPacket {
    pub sync_index: u64,
    pub frame_packets: BTreeMap<Port, Option<FramePacket>>,
}

impl SyncPacket {
    pub fn new(sync_index: u64, frame_packets: BTreeMap<Port, Option<FramePacket>>) -> Self {
        Self {
            sync_index,
            frame_packets,
        }
    }

    /// Per-port dropped flag for this sync index.
    pub fn dropped(&self) -> BTreeMap<Port, bool> {
        self.frame_packets
            .iter()
            .map(|(port, packet)| (*port, packet.is_none()))
            .collect()
    }

    /// Number of ports that contributed an actual frame.
    pub fn frame_packet_count(&self) -> usize {
        self.frame_packets.values().filter(|p| p.is_some()).count()
    }

    /// Flatten the per-port point data into parallel rows for triangulation:
    /// `(port, point_id, img_xy)` per observation.
    pub fn triangulation_inputs(&self) -> Vec<(Port, u32, Point2<f64>)> {
        let mut rows = Vec::new();
        for (port, packet) in &self.frame_packets {
            let Some(packet) = packet else { continue };
            let Some(points) = &packet.points else {
                continue;
            };
            for (id, xy) in points.point_ids.iter().zip(points.img_loc.iter()) {
                rows.push((*port, *id, *xy));
            }
        }
        rows
    }

    /// Mean frame time of the non-dropped packets, if any.
    pub fn mean_frame_time(&self) -> Option<f64> {
        let times: Vec<f64> = self
            .frame_packets
            .values()
            .flatten()
            .map(|p| p.frame_time)
            .collect();
        if times.is_empty() {
            None
        } else {
            Some(times.iter().sum::<f64>() / times.len() as f64)
        }
    }
}

/// The landmarks two ports saw in common at one sync index.
///
/// The three arrays agree in order: row `k` is the same semantic point in
/// both images. Produced by the stereo point builder, consumed by the stereo
/// calibrator and the stereo triangulator.
#[derive(Debug, Clone)]
pub struct StereoPointsPacket {
    pub sync_index: u64,
    pub port_a: Port,
    pub port_b: Port,
    pub common_ids: Vec<u32>,
    pub img_loc_a: Vec<Point2<f64>>,
    pub img_loc_b: Vec<Point2<f64>>,
    /// Board-frame locations of the common points when the tracker provides
    /// them (charuco); required by the stereo calibrator.
    pub obj_loc: Option<Vec<Point3<f64>>>,
}

impl StereoPointsPacket {
    #[inline]
    pub fn pair(&self) -> (Port, Port) {
        (self.port_a, self.port_b)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.common_ids.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.common_ids.is_empty()
    }
}

/// Triangulated world-frame points at one sync index.
#[derive(Debug, Clone)]
pub struct XyzPacket {
    pub sync_index: u64,
    pub point_ids: Vec<u32>,
    pub points: Vec<Point3<f64>>,
}

impl XyzPacket {
    pub fn point(&self, point_id: u32) -> Option<Point3<f64>> {
        self.point_ids
            .iter()
            .position(|id| *id == point_id)
            .map(|i| self.points[i])
    }
}

/// One observation row of the tracking pass, as persisted to
/// `xy_{tracker}.csv` and consumed by the point-estimates builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XyRow {
    pub sync_index: u64,
    pub port: Port,
    pub frame_index: i64,
    pub frame_time: f64,
    pub point_id: u32,
    pub img_loc_x: f64,
    pub img_loc_y: f64,
    pub obj_loc_x: Option<f64>,
    pub obj_loc_y: Option<f64>,
}

/// How a tracked point should be rendered on an overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawInstructions {
    pub radius: u32,
    pub color: (u8, u8, u8),
    pub thickness: u32,
}

impl Default for DrawInstructions {
    fn default() -> Self {
        Self {
            radius: 5,
            color: (0, 0, 220),
            thickness: 3,
        }
    }
}

/// A per-frame point detector.
///
/// Implementations must be deterministic given identical
/// `(frame, port, rotation_count)` inputs. A tracker that finds nothing
/// returns an empty [`PointPacket`]; detection failure is never an error.
pub trait Tracker: Send + Sync {
    /// Extract point observations from one frame.
    ///
    /// `rotation_count` is the number of quarter turns needed to display the
    /// frame upright; trackers that care about orientation rotate the image
    /// before detection and must report coordinates in the raw (unrotated)
    /// frame.
    fn detect(&self, frame: &RgbImage, port: Port, rotation_count: i8) -> PointPacket;

    /// Short name used in output artifact file names (`xy_{name}.csv`).
    fn name(&self) -> &str;

    /// Point id pairs that should be joined by a line when drawing overlays.
    /// Empty when inapplicable.
    fn connected_points(&self) -> Vec<(u32, u32)> {
        Vec::new()
    }

    /// Human-readable label for a point id, used for wide-format exports.
    fn point_name(&self, point_id: u32) -> String {
        format!("pt_{point_id}")
    }

    fn draw_instructions(&self, _point_id: u32) -> DrawInstructions {
        DrawInstructions::default()
    }
}

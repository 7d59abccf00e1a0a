//! Whole-sync-packet triangulation for motion capture output.

use std::collections::BTreeMap;

use nalgebra::Point2;

use camrig_mvg::{triangulate_dlt, CameraArray, CameraData};
use camrig_types::{Port, SyncPacket, XyzPacket};

/// Triangulate every landmark a sync packet observed from at least two
/// posed cameras.
///
/// This is the post-calibration path that turns any tracker's 2D output
/// into 3D trajectories; landmarks seen by a single camera are skipped, and
/// a packet with no reconstructable landmarks yields `None`.
pub fn triangulate_sync_packet(array: &CameraArray, packet: &SyncPacket) -> Option<XyzPacket> {
    let mut by_id: BTreeMap<u32, Vec<(Port, Point2<f64>)>> = BTreeMap::new();
    for (port, point_id, xy) in packet.triangulation_inputs() {
        let usable = array
            .cameras
            .get(&port)
            .is_some_and(|cam| !cam.ignored && cam.extrinsics.is_some());
        if usable {
            by_id.entry(point_id).or_default().push((port, xy));
        }
    }

    let mut point_ids = Vec::new();
    let mut points = Vec::new();
    for (point_id, observations) in &by_id {
        if observations.len() < 2 {
            continue;
        }
        let cams: Vec<(&CameraData, Point2<f64>)> = observations
            .iter()
            .filter_map(|(port, xy)| array.cameras.get(port).map(|cam| (cam, *xy)))
            .collect();
        match triangulate_dlt(&cams) {
            Ok(p) => {
                point_ids.push(*point_id);
                points.push(p);
            }
            Err(e) => {
                tracing::debug!(point_id, sync_index = packet.sync_index, %e, "triangulation failed");
            }
        }
    }

    if point_ids.is_empty() {
        None
    } else {
        Some(XyzPacket {
            sync_index: packet.sync_index,
            point_ids,
            points,
        })
    }
}

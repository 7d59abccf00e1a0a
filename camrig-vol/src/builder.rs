//! Assembles [`PointEstimates`] from the tracking pass.
//!
//! Every `(sync_index, point_id)` seen by at least two cameras is
//! triangulated through every port pair that observed it; the per-pair
//! reconstructions are averaged into the initial 3D estimate. Observation
//! rows store undistorted pixel coordinates so the bundle adjuster can
//! project linearly.

use std::collections::BTreeMap;

use nalgebra::{Point2, Point3, Vector3};

use camrig_cal::StereoPointsBuilder;
use camrig_mvg::{stereo_triangulate, CameraArray, UndistortOutput};
use camrig_types::{PointPacket, Port, XyRow};

use crate::{PointEstimates, Result, VolError};

/// Build the initial point estimates from the tracking-pass observation
/// rows and a camera array with composed poses.
pub fn build_point_estimates(array: &CameraArray, rows: &[XyRow]) -> Result<PointEstimates> {
    if rows.is_empty() {
        return Err(VolError::NoObservations);
    }
    if array.anchor.is_none() {
        return Err(VolError::NoAnchor);
    }

    // regroup rows into per-(sync, port) point packets
    let mut by_sync: BTreeMap<u64, BTreeMap<Port, (Vec<u32>, Vec<Point2<f64>>)>> =
        BTreeMap::new();
    for row in rows {
        if array
            .cameras
            .get(&row.port)
            .map_or(true, |cam| cam.ignored || cam.extrinsics.is_none())
        {
            continue;
        }
        let (ids, img) = by_sync
            .entry(row.sync_index)
            .or_default()
            .entry(row.port)
            .or_default();
        ids.push(row.point_id);
        img.push(Point2::new(row.img_loc_x, row.img_loc_y));
    }

    let ports: Vec<Port> = array.active_ports();
    let pair_builder = StereoPointsBuilder::new(&ports);

    // (sync_index, point_id) -> accumulated 3D estimates across pairs
    let mut triangulated: BTreeMap<(u64, u32), Vec<Point3<f64>>> = BTreeMap::new();

    for (sync_index, per_port) in &by_sync {
        let packets: BTreeMap<Port, PointPacket> = per_port
            .iter()
            .filter_map(|(port, (ids, img))| {
                PointPacket::new(ids.clone(), img.clone(), None)
                    .ok()
                    .map(|p| (*port, p))
            })
            .collect();

        for (port_a, port_b) in pair_builder.pairs() {
            let (Some(points_a), Some(points_b)) = (packets.get(port_a), packets.get(port_b))
            else {
                continue;
            };
            let Some(stereo) = pair_builder.stereo_points_packet(
                *sync_index,
                *port_a,
                points_a,
                *port_b,
                points_b,
            ) else {
                continue;
            };

            let cam_a = array.get(*port_a)?;
            let cam_b = array.get(*port_b)?;
            let Ok(xyz) = stereo_triangulate(cam_a, cam_b, &stereo.img_loc_a, &stereo.img_loc_b)
            else {
                continue;
            };
            for (id, p) in stereo.common_ids.iter().zip(xyz.iter()) {
                triangulated
                    .entry((*sync_index, *id))
                    .or_default()
                    .push(*p);
            }
        }
    }

    if triangulated.is_empty() {
        return Err(VolError::NoObservations);
    }

    // average per-pair reconstructions into one 3D point each
    let mut obj = Vec::with_capacity(triangulated.len());
    let mut obj_point_ids = Vec::with_capacity(triangulated.len());
    let mut obj_index_of: BTreeMap<(u64, u32), usize> = BTreeMap::new();
    for ((sync_index, point_id), estimates) in &triangulated {
        let sum: Vector3<f64> = estimates.iter().map(|p| p.coords).sum();
        obj_index_of.insert((*sync_index, *point_id), obj.len());
        obj.push(Point3::from(sum / estimates.len() as f64));
        obj_point_ids.push(*point_id);
    }

    // observation rows, restricted to landmarks that got a 3D estimate
    let mut estimates = PointEstimates {
        sync_indices: Vec::new(),
        camera_indices: Vec::new(),
        point_ids: Vec::new(),
        img: Vec::new(),
        obj_indices: Vec::new(),
        obj,
        obj_point_ids,
    };
    for (sync_index, per_port) in &by_sync {
        for (port, (ids, img)) in per_port {
            let cam = array.get(*port)?;
            let undistorted = cam.undistort_points(img, UndistortOutput::Pixel);
            for (id, uxy) in ids.iter().zip(undistorted.iter()) {
                let Some(obj_index) = obj_index_of.get(&(*sync_index, *id)) else {
                    continue;
                };
                estimates.sync_indices.push(*sync_index);
                estimates.camera_indices.push(*port);
                estimates.point_ids.push(*id);
                estimates.img.push(*uxy);
                estimates.obj_indices.push(*obj_index);
            }
        }
    }

    estimates.prune_underobserved();
    estimates.validate()?;
    tracing::info!(
        observations = estimates.n_observations(),
        points = estimates.n_points(),
        "point estimates assembled"
    );
    Ok(estimates)
}

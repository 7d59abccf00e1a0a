//! The globally consistent camera set and its construction from pairwise
//! stereo poses.

use std::collections::{BTreeMap, BTreeSet};

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use camrig_types::Port;

use crate::{CamExtrinsics, CameraData, MvgError, Result};

/// Relative pose of one stereo-calibrated camera pair.
///
/// Maps points from camera `pair.0`'s frame into camera `pair.1`'s frame:
/// `x_b = rotation * x_a + translation`. `rmse` is the stereo reprojection
/// error of the fit and doubles as the edge weight during array building.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairPose {
    pub pair: (Port, Port),
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
    pub rmse: f64,
    pub grid_count: u32,
}

impl PairPose {
    pub fn extrinsics(&self) -> CamExtrinsics {
        CamExtrinsics {
            rotation: self.rotation,
            translation: self.translation,
        }
    }
}

/// All cameras of the rig, with at most one designated as the anchor.
///
/// The anchor defines the world frame: identity rotation, zero translation.
/// The array is *calibrated* when every non-ignored camera carries finite
/// intrinsics and a pose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraArray {
    pub cameras: BTreeMap<Port, CameraData>,
    pub anchor: Option<Port>,
}

impl CameraArray {
    pub fn new(cameras: BTreeMap<Port, CameraData>) -> Self {
        Self {
            cameras,
            anchor: None,
        }
    }

    pub fn get(&self, port: Port) -> Result<&CameraData> {
        self.cameras.get(&port).ok_or(MvgError::UnknownCamera(port))
    }

    pub fn get_mut(&mut self, port: Port) -> Result<&mut CameraData> {
        self.cameras
            .get_mut(&port)
            .ok_or(MvgError::UnknownCamera(port))
    }

    /// Ports that participate in calibration (not flagged ignored).
    pub fn active_ports(&self) -> Vec<Port> {
        self.cameras
            .iter()
            .filter(|(_, cam)| !cam.ignored)
            .map(|(port, _)| *port)
            .collect()
    }

    /// True when every non-ignored camera has finite intrinsics and a pose.
    pub fn is_calibrated(&self) -> bool {
        self.anchor.is_some()
            && self.cameras.values().filter(|c| !c.ignored).all(|c| {
                let finite_intrinsics = c.matrix().iter().all(|v| v.is_finite())
                    && c.distortions().iter().all(|v| v.is_finite());
                let finite_extrinsics = c.extrinsics.as_ref().is_some_and(|e| {
                    e.rotation.iter().all(|v| v.is_finite())
                        && e.translation.iter().all(|v| v.is_finite())
                });
                finite_intrinsics && finite_extrinsics
            })
    }

    /// The cameras usable for triangulation: non-ignored and posed.
    pub fn posed_cameras(&self) -> Vec<&CameraData> {
        self.cameras
            .values()
            .filter(|c| !c.ignored && c.extrinsics.is_some())
            .collect()
    }
}

/// Composes pairwise stereo poses into one absolute pose per camera.
///
/// The pair graph is virtually symmetrized (each measured edge contributes
/// its inverse as well), the anchor is the port with the lowest mean incident
/// RMSE, and every other port receives the pose composed along its
/// cheapest-RMSE path from the anchor. This is the initialization for bundle
/// adjustment, not the final answer.
pub struct CameraArrayBuilder {
    pair_poses: Vec<PairPose>,
}

impl CameraArrayBuilder {
    pub fn new(pair_poses: Vec<PairPose>) -> Self {
        Self { pair_poses }
    }

    /// Build poses into `array`, returning the elected anchor port.
    ///
    /// Ignored cameras take no part. If any active port cannot be reached
    /// from the anchor the array is left untouched and
    /// [`MvgError::DisconnectedCameraGraph`] names the isolated ports.
    pub fn build(&self, array: &mut CameraArray) -> Result<Port> {
        let active: BTreeSet<Port> = array.active_ports().into_iter().collect();
        if active.is_empty() {
            return Err(MvgError::NoPairPoses);
        }

        // Symmetrized edge list restricted to active ports.
        let mut edges: Vec<(Port, Port, CamExtrinsics, f64)> = Vec::new();
        for pp in &self.pair_poses {
            let (a, b) = pp.pair;
            if !active.contains(&a) || !active.contains(&b) {
                continue;
            }
            let fwd = pp.extrinsics();
            edges.push((b, a, fwd.inverse(), pp.rmse));
            edges.push((a, b, fwd, pp.rmse));
        }
        if edges.is_empty() {
            return Err(MvgError::NoPairPoses);
        }

        // Anchor: lowest mean RMSE over incident edges. BTreeMap iteration
        // breaks ties toward the lowest port number.
        let mut incident: BTreeMap<Port, (f64, u32)> = BTreeMap::new();
        for (from, _, _, rmse) in &edges {
            let entry = incident.entry(*from).or_insert((0.0, 0));
            entry.0 += rmse;
            entry.1 += 1;
        }
        let anchor = incident
            .iter()
            .min_by(|(_, (sum_a, n_a)), (_, (sum_b, n_b))| {
                let mean_a = sum_a / *n_a as f64;
                let mean_b = sum_b / *n_b as f64;
                mean_a.total_cmp(&mean_b)
            })
            .map(|(port, _)| *port)
            .ok_or(MvgError::NoPairPoses)?;

        // Dijkstra over accumulated RMSE from the anchor, composing the
        // anchor-to-port transform along the cheapest path.
        let mut dist: BTreeMap<Port, f64> = BTreeMap::new();
        let mut pose: BTreeMap<Port, CamExtrinsics> = BTreeMap::new();
        let mut visited: BTreeSet<Port> = BTreeSet::new();
        dist.insert(anchor, 0.0);
        pose.insert(anchor, CamExtrinsics::identity());

        loop {
            let next = dist
                .iter()
                .filter(|(port, _)| !visited.contains(port))
                .min_by(|(_, a), (_, b)| a.total_cmp(b))
                .map(|(port, d)| (*port, *d));
            let Some((u, du)) = next else { break };
            visited.insert(u);

            for (from, to, rel, rmse) in &edges {
                if *from != u || visited.contains(to) {
                    continue;
                }
                let nd = du + rmse;
                if dist.get(to).map_or(true, |old| nd < *old) {
                    dist.insert(*to, nd);
                    pose.insert(*to, rel.compose_with(&pose[&u]));
                }
            }
        }

        let isolated: Vec<Port> = active
            .iter()
            .filter(|port| !pose.contains_key(port))
            .copied()
            .collect();
        if !isolated.is_empty() {
            return Err(MvgError::DisconnectedCameraGraph { isolated });
        }

        for (port, extrinsics) in pose {
            array.get_mut(port)?.extrinsics = Some(extrinsics);
        }
        array.anchor = Some(anchor);
        tracing::info!(%anchor, "camera array composed from pairwise poses");
        Ok(anchor)
    }
}

use std::collections::BTreeMap;

use nalgebra::{self as na, Matrix3, Point3, Vector3};
use serde::{Deserialize, Serialize};

use camrig_board::BoardSpec;
use camrig_bundle_adj::{BundleAdjuster, OptimizeSummary};
use camrig_mvg::{CamExtrinsics, CameraArray};
use camrig_types::Port;

use crate::{PointEstimates, Result, VolError};

/// The camera array and the point estimates, refined together.
///
/// The capture volume exclusively owns both structures; vectorizing them
/// into the optimizer's flat parameter vector and writing the solution back
/// happens only here. `stage` counts optimization passes (initial build,
/// post-adjustment, post-filter, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureVolume {
    pub camera_array: CameraArray,
    pub point_estimates: PointEstimates,
    pub stage: u32,
    /// Sync index whose board view defines the world origin, once chosen.
    pub origin_sync_index: Option<u64>,
}

impl CaptureVolume {
    pub fn new(camera_array: CameraArray, point_estimates: PointEstimates) -> Self {
        Self {
            camera_array,
            point_estimates,
            stage: 0,
            origin_sync_index: None,
        }
    }

    /// Ports participating in optimization, ascending. Every observation's
    /// port must be posed and non-ignored.
    fn optimized_ports(&self) -> Result<Vec<Port>> {
        let ports: Vec<Port> = self
            .camera_array
            .cameras
            .values()
            .filter(|c| !c.ignored && c.extrinsics.is_some())
            .map(|c| c.port)
            .collect();
        for port in &self.point_estimates.camera_indices {
            if !ports.contains(port) {
                return Err(VolError::Inconsistent(
                    "observation from an unposed or ignored camera",
                ));
            }
        }
        Ok(ports)
    }

    /// Per-observation reprojection residual magnitudes, pixels
    /// (undistorted space).
    pub fn xy_reprojection_errors(&self) -> Result<Vec<f64>> {
        let pe = &self.point_estimates;
        let mut errors = Vec::with_capacity(pe.n_observations());
        for i in 0..pe.n_observations() {
            let cam = self.camera_array.get(pe.camera_indices[i])?;
            let predicted = cam.project_linear(&[pe.obj[pe.obj_indices[i]]])?[0];
            errors.push((predicted - pe.img[i]).norm());
        }
        Ok(errors)
    }

    /// Current RMSE over all observations.
    pub fn rmse(&self) -> Result<f64> {
        let errors = self.xy_reprojection_errors()?;
        if errors.is_empty() {
            return Ok(0.0);
        }
        Ok((errors.iter().map(|e| e * e).sum::<f64>() / errors.len() as f64).sqrt())
    }

    /// Jointly refine all non-anchor camera extrinsics and all 3D points.
    ///
    /// The solution is written back into the owned camera array and point
    /// estimates. Reported RMSE never increases across a call; when the
    /// solver stops on its iteration cap instead of the function tolerance
    /// the last iterate is still applied and a warning is logged.
    pub fn optimize(&mut self) -> Result<OptimizeSummary> {
        let anchor_port = self.camera_array.anchor.ok_or(VolError::NoAnchor)?;
        let ports = self.optimized_ports()?;
        let slot_of: BTreeMap<Port, usize> = ports
            .iter()
            .enumerate()
            .map(|(slot, port)| (*port, slot))
            .collect();
        let anchor_idx = *slot_of
            .get(&anchor_port)
            .ok_or(VolError::Inconsistent("anchor camera not optimizable"))?;

        let pe = &self.point_estimates;
        let mut observed = Vec::with_capacity(pe.n_observations() * 2);
        for xy in &pe.img {
            observed.push(xy.x);
            observed.push(xy.y);
        }
        let cam_idx: Vec<usize> = pe.camera_indices.iter().map(|port| slot_of[port]).collect();
        let mut points_flat = Vec::with_capacity(pe.n_points() * 3);
        for p in &pe.obj {
            points_flat.extend([p.x, p.y, p.z]);
        }

        let cams: Vec<_> = ports
            .iter()
            .map(|port| self.camera_array.get(*port).cloned())
            .collect::<camrig_mvg::Result<_>>()?;

        let adjuster = BundleAdjuster::new(
            na::Matrix2xX::from_column_slice(&observed),
            cam_idx,
            pe.obj_indices.clone(),
            cams,
            anchor_idx,
            na::Matrix3xX::from_column_slice(&points_flat),
        )?;

        let (adjusted, summary) = adjuster.optimize();

        for (slot, port) in ports.iter().enumerate() {
            self.camera_array.get_mut(*port)?.extrinsics =
                adjusted.cams()[slot].extrinsics.clone();
        }
        let points = adjusted.points();
        for (i, p) in self.point_estimates.obj.iter_mut().enumerate() {
            *p = Point3::new(points[(0, i)], points[(1, i)], points[(2, i)]);
        }
        self.stage += 1;

        tracing::info!(
            stage = self.stage,
            initial_rmse = summary.initial_rmse,
            final_rmse = summary.final_rmse,
            "capture volume optimized"
        );
        Ok(summary)
    }

    /// Redefine the world frame so the board pose at `sync_index` sits at
    /// the origin.
    ///
    /// Fits the rigid transform between the triangulated corners at that
    /// instant and their board-frame coordinates (Kabsch), then applies it
    /// to every camera pose and every 3D point. The anchor camera keeps its
    /// gauge role but is no longer at the identity afterwards.
    pub fn shift_origin_to_board(&mut self, sync_index: u64, board: &BoardSpec) -> Result<()> {
        let pe = &self.point_estimates;
        let mut world_pts = Vec::new();
        let mut board_pts = Vec::new();
        let mut seen = std::collections::BTreeSet::new();
        for i in 0..pe.n_observations() {
            if pe.sync_indices[i] != sync_index {
                continue;
            }
            let oi = pe.obj_indices[i];
            if !seen.insert(oi) {
                continue;
            }
            let Some(corner) = board.object_corner(pe.obj_point_ids[oi]) else {
                continue;
            };
            world_pts.push(pe.obj[oi]);
            board_pts.push(corner);
        }
        if world_pts.len() < 3 {
            return Err(VolError::NoBoardAtSyncIndex(sync_index));
        }

        let (rotation, translation) = kabsch(&world_pts, &board_pts)?;
        let world_to_board = CamExtrinsics {
            rotation,
            translation,
        };

        for p in &mut self.point_estimates.obj {
            *p = world_to_board.transform_point(p);
        }
        let inv = world_to_board.inverse();
        for cam in self.camera_array.cameras.values_mut() {
            if let Some(e) = &mut cam.extrinsics {
                *e = e.compose_with(&inv);
            }
        }
        self.origin_sync_index = Some(sync_index);
        tracing::info!(sync_index, "world origin moved to board pose");
        Ok(())
    }
}

/// Least-squares rigid transform `b ≈ R a + t` between paired point sets.
fn kabsch(a: &[Point3<f64>], b: &[Point3<f64>]) -> Result<(Matrix3<f64>, Vector3<f64>)> {
    let n = a.len() as f64;
    let centroid_a: Vector3<f64> = a.iter().map(|p| p.coords).sum::<Vector3<f64>>() / n;
    let centroid_b: Vector3<f64> = b.iter().map(|p| p.coords).sum::<Vector3<f64>>() / n;

    let mut h = Matrix3::<f64>::zeros();
    for (pa, pb) in a.iter().zip(b.iter()) {
        h += (pa.coords - centroid_a) * (pb.coords - centroid_b).transpose();
    }
    let svd = h.svd(true, true);
    let (u, v_t) = (
        svd.u.ok_or(camrig_mvg::MvgError::SvdFailed)?,
        svd.v_t.ok_or(camrig_mvg::MvgError::SvdFailed)?,
    );
    let mut rotation = v_t.transpose() * u.transpose();
    if rotation.determinant() < 0.0 {
        let mut v = v_t.transpose();
        v.column_mut(2).neg_mut();
        rotation = v * u.transpose();
    }
    let translation = centroid_b - rotation * centroid_a;
    Ok((rotation, translation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::test_support::{moving_points, observation_rows, test_array};
    use crate::build_point_estimates;
    use approx::assert_relative_eq;
    use nalgebra::SVector;
    use rand::{Rng, SeedableRng};

    fn built_volume() -> CaptureVolume {
        let array = test_array(3);
        let landmarks = moving_points(5);
        let rows = observation_rows(&array, &landmarks);
        let estimates = build_point_estimates(&array, &rows).unwrap();
        CaptureVolume::new(array, estimates)
    }

    #[test]
    fn optimization_never_raises_rmse() {
        let mut volume = built_volume();

        // knock the non-anchor cameras off their true poses
        let mut rng = rand::rngs::StdRng::seed_from_u64(3);
        for port in [1u8, 2u8] {
            let cam = volume.camera_array.get_mut(port).unwrap();
            let mut v = cam.extrinsics_to_vector().unwrap();
            for p in 0..6 {
                v[p] += rng.random_range(-0.01..0.01);
            }
            cam.extrinsics_from_vector(&v);
        }

        let before = volume.rmse().unwrap();
        assert!(before > 0.5, "perturbation should be visible, got {before}");
        let summary = volume.optimize().unwrap();
        let after = volume.rmse().unwrap();

        assert_relative_eq!(summary.final_rmse, after, epsilon = 1e-9);
        assert!(after <= before);
        assert!(after < 0.01, "rmse after adjustment: {after}");
        assert_eq!(volume.stage, 1);
        volume.point_estimates.validate().unwrap();

        // anchor still pins the gauge
        let anchor = volume.camera_array.get(0).unwrap();
        assert_relative_eq!(
            anchor.extrinsics_to_vector().unwrap().norm(),
            0.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn origin_shift_places_board_at_origin() {
        let mut volume = built_volume();
        let board = BoardSpec::new(5, 4, 0.08, "DICT_4X4_50", 0.75, false);

        // the moving_points grid at sync 0 is exactly a 4x3 grid with
        // 0.08 m spacing, matching the board's interior corners up to a
        // rigid transform
        let rmse_before = volume.rmse().unwrap();
        volume.shift_origin_to_board(0, &board).unwrap();
        assert_eq!(volume.origin_sync_index, Some(0));

        // reprojection error is invariant under a rigid world re-anchoring
        let rmse_after = volume.rmse().unwrap();
        assert_relative_eq!(rmse_before, rmse_after, epsilon = 1e-6);

        // board corners at that sync index now sit at their board coords
        let pe = &volume.point_estimates;
        for i in 0..pe.n_observations() {
            if pe.sync_indices[i] != 0 {
                continue;
            }
            let oi = pe.obj_indices[i];
            let corner = board.object_corner(pe.obj_point_ids[oi]).unwrap();
            assert!((pe.obj[oi] - corner).norm() < 1e-3);
        }
    }

    #[test]
    fn observation_from_ignored_camera_is_inconsistent() {
        let mut volume = built_volume();
        volume.camera_array.get_mut(2).unwrap().ignored = true;
        assert!(matches!(
            volume.optimize(),
            Err(VolError::Inconsistent(_))
        ));
    }

    #[test]
    fn kabsch_recovers_rigid_transform() {
        let e = CamExtrinsics::from_vector(&SVector::<f64, 6>::new(
            0.2, -0.1, 0.3, 0.5, -0.2, 1.0,
        ));
        let a: Vec<Point3<f64>> = (0..10)
            .map(|i| Point3::new(i as f64 * 0.1, (i % 3) as f64 * 0.2, (i % 4) as f64 * 0.15))
            .collect();
        let b: Vec<Point3<f64>> = a.iter().map(|p| e.transform_point(p)).collect();

        let (r, t) = kabsch(&a, &b).unwrap();
        assert_relative_eq!((r - e.rotation).norm(), 0.0, epsilon = 1e-9);
        assert_relative_eq!((t - e.translation).norm(), 0.0, epsilon = 1e-9);
    }
}

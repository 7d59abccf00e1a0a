//! Pairwise stereo calibration: relative pose between two intrinsically
//! calibrated cameras.

use std::collections::BTreeMap;

use nalgebra::{self as na, Dyn, Owned, Point3, UnitQuaternion};

use camrig_mvg::{homography_dlt, pose_from_homography, CamExtrinsics, CameraData, PairPose};
use camrig_types::{Port, StereoPointsPacket};

use crate::distortion::{project_brown_conrady, INTRINSIC_PARAMS};
use crate::{CalError, Result};

const POSE_PARAMS: usize = 6;

#[derive(Default)]
struct PairAccumulator {
    packets: Vec<StereoPointsPacket>,
    last_save_time: Option<f64>,
}

/// Accumulates shared board views per camera pair and fits the relative pose
/// with intrinsics held fixed.
///
/// A view is stored only when the two ports share at least
/// `corner_threshold` points and at least `min_time_gap` seconds have passed
/// since the pair's previous stored view (bursts of near-identical grids add
/// no information). Once `grid_count_trigger` views have accumulated, the
/// pair is ready for [`Self::calibrate_pair`].
pub struct StereoCalibrator {
    corner_threshold: usize,
    min_time_gap: f64,
    grid_count_trigger: usize,
    inputs: BTreeMap<(Port, Port), PairAccumulator>,
}

impl Default for StereoCalibrator {
    fn default() -> Self {
        Self::new(5, 0.5, 5)
    }
}

impl StereoCalibrator {
    pub fn new(corner_threshold: usize, min_time_gap: f64, grid_count_trigger: usize) -> Self {
        Self {
            corner_threshold,
            min_time_gap,
            grid_count_trigger,
            inputs: BTreeMap::new(),
        }
    }

    /// Offer one stereo points packet; `time` is the (mean) frame time of
    /// the underlying sync packet.
    pub fn add_stereo_packet(&mut self, packet: &StereoPointsPacket, time: f64) {
        if packet.len() < self.corner_threshold {
            return;
        }
        if packet.obj_loc.is_none() {
            // nothing to calibrate against without board coordinates
            return;
        }
        let acc = self.inputs.entry(packet.pair()).or_default();
        if let Some(last) = acc.last_save_time {
            if time - last < self.min_time_gap {
                return;
            }
        }
        acc.packets.push(packet.clone());
        acc.last_save_time = Some(time);
        tracing::debug!(
            pair = ?packet.pair(),
            grids = acc.packets.len(),
            "stored stereo calibration grid"
        );
    }

    pub fn grid_count(&self, pair: (Port, Port)) -> usize {
        self.inputs.get(&pair).map_or(0, |acc| acc.packets.len())
    }

    /// Pairs that have accumulated enough grids to calibrate.
    pub fn ready_pairs(&self) -> Vec<(Port, Port)> {
        self.inputs
            .iter()
            .filter(|(_, acc)| acc.packets.len() >= self.grid_count_trigger)
            .map(|(pair, _)| *pair)
            .collect()
    }

    /// Fit the relative pose of `pair` from its accumulated grids.
    ///
    /// Per grid, each camera's board pose is recovered from a homography
    /// decomposition; the optimization then refines the single relative pose
    /// together with the per-grid board poses, minimizing reprojection in
    /// both images with intrinsics fixed. The returned pose maps camera-A
    /// frame points into the camera-B frame.
    pub fn calibrate_pair(
        &self,
        pair: (Port, Port),
        cam_a: &CameraData,
        cam_b: &CameraData,
    ) -> Result<PairPose> {
        let accumulated = self.grid_count(pair);
        if accumulated < self.grid_count_trigger {
            return Err(CalError::InsufficientPairObservations {
                pair,
                accumulated,
                needed: self.grid_count_trigger,
            });
        }
        let packets = &self.inputs[&pair].packets;

        let intr_a = intrinsic_params(cam_a);
        let intr_b = intrinsic_params(cam_b);

        // Initialization: board pose per grid in each camera, relative pose
        // averaged over the per-grid compositions.
        let mut board_poses_a = Vec::with_capacity(packets.len());
        let mut rel_candidates = Vec::with_capacity(packets.len());
        for packet in packets {
            let obj = packet.obj_loc.as_ref().expect("checked on insert");
            let obj_xy: Vec<na::Point2<f64>> =
                obj.iter().map(|p| na::Point2::new(p.x, p.y)).collect();

            let h_a = homography_dlt(&obj_xy, &packet.img_loc_a)?;
            let h_b = homography_dlt(&obj_xy, &packet.img_loc_b)?;
            let pose_a = pose_from_homography(&cam_a.matrix(), &h_a)?;
            let pose_b = pose_from_homography(&cam_b.matrix(), &h_b)?;

            rel_candidates.push(pose_b.compose_with(&pose_a.inverse()));
            board_poses_a.push(pose_a);
        }
        let rel0 = average_poses(&rel_candidates);

        let problem = StereoProblem::new(
            packets.clone(),
            intr_a,
            intr_b,
            rel0,
            &board_poses_a,
        );

        use levenberg_marquardt_sparse::LevenbergMarquardt;
        let (solved, report) = LevenbergMarquardt::new().minimize(problem);
        if !report.termination.was_successful() {
            tracing::warn!(
                ?pair,
                ?report.termination,
                "stereo refinement stopped before convergence; using last iterate"
            );
        }

        let rel = solved.relative_pose();
        let rmse = solved.rmse();
        tracing::info!(?pair, rmse, grids = packets.len(), "stereo pair calibrated");

        Ok(PairPose {
            pair,
            rotation: rel.rotation,
            translation: rel.translation,
            rmse,
            grid_count: packets.len() as u32,
        })
    }
}

fn intrinsic_params(cam: &CameraData) -> [f64; INTRINSIC_PARAMS] {
    let d = cam.distortions();
    [
        cam.intrinsics.fx(),
        cam.intrinsics.fy(),
        cam.intrinsics.cx(),
        cam.intrinsics.cy(),
        d[0],
        d[1],
        d[2],
        d[3],
        d[4],
    ]
}

/// Chordal mean of rigid transforms: normalized quaternion sum for the
/// rotation, arithmetic mean for the translation. Adequate for clustered
/// candidates, which homography decompositions of the same rig are.
fn average_poses(poses: &[CamExtrinsics]) -> CamExtrinsics {
    let mut quat_sum = na::Vector4::zeros();
    let mut t_sum = na::Vector3::zeros();
    let reference = UnitQuaternion::from_matrix(&poses[0].rotation);
    for pose in poses {
        let mut q = UnitQuaternion::from_matrix(&pose.rotation);
        // quaternion double cover: keep all candidates in one hemisphere
        if reference.coords.dot(&q.coords) < 0.0 {
            q = UnitQuaternion::from_quaternion(na::Quaternion {
                coords: -q.coords,
            });
        }
        quat_sum += q.coords;
        t_sum += pose.translation;
    }
    let n = poses.len() as f64;
    let mean_quat = UnitQuaternion::from_quaternion(na::Quaternion { coords: quat_sum });
    CamExtrinsics {
        rotation: mean_quat.to_rotation_matrix().into_inner(),
        translation: t_sum / n,
    }
}

/// Parameters: one relative pose plus one board pose (in camera A) per grid.
#[derive(Clone)]
struct StereoProblem {
    packets: Vec<StereoPointsPacket>,
    intr_a: [f64; INTRINSIC_PARAMS],
    intr_b: [f64; INTRINSIC_PARAMS],
    nresid: usize,
    params_cache: na::DVector<f64>,
}

impl StereoProblem {
    fn new(
        packets: Vec<StereoPointsPacket>,
        intr_a: [f64; INTRINSIC_PARAMS],
        intr_b: [f64; INTRINSIC_PARAMS],
        rel0: CamExtrinsics,
        board_poses_a: &[CamExtrinsics],
    ) -> Self {
        let nresid = 4 * packets.iter().map(|p| p.len()).sum::<usize>();
        let mut params = Vec::with_capacity(POSE_PARAMS * (1 + board_poses_a.len()));
        params.extend(rel0.to_vector().iter());
        for pose in board_poses_a {
            params.extend(pose.to_vector().iter());
        }
        Self {
            packets,
            intr_a,
            intr_b,
            nresid,
            params_cache: na::DVector::from_vec(params),
        }
    }

    fn relative_pose(&self) -> CamExtrinsics {
        CamExtrinsics::from_vector(&na::SVector::<f64, 6>::from_column_slice(
            &self.params_cache.as_slice()[..POSE_PARAMS],
        ))
    }

    fn board_pose(&self, grid_idx: usize) -> CamExtrinsics {
        let start = POSE_PARAMS * (1 + grid_idx);
        CamExtrinsics::from_vector(&na::SVector::<f64, 6>::from_column_slice(
            &self.params_cache.as_slice()[start..start + POSE_PARAMS],
        ))
    }

    /// Residuals of one grid: board points through `pose_a` into camera A
    /// and through `rel ∘ pose_a` into camera B.
    fn grid_residuals(
        &self,
        packet: &StereoPointsPacket,
        rel: &CamExtrinsics,
        pose_a: &CamExtrinsics,
        out: &mut Vec<f64>,
    ) {
        out.clear();
        let pose_b = rel.compose_with(pose_a);
        let obj = packet.obj_loc.as_ref().expect("checked on insert");
        for ((o, a), b) in obj
            .iter()
            .zip(packet.img_loc_a.iter())
            .zip(packet.img_loc_b.iter())
        {
            let o = Point3::new(o.x, o.y, o.z);
            let pa = project_brown_conrady(&self.intr_a, pose_a, &o);
            let pb = project_brown_conrady(&self.intr_b, &pose_b, &o);
            out.push(a.x - pa.x);
            out.push(a.y - pa.y);
            out.push(b.x - pb.x);
            out.push(b.y - pb.y);
        }
    }

    fn rmse(&self) -> f64 {
        use levenberg_marquardt_sparse::LeastSquaresProblem;
        let r = self.residuals().expect("always computable");
        let n = r.nrows() / 2;
        (r.iter().map(|v| v * v).sum::<f64>() / n as f64).sqrt()
    }
}

impl levenberg_marquardt_sparse::LeastSquaresProblem<f64, Dyn, Dyn> for StereoProblem {
    type ParameterStorage = Owned<f64, Dyn>;
    type ResidualStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, x: &na::DVector<f64>) {
        self.params_cache = x.clone();
    }

    fn params(&self) -> na::DVector<f64> {
        self.params_cache.clone()
    }

    fn residuals(&self) -> Option<na::DVector<f64>> {
        let rel = self.relative_pose();
        let mut residuals = Vec::with_capacity(self.nresid);
        let mut scratch = Vec::new();
        for (gi, packet) in self.packets.iter().enumerate() {
            self.grid_residuals(packet, &rel, &self.board_pose(gi), &mut scratch);
            residuals.extend_from_slice(&scratch);
        }
        Some(na::DVector::from_vec(residuals))
    }

    fn jacobian(&self) -> Option<levenberg_marquardt_sparse::SparseJacobian<f64>> {
        let nparams = self.params_cache.nrows();
        let mut j = na::OMatrix::<f64, Dyn, Dyn>::zeros(self.nresid, nparams);
        let rel = self.relative_pose();
        let rel_base = rel.to_vector();

        let mut row_start = 0;
        let mut plus_buf = Vec::new();
        let mut minus_buf = Vec::new();
        for (gi, packet) in self.packets.iter().enumerate() {
            let nrows = 4 * packet.len();
            let pose_a = self.board_pose(gi);

            // relative-pose block (columns 0..6)
            for p in 0..POSE_PARAMS {
                let h = 1e-6 * (1.0 + rel_base[p].abs());
                let mut plus = rel_base;
                plus[p] += h;
                let mut minus = rel_base;
                minus[p] -= h;
                self.grid_residuals(
                    packet,
                    &CamExtrinsics::from_vector(&plus),
                    &pose_a,
                    &mut plus_buf,
                );
                self.grid_residuals(
                    packet,
                    &CamExtrinsics::from_vector(&minus),
                    &pose_a,
                    &mut minus_buf,
                );
                for r in 0..nrows {
                    j[(row_start + r, p)] = (plus_buf[r] - minus_buf[r]) / (2.0 * h);
                }
            }

            // board-pose block for this grid
            let base = pose_a.to_vector();
            let col_start = POSE_PARAMS * (1 + gi);
            for p in 0..POSE_PARAMS {
                let h = 1e-6 * (1.0 + base[p].abs());
                let mut plus = base;
                plus[p] += h;
                let mut minus = base;
                minus[p] -= h;
                self.grid_residuals(
                    packet,
                    &rel,
                    &CamExtrinsics::from_vector(&plus),
                    &mut plus_buf,
                );
                self.grid_residuals(
                    packet,
                    &rel,
                    &CamExtrinsics::from_vector(&minus),
                    &mut minus_buf,
                );
                for r in 0..nrows {
                    j[(row_start + r, col_start + p)] =
                        (plus_buf[r] - minus_buf[r]) / (2.0 * h);
                }
            }

            row_start += nrows;
        }
        Some(levenberg_marquardt_sparse::SparseJacobian::from_dense(j))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Point2, SVector, Vector5};

    fn rig() -> (CameraData, CameraData, CamExtrinsics) {
        let mut cam_a = CameraData::new(0, (1280, 720), 0);
        cam_a.set_intrinsics_from_params(
            1000.0,
            1000.0,
            640.0,
            360.0,
            Vector5::new(-0.05, 0.01, 0.0, 0.0, 0.0),
        );
        let mut cam_b = CameraData::new(1, (1280, 720), 0);
        cam_b.set_intrinsics_from_params(980.0, 985.0, 630.0, 355.0, Vector5::zeros());

        // B sits to the right of A, slightly toed in
        let rel = CamExtrinsics::from_vector(&SVector::<f64, 6>::new(
            0.0, -0.15, 0.0, -0.4, 0.0, 0.05,
        ));
        (cam_a, cam_b, rel)
    }

    fn board_pose(i: usize) -> CamExtrinsics {
        let angles = [
            (0.3, -0.2, 0.1),
            (-0.25, 0.3, 0.0),
            (0.1, 0.35, -0.1),
            (-0.3, -0.25, 0.05),
            (0.35, 0.05, -0.05),
            (0.05, -0.35, 0.02),
        ];
        let (rx, ry, rz) = angles[i % angles.len()];
        CamExtrinsics {
            rotation: nalgebra::UnitQuaternion::from_euler_angles(rx, ry, rz)
                .to_rotation_matrix()
                .into_inner(),
            translation: nalgebra::Vector3::new(0.05, -0.05, 0.9 + 0.1 * (i % 2) as f64),
        }
    }

    fn board_obj() -> Vec<Point3<f64>> {
        let mut pts = Vec::new();
        for r in 0..4 {
            for c in 0..5 {
                pts.push(Point3::new(c as f64 * 0.04, r as f64 * 0.04, 0.0));
            }
        }
        pts
    }

    fn synth_packet(
        sync_index: u64,
        cam_a: &CameraData,
        cam_b: &CameraData,
        rel: &CamExtrinsics,
        pose_a: &CamExtrinsics,
    ) -> StereoPointsPacket {
        let obj = board_obj();
        let intr_a = intrinsic_params(cam_a);
        let intr_b = intrinsic_params(cam_b);
        let pose_b = rel.compose_with(pose_a);
        let img_a: Vec<Point2<f64>> = obj
            .iter()
            .map(|o| project_brown_conrady(&intr_a, pose_a, o))
            .collect();
        let img_b: Vec<Point2<f64>> = obj
            .iter()
            .map(|o| project_brown_conrady(&intr_b, &pose_b, o))
            .collect();
        StereoPointsPacket {
            sync_index,
            port_a: cam_a.port,
            port_b: cam_b.port,
            common_ids: (0..obj.len() as u32).collect(),
            img_loc_a: img_a,
            img_loc_b: img_b,
            obj_loc: Some(obj),
        }
    }

    #[test]
    fn accumulation_enforces_thresholds_and_time_gap() {
        let (cam_a, cam_b, rel) = rig();
        let mut cal = StereoCalibrator::default();

        let full = synth_packet(0, &cam_a, &cam_b, &rel, &board_pose(0));
        // too few common points
        let mut sparse = full.clone();
        sparse.common_ids.truncate(4);
        sparse.img_loc_a.truncate(4);
        sparse.img_loc_b.truncate(4);
        sparse.obj_loc.as_mut().unwrap().truncate(4);
        cal.add_stereo_packet(&sparse, 0.0);
        assert_eq!(cal.grid_count((0, 1)), 0);

        cal.add_stereo_packet(&full, 1.0);
        assert_eq!(cal.grid_count((0, 1)), 1);
        // too soon after the previous grid
        cal.add_stereo_packet(&full, 1.2);
        assert_eq!(cal.grid_count((0, 1)), 1);
        cal.add_stereo_packet(&full, 1.6);
        assert_eq!(cal.grid_count((0, 1)), 2);
    }

    #[test]
    fn uncalibrated_pair_reports_insufficient_observations() {
        let (cam_a, cam_b, _) = rig();
        let cal = StereoCalibrator::default();
        let err = cal.calibrate_pair((0, 1), &cam_a, &cam_b).unwrap_err();
        assert!(matches!(
            err,
            CalError::InsufficientPairObservations {
                pair: (0, 1),
                accumulated: 0,
                ..
            }
        ));
    }

    #[test]
    fn recovers_relative_pose() {
        let (cam_a, cam_b, rel) = rig();
        let mut cal = StereoCalibrator::default();
        for i in 0..6 {
            let packet = synth_packet(i, &cam_a, &cam_b, &rel, &board_pose(i as usize));
            cal.add_stereo_packet(&packet, i as f64);
        }
        assert!(cal.ready_pairs().contains(&(0, 1)));

        let pose = cal.calibrate_pair((0, 1), &cam_a, &cam_b).unwrap();
        assert!(pose.rmse < 1e-4, "rmse {}", pose.rmse);
        assert_eq!(pose.grid_count, 6);
        assert_relative_eq!((pose.rotation - rel.rotation).norm(), 0.0, epsilon = 1e-4);
        assert_relative_eq!(
            (pose.translation - rel.translation).norm(),
            0.0,
            epsilon = 1e-4
        );
    }
}

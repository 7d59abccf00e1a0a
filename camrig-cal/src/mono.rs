//! Per-camera intrinsic calibration.

use std::collections::BTreeMap;

use nalgebra::{self as na, Dyn, Owned, Point2, Point3};

use camrig_mvg::{
    homography_dlt, intrinsics_from_homographies, pose_from_homography, CamExtrinsics, CameraData,
};
use camrig_types::{FramePacket, Port};

use crate::distortion::{project_brown_conrady, INTRINSIC_PARAMS};
use crate::{CalError, Result};

/// Frames with this many points or fewer never enter the calibration, even
/// when selected.
const MIN_POINTS_PER_FRAME: usize = 3;
/// A frame needs more than this many corners to be a backfill candidate, and
/// at least two such frames must exist for calibration to proceed.
const WELL_OBSERVED_POINTS: usize = 6;

#[derive(Debug, Clone)]
struct StoredPoints {
    ids: Vec<u32>,
    img: Vec<Point2<f64>>,
    obj: Vec<Point3<f64>>,
}

#[derive(Debug, Clone)]
struct AutoPop {
    wait_between: u32,
    threshold_corner_count: usize,
    target_grid_count: usize,
    countdown: u32,
}

/// Accumulates board observations from one camera's stream and fits its
/// pinhole + distortion model.
///
/// Frames are fed in with [`Self::add_frame_packet`]; which of them
/// contribute to the fit is controlled either manually
/// ([`Self::add_calibration_frame_index`]) or by the auto-pop mechanism,
/// which selects well-covered frames with enforced temporal spacing.
/// Neighbouring video frames carry nearly identical board poses, so the
/// spacing decorrelates the sample and conditions the fit.
pub struct IntrinsicCalibrator {
    port: Port,
    all_points: BTreeMap<i64, StoredPoints>,
    calibration_frame_indices: Vec<i64>,
    auto_pop: Option<AutoPop>,
}

impl IntrinsicCalibrator {
    pub fn new(port: Port) -> Self {
        Self {
            port,
            all_points: BTreeMap::new(),
            calibration_frame_indices: Vec::new(),
            auto_pop: None,
        }
    }

    pub fn port(&self) -> Port {
        self.port
    }

    /// Number of board views currently selected for calibration.
    pub fn grid_count(&self) -> usize {
        self.calibration_frame_indices.len()
    }

    pub fn calibration_frame_indices(&self) -> &[i64] {
        &self.calibration_frame_indices
    }

    /// Store a frame's point data, indexed by frame index, and run the
    /// auto-pop selection when armed. The end-of-stream sentinel finalizes
    /// auto-pop by backfilling toward the target grid count.
    pub fn add_frame_packet(&mut self, packet: &FramePacket) {
        if packet.is_end_of_stream() {
            if let Some(ap) = self.auto_pop.take() {
                self.backfill_calibration_frames(ap.target_grid_count);
            }
            return;
        }
        let Some(points) = &packet.points else { return };
        if points.is_empty() {
            // still advances the auto-pop countdown: an empty frame is a
            // frame that passed by
            if let Some(ap) = &mut self.auto_pop {
                ap.countdown = ap.countdown.saturating_sub(1);
            }
            return;
        }
        let Some(obj) = &points.obj_loc else {
            tracing::warn!(
                port = self.port,
                "tracker provided no object locations; frame unusable for calibration"
            );
            return;
        };

        let index = packet.frame_index;
        self.all_points.insert(
            index,
            StoredPoints {
                ids: points.point_ids.clone(),
                img: points.img_loc.clone(),
                obj: obj.clone(),
            },
        );

        let Some(ap) = &mut self.auto_pop else { return };
        let corner_count = points.len();
        if ap.countdown == 0 && corner_count >= ap.threshold_corner_count {
            let wait = ap.wait_between;
            self.add_calibration_frame_index(index);
            if let Some(ap) = &mut self.auto_pop {
                ap.countdown = wait;
            }
        } else {
            ap.countdown = ap.countdown.saturating_sub(1);
        }
    }

    /// Mark a captured frame for use in calibration.
    pub fn add_calibration_frame_index(&mut self, frame_index: i64) {
        if !self.calibration_frame_indices.contains(&frame_index) {
            tracing::debug!(
                port = self.port,
                frame_index,
                "adding frame to calibration inputs"
            );
            self.calibration_frame_indices.push(frame_index);
        }
    }

    pub fn clear_calibration_data(&mut self) {
        self.calibration_frame_indices.clear();
    }

    /// Arm automatic frame selection for subsequent playback: skip frames
    /// until one carries at least `threshold_corner_count` points, select
    /// it, then hold off `wait_between` frames before considering the next
    /// candidate. At end of stream, random not-yet-selected frames with
    /// more than six corners fill in toward `target_grid_count`.
    pub fn initiate_auto_pop(
        &mut self,
        wait_between: u32,
        threshold_corner_count: usize,
        target_grid_count: usize,
    ) {
        tracing::info!(
            port = self.port,
            wait_between,
            threshold_corner_count,
            target_grid_count,
            "initiating auto-population of calibration frames"
        );
        self.clear_calibration_data();
        self.all_points.clear();
        self.auto_pop = Some(AutoPop {
            wait_between,
            threshold_corner_count,
            target_grid_count,
            countdown: 0,
        });
    }

    /// Random sampling from not-yet-selected frames with more than six
    /// corners until the target grid count is met or candidates run out.
    fn backfill_calibration_frames(&mut self, target_grid_count: usize) {
        let candidates: Vec<i64> = self
            .all_points
            .iter()
            .filter(|(index, stored)| {
                stored.ids.len() > WELL_OBSERVED_POINTS
                    && !self.calibration_frame_indices.contains(index)
            })
            .map(|(index, _)| *index)
            .collect();

        let sample_size = target_grid_count
            .saturating_sub(self.grid_count())
            .min(candidates.len());
        tracing::info!(
            port = self.port,
            target_grid_count,
            current = self.grid_count(),
            sample_size,
            "backfilling calibration frames"
        );

        let mut rng = rand::rng();
        for i in rand::seq::index::sample(&mut rng, candidates.len(), sample_size) {
            self.add_calibration_frame_index(candidates[i]);
        }
    }

    /// Fit the pinhole + Brown-Conrady model to the selected board views.
    ///
    /// Intrinsics are initialized by Zhang's closed form over the view
    /// homographies, per-view board poses from homography decomposition, and
    /// everything is refined jointly by Levenberg-Marquardt on reprojection
    /// residuals. Results (matrix, distortions, RMSE, grid count) are
    /// written back into `camera`; the RMSE is also returned.
    pub fn calibrate_camera(&self, camera: &mut CameraData) -> Result<f64> {
        let views: Vec<&StoredPoints> = self
            .calibration_frame_indices
            .iter()
            .filter_map(|index| self.all_points.get(index))
            .filter(|stored| stored.ids.len() > MIN_POINTS_PER_FRAME)
            .collect();

        let well_observed = views
            .iter()
            .filter(|v| v.ids.len() >= WELL_OBSERVED_POINTS)
            .count();
        if well_observed < 2 {
            return Err(CalError::InsufficientObservations {
                port: self.port,
                usable: well_observed,
                needed: 2,
            });
        }

        tracing::info!(port = self.port, views = views.len(), "calibrating camera");

        // Closed-form seed from the board-plane homographies.
        let mut homographies = Vec::with_capacity(views.len());
        for view in &views {
            let obj_xy: Vec<Point2<f64>> =
                view.obj.iter().map(|p| Point2::new(p.x, p.y)).collect();
            homographies.push(homography_dlt(&obj_xy, &view.img)?);
        }
        let seed = intrinsics_from_homographies(&homographies, camera.size);
        let k_seed = seed.k;

        let mut intr = [0.0; INTRINSIC_PARAMS];
        intr[0] = seed.fx();
        intr[1] = seed.fy();
        intr[2] = seed.cx();
        intr[3] = seed.cy();

        let mut poses = Vec::with_capacity(views.len());
        for h in &homographies {
            poses.push(pose_from_homography(&k_seed, h)?);
        }

        let problem = MonoProblem::new(
            views
                .iter()
                .map(|v| View {
                    img: v.img.clone(),
                    obj: v.obj.clone(),
                })
                .collect(),
            intr,
            &poses,
        );

        use levenberg_marquardt_sparse::LevenbergMarquardt;
        let (solved, report) = LevenbergMarquardt::new().minimize(problem);
        if !report.termination.was_successful() {
            tracing::warn!(
                port = self.port,
                ?report.termination,
                "intrinsic refinement stopped before convergence; using last iterate"
            );
        }

        let intr = solved.intrinsics();
        for k in [intr[4], intr[5], intr[8]] {
            if k.abs() > 2.0 {
                tracing::warn!(port = self.port, k, "implausibly large radial distortion");
            }
        }
        let rmse = solved.rmse();

        camera.set_intrinsics_from_params(
            intr[0],
            intr[1],
            intr[2],
            intr[3],
            na::Vector5::new(intr[4], intr[5], intr[6], intr[7], intr[8]),
        );
        camera.error = Some(rmse);
        camera.grid_count = Some(views.len() as u32);

        tracing::info!(port = self.port, rmse, "camera calibrated");
        Ok(rmse)
    }
}

#[derive(Clone)]
struct View {
    img: Vec<Point2<f64>>,
    obj: Vec<Point3<f64>>,
}

/// Least-squares problem over `[fx, fy, cx, cy, k1, k2, p1, p2, k3]` plus a
/// 6-vector board pose per view.
#[derive(Clone)]
struct MonoProblem {
    views: Vec<View>,
    nresid: usize,
    params_cache: na::DVector<f64>,
}

const POSE_PARAMS: usize = 6;

impl MonoProblem {
    fn new(views: Vec<View>, intr: [f64; INTRINSIC_PARAMS], poses: &[CamExtrinsics]) -> Self {
        let nresid = 2 * views.iter().map(|v| v.img.len()).sum::<usize>();
        let mut params = Vec::with_capacity(INTRINSIC_PARAMS + POSE_PARAMS * poses.len());
        params.extend_from_slice(&intr);
        for pose in poses {
            params.extend(pose.to_vector().iter());
        }
        Self {
            views,
            nresid,
            params_cache: na::DVector::from_vec(params),
        }
    }

    fn intrinsics(&self) -> [f64; INTRINSIC_PARAMS] {
        let mut intr = [0.0; INTRINSIC_PARAMS];
        intr.copy_from_slice(&self.params_cache.as_slice()[..INTRINSIC_PARAMS]);
        intr
    }

    fn pose(&self, view_idx: usize) -> CamExtrinsics {
        let start = INTRINSIC_PARAMS + view_idx * POSE_PARAMS;
        CamExtrinsics::from_vector(&na::SVector::<f64, 6>::from_column_slice(
            &self.params_cache.as_slice()[start..start + POSE_PARAMS],
        ))
    }

    /// Residuals of a single view given explicit parameters.
    fn view_residuals(view: &View, intr: &[f64], pose: &CamExtrinsics, out: &mut Vec<f64>) {
        out.clear();
        for (img, obj) in view.img.iter().zip(view.obj.iter()) {
            let predicted = project_brown_conrady(intr, pose, obj);
            out.push(img.x - predicted.x);
            out.push(img.y - predicted.y);
        }
    }

    fn rmse(&self) -> f64 {
        use levenberg_marquardt_sparse::LeastSquaresProblem;
        let r = self.residuals().expect("always computable");
        let n = r.nrows() / 2;
        (r.iter().map(|v| v * v).sum::<f64>() / n as f64).sqrt()
    }
}

impl levenberg_marquardt_sparse::LeastSquaresProblem<f64, Dyn, Dyn> for MonoProblem {
    type ParameterStorage = Owned<f64, Dyn>;
    type ResidualStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, x: &na::DVector<f64>) {
        self.params_cache = x.clone();
    }

    fn params(&self) -> na::DVector<f64> {
        self.params_cache.clone()
    }

    fn residuals(&self) -> Option<na::DVector<f64>> {
        let intr = self.intrinsics();
        let mut residuals = Vec::with_capacity(self.nresid);
        let mut scratch = Vec::new();
        for (i, view) in self.views.iter().enumerate() {
            Self::view_residuals(view, &intr, &self.pose(i), &mut scratch);
            residuals.extend_from_slice(&scratch);
        }
        Some(na::DVector::from_vec(residuals))
    }

    /// Numeric central differences, filled block-wise: a view's residual
    /// rows depend only on the nine shared intrinsic columns and that view's
    /// six pose columns.
    fn jacobian(&self) -> Option<levenberg_marquardt_sparse::SparseJacobian<f64>> {
        let nparams = self.params_cache.nrows();
        let mut j = na::OMatrix::<f64, Dyn, Dyn>::zeros(self.nresid, nparams);
        let intr = self.intrinsics();

        let mut row_start = 0;
        let mut plus_buf = Vec::new();
        let mut minus_buf = Vec::new();
        for (vi, view) in self.views.iter().enumerate() {
            let nrows = 2 * view.img.len();
            let pose = self.pose(vi);

            // intrinsic block
            for p in 0..INTRINSIC_PARAMS {
                let h = 1e-6 * (1.0 + intr[p].abs());
                let mut plus = intr;
                plus[p] += h;
                let mut minus = intr;
                minus[p] -= h;
                Self::view_residuals(view, &plus, &pose, &mut plus_buf);
                Self::view_residuals(view, &minus, &pose, &mut minus_buf);
                for r in 0..nrows {
                    j[(row_start + r, p)] = (plus_buf[r] - minus_buf[r]) / (2.0 * h);
                }
            }

            // pose block
            let base = pose.to_vector();
            let col_start = INTRINSIC_PARAMS + vi * POSE_PARAMS;
            for p in 0..POSE_PARAMS {
                let h = 1e-6 * (1.0 + base[p].abs());
                let mut plus = base;
                plus[p] += h;
                let mut minus = base;
                minus[p] -= h;
                Self::view_residuals(
                    view,
                    &intr,
                    &CamExtrinsics::from_vector(&plus),
                    &mut plus_buf,
                );
                Self::view_residuals(
                    view,
                    &intr,
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
    use camrig_types::PointPacket;
    use nalgebra::UnitQuaternion;

    /// A 6x8 grid of board corners, 3 cm spacing.
    fn board_obj() -> Vec<Point3<f64>> {
        let mut pts = Vec::new();
        for r in 0..6 {
            for c in 0..8 {
                pts.push(Point3::new(c as f64 * 0.03, r as f64 * 0.03, 0.0));
            }
        }
        pts
    }

    const TRUE_INTR: [f64; INTRINSIC_PARAMS] = [
        1000.0, 995.0, 640.0, 360.0, -0.1, 0.05, 0.001, -0.001, 0.0,
    ];

    fn view_pose(i: usize) -> CamExtrinsics {
        let angles = [
            (0.35, -0.2, 0.05),
            (-0.3, 0.3, -0.04),
            (0.15, 0.4, 0.1),
            (-0.25, -0.35, 0.0),
            (0.4, 0.1, -0.08),
            (-0.1, -0.15, 0.12),
            (0.2, 0.25, -0.1),
            (-0.4, 0.05, 0.06),
        ];
        let (rx, ry, rz) = angles[i % angles.len()];
        let shift = (i / angles.len()) as f64 * 0.01;
        CamExtrinsics {
            rotation: UnitQuaternion::from_euler_angles(rx, ry, rz)
                .to_rotation_matrix()
                .into_inner(),
            translation: nalgebra::Vector3::new(
                -0.1 + shift,
                -0.08,
                0.55 + 0.05 * (i % 3) as f64,
            ),
        }
    }

    fn frame_packet(port: Port, frame_index: i64, ids: Vec<u32>) -> FramePacket {
        let obj_all = board_obj();
        let pose = view_pose(frame_index as usize);
        let obj: Vec<Point3<f64>> = ids.iter().map(|id| obj_all[*id as usize]).collect();
        let img: Vec<Point2<f64>> = obj
            .iter()
            .map(|p| project_brown_conrady(&TRUE_INTR, &pose, p))
            .collect();
        FramePacket {
            port,
            frame_index,
            frame_time: frame_index as f64 / 30.0,
            frame: None,
            points: Some(PointPacket::new(ids, img, Some(obj)).unwrap()),
        }
    }

    fn full_ids() -> Vec<u32> {
        (0..48).collect()
    }

    #[test]
    fn auto_pop_respects_threshold_and_wait() {
        let mut cal = IntrinsicCalibrator::new(0);
        cal.initiate_auto_pop(3, 40, 100);

        for i in 0..12 {
            // frames 0 and 1 are sparse; full boards afterwards
            let ids: Vec<u32> = if i < 2 { (0..10).collect() } else { full_ids() };
            cal.add_frame_packet(&frame_packet(0, i, ids));
        }

        // first candidate at frame 2, then every 4th frame (wait of 3)
        assert_eq!(cal.calibration_frame_indices(), &[2, 6, 10]);
    }

    #[test]
    fn auto_pop_backfills_to_target_at_end_of_stream() {
        let mut cal = IntrinsicCalibrator::new(0);
        cal.initiate_auto_pop(5, 40, 8);

        for i in 0..12 {
            cal.add_frame_packet(&frame_packet(0, i, full_ids()));
        }
        assert_eq!(cal.grid_count(), 2); // frames 0 and 6
        cal.add_frame_packet(&FramePacket::end_of_stream(0, 12));
        assert_eq!(cal.grid_count(), 8);
    }

    #[test]
    fn auto_pop_target_beyond_available_takes_everything() {
        let mut cal = IntrinsicCalibrator::new(0);
        cal.initiate_auto_pop(2, 40, 50);
        for i in 0..6 {
            cal.add_frame_packet(&frame_packet(0, i, full_ids()));
        }
        cal.add_frame_packet(&FramePacket::end_of_stream(0, 6));
        // every frame with enough corners ends up selected
        assert_eq!(cal.grid_count(), 6);
    }

    #[test]
    fn too_few_usable_frames_is_insufficient() {
        let mut cal = IntrinsicCalibrator::new(3);
        cal.add_frame_packet(&frame_packet(3, 0, full_ids()));
        cal.add_calibration_frame_index(0);
        // a second selected frame, but with only 3 points: excluded
        cal.add_frame_packet(&frame_packet(3, 1, vec![0, 1, 2]));
        cal.add_calibration_frame_index(1);

        let mut camera = CameraData::new(3, (1280, 720), 0);
        let err = cal.calibrate_camera(&mut camera).unwrap_err();
        assert!(matches!(
            err,
            CalError::InsufficientObservations { port: 3, .. }
        ));
        // partial results preserved: the camera keeps its placeholder state
        assert!(camera.error.is_none());
    }

    #[test]
    fn recovers_synthetic_intrinsics() {
        let mut cal = IntrinsicCalibrator::new(0);
        for i in 0..8 {
            cal.add_frame_packet(&frame_packet(0, i, full_ids()));
            cal.add_calibration_frame_index(i);
        }

        let mut camera = CameraData::new(0, (1280, 720), 0);
        let rmse = cal.calibrate_camera(&mut camera).unwrap();

        assert!(rmse < 1e-4, "rmse {rmse}");
        assert_relative_eq!(camera.intrinsics.fx(), TRUE_INTR[0], epsilon = 0.5);
        assert_relative_eq!(camera.intrinsics.fy(), TRUE_INTR[1], epsilon = 0.5);
        assert_relative_eq!(camera.intrinsics.cx(), TRUE_INTR[2], epsilon = 0.5);
        assert_relative_eq!(camera.intrinsics.cy(), TRUE_INTR[3], epsilon = 0.5);
        let d = camera.distortions();
        assert_relative_eq!(d[0], TRUE_INTR[4], epsilon = 5e-3);
        assert_relative_eq!(d[1], TRUE_INTR[5], epsilon = 5e-3);
        assert_eq!(camera.grid_count, Some(8));
        assert_eq!(camera.error, Some(rmse));
    }
}

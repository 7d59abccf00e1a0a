//! Joint refinement of camera extrinsics and 3D point positions.
//!
//! The most important internal operations are calculation of the residual
//! errors and calculation of the Jacobian of the residuals with respect to
//! the parameters (non-anchor camera poses and estimated 3D world coordinate
//! positions).
//!
//! Observations are *undistorted* pixel coordinates; the residual compares
//! them against the distortion-free reprojection of the current 3D
//! estimates, so intrinsics stay fixed throughout. The anchor camera is
//! excluded from the parameter vector to pin the gauge: without it, the
//! whole solution could drift rigidly with no change in residual.

use nalgebra::{self as na, Dyn, Owned};

use camrig_mvg::{CamExtrinsics, CameraData};

#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error("inconsistent data: {0}")]
    InconsistentData(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

const CAM_PARAMS: usize = 6;
const PT_PARAMS: usize = 3;
/// Central-difference step for the block Jacobian.
const JAC_STEP: f64 = 1e-6;

/// Outcome of one [`BundleAdjuster::optimize`] run.
#[derive(Debug, Clone)]
pub struct OptimizeSummary {
    /// RMSE (pixels, undistorted space) before optimization.
    pub initial_rmse: f64,
    /// RMSE after optimization.
    pub final_rmse: f64,
    /// False when the solver hit its iteration cap before reaching the
    /// function tolerance. The last iterate is still applied.
    pub converged: bool,
    pub evaluations: usize,
}

/// Perform multi-camera bundle adjustment.
///
/// Construct with observations, index mappings and initial estimates, then
/// call [`Self::optimize`]. The adjusted cameras and points are read back
/// with [`Self::cams`] and [`Self::points`].
#[derive(Clone)]
pub struct BundleAdjuster {
    /// Number of residuals: twice the number of observations.
    nresid: usize,
    /// The 2D observed points, undistorted pixels.
    observed: na::Matrix2xX<f64>,
    /// The index of the camera doing each observation.
    cam_idx: Vec<usize>,
    /// The index of the 3D world point being observed.
    pt_idx: Vec<usize>,

    /// The cameras. Updated every iteration; the anchor never moves.
    cams: Vec<CameraData>,
    /// Which entry of `cams` is the anchor (world frame definition).
    anchor_idx: usize,

    /// The world coordinate (3D) points. Updated every iteration.
    points: na::Matrix3xX<f64>,

    /// Cache of the parameters used to build `cams` and `points`.
    params_cache: na::DVector<f64>,

    /// Per-observation parameter column starts, computed once: the camera
    /// block (None for anchor observations) and the point block. This is the
    /// Jacobian sparsity structure; each residual row touches at most 9
    /// columns.
    block_cols: Vec<(Option<usize>, usize)>,
}

impl BundleAdjuster {
    /// Create a new [`BundleAdjuster`].
    ///
    /// Observed points (2D, undistorted pixel coordinates) are a 2xN matrix.
    /// `cam_idx[i]` and `pt_idx[i]` name the camera and 3D point of
    /// observation `i`. Every camera must already carry a pose; `anchor_idx`
    /// selects the gauge-fixing camera.
    pub fn new(
        observed: na::Matrix2xX<f64>,
        cam_idx: Vec<usize>,
        pt_idx: Vec<usize>,
        cams: Vec<CameraData>,
        anchor_idx: usize,
        points: na::Matrix3xX<f64>,
    ) -> Result<Self> {
        let nobs = observed.ncols();
        if nobs == 0 {
            return Err(Error::InconsistentData("no observations"));
        }
        if nobs != cam_idx.len() {
            return Err(Error::InconsistentData("cam index shape"));
        }
        if nobs != pt_idx.len() {
            return Err(Error::InconsistentData("point index shape"));
        }
        if cams.is_empty() || anchor_idx >= cams.len() {
            return Err(Error::InconsistentData("anchor index out of range"));
        }
        if cam_idx.iter().any(|i| *i >= cams.len()) {
            return Err(Error::InconsistentData("cam index out of range"));
        }
        if pt_idx.iter().any(|i| *i >= points.ncols()) {
            return Err(Error::InconsistentData("point index out of range"));
        }
        if cams.iter().any(|c| c.extrinsics.is_none()) {
            return Err(Error::InconsistentData("camera without extrinsics"));
        }

        let n_free_cams = cams.len() - 1;
        let nparams = n_free_cams * CAM_PARAMS + points.ncols() * PT_PARAMS;
        let nresid = nobs * 2;

        let block_cols = cam_idx
            .iter()
            .zip(pt_idx.iter())
            .map(|(ci, pi)| {
                let cam_col = free_cam_slot(*ci, anchor_idx).map(|slot| slot * CAM_PARAMS);
                let pt_col = n_free_cams * CAM_PARAMS + pi * PT_PARAMS;
                (cam_col, pt_col)
            })
            .collect();

        let mut myself = Self {
            nresid,
            observed,
            cam_idx,
            pt_idx,
            cams,
            anchor_idx,
            points,
            params_cache: na::DVector::zeros(nparams),
            block_cols,
        };
        myself.params_cache = myself.pack_params();
        Ok(myself)
    }

    pub fn cams(&self) -> &[CameraData] {
        &self.cams
    }

    pub fn points(&self) -> &na::Matrix3xX<f64> {
        &self.points
    }

    pub fn anchor_idx(&self) -> usize {
        self.anchor_idx
    }

    /// Root-mean-square reprojection error over all observations, pixels.
    pub fn rmse(&self) -> f64 {
        use levenberg_marquardt_sparse::LeastSquaresProblem;
        let r = self.residuals().expect("residuals always computable");
        rmse_of_residuals(&r)
    }

    /// Run the solver to a function tolerance of 1e-8.
    ///
    /// Returns the adjusted problem and a summary. Non-convergence is not an
    /// error: the last iterate is kept and `converged` is false (the caller
    /// decides whether to warn or retry with more data).
    pub fn optimize(self) -> (Self, OptimizeSummary) {
        use levenberg_marquardt_sparse::LevenbergMarquardt;

        let initial_rmse = self.rmse();
        tracing::info!(
            nobs = self.observed.ncols(),
            ncams = self.cams.len(),
            npts = self.points.ncols(),
            initial_rmse,
            "starting bundle adjustment"
        );

        let (adjusted, report) = LevenbergMarquardt::new()
            .with_ftol(1e-8)
            .minimize(self);

        let final_rmse = adjusted.rmse();
        let converged = report.termination.was_successful();
        if !converged {
            tracing::warn!(
                ?report.termination,
                "bundle adjustment did not converge; keeping last iterate"
            );
        }
        tracing::info!(final_rmse, "bundle adjustment finished");
        (
            adjusted,
            OptimizeSummary {
                initial_rmse,
                final_rmse,
                converged,
                evaluations: report.number_of_evaluations,
            },
        )
    }

    fn pack_params(&self) -> na::DVector<f64> {
        let mut params = Vec::with_capacity(self.params_cache.nrows());
        for (i, cam) in self.cams.iter().enumerate() {
            if i == self.anchor_idx {
                continue;
            }
            let v = cam
                .extrinsics_to_vector()
                .expect("validated in constructor");
            params.extend(v.iter());
        }
        params.extend(self.points.as_slice());
        na::DVector::from_vec(params)
    }

    /// Residual pair of observation `i` given a camera pose and point.
    fn residual_pair(&self, i: usize, e: &CamExtrinsics, pt: &na::Vector3<f64>) -> (f64, f64) {
        let cam = &self.cams[self.cam_idx[i]];
        let intr = &cam.intrinsics;
        let pc = e.rotation * pt + e.translation;
        let predicted_x = intr.fx() * (pc.x / pc.z) + intr.cx();
        let predicted_y = intr.fy() * (pc.y / pc.z) + intr.cy();
        let obs = self.observed.column(i);
        (obs.x - predicted_x, obs.y - predicted_y)
    }
}

#[inline]
fn free_cam_slot(cam_idx: usize, anchor_idx: usize) -> Option<usize> {
    use std::cmp::Ordering::*;
    match cam_idx.cmp(&anchor_idx) {
        Less => Some(cam_idx),
        Equal => None,
        Greater => Some(cam_idx - 1),
    }
}

pub fn rmse_of_residuals(r: &na::DVector<f64>) -> f64 {
    // residuals are (dx, dy) pairs; RMSE is over per-observation distances
    let n = r.nrows() / 2;
    if n == 0 {
        return 0.0;
    }
    let sum_sq: f64 = r.iter().map(|v| v * v).sum();
    (sum_sq / n as f64).sqrt()
}

impl levenberg_marquardt_sparse::LeastSquaresProblem<f64, Dyn, Dyn> for BundleAdjuster {
    type ParameterStorage = Owned<f64, Dyn>;
    type ResidualStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, x: &na::DVector<f64>) {
        debug_assert_eq!(x.nrows(), self.params_cache.nrows());
        self.params_cache = x.clone();

        let n_free_cams = self.cams.len() - 1;
        let (cam_params, point_params) = x.as_slice().split_at(n_free_cams * CAM_PARAMS);

        let mut chunks = cam_params.chunks_exact(CAM_PARAMS);
        for (i, cam) in self.cams.iter_mut().enumerate() {
            if i == self.anchor_idx {
                continue;
            }
            let chunk = chunks.next().expect("sized in constructor");
            cam.extrinsics_from_vector(&na::SVector::<f64, 6>::from_column_slice(chunk));
        }

        self.points = na::Matrix3xX::from_column_slice(point_params);
    }

    fn params(&self) -> na::DVector<f64> {
        self.params_cache.clone()
    }

    fn residuals(&self) -> Option<na::DVector<f64>> {
        let mut residuals = na::DVector::zeros(self.nresid);
        for i in 0..self.observed.ncols() {
            let cam = &self.cams[self.cam_idx[i]];
            let e = cam.extrinsics.as_ref()?;
            let pt = self.points.column(self.pt_idx[i]).into_owned();
            let (dx, dy) = self.residual_pair(i, e, &pt);
            residuals[2 * i] = dx;
            residuals[2 * i + 1] = dy;
        }
        Some(residuals)
    }

    /// Central-difference Jacobian over the 9 parameters each observation
    /// actually depends on; every other entry stays zero. The column layout
    /// was fixed at construction and is reused unchanged each iteration.
    fn jacobian(&self) -> Option<levenberg_marquardt_sparse::SparseJacobian<f64>> {
        let mut j = na::OMatrix::<f64, Dyn, Dyn>::zeros(self.nresid, self.params_cache.nrows());

        for i in 0..self.observed.ncols() {
            let (cam_col, pt_col) = self.block_cols[i];
            let cam = &self.cams[self.cam_idx[i]];
            let e = cam.extrinsics.as_ref()?;
            let pt = self.points.column(self.pt_idx[i]).into_owned();
            let ridx = 2 * i;

            if let Some(col0) = cam_col {
                let base = e.to_vector();
                for p in 0..CAM_PARAMS {
                    let h = JAC_STEP * (1.0 + base[p].abs());
                    let mut plus = base;
                    plus[p] += h;
                    let mut minus = base;
                    minus[p] -= h;
                    let (rx_p, ry_p) =
                        self.residual_pair(i, &CamExtrinsics::from_vector(&plus), &pt);
                    let (rx_m, ry_m) =
                        self.residual_pair(i, &CamExtrinsics::from_vector(&minus), &pt);
                    j[(ridx, col0 + p)] = (rx_p - rx_m) / (2.0 * h);
                    j[(ridx + 1, col0 + p)] = (ry_p - ry_m) / (2.0 * h);
                }
            }

            for p in 0..PT_PARAMS {
                let h = JAC_STEP * (1.0 + pt[p].abs());
                let mut plus = pt;
                plus[p] += h;
                let mut minus = pt;
                minus[p] -= h;
                let (rx_p, ry_p) = self.residual_pair(i, e, &plus);
                let (rx_m, ry_m) = self.residual_pair(i, e, &minus);
                j[(ridx, pt_col + p)] = (rx_p - rx_m) / (2.0 * h);
                j[(ridx + 1, pt_col + p)] = (ry_p - ry_m) / (2.0 * h);
            }
        }
        Some(levenberg_marquardt_sparse::SparseJacobian::from_dense(j))
    }
}

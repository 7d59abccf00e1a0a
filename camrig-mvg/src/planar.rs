//! Planar target geometry: homographies and what can be recovered from them.
//!
//! The calibration board is planar, so every view of it induces a
//! board-plane-to-image homography. Homographies drive three things here:
//! seeding charuco corner interpolation, the Zhang-style closed-form
//! initialization of camera intrinsics, and per-view board pose recovery for
//! the calibrators' non-linear refinements.

use nalgebra::{Dyn, Matrix3, OMatrix, Point2, SymmetricEigen, Vector3, U9};
use opencv_ros_camera::RosOpenCvIntrinsics;

use crate::{CamExtrinsics, MvgError, Result};

/// Estimate the homography mapping `src` points to `dst` points by the
/// normalized direct linear transform.
///
/// Requires at least 4 correspondences. The result is scaled so that
/// `h[(2,2)] == 1` when that entry is usable.
pub fn homography_dlt(src: &[Point2<f64>], dst: &[Point2<f64>]) -> Result<Matrix3<f64>> {
    if src.len() != dst.len() || src.len() < 4 {
        return Err(MvgError::NotEnoughPoints);
    }

    let t_src = normalizing_transform(src)?;
    let t_dst = normalizing_transform(dst)?;

    let n = src.len();
    let mut a = OMatrix::<f64, Dyn, U9>::zeros_generic(Dyn(2 * n), U9);
    for (i, (s, d)) in src.iter().zip(dst.iter()).enumerate() {
        let s = apply_h(&t_src, s);
        let d = apply_h(&t_dst, d);
        let (x, y) = (s.x, s.y);
        let (u, v) = (d.x, d.y);

        let r0 = 2 * i;
        a[(r0, 0)] = -x;
        a[(r0, 1)] = -y;
        a[(r0, 2)] = -1.0;
        a[(r0, 6)] = u * x;
        a[(r0, 7)] = u * y;
        a[(r0, 8)] = u;

        let r1 = r0 + 1;
        a[(r1, 3)] = -x;
        a[(r1, 4)] = -y;
        a[(r1, 5)] = -1.0;
        a[(r1, 6)] = v * x;
        a[(r1, 7)] = v * y;
        a[(r1, 8)] = v;
    }

    let h_vec = smallest_eigenvector_9(&a)?;
    let h_norm = Matrix3::new(
        h_vec[0], h_vec[1], h_vec[2], //
        h_vec[3], h_vec[4], h_vec[5], //
        h_vec[6], h_vec[7], h_vec[8],
    );

    let t_dst_inv = t_dst
        .try_inverse()
        .ok_or(MvgError::DegenerateGeometry("singular normalization"))?;
    let mut h = t_dst_inv * h_norm * t_src;
    if h[(2, 2)].abs() > 1e-12 {
        h /= h[(2, 2)];
    }
    Ok(h)
}

/// Hartley normalization: translate the centroid to the origin and scale the
/// mean distance to sqrt(2).
fn normalizing_transform(pts: &[Point2<f64>]) -> Result<Matrix3<f64>> {
    let n = pts.len() as f64;
    let cx = pts.iter().map(|p| p.x).sum::<f64>() / n;
    let cy = pts.iter().map(|p| p.y).sum::<f64>() / n;
    let mean_dist = pts
        .iter()
        .map(|p| ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    if mean_dist < 1e-12 {
        return Err(MvgError::DegenerateGeometry("coincident points"));
    }
    let s = 2.0_f64.sqrt() / mean_dist;
    Ok(Matrix3::new(
        s, 0.0, -s * cx, //
        0.0, s, -s * cy, //
        0.0, 0.0, 1.0,
    ))
}

fn apply_h(h: &Matrix3<f64>, p: &Point2<f64>) -> Point2<f64> {
    let v = h * Vector3::new(p.x, p.y, 1.0);
    Point2::new(v.x / v.z, v.y / v.z)
}

/// Null-space vector of `a` via the eigendecomposition of `aᵀa`.
///
/// Works for any row count >= 4 correspondences, unlike a thin SVD of the
/// stacked system.
fn smallest_eigenvector_9(a: &OMatrix<f64, Dyn, U9>) -> Result<nalgebra::SVector<f64, 9>> {
    let ata = a.transpose() * a;
    let eig = SymmetricEigen::new(ata);
    let mut min_idx = 0;
    for i in 1..9 {
        if eig.eigenvalues[i] < eig.eigenvalues[min_idx] {
            min_idx = i;
        }
    }
    Ok(eig.eigenvectors.column(min_idx).into_owned())
}

/// Closed-form intrinsic initialization from board homographies (Zhang's
/// method), assuming zero skew.
///
/// Needs at least two views with distinct board orientations. When the
/// geometry is degenerate (all boards near-parallel, numerically indefinite
/// `B`), falls back to a focal guess from the image diagonal with the
/// principal point at the image center; the subsequent non-linear refinement
/// recovers from that starting point in practice.
pub fn intrinsics_from_homographies(
    homographies: &[Matrix3<f64>],
    size: (u32, u32),
) -> RosOpenCvIntrinsics<f64> {
    match zhang_closed_form(homographies) {
        Some((fx, fy, cx, cy))
            if fx.is_finite()
                && fy.is_finite()
                && fx > 0.0
                && fy > 0.0
                && cx > 0.0
                && cx < size.0 as f64
                && cy > 0.0
                && cy < size.1 as f64 =>
        {
            RosOpenCvIntrinsics::from_params(fx, 0.0, fy, cx, cy)
        }
        _ => {
            tracing::warn!(
                "Zhang initialization degenerate for {} homographies; \
                 falling back to image-size focal guess",
                homographies.len()
            );
            fallback_intrinsics(size)
        }
    }
}

fn fallback_intrinsics(size: (u32, u32)) -> RosOpenCvIntrinsics<f64> {
    let f = 1.2 * size.0.max(size.1) as f64;
    RosOpenCvIntrinsics::from_params(f, 0.0, f, size.0 as f64 / 2.0, size.1 as f64 / 2.0)
}

fn zhang_closed_form(homographies: &[Matrix3<f64>]) -> Option<(f64, f64, f64, f64)> {
    if homographies.len() < 2 {
        return None;
    }

    // Each homography contributes the two constraints
    //   v_12ᵀ b = 0 and (v_11 - v_22)ᵀ b = 0
    // on b = [B11, B12, B22, B13, B23, B33]; the zero-skew assumption adds
    // the row B12 = 0.
    let nrows = homographies.len() * 2 + 1;
    let mut v = OMatrix::<f64, Dyn, nalgebra::U6>::zeros_generic(Dyn(nrows), nalgebra::U6);
    for (i, h) in homographies.iter().enumerate() {
        let v12 = zhang_v(h, 0, 1);
        let v11 = zhang_v(h, 0, 0);
        let v22 = zhang_v(h, 1, 1);
        for c in 0..6 {
            v[(2 * i, c)] = v12[c];
            v[(2 * i + 1, c)] = v11[c] - v22[c];
        }
    }
    v[(nrows - 1, 1)] = 1.0;

    let vtv = v.transpose() * &v;
    let eig = SymmetricEigen::new(vtv);
    let mut min_idx = 0;
    for i in 1..6 {
        if eig.eigenvalues[i] < eig.eigenvalues[min_idx] {
            min_idx = i;
        }
    }
    let mut b = eig.eigenvectors.column(min_idx).into_owned();
    if b[0] < 0.0 {
        b = -b;
    }
    let (b11, b12, b22, b13, b23, b33) = (b[0], b[1], b[2], b[3], b[4], b[5]);

    let den = b11 * b22 - b12 * b12;
    if den.abs() < 1e-18 || b11.abs() < 1e-18 {
        return None;
    }
    let v0 = (b12 * b13 - b11 * b23) / den;
    let lambda = b33 - (b13 * b13 + v0 * (b12 * b13 - b11 * b23)) / b11;
    if lambda / b11 <= 0.0 || lambda * b11 / den <= 0.0 {
        return None;
    }
    let alpha = (lambda / b11).sqrt();
    let beta = (lambda * b11 / den).sqrt();
    let u0 = -b13 * alpha * alpha / lambda;
    Some((alpha, beta, u0, v0))
}

fn zhang_v(h: &Matrix3<f64>, i: usize, j: usize) -> [f64; 6] {
    let hi = h.column(i);
    let hj = h.column(j);
    [
        hi[0] * hj[0],
        hi[0] * hj[1] + hi[1] * hj[0],
        hi[1] * hj[1],
        hi[2] * hj[0] + hi[0] * hj[2],
        hi[2] * hj[1] + hi[1] * hj[2],
        hi[2] * hj[2],
    ]
}

/// Recover the board pose (board frame to camera frame) from a board-to-image
/// homography and known intrinsics.
///
/// The sign is fixed so the board lies in front of the camera; the rotation
/// is re-orthonormalized by SVD since the two homography columns are only
/// approximately orthogonal under noise.
pub fn pose_from_homography(k: &Matrix3<f64>, h: &Matrix3<f64>) -> Result<CamExtrinsics> {
    let k_inv = k
        .try_inverse()
        .ok_or(MvgError::DegenerateGeometry("singular intrinsic matrix"))?;
    let m = k_inv * h;

    let c0: Vector3<f64> = m.column(0).into_owned();
    let c1: Vector3<f64> = m.column(1).into_owned();
    let c2: Vector3<f64> = m.column(2).into_owned();

    let norm0 = c0.norm();
    if norm0 < 1e-12 {
        return Err(MvgError::DegenerateGeometry("zero-scale homography"));
    }
    let mut lambda = 1.0 / norm0;
    if (lambda * c2).z < 0.0 {
        lambda = -lambda;
    }

    let r1 = lambda * c0;
    let r2 = lambda * c1;
    let r3 = r1.cross(&r2);
    let t = lambda * c2;

    let r_approx = Matrix3::from_columns(&[r1, r2, r3]);
    let svd = r_approx.svd(true, true);
    let (u, v_t) = (
        svd.u.ok_or(MvgError::SvdFailed)?,
        svd.v_t.ok_or(MvgError::SvdFailed)?,
    );
    let mut rotation = u * v_t;
    if rotation.determinant() < 0.0 {
        let mut u_fixed = u;
        u_fixed.column_mut(2).neg_mut();
        rotation = u_fixed * v_t;
    }

    Ok(CamExtrinsics {
        rotation,
        translation: t,
    })
}

//! Multi-view DLT triangulation.

use nalgebra::{Dyn, Matrix3x4, OMatrix, Point2, Point3, U4};

use crate::{CameraData, MvgError, Result, UndistortOutput};

/// Linear projection matrix `P = K·[R|t]` for a posed camera.
fn projection_matrix(cam: &CameraData) -> Result<Matrix3x4<f64>> {
    let e = cam.extrinsics()?;
    let k = cam.matrix();
    let mut rt = Matrix3x4::zeros();
    rt.fixed_view_mut::<3, 3>(0, 0).copy_from(&e.rotation);
    rt.fixed_view_mut::<3, 1>(0, 3).copy_from(&e.translation);
    Ok(k * rt)
}

/// Triangulate one 3D point from two or more *undistorted* pixel
/// observations by the direct linear transform.
///
/// Builds the standard stacked system (two rows per view) and takes the
/// right singular vector of the smallest singular value as the homogeneous
/// solution.
pub fn triangulate_dlt_undistorted(
    observations: &[(&CameraData, Point2<f64>)],
) -> Result<Point3<f64>> {
    if observations.len() < 2 {
        return Err(MvgError::NotEnoughPoints);
    }

    let mut a = OMatrix::<f64, Dyn, U4>::zeros_generic(Dyn(2 * observations.len()), U4);
    for (i, (cam, xy)) in observations.iter().enumerate() {
        let p = projection_matrix(cam)?;
        let r0 = p.row(0);
        let r1 = p.row(1);
        let r2 = p.row(2);
        for c in 0..4 {
            a[(2 * i, c)] = xy.x * r2[c] - r0[c];
            a[(2 * i + 1, c)] = xy.y * r2[c] - r1[c];
        }
    }

    let svd = a.svd(true, true);
    let v_t = svd.v_t.ok_or(MvgError::SvdFailed)?;
    let last = v_t.nrows() - 1;
    let x = v_t.row(last);
    if x[3].abs() < 1e-15 {
        return Err(MvgError::DegenerateGeometry("point at infinity"));
    }
    Ok(Point3::new(x[0] / x[3], x[1] / x[3], x[2] / x[3]))
}

/// Triangulate one 3D point from raw (distorted) pixel observations.
///
/// Undistorts each observation through its camera's lens model first, then
/// solves the linear system against the distortion-free projections.
pub fn triangulate_dlt(observations: &[(&CameraData, Point2<f64>)]) -> Result<Point3<f64>> {
    let undistorted: Vec<(&CameraData, Point2<f64>)> = observations
        .iter()
        .map(|(cam, xy)| (*cam, cam.undistort_points(&[*xy], UndistortOutput::Pixel)[0]))
        .collect();
    triangulate_dlt_undistorted(&undistorted)
}

/// Triangulate matched point arrays from a calibrated stereo pair.
///
/// `pts_a[k]` and `pts_b[k]` must observe the same semantic point; inputs are
/// raw pixel coordinates and are undistorted here.
pub fn stereo_triangulate(
    cam_a: &CameraData,
    cam_b: &CameraData,
    pts_a: &[Point2<f64>],
    pts_b: &[Point2<f64>],
) -> Result<Vec<Point3<f64>>> {
    if pts_a.len() != pts_b.len() {
        return Err(MvgError::NotEnoughPoints);
    }
    let ua = cam_a.undistort_points(pts_a, UndistortOutput::Pixel);
    let ub = cam_b.undistort_points(pts_b, UndistortOutput::Pixel);
    ua.iter()
        .zip(ub.iter())
        .map(|(a, b)| triangulate_dlt_undistorted(&[(cam_a, *a), (cam_b, *b)]))
        .collect()
}

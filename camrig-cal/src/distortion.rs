//! Forward Brown-Conrady projection used inside the calibration residuals.
//!
//! The optimizers evaluate this model many thousands of times per Jacobian,
//! so it is written directly over the parameter slices instead of
//! round-tripping through camera structs on every call.

use nalgebra::{Point2, Point3};

use camrig_mvg::CamExtrinsics;

/// Intrinsic parameter block as optimized: `[fx, fy, cx, cy, k1, k2, p1,
/// p2, k3]`.
pub const INTRINSIC_PARAMS: usize = 9;

/// Project a world/board point through a pose and the full distortion model
/// to distorted pixel coordinates.
pub fn project_brown_conrady(
    intr: &[f64],
    pose: &CamExtrinsics,
    p: &Point3<f64>,
) -> Point2<f64> {
    debug_assert_eq!(intr.len(), INTRINSIC_PARAMS);
    let [fx, fy, cx, cy, k1, k2, p1, p2, k3] =
        [
            intr[0], intr[1], intr[2], intr[3], intr[4], intr[5], intr[6], intr[7], intr[8],
        ];

    let pc = pose.rotation * p.coords + pose.translation;
    let xn = pc.x / pc.z;
    let yn = pc.y / pc.z;

    let r2 = xn * xn + yn * yn;
    let radial = 1.0 + k1 * r2 + k2 * r2 * r2 + k3 * r2 * r2 * r2;
    let xd = xn * radial + 2.0 * p1 * xn * yn + p2 * (r2 + 2.0 * xn * xn);
    let yd = yn * radial + p1 * (r2 + 2.0 * yn * yn) + 2.0 * p2 * xn * yn;

    Point2::new(fx * xd + cx, fy * yd + cy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use camrig_mvg::CameraData;
    use nalgebra::{SVector, Vector5};

    #[test]
    fn matches_camera_model_projection() {
        let mut cam = CameraData::new(0, (1280, 720), 0);
        cam.set_intrinsics_from_params(
            950.0,
            940.0,
            640.0,
            360.0,
            Vector5::new(-0.2, 0.1, 0.003, -0.002, 0.01),
        );
        let pose = CamExtrinsics::from_vector(&SVector::<f64, 6>::new(
            0.1, -0.2, 0.05, 0.1, 0.05, 0.3,
        ));
        cam.extrinsics = Some(pose.clone());

        let intr = [950.0, 940.0, 640.0, 360.0, -0.2, 0.1, 0.003, -0.002, 0.01];
        let pts = [
            Point3::new(0.1, 0.2, 1.5),
            Point3::new(-0.3, 0.1, 2.0),
            Point3::new(0.0, -0.2, 1.2),
        ];
        let expected = cam.project(&pts).unwrap();
        for (p, e) in pts.iter().zip(expected.iter()) {
            let got = project_brown_conrady(&intr, &pose, p);
            assert_relative_eq!((got - e).norm(), 0.0, epsilon = 1e-9);
        }
    }
}

use nalgebra::{Dyn, Matrix3, Point2, Point3, SVector, UnitQuaternion, Vector3, Vector5, U2};
use opencv_ros_camera::{Distortion, RosOpenCvIntrinsics, UndistortedPixels};
use serde::{Deserialize, Serialize};

use camrig_types::Port;

use crate::{MvgError, Result};

/// World-to-camera rigid transform: `x_cam = rotation * x_world + translation`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CamExtrinsics {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

impl CamExtrinsics {
    pub fn identity() -> Self {
        Self {
            rotation: Matrix3::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Encode as a 6-vector: elements 0..2 are the Rodrigues axis-angle of
    /// the world-to-camera rotation, elements 3..5 the world-to-camera
    /// translation.
    ///
    /// Three rotation parameters keep the bundle-adjustment Jacobian free of
    /// the over-parameterization a quaternion or matrix encoding would add.
    pub fn to_vector(&self) -> SVector<f64, 6> {
        let rquat = UnitQuaternion::from_matrix(&self.rotation);
        let rod = rquat.scaled_axis();
        SVector::<f64, 6>::new(
            rod.x,
            rod.y,
            rod.z,
            self.translation.x,
            self.translation.y,
            self.translation.z,
        )
    }

    /// Inverse of [`Self::to_vector`].
    pub fn from_vector(v: &SVector<f64, 6>) -> Self {
        let rquat = UnitQuaternion::new(Vector3::new(v[0], v[1], v[2]));
        Self {
            rotation: rquat.to_rotation_matrix().into_inner(),
            translation: Vector3::new(v[3], v[4], v[5]),
        }
    }

    /// Apply `self` after `inner`: the composed transform maps through
    /// `inner`'s target frame into `self`'s.
    pub fn compose_with(&self, inner: &Self) -> Self {
        Self {
            rotation: self.rotation * inner.rotation,
            translation: self.rotation * inner.translation + self.translation,
        }
    }

    pub fn inverse(&self) -> Self {
        let rt = self.rotation.transpose();
        Self {
            rotation: rt,
            translation: -(rt * self.translation),
        }
    }

    /// Camera position in the world frame.
    pub fn camcenter(&self) -> Point3<f64> {
        Point3::from(-(self.rotation.transpose() * self.translation))
    }

    /// Convert to the `cam-geom` extrinsics representation.
    pub fn as_cam_geom(&self) -> cam_geom::ExtrinsicParameters<f64> {
        let rquat = UnitQuaternion::from_matrix(&self.rotation);
        cam_geom::ExtrinsicParameters::from_rotation_and_camcenter(rquat, self.camcenter())
    }

    pub fn transform_point(&self, p: &Point3<f64>) -> Point3<f64> {
        Point3::from(self.rotation * p.coords + self.translation)
    }
}

/// Which coordinates [`CameraData::undistort_points`] should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndistortOutput {
    /// Undistorted pixel coordinates (the intrinsic matrix still applied).
    Pixel,
    /// Normalized camera coordinates (intrinsic matrix removed).
    Normalized,
}

/// A single camera: resolution, intrinsics, optional pose, and calibration
/// bookkeeping.
///
/// Intrinsics are mutated only by the intrinsic calibrator; extrinsics only
/// by the camera array builder and the bundle adjuster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraData {
    pub port: Port,
    /// (width, height) in pixels.
    pub size: (u32, u32),
    pub intrinsics: RosOpenCvIntrinsics<f64>,
    pub extrinsics: Option<CamExtrinsics>,
    /// Quarter turns needed to display frames upright.
    pub rotation_count: i8,
    /// RMSE of the last intrinsic calibration, pixels.
    pub error: Option<f64>,
    /// Number of board views used by the last intrinsic calibration.
    pub grid_count: Option<u32>,
    /// Excluded from the pipeline (e.g. calibration failed and the user chose
    /// to continue without this camera).
    pub ignored: bool,
}

impl CameraData {
    /// A camera with placeholder intrinsics: focal length guessed from the
    /// larger image dimension, principal point at the image center, no
    /// distortion.
    pub fn new(port: Port, size: (u32, u32), rotation_count: i8) -> Self {
        let f = size.0.max(size.1) as f64;
        let cx = size.0 as f64 / 2.0;
        let cy = size.1 as f64 / 2.0;
        let intrinsics = RosOpenCvIntrinsics::from_params(f, 0.0, f, cx, cy);
        Self {
            port,
            size,
            intrinsics,
            extrinsics: None,
            rotation_count,
            error: None,
            grid_count: None,
            ignored: false,
        }
    }

    pub fn set_intrinsics_from_params(
        &mut self,
        fx: f64,
        fy: f64,
        cx: f64,
        cy: f64,
        distortions: Vector5<f64>,
    ) {
        let distortion = Distortion::from_opencv_vec(distortions);
        self.intrinsics =
            RosOpenCvIntrinsics::from_params_with_distortion(fx, 0.0, fy, cx, cy, distortion);
    }

    /// The 3x3 intrinsic matrix.
    pub fn matrix(&self) -> Matrix3<f64> {
        self.intrinsics.k
    }

    /// Brown-Conrady coefficients `[k1, k2, p1, p2, k3]`.
    pub fn distortions(&self) -> Vector5<f64> {
        self.intrinsics.distortion.opencv_vec().clone_owned()
    }

    pub fn extrinsics(&self) -> Result<&CamExtrinsics> {
        self.extrinsics
            .as_ref()
            .ok_or(MvgError::MissingExtrinsics(self.port))
    }

    /// See [`CamExtrinsics::to_vector`]. The anchor camera's vector is all
    /// zeros by construction.
    pub fn extrinsics_to_vector(&self) -> Result<SVector<f64, 6>> {
        Ok(self.extrinsics()?.to_vector())
    }

    pub fn extrinsics_from_vector(&mut self, v: &SVector<f64, 6>) {
        self.extrinsics = Some(CamExtrinsics::from_vector(v));
    }

    /// Map distorted pixel coordinates back through the lens model.
    ///
    /// The Brown-Conrady model has no closed-form inverse; the underlying
    /// implementation iterates a Newton-style compensation until the forward
    /// model reproduces the input pixel.
    pub fn undistort_points(
        &self,
        points: &[Point2<f64>],
        output: UndistortOutput,
    ) -> Vec<Point2<f64>> {
        if points.is_empty() {
            return Vec::new();
        }
        let data = nalgebra::OMatrix::<f64, Dyn, U2>::from_fn_generic(
            Dyn(points.len()),
            U2,
            |r, c| points[r][c],
        );
        let pixels = cam_geom::Pixels::new(data);
        let undistorted = self.intrinsics.undistort(&pixels);

        let fx = self.intrinsics.fx();
        let fy = self.intrinsics.fy();
        let cx = self.intrinsics.cx();
        let cy = self.intrinsics.cy();

        (0..points.len())
            .map(|i| {
                let u = undistorted.data[(i, 0)];
                let v = undistorted.data[(i, 1)];
                match output {
                    UndistortOutput::Pixel => Point2::new(u, v),
                    UndistortOutput::Normalized => {
                        Point2::new((u - cx) / fx, (v - cy) / fy)
                    }
                }
            })
            .collect()
    }

    /// World-to-image projection through the full lens model (distorted
    /// pixel coordinates, directly comparable to raw detections).
    pub fn project(&self, points: &[Point3<f64>]) -> Result<Vec<Point2<f64>>> {
        let linear = self.project_linear(points)?;
        if linear.is_empty() {
            return Ok(linear);
        }
        let data = nalgebra::OMatrix::<f64, Dyn, U2>::from_fn_generic(
            Dyn(linear.len()),
            U2,
            |r, c| linear[r][c],
        );
        let undistorted = UndistortedPixels { data };
        let distorted = self.intrinsics.distort(&undistorted);
        Ok((0..linear.len())
            .map(|i| Point2::new(distorted.data[(i, 0)], distorted.data[(i, 1)]))
            .collect())
    }

    /// World-to-image projection without distortion (undistorted pixel
    /// coordinates). This is the projection the bundle adjuster and quality
    /// controller compare against, since their observations are undistorted.
    pub fn project_linear(&self, points: &[Point3<f64>]) -> Result<Vec<Point2<f64>>> {
        let e = self.extrinsics()?;
        let fx = self.intrinsics.fx();
        let fy = self.intrinsics.fy();
        let cx = self.intrinsics.cx();
        let cy = self.intrinsics.cy();
        Ok(points
            .iter()
            .map(|p| {
                let pc = e.rotation * p.coords + e.translation;
                let xn = pc.x / pc.z;
                let yn = pc.y / pc.z;
                Point2::new(fx * xn + cx, fy * yn + cy)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn extrinsic_vector_roundtrip() {
        for (axis, angle, t) in [
            (Vector3::x_axis(), 0.3, Vector3::new(0.1, -0.2, 0.35)),
            (Vector3::y_axis(), -1.2, Vector3::new(-1.0, 0.0, 2.0)),
            (Vector3::z_axis(), 2.9, Vector3::new(0.0, 0.0, 0.0)),
        ] {
            let rotation = UnitQuaternion::from_axis_angle(&axis, angle)
                .to_rotation_matrix()
                .into_inner();
            let e = CamExtrinsics {
                rotation,
                translation: t,
            };
            let e2 = CamExtrinsics::from_vector(&e.to_vector());
            assert_relative_eq!(
                (e.rotation - e2.rotation).norm(),
                0.0,
                epsilon = 1e-9
            );
            assert_relative_eq!(
                (e.translation - e2.translation).norm(),
                0.0,
                epsilon = 1e-9
            );
        }
    }

    #[test]
    fn identity_extrinsics_vector_is_zero() {
        let v = CamExtrinsics::identity().to_vector();
        assert_relative_eq!(v.norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn compose_and_inverse() {
        let a = CamExtrinsics::from_vector(&SVector::<f64, 6>::new(
            0.1, -0.2, 0.3, 1.0, 2.0, 3.0,
        ));
        let b = CamExtrinsics::from_vector(&SVector::<f64, 6>::new(
            -0.3, 0.1, 0.05, -1.0, 0.5, 0.2,
        ));
        let p = Point3::new(0.4, -0.7, 2.2);
        let via_compose = b.compose_with(&a).transform_point(&p);
        let via_steps = b.transform_point(&a.transform_point(&p));
        assert_relative_eq!((via_compose - via_steps).norm(), 0.0, epsilon = 1e-12);

        let round = a.inverse().transform_point(&a.transform_point(&p));
        assert_relative_eq!((round - p).norm(), 0.0, epsilon = 1e-12);
    }

    /// Distort a grid of synthetic points, then undistort, with the lens of
    /// the single-camera distortion scenario (k1=-0.2, k2=0.1).
    #[test]
    fn undistort_inverts_distort() {
        let mut cam = CameraData::new(0, (1280, 720), 0);
        cam.set_intrinsics_from_params(
            1000.0,
            1000.0,
            640.0,
            360.0,
            Vector5::new(-0.2, 0.1, 0.0, 0.0, 0.0),
        );

        // 21x21 grid over the inner 80% of the image
        let mut total_err = 0.0;
        let mut n = 0;
        for i in 0..21 {
            for j in 0..21 {
                let x = 128.0 + (1280.0 - 2.0 * 128.0) * i as f64 / 20.0;
                let y = 72.0 + (720.0 - 2.0 * 72.0) * j as f64 / 20.0;

                let data = nalgebra::OMatrix::<f64, nalgebra::U1, U2>::new(x, y);
                let distorted = cam.intrinsics.distort(&UndistortedPixels { data });
                let dpt = Point2::new(distorted.data[(0, 0)], distorted.data[(0, 1)]);

                let upt = cam.undistort_points(&[dpt], UndistortOutput::Pixel)[0];
                total_err += (upt - Point2::new(x, y)).norm();
                n += 1;
            }
        }
        let mean_err = total_err / n as f64;
        assert!(
            mean_err < 1e-3,
            "mean undistortion error too large: {mean_err}"
        );
    }

    #[test]
    fn project_then_undistort_matches_linear_projection() {
        let mut cam = CameraData::new(0, (1280, 720), 0);
        cam.set_intrinsics_from_params(
            900.0,
            910.0,
            630.0,
            370.0,
            Vector5::new(-0.1, 0.02, 0.001, -0.001, 0.0),
        );
        cam.extrinsics = Some(CamExtrinsics::from_vector(&SVector::<f64, 6>::new(
            0.05, -0.02, 0.01, 0.1, -0.05, 0.2,
        )));

        let pts = crate::test_support::world_grid();
        let distorted = cam.project(&pts).unwrap();
        let linear = cam.project_linear(&pts).unwrap();
        let undistorted = cam.undistort_points(&distorted, UndistortOutput::Pixel);

        for (u, l) in undistorted.iter().zip(linear.iter()) {
            assert_relative_eq!((u - l).norm(), 0.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn normalized_output_removes_intrinsic_matrix() {
        let mut cam = CameraData::new(0, (640, 480), 0);
        cam.set_intrinsics_from_params(500.0, 500.0, 320.0, 240.0, Vector5::zeros());
        let n = cam.undistort_points(
            &[Point2::new(320.0, 240.0), Point2::new(820.0, 240.0)],
            UndistortOutput::Normalized,
        );
        assert_relative_eq!(n[0].x, 0.0, epsilon = 1e-12);
        assert_relative_eq!(n[0].y, 0.0, epsilon = 1e-12);
        assert_relative_eq!(n[1].x, 1.0, epsilon = 1e-12);
    }
}

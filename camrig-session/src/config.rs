//! The session configuration file.
//!
//! One human-readable `config.toml` per session, with a `charuco` table, one
//! `cam_{port}` table per camera, one `stereo_{a}_{b}` table per calibrated
//! pair, and `capture_volume` / `point_estimates` tables once the final
//! optimization has run. Everything is plain serde over TOML tables so the
//! file stays hand-editable.

use std::path::{Path, PathBuf};

use nalgebra::{Matrix3, Vector3, Vector5};
use serde::{Deserialize, Serialize};

use camrig_board::BoardSpec;
use camrig_mvg::{CamExtrinsics, CameraData, PairPose};
use camrig_types::Port;
use camrig_vol::PointEstimates;

use crate::{Result, SessionError};

const INCHES_PER_CM: f64 = 0.393701;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharucoConfig {
    pub columns: u32,
    pub rows: u32,
    pub board_height: f64,
    pub board_width: f64,
    pub dictionary: String,
    pub units: String,
    pub aruco_scale: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub square_size_override_cm: Option<f64>,
    #[serde(default)]
    pub inverted: bool,
}

impl CharucoConfig {
    fn dimension_cm(&self, value: f64) -> f64 {
        if self.units == "inch" {
            value / INCHES_PER_CM
        } else {
            value
        }
    }

    /// Resolved square edge length in meters: a measured printed size wins
    /// over the size derived from the board dimensions.
    pub fn square_edge_length_m(&self) -> f64 {
        if let Some(override_cm) = self.square_size_override_cm {
            return override_cm / 100.0;
        }
        let height_m = self.dimension_cm(self.board_height) / 100.0;
        let width_m = self.dimension_cm(self.board_width) / 100.0;
        (height_m / self.rows as f64).min(width_m / self.columns as f64)
    }

    pub fn to_board_spec(&self) -> BoardSpec {
        BoardSpec::new(
            self.columns,
            self.rows,
            self.square_edge_length_m(),
            self.dictionary.clone(),
            self.aruco_scale,
            self.inverted,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    pub port: Port,
    pub size: (u32, u32),
    pub rotation_count: i8,
    pub matrix: [[f64; 3]; 3],
    pub distortions: [f64; 5],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grid_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposure: Option<i64>,
    #[serde(default)]
    pub ignore: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_resolutions: Option<Vec<(u32, u32)>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<[[f64; 3]; 3]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translation: Option<[f64; 3]>,
}

impl CameraConfig {
    pub fn from_camera(cam: &CameraData) -> Self {
        let k = cam.matrix();
        let d = cam.distortions();
        let matrix = [
            [k[(0, 0)], k[(0, 1)], k[(0, 2)]],
            [k[(1, 0)], k[(1, 1)], k[(1, 2)]],
            [k[(2, 0)], k[(2, 1)], k[(2, 2)]],
        ];
        let (rotation, translation) = match &cam.extrinsics {
            Some(e) => {
                let r = e.rotation;
                (
                    Some([
                        [r[(0, 0)], r[(0, 1)], r[(0, 2)]],
                        [r[(1, 0)], r[(1, 1)], r[(1, 2)]],
                        [r[(2, 0)], r[(2, 1)], r[(2, 2)]],
                    ]),
                    Some([e.translation.x, e.translation.y, e.translation.z]),
                )
            }
            None => (None, None),
        };
        Self {
            port: cam.port,
            size: cam.size,
            rotation_count: cam.rotation_count,
            matrix,
            distortions: [d[0], d[1], d[2], d[3], d[4]],
            error: cam.error,
            grid_count: cam.grid_count,
            exposure: None,
            ignore: cam.ignored,
            verified_resolutions: None,
            rotation,
            translation,
        }
    }

    pub fn to_camera(&self) -> CameraData {
        let mut cam = CameraData::new(self.port, self.size, self.rotation_count);
        cam.set_intrinsics_from_params(
            self.matrix[0][0],
            self.matrix[1][1],
            self.matrix[0][2],
            self.matrix[1][2],
            Vector5::from_column_slice(&self.distortions),
        );
        cam.error = self.error;
        cam.grid_count = self.grid_count;
        cam.ignored = self.ignore;
        if let (Some(r), Some(t)) = (&self.rotation, &self.translation) {
            cam.extrinsics = Some(CamExtrinsics {
                rotation: Matrix3::new(
                    r[0][0], r[0][1], r[0][2], //
                    r[1][0], r[1][1], r[1][2], //
                    r[2][0], r[2][1], r[2][2],
                ),
                translation: Vector3::new(t[0], t[1], t[2]),
            });
        }
        cam
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StereoPairConfig {
    pub rotation: [[f64; 3]; 3],
    pub translation: [f64; 3],
    #[serde(rename = "RMSE")]
    pub rmse: f64,
    #[serde(default)]
    pub grid_count: u32,
}

impl StereoPairConfig {
    pub fn from_pair_pose(pose: &PairPose) -> Self {
        let r = pose.rotation;
        Self {
            rotation: [
                [r[(0, 0)], r[(0, 1)], r[(0, 2)]],
                [r[(1, 0)], r[(1, 1)], r[(1, 2)]],
                [r[(2, 0)], r[(2, 1)], r[(2, 2)]],
            ],
            translation: [
                pose.translation.x,
                pose.translation.y,
                pose.translation.z,
            ],
            rmse: pose.rmse,
            grid_count: pose.grid_count,
        }
    }

    pub fn to_pair_pose(&self, pair: (Port, Port)) -> PairPose {
        let r = &self.rotation;
        PairPose {
            pair,
            rotation: Matrix3::new(
                r[0][0], r[0][1], r[0][2], //
                r[1][0], r[1][1], r[1][2], //
                r[2][0], r[2][1], r[2][2],
            ),
            translation: Vector3::from_column_slice(&self.translation),
            rmse: self.rmse,
            grid_count: self.grid_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureVolumeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_sync_index: Option<u64>,
    #[serde(rename = "RMSE")]
    pub rmse: f64,
    #[serde(default)]
    pub stage: u32,
}

/// The whole configuration document, keyed by section name.
#[derive(Debug, Clone, Default)]
pub struct Config {
    table: toml::value::Table,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let table: toml::value::Table = toml::from_str(&text)?;
        Ok(Self { table })
    }

    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string(&self.table)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    fn section<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.table.get(key) {
            None => Ok(None),
            Some(value) => value
                .clone()
                .try_into()
                .map(Some)
                .map_err(|e| SessionError::Configuration(format!("section {key}: {e}"))),
        }
    }

    fn set_section<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        let value = toml::Value::try_from(value)
            .map_err(|e| SessionError::Configuration(format!("section {key}: {e}")))?;
        self.table.insert(key.to_string(), value);
        Ok(())
    }

    pub fn charuco(&self) -> Result<Option<CharucoConfig>> {
        let charuco: Option<CharucoConfig> = self.section("charuco")?;
        if let Some(c) = &charuco {
            // Historical config writers aliased board_width to the row
            // count. The field is used exactly as written here, but a file
            // where the two values differ would have behaved differently
            // under the old alias, so surface it.
            if (c.board_width - c.rows as f64).abs() > f64::EPSILON {
                tracing::warn!(
                    board_width = c.board_width,
                    rows = c.rows,
                    "charuco board_width differs from rows; legacy writers aliased these"
                );
            }
        }
        Ok(charuco)
    }

    pub fn set_charuco(&mut self, charuco: &CharucoConfig) -> Result<()> {
        self.set_section("charuco", charuco)
    }

    pub fn camera(&self, port: Port) -> Result<Option<CameraConfig>> {
        self.section(&format!("cam_{port}"))
    }

    pub fn set_camera(&mut self, cam: &CameraData) -> Result<()> {
        self.set_section(&format!("cam_{}", cam.port), &CameraConfig::from_camera(cam))
    }

    /// Every persisted camera, ascending by port.
    pub fn cameras(&self) -> Result<Vec<CameraConfig>> {
        let mut cams = Vec::new();
        for key in self.table.keys() {
            if let Some(port_str) = key.strip_prefix("cam_") {
                if port_str.parse::<Port>().is_ok() {
                    if let Some(cam) = self.section::<CameraConfig>(key)? {
                        cams.push(cam);
                    }
                }
            }
        }
        cams.sort_by_key(|c| c.port);
        Ok(cams)
    }

    pub fn set_stereo_pair(&mut self, pose: &PairPose) -> Result<()> {
        let (a, b) = pose.pair;
        self.set_section(
            &format!("stereo_{a}_{b}"),
            &StereoPairConfig::from_pair_pose(pose),
        )
    }

    /// Every persisted stereo pair pose.
    pub fn stereo_pairs(&self) -> Result<Vec<PairPose>> {
        let mut poses = Vec::new();
        for key in self.table.keys() {
            let Some(rest) = key.strip_prefix("stereo_") else {
                continue;
            };
            let parts: Vec<&str> = rest.split('_').collect();
            let [Ok(a), Ok(b)] = [
                parts.first().map_or(Err(()), |s| s.parse::<Port>().map_err(|_| ())),
                parts.get(1).map_or(Err(()), |s| s.parse::<Port>().map_err(|_| ())),
            ] else {
                continue;
            };
            if let Some(cfg) = self.section::<StereoPairConfig>(key)? {
                poses.push(cfg.to_pair_pose((a, b)));
            }
        }
        Ok(poses)
    }

    pub fn capture_volume(&self) -> Result<Option<CaptureVolumeConfig>> {
        self.section("capture_volume")
    }

    pub fn set_capture_volume(&mut self, cfg: &CaptureVolumeConfig) -> Result<()> {
        self.set_section("capture_volume", cfg)
    }

    /// The serialized point estimates are regenerable from the tracking
    /// pass; persisting them just skips that work on reload.
    pub fn point_estimates(&self) -> Result<Option<PointEstimates>> {
        self.section("point_estimates")
    }

    pub fn set_point_estimates(&mut self, pe: &PointEstimates) -> Result<()> {
        self.set_section("point_estimates", pe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::SVector;

    fn demo_charuco() -> CharucoConfig {
        CharucoConfig {
            columns: 4,
            rows: 5,
            board_height: 11.0,
            board_width: 8.5,
            dictionary: "DICT_4X4_50".into(),
            units: "inch".into(),
            aruco_scale: 0.75,
            square_size_override_cm: None,
            inverted: false,
        }
    }

    #[test]
    fn square_size_override_wins() {
        let mut c = demo_charuco();
        assert!(c.square_edge_length_m() > 0.0);
        c.square_size_override_cm = Some(5.25);
        assert_relative_eq!(c.square_edge_length_m(), 0.0525, epsilon = 1e-12);
    }

    #[test]
    fn inch_units_convert() {
        let c = demo_charuco();
        // 11 in tall / 5 rows vs 8.5 in wide / 4 columns; the smaller wins
        let height_m = 11.0 / INCHES_PER_CM / 100.0;
        let width_m = 8.5 / INCHES_PER_CM / 100.0;
        let expected = (height_m / 5.0).min(width_m / 4.0);
        assert_relative_eq!(c.square_edge_length_m(), expected, epsilon = 1e-12);
    }

    #[test]
    fn config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.set_charuco(&demo_charuco()).unwrap();

        let mut cam = CameraData::new(2, (1280, 720), 1);
        cam.set_intrinsics_from_params(
            1000.0,
            995.0,
            640.0,
            360.0,
            nalgebra::Vector5::new(-0.1, 0.05, 0.001, -0.001, 0.0),
        );
        cam.error = Some(0.21);
        cam.grid_count = Some(24);
        cam.extrinsics = Some(CamExtrinsics::from_vector(&SVector::<f64, 6>::new(
            0.1, -0.2, 0.05, 0.4, -0.1, 0.3,
        )));
        config.set_camera(&cam).unwrap();

        let pose = PairPose {
            pair: (0, 2),
            rotation: Matrix3::identity(),
            translation: Vector3::new(-0.5, 0.0, 0.0),
            rmse: 0.4,
            grid_count: 12,
        };
        config.set_stereo_pair(&pose).unwrap();
        config
            .set_capture_volume(&CaptureVolumeConfig {
                origin_sync_index: Some(14),
                rmse: 0.33,
                stage: 2,
            })
            .unwrap();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        let charuco = loaded.charuco().unwrap().unwrap();
        assert_eq!(charuco, demo_charuco());

        let cams = loaded.cameras().unwrap();
        assert_eq!(cams.len(), 1);
        let restored = cams[0].to_camera();
        assert_eq!(restored.port, 2);
        assert_relative_eq!(restored.intrinsics.fx(), 1000.0, epsilon = 1e-9);
        assert_relative_eq!(restored.distortions()[0], -0.1, epsilon = 1e-12);
        let e = restored.extrinsics.as_ref().unwrap();
        let expected = cam.extrinsics.as_ref().unwrap();
        assert_relative_eq!((e.rotation - expected.rotation).norm(), 0.0, epsilon = 1e-9);

        let pairs = loaded.stereo_pairs().unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].pair, (0, 2));
        assert_relative_eq!(pairs[0].rmse, 0.4, epsilon = 1e-12);

        let cv = loaded.capture_volume().unwrap().unwrap();
        assert_eq!(cv.origin_sync_index, Some(14));
    }

    #[test]
    fn point_estimates_roundtrip() {
        use nalgebra::{Point2, Point3};
        let pe = PointEstimates {
            sync_indices: vec![0, 0],
            camera_indices: vec![0, 1],
            point_ids: vec![4, 4],
            img: vec![Point2::new(1.5, 2.5), Point2::new(3.5, 4.5)],
            obj_indices: vec![0, 0],
            obj: vec![Point3::new(0.1, 0.2, 1.0)],
            obj_point_ids: vec![4],
        };
        let mut config = Config::default();
        config.set_point_estimates(&pe).unwrap();
        let restored = config.point_estimates().unwrap().unwrap();
        assert_eq!(restored, pe);
    }
}

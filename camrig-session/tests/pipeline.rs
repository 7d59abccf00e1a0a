//! Whole-pipeline test on a scripted three-camera recording session:
//! intrinsics → tracking pass → pairwise stereo → array composition →
//! bundle adjustment → quality filter → exports.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use image::RgbImage;
use nalgebra::{Point2, Point3, SVector, Vector5};

use camrig_board::BoardSpec;
use camrig_mvg::{CamExtrinsics, CameraData};
use camrig_session::{AutoPopSettings, CharucoConfig, Session};
use camrig_stream::{FrameTimeHistory, VideoSource, VideoSourceFactory};
use camrig_types::{PointPacket, Port, Tracker};
use camrig_vol::QualityController;

const N_FRAMES: u64 = 30;
const FRAME_SPACING: f64 = 0.6;

/// Serves frames whose first pixels carry the frame index, so the scripted
/// tracker can look up what "was seen" on that frame.
struct ScriptedSource {
    cursor: u64,
}

fn encode_frame(index: u64) -> RgbImage {
    let mut frame = RgbImage::from_pixel(640, 360, image::Rgb([30, 30, 30]));
    for (i, byte) in index.to_le_bytes().iter().enumerate() {
        frame.put_pixel(i as u32, 0, image::Rgb([*byte, 0, 0]));
    }
    frame
}

fn decode_frame(frame: &RgbImage) -> u64 {
    let mut bytes = [0u8; 8];
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = frame.get_pixel(i as u32, 0).0[0];
    }
    u64::from_le_bytes(bytes)
}

impl VideoSource for ScriptedSource {
    fn fps(&self) -> f64 {
        1.0 / FRAME_SPACING
    }
    fn frame_count(&self) -> u64 {
        N_FRAMES
    }
    fn read_frame(&mut self) -> Option<RgbImage> {
        if self.cursor >= N_FRAMES {
            return None;
        }
        let frame = encode_frame(self.cursor);
        self.cursor += 1;
        Some(frame)
    }
    fn seek(&mut self, frame_index: u64) -> camrig_stream::Result<()> {
        self.cursor = frame_index;
        Ok(())
    }
}

struct ScriptedFactory;

impl VideoSourceFactory for ScriptedFactory {
    fn open(&self, _path: &Path, _port: Port) -> camrig_stream::Result<Box<dyn VideoSource>> {
        Ok(Box::new(ScriptedSource { cursor: 0 }))
    }
}

/// "Detects" the pre-computed board observation for (port, frame).
struct ScriptedTracker {
    packets: BTreeMap<(Port, u64), PointPacket>,
}

impl Tracker for ScriptedTracker {
    fn detect(&self, frame: &RgbImage, port: Port, _rotation_count: i8) -> PointPacket {
        let index = decode_frame(frame);
        self.packets
            .get(&(port, index))
            .cloned()
            .unwrap_or_else(PointPacket::empty)
    }
    fn name(&self) -> &str {
        "charuco"
    }
    fn point_name(&self, point_id: u32) -> String {
        format!("corner_{point_id}")
    }
}

fn board() -> BoardSpec {
    // 4x5 squares, 3 cm edge
    BoardSpec::new(4, 5, 0.03, "DICT_4X4_50", 0.75, false)
}

fn true_cameras() -> Vec<CameraData> {
    let poses = [
        [0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        [0.0, -0.25, 0.0, 0.35, 0.02, 0.05],
        [0.15, 0.0, 0.0, 0.02, -0.06, 0.08],
    ];
    poses
        .iter()
        .enumerate()
        .map(|(port, pose)| {
            let mut cam = CameraData::new(port as Port, (640, 360), 0);
            cam.set_intrinsics_from_params(
                500.0,
                498.0,
                320.0,
                180.0,
                Vector5::new(-0.05, 0.01, 0.0, 0.0, 0.0),
            );
            cam.extrinsics = Some(CamExtrinsics::from_vector(
                &SVector::<f64, 6>::from_column_slice(pose),
            ));
            cam
        })
        .collect()
}

/// Board pose (board frame to world frame) at one frame of the recording.
fn board_pose(frame: u64) -> CamExtrinsics {
    let f = frame as f64;
    let rot = nalgebra::UnitQuaternion::from_euler_angles(
        0.45 * (f * 0.7).sin(),
        0.45 * (f * 0.9).cos(),
        0.15 * (f * 0.3).sin(),
    );
    CamExtrinsics {
        rotation: rot.to_rotation_matrix().into_inner(),
        translation: nalgebra::Vector3::new(
            -0.06 + 0.02 * (f * 0.5).sin(),
            -0.075 + 0.02 * (f * 0.4).cos(),
            0.8 + 0.05 * (f * 0.6).sin(),
        ),
    }
}

fn scripted_tracker(cams: &[CameraData], board: &BoardSpec) -> ScriptedTracker {
    let ids: Vec<u32> = (0..board.corner_count()).collect();
    let corners = board.object_corners(&ids);

    let mut packets = BTreeMap::new();
    for frame in 0..N_FRAMES {
        let pose = board_pose(frame);
        let world: Vec<Point3<f64>> = corners.iter().map(|c| pose.transform_point(c)).collect();
        for cam in cams {
            let img: Vec<Point2<f64>> = cam.project(&world).unwrap();
            packets.insert(
                (cam.port, frame),
                PointPacket::new(ids.clone(), img, Some(corners.clone())).unwrap(),
            );
        }
    }
    ScriptedTracker { packets }
}

fn prepare_session(dir: &Path, cams: &[CameraData]) {
    // dummy recordings; the scripted factory never reads them
    for cam in cams {
        std::fs::write(dir.join(format!("port_{}.mp4", cam.port)), b"scripted").unwrap();
    }

    // recorded frame times, slightly offset per port
    let mut history = FrameTimeHistory::default();
    for cam in cams {
        history.set_port_times(
            cam.port,
            (0..N_FRAMES as i64)
                .map(|i| (i, i as f64 * FRAME_SPACING + cam.port as f64 * 0.01)),
        );
    }
    history.save(&dir.join("frame_time_history.csv")).unwrap();

    let mut session = Session::new(dir).unwrap();
    session
        .config_mut()
        .set_charuco(&CharucoConfig {
            columns: 4,
            rows: 5,
            board_height: 15.0,
            board_width: 12.0,
            dictionary: "DICT_4X4_50".into(),
            units: "cm".into(),
            aruco_scale: 0.75,
            square_size_override_cm: Some(3.0),
            inverted: false,
        })
        .unwrap();
    session.save_config().unwrap();
}

#[test]
fn full_calibration_recovers_the_rig() {
    let dir = tempfile::tempdir().unwrap();
    let cams = true_cameras();
    let board = board();
    prepare_session(dir.path(), &cams);

    let tracker: Arc<dyn Tracker> = Arc::new(scripted_tracker(&cams, &board));
    let mut session = Session::new(dir.path()).unwrap();
    assert_eq!(session.discover_ports().unwrap(), vec![0, 1, 2]);
    assert_eq!(session.board_spec().unwrap(), board);

    let settings = AutoPopSettings {
        wait_between: 2,
        threshold_corner_count: 7,
        target_grid_count: 18,
    };
    let volume = session
        .run_calibration(&ScriptedFactory, &tracker, settings, Some(0.5))
        .unwrap();

    // the array is globally consistent with the anchor pinning the frame
    assert!(volume.camera_array.is_calibrated());
    let anchor = volume.camera_array.anchor.unwrap();
    let anchor_cam = volume.camera_array.get(anchor).unwrap();
    assert!(anchor_cam.extrinsics_to_vector().unwrap().norm() < 1e-9);

    // intrinsics land on the synthetic truth
    for port in 0..3u8 {
        let cam = volume.camera_array.get(port).unwrap();
        assert!(!cam.ignored);
        assert!(
            (cam.intrinsics.fx() - 500.0).abs() < 1.5,
            "port {port} fx {}",
            cam.intrinsics.fx()
        );
        assert!((cam.intrinsics.cx() - 320.0).abs() < 1.5);
        assert!((cam.distortions()[0] - -0.05).abs() < 0.01);
    }

    // reprojection quality after adjustment and filtering
    let rmse = volume.rmse().unwrap();
    assert!(rmse < 1.0, "final RMSE {rmse}");

    // the ground-truth metric: triangulated corner spacing matches the
    // printed board to half a millimeter
    let distance_errors = QualityController::distance_errors(&volume, &board).unwrap();
    assert!(!distance_errors.is_empty());
    let worst = distance_errors
        .iter()
        .map(|d| d.error.abs())
        .fold(0.0, f64::max);
    assert!(worst < 5e-4, "worst corner distance error {worst} m");

    // artifacts persisted
    assert!(dir.path().join("xy_charuco.csv").exists());
    let reloaded = Session::new(dir.path()).unwrap();
    assert_eq!(reloaded.config().cameras().unwrap().len(), 3);
    assert!(!reloaded.config().stereo_pairs().unwrap().is_empty());
    let cv = reloaded.config().capture_volume().unwrap().unwrap();
    assert!(cv.rmse < 1.0);
    assert!(reloaded.config().point_estimates().unwrap().is_some());
}

#[test]
fn trajectory_export_writes_all_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let cams = true_cameras();
    let board = board();
    prepare_session(dir.path(), &cams);

    let session = Session::new(dir.path()).unwrap();

    // triangulate a few scripted sync packets against the true cameras
    let mut array_cams = BTreeMap::new();
    for cam in &cams {
        array_cams.insert(cam.port, cam.clone());
    }
    let mut array = camrig_mvg::CameraArray::new(array_cams);
    array.anchor = Some(0);

    let tracker = scripted_tracker(&cams, &board);
    let mut packets = Vec::new();
    let mut sync_times = BTreeMap::new();
    for sync in 0..4u64 {
        let mut frame_packets = BTreeMap::new();
        for cam in &cams {
            frame_packets.insert(
                cam.port,
                Some(camrig_types::FramePacket {
                    port: cam.port,
                    frame_index: sync as i64,
                    frame_time: sync as f64 * FRAME_SPACING,
                    frame: None,
                    points: tracker.packets.get(&(cam.port, sync)).cloned(),
                }),
            );
        }
        let sp = camrig_types::SyncPacket::new(sync, frame_packets);
        sync_times.insert(sync, sp.mean_frame_time().unwrap());
        if let Some(xyz) = camrig_session::triangulate_sync_packet(&array, &sp) {
            packets.push(xyz);
        }
    }
    assert_eq!(packets.len(), 4);

    // reconstructions match the scripted world points
    let ids: Vec<u32> = (0..board.corner_count()).collect();
    let corners = board.object_corners(&ids);
    for packet in &packets {
        let pose = board_pose(packet.sync_index);
        for (id, p) in packet.point_ids.iter().zip(packet.points.iter()) {
            let truth = pose.transform_point(&corners[*id as usize]);
            assert!((truth - p).norm() < 1e-4);
        }
    }

    session
        .export_trajectories(&tracker, &packets, &sync_times)
        .unwrap();
    assert!(dir.path().join("xyz_charuco.csv").exists());
    assert!(dir.path().join("xyz_charuco_labelled.csv").exists());
    assert!(dir.path().join("xyz_charuco.trc").exists());
}

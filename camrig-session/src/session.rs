use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbeam_channel::unbounded;
use nalgebra::{Point2, Point3};

use camrig_board::BoardSpec;
use camrig_cal::{CalError, IntrinsicCalibrator, StereoCalibrator, StereoPointsBuilder};
use camrig_mvg::{CameraArray, CameraArrayBuilder, CameraData, PairPose};
use camrig_stream::{FrameTimeHistory, RecordedStream, Synchronizer, VideoSourceFactory};
use camrig_types::{PointPacket, Port, Tracker, XyRow, XyzPacket};
use camrig_vol::{build_point_estimates, CaptureVolume, QualityController};

use crate::config::{CaptureVolumeConfig, Config};
use crate::export::{write_trc, write_xy_csv, write_xyz_csv, write_xyz_wide_csv, XyzRow};
use crate::{Result, SessionError};

/// Parameters of automatic calibration-frame selection.
#[derive(Debug, Clone, Copy)]
pub struct AutoPopSettings {
    pub wait_between: u32,
    pub threshold_corner_count: usize,
    pub target_grid_count: usize,
}

impl Default for AutoPopSettings {
    fn default() -> Self {
        Self {
            wait_between: 15,
            threshold_corner_count: 7,
            target_grid_count: 30,
        }
    }
}

/// Output of one synchronized tracking pass over all recordings.
#[derive(Debug, Clone)]
pub struct TrackingPass {
    pub rows: Vec<XyRow>,
    /// Mean frame time per sync index.
    pub sync_times: BTreeMap<u64, f64>,
    /// Mean dropped-frame flag per port over the trailing window.
    pub dropped_fps: BTreeMap<Port, f64>,
}

/// One recording directory with its configuration.
///
/// The session owns the configuration document and drives the calibration
/// stages over the directory's `port_{N}.mp4` recordings.
pub struct Session {
    directory: PathBuf,
    config: Config,
}

impl Session {
    pub fn new(directory: impl Into<PathBuf>) -> Result<Self> {
        let directory = directory.into();
        let config = Config::load_or_default(&directory.join("config.toml"))?;
        Ok(Self { directory, config })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn save_config(&self) -> Result<()> {
        self.config.save(&self.directory.join("config.toml"))
    }

    pub fn board_spec(&self) -> Result<BoardSpec> {
        let charuco = self.config.charuco()?.ok_or_else(|| {
            SessionError::Configuration("missing charuco section".to_string())
        })?;
        Ok(charuco.to_board_spec())
    }

    pub fn video_path(&self, port: Port) -> PathBuf {
        self.directory.join(format!("port_{port}.mp4"))
    }

    /// Ports with a recording in the session directory, ascending.
    pub fn discover_ports(&self) -> Result<Vec<Port>> {
        let mut ports = Vec::new();
        for entry in std::fs::read_dir(&self.directory)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(stem) = name.strip_prefix("port_").and_then(|s| s.strip_suffix(".mp4"))
            {
                if let Ok(port) = stem.parse::<Port>() {
                    ports.push(port);
                }
            }
        }
        if ports.is_empty() {
            return Err(SessionError::NoPorts);
        }
        ports.sort_unstable();
        Ok(ports)
    }

    fn frame_time_history(&self) -> Option<FrameTimeHistory> {
        let path = self.directory.join("frame_time_history.csv");
        if !path.exists() {
            return None;
        }
        match FrameTimeHistory::load(&path) {
            Ok(history) => Some(history),
            Err(e) => {
                tracing::warn!(%e, "unreadable frame time history; synthesizing timestamps");
                None
            }
        }
    }

    fn rotation_count(&self, port: Port) -> i8 {
        self.config
            .camera(port)
            .ok()
            .flatten()
            .map(|c| c.rotation_count)
            .unwrap_or(0)
    }

    fn open_stream(
        &self,
        factory: &dyn VideoSourceFactory,
        port: Port,
        tracker: Option<Arc<dyn Tracker>>,
    ) -> Result<Arc<RecordedStream>> {
        let path = self.video_path(port);
        if !path.exists() {
            return Err(SessionError::MissingVideo(port));
        }
        let source = factory.open(&path, port)?;
        Ok(Arc::new(RecordedStream::new(
            port,
            source,
            self.rotation_count(port),
            tracker,
            None, // batch processing: play as fast as the consumer allows
            true,
            self.frame_time_history(),
        )))
    }

    /// Calibrate every discovered camera's intrinsics independently.
    ///
    /// A camera whose stream cannot yield enough usable board views is
    /// marked ignored and the rest proceed; the returned array carries every
    /// discovered port either way.
    pub fn calibrate_intrinsics(
        &mut self,
        factory: &dyn VideoSourceFactory,
        tracker: &Arc<dyn Tracker>,
        settings: AutoPopSettings,
    ) -> Result<CameraArray> {
        let ports = self.discover_ports()?;
        let mut cameras = BTreeMap::new();

        for port in ports {
            let stream = self.open_stream(factory, port, Some(Arc::clone(tracker)))?;
            let (tx, rx) = unbounded();
            stream.subscribe(tx);

            let mut calibrator = IntrinsicCalibrator::new(port);
            calibrator.initiate_auto_pop(
                settings.wait_between,
                settings.threshold_corner_count,
                settings.target_grid_count,
            );

            stream.play_video()?;
            let mut size = (0, 0);
            for packet in rx.iter() {
                if let Some(frame) = &packet.frame {
                    size = frame.dimensions();
                }
                let done = packet.is_end_of_stream();
                calibrator.add_frame_packet(&packet);
                if done {
                    break;
                }
            }
            stream.stop();
            stream.join();

            let mut camera = CameraData::new(port, size, self.rotation_count(port));
            match calibrator.calibrate_camera(&mut camera) {
                Ok(rmse) => {
                    tracing::info!(port, rmse, "intrinsics calibrated");
                }
                Err(CalError::InsufficientObservations { usable, needed, .. }) => {
                    tracing::warn!(
                        port,
                        usable,
                        needed,
                        "not enough board views; camera marked ignored"
                    );
                    camera.ignored = true;
                }
                Err(e) => return Err(e.into()),
            }
            self.config.set_camera(&camera)?;
            cameras.insert(port, camera);
        }

        Ok(CameraArray::new(cameras))
    }

    /// Play all recordings through the synchronizer with trackers attached
    /// and collect the flat observation table.
    pub fn run_tracking_pass(
        &self,
        factory: &dyn VideoSourceFactory,
        tracker: &Arc<dyn Tracker>,
    ) -> Result<TrackingPass> {
        let ports = self.discover_ports()?;
        let mut streams = BTreeMap::new();
        for port in &ports {
            streams.insert(
                *port,
                self.open_stream(factory, *port, Some(Arc::clone(tracker)))?,
            );
        }

        let synchronizer = Synchronizer::new(streams.clone());
        let (tx, rx) = unbounded();
        synchronizer.subscribe_to_sync_packets(tx);
        for stream in streams.values() {
            stream.play_video()?;
        }

        let mut rows = Vec::new();
        let mut sync_times = BTreeMap::new();
        while let Ok(Some(packet)) = rx.recv() {
            if let Some(mean) = packet.mean_frame_time() {
                sync_times.insert(packet.sync_index, mean);
            }
            for (port, frame_packet) in &packet.frame_packets {
                let Some(fp) = frame_packet else { continue };
                let Some(points) = &fp.points else { continue };
                for (i, id) in points.point_ids.iter().enumerate() {
                    let obj = points.obj_loc.as_ref().map(|obj| obj[i]);
                    rows.push(XyRow {
                        sync_index: packet.sync_index,
                        port: *port,
                        frame_index: fp.frame_index,
                        frame_time: fp.frame_time,
                        point_id: *id,
                        img_loc_x: points.img_loc[i].x,
                        img_loc_y: points.img_loc[i].y,
                        obj_loc_x: obj.map(|p| p.x),
                        obj_loc_y: obj.map(|p| p.y),
                    });
                }
            }
        }

        let dropped_fps = synchronizer.dropped_fps();
        synchronizer.stop();
        for stream in streams.values() {
            stream.stop();
            stream.join();
        }

        tracing::info!(
            observations = rows.len(),
            sync_indices = sync_times.len(),
            "tracking pass complete"
        );
        Ok(TrackingPass {
            rows,
            sync_times,
            dropped_fps,
        })
    }

    /// Pairwise stereo calibration over the tracking pass, then global pose
    /// composition into `array`. Returns the fitted pair poses.
    pub fn calibrate_extrinsics(
        &mut self,
        array: &mut CameraArray,
        tracking: &TrackingPass,
    ) -> Result<Vec<PairPose>> {
        let active = array.active_ports();
        let builder = StereoPointsBuilder::new(&active);
        let mut stereo_cal = StereoCalibrator::default();

        // regroup rows into per-(sync, port) packets, object locations kept
        let mut by_sync: BTreeMap<u64, BTreeMap<Port, PointPacket>> = BTreeMap::new();
        for row in &tracking.rows {
            if !active.contains(&row.port) {
                continue;
            }
            let packet = by_sync
                .entry(row.sync_index)
                .or_default()
                .entry(row.port)
                .or_insert_with(PointPacket::empty);
            packet.point_ids.push(row.point_id);
            packet
                .img_loc
                .push(Point2::new(row.img_loc_x, row.img_loc_y));
            if let (Some(x), Some(y)) = (row.obj_loc_x, row.obj_loc_y) {
                packet
                    .obj_loc
                    .get_or_insert_with(Vec::new)
                    .push(Point3::new(x, y, 0.0));
            }
        }

        // a port mixing rows with and without object locations cannot keep a
        // partial obj array aligned; drop it for that frame
        for packets in by_sync.values_mut() {
            for packet in packets.values_mut() {
                if let Some(obj) = &packet.obj_loc {
                    if obj.len() != packet.point_ids.len() {
                        packet.obj_loc = None;
                    }
                }
            }
        }

        for (sync_index, packets) in &by_sync {
            let time = tracking
                .sync_times
                .get(sync_index)
                .copied()
                .unwrap_or(*sync_index as f64);
            for (port_a, port_b) in builder.pairs() {
                let (Some(points_a), Some(points_b)) =
                    (packets.get(port_a), packets.get(port_b))
                else {
                    continue;
                };
                if let Some(stereo) = builder.stereo_points_packet(
                    *sync_index,
                    *port_a,
                    points_a,
                    *port_b,
                    points_b,
                ) {
                    stereo_cal.add_stereo_packet(&stereo, time);
                }
            }
        }

        let mut poses = Vec::new();
        for pair in stereo_cal.ready_pairs() {
            let cam_a = array.get(pair.0)?.clone();
            let cam_b = array.get(pair.1)?.clone();
            match stereo_cal.calibrate_pair(pair, &cam_a, &cam_b) {
                Ok(pose) => {
                    self.config.set_stereo_pair(&pose)?;
                    poses.push(pose);
                }
                Err(e) => {
                    // a missing pair pose is survivable as long as the pair
                    // graph stays connected
                    tracing::warn!(?pair, %e, "stereo pair not calibrated");
                }
            }
        }

        CameraArrayBuilder::new(poses.clone()).build(array)?;
        for camera in array.cameras.values() {
            self.config.set_camera(camera)?;
        }
        Ok(poses)
    }

    /// Assemble point estimates from the tracking pass and refine the whole
    /// capture volume.
    pub fn build_capture_volume(
        &mut self,
        array: CameraArray,
        tracking: &TrackingPass,
    ) -> Result<CaptureVolume> {
        let estimates = build_point_estimates(&array, &tracking.rows)?;
        let mut volume = CaptureVolume::new(array, estimates);
        let summary = volume.optimize()?;
        self.persist_volume(&volume, summary.final_rmse)?;
        Ok(volume)
    }

    fn persist_volume(&mut self, volume: &CaptureVolume, rmse: f64) -> Result<()> {
        for camera in volume.camera_array.cameras.values() {
            self.config.set_camera(camera)?;
        }
        self.config.set_capture_volume(&CaptureVolumeConfig {
            origin_sync_index: volume.origin_sync_index,
            rmse,
            stage: volume.stage,
        })?;
        self.config.set_point_estimates(&volume.point_estimates)?;
        Ok(())
    }

    /// The full one-shot batch calibration: intrinsics per camera, tracking
    /// pass, pairwise stereo, array composition, bundle adjustment, and an
    /// optional residual-percentile filter with re-optimization. Artifacts
    /// are persisted to `config.toml` and `xy_{tracker}.csv`.
    pub fn run_calibration(
        &mut self,
        factory: &dyn VideoSourceFactory,
        tracker: &Arc<dyn Tracker>,
        settings: AutoPopSettings,
        filter_percentile: Option<f64>,
    ) -> Result<CaptureVolume> {
        let mut array = self.calibrate_intrinsics(factory, tracker, settings)?;
        let tracking = self.run_tracking_pass(factory, tracker)?;
        self.calibrate_extrinsics(&mut array, &tracking)?;
        let mut volume = self.build_capture_volume(array, &tracking)?;

        if let Some(cutoff) = filter_percentile {
            let summary = QualityController::filter_by_percentile(&mut volume, cutoff)?;
            self.persist_volume(&volume, summary.final_rmse)?;
        }

        write_xy_csv(
            &self.directory.join(format!("xy_{}.csv", tracker.name())),
            &tracking.rows,
        )?;
        self.save_config()?;
        Ok(volume)
    }

    /// Write the 3D trajectory artifacts for a tracker's triangulated
    /// packets: long, wide-labelled and `.trc` forms.
    pub fn export_trajectories(
        &self,
        tracker: &dyn Tracker,
        packets: &[XyzPacket],
        sync_times: &BTreeMap<u64, f64>,
    ) -> Result<()> {
        let mut rows = Vec::new();
        for packet in packets {
            for (id, p) in packet.point_ids.iter().zip(packet.points.iter()) {
                rows.push(XyzRow {
                    sync_index: packet.sync_index,
                    point_id: *id,
                    x_coord: p.x,
                    y_coord: p.y,
                    z_coord: p.z,
                });
            }
        }
        let name = tracker.name();
        write_xyz_csv(&self.directory.join(format!("xyz_{name}.csv")), &rows)?;
        write_xyz_wide_csv(
            &self.directory.join(format!("xyz_{name}_labelled.csv")),
            &rows,
            tracker,
        )?;
        write_trc(
            &self.directory.join(format!("xyz_{name}.trc")),
            &rows,
            tracker,
            sync_times,
        )?;
        Ok(())
    }
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam_channel::Sender;

use camrig_types::{FramePacket, Port, Tracker};

use crate::{FrameTimeHistory, Result, StreamError, VideoSource};

/// How long to sleep between checks while no subscriber is attached or
/// playback is paused. Coarse on purpose; never busy-wait tighter.
const IDLE_POLL: Duration = Duration::from_millis(500);
const PAUSE_POLL: Duration = Duration::from_millis(50);

/// State shared between the stream handle and its playback task.
struct Shared {
    subscribers: Mutex<Vec<Sender<FramePacket>>>,
    paused: AtomicBool,
    stopped: AtomicBool,
    tracking: AtomicBool,
    /// Single-slot seek queue; a later request overwrites an unserved one.
    seek: Mutex<Option<u64>>,
    /// Playback cadence target, frames per second. `None` plays as fast as
    /// the consumer allows.
    fps_target: Mutex<Option<f64>>,
}

/// Plays one recorded video file onto subscriber channels, mimicking a live
/// camera.
///
/// The playback task decodes frames, attaches tracker output and timestamps
/// from the frame-time history, honors seek/pause requests, and finishes by
/// emitting the end-of-stream sentinel to every subscriber.
pub struct RecordedStream {
    port: Port,
    rotation_count: i8,
    break_on_last: bool,
    shared: Arc<Shared>,
    history: FrameTimeHistory,
    source_fps: f64,
    last_frame_index: i64,
    tracker: Option<Arc<dyn Tracker>>,
    /// Taken by the playback task on `play_video`.
    source: Mutex<Option<Box<dyn VideoSource>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RecordedStream {
    /// `history` is authoritative when given; otherwise frame times are
    /// synthesized from the source fps.
    pub fn new(
        port: Port,
        source: Box<dyn VideoSource>,
        rotation_count: i8,
        tracker: Option<Arc<dyn Tracker>>,
        fps_target: Option<f64>,
        break_on_last: bool,
        history: Option<FrameTimeHistory>,
    ) -> Self {
        let source_fps = source.fps();
        let frame_count = source.frame_count();
        let history = match history {
            Some(h) if h.has_port(port) => h,
            _ => FrameTimeHistory::synthesize(port, frame_count, source_fps),
        };
        let last_frame_index = history
            .last_frame_index(port)
            .unwrap_or(frame_count as i64 - 1);
        Self {
            port,
            rotation_count,
            break_on_last,
            shared: Arc::new(Shared {
                subscribers: Mutex::new(Vec::new()),
                paused: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                tracking: AtomicBool::new(true),
                seek: Mutex::new(None),
                fps_target: Mutex::new(fps_target),
            }),
            history,
            source_fps,
            last_frame_index,
            tracker,
            source: Mutex::new(Some(source)),
            handle: Mutex::new(None),
        }
    }

    pub fn port(&self) -> Port {
        self.port
    }

    pub fn last_frame_index(&self) -> i64 {
        self.last_frame_index
    }

    /// Add a subscriber queue. Guarded against double subscription.
    pub fn subscribe(&self, tx: Sender<FramePacket>) {
        let mut subs = self.shared.subscribers.lock().expect("lock poisoned");
        if subs.iter().any(|s| s.same_channel(&tx)) {
            tracing::debug!(port = self.port, "ignoring duplicate subscription");
            return;
        }
        subs.push(tx);
    }

    /// Remove a subscriber queue. Unknown queues are ignored.
    pub fn unsubscribe(&self, tx: &Sender<FramePacket>) {
        let mut subs = self.shared.subscribers.lock().expect("lock poisoned");
        subs.retain(|s| !s.same_channel(tx));
    }

    pub fn set_fps_target(&self, fps: Option<f64>) {
        *self.shared.fps_target.lock().expect("lock poisoned") = fps;
    }

    /// Request playback jump to `frame_index` (single-slot; a newer request
    /// replaces a pending one).
    pub fn jump_to(&self, frame_index: u64) {
        *self.shared.seek.lock().expect("lock poisoned") = Some(frame_index);
    }

    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::SeqCst);
    }

    pub fn unpause(&self) {
        self.shared.paused.store(false, Ordering::SeqCst);
    }

    /// Toggle tracker execution without detaching the tracker (the tracking
    /// pass flips this on after calibration data collection).
    pub fn set_tracking_enabled(&self, enabled: bool) {
        self.shared.tracking.store(enabled, Ordering::SeqCst);
    }

    /// Request the playback task to exit after its current iteration.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
    }

    /// Wait for the playback task to finish.
    pub fn join(&self) {
        let handle = self.handle.lock().expect("lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Spawn the playback task. May be called exactly once.
    pub fn play_video(self: &Arc<Self>) -> Result<()> {
        let source = self
            .source
            .lock()
            .expect("lock poisoned")
            .take()
            .ok_or(StreamError::AlreadyPlaying)?;

        let me = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("stream-{}", self.port))
            .spawn(move || me.playback_task(source))?;
        *self.handle.lock().expect("lock poisoned") = Some(handle);
        Ok(())
    }

    fn playback_task(&self, mut source: Box<dyn VideoSource>) {
        tracing::info!(port = self.port, "playback task started");
        let shared = &self.shared;
        let mut frame_index: i64 = self.history.first_frame_index(self.port).unwrap_or(0);

        loop {
            if shared.stopped.load(Ordering::SeqCst) {
                tracing::info!(port = self.port, "playback stopped");
                break;
            }

            if shared.subscribers.lock().expect("lock poisoned").is_empty() {
                std::thread::sleep(IDLE_POLL);
                continue;
            }

            let fps_target = *shared.fps_target.lock().expect("lock poisoned");
            if let Some(fps) = fps_target {
                std::thread::sleep(milestone_delay(wall_clock_fraction(), fps));
            }

            let past_end = self.break_on_last && frame_index > self.last_frame_index;
            let frame = if past_end { None } else { source.read_frame() };
            let Some(frame) = frame else {
                tracing::info!(port = self.port, "end of recorded playback");
                self.broadcast(FramePacket::end_of_stream(self.port, frame_index));
                break;
            };

            let frame = Arc::new(frame);
            let points = match &self.tracker {
                Some(tracker) if shared.tracking.load(Ordering::SeqCst) => {
                    Some(tracker.detect(&frame, self.port, self.rotation_count))
                }
                _ => None,
            };

            let frame_time = self
                .history
                .frame_time(self.port, frame_index)
                .unwrap_or(frame_index as f64 / self.source_fps);
            self.broadcast(FramePacket {
                port: self.port,
                frame_index,
                frame_time,
                frame: Some(frame),
                points,
            });
            frame_index += 1;

            if let Some(target) = shared.seek.lock().expect("lock poisoned").take() {
                if source.seek(target).is_ok() {
                    frame_index = target as i64;
                } else {
                    tracing::warn!(port = self.port, target, "seek out of range, ignored");
                }
                continue;
            }

            while shared.paused.load(Ordering::SeqCst) && !shared.stopped.load(Ordering::SeqCst)
            {
                // seek requests are honored during pause
                if let Some(target) = shared.seek.lock().expect("lock poisoned").take() {
                    if source.seek(target).is_ok() {
                        frame_index = target as i64;
                    }
                }
                std::thread::sleep(PAUSE_POLL);
            }
        }
    }

    fn broadcast(&self, packet: FramePacket) {
        let mut subs = self.shared.subscribers.lock().expect("lock poisoned");
        subs.retain(|tx| tx.send(packet.clone()).is_ok());
    }
}

fn wall_clock_fraction() -> f64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    now.as_secs_f64().fract()
}

/// Time until the next sub-second cadence milestone.
///
/// For a target of `fps` frames per second the milestones are `{k/fps}` for
/// `k` in `[0, fps)`, anchored to the wall-clock second so independent
/// streams at the same target share phase.
fn milestone_delay(second_fraction: f64, fps: f64) -> Duration {
    if fps <= 0.0 {
        return Duration::ZERO;
    }
    let interval = 1.0 / fps;
    let k = (second_fraction / interval).floor() + 1.0;
    let next = k * interval;
    Duration::from_secs_f64((next - second_fraction).max(0.0))
}

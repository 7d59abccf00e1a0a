use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};

use camrig_types::{FramePacket, Port, SyncPacket};

use crate::RecordedStream;

/// Trailing sync indices tracked for dropped-frame reporting.
pub const DROPPED_FRAME_TRACK_WINDOW: usize = 100;

/// Advisory threshold: a subscriber queue deeper than this is logged as
/// lagging (but never blocks the synchronizer).
const SUBSCRIBER_LAG_THRESHOLD: usize = 256;

/// Groups per-port frame packets into [`SyncPacket`]s.
///
/// The synchronizer owns one internal queue per port and a worker task that
/// buffers each port one frame ahead, then decides per port whether its
/// current frame belongs to the current sync index or the next one:
///
/// - a frame later than every other port's *next* frame is deferred;
/// - a frame closer to the other ports' next frames than to their current
///   frames is deferred (this stabilizes two-camera pairings when one
///   stream runs slightly ahead, and is applied at every port count);
/// - otherwise the frame joins the packet and the port's cursor advances.
///
/// Sync indices start at zero and increase strictly; this is the only
/// component that creates them. End of stream on any port ends
/// synchronization: subscribers receive a final `None`.
pub struct Synchronizer {
    shared: Arc<Shared>,
    streams: BTreeMap<Port, Arc<RecordedStream>>,
    port_queues: BTreeMap<Port, Sender<FramePacket>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    stopped: AtomicBool,
    subscribers: Mutex<Vec<Sender<Option<SyncPacket>>>>,
    dropped_history: Mutex<BTreeMap<Port, Vec<bool>>>,
}

impl Synchronizer {
    /// Subscribe to every stream and start the synchronization worker.
    pub fn new(streams: BTreeMap<Port, Arc<RecordedStream>>) -> Self {
        let shared = Arc::new(Shared {
            stopped: AtomicBool::new(false),
            subscribers: Mutex::new(Vec::new()),
            dropped_history: Mutex::new(
                streams.keys().map(|port| (*port, Vec::new())).collect(),
            ),
        });

        let mut port_queues = BTreeMap::new();
        let mut receivers = BTreeMap::new();
        for (port, stream) in &streams {
            let (tx, rx) = unbounded();
            stream.subscribe(tx.clone());
            tracing::info!(port, "synchronizer subscribed to stream");
            port_queues.insert(*port, tx);
            receivers.insert(*port, rx);
        }

        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("synchronizer".into())
            .spawn(move || sync_worker(worker_shared, receivers))
            .expect("spawning synchronizer worker");

        Self {
            shared,
            streams,
            port_queues,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn ports(&self) -> Vec<Port> {
        self.streams.keys().copied().collect()
    }

    /// Add a subscriber for sync packets; `None` on the channel marks the
    /// end of synchronized frames.
    pub fn subscribe_to_sync_packets(&self, tx: Sender<Option<SyncPacket>>) {
        self.shared
            .subscribers
            .lock()
            .expect("lock poisoned")
            .push(tx);
    }

    pub fn unsubscribe_from_sync_packets(&self, tx: &Sender<Option<SyncPacket>>) {
        self.shared
            .subscribers
            .lock()
            .expect("lock poisoned")
            .retain(|s| !s.same_channel(tx));
    }

    /// Toggle tracker execution on every attached stream.
    pub fn set_tracking_on_streams(&self, enabled: bool) {
        for stream in self.streams.values() {
            stream.set_tracking_enabled(enabled);
        }
    }

    /// Mean dropped-frame flag per port over the trailing window.
    pub fn dropped_fps(&self) -> BTreeMap<Port, f64> {
        let history = self.shared.dropped_history.lock().expect("lock poisoned");
        history
            .iter()
            .map(|(port, flags)| {
                let mean = if flags.is_empty() {
                    0.0
                } else {
                    flags.iter().filter(|d| **d).count() as f64 / flags.len() as f64
                };
                (*port, mean)
            })
            .collect()
    }

    /// Stop the worker and detach from the streams.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        for (port, stream) in &self.streams {
            if let Some(tx) = self.port_queues.get(port) {
                stream.unsubscribe(tx);
            }
        }
        let handle = self.handle.lock().expect("lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

/// Per-port pending buffer: packets keyed by their arrival index.
struct PortLedger {
    pending: BTreeMap<i64, FramePacket>,
    /// Arrival index of the next packet to be read off the queue.
    fill_cursor: i64,
    /// Arrival index of the frame considered for the current sync packet.
    current: i64,
}

fn sync_worker(shared: Arc<Shared>, receivers: BTreeMap<Port, Receiver<FramePacket>>) {
    let ports: Vec<Port> = receivers.keys().copied().collect();
    let mut ledgers: BTreeMap<Port, PortLedger> = ports
        .iter()
        .map(|port| {
            (
                *port,
                PortLedger {
                    pending: BTreeMap::new(),
                    fill_cursor: 0,
                    current: 0,
                },
            )
        })
        .collect();
    let mut sync_index: u64 = 0;

    tracing::info!(?ports, "synchronizer worker started");

    'outer: loop {
        if shared.stopped.load(Ordering::SeqCst) {
            break;
        }

        // Buffer every port through its earliest-next frame. Waits with
        // back-off so a stop request is still honored while producers stall.
        for port in &ports {
            let ledger = ledgers.get_mut(port).expect("port known");
            let rx = receivers.get(port).expect("port known");
            while ledger.fill_cursor <= ledger.current + 1 {
                match rx.recv_timeout(Duration::from_millis(100)) {
                    Ok(packet) => {
                        ledger.pending.insert(ledger.fill_cursor, packet);
                        ledger.fill_cursor += 1;
                    }
                    Err(e) if e.is_timeout() => {
                        if shared.stopped.load(Ordering::SeqCst) {
                            break 'outer;
                        }
                    }
                    Err(_) => {
                        // producer hung up without a sentinel; treat as end
                        tracing::warn!(port, "stream disconnected without end-of-stream");
                        emit(&shared, None);
                        break 'outer;
                    }
                }
            }
        }

        // End of any stream ends synchronization.
        let eos = ledgers.values().any(|ledger| {
            [ledger.current, ledger.current + 1]
                .iter()
                .any(|i| ledger.pending.get(i).is_some_and(|p| p.is_end_of_stream()))
        });
        if eos {
            tracing::info!(sync_index, "end of frames detected; ending synchronization");
            emit(&shared, None);
            break;
        }

        // Timing context per port, computed before any cursor moves.
        let mut earliest_next: BTreeMap<Port, f64> = BTreeMap::new();
        let mut latest_current: BTreeMap<Port, f64> = BTreeMap::new();
        for port in &ports {
            let mut next_min = f64::INFINITY;
            let mut current_max = f64::NEG_INFINITY;
            for (other, ledger) in &ledgers {
                if other == port {
                    continue;
                }
                next_min = next_min
                    .min(ledger.pending[&(ledger.current + 1)].frame_time);
                current_max = current_max.max(ledger.pending[&ledger.current].frame_time);
            }
            earliest_next.insert(*port, next_min);
            latest_current.insert(*port, current_max);
        }

        let mut frame_packets: BTreeMap<Port, Option<FramePacket>> = BTreeMap::new();
        for port in &ports {
            let ledger = ledgers.get_mut(port).expect("port known");
            let frame_time = ledger.pending[&ledger.current].frame_time;

            if frame_time > earliest_next[port] {
                // belongs to the next sync packet outright
                frame_packets.insert(*port, None);
            } else if earliest_next[port] - frame_time < frame_time - latest_current[port] {
                // closer to the other ports' next frames than to their
                // current ones; deferring keeps pairings from sliding
                frame_packets.insert(*port, None);
            } else {
                let packet = ledger
                    .pending
                    .remove(&ledger.current)
                    .expect("buffered above");
                ledger.current += 1;
                frame_packets.insert(*port, Some(packet));
            }
        }

        let packet = SyncPacket::new(sync_index, frame_packets);
        {
            let mut history = shared.dropped_history.lock().expect("lock poisoned");
            for (port, dropped) in packet.dropped() {
                let flags = history.entry(port).or_default();
                flags.push(dropped);
                let len = flags.len();
                if len > DROPPED_FRAME_TRACK_WINDOW {
                    flags.drain(..len - DROPPED_FRAME_TRACK_WINDOW);
                }
            }
        }
        if sync_index % 100 == 0 {
            tracing::debug!(sync_index, "emitting sync packet");
        }
        emit(&shared, Some(packet));
        sync_index += 1;
    }

    tracing::info!("synchronizer worker ended");
}

fn emit(shared: &Shared, packet: Option<SyncPacket>) {
    let mut subs = shared.subscribers.lock().expect("lock poisoned");
    subs.retain(|tx| {
        if tx.len() > SUBSCRIBER_LAG_THRESHOLD {
            tracing::warn!(
                depth = tx.len(),
                "sync packet subscriber is lagging behind"
            );
        }
        tx.send(packet.clone()).is_ok()
    });
}

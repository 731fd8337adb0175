// Stream supervisor: drives one camera's detection source through
// CONNECTING -> RUNNING -> DISCONNECTED -> CONNECTING ... -> STOPPED,
// feeding every frame into the camera's track table and handing evicted
// tracks to the finalizer.

use crate::pipeline::quality::QualityScorer;
use crate::pipeline::table::TrackTable;
use crate::pipeline::track::Track;
use crate::pipeline::types::{Camera, FrameBatch, Observation};
use crate::video::DetectionSource;
use crossbeam::channel::{self, Receiver, Sender};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Connecting,
    Running,
    Disconnected,
    Stopped,
}

/// Cooperative stop request shared between a supervisor and whoever stops it.
#[derive(Clone)]
pub struct StopSignal {
    stopped: Arc<AtomicBool>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        let (wake_tx, wake_rx) = channel::bounded(1);
        Self {
            stopped: Arc::new(AtomicBool::new(false)),
            wake_tx,
            wake_rx,
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.wake_tx.try_send(());
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Sleeps for up to `timeout`, waking early on stop. Returns whether stop was requested.
    pub fn wait(&self, timeout: Duration) -> bool {
        if self.is_stopped() {
            return true;
        }
        let _ = self.wake_rx.recv_timeout(timeout);
        self.is_stopped()
    }
}

/// Counters and state of one camera, shared with the status API.
#[derive(Debug)]
pub struct SupervisorStatus {
    pub camera_id: i64,
    pub camera_name: String,
    state: RwLock<StreamState>,
    pub connects: AtomicUsize,
    /// Reconnect sleeps taken
    pub backoffs: AtomicUsize,
    pub frames: AtomicUsize,
    pub observations: AtomicUsize,
    pub evictions: AtomicUsize,
    pub finalized: AtomicUsize,
    pub persisted: AtomicUsize,
    pub persist_failures: AtomicUsize,
    pub submitted: AtomicUsize,
    pub submit_failures: AtomicUsize,
    pub static_discarded: AtomicUsize,
    last_error: RwLock<Option<String>>,
    pub start_time: Instant,
}

impl SupervisorStatus {
    pub fn new(camera: &Camera) -> Self {
        Self {
            camera_id: camera.id,
            camera_name: camera.name.clone(),
            state: RwLock::new(StreamState::Connecting),
            connects: AtomicUsize::new(0),
            backoffs: AtomicUsize::new(0),
            frames: AtomicUsize::new(0),
            observations: AtomicUsize::new(0),
            evictions: AtomicUsize::new(0),
            finalized: AtomicUsize::new(0),
            persisted: AtomicUsize::new(0),
            persist_failures: AtomicUsize::new(0),
            submitted: AtomicUsize::new(0),
            submit_failures: AtomicUsize::new(0),
            static_discarded: AtomicUsize::new(0),
            last_error: RwLock::new(None),
            start_time: Instant::now(),
        }
    }

    pub fn state(&self) -> StreamState {
        self.state.read().map(|s| *s).unwrap_or(StreamState::Stopped)
    }

    pub fn set_state(&self, state: StreamState) {
        if let Ok(mut current) = self.state.write() {
            *current = state;
        }
    }

    pub fn record_error(&self, message: String) {
        if let Ok(mut last) = self.last_error.write() {
            *last = Some(message);
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().ok().and_then(|e| e.clone())
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "camera_id": self.camera_id,
            "camera_name": self.camera_name,
            "state": self.state(),
            "uptime_secs": self.start_time.elapsed().as_secs(),
            "connects": self.connects.load(Ordering::Relaxed),
            "backoffs": self.backoffs.load(Ordering::Relaxed),
            "frames": self.frames.load(Ordering::Relaxed),
            "observations": self.observations.load(Ordering::Relaxed),
            "evictions": self.evictions.load(Ordering::Relaxed),
            "finalized": self.finalized.load(Ordering::Relaxed),
            "persisted": self.persisted.load(Ordering::Relaxed),
            "persist_failures": self.persist_failures.load(Ordering::Relaxed),
            "submitted": self.submitted.load(Ordering::Relaxed),
            "submit_failures": self.submit_failures.load(Ordering::Relaxed),
            "static_discarded": self.static_discarded.load(Ordering::Relaxed),
            "last_error": self.last_error(),
        })
    }
}

pub struct SupervisorConfig {
    pub scorer: QualityScorer,
    pub reconnect_interval: Duration,
    /// Consecutive failures tolerated before giving up; `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
    /// Log every detection at info level
    pub verbose: bool,
}

pub struct Supervisor {
    camera: Arc<Camera>,
    source: Box<dyn DetectionSource>,
    table: Arc<TrackTable>,
    finalize_tx: Sender<Track>,
    config: SupervisorConfig,
    stop: StopSignal,
    status: Arc<SupervisorStatus>,
}

impl Supervisor {
    pub fn new(
        camera: Arc<Camera>,
        source: Box<dyn DetectionSource>,
        table: Arc<TrackTable>,
        finalize_tx: Sender<Track>,
        config: SupervisorConfig,
    ) -> Self {
        let status = Arc::new(SupervisorStatus::new(&camera));
        Self {
            camera,
            source,
            table,
            finalize_tx,
            config,
            stop: StopSignal::new(),
            status,
        }
    }

    pub fn with_stop(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_status(mut self, status: Arc<SupervisorStatus>) -> Self {
        self.status = status;
        self
    }

    /// Runs until stopped, then finalizes every remaining track.
    pub fn run(mut self) {
        info!("Camera {}: supervisor started", self.camera);
        let mut state = StreamState::Connecting;
        let mut consecutive_failures: u32 = 0;

        while state != StreamState::Stopped {
            self.status.set_state(state);
            state = match state {
                StreamState::Connecting => self.connect(),
                StreamState::Running => self.pump(),
                StreamState::Disconnected => {
                    consecutive_failures += 1;
                    self.backoff(consecutive_failures)
                }
                StreamState::Stopped => StreamState::Stopped,
            };
            if state == StreamState::Running {
                consecutive_failures = 0;
            }
        }

        self.status.set_state(StreamState::Stopped);
        self.shutdown();
    }

    fn connect(&mut self) -> StreamState {
        if self.stop.is_stopped() {
            return StreamState::Stopped;
        }
        info!("Camera {}: connecting to stream", self.camera);
        match self.source.open() {
            Ok(()) => {
                self.status.connects.fetch_add(1, Ordering::Relaxed);
                info!("Camera {}: stream connected", self.camera);
                StreamState::Running
            }
            Err(e) => {
                warn!("Camera {}: failed to connect: {:#}", self.camera, e);
                self.status.record_error(format!("connect: {:#}", e));
                StreamState::Disconnected
            }
        }
    }

    fn pump(&mut self) -> StreamState {
        loop {
            if self.stop.is_stopped() {
                return StreamState::Stopped;
            }
            match self.source.next_batch() {
                Ok(Some(batch)) => self.apply(batch),
                Ok(None) => {
                    warn!("Camera {}: stream ended", self.camera);
                    self.status.record_error("stream ended".to_string());
                    return StreamState::Disconnected;
                }
                Err(e) => {
                    error!("Camera {}: stream error: {:#}", self.camera, e);
                    self.status.record_error(format!("read: {:#}", e));
                    return StreamState::Disconnected;
                }
            }
        }
    }

    fn backoff(&mut self, consecutive_failures: u32) -> StreamState {
        if let Some(max) = self.config.max_reconnect_attempts {
            if consecutive_failures >= max {
                error!(
                    "Camera {}: giving up after {} consecutive failures",
                    self.camera, consecutive_failures
                );
                return StreamState::Stopped;
            }
        }
        if self.stop.is_stopped() {
            return StreamState::Stopped;
        }

        self.status.backoffs.fetch_add(1, Ordering::Relaxed);
        info!(
            "Camera {}: reconnecting in {:?} (failure {})",
            self.camera, self.config.reconnect_interval, consecutive_failures
        );
        if self.stop.wait(self.config.reconnect_interval) {
            StreamState::Stopped
        } else {
            StreamState::Connecting
        }
    }

    /// Scores every detection of the frame and applies them to the table as one unit.
    fn apply(&mut self, batch: FrameBatch) {
        let FrameBatch {
            frame,
            detections,
            captured_at,
        } = batch;
        self.status.frames.fetch_add(1, Ordering::Relaxed);

        let qualities: Vec<f32> = detections
            .iter()
            .map(|d| {
                self.config
                    .scorer
                    .score(&d.bbox, d.confidence, &frame, d.landmarks.as_ref())
            })
            .collect();

        let frame = Arc::new(frame);
        let mut observations = Vec::with_capacity(detections.len());

        for (detection, quality) in detections.into_iter().zip(qualities) {
            if self.config.verbose {
                info!(
                    "Camera {}: track {} bbox={} conf={:.2} quality={:.4}",
                    self.camera, detection.track_id, detection.bbox, detection.confidence, quality
                );
            } else {
                debug!(
                    "Camera {}: track {} bbox={} conf={:.2} quality={:.4}",
                    self.camera, detection.track_id, detection.bbox, detection.confidence, quality
                );
            }

            observations.push((
                detection.track_id,
                Observation::new(frame.clone(), &detection, quality, captured_at),
            ));
        }

        self.status
            .observations
            .fetch_add(observations.len(), Ordering::Relaxed);

        for track in self.table.apply_batch(observations) {
            self.status.evictions.fetch_add(1, Ordering::Relaxed);
            info!(
                "Camera {}: track {} lost for {} frames, finalizing",
                self.camera,
                track.track_id(),
                self.table.max_misses()
            );
            self.hand_off(track);
        }
    }

    fn hand_off(&self, track: Track) {
        if let Err(e) = self.finalize_tx.send(track) {
            error!(
                "Camera {}: finalizer unavailable, dropping track {}",
                self.camera,
                e.into_inner().track_id()
            );
        }
    }

    fn shutdown(&mut self) {
        let remaining = self.table.drain_all();
        info!(
            "Camera {}: stopping, finalizing {} remaining tracks",
            self.camera,
            remaining.len()
        );
        for track in remaining {
            self.hand_off(track);
        }
        info!("Camera {}: supervisor stopped", self.camera);
    }
}

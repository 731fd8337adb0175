// Pipeline orchestrator: one supervisor thread and one finalizer thread per camera.
//
// The supervisor owns the detection source and feeds the camera's track table;
// evicted tracks travel to the finalizer over a channel so sink latency never
// stalls frame ingestion.

use crate::pipeline::finalize::{finalize_worker, Finalizer};
use crate::pipeline::findface::FindfaceSink;
use crate::pipeline::quality::QualityScorer;
use crate::pipeline::sink::{DiskStore, RemoteSink};
use crate::pipeline::supervisor::{StopSignal, Supervisor, SupervisorConfig, SupervisorStatus};
use crate::pipeline::table::TrackTable;
use crate::pipeline::track::Track;
use crate::pipeline::types::Camera;
use crate::settings::Settings;
use crate::video::tracked_stream::TrackedStream;
use crate::video::DetectionSource;
use anyhow::{Context, Result};
use crossbeam::channel;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Read-only view of a running camera, shared with the status API.
#[derive(Clone)]
pub struct CameraHandle {
    pub camera: Arc<Camera>,
    pub status: Arc<SupervisorStatus>,
    pub table: Arc<TrackTable>,
}

impl CameraHandle {
    pub fn to_json(&self) -> serde_json::Value {
        let mut value = self.status.to_json();
        value["live_tracks"] = serde_json::json!(self.table.snapshot());
        value
    }
}

pub struct CameraPipeline {
    handle: CameraHandle,
    stop: StopSignal,
    supervisor: Option<JoinHandle<()>>,
    finalizer: Option<JoinHandle<usize>>,
}

/// Connection to the FindFace instance events are submitted to.
pub struct Remote<'a> {
    pub agent: &'a ureq::Agent,
    pub base_url: &'a str,
}

/// Starts a camera reading its configured stream through the configured detector and ByteTrack.
pub fn start_camera(
    camera: Camera,
    settings: &Settings,
    remote: Option<Remote<'_>>,
) -> Result<CameraPipeline> {
    let remote = remote.map(|r| {
        Box::new(FindfaceSink::new(
            r.agent.clone(),
            r.base_url,
            &settings.findface.mf_selector,
        )) as Box<dyn RemoteSink>
    });
    let detector = settings.detector.clone();
    let tracker = settings.tracker.clone();
    let stream = settings.stream.clone();
    start_pipeline(camera, settings, remote, move |camera| {
        Box::new(TrackedStream::new(camera, &detector, &tracker, &stream)) as Box<dyn DetectionSource>
    })
}

/// Starts a camera with any detection source. The source is built on the supervisor thread.
pub fn start_pipeline<F>(
    camera: Camera,
    settings: &Settings,
    remote: Option<Box<dyn RemoteSink>>,
    make_source: F,
) -> Result<CameraPipeline>
where
    F: FnOnce(Arc<Camera>) -> Box<dyn DetectionSource> + Send + 'static,
{
    let camera = Arc::new(camera);
    let table = Arc::new(TrackTable::new(settings.tracking.max_frames_lost));
    let status = Arc::new(SupervisorStatus::new(&camera));
    let stop = StopSignal::new();
    let (tx, rx) = channel::unbounded::<Track>();

    let store = DiskStore::new(
        &settings.storage.project_dir,
        &settings.storage.results_dir,
        settings.storage.jpeg_quality,
    );
    tracing::debug!("Camera {}: saving results to {}", camera, store.dir().display());
    let finalizer = Finalizer::new(
        camera.clone(),
        settings.movement,
        settings.storage.jpeg_quality,
        Box::new(store),
        remote,
    );
    let config = SupervisorConfig {
        scorer: QualityScorer::new(settings.quality)?,
        reconnect_interval: settings.stream.reconnect_interval(),
        max_reconnect_attempts: settings.stream.max_reconnect_attempts,
        verbose: settings.verbose,
    };

    let status_fin = status.clone();
    let finalizer_handle = thread::Builder::new()
        .name(format!("finalize-{}", camera.id))
        .spawn(move || finalize_worker(rx, finalizer, status_fin))
        .context("Failed to spawn finalizer thread")?;

    let camera_sup = camera.clone();
    let table_sup = table.clone();
    let status_sup = status.clone();
    let stop_sup = stop.clone();
    let supervisor_handle = thread::Builder::new()
        .name(format!("supervise-{}", camera.id))
        .spawn(move || {
            let source = make_source(camera_sup.clone());
            Supervisor::new(camera_sup, source, table_sup, tx, config)
                .with_stop(stop_sup)
                .with_status(status_sup)
                .run();
        })
        .context("Failed to spawn supervisor thread")?;

    tracing::info!("Camera {}: pipeline started", camera);

    Ok(CameraPipeline {
        handle: CameraHandle {
            camera,
            status,
            table,
        },
        stop,
        supervisor: Some(supervisor_handle),
        finalizer: Some(finalizer_handle),
    })
}

impl CameraPipeline {
    pub fn handle(&self) -> CameraHandle {
        self.handle.clone()
    }

    /// Requests a cooperative stop; returns immediately.
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Waits for the supervisor, then for the finalizer to drain every handed-off track.
    /// Returns the number of tracks finalized.
    pub fn join(mut self) -> usize {
        let camera = self.handle.camera.clone();
        if let Some(handle) = self.supervisor.take() {
            if handle.join().is_err() {
                tracing::error!("Camera {}: supervisor thread panicked", camera);
            }
        }
        let finalized = match self.finalizer.take().map(|h| h.join()) {
            Some(Ok(count)) => count,
            Some(Err(_)) => {
                tracing::error!("Camera {}: finalizer thread panicked", camera);
                0
            }
            None => 0,
        };
        tracing::info!(
            "Camera {}: pipeline stopped, {} tracks finalized",
            camera,
            finalized
        );
        finalized
    }
}

use crate::pipeline::movement::MovementConfig;
use crate::pipeline::sink::{encode_jpeg, LocalStore, Overlay, RemoteSink, Submission};
use crate::pipeline::supervisor::SupervisorStatus;
use crate::pipeline::track::Track;
use crate::pipeline::types::{Camera, Observation, TrackId};
use anyhow::Result;
use crossbeam::channel::Receiver;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum RemoteOutcome {
    Submitted,
    Rejected(String),
    SkippedStatic,
    /// No remote sink configured
    Disabled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FinalizeReport {
    pub track_id: TrackId,
    pub serial: u64,
    pub observations: usize,
    pub moving: bool,
    /// `None` when local persistence failed.
    pub persisted_path: Option<PathBuf>,
    pub remote: RemoteOutcome,
}

/// Turns an evicted track into at most one local artifact and one remote event.
pub struct Finalizer {
    camera: Arc<Camera>,
    movement: MovementConfig,
    jpeg_quality: i32,
    store: Box<dyn LocalStore>,
    remote: Option<Box<dyn RemoteSink>>,
}

impl Finalizer {
    pub fn new(
        camera: Arc<Camera>,
        movement: MovementConfig,
        jpeg_quality: i32,
        store: Box<dyn LocalStore>,
        remote: Option<Box<dyn RemoteSink>>,
    ) -> Self {
        Self {
            camera,
            movement,
            jpeg_quality,
            store,
            remote,
        }
    }

    /// Persists the best observation, then submits it remotely if the track moved.
    /// The two outcomes are independent. Returns `None` for a track without observations.
    pub fn finalize(&self, track: Track) -> Option<FinalizeReport> {
        let Some(best) = track.best_observation() else {
            warn!(
                "Camera {}: track {} has no observations, nothing to finalize",
                self.camera,
                track.track_id()
            );
            return None;
        };

        let moving = track.has_movement(&self.movement);
        let stats = track.movement_statistics();
        info!(
            "Camera {}: finalizing track {} | observations: {} | duration: {:.1}s | moving: {} | avg distance: {:.2}px | max distance: {:.2}px | best quality: {:.4} | avg conf: {:.2}",
            self.camera,
            track.track_id(),
            track.len(),
            track.duration().num_milliseconds() as f64 / 1000.0,
            moving,
            stats.average_distance,
            stats.max_distance,
            best.quality(),
            track.average_confidence()
        );

        let persisted_path = self.persist(&track, best, moving);
        let remote = self.submit(&track, best, moving);

        Some(FinalizeReport {
            track_id: track.track_id(),
            serial: track.serial(),
            observations: track.len(),
            moving,
            persisted_path,
            remote,
        })
    }

    fn persist(&self, track: &Track, best: &Observation, moving: bool) -> Option<PathBuf> {
        let overlay = Overlay {
            camera_id: self.camera.id,
            track_id: track.track_id(),
            bbox: best.bbox(),
            moving,
            quality: best.quality(),
            confidence: best.confidence(),
            landmarks: best.landmarks().copied(),
            captured_at: best.captured_at(),
        };
        match self.store.persist(best.frame(), &overlay) {
            Ok(path) => {
                info!(
                    "Camera {}: best face of track {} saved to {}",
                    self.camera,
                    track.track_id(),
                    path.display()
                );
                Some(path)
            }
            Err(e) => {
                error!(
                    "Camera {}: failed to save track {}: {:#}",
                    self.camera,
                    track.track_id(),
                    e
                );
                None
            }
        }
    }

    fn submit(&self, track: &Track, best: &Observation, moving: bool) -> RemoteOutcome {
        if !moving {
            info!(
                "Camera {}: track {} discarded, no significant movement",
                self.camera,
                track.track_id()
            );
            return RemoteOutcome::SkippedStatic;
        }
        let Some(remote) = &self.remote else {
            return RemoteOutcome::Disabled;
        };

        match self.send(remote.as_ref(), best) {
            Ok(()) => {
                info!(
                    "Camera {}: track {} submitted (quality={:.4}, observations={})",
                    self.camera,
                    track.track_id(),
                    best.quality(),
                    track.len()
                );
                RemoteOutcome::Submitted
            }
            Err(e) => {
                error!(
                    "Camera {}: submission of track {} failed: {:#}",
                    self.camera,
                    track.track_id(),
                    e
                );
                RemoteOutcome::Rejected(format!("{:#}", e))
            }
        }
    }

    fn send(&self, remote: &dyn RemoteSink, best: &Observation) -> Result<()> {
        let submission = Submission {
            image_jpeg: encode_jpeg(best.frame(), self.jpeg_quality)?,
            roi: best.bbox(),
            camera_id: self.camera.id,
            camera_token: self.camera.token.clone(),
            timestamp: best.captured_at(),
        };
        let response = remote.submit(&submission)?;
        info!(
            "Camera {}: remote answered {} {}",
            self.camera, response.status, response.body
        );
        Ok(())
    }
}

/// Finalize worker: receives evicted tracks until every sender is gone.
/// Returns the number of tracks finalized.
pub fn finalize_worker(
    rx: Receiver<Track>,
    finalizer: Finalizer,
    status: Arc<SupervisorStatus>,
) -> usize {
    let mut finalized = 0;
    for track in rx {
        let start_inst = Instant::now();
        let Some(report) = finalizer.finalize(track) else {
            continue;
        };
        finalized += 1;
        status.finalized.fetch_add(1, Ordering::Relaxed);

        if report.persisted_path.is_some() {
            status.persisted.fetch_add(1, Ordering::Relaxed);
        } else {
            status.persist_failures.fetch_add(1, Ordering::Relaxed);
        }
        match &report.remote {
            RemoteOutcome::Submitted => {
                status.submitted.fetch_add(1, Ordering::Relaxed);
            }
            RemoteOutcome::Rejected(reason) => {
                status.submit_failures.fetch_add(1, Ordering::Relaxed);
                status.record_error(format!("submit track {}: {}", report.track_id, reason));
            }
            RemoteOutcome::SkippedStatic => {
                status.static_discarded.fetch_add(1, Ordering::Relaxed);
            }
            RemoteOutcome::Disabled => {}
        }

        tracing::debug!(
            "Track {} finalized in {:.1}ms",
            report.track_id,
            start_inst.elapsed().as_secs_f64() * 1000.0
        );
    }
    finalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::sink::SinkResponse;
    use crate::pipeline::types::{BoundingBox, Detection, Landmarks};
    use anyhow::bail;
    use chrono::{TimeZone, Utc};
    use crossbeam::channel;
    use opencv::core::{Mat, Scalar, CV_8UC3};
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct RecordingStore {
        calls: Arc<Mutex<Vec<Overlay>>>,
        fail: bool,
    }

    impl LocalStore for RecordingStore {
        fn persist(&self, _image: &Mat, overlay: &Overlay) -> Result<PathBuf> {
            self.calls.lock().unwrap().push(overlay.clone());
            if self.fail {
                bail!("disk full");
            }
            Ok(PathBuf::from(overlay.file_name()))
        }
    }

    #[derive(Clone, Default)]
    struct RecordingRemote {
        calls: Arc<Mutex<Vec<Submission>>>,
        fail: bool,
    }

    impl RemoteSink for RecordingRemote {
        fn submit(&self, submission: &Submission) -> Result<SinkResponse> {
            self.calls.lock().unwrap().push(submission.clone());
            if self.fail {
                bail!("HTTP 500");
            }
            Ok(SinkResponse {
                status: 200,
                body: "{\"id\": 1}".to_string(),
            })
        }
    }

    fn camera() -> Arc<Camera> {
        Arc::new(Camera {
            id: 12,
            name: "Hall".to_string(),
            token: "cam-token".to_string(),
            url: "rtsp://example/hall".to_string(),
        })
    }

    /// Ten observations stepping `step` pixels to the right, quality peaking at index 4,
    /// the only one with landmarks.
    fn track(step: i32) -> Track {
        let mut track = Track::new(5, 0);
        let at = Utc.with_ymd_and_hms(2026, 2, 1, 8, 0, 0).unwrap();
        for i in 0..10 {
            let x = 10 + i * step;
            let frame =
                Mat::new_rows_cols_with_default(120, 1000, CV_8UC3, Scalar::all(60.0)).unwrap();
            let landmarks = if i == 4 {
                let x = x as f32;
                Landmarks::from_points(&[
                    (x + 9.0, 32.0),
                    (x + 21.0, 32.0),
                    (x + 15.0, 40.0),
                    (x + 10.0, 50.0),
                    (x + 20.0, 50.0),
                ])
            } else {
                None
            };
            let detection =
                Detection::new(5, BoundingBox::new(x, 20, x + 30, 60), 0.8, landmarks).unwrap();
            let quality = if i == 4 { 0.9 } else { 0.1 * (i % 4) as f32 };
            track.push(Observation::new(
                Arc::new(frame),
                &detection,
                quality,
                at + chrono::Duration::milliseconds(i as i64 * 40),
            ));
        }
        track
    }

    fn finalizer(store: &RecordingStore, remote: Option<&RecordingRemote>) -> Finalizer {
        Finalizer::new(
            camera(),
            MovementConfig::default(),
            95,
            Box::new(store.clone()),
            remote.map(|r| Box::new(r.clone()) as Box<dyn RemoteSink>),
        )
    }

    #[test]
    fn test_static_track_is_persisted_not_submitted() {
        let store = RecordingStore::default();
        let remote = RecordingRemote::default();
        let report = finalizer(&store, Some(&remote)).finalize(track(1)).unwrap();

        assert!(!report.moving);
        assert_eq!(report.remote, RemoteOutcome::SkippedStatic);
        assert!(report.persisted_path.is_some());
        let overlays = store.calls.lock().unwrap();
        assert_eq!(overlays.len(), 1);
        assert!(!overlays[0].moving);
        assert!(remote.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_moving_track_is_persisted_and_submitted() {
        let store = RecordingStore::default();
        let remote = RecordingRemote::default();
        let report = finalizer(&store, Some(&remote)).finalize(track(80)).unwrap();

        assert!(report.moving);
        assert_eq!(report.remote, RemoteOutcome::Submitted);
        assert_eq!(report.observations, 10);

        let overlays = store.calls.lock().unwrap();
        assert_eq!(overlays[0].quality, 0.9);
        assert_eq!(overlays[0].landmarks.map(|lm| lm.nose()), Some((345.0, 40.0)));
        let submissions = remote.calls.lock().unwrap();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].roi, BoundingBox::new(330, 20, 360, 60));
        assert_eq!(submissions[0].camera_token, "cam-token");
        assert_eq!(submissions[0].camera_id, 12);
        assert_eq!(&submissions[0].image_jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_persist_failure_does_not_block_submission() {
        let store = RecordingStore {
            fail: true,
            ..Default::default()
        };
        let remote = RecordingRemote::default();
        let report = finalizer(&store, Some(&remote)).finalize(track(80)).unwrap();

        assert!(report.persisted_path.is_none());
        assert_eq!(report.remote, RemoteOutcome::Submitted);
    }

    #[test]
    fn test_submit_failure_keeps_local_artifact() {
        let store = RecordingStore::default();
        let remote = RecordingRemote {
            fail: true,
            ..Default::default()
        };
        let report = finalizer(&store, Some(&remote)).finalize(track(80)).unwrap();

        assert!(report.persisted_path.is_some());
        assert!(matches!(report.remote, RemoteOutcome::Rejected(ref r) if r.contains("HTTP 500")));
    }

    #[test]
    fn test_without_remote_sink() {
        let store = RecordingStore::default();
        let report = finalizer(&store, None).finalize(track(80)).unwrap();
        assert_eq!(report.remote, RemoteOutcome::Disabled);
        assert!(report.persisted_path.is_some());
    }

    #[test]
    fn test_empty_track_is_skipped() {
        let store = RecordingStore::default();
        assert!(finalizer(&store, None).finalize(Track::new(1, 0)).is_none());
        assert!(store.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_worker_counts_outcomes() {
        let store = RecordingStore::default();
        let remote = RecordingRemote::default();
        let status = Arc::new(SupervisorStatus::new(&camera()));
        let (tx, rx) = channel::unbounded();

        tx.send(track(1)).unwrap();
        tx.send(track(80)).unwrap();
        tx.send(Track::new(9, 3)).unwrap();
        drop(tx);

        let finalized = finalize_worker(rx, finalizer(&store, Some(&remote)), status.clone());
        assert_eq!(finalized, 2);
        assert_eq!(status.finalized.load(Ordering::Relaxed), 2);
        assert_eq!(status.persisted.load(Ordering::Relaxed), 2);
        assert_eq!(status.submitted.load(Ordering::Relaxed), 1);
        assert_eq!(status.static_discarded.load(Ordering::Relaxed), 1);
    }
}

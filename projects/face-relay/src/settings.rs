use crate::pipeline::movement::MovementConfig;
use crate::pipeline::quality::QualityWeights;
use crate::pipeline::types::Camera;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DetectorKind {
    /// YOLO keypoint face model, boxes come with five landmarks
    Face,
    /// RT-DETR object model, no landmarks
    Object,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct DetectorSettings {
    pub kind: DetectorKind,
    pub model_path: String,
    /// Detector class kept, everything else is dropped
    pub class_name: String,
    pub confidence: f32,
    pub iou: f32,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            kind: DetectorKind::Face,
            model_path: "models/yolov8n-face.onnx".to_string(),
            class_name: "face".to_string(),
            confidence: 0.1,
            iou: 0.2,
        }
    }
}

/// ByteTrack parameters.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TrackerSettings {
    pub frame_rate: usize,
    pub track_buffer: usize,
    pub track_thresh: f32,
    pub high_thresh: f32,
    pub match_thresh: f32,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            frame_rate: 30,
            track_buffer: 30,
            track_thresh: 0.25,
            high_thresh: 0.25,
            match_thresh: 0.8,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TrackingSettings {
    /// Consecutive frames without a sighting before a track is finalized
    pub max_frames_lost: u32,
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self { max_frames_lost: 30 }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct StreamSettings {
    pub reconnect_interval_secs: f64,
    /// Absent means retry forever.
    pub max_reconnect_attempts: Option<u32>,
    pub open_timeout_secs: f64,
    /// Bounds how long a stalled read can delay a stop request
    pub read_timeout_secs: f64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            reconnect_interval_secs: 5.0,
            max_reconnect_attempts: None,
            open_timeout_secs: 10.0,
            read_timeout_secs: 5.0,
        }
    }
}

impl StreamSettings {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs_f64(self.reconnect_interval_secs.max(0.0))
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.open_timeout_secs.max(0.0))
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.read_timeout_secs.max(0.0))
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct StorageSettings {
    pub project_dir: PathBuf,
    pub results_dir: PathBuf,
    pub jpeg_quality: i32,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            project_dir: PathBuf::from("./imagens"),
            results_dir: PathBuf::from("rtsp_byte_track_results"),
            jpeg_quality: 95,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct FindfaceSettings {
    pub timeout_secs: u64,
    pub mf_selector: String,
    /// Camera groups whose name starts with this (any case) are polled for RTSP cameras
    pub camera_prefix: String,
}

impl Default for FindfaceSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            mf_selector: "all".to_string(),
            camera_prefix: "EXTERNO".to_string(),
        }
    }
}

impl FindfaceSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Settings {
    pub detector: DetectorSettings,
    pub tracker: TrackerSettings,
    pub tracking: TrackingSettings,
    pub movement: MovementConfig,
    pub quality: QualityWeights,
    pub stream: StreamSettings,
    pub storage: StorageSettings,
    pub findface: FindfaceSettings,
    /// Per-detection logging at info level
    pub verbose: bool,
    pub cameras: Vec<Camera>,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Puts discovered cameras ahead of the configured ones. A configured camera
    /// replaces a discovered one with the same id.
    pub fn merge_cameras(&mut self, discovered: Vec<Camera>) {
        let configured: HashSet<i64> = self.cameras.iter().map(|c| c.id).collect();
        let mut merged = Vec::with_capacity(discovered.len() + self.cameras.len());
        for camera in discovered {
            if configured.contains(&camera.id) {
                warn!("Camera {} is also configured locally, keeping the local entry", camera);
                continue;
            }
            merged.push(camera);
        }
        merged.append(&mut self.cameras);
        self.cameras = merged;
    }

    /// Checks everything a pipeline relies on; `remote_enabled` makes camera tokens mandatory.
    pub fn validate(&self, remote_enabled: bool) -> Result<()> {
        if self.cameras.is_empty() {
            bail!("No cameras configured");
        }
        let mut ids = HashSet::new();
        for camera in &self.cameras {
            if !ids.insert(camera.id) {
                bail!("Duplicate camera id {}", camera.id);
            }
            if camera.name.trim().is_empty() {
                bail!("Camera {} has an empty name", camera.id);
            }
            if camera.url.trim().is_empty() {
                bail!("Camera {} has an empty url", camera);
            }
            if remote_enabled && camera.token.trim().is_empty() {
                bail!("Camera {} needs a token when FindFace submission is enabled", camera);
            }
        }

        if self.tracking.max_frames_lost < 1 {
            bail!("tracking.max_frames_lost must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.movement.min_frame_fraction) {
            bail!(
                "movement.min_frame_fraction must be within [0, 1], got {}",
                self.movement.min_frame_fraction
            );
        }
        if !self.movement.min_pixels.is_finite() || self.movement.min_pixels < 0.0 {
            bail!("movement.min_pixels must be a non-negative number");
        }
        self.quality.validate()?;

        if !(0.0..=1.0).contains(&self.detector.confidence) {
            bail!("detector.confidence must be within [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.detector.iou) {
            bail!("detector.iou must be within [0, 1]");
        }
        if !self.stream.reconnect_interval_secs.is_finite() || self.stream.reconnect_interval_secs < 0.0 {
            bail!("stream.reconnect_interval_secs must be a non-negative number");
        }
        for (name, secs) in [
            ("open_timeout_secs", self.stream.open_timeout_secs),
            ("read_timeout_secs", self.stream.read_timeout_secs),
        ] {
            if !secs.is_finite() || secs <= 0.0 || secs > 3600.0 {
                bail!("stream.{} must be within (0, 3600]", name);
            }
        }
        if self.stream.max_reconnect_attempts == Some(0) {
            bail!("stream.max_reconnect_attempts must be at least 1 when set");
        }
        if !(0..=100).contains(&self.storage.jpeg_quality) {
            bail!("storage.jpeg_quality must be within [0, 100]");
        }
        Ok(())
    }

    pub fn results_dir(&self) -> PathBuf {
        self.storage.project_dir.join(&self.storage.results_dir)
    }
}

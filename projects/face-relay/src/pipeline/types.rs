use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use opencv::core::Mat;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Identity assigned by the upstream tracker.
pub type TrackId = i64;

/// Static camera descriptor, immutable for the process lifetime.
#[derive(Deserialize, Clone)]
pub struct Camera {
    pub id: i64,
    pub name: String,
    /// Opaque token the remote sink authenticates events with.
    #[serde(default)]
    pub token: String,
    /// Stream locator: RTSP URL, file path or device index.
    pub url: String,
}

impl fmt::Debug for Camera {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Camera")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("token", &"<redacted>")
            .field("url", &self.url)
            .finish()
    }
}

impl fmt::Display for Camera {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.id, self.name)
    }
}

/// Pixel bounding box in image coordinates (x1, y1) top-left, (x2, y2) bottom-right.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Rounds float corners coming from a detector.
    pub fn from_xyxy(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x1: x1.round() as i32,
            y1: y1.round() as i32,
            x2: x2.round() as i32,
            y2: y2.round() as i32,
        }
    }

    pub fn width(&self) -> i32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> i32 {
        self.y2 - self.y1
    }

    pub fn is_valid(&self) -> bool {
        self.x1 < self.x2 && self.y1 < self.y2
    }

    pub fn center(&self) -> (f64, f64) {
        (
            (self.x1 as f64 + self.x2 as f64) / 2.0,
            (self.y1 as f64 + self.y2 as f64) / 2.0,
        )
    }

    /// Clips the box to a `width` x `height` image, keeping x1 <= x2 and y1 <= y2.
    pub fn clamp_to(&self, width: i32, height: i32) -> Self {
        let x1 = self.x1.clamp(0, width.max(0));
        let y1 = self.y1.clamp(0, height.max(0));
        Self {
            x1,
            y1,
            x2: self.x2.clamp(x1, width.max(x1)),
            y2: self.y2.clamp(y1, height.max(y1)),
        }
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {}, {})", self.x1, self.y1, self.x2, self.y2)
    }
}

/// Five facial keypoints: left eye, right eye, nose, mouth left, mouth right.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Landmarks {
    pub points: [(f32, f32); 5],
}

impl Landmarks {
    /// Accepts exactly five finite points, anything else is treated as absent.
    pub fn from_points(points: &[(f32, f32)]) -> Option<Self> {
        if points.len() != 5 || points.iter().any(|(x, y)| !x.is_finite() || !y.is_finite()) {
            return None;
        }
        let mut fixed = [(0.0, 0.0); 5];
        fixed.copy_from_slice(points);
        Some(Self { points: fixed })
    }

    pub fn left_eye(&self) -> (f32, f32) {
        self.points[0]
    }

    pub fn right_eye(&self) -> (f32, f32) {
        self.points[1]
    }

    pub fn nose(&self) -> (f32, f32) {
        self.points[2]
    }

    pub fn mouth_left(&self) -> (f32, f32) {
        self.points[3]
    }

    pub fn mouth_right(&self) -> (f32, f32) {
        self.points[4]
    }
}

/// One detection as handed over by the detection source, validated at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub track_id: TrackId,
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub landmarks: Option<Landmarks>,
}

impl Detection {
    pub fn new(
        track_id: TrackId,
        bbox: BoundingBox,
        confidence: f32,
        landmarks: Option<Landmarks>,
    ) -> Result<Self> {
        if !bbox.is_valid() {
            bail!("Track {}: degenerate bounding box {}", track_id, bbox);
        }
        if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
            bail!("Track {}: confidence {} outside [0, 1]", track_id, confidence);
        }
        Ok(Self {
            track_id,
            bbox,
            confidence,
            landmarks,
        })
    }
}

/// All detections of one decoded frame, together with the frame itself.
pub struct FrameBatch {
    pub frame: Mat,
    pub detections: Vec<Detection>,
    pub captured_at: DateTime<Utc>,
}

impl FrameBatch {
    pub fn new(frame: Mat, detections: Vec<Detection>) -> Self {
        Self {
            frame,
            detections,
            captured_at: Utc::now(),
        }
    }
}

/// Immutable snapshot of one sighting, owned by the track it was appended to.
/// Every observation of a frame shares that frame's pixels.
pub struct Observation {
    frame: Arc<Mat>,
    bbox: BoundingBox,
    confidence: f32,
    landmarks: Option<Landmarks>,
    quality: f32,
    captured_at: DateTime<Utc>,
}

impl Observation {
    pub fn new(
        frame: Arc<Mat>,
        detection: &Detection,
        quality: f32,
        captured_at: DateTime<Utc>,
    ) -> Self {
        Self {
            frame,
            bbox: detection.bbox,
            confidence: detection.confidence,
            landmarks: detection.landmarks,
            quality,
            captured_at,
        }
    }

    pub fn frame(&self) -> &Mat {
        &self.frame
    }

    pub fn bbox(&self) -> BoundingBox {
        self.bbox
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn landmarks(&self) -> Option<&Landmarks> {
        self.landmarks.as_ref()
    }

    pub fn quality(&self) -> f32 {
        self.quality
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }
}

impl fmt::Debug for Observation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observation")
            .field("bbox", &self.bbox)
            .field("confidence", &self.confidence)
            .field("landmarks", &self.landmarks)
            .field("quality", &self.quality)
            .field("captured_at", &self.captured_at)
            .finish()
    }
}

use crate::pipeline::types::{BoundingBox, Landmarks, TrackId};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use opencv::core::{Mat, Point, Rect, Scalar, Vector};
use opencv::imgcodecs::{imencode, imwrite, IMWRITE_JPEG_QUALITY};
use opencv::imgproc::{circle, get_text_size, put_text, rectangle, FONT_HERSHEY_SIMPLEX, LINE_8};
use opencv::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// What the local artifact annotates the best frame with.
#[derive(Debug, Clone, PartialEq)]
pub struct Overlay {
    pub camera_id: i64,
    pub track_id: TrackId,
    pub bbox: BoundingBox,
    pub moving: bool,
    pub quality: f32,
    pub confidence: f32,
    pub landmarks: Option<Landmarks>,
    pub captured_at: DateTime<Utc>,
}

impl Overlay {
    fn movement_label(&self) -> &'static str {
        if self.moving {
            "MOV"
        } else {
            "STATIC"
        }
    }

    pub fn label(&self) -> String {
        format!(
            "Track {} | {} | Quality: {:.4} | Conf: {:.2}",
            self.track_id,
            self.movement_label(),
            self.quality,
            self.confidence
        )
    }

    pub fn file_name(&self) -> String {
        format!(
            "Camera_{}_{}_Track_{}_{}.jpg",
            self.camera_id,
            self.movement_label(),
            self.track_id,
            self.captured_at.format("%Y%m%d_%H%M%S_%3f")
        )
    }

    /// BGR: green for moving tracks, yellow for static ones.
    fn color(&self) -> Scalar {
        if self.moving {
            Scalar::new(0.0, 255.0, 0.0, 0.0)
        } else {
            Scalar::new(0.0, 255.0, 255.0, 0.0)
        }
    }
}

/// Event sent to the remote recognition service.
#[derive(Debug, Clone)]
pub struct Submission {
    pub image_jpeg: Vec<u8>,
    pub roi: BoundingBox,
    pub camera_id: i64,
    pub camera_token: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SinkResponse {
    pub status: u16,
    pub body: String,
}

pub trait LocalStore: Send {
    /// Writes the annotated image and returns where it landed.
    fn persist(&self, image: &Mat, overlay: &Overlay) -> Result<PathBuf>;
}

pub trait RemoteSink: Send {
    fn submit(&self, submission: &Submission) -> Result<SinkResponse>;
}

pub fn encode_jpeg(image: &Mat, quality: i32) -> Result<Vec<u8>> {
    if image.empty() {
        bail!("Cannot encode an empty image");
    }
    let mut params = Vector::<i32>::new();
    params.push(IMWRITE_JPEG_QUALITY);
    params.push(quality);
    let mut buf = Vector::<u8>::new();
    let ok = imencode(".jpg", image, &mut buf, &params).context("JPEG encoding failed")?;
    if !ok {
        bail!("JPEG encoder rejected the image");
    }
    Ok(buf.to_vec())
}

/// Draws the track box, its landmarks and its label onto `image`.
pub fn draw_overlay(image: &mut Mat, overlay: &Overlay) -> Result<()> {
    let color = overlay.color();
    let b = overlay.bbox;
    rectangle(
        image,
        Rect::new(b.x1, b.y1, b.width(), b.height()),
        color,
        2,
        LINE_8,
        0,
    )?;
    if let Some(landmarks) = &overlay.landmarks {
        for (x, y) in landmarks.points {
            let center = Point::new(x.round() as i32, y.round() as i32);
            circle(image, center, 2, color, -1, LINE_8, 0)?;
        }
    }

    let label = overlay.label();
    let mut baseline = 0;
    let size = get_text_size(&label, FONT_HERSHEY_SIMPLEX, 0.6, 2, &mut baseline)?;
    // Filled background above the box, text in black on top of it.
    rectangle(
        image,
        Rect::new(b.x1, b.y1 - size.height - 10, size.width, size.height + 10),
        color,
        -1,
        LINE_8,
        0,
    )?;
    put_text(
        image,
        &label,
        Point::new(b.x1, b.y1 - 5),
        FONT_HERSHEY_SIMPLEX,
        0.6,
        Scalar::new(0.0, 0.0, 0.0, 0.0),
        2,
        LINE_8,
        false,
    )?;
    Ok(())
}

/// Annotated JPEG artifacts under `<project_dir>/<results_dir>/`.
pub struct DiskStore {
    dir: PathBuf,
    jpeg_quality: i32,
}

impl DiskStore {
    pub fn new(project_dir: impl AsRef<Path>, results_dir: impl AsRef<Path>, jpeg_quality: i32) -> Self {
        Self {
            dir: project_dir.as_ref().join(results_dir),
            jpeg_quality: jpeg_quality.clamp(0, 100),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl LocalStore for DiskStore {
    fn persist(&self, image: &Mat, overlay: &Overlay) -> Result<PathBuf> {
        if image.empty() {
            bail!("Track {}: best observation has no image", overlay.track_id);
        }
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;

        let mut annotated = image.try_clone()?;
        draw_overlay(&mut annotated, overlay)?;

        let path = self.dir.join(overlay.file_name());
        let path_str = path
            .to_str()
            .with_context(|| format!("Non UTF-8 output path {}", path.display()))?;
        let mut params = Vector::<i32>::new();
        params.push(IMWRITE_JPEG_QUALITY);
        params.push(self.jpeg_quality);
        let written = imwrite(path_str, &annotated, &params)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        if !written {
            bail!("Image writer refused {}", path.display());
        }
        debug!("Wrote {}", path.display());
        Ok(path)
    }
}

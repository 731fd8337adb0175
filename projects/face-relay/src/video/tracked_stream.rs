// Detection source backed by a real stream: frames from OpenCV, boxes from the
// wrapped detector, identities from ByteTrack.

use super::opencv_reader::OpencvReader;
use super::{DetectionSource, VideoReader};
use crate::pipeline::detection::{landmarks_for, Candidate, FaceDetector, ObjectDetector};
use crate::pipeline::types::{BoundingBox, Camera, Detection, FrameBatch, Landmarks, TrackId};
use crate::settings::{DetectorKind, DetectorSettings, StreamSettings, TrackerSettings};
use anyhow::{bail, Context, Result};
use jamtrack_rs::byte_tracker::ByteTracker;
use jamtrack_rs::{Object, Rect as JamRect};
use opencv::core::Mat;
use opencv::prelude::*;
use std::sync::Arc;
use tracing::debug;

pub trait Detector {
    fn detect(&mut self, frame: &Mat) -> Result<Vec<Candidate>>;
}

impl Detector for ObjectDetector {
    fn detect(&mut self, frame: &Mat) -> Result<Vec<Candidate>> {
        ObjectDetector::detect(self, frame)
    }
}

impl Detector for FaceDetector {
    fn detect(&mut self, frame: &Mat) -> Result<Vec<Candidate>> {
        FaceDetector::detect(self, frame)
    }
}

/// Minimum overlap between a tracker box and a detection to inherit its landmarks.
const LANDMARK_MIN_IOU: f32 = 0.5;

fn build_detector(settings: &DetectorSettings) -> Result<Box<dyn Detector>> {
    let detector: Box<dyn Detector> = match settings.kind {
        DetectorKind::Face => Box::new(FaceDetector::new(
            &settings.model_path,
            &settings.class_name,
            settings.confidence,
            settings.iou,
        )?),
        DetectorKind::Object => Box::new(ObjectDetector::new(
            &settings.model_path,
            &settings.class_name,
            settings.confidence,
            settings.iou,
        )?),
    };
    Ok(detector)
}

pub type ReaderFactory = Box<dyn FnMut() -> Result<Box<dyn VideoReader>>>;
pub type DetectorFactory = Box<dyn FnMut() -> Result<Box<dyn Detector>>>;

pub struct TrackedStream {
    camera: Arc<Camera>,
    open_reader: ReaderFactory,
    load_detector: DetectorFactory,
    reader: Option<Box<dyn VideoReader>>,
    /// Loaded on the first successful `open`, kept across reconnects.
    detector: Option<Box<dyn Detector>>,
    /// Never reset, so identities are not reused after a reconnect.
    tracker: ByteTracker,
}

impl TrackedStream {
    pub fn new(
        camera: Arc<Camera>,
        detector: &DetectorSettings,
        tracker: &TrackerSettings,
        stream: &StreamSettings,
    ) -> Self {
        let url = camera.url.clone();
        let (open_timeout, read_timeout) = (stream.open_timeout(), stream.read_timeout());
        let open_reader: ReaderFactory = Box::new(move || {
            let reader = OpencvReader::open(&url, open_timeout, read_timeout)?;
            Ok(Box::new(reader) as Box<dyn VideoReader>)
        });

        let detector = detector.clone();
        let load_detector: DetectorFactory = Box::new(move || {
            build_detector(&detector)
                .with_context(|| format!("Failed to load detector model {}", detector.model_path))
        });

        Self::with_parts(camera, open_reader, load_detector, byte_tracker(tracker))
    }

    pub fn with_parts(
        camera: Arc<Camera>,
        open_reader: ReaderFactory,
        load_detector: DetectorFactory,
        tracker: ByteTracker,
    ) -> Self {
        Self {
            camera,
            open_reader,
            load_detector,
            reader: None,
            detector: None,
            tracker,
        }
    }
}

pub fn byte_tracker(settings: &TrackerSettings) -> ByteTracker {
    ByteTracker::new(
        settings.frame_rate.max(1),
        settings.track_buffer,
        settings.track_thresh,
        settings.high_thresh,
        settings.match_thresh,
    )
}

impl DetectionSource for TrackedStream {
    fn open(&mut self) -> Result<()> {
        self.reader = None;
        if self.detector.is_none() {
            self.detector = Some((self.load_detector)()?);
        }
        self.reader = Some((self.open_reader)()?);
        Ok(())
    }

    fn next_batch(&mut self) -> Result<Option<FrameBatch>> {
        let (Some(reader), Some(detector)) = (self.reader.as_mut(), self.detector.as_mut()) else {
            bail!("Camera {}: stream is not open", self.camera);
        };

        let Some(frame) = reader.read_frame()? else {
            self.reader = None;
            return Ok(None);
        };

        let candidates = detector.detect(&frame)?;
        let objects: Vec<Object> = candidates
            .iter()
            .map(|c| Object::new(JamRect::from_xyxy(c.x1, c.y1, c.x2, c.y2), c.confidence, None))
            .collect();
        let tracked = self
            .tracker
            .update(&objects)
            .context("Tracker update failed")?;

        let size = frame.size()?;
        let mut detections = Vec::with_capacity(tracked.len());
        for obj in tracked {
            let Some(track_id) = obj.get_track_id() else {
                continue;
            };
            let xyxy = obj.get_rect().get_xyxy();
            let landmarks = landmarks_for(xyxy, &candidates, LANDMARK_MIN_IOU);
            match to_detection(
                track_id as TrackId,
                xyxy,
                obj.get_prob(),
                landmarks,
                size.width,
                size.height,
            ) {
                Ok(detection) => detections.push(detection),
                Err(e) => debug!("Camera {}: skipping detection: {:#}", self.camera, e),
            }
        }

        Ok(Some(FrameBatch::new(frame, detections)))
    }
}

/// Clips a tracker box to the frame and validates it.
pub fn to_detection(
    track_id: TrackId,
    xyxy: [f32; 4],
    confidence: f32,
    landmarks: Option<Landmarks>,
    frame_width: i32,
    frame_height: i32,
) -> Result<Detection> {
    let [x1, y1, x2, y2] = xyxy;
    if ![x1, y1, x2, y2].iter().all(|v| v.is_finite()) {
        bail!("Track {}: non-finite box", track_id);
    }
    let bbox = BoundingBox::from_xyxy(x1, y1, x2, y2).clamp_to(frame_width, frame_height);
    Detection::new(track_id, bbox, confidence, landmarks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{Scalar, CV_8UC3};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingReader {
        remaining: usize,
    }

    impl VideoReader for CountingReader {
        fn read_frame(&mut self) -> Result<Option<Mat>> {
            if self.remaining == 0 {
                return Ok(None);
            }
            self.remaining -= 1;
            Ok(Some(Mat::new_rows_cols_with_default(240, 320, CV_8UC3, Scalar::all(0.0))?))
        }
    }

    struct FixedDetector;

    impl Detector for FixedDetector {
        fn detect(&mut self, _frame: &Mat) -> Result<Vec<Candidate>> {
            Ok(vec![Candidate {
                x1: 100.0,
                y1: 60.0,
                x2: 160.0,
                y2: 140.0,
                confidence: 0.9,
                landmarks: Landmarks::from_points(&face_points()),
            }])
        }
    }

    fn face_points() -> [(f32, f32); 5] {
        [
            (118.0, 90.0),
            (142.0, 90.0),
            (130.0, 105.0),
            (120.0, 122.0),
            (140.0, 122.0),
        ]
    }

    fn camera() -> Arc<Camera> {
        Arc::new(Camera {
            id: 2,
            name: "Dock".to_string(),
            token: String::new(),
            url: "test://dock".to_string(),
        })
    }

    fn stream(frames: usize, loads: Arc<AtomicUsize>) -> TrackedStream {
        TrackedStream::with_parts(
            camera(),
            Box::new(move || Ok(Box::new(CountingReader { remaining: frames }) as Box<dyn VideoReader>)),
            Box::new(move || {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(FixedDetector) as Box<dyn Detector>)
            }),
            byte_tracker(&TrackerSettings::default()),
        )
    }

    #[test]
    fn test_next_batch_requires_open() {
        let mut s = stream(3, Arc::new(AtomicUsize::new(0)));
        assert!(s.next_batch().is_err());
    }

    #[test]
    fn test_stream_yields_tracked_batches_until_end() {
        let loads = Arc::new(AtomicUsize::new(0));
        let mut s = stream(5, loads.clone());
        s.open().unwrap();

        let mut ids = Vec::new();
        let mut batches = 0;
        while let Some(batch) = s.next_batch().unwrap() {
            batches += 1;
            for d in &batch.detections {
                assert!(d.bbox.is_valid());
                assert_eq!(d.landmarks.map(|lm| lm.points), Some(face_points()));
                ids.push(d.track_id);
            }
        }
        assert_eq!(batches, 5);
        assert!(!ids.is_empty());
        assert!(ids.iter().all(|id| *id == ids[0]));

        // Reconnect keeps the loaded detector.
        s.open().unwrap();
        assert!(s.next_batch().unwrap().is_some());
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_to_detection_clips_and_validates() {
        let d = to_detection(4, [-5.0, 10.0, 50.4, 400.0], 0.7, None, 320, 240).unwrap();
        assert_eq!(d.bbox, BoundingBox::new(0, 10, 50, 240));
        assert!(d.landmarks.is_none());

        let lm = Landmarks::from_points(&face_points());
        let d = to_detection(5, [100.0, 60.0, 160.0, 140.0], 0.8, lm, 320, 240).unwrap();
        assert_eq!(d.landmarks, lm);

        assert!(to_detection(4, [10.0, 10.0, 10.2, 30.0], 0.7, None, 320, 240).is_err());
        assert!(to_detection(4, [10.0, 10.0, 20.0, 30.0], 1.5, None, 320, 240).is_err());
        assert!(to_detection(4, [f32::NAN, 10.0, 20.0, 30.0], 0.5, None, 320, 240).is_err());
        assert!(to_detection(4, [400.0, 10.0, 500.0, 30.0], 0.5, None, 320, 240).is_err());
    }
}

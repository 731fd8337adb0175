use crate::pipeline::types::Landmarks;
use anyhow::{anyhow, Result};
use image::{DynamicImage, ImageBuffer, Rgb};
use opencv::core::Mat;
use opencv::prelude::*;
use usls::models::{RTDETR, YOLO};
use usls::{Config, Image};

/// Detector output in frame pixel coordinates, before identity assignment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    /// Only keypoint models fill this in.
    pub landmarks: Option<Landmarks>,
}

impl Candidate {
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }
}

/// A wrapper around the USLS RT-DETR model that handles BGR-to-RGB conversion,
/// corrects for aspect-ratio padding in the model library and keeps only
/// confident boxes of one class after non-maximum suppression.
pub struct ObjectDetector {
    model: RTDETR,
    class_name: String,
    min_confidence: f32,
    iou_threshold: f32,
}

impl ObjectDetector {
    pub fn new(
        model_path: &str,
        class_name: &str,
        min_confidence: f32,
        iou_threshold: f32,
    ) -> Result<Self> {
        let config = Config::default()
            .with_model_file(model_path)
            .with_class_names(&usls::NAMES_COCO_80);

        #[cfg(target_os = "macos")]
        let config = config.with_model_device(usls::Device::CoreMl);

        let config = config.commit()?;
        let model = RTDETR::new(config)?;
        Ok(Self {
            model,
            class_name: class_name.to_string(),
            min_confidence,
            iou_threshold,
        })
    }

    /// Run detection on an OpenCV Mat (BGR).
    pub fn detect(&mut self, image: &Mat) -> Result<Vec<Candidate>> {
        let size = image.size()?;
        let img_w = size.width as f32;
        let img_h = size.height as f32;

        // RT-DETR letterbox workaround: boxes come back squeezed along the longer side.
        let (x_corr, y_corr) = if img_w > img_h {
            (img_w / img_h, 1.0)
        } else if img_h > img_w {
            (1.0, img_h / img_w)
        } else {
            (1.0, 1.0)
        };

        let input = Image::from(mat_to_dynamic_image(image)?);
        let results = self.model.forward(std::slice::from_ref(&input))?;

        let candidates: Vec<Candidate> = results
            .into_iter()
            .next()
            .map(|y| y.hbbs)
            .unwrap_or_default()
            .into_iter()
            .filter(|hbb| hbb.name() == Some(self.class_name.as_str()))
            .filter_map(|hbb| {
                let confidence = hbb.confidence()?;
                if confidence < self.min_confidence {
                    return None;
                }
                let x = hbb.xmin() * x_corr;
                let y = hbb.ymin() * y_corr;
                Some(Candidate {
                    x1: x,
                    y1: y,
                    x2: x + hbb.width() * x_corr,
                    y2: y + hbb.height() * y_corr,
                    confidence,
                    landmarks: None,
                })
            })
            .collect();

        Ok(nms(candidates, self.iou_threshold))
    }
}

/// A wrapper around a USLS YOLO keypoint model trained on faces (yolov8n-face and
/// friends). Every box carries the model's first five keypoints as facial landmarks.
pub struct FaceDetector {
    model: YOLO,
    class_name: String,
    min_confidence: f32,
    iou_threshold: f32,
}

impl FaceDetector {
    pub fn new(
        model_path: &str,
        class_name: &str,
        min_confidence: f32,
        iou_threshold: f32,
    ) -> Result<Self> {
        let config = Config::yolo_pose()
            .with_model_file(model_path)
            .with_class_names(&[class_name]);

        #[cfg(target_os = "macos")]
        let config = config.with_model_device(usls::Device::CoreMl);

        let config = config.commit()?;
        let model = YOLO::new(config)?;
        Ok(Self {
            model,
            class_name: class_name.to_string(),
            min_confidence,
            iou_threshold,
        })
    }

    pub fn detect(&mut self, image: &Mat) -> Result<Vec<Candidate>> {
        let input = Image::from(mat_to_dynamic_image(image)?);
        let results = self.model.forward(std::slice::from_ref(&input))?;
        let Some(y) = results.into_iter().next() else {
            return Ok(Vec::new());
        };

        let keypoints: Vec<Vec<(f32, f32)>> = y
            .keypointss
            .iter()
            .map(|kpts| kpts.iter().map(|kp| (kp.x(), kp.y())).collect())
            .collect();

        let candidates: Vec<Candidate> = y
            .hbbs
            .iter()
            .enumerate()
            .filter(|(_, hbb)| hbb.name().map_or(true, |n| n == self.class_name))
            .filter_map(|(i, hbb)| {
                let confidence = hbb.confidence()?;
                if confidence < self.min_confidence {
                    return None;
                }
                Some(Candidate {
                    x1: hbb.xmin(),
                    y1: hbb.ymin(),
                    x2: hbb.xmin() + hbb.width(),
                    y2: hbb.ymin() + hbb.height(),
                    confidence,
                    landmarks: keypoints.get(i).and_then(|k| face_landmarks(k)),
                })
            })
            .collect();

        Ok(nms(candidates, self.iou_threshold))
    }
}

/// Keeps the first five keypoints (eyes, nose, mouth corners) of a face model.
pub fn face_landmarks(keypoints: &[(f32, f32)]) -> Option<Landmarks> {
    if keypoints.len() < 5 {
        return None;
    }
    Landmarks::from_points(&keypoints[..5])
}

/// Landmarks of the candidate overlapping `xyxy` the most, if the overlap reaches `min_iou`.
/// Used to re-attach keypoints to the boxes a tracker hands back.
pub fn landmarks_for(xyxy: [f32; 4], candidates: &[Candidate], min_iou: f32) -> Option<Landmarks> {
    let [x1, y1, x2, y2] = xyxy;
    let target = Candidate {
        x1,
        y1,
        x2,
        y2,
        confidence: 0.0,
        landmarks: None,
    };
    candidates
        .iter()
        .map(|c| (compute_iou(&target, c), c))
        .filter(|(iou, _)| *iou >= min_iou)
        .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
        .and_then(|(_, c)| c.landmarks)
}

/// Greedy non-maximum suppression, highest confidence first.
pub fn nms(detections: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    let mut sorted = detections;
    sorted.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    let mut suppressed = vec![false; sorted.len()];

    for i in 0..sorted.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(sorted[i]);

        for j in (i + 1)..sorted.len() {
            if !suppressed[j] && compute_iou(&sorted[i], &sorted[j]) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

/// Compute Intersection over Union between two boxes
pub fn compute_iou(a: &Candidate, b: &Candidate) -> f32 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);

    if x2 <= x1 || y2 <= y1 {
        return 0.0;
    }

    let intersection = (x2 - x1) * (y2 - y1);
    let union = a.width() * a.height() + b.width() * b.height() - intersection;

    if union <= 0.0 {
        0.0
    } else {
        intersection / union
    }
}

/// Convert an OpenCV Mat (BGR) to an image::DynamicImage (RGB)
fn mat_to_dynamic_image(mat: &Mat) -> Result<DynamicImage> {
    let mut rgb_mat = Mat::default();
    opencv::imgproc::cvt_color_def(mat, &mut rgb_mat, opencv::imgproc::COLOR_BGR2RGB)?;

    let size = rgb_mat.size()?;
    let width = size.width as u32;
    let height = size.height as u32;

    if !rgb_mat.is_continuous() {
        return Err(anyhow!("Mat is not continuous"));
    }

    let buffer = rgb_mat.data_bytes()?.to_vec();
    let img_buffer = ImageBuffer::<Rgb<u8>, _>::from_vec(width, height, buffer)
        .ok_or_else(|| anyhow!("Failed to create ImageBuffer from Mat data"))?;

    Ok(DynamicImage::ImageRgb8(img_buffer))
}

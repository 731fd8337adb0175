// Face quality scoring: ranks observations of one track by how usable the crop is
// for recognition. Pure with respect to its inputs.

use crate::pipeline::types::{BoundingBox, Landmarks};
use anyhow::{bail, Result};
use opencv::core::{self, Mat, Rect};
use opencv::imgproc;
use opencv::prelude::*;
use serde::Deserialize;

/// Frontality assumed when no landmarks are available.
pub const FRONTALITY_UNKNOWN: f32 = 0.01;
/// Box area, as a fraction of the frame, at which the size score saturates.
const SIZE_SATURATION: f32 = 0.3;
/// Ideal face height:width ratio.
const IDEAL_ASPECT: f32 = 1.3;
/// Laplacian variance at which the sharpness score saturates.
const SHARPNESS_SATURATION: f64 = 500.0;

/// Relative weight of each sub-score in the final score.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct QualityWeights {
    pub confidence: f32,
    pub size: f32,
    pub frontality: f32,
    pub aspect: f32,
    pub sharpness: f32,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            confidence: 3.0,
            size: 4.0,
            frontality: 6.0,
            aspect: 1.0,
            sharpness: 1.0,
        }
    }
}

impl QualityWeights {
    fn as_array(&self) -> [f32; 5] {
        [
            self.confidence,
            self.size,
            self.frontality,
            self.aspect,
            self.sharpness,
        ]
    }

    pub fn total(&self) -> f32 {
        self.as_array().iter().sum()
    }

    pub fn validate(&self) -> Result<()> {
        let weights = self.as_array();
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            bail!("Quality weights must be finite and non-negative: {:?}", self);
        }
        if !weights.iter().any(|w| *w > 0.0) {
            bail!("At least one quality weight must be positive");
        }
        Ok(())
    }
}

/// The five sub-scores, each within [0, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubScores {
    pub confidence: f32,
    pub size: f32,
    pub frontality: f32,
    pub aspect: f32,
    pub sharpness: f32,
}

#[derive(Debug, Clone)]
pub struct QualityScorer {
    weights: QualityWeights,
}

impl QualityScorer {
    pub fn new(weights: QualityWeights) -> Result<Self> {
        weights.validate()?;
        Ok(Self { weights })
    }

    /// Scores one detection within `frame`. Always returns a value in [0, 1].
    pub fn score(
        &self,
        bbox: &BoundingBox,
        confidence: f32,
        frame: &Mat,
        landmarks: Option<&Landmarks>,
    ) -> f32 {
        let subs = self.sub_scores(bbox, confidence, frame, landmarks);
        self.combine(&subs)
    }

    pub fn sub_scores(
        &self,
        bbox: &BoundingBox,
        confidence: f32,
        frame: &Mat,
        landmarks: Option<&Landmarks>,
    ) -> SubScores {
        SubScores {
            confidence: confidence_score(confidence),
            size: size_score(bbox, frame.cols(), frame.rows()),
            frontality: frontality_score(landmarks),
            aspect: aspect_score(bbox),
            sharpness: sharpness_score(frame, bbox),
        }
    }

    pub fn combine(&self, subs: &SubScores) -> f32 {
        let w = &self.weights;
        let weighted = subs.confidence * w.confidence
            + subs.size * w.size
            + subs.frontality * w.frontality
            + subs.aspect * w.aspect
            + subs.sharpness * w.sharpness;
        let score = weighted / w.total();
        if score.is_finite() {
            score.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}

/// Width and height floored to one pixel.
fn floored_dims(bbox: &BoundingBox) -> (f32, f32) {
    (bbox.width().max(1) as f32, bbox.height().max(1) as f32)
}

pub fn confidence_score(confidence: f32) -> f32 {
    if confidence.is_finite() {
        confidence.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

pub fn size_score(bbox: &BoundingBox, frame_width: i32, frame_height: i32) -> f32 {
    let frame_area = frame_width.max(0) as f32 * frame_height.max(0) as f32;
    if frame_area <= 0.0 {
        return 0.0;
    }
    let (w, h) = floored_dims(bbox);
    (w * h / (frame_area * SIZE_SATURATION)).min(1.0)
}

/// 1 minus the left/right asymmetry of nose-to-eye and nose-to-mouth-corner distances.
pub fn frontality_score(landmarks: Option<&Landmarks>) -> f32 {
    let Some(lm) = landmarks else {
        return FRONTALITY_UNKNOWN;
    };

    let dist = |a: (f32, f32), b: (f32, f32)| ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt();
    let nose = lm.nose();
    let pairs = [
        (dist(nose, lm.left_eye()), dist(nose, lm.right_eye())),
        (dist(nose, lm.mouth_left()), dist(nose, lm.mouth_right())),
    ];

    let asymmetries: Vec<f32> = pairs
        .iter()
        .filter(|(l, r)| l + r > f32::EPSILON)
        .map(|(l, r)| (l - r).abs() / (l + r))
        .collect();

    if asymmetries.is_empty() {
        return FRONTALITY_UNKNOWN;
    }

    let asymmetry = asymmetries.iter().sum::<f32>() / asymmetries.len() as f32;
    (1.0 - asymmetry).clamp(0.0, 1.0)
}

pub fn aspect_score(bbox: &BoundingBox) -> f32 {
    let (w, h) = floored_dims(bbox);
    (1.0 - (h / w - IDEAL_ASPECT).abs()).max(0.0)
}

/// Normalized variance of the Laplacian over the grayscale crop; 0 for an empty crop.
pub fn sharpness_score(frame: &Mat, bbox: &BoundingBox) -> f32 {
    match laplacian_variance(frame, bbox) {
        Ok(Some(variance)) => (variance / SHARPNESS_SATURATION).min(1.0) as f32,
        Ok(None) => 0.0,
        Err(e) => {
            tracing::debug!("Sharpness unavailable for {}: {}", bbox, e);
            0.0
        }
    }
}

fn laplacian_variance(frame: &Mat, bbox: &BoundingBox) -> Result<Option<f64>> {
    if frame.empty() {
        return Ok(None);
    }
    let clipped = bbox.clamp_to(frame.cols(), frame.rows());
    if clipped.width() <= 0 || clipped.height() <= 0 {
        return Ok(None);
    }

    let roi = Rect::new(clipped.x1, clipped.y1, clipped.width(), clipped.height());
    let view = Mat::roi(frame, roi)?;
    let mut crop = Mat::default();
    view.copy_to(&mut crop)?;

    let gray = match crop.channels() {
        1 => crop,
        channels => {
            let code = if channels == 4 {
                imgproc::COLOR_BGRA2GRAY
            } else {
                imgproc::COLOR_BGR2GRAY
            };
            let mut gray = Mat::default();
            imgproc::cvt_color_def(&crop, &mut gray, code)?;
            gray
        }
    };

    let mut laplacian = Mat::default();
    imgproc::laplacian_def(&gray, &mut laplacian, core::CV_64F)?;

    let mut mean = Mat::default();
    let mut stddev = Mat::default();
    core::mean_std_dev_def(&laplacian, &mut mean, &mut stddev)?;
    let sd = *stddev.at::<f64>(0)?;

    Ok(Some(sd * sd))
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::Scalar;

    fn blank(rows: i32, cols: i32) -> Mat {
        Mat::new_rows_cols_with_default(rows, cols, core::CV_8UC3, Scalar::all(0.0)).unwrap()
    }

    fn checkerboard(rows: i32, cols: i32) -> Mat {
        let mut m =
            Mat::new_rows_cols_with_default(rows, cols, core::CV_8UC1, Scalar::all(0.0)).unwrap();
        for r in 0..rows {
            for c in 0..cols {
                if (r / 2 + c / 2) % 2 == 0 {
                    *m.at_2d_mut::<u8>(r, c).unwrap() = 255;
                }
            }
        }
        m
    }

    fn frontal_landmarks() -> Landmarks {
        Landmarks::from_points(&[(40.0, 40.0), (60.0, 40.0), (50.0, 55.0), (42.0, 70.0), (58.0, 70.0)])
            .unwrap()
    }

    #[test]
    fn test_default_weights_are_valid() {
        let w = QualityWeights::default();
        assert!(w.validate().is_ok());
        assert_eq!(w.total(), 15.0);
    }

    #[test]
    fn test_invalid_weights_rejected() {
        let negative = QualityWeights {
            size: -1.0,
            ..Default::default()
        };
        assert!(QualityScorer::new(negative).is_err());

        let zero = QualityWeights {
            confidence: 0.0,
            size: 0.0,
            frontality: 0.0,
            aspect: 0.0,
            sharpness: 0.0,
        };
        assert!(QualityScorer::new(zero).is_err());
    }

    #[test]
    fn test_size_score_saturates_at_thirty_percent() {
        // 100x100 frame, 30% = 3000 px
        let small = BoundingBox::new(0, 0, 30, 50);
        assert!((size_score(&small, 100, 100) - 0.5).abs() < 1e-6);
        let big = BoundingBox::new(0, 0, 90, 90);
        assert_eq!(size_score(&big, 100, 100), 1.0);
        assert_eq!(size_score(&big, 0, 0), 0.0);
    }

    #[test]
    fn test_aspect_score_prefers_ideal_ratio() {
        assert!((aspect_score(&BoundingBox::new(0, 0, 100, 130)) - 1.0).abs() < 1e-6);
        assert!((aspect_score(&BoundingBox::new(0, 0, 100, 100)) - 0.7).abs() < 1e-5);
        assert_eq!(aspect_score(&BoundingBox::new(0, 0, 10, 100)), 0.0);
    }

    #[test]
    fn test_frontality_unknown_without_landmarks() {
        assert_eq!(frontality_score(None), FRONTALITY_UNKNOWN);
    }

    #[test]
    fn test_frontality_symmetric_face_scores_high() {
        let lm = frontal_landmarks();
        assert!((frontality_score(Some(&lm)) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_frontality_turned_face_scores_lower() {
        // Nose shifted towards the right eye and right mouth corner
        let lm = Landmarks::from_points(&[(40.0, 40.0), (60.0, 40.0), (58.0, 55.0), (42.0, 70.0), (58.0, 70.0)])
            .unwrap();
        let turned = frontality_score(Some(&lm));
        assert!(turned < 0.9);
        assert!(turned >= 0.0);
    }

    #[test]
    fn test_frontality_collapsed_landmarks_are_unknown() {
        let lm = Landmarks::from_points(&[(5.0, 5.0); 5]).unwrap();
        assert_eq!(frontality_score(Some(&lm)), FRONTALITY_UNKNOWN);
    }

    #[test]
    fn test_sharpness_flat_and_textured() {
        let bbox = BoundingBox::new(0, 0, 40, 40);
        assert_eq!(sharpness_score(&blank(64, 64), &bbox), 0.0);
        assert_eq!(sharpness_score(&checkerboard(64, 64), &bbox), 1.0);
    }

    #[test]
    fn test_sharpness_empty_crop_is_zero() {
        let frame = blank(64, 64);
        let outside = BoundingBox::new(100, 100, 120, 120);
        assert_eq!(sharpness_score(&frame, &outside), 0.0);
        assert_eq!(sharpness_score(&Mat::default(), &BoundingBox::new(0, 0, 10, 10)), 0.0);
    }

    #[test]
    fn test_score_stays_in_unit_interval() {
        let scorer = QualityScorer::new(QualityWeights::default()).unwrap();
        let frame = checkerboard(120, 160);
        let lm = frontal_landmarks();
        let boxes = [
            BoundingBox::new(10, 10, 10, 10),
            BoundingBox::new(50, 50, 40, 40),
            BoundingBox::new(0, 0, 160, 120),
            BoundingBox::new(-50, -50, 500, 500),
            BoundingBox::new(20, 20, 21, 80),
        ];
        for bbox in &boxes {
            for conf in [0.0, 0.37, 1.0] {
                for landmarks in [None, Some(&lm)] {
                    let s = scorer.score(bbox, conf, &frame, landmarks);
                    assert!((0.0..=1.0).contains(&s), "score {} for {}", s, bbox);
                }
            }
        }
    }

    #[test]
    fn test_combine_is_weighted_average() {
        let scorer = QualityScorer::new(QualityWeights::default()).unwrap();
        let subs = SubScores {
            confidence: 1.0,
            size: 0.5,
            frontality: 0.0,
            aspect: 1.0,
            sharpness: 0.0,
        };
        // (3 + 2 + 0 + 1 + 0) / 15
        assert!((scorer.combine(&subs) - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_missing_landmarks_do_not_inflate_score() {
        let scorer = QualityScorer::new(QualityWeights::default()).unwrap();
        let frame = blank(100, 100);
        let bbox = BoundingBox::new(20, 10, 60, 62);
        let without = scorer.score(&bbox, 0.9, &frame, None);
        let with = scorer.score(&bbox, 0.9, &frame, Some(&frontal_landmarks()));
        assert!(with > without);
    }
}

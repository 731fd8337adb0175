use crate::pipeline::movement::{self, MovementConfig, MovementStats};
use crate::pipeline::types::{Observation, TrackId};
use std::fmt;

/// Observation history of one tracker identity during one continuous presence.
pub struct Track {
    track_id: TrackId,
    /// Table-scoped creation number, distinguishes re-created tracks for a reused identity.
    serial: u64,
    observations: Vec<Observation>,
}

impl Track {
    pub fn new(track_id: TrackId, serial: u64) -> Self {
        Self {
            track_id,
            serial,
            observations: Vec::new(),
        }
    }

    pub fn track_id(&self) -> TrackId {
        self.track_id
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn push(&mut self, observation: Observation) {
        self.observations.push(observation);
    }

    /// Observations in insertion (= temporal) order.
    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn first(&self) -> Option<&Observation> {
        self.observations.first()
    }

    pub fn last(&self) -> Option<&Observation> {
        self.observations.last()
    }

    /// Time between the first and the last sighting.
    pub fn duration(&self) -> chrono::Duration {
        match (self.first(), self.last()) {
            (Some(first), Some(last)) => last.captured_at() - first.captured_at(),
            _ => chrono::Duration::zero(),
        }
    }

    /// Highest quality observation. Ties keep the earliest one.
    pub fn best_observation(&self) -> Option<&Observation> {
        let mut best: Option<&Observation> = None;
        for obs in &self.observations {
            match best {
                Some(b) if obs.quality() <= b.quality() => {}
                _ => best = Some(obs),
            }
        }
        best
    }

    pub fn average_confidence(&self) -> f32 {
        if self.is_empty() {
            return 0.0;
        }
        self.observations.iter().map(|o| o.confidence()).sum::<f32>() / self.len() as f32
    }

    pub fn average_quality(&self) -> f32 {
        if self.is_empty() {
            return 0.0;
        }
        self.observations.iter().map(|o| o.quality()).sum::<f32>() / self.len() as f32
    }

    pub fn has_movement(&self, config: &MovementConfig) -> bool {
        movement::has_movement(&self.observations, config)
    }

    pub fn movement_statistics(&self) -> MovementStats {
        movement::statistics(&self.observations)
    }
}

impl fmt::Debug for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Track")
            .field("track_id", &self.track_id)
            .field("serial", &self.serial)
            .field("observations", &self.observations.len())
            .finish()
    }
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Track {}: {} observations, avg quality {:.4}",
            self.track_id,
            self.len(),
            self.average_quality()
        )
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pipeline::types::{BoundingBox, Detection};
    use chrono::{Duration, TimeZone, Utc};
    use opencv::core::Mat;
    use std::sync::Arc;

    pub(crate) fn observation(bbox: BoundingBox, confidence: f32, quality: f32, seq: i64) -> Observation {
        let detection = Detection::new(1, bbox, confidence, None).unwrap();
        let at = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap() + Duration::milliseconds(seq);
        Observation::new(Arc::new(Mat::default()), &detection, quality, at)
    }

    fn track_with_qualities(qualities: &[f32]) -> Track {
        let mut track = Track::new(7, 0);
        for (i, q) in qualities.iter().enumerate() {
            track.push(observation(BoundingBox::new(0, 0, 10, 13), 0.5, *q, i as i64));
        }
        track
    }

    #[test]
    fn test_best_observation_picks_maximum() {
        let track = track_with_qualities(&[0.2, 0.9, 0.4]);
        assert_eq!(track.best_observation().unwrap().quality(), 0.9);
    }

    #[test]
    fn test_best_observation_tie_keeps_earliest() {
        let track = track_with_qualities(&[0.3, 0.8, 0.1, 0.8]);
        let best = track.best_observation().unwrap();
        assert_eq!(best.quality(), 0.8);
        assert_eq!(best.captured_at(), track.observations()[1].captured_at());
    }

    #[test]
    fn test_empty_track_has_no_best() {
        let track = Track::new(1, 0);
        assert!(track.best_observation().is_none());
        assert_eq!(track.average_quality(), 0.0);
        assert_eq!(track.duration(), Duration::zero());
        assert!(!track.has_movement(&MovementConfig::default()));
    }

    #[test]
    fn test_averages() {
        let mut track = Track::new(2, 0);
        track.push(observation(BoundingBox::new(0, 0, 10, 10), 0.4, 0.2, 0));
        track.push(observation(BoundingBox::new(0, 0, 10, 10), 0.8, 0.6, 1));
        assert!((track.average_confidence() - 0.6).abs() < 1e-6);
        assert!((track.average_quality() - 0.4).abs() < 1e-6);
        assert_eq!(track.first().unwrap().confidence(), 0.4);
        assert_eq!(track.last().unwrap().confidence(), 0.8);
        assert_eq!(track.duration(), Duration::milliseconds(1));
    }

    #[test]
    fn test_track_movement_uses_box_centers() {
        let mut track = Track::new(3, 0);
        for i in 0..10 {
            let x = i * 80;
            track.push(observation(BoundingBox::new(x, 0, x + 40, 52), 0.9, 0.5, i as i64));
        }
        assert!(track.has_movement(&MovementConfig::default()));
        assert_eq!(track.movement_statistics().min_distance, 80.0);
    }
}

use crate::pipeline::types::Observation;
use serde::{Deserialize, Serialize};

/// Thresholds deciding whether a track moved materially.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct MovementConfig {
    /// Minimum center displacement, in pixels, between consecutive observations.
    pub min_pixels: f64,
    /// Fraction of consecutive pairs that must reach `min_pixels`.
    pub min_frame_fraction: f64,
}

impl Default for MovementConfig {
    fn default() -> Self {
        Self {
            min_pixels: 50.0,
            min_frame_fraction: 0.3,
        }
    }
}

/// Displacement between consecutive observation centers.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct MovementStats {
    pub total_distance: f64,
    pub average_distance: f64,
    pub max_distance: f64,
    pub min_distance: f64,
}

pub fn centers(observations: &[Observation]) -> Vec<(f64, f64)> {
    observations.iter().map(|o| o.bbox().center()).collect()
}

fn step_distances(centers: &[(f64, f64)]) -> Vec<f64> {
    centers
        .windows(2)
        .map(|w| ((w[1].0 - w[0].0).powi(2) + (w[1].1 - w[0].1).powi(2)).sqrt())
        .collect()
}

/// A single sighting counts as movement; an empty sequence does not.
pub fn has_movement_in(centers: &[(f64, f64)], config: &MovementConfig) -> bool {
    match centers.len() {
        0 => false,
        1 => true,
        _ => {
            let distances = step_distances(centers);
            let moving = distances
                .iter()
                .filter(|d| **d >= config.min_pixels)
                .count();
            moving as f64 / distances.len() as f64 >= config.min_frame_fraction
        }
    }
}

pub fn statistics_of(centers: &[(f64, f64)]) -> MovementStats {
    let distances = step_distances(centers);
    if distances.is_empty() {
        return MovementStats::default();
    }
    let total: f64 = distances.iter().sum();
    MovementStats {
        total_distance: total,
        average_distance: total / distances.len() as f64,
        max_distance: distances.iter().cloned().fold(f64::MIN, f64::max),
        min_distance: distances.iter().cloned().fold(f64::MAX, f64::min),
    }
}

pub fn has_movement(observations: &[Observation], config: &MovementConfig) -> bool {
    has_movement_in(&centers(observations), config)
}

pub fn statistics(observations: &[Observation]) -> MovementStats {
    statistics_of(&centers(observations))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(step: f64, count: usize) -> Vec<(f64, f64)> {
        (0..count).map(|i| (100.0 + step * i as f64, 100.0)).collect()
    }

    #[test]
    fn test_single_sighting_counts_as_movement() {
        let strict = MovementConfig {
            min_pixels: 10_000.0,
            min_frame_fraction: 1.0,
        };
        assert!(has_movement_in(&[(5.0, 5.0)], &strict));
        assert!(has_movement_in(&[(5.0, 5.0)], &MovementConfig::default()));
    }

    #[test]
    fn test_empty_track_has_not_moved() {
        assert!(!has_movement_in(&[], &MovementConfig::default()));
        assert_eq!(statistics_of(&[]), MovementStats::default());
    }

    #[test]
    fn test_static_track() {
        assert!(!has_movement_in(&line(1.0, 10), &MovementConfig::default()));
    }

    #[test]
    fn test_moving_track() {
        assert!(has_movement_in(&line(80.0, 10), &MovementConfig::default()));
    }

    #[test]
    fn test_fraction_threshold_is_inclusive() {
        // 3 of 10 steps move 60px, the rest stay put
        let mut centers = vec![(0.0, 0.0)];
        for i in 0..10 {
            let (x, y) = centers[i];
            let dx = if i < 3 { 60.0 } else { 0.0 };
            centers.push((x + dx, y));
        }
        assert!(has_movement_in(&centers, &MovementConfig::default()));

        let stricter = MovementConfig {
            min_frame_fraction: 0.31,
            ..Default::default()
        };
        assert!(!has_movement_in(&centers, &stricter));
    }

    #[test]
    fn test_statistics() {
        let stats = statistics_of(&[(0.0, 0.0), (3.0, 4.0), (3.0, 14.0), (3.0, 14.0)]);
        assert_eq!(stats.total_distance, 15.0);
        assert_eq!(stats.average_distance, 5.0);
        assert_eq!(stats.max_distance, 10.0);
        assert_eq!(stats.min_distance, 0.0);
    }
}

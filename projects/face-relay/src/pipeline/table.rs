// Track table: live tracks of one camera keyed by tracker identity, with the
// miss counters that drive eviction.
//
// Every operation runs under a single mutex so that the observes of one frame
// and the absentee tick that follows can never interleave with each other, with
// a drain at shutdown or with an inspection from the status API.

use crate::pipeline::track::Track;
use crate::pipeline::types::{Observation, TrackId};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

/// Track and miss counter travel together, so both "maps" always share one key set.
struct LiveTrack {
    track: Track,
    misses: u32,
}

#[derive(Default)]
struct TableState {
    live: HashMap<TrackId, LiveTrack>,
    next_serial: u64,
}

impl TableState {
    fn observe(&mut self, track_id: TrackId, observation: Observation) -> u64 {
        let next_serial = &mut self.next_serial;
        let entry = self.live.entry(track_id).or_insert_with(|| {
            let serial = *next_serial;
            *next_serial += 1;
            LiveTrack {
                track: Track::new(track_id, serial),
                misses: 0,
            }
        });
        entry.track.push(observation);
        entry.misses = 0;
        entry.track.serial()
    }

    fn tick_absentees(&mut self, present: &HashSet<TrackId>, max_misses: u32) -> Vec<Track> {
        let mut expired: Vec<TrackId> = Vec::new();
        for (track_id, entry) in self.live.iter_mut() {
            if present.contains(track_id) {
                continue;
            }
            entry.misses += 1;
            if entry.misses >= max_misses {
                expired.push(*track_id);
            }
        }
        expired.sort_unstable();
        expired
            .into_iter()
            .filter_map(|id| self.live.remove(&id))
            .map(|entry| entry.track)
            .collect()
    }
}

/// Point-in-time view of one live track.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct TrackSummary {
    pub track_id: TrackId,
    pub serial: u64,
    pub observations: usize,
    pub misses: u32,
    pub best_quality: f32,
}

pub struct TrackTable {
    max_misses: u32,
    state: Mutex<TableState>,
}

impl TrackTable {
    /// `max_misses` is the number of consecutive frames without a sighting after
    /// which a track is evicted; values below 1 are raised to 1.
    pub fn new(max_misses: u32) -> Self {
        Self {
            max_misses: max_misses.max(1),
            state: Mutex::new(TableState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn max_misses(&self) -> u32 {
        self.max_misses
    }

    /// Appends to the identity's track, creating it on first sighting, and resets its
    /// miss counter. Returns the serial of the track appended to.
    pub fn observe(&self, track_id: TrackId, observation: Observation) -> u64 {
        self.lock().observe(track_id, observation)
    }

    /// Counts a miss for every identity not in `present` and returns the tracks whose
    /// counter reached the threshold, already removed from the table.
    pub fn tick_absentees(&self, present: &HashSet<TrackId>) -> Vec<Track> {
        self.lock().tick_absentees(present, self.max_misses)
    }

    /// Applies one frame: every observation, then the absentee tick for the identities
    /// seen in it, all under one lock acquisition.
    pub fn apply_batch(&self, observations: Vec<(TrackId, Observation)>) -> Vec<Track> {
        let present: HashSet<TrackId> = observations.iter().map(|(id, _)| *id).collect();
        let mut state = self.lock();
        for (track_id, observation) in observations {
            state.observe(track_id, observation);
        }
        state.tick_absentees(&present, self.max_misses)
    }

    /// Removes and returns every live track, ordered by identity.
    pub fn drain_all(&self) -> Vec<Track> {
        let mut state = self.lock();
        let mut drained: Vec<(TrackId, Track)> = state
            .live
            .drain()
            .map(|(id, entry)| (id, entry.track))
            .collect();
        drained.sort_unstable_by_key(|(id, _)| *id);
        drained.into_iter().map(|(_, track)| track).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().live.is_empty()
    }

    pub fn contains(&self, track_id: TrackId) -> bool {
        self.lock().live.contains_key(&track_id)
    }

    pub fn misses(&self, track_id: TrackId) -> Option<u32> {
        self.lock().live.get(&track_id).map(|entry| entry.misses)
    }

    pub fn snapshot(&self) -> Vec<TrackSummary> {
        let state = self.lock();
        let mut summaries: Vec<TrackSummary> = state
            .live
            .iter()
            .map(|(id, entry)| TrackSummary {
                track_id: *id,
                serial: entry.track.serial(),
                observations: entry.track.len(),
                misses: entry.misses,
                best_quality: entry
                    .track
                    .best_observation()
                    .map(|o| o.quality())
                    .unwrap_or(0.0),
            })
            .collect();
        summaries.sort_unstable_by_key(|s| s.track_id);
        summaries
    }
}

// Face track lifecycle: score sightings, group them per identity, evict lost
// tracks and finalize them into local artifacts and remote events.

pub mod detection;
pub mod finalize;
pub mod findface;
pub mod movement;
pub mod orchestrator;
pub mod quality;
pub mod sink;
pub mod supervisor;
pub mod table;
pub mod track;
pub mod types;

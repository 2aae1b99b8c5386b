pub mod engine;
pub mod marker;

pub use engine::{SyncSample, TimeSyncEngine, answer_ping};
pub use marker::{MarkerEvent, MarkerType};

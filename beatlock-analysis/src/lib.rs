//! Analysis helpers for beatlock
//!
//! Beat-grid math used by decks to turn playback positions into beat
//! positions, and drift monitoring of a running phase lock.

mod beatgrid;
mod drift;

pub use beatgrid::{BeatGrid, GridError};
pub use drift::{DriftMonitor, DriftSnapshot, DriftStats};

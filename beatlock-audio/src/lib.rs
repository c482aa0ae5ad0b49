//! Audio engine for beatlock - clock, sync loop and time stretching
//!
//! This module provides the core tempo/phase lock pipeline:
//! - Clock: Shared master timeline read lock-free by every deck
//! - Sync: PID loop steering a target deck's tempo onto a master's beat phase
//! - Timestretcher: Deterministic re-timing of audio at the corrected rate
//! - Deck: Beat-gridded playback wired to the three above
//! - Engine: Audio/control thread plumbing

mod clock;
mod config;
mod deck;
mod engine;
pub mod sync;
pub mod timestretcher;

pub use clock::{ClockDriver, ClockSnapshot, MasterClock};
pub use config::{Config, ConfigError};
pub use deck::{Deck, DeckProbe, DeckState, PlaybackState, ProbeReading};
pub use engine::{
    AudioEngine, ControlLoop, DeckHandle, EngineCommand, EngineEvent, EngineState, SourceFeed,
};
pub use sync::{
    DeckId, SyncConfig, SyncError, SyncMode, SyncState, SyncStatus, TempoPhaseSync,
};
pub use timestretcher::{
    Pull, QualityMode, StretchConfig, StretchError, StretchStatus, TimeStretchEngine,
};

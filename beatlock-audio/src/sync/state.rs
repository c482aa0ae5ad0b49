//! Published sync state and the small types around it

use std::fmt;

/// Identity of a deck taking part in sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeckId(pub u8);

impl fmt::Display for DeckId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Decks are lettered A, B, C... in the UI
        let letter = (b'A' + self.0 % 26) as char;
        write!(f, "{letter}")
    }
}

/// Lock state of a sync pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    #[default]
    Disabled,
    Locking,
    Locked,
    Unstable,
}

/// How a phase error is turned into a correction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CorrectionStrategy {
    /// Continuous rate modulation through the time stretcher
    #[default]
    RateModulation,
    /// Position nudging toward the master phase. Not supported.
    LegacyNudge,
}

/// Coarse buckets of `sync_quality` for display
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QualityGrade {
    Poor,
    Fair,
    Good,
    Excellent,
}

impl QualityGrade {
    pub fn from_quality(quality: f64) -> Self {
        if quality >= 0.9 {
            QualityGrade::Excellent
        } else if quality >= 0.75 {
            QualityGrade::Good
        } else if quality >= 0.5 {
            QualityGrade::Fair
        } else {
            QualityGrade::Poor
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            QualityGrade::Poor => "poor",
            QualityGrade::Fair => "fair",
            QualityGrade::Good => "good",
            QualityGrade::Excellent => "excellent",
        }
    }
}

/// Snapshot published after every control step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncState {
    pub mode: SyncMode,
    /// Master phase minus target phase, wrapped to (-0.5, 0.5]
    pub phase_offset_beats: f64,
    /// Rate trim applied on top of tempo matching
    pub tempo_correction_factor: f64,
    /// 0.0 (bad) to 1.0 (solid lock)
    pub sync_quality: f64,
    pub integral_term: f64,
    pub filtered_derivative: f64,
    /// Clock time of the last effective update
    pub last_update_time: f64,
    /// master_bpm / target_bpm from the last effective update
    pub tempo_ratio: f64,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            mode: SyncMode::Disabled,
            phase_offset_beats: 0.0,
            tempo_correction_factor: 1.0,
            sync_quality: 0.0,
            integral_term: 0.0,
            filtered_derivative: 0.0,
            last_update_time: 0.0,
            tempo_ratio: 1.0,
        }
    }
}

impl SyncState {
    pub fn grade(&self) -> QualityGrade {
        QualityGrade::from_quality(self.sync_quality)
    }

    /// Rate the target deck should play at relative to its own tempo
    pub fn playback_rate(&self) -> f64 {
        self.tempo_ratio * self.tempo_correction_factor
    }

    /// The display subset of this state
    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            mode: self.mode,
            phase_offset_beats: self.phase_offset_beats,
            tempo_correction_factor: self.tempo_correction_factor,
            sync_quality: self.sync_quality,
        }
    }
}

/// What the deck exposes to the UI
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncStatus {
    pub mode: SyncMode,
    pub phase_offset_beats: f64,
    pub tempo_correction_factor: f64,
    pub sync_quality: f64,
}

impl Default for SyncStatus {
    fn default() -> Self {
        SyncState::default().status()
    }
}

/// Controller internals for debugging and tuning
#[derive(Debug, Clone, PartialEq)]
pub struct SyncDiagnostics {
    pub mode: SyncMode,
    pub target: Option<DeckId>,
    pub master: Option<DeckId>,
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub correction_limit: f64,
    pub integral_term: f64,
    pub filtered_derivative: f64,
    pub saturation_seconds: f64,
    pub error_history_len: usize,
    pub update_count: u64,
}

/// Wrap a beat difference into (-0.5, 0.5]
#[inline]
pub fn wrap_phase(x: f64) -> f64 {
    x - (x - 0.5).ceil()
}

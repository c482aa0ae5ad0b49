//! Beat grid math for phase-aligned beatmatching
//!
//! A grid is the (BPM, first beat) pair supplied by an external analyzer.
//! Positions are in frames of the source track, independent of channel count.

use thiserror::Error;

/// Errors building a beat grid
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GridError {
    #[error("BPM must be finite and positive, got {0}")]
    InvalidBpm(f64),
    #[error("sample rate must be non-zero")]
    InvalidSampleRate,
}

/// Represents a beat grid for a track
#[derive(Debug, Clone, PartialEq)]
pub struct BeatGrid {
    /// BPM of the track at its native speed
    pub bpm: f64,
    /// Frame index of the first beat
    pub first_beat_frame: u64,
    /// Sample rate used for calculations
    pub sample_rate: u32,
    /// Detector confidence (0.0 - 1.0), carried through for display
    pub confidence: f32,
    /// Frames per beat at tempo 1.0 (cached)
    frames_per_beat: f64,
}

impl BeatGrid {
    /// Create a new beat grid
    pub fn new(
        bpm: f64,
        first_beat_frame: u64,
        sample_rate: u32,
        confidence: f32,
    ) -> Result<Self, GridError> {
        if !bpm.is_finite() || bpm <= 0.0 {
            return Err(GridError::InvalidBpm(bpm));
        }
        if sample_rate == 0 {
            return Err(GridError::InvalidSampleRate);
        }

        Ok(Self {
            bpm,
            first_beat_frame,
            sample_rate,
            confidence: confidence.clamp(0.0, 1.0),
            frames_per_beat: 60.0 / bpm * sample_rate as f64,
        })
    }

    /// Beat number (fractional, negative before the first beat) at a frame position
    pub fn beat_at_position(&self, frame: f64) -> f64 {
        (frame - self.first_beat_frame as f64) / self.frames_per_beat
    }

    /// Phase within the current beat, in [0, 1)
    pub fn phase_at_position(&self, frame: f64) -> f64 {
        self.beat_at_position(frame).rem_euclid(1.0)
    }

    /// Frame position of a given beat number
    pub fn position_for_beat(&self, beat: f64) -> f64 {
        self.first_beat_frame as f64 + beat * self.frames_per_beat
    }

    /// Frames per beat at tempo 1.0
    pub fn frames_per_beat(&self) -> f64 {
        self.frames_per_beat
    }

    /// Frames of source consumed per beat when played at `tempo`
    pub fn frames_per_beat_at_tempo(&self, tempo: f64) -> f64 {
        self.frames_per_beat / tempo
    }

    /// Effective BPM when the track plays at `rate`
    pub fn bpm_at_rate(&self, rate: f64) -> f64 {
        self.bpm * rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_bad_bpm() {
        assert_eq!(
            BeatGrid::new(0.0, 0, 48000, 1.0),
            Err(GridError::InvalidBpm(0.0))
        );
        assert!(BeatGrid::new(f64::NAN, 0, 48000, 1.0).is_err());
        assert_eq!(
            BeatGrid::new(120.0, 0, 0, 1.0),
            Err(GridError::InvalidSampleRate)
        );
    }

    #[test]
    fn test_beat_positions() {
        // 120 BPM at 48kHz = 24000 frames per beat
        let grid = BeatGrid::new(120.0, 1000, 48000, 0.9).unwrap();
        assert!((grid.frames_per_beat() - 24000.0).abs() < 1e-9);
        assert!((grid.beat_at_position(1000.0)).abs() < 1e-12);
        assert!((grid.beat_at_position(25000.0) - 1.0).abs() < 1e-12);
        assert!((grid.position_for_beat(2.5) - 61000.0).abs() < 1e-9);
    }

    #[test]
    fn test_phase_before_first_beat_wraps_forward() {
        let grid = BeatGrid::new(120.0, 24000, 48000, 1.0).unwrap();
        // A quarter beat before the first beat is phase 0.75, not 0.25
        let phase = grid.phase_at_position(18000.0);
        assert!((phase - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_tempo_scaling() {
        let grid = BeatGrid::new(127.0, 0, 44100, 1.0).unwrap();
        let ratio = 128.0 / 127.0;
        assert!((grid.bpm_at_rate(ratio) - 128.0).abs() < 1e-9);
        assert!(grid.frames_per_beat_at_tempo(2.0) < grid.frames_per_beat());
    }
}

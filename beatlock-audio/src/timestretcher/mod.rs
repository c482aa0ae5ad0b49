//! Deterministic time-stretching for sync correction
//!
//! `TimeStretchEngine` buffers interleaved stereo input and produces output
//! at a playback rate that the sync loop keeps adjusting. The rate is latched
//! once per processing block, so a correction never lands in the middle of a
//! block, and the output is a pure function of the push/set_rate/pull
//! sequence.
//!
//! Two strategies sit behind `StretchStrategy`:
//! - **HighQuality**: phase vocoder (needs the `high-quality` feature)
//! - **Fallback**: linear resampling, frame exact and latency free
//!
//! ```rust,ignore
//! use beatlock_audio::{Pull, QualityMode, TimeStretchEngine};
//!
//! let mut engine = TimeStretchEngine::new(QualityMode::HighQuality, 256)?;
//! engine.push_input(&source)?;
//! engine.set_rate(1.004)?;
//! match engine.pull_output(&mut block) {
//!     Pull::Complete(_) => {}
//!     Pull::Underrun { delivered, .. } => feed_more(delivered),
//! }
//! ```

#[cfg(feature = "high-quality")]
mod phase;
mod resample;

#[cfg(feature = "high-quality")]
pub use phase::PhaseVocoder;
pub use resample::LinearResampler;

use std::collections::VecDeque;
use thiserror::Error;

/// Largest accepted block size
pub const MAX_BLOCK_SIZE: usize = 8192;
/// Block sizes the phase vocoder accepts (powers of two only)
pub const HQ_BLOCK_RANGE: std::ops::RangeInclusive<usize> = 64..=4096;
/// Playback rate clamp
pub const MIN_RATE: f64 = 0.5;
pub const MAX_RATE: f64 = 2.0;

/// Errors from the stretch engine
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StretchError {
    #[error("invalid stretch configuration: {0}")]
    InvalidConfiguration(String),
}

/// Requested stretch algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QualityMode {
    #[default]
    HighQuality,
    Fallback,
}

impl QualityMode {
    pub fn name(&self) -> &'static str {
        match self {
            QualityMode::HighQuality => "high_quality",
            QualityMode::Fallback => "fallback",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "high_quality" | "hq" => Some(QualityMode::HighQuality),
            "fallback" | "linear" => Some(QualityMode::Fallback),
            _ => None,
        }
    }
}

/// Result of a pull
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pull {
    /// Every requested frame was written
    Complete(usize),
    /// Only `delivered` of `requested` frames were available; nothing was padded
    Underrun { delivered: usize, requested: usize },
}

impl Pull {
    /// Frames written
    pub fn frames(&self) -> usize {
        match *self {
            Pull::Complete(n) => n,
            Pull::Underrun { delivered, .. } => delivered,
        }
    }

    pub fn is_underrun(&self) -> bool {
        matches!(self, Pull::Underrun { .. })
    }
}

/// Engine status for display and diagnostics
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StretchStatus {
    pub requested_mode: QualityMode,
    pub active_mode: QualityMode,
    /// HighQuality was requested but Fallback is running
    pub degraded: bool,
    pub block_size: usize,
    /// Rate of the most recently delivered frame
    pub active_rate: f64,
    pub buffered_input: usize,
    pub buffered_output: usize,
    pub latency_frames: usize,
}

/// Stretch settings
#[derive(Debug, Clone, PartialEq)]
pub struct StretchConfig {
    pub quality_mode: QualityMode,
    pub block_size: usize,
}

impl Default for StretchConfig {
    fn default() -> Self {
        Self {
            quality_mode: QualityMode::HighQuality,
            block_size: 256,
        }
    }
}

impl StretchConfig {
    pub fn validate(&self) -> Result<(), StretchError> {
        check_block_size(self.block_size)
    }
}

fn check_block_size(block_size: usize) -> Result<(), StretchError> {
    if block_size == 0 || block_size > MAX_BLOCK_SIZE {
        return Err(StretchError::InvalidConfiguration(format!(
            "block size must be in 1..={MAX_BLOCK_SIZE}, got {block_size}"
        )));
    }
    Ok(())
}

/// One output frame and the rate it was produced at
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TaggedFrame {
    pub left: f32,
    pub right: f32,
    pub rate: f64,
}

/// Pending input frames plus a count of frames already consumed
#[derive(Debug, Default)]
pub struct StretchInput {
    frames: VecDeque<(f32, f32)>,
    consumed: u64,
}

impl StretchInput {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Frame `index` from the front; caller checks `len()` first
    #[inline]
    pub fn frame(&self, index: usize) -> (f32, f32) {
        self.frames[index]
    }

    /// Drop `n` frames from the front
    pub fn discard(&mut self, n: usize) {
        let n = n.min(self.frames.len());
        self.frames.drain(..n);
        self.consumed += n as u64;
    }

    /// Total frames discarded so far
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    fn push_interleaved(&mut self, samples: &[f32]) {
        self.frames
            .extend(samples.chunks_exact(2).map(|c| (c[0], c[1])));
    }

    fn clear(&mut self) {
        self.frames.clear();
        self.consumed = 0;
    }
}

/// A stretch algorithm
pub trait StretchStrategy: Send {
    /// Append output frames at `rate` to `out`, reading and discarding from
    /// `input`. Returns the number of frames produced; 0 means more input is
    /// needed. Produces at most `max_frames` unless the algorithm works in
    /// fixed hops, in which case it produces one hop.
    fn produce(
        &mut self,
        input: &mut StretchInput,
        rate: f64,
        max_frames: usize,
        out: &mut VecDeque<TaggedFrame>,
    ) -> usize;

    fn reset(&mut self);

    fn latency_frames(&self) -> usize;

    fn mode(&self) -> QualityMode;
}

/// Build the strategy for `mode`, or the reason HighQuality is unavailable
fn build_strategy(
    mode: QualityMode,
    block_size: usize,
) -> Result<Box<dyn StretchStrategy>, &'static str> {
    match mode {
        QualityMode::Fallback => Ok(Box::new(LinearResampler::new())),
        QualityMode::HighQuality => build_high_quality(block_size),
    }
}

#[cfg(feature = "high-quality")]
fn build_high_quality(block_size: usize) -> Result<Box<dyn StretchStrategy>, &'static str> {
    if !block_size.is_power_of_two() || !HQ_BLOCK_RANGE.contains(&block_size) {
        return Err("block size must be a power of two in 64..=4096");
    }
    Ok(Box::new(PhaseVocoder::new(block_size)))
}

#[cfg(not(feature = "high-quality"))]
fn build_high_quality(_block_size: usize) -> Result<Box<dyn StretchStrategy>, &'static str> {
    Err("built without the high-quality feature")
}

/// Buffered, block-latched time stretcher for one deck
pub struct TimeStretchEngine {
    strategy: Box<dyn StretchStrategy>,
    requested_mode: QualityMode,
    block_size: usize,
    input: StretchInput,
    output: VecDeque<TaggedFrame>,
    /// Rate from the last `set_rate`, latched at the next block boundary
    pending_rate: f64,
    block_rate: f64,
    /// Output frames left in the current block
    block_remaining: usize,
    active_rate: f64,
}

impl TimeStretchEngine {
    pub fn new(mode: QualityMode, block_size: usize) -> Result<Self, StretchError> {
        check_block_size(block_size)?;
        let mut engine = Self {
            strategy: Box::new(LinearResampler::new()),
            requested_mode: mode,
            block_size,
            input: StretchInput::default(),
            output: VecDeque::with_capacity(block_size * 2),
            pending_rate: 1.0,
            block_rate: 1.0,
            block_remaining: 0,
            active_rate: 1.0,
        };
        engine.configure(mode, block_size)?;
        Ok(engine)
    }

    pub fn from_config(config: &StretchConfig) -> Result<Self, StretchError> {
        Self::new(config.quality_mode, config.block_size)
    }

    /// Select the strategy and block size. Clears all buffers. HighQuality
    /// falls back to linear resampling if it cannot run; the returned status
    /// reports that as `degraded`.
    pub fn configure(
        &mut self,
        mode: QualityMode,
        block_size: usize,
    ) -> Result<StretchStatus, StretchError> {
        check_block_size(block_size)?;

        self.strategy = match build_strategy(mode, block_size) {
            Ok(strategy) => strategy,
            Err(reason) => {
                tracing::warn!(
                    block_size,
                    reason,
                    "high quality stretch unavailable, using fallback"
                );
                Box::new(LinearResampler::new())
            }
        };
        self.requested_mode = mode;
        self.block_size = block_size;
        self.reset();

        let status = self.status();
        tracing::info!(
            mode = status.active_mode.name(),
            block_size,
            degraded = status.degraded,
            "time stretch configured"
        );
        Ok(status)
    }

    /// Queue interleaved stereo samples
    pub fn push_input(&mut self, samples: &[f32]) -> Result<(), StretchError> {
        if samples.len() % 2 != 0 {
            return Err(StretchError::InvalidConfiguration(format!(
                "input must be whole stereo frames, got {} samples",
                samples.len()
            )));
        }
        self.input.push_interleaved(samples);
        Ok(())
    }

    /// Set the playback rate for the next block
    pub fn set_rate(&mut self, rate: f64) -> Result<(), StretchError> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(StretchError::InvalidConfiguration(format!(
                "rate must be finite and positive, got {rate}"
            )));
        }
        self.pending_rate = rate.clamp(MIN_RATE, MAX_RATE);
        Ok(())
    }

    /// Rate that will be latched at the next block boundary
    pub fn rate(&self) -> f64 {
        self.pending_rate
    }

    /// Write up to `out.len() / 2` stereo frames
    pub fn pull_output(&mut self, out: &mut [f32]) -> Pull {
        let requested = out.len() / 2;
        let mut delivered = 0;

        while delivered < requested {
            if let Some(frame) = self.output.pop_front() {
                out[delivered * 2] = frame.left;
                out[delivered * 2 + 1] = frame.right;
                self.active_rate = frame.rate;
                delivered += 1;
                continue;
            }

            if self.block_remaining == 0 {
                self.block_rate = self.pending_rate;
                self.block_remaining = self.block_size;
            }

            let produced = self.strategy.produce(
                &mut self.input,
                self.block_rate,
                self.block_remaining,
                &mut self.output,
            );
            if produced == 0 {
                break;
            }
            self.block_remaining = self.block_remaining.saturating_sub(produced);
        }

        if delivered < requested {
            tracing::debug!(delivered, requested, "time stretch underrun");
            Pull::Underrun {
                delivered,
                requested,
            }
        } else {
            Pull::Complete(delivered)
        }
    }

    /// Drop all buffered audio and strategy state
    pub fn reset(&mut self) {
        self.input.clear();
        self.output.clear();
        self.strategy.reset();
        self.block_remaining = 0;
        self.block_rate = self.pending_rate;
        self.active_rate = self.pending_rate;
    }

    /// Total source frames consumed since the last reset
    pub fn input_frames_consumed(&self) -> u64 {
        self.input.consumed()
    }

    pub fn status(&self) -> StretchStatus {
        let active_mode = self.strategy.mode();
        StretchStatus {
            requested_mode: self.requested_mode,
            active_mode,
            degraded: self.requested_mode != active_mode,
            block_size: self.block_size,
            active_rate: self.active_rate,
            buffered_input: self.input.len(),
            buffered_output: self.output.len(),
            latency_frames: self.strategy.latency_frames(),
        }
    }
}

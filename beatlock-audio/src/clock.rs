//! Master clock - shared time base for all decks
//!
//! One `ClockDriver` advances time (normally from the audio callback); any
//! number of threads read consistent `ClockSnapshot`s through the shared
//! `MasterClock`. Publication is a sequence lock over atomics, so the writer
//! never waits and readers only retry while a write is in flight.

use std::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Immutable view of the clock at one instant
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockSnapshot {
    /// Monotonic time in seconds since the clock started
    pub time_seconds: f64,
    /// Beats accumulated since the clock started
    pub beat_position: f64,
    /// Tempo of the shared grid
    pub bpm: f64,
}

/// Read side of the clock, shared with `Arc`
#[derive(Debug)]
pub struct MasterClock {
    /// Even when stable, odd while a write is in progress
    seq: AtomicU64,
    time_bits: AtomicU64,
    beat_bits: AtomicU64,
    bpm_bits: AtomicU64,
    total_frames: AtomicU64,
    latency_bits: AtomicU64,
    running: AtomicBool,
    sample_rate: u32,
}

/// Unique writer for a `MasterClock`
///
/// Not `Clone`: holding the driver is what makes a thread the clock's owner.
#[derive(Debug)]
pub struct ClockDriver {
    clock: Arc<MasterClock>,
    // Writer-local copies so advancing never has to read back the atomics
    time_seconds: f64,
    beat_position: f64,
    bpm: f64,
    frames: u64,
}

impl MasterClock {
    /// Create a clock at `bpm` and `sample_rate`, returning the shared reader
    /// and its single driver. The clock starts in the running state.
    pub fn new(bpm: f64, sample_rate: u32) -> (Arc<MasterClock>, ClockDriver) {
        let bpm = if bpm.is_finite() && bpm > 0.0 {
            bpm
        } else {
            tracing::warn!(bpm, "invalid initial clock tempo, using 120");
            120.0
        };

        let clock = Arc::new(MasterClock {
            seq: AtomicU64::new(0),
            time_bits: AtomicU64::new(0f64.to_bits()),
            beat_bits: AtomicU64::new(0f64.to_bits()),
            bpm_bits: AtomicU64::new(bpm.to_bits()),
            total_frames: AtomicU64::new(0),
            latency_bits: AtomicU64::new(0f64.to_bits()),
            running: AtomicBool::new(true),
            sample_rate: sample_rate.max(1),
        });

        let driver = ClockDriver {
            clock: Arc::clone(&clock),
            time_seconds: 0.0,
            beat_position: 0.0,
            bpm,
            frames: 0,
        };

        (clock, driver)
    }

    /// Consistent snapshot of time, beat position and tempo
    pub fn now(&self) -> ClockSnapshot {
        loop {
            let s1 = self.seq.load(Ordering::Acquire);
            if s1 & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }

            let time_seconds = f64::from_bits(self.time_bits.load(Ordering::Relaxed));
            let beat_position = f64::from_bits(self.beat_bits.load(Ordering::Relaxed));
            let bpm = f64::from_bits(self.bpm_bits.load(Ordering::Relaxed));

            fence(Ordering::Acquire);
            let s2 = self.seq.load(Ordering::Relaxed);
            if s1 == s2 {
                return ClockSnapshot {
                    time_seconds,
                    beat_position,
                    bpm,
                };
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Frames counted by `ClockDriver::advance_frames`
    pub fn total_frames(&self) -> u64 {
        self.total_frames.load(Ordering::Acquire)
    }

    /// Output latency compensation in milliseconds
    pub fn latency_ms(&self) -> f64 {
        f64::from_bits(self.latency_bits.load(Ordering::Relaxed))
    }

    /// Audible time: counted frames minus output latency, never negative
    pub fn audio_time_seconds(&self) -> f64 {
        let raw = self.frames_to_seconds(self.total_frames());
        (raw - self.latency_ms() / 1000.0).max(0.0)
    }

    pub fn frames_to_seconds(&self, frames: u64) -> f64 {
        frames as f64 / self.sample_rate as f64
    }

    pub fn seconds_to_frames(&self, seconds: f64) -> u64 {
        if seconds <= 0.0 || !seconds.is_finite() {
            return 0;
        }
        (seconds * self.sample_rate as f64).round() as u64
    }
}

impl ClockDriver {
    /// Shared reader for this driver's clock
    pub fn clock(&self) -> &Arc<MasterClock> {
        &self.clock
    }

    /// Advance time by `delta_seconds`. Ignored while stopped or for
    /// non-finite or negative deltas, keeping time monotonic.
    pub fn advance(&mut self, delta_seconds: f64) {
        if !self.clock.is_running() {
            return;
        }
        if !delta_seconds.is_finite() || delta_seconds < 0.0 {
            tracing::warn!(delta_seconds, "ignoring invalid clock advance");
            return;
        }

        self.time_seconds += delta_seconds;
        self.beat_position += delta_seconds * self.bpm / 60.0;
        self.publish();
    }

    /// Advance by a number of audio frames at the clock's sample rate
    pub fn advance_frames(&mut self, frames: u64) {
        if !self.clock.is_running() {
            return;
        }
        self.frames += frames;
        self.clock.total_frames.store(self.frames, Ordering::Release);
        self.advance(self.clock.frames_to_seconds(frames));
    }

    /// Change the grid tempo; beats accumulated so far are kept
    pub fn set_bpm(&mut self, bpm: f64) {
        if !bpm.is_finite() || bpm <= 0.0 {
            tracing::warn!(bpm, "ignoring invalid clock tempo");
            return;
        }
        self.bpm = bpm;
        self.publish();
    }

    pub fn start(&mut self) {
        self.clock.running.store(true, Ordering::Release);
        tracing::info!("master clock started");
    }

    pub fn stop(&mut self) {
        self.clock.running.store(false, Ordering::Release);
        tracing::info!("master clock stopped");
    }

    /// Zero time, beats and frames. Tempo and running state are kept.
    pub fn reset(&mut self) {
        self.time_seconds = 0.0;
        self.beat_position = 0.0;
        self.frames = 0;
        self.clock.total_frames.store(0, Ordering::Release);
        self.publish();
        tracing::info!("master clock reset");
    }

    pub fn set_latency_compensation(&mut self, ms: f64) {
        let ms = if ms.is_finite() { ms.max(0.0) } else { 0.0 };
        self.clock.latency_bits.store(ms.to_bits(), Ordering::Relaxed);
    }

    fn publish(&self) {
        let c = &self.clock;
        let seq = c.seq.load(Ordering::Relaxed);
        c.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);

        c.time_bits.store(self.time_seconds.to_bits(), Ordering::Relaxed);
        c.beat_bits.store(self.beat_position.to_bits(), Ordering::Relaxed);
        c.bpm_bits.store(self.bpm.to_bits(), Ordering::Relaxed);

        c.seq.store(seq.wrapping_add(2), Ordering::Release);
    }
}

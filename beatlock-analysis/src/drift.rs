//! Phase drift monitoring
//!
//! Watches the phase offset a sync loop publishes and derives a moving
//! average, a drift slope (beats per minute of phase slip) and range
//! statistics. Used to judge whether a lock is actually holding over time.

use std::collections::VecDeque;

/// Smallest and largest accepted window sizes
const MIN_WINDOW: usize = 5;
const MAX_WINDOW: usize = 200;

/// Minimum span of observation time before a slope is reported (seconds)
const MIN_DRIFT_SPAN_SECS: f64 = 1.0;

/// Drift state after an accepted measurement
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriftSnapshot {
    pub timestamp: f64,
    pub phase_offset_beats: f64,
    pub moving_average: f64,
    pub drift_beats_per_min: f64,
    pub sample_count: usize,
}

/// Summary statistics over the current window
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DriftStats {
    pub count: usize,
    pub mean: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub range: f64,
}

/// Moving-window drift monitor
#[derive(Debug, Clone)]
pub struct DriftMonitor {
    window_size: usize,
    /// Measurements with |offset| above this are dropped as outliers
    outlier_threshold: f64,
    /// Minimum measurements before a slope is computed
    min_samples_for_drift: usize,
    /// (time seconds, phase offset beats)
    history: VecDeque<(f64, f64)>,
    current_offset: f64,
    moving_average: f64,
    drift_beats_per_min: f64,
    rejected: u64,
}

impl DriftMonitor {
    /// Create a monitor with the given window size (clamped to 5..=200)
    pub fn new(window_size: usize) -> Self {
        let window_size = window_size.clamp(MIN_WINDOW, MAX_WINDOW);
        Self {
            window_size,
            outlier_threshold: 0.25,
            min_samples_for_drift: 10,
            history: VecDeque::with_capacity(window_size),
            current_offset: 0.0,
            moving_average: 0.0,
            drift_beats_per_min: 0.0,
            rejected: 0,
        }
    }

    /// Set the outlier threshold in beats
    pub fn with_outlier_threshold(mut self, beats: f64) -> Self {
        self.outlier_threshold = beats.abs();
        self
    }

    /// Record a measurement. Returns `None` if it was rejected as an outlier.
    pub fn push(&mut self, time_seconds: f64, phase_offset_beats: f64) -> Option<DriftSnapshot> {
        if !phase_offset_beats.is_finite() || phase_offset_beats.abs() > self.outlier_threshold {
            self.rejected += 1;
            tracing::debug!(offset = phase_offset_beats, "drift outlier rejected");
            return None;
        }

        if self.history.len() == self.window_size {
            self.history.pop_front();
        }
        self.history.push_back((time_seconds, phase_offset_beats));
        self.current_offset = phase_offset_beats;
        self.moving_average =
            self.history.iter().map(|&(_, p)| p).sum::<f64>() / self.history.len() as f64;
        self.drift_beats_per_min = self.calculate_drift();

        Some(self.snapshot_at(time_seconds))
    }

    fn snapshot_at(&self, timestamp: f64) -> DriftSnapshot {
        DriftSnapshot {
            timestamp,
            phase_offset_beats: self.current_offset,
            moving_average: self.moving_average,
            drift_beats_per_min: self.drift_beats_per_min,
            sample_count: self.history.len(),
        }
    }

    /// Least-squares slope of offset over time, in beats per minute
    fn calculate_drift(&self) -> f64 {
        let n = self.history.len();
        if n < self.min_samples_for_drift {
            return 0.0;
        }

        let t0 = self.history[0].0;
        let span = self.history[n - 1].0 - t0;
        if span < MIN_DRIFT_SPAN_SECS {
            return 0.0;
        }

        let nf = n as f64;
        let mean_t = self.history.iter().map(|&(t, _)| t - t0).sum::<f64>() / nf;
        let mean_p = self.moving_average;

        let mut cov = 0.0;
        let mut var = 0.0;
        for &(t, p) in &self.history {
            let dt = t - t0 - mean_t;
            cov += dt * (p - mean_p);
            var += dt * dt;
        }

        if var <= f64::EPSILON {
            return 0.0;
        }
        cov / var * 60.0
    }

    /// Latest snapshot (timestamp of the newest accepted measurement)
    pub fn latest(&self) -> Option<DriftSnapshot> {
        self.history.back().map(|&(t, _)| self.snapshot_at(t))
    }

    /// Statistics over the current window
    pub fn statistics(&self) -> DriftStats {
        if self.history.is_empty() {
            return DriftStats::default();
        }

        let count = self.history.len();
        let mean = self.moving_average;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sq = 0.0;
        for &(_, p) in &self.history {
            min = min.min(p);
            max = max.max(p);
            sq += (p - mean) * (p - mean);
        }

        DriftStats {
            count,
            mean,
            std_dev: (sq / count as f64).sqrt(),
            min,
            max,
            range: max - min,
        }
    }

    /// Change the window size, keeping the newest measurements
    pub fn set_window_size(&mut self, size: usize) {
        let size = size.clamp(MIN_WINDOW, MAX_WINDOW);
        while self.history.len() > size {
            self.history.pop_front();
        }
        self.window_size = size;
        tracing::info!(size, "drift monitor window size changed");
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Number of measurements dropped as outliers since creation or reset
    pub fn rejected_count(&self) -> u64 {
        self.rejected
    }

    pub fn drift_beats_per_min(&self) -> f64 {
        self.drift_beats_per_min
    }

    pub fn moving_average(&self) -> f64 {
        self.moving_average
    }

    /// Clear all measurements
    pub fn reset(&mut self) {
        self.history.clear();
        self.current_offset = 0.0;
        self.moving_average = 0.0;
        self.drift_beats_per_min = 0.0;
        self.rejected = 0;
    }
}

impl Default for DriftMonitor {
    fn default() -> Self {
        Self::new(50)
    }
}

//! Sync quality score
//!
//! Exponentially weighted averages of |error| and of the saturated fraction
//! feed a target score; the published score follows it with bounded steps so a
//! single bad measurement cannot make it jump.

/// Largest change of the score in one update
const MAX_STEP: f64 = 0.1;

#[derive(Debug, Clone)]
pub struct QualityTracker {
    tau: f64,
    recovery_per_second: f64,
    /// |error| at which the error part of the score reaches zero (beats)
    error_scale: f64,
    avg_abs_error: f64,
    saturated_avg: f64,
    quality: f64,
    primed: bool,
}

impl QualityTracker {
    pub fn new(tau: f64, recovery_per_second: f64, error_scale: f64) -> Self {
        Self {
            tau: tau.max(1e-3),
            recovery_per_second,
            error_scale: error_scale.max(1e-6),
            avg_abs_error: 0.0,
            saturated_avg: 0.0,
            quality: 0.0,
            primed: false,
        }
    }

    pub fn update(&mut self, error: f64, saturated: bool, dt: f64) -> f64 {
        let abs_error = error.abs();
        let sat = if saturated { 1.0 } else { 0.0 };

        if self.primed {
            let alpha = 1.0 - (-dt / self.tau).exp();
            self.avg_abs_error += alpha * (abs_error - self.avg_abs_error);
            self.saturated_avg += alpha * (sat - self.saturated_avg);
        } else {
            self.avg_abs_error = abs_error;
            self.saturated_avg = sat;
            self.primed = true;
        }

        let target = (1.0 - (self.avg_abs_error / self.error_scale).min(1.0))
            * (1.0 - 0.5 * self.saturated_avg);

        let delta = target - self.quality;
        let step = if delta < 0.0 {
            delta.max(-MAX_STEP)
        } else {
            delta.min(self.recovery_per_second * dt).min(MAX_STEP)
        };
        self.quality = (self.quality + step).clamp(0.0, 1.0);
        self.quality
    }

    pub fn quality(&self) -> f64 {
        self.quality
    }

    pub fn reset(&mut self) {
        self.avg_abs_error = 0.0;
        self.saturated_avg = 0.0;
        self.quality = 0.0;
        self.primed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovers_gradually() {
        let mut q = QualityTracker::new(1.0, 0.5, 0.1);
        let first = q.update(0.0, false, 0.05);
        assert!((first - 0.025).abs() < 1e-12);

        for _ in 0..200 {
            q.update(0.0, false, 0.05);
        }
        assert!((q.quality() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_single_outlier_bounded() {
        let mut q = QualityTracker::new(1.0, 0.5, 0.1);
        for _ in 0..400 {
            q.update(0.001, false, 0.05);
        }
        let before = q.quality();
        let after = q.update(0.5, true, 0.05);
        assert!(before - after <= MAX_STEP + 1e-12);
        assert!(after < before);
    }

    #[test]
    fn test_saturation_halves_score() {
        let mut q = QualityTracker::new(0.5, 10.0, 0.1);
        for _ in 0..400 {
            q.update(0.0, true, 0.05);
        }
        assert!((q.quality() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_error_scale_sets_zero_point() {
        let mut strict = QualityTracker::new(0.5, 10.0, 0.1);
        let mut lenient = QualityTracker::new(0.5, 10.0, 0.5);
        for _ in 0..400 {
            strict.update(0.1, false, 0.05);
            lenient.update(0.1, false, 0.05);
        }
        assert!(strict.quality().abs() < 1e-6);
        assert!((lenient.quality() - 0.8).abs() < 1e-6);
    }
}

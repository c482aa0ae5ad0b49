//! PID core of the phase lock
//!
//! Works on phase errors in beats and produces a correction term that the
//! caller clamps to the correction band. Anti-windup is two-fold: the
//! integral is clamped so its contribution never exceeds the band, and it is
//! frozen while the output already saturates in the direction of the error.

use super::state::wrap_phase;
use std::collections::VecDeque;

/// Errors kept for gain scheduling
const GAIN_HISTORY: usize = 20;

/// Output of one controller step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PidOutput {
    /// P + I + D before clamping
    pub raw: f64,
    /// |raw| reached the correction limit
    pub saturated: bool,
}

#[derive(Debug, Clone)]
pub struct PidController {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    /// Low-pass coefficient for the derivative (0 < alpha <= 1)
    derivative_smoothing: f64,
    integral: f64,
    filtered_derivative: f64,
    last_error: f64,
    /// False until the first step after a reset; that step seeds `last_error`
    seeded: bool,
    kp_min: f64,
    kp_max: f64,
    ki_min: f64,
    ki_max: f64,
    errors: VecDeque<f64>,
}

impl PidController {
    pub fn new(kp: f64, ki: f64, kd: f64, derivative_smoothing: f64) -> Self {
        Self {
            kp,
            ki,
            kd,
            derivative_smoothing: derivative_smoothing.clamp(f64::EPSILON, 1.0),
            integral: 0.0,
            filtered_derivative: 0.0,
            last_error: 0.0,
            seeded: false,
            kp_min: kp * 0.5,
            kp_max: kp * 2.0,
            ki_min: ki / 3.0,
            ki_max: ki * 5.0 / 3.0,
            errors: VecDeque::with_capacity(GAIN_HISTORY),
        }
    }

    /// Replace the gains; the scheduling bands follow the new `kp` and `ki`
    pub fn set_gains(&mut self, kp: f64, ki: f64, kd: f64) {
        self.kp = kp;
        self.ki = ki;
        self.kd = kd;
        self.kp_min = kp * 0.5;
        self.kp_max = kp * 2.0;
        self.ki_min = ki / 3.0;
        self.ki_max = ki * 5.0 / 3.0;
    }

    /// Run one step with phase error `error` (beats) over `dt` seconds
    pub fn step(&mut self, error: f64, dt: f64, limit: f64) -> PidOutput {
        let p = self.kp * error;

        // Derivative of the wrapped error, low-passed
        let raw_d = if self.seeded {
            wrap_phase(error - self.last_error) / dt
        } else {
            self.seeded = true;
            0.0
        };
        self.filtered_derivative += self.derivative_smoothing * (raw_d - self.filtered_derivative);
        self.last_error = error;
        let d = self.kd * self.filtered_derivative;

        // Conditional integration
        let unsaturated = p + self.ki * self.integral + d;
        let pushing_into_limit =
            unsaturated.abs() >= limit && unsaturated.signum() == error.signum();
        if !pushing_into_limit {
            self.integral += error * dt;
        }

        if self.ki > 0.0 {
            let bound = limit / self.ki;
            self.integral = self.integral.clamp(-bound, bound);
        } else {
            self.integral = 0.0;
        }

        let raw = p + self.ki * self.integral + d;
        PidOutput {
            raw,
            saturated: raw.abs() >= limit,
        }
    }

    /// Gain scheduling over the recent error history. Noisy errors back `kp`
    /// off; a steady but persistent error pushes it up. `ki` follows the
    /// mean error magnitude.
    pub fn adapt(&mut self, error: f64) {
        if self.errors.len() == GAIN_HISTORY {
            self.errors.pop_front();
        }
        self.errors.push_back(error);
        if self.errors.len() < GAIN_HISTORY {
            return;
        }

        let n = self.errors.len() as f64;
        let mean = self.errors.iter().sum::<f64>() / n;
        let variance = self.errors.iter().map(|e| (e - mean) * (e - mean)).sum::<f64>() / n;
        let mean_abs = self.errors.iter().map(|e| e.abs()).sum::<f64>() / n;

        if variance > 0.01 {
            self.kp = (self.kp * 0.95).max(self.kp_min);
        } else if variance < 0.001 && mean_abs > 0.02 {
            self.kp = (self.kp * 1.05).min(self.kp_max);
        }

        if mean_abs > 0.05 {
            self.ki = (self.ki * 1.02).min(self.ki_max);
        } else if mean_abs < 0.01 {
            self.ki = (self.ki * 0.98).max(self.ki_min);
        }
    }

    pub fn integral(&self) -> f64 {
        self.integral
    }

    pub fn filtered_derivative(&self) -> f64 {
        self.filtered_derivative
    }

    pub fn error_history_len(&self) -> usize {
        self.errors.len()
    }

    /// Clear integrator, derivative filter and error history
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.filtered_derivative = 0.0;
        self.last_error = 0.0;
        self.seeded = false;
        self.errors.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: f64 = 0.005;

    #[test]
    fn test_first_step_has_no_derivative_kick() {
        let mut pid = PidController::new(0.1, 0.004, 0.02, 0.3);
        pid.step(0.2, 0.05, LIMIT);
        assert_eq!(pid.filtered_derivative(), 0.0);

        // Second step with the same error: still no derivative
        pid.step(0.2, 0.05, LIMIT);
        assert!(pid.filtered_derivative().abs() < 1e-12);
    }

    #[test]
    fn test_integral_bounded_by_band() {
        let mut pid = PidController::new(0.0, 0.004, 0.0, 0.3);
        for _ in 0..10_000 {
            pid.step(0.4, 0.25, LIMIT);
        }
        assert!(pid.ki * pid.integral() <= LIMIT + 1e-15);
    }

    #[test]
    fn test_integral_frozen_while_saturated() {
        // kp alone saturates for e = 0.2 (0.1 * 0.2 = 0.02 > 0.005)
        let mut pid = PidController::new(0.1, 0.004, 0.0, 0.3);
        for _ in 0..100 {
            let out = pid.step(0.2, 0.05, LIMIT);
            assert!(out.saturated);
        }
        assert_eq!(pid.integral(), 0.0);
    }

    #[test]
    fn test_derivative_uses_wrapped_delta() {
        let mut pid = PidController::new(0.0, 0.0, 1.0, 1.0);
        pid.step(0.49, 0.1, LIMIT);
        // 0.49 -> -0.49 is a +0.02 beat move across the wrap, not -0.98
        pid.step(-0.49, 0.1, LIMIT);
        assert!((pid.filtered_derivative() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_adaptive_gain_bounds() {
        let mut pid = PidController::new(0.1, 0.0, 0.0, 0.3);
        // Steady, persistent error grows kp up to its ceiling
        for _ in 0..500 {
            pid.adapt(0.05);
        }
        assert!((pid.kp - 0.2).abs() < 1e-12);

        // Alternating large errors shrink it down to the floor
        for i in 0..500 {
            pid.adapt(if i % 2 == 0 { 0.3 } else { -0.3 });
        }
        assert!((pid.kp - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_adaptive_ki_follows_mean_error() {
        let mut pid = PidController::new(0.1, 0.003, 0.0, 0.3);
        // Fewer than 20 errors: no scheduling yet
        for _ in 0..19 {
            pid.adapt(0.1);
        }
        assert_eq!(pid.ki, 0.003);

        // Large mean error raises ki to 5/3 of its base
        for _ in 0..500 {
            pid.adapt(0.1);
        }
        assert!((pid.ki - 0.005).abs() < 1e-12);

        // Small mean error lowers it to 1/3 of its base
        for _ in 0..500 {
            pid.adapt(0.005);
        }
        assert!((pid.ki - 0.001).abs() < 1e-12);

        // In between, ki holds
        let held = pid.ki;
        for _ in 0..100 {
            pid.adapt(0.03);
        }
        assert_eq!(pid.ki, held);

        pid.set_gains(0.1, 0.006, 0.0);
        for _ in 0..500 {
            pid.adapt(0.1);
        }
        assert!((pid.ki - 0.01).abs() < 1e-12);
    }
}

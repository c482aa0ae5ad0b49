//! Tempo and beat-phase lock between a target deck and a master deck
//!
//! `TempoPhaseSync::update` runs on the control thread. It measures the phase
//! error between the decks, runs it through a PID loop and publishes a
//! `SyncState` whose correction factor the audio thread applies through the
//! time stretcher. The audio thread only ever reads the published snapshot.
//!
//! Binding, enable/disable and stream-restart requests may come from any
//! thread, including the audio thread. They are posted to an atomic mailbox
//! and applied right away when the controller is idle, otherwise by the
//! update that currently holds it. A later request supersedes an earlier
//! one it conflicts with. None of them waits on the control lock.

mod pid;
mod quality;
mod state;

pub use state::{
    wrap_phase, CorrectionStrategy, DeckId, QualityGrade, SyncDiagnostics, SyncMode, SyncState,
    SyncStatus,
};

use crate::clock::{ClockSnapshot, MasterClock};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use pid::PidController;
use quality::QualityTracker;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Largest correction band the loop will accept (0.5 %)
pub const MAX_CORRECTION_LIMIT: f64 = 0.005;

/// Errors from sync configuration
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("invalid sync configuration: {0}")]
    InvalidConfiguration(String),
    #[error("correction strategy {0:?} is not supported")]
    UnsupportedStrategy(CorrectionStrategy),
}

/// Tuning of the phase lock
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub strategy: CorrectionStrategy,
    /// Max |factor - 1|
    pub correction_limit: f64,
    /// Smallest factor change that is applied
    pub hysteresis_threshold: f64,
    /// Seconds of saturation after which in-threshold moves are forced
    pub saturation_dwell: f64,
    /// Bound on factor change per second
    pub max_slew_per_second: f64,
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    /// Derivative low-pass coefficient
    pub derivative_smoothing: f64,
    /// Beats; |error| below this counts toward lock
    pub lock_tolerance: f64,
    /// Seconds below `lock_tolerance` before Locked
    pub lock_window: f64,
    /// Beats; |error| above this while Locked means Unstable
    pub unlock_tolerance: f64,
    /// Seconds of saturation while Locked before Unstable
    pub saturation_timeout: f64,
    /// Seconds to ramp a full-band factor back to 1.0 after disable
    pub ramp_out_seconds: f64,
    pub min_update_interval: f64,
    /// Cap on the dt of one tick
    pub max_dt: f64,
    /// Time constant of the quality averages
    pub quality_tau: f64,
    /// Max quality increase per second
    pub quality_recovery_per_second: f64,
    /// Beats of average |error| at which quality reaches zero
    pub quality_error_scale: f64,
    pub adaptive_gain: bool,
    /// Narrow the correction band as sync quality improves
    pub graded_limit: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            strategy: CorrectionStrategy::RateModulation,
            correction_limit: MAX_CORRECTION_LIMIT,
            hysteresis_threshold: 0.0005,
            saturation_dwell: 0.25,
            max_slew_per_second: 0.01,
            kp: 0.1,
            ki: 0.004,
            kd: 0.02,
            derivative_smoothing: 0.3,
            lock_tolerance: 0.02,
            lock_window: 1.0,
            unlock_tolerance: 0.1,
            saturation_timeout: 5.0,
            ramp_out_seconds: 0.5,
            min_update_interval: 0.0,
            max_dt: 0.25,
            quality_tau: 1.0,
            quality_recovery_per_second: 0.5,
            quality_error_scale: 0.1,
            adaptive_gain: false,
            graded_limit: false,
        }
    }
}

fn invalid(msg: impl Into<String>) -> SyncError {
    SyncError::InvalidConfiguration(msg.into())
}

fn check_gains(kp: f64, ki: f64, kd: f64) -> Result<(), SyncError> {
    for (name, v) in [("kp", kp), ("ki", ki), ("kd", kd)] {
        if !v.is_finite() || v < 0.0 {
            return Err(invalid(format!("{name} must be finite and >= 0, got {v}")));
        }
    }
    Ok(())
}

fn check_limit(limit: f64) -> Result<(), SyncError> {
    if !(limit > 0.0 && limit <= MAX_CORRECTION_LIMIT) {
        return Err(invalid(format!(
            "correction_limit must be in (0, {MAX_CORRECTION_LIMIT}], got {limit}"
        )));
    }
    Ok(())
}

/// Correction band allowed at `grade` when the graded limit is on
fn graded_band(grade: QualityGrade, limit: f64) -> f64 {
    let band = match grade {
        QualityGrade::Excellent => 0.0005,
        QualityGrade::Good => 0.001,
        QualityGrade::Fair => 0.002,
        QualityGrade::Poor => limit,
    };
    band.min(limit)
}

impl SyncConfig {
    /// Check every option's range
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.strategy != CorrectionStrategy::RateModulation {
            return Err(SyncError::UnsupportedStrategy(self.strategy));
        }
        check_limit(self.correction_limit)?;
        check_gains(self.kp, self.ki, self.kd)?;

        let non_negative = [
            ("hysteresis_threshold", self.hysteresis_threshold),
            ("saturation_dwell", self.saturation_dwell),
            ("lock_window", self.lock_window),
            ("saturation_timeout", self.saturation_timeout),
            ("min_update_interval", self.min_update_interval),
        ];
        for (name, v) in non_negative {
            if !v.is_finite() || v < 0.0 {
                return Err(invalid(format!("{name} must be finite and >= 0, got {v}")));
            }
        }

        let positive = [
            ("max_slew_per_second", self.max_slew_per_second),
            ("lock_tolerance", self.lock_tolerance),
            ("unlock_tolerance", self.unlock_tolerance),
            ("ramp_out_seconds", self.ramp_out_seconds),
            ("max_dt", self.max_dt),
            ("quality_tau", self.quality_tau),
            ("quality_recovery_per_second", self.quality_recovery_per_second),
            ("quality_error_scale", self.quality_error_scale),
        ];
        for (name, v) in positive {
            if !v.is_finite() || v <= 0.0 {
                return Err(invalid(format!("{name} must be finite and > 0, got {v}")));
            }
        }

        if !(self.derivative_smoothing > 0.0 && self.derivative_smoothing <= 1.0) {
            return Err(invalid(format!(
                "derivative_smoothing must be in (0, 1], got {}",
                self.derivative_smoothing
            )));
        }
        if self.unlock_tolerance <= self.lock_tolerance {
            return Err(invalid("unlock_tolerance must exceed lock_tolerance"));
        }
        if self.unlock_tolerance > 0.5 {
            return Err(invalid("unlock_tolerance must be at most 0.5 beats"));
        }
        Ok(())
    }
}

const REQ_NONE: u8 = 0;
const REQ_ENABLE: u8 = 1;
const REQ_DISABLE: u8 = 2;

/// Bit set in a packed binding once a pair is bound
const BOUND: u32 = 1 << 16;

fn pack_pair(target: DeckId, master: DeckId) -> u32 {
    BOUND | (target.0 as u32) << 8 | master.0 as u32
}

fn unpack_pair(packed: u32) -> (Option<DeckId>, Option<DeckId>) {
    if packed & BOUND == 0 {
        return (None, None);
    }
    (
        Some(DeckId((packed >> 8) as u8)),
        Some(DeckId(packed as u8)),
    )
}

/// Controller state, guarded by the control-path mutex
struct SyncCore {
    config: SyncConfig,
    target: Option<DeckId>,
    master: Option<DeckId>,
    state: SyncState,
    pid: PidController,
    quality: QualityTracker,
    /// Disabled but the factor has not yet returned to 1.0
    ramping_out: bool,
    saturation_seconds: f64,
    lock_seconds: f64,
    update_count: u64,
}

impl SyncCore {
    fn new(config: SyncConfig) -> Self {
        let pid = PidController::new(config.kp, config.ki, config.kd, config.derivative_smoothing);
        let quality = QualityTracker::new(
            config.quality_tau,
            config.quality_recovery_per_second,
            config.quality_error_scale,
        );
        Self {
            config,
            target: None,
            master: None,
            state: SyncState::default(),
            pid,
            quality,
            ramping_out: false,
            saturation_seconds: 0.0,
            lock_seconds: 0.0,
            update_count: 0,
        }
    }

    fn is_bound(&self) -> bool {
        self.target.is_some() && self.master.is_some()
    }

    fn clear_loop(&mut self) {
        self.pid.reset();
        self.quality.reset();
        self.saturation_seconds = 0.0;
        self.lock_seconds = 0.0;
    }

    fn hard_reset(&mut self, now: f64) {
        self.clear_loop();
        self.ramping_out = false;
        self.state = SyncState {
            last_update_time: now,
            ..SyncState::default()
        };
    }

    fn enable(&mut self, now: f64) {
        if !self.is_bound() {
            tracing::warn!("sync enable requested with no deck pair bound");
            return;
        }
        if self.state.mode != SyncMode::Disabled {
            return;
        }

        // Resume from the current factor so an enable during ramp-out has no step
        self.clear_loop();
        self.ramping_out = false;
        self.state.mode = SyncMode::Locking;
        self.state.sync_quality = 0.0;
        self.state.integral_term = 0.0;
        self.state.filtered_derivative = 0.0;
        self.state.last_update_time = now;
        tracing::info!(
            target_deck = ?self.target,
            master_deck = ?self.master,
            "tempo/phase sync enabled"
        );
    }

    fn disable(&mut self) {
        if self.state.mode == SyncMode::Disabled {
            return;
        }
        self.clear_loop();
        self.state.mode = SyncMode::Disabled;
        self.state.integral_term = 0.0;
        self.state.filtered_derivative = 0.0;
        self.ramping_out = self.state.tempo_correction_factor != 1.0;
        tracing::info!(
            factor = self.state.tempo_correction_factor,
            "tempo/phase sync disabled"
        );
    }

    /// dt since the last effective tick, or None if this tick is skipped
    fn tick_dt(&self, now: &ClockSnapshot) -> Option<f64> {
        let dt = now.time_seconds - self.state.last_update_time;
        if !dt.is_finite() || dt <= 0.0 || dt < self.config.min_update_interval {
            tracing::debug!(dt, "sync tick skipped");
            return None;
        }
        Some(dt.min(self.config.max_dt))
    }

    fn ramp_out(&mut self, now: &ClockSnapshot) -> SyncState {
        let Some(dt) = self.tick_dt(now) else {
            return self.state;
        };

        let step = self.config.correction_limit * dt / self.config.ramp_out_seconds;
        let diff = 1.0 - self.state.tempo_correction_factor;
        if diff.abs() <= step {
            // Tempo matching outlives the lock; only the trim is ramped away
            let tempo_ratio = self.state.tempo_ratio;
            self.hard_reset(now.time_seconds);
            self.state.tempo_ratio = tempo_ratio;
            tracing::debug!("sync ramp-out complete");
        } else {
            self.state.tempo_correction_factor += step.copysign(diff);
            self.state.last_update_time = now.time_seconds;
        }
        self.state
    }

    fn step(
        &mut self,
        target_phase: f64,
        target_bpm: f64,
        master_phase: f64,
        master_bpm: f64,
        now: &ClockSnapshot,
    ) -> SyncState {
        if !self.is_bound() {
            return self.state;
        }
        if self.state.mode == SyncMode::Disabled {
            if self.ramping_out {
                return self.ramp_out(now);
            }
            return self.state;
        }

        let inputs_ok = [target_phase, target_bpm, master_phase, master_bpm]
            .iter()
            .all(|v| v.is_finite())
            && target_bpm > 0.0
            && master_bpm > 0.0;
        if !inputs_ok {
            tracing::debug!(target_bpm, master_bpm, "sync tick skipped: invalid inputs");
            return self.state;
        }

        let Some(dt) = self.tick_dt(now) else {
            return self.state;
        };

        let cfg = &self.config;
        let limit = cfg.correction_limit;
        let error = wrap_phase(master_phase - target_phase);

        if cfg.adaptive_gain {
            self.pid.adapt(error);
        }
        let out = self.pid.step(error, dt, limit);
        let band = if cfg.graded_limit {
            graded_band(self.state.grade(), limit)
        } else {
            limit
        };
        let target_factor = 1.0 + out.raw.clamp(-band, band);

        if out.saturated {
            self.saturation_seconds += dt;
        } else {
            self.saturation_seconds = 0.0;
        }

        // Hysteresis, then slew limiting
        let factor = self.state.tempo_correction_factor;
        let diff = target_factor - factor;
        let forced =
            out.saturated && self.saturation_seconds >= cfg.saturation_dwell && diff != 0.0;
        if diff.abs() > cfg.hysteresis_threshold || forced {
            let max_step = cfg.max_slew_per_second * dt;
            let moved = factor + diff.clamp(-max_step, max_step);
            self.state.tempo_correction_factor = moved.clamp(1.0 - limit, 1.0 + limit);
        }

        self.update_mode(error, out.saturated, dt);

        self.state.phase_offset_beats = error;
        self.state.sync_quality = self.quality.update(error, out.saturated, dt);
        self.state.integral_term = self.pid.integral();
        self.state.filtered_derivative = self.pid.filtered_derivative();
        self.state.last_update_time = now.time_seconds;
        self.state.tempo_ratio = master_bpm / target_bpm;
        self.update_count += 1;

        self.state
    }

    fn update_mode(&mut self, error: f64, saturated: bool, dt: f64) {
        let cfg = &self.config;
        let abs_error = error.abs();

        match self.state.mode {
            SyncMode::Locking => {
                if abs_error < cfg.lock_tolerance {
                    self.lock_seconds += dt;
                    if self.lock_seconds >= cfg.lock_window {
                        self.state.mode = SyncMode::Locked;
                        tracing::info!(offset = error, "phase lock acquired");
                    }
                } else {
                    self.lock_seconds = 0.0;
                }
            }
            SyncMode::Locked => {
                if abs_error > cfg.unlock_tolerance
                    || self.saturation_seconds >= cfg.saturation_timeout
                {
                    self.state.mode = SyncMode::Unstable;
                    self.lock_seconds = 0.0;
                    tracing::warn!(
                        offset = error,
                        saturated_for = self.saturation_seconds,
                        "phase lock unstable"
                    );
                }
            }
            SyncMode::Unstable => {
                if abs_error < cfg.unlock_tolerance && !saturated {
                    self.state.mode = SyncMode::Locking;
                    tracing::info!(offset = error, "re-acquiring phase lock");
                }
            }
            SyncMode::Disabled => {}
        }
    }
}

/// Phase lock for one (target, master) deck pair
pub struct TempoPhaseSync {
    clock: Arc<MasterClock>,
    core: Mutex<SyncCore>,
    published: ArcSwap<SyncState>,
    /// Bound pair, packed by `pack_pair`; readable without the control lock
    binding: AtomicU32,
    bind_request: AtomicBool,
    enable_request: AtomicU8,
    reset_request: AtomicBool,
}

impl TempoPhaseSync {
    /// Create an unbound, disabled sync with default tuning
    pub fn new(clock: Arc<MasterClock>) -> Self {
        Self {
            clock,
            core: Mutex::new(SyncCore::new(SyncConfig::default())),
            published: ArcSwap::from_pointee(SyncState::default()),
            binding: AtomicU32::new(0),
            bind_request: AtomicBool::new(false),
            enable_request: AtomicU8::new(REQ_NONE),
            reset_request: AtomicBool::new(false),
        }
    }

    /// Create with validated tuning
    pub fn with_config(clock: Arc<MasterClock>, config: SyncConfig) -> Result<Self, SyncError> {
        config.validate()?;
        let sync = Self::new(clock);
        *sync.core.lock() = SyncCore::new(config);
        Ok(sync)
    }

    /// Bind the deck pair. Rebinding resets the loop to Disabled and drops
    /// any enable request posted before it.
    pub fn set_decks(&self, target: DeckId, master: DeckId) -> Result<(), SyncError> {
        if target == master {
            return Err(invalid(format!("deck {target} cannot sync to itself")));
        }

        self.binding.store(pack_pair(target, master), Ordering::Release);
        self.enable_request.store(REQ_NONE, Ordering::Release);
        self.bind_request.store(true, Ordering::Release);
        self.try_apply();
        Ok(())
    }

    /// Bound (target, master) pair, lock-free
    pub fn decks(&self) -> (Option<DeckId>, Option<DeckId>) {
        unpack_pair(self.binding.load(Ordering::Acquire))
    }

    /// Request Disabled <-> Locking. Safe to call while an update is running.
    pub fn enable_sync(&self, enabled: bool) {
        let req = if enabled { REQ_ENABLE } else { REQ_DISABLE };
        self.enable_request.store(req, Ordering::Release);
        self.try_apply();
    }

    /// Clear all loop state after either deck's stream restarted. Cancels an
    /// enable request that has not been applied yet.
    pub fn reset_for_stream_restart(&self) {
        self.enable_request.store(REQ_NONE, Ordering::Release);
        self.reset_request.store(true, Ordering::Release);
        self.try_apply();
    }

    /// Run one control step. `target_bpm` is the target deck's tempo before
    /// any sync correction.
    pub fn update(
        &self,
        target_phase_beats: f64,
        target_bpm: f64,
        master_phase_beats: f64,
        master_bpm: f64,
        now: ClockSnapshot,
    ) -> SyncState {
        let mut core = self.core.lock();
        self.apply_requests(&mut core);
        let state = core.step(
            target_phase_beats,
            target_bpm,
            master_phase_beats,
            master_bpm,
            &now,
        );
        self.publish(&core);
        state
    }

    /// Last published state, lock-free
    pub fn get_sync_state(&self) -> SyncState {
        **self.published.load()
    }

    pub fn set_strategy(&self, strategy: CorrectionStrategy) -> Result<(), SyncError> {
        if strategy != CorrectionStrategy::RateModulation {
            return Err(SyncError::UnsupportedStrategy(strategy));
        }
        self.core.lock().config.strategy = strategy;
        Ok(())
    }

    pub fn set_pid_gains(&self, kp: f64, ki: f64, kd: f64) -> Result<(), SyncError> {
        check_gains(kp, ki, kd)?;
        let mut core = self.core.lock();
        core.config.kp = kp;
        core.config.ki = ki;
        core.config.kd = kd;
        core.pid.set_gains(kp, ki, kd);
        tracing::info!(kp, ki, kd, "sync gains changed");
        Ok(())
    }

    pub fn set_correction_limit(&self, limit: f64) -> Result<(), SyncError> {
        check_limit(limit)?;
        let mut core = self.core.lock();
        core.config.correction_limit = limit;
        let factor = core.state.tempo_correction_factor;
        core.state.tempo_correction_factor = factor.clamp(1.0 - limit, 1.0 + limit);
        self.publish(&core);
        Ok(())
    }

    pub fn set_adaptive_gain(&self, enabled: bool) {
        self.core.lock().config.adaptive_gain = enabled;
    }

    pub fn set_graded_limit(&self, enabled: bool) {
        self.core.lock().config.graded_limit = enabled;
    }

    pub fn config(&self) -> SyncConfig {
        self.core.lock().config.clone()
    }

    pub fn diagnostics(&self) -> SyncDiagnostics {
        let core = self.core.lock();
        SyncDiagnostics {
            mode: core.state.mode,
            target: core.target,
            master: core.master,
            kp: core.pid.kp,
            ki: core.pid.ki,
            kd: core.pid.kd,
            correction_limit: core.config.correction_limit,
            integral_term: core.pid.integral(),
            filtered_derivative: core.pid.filtered_derivative(),
            saturation_seconds: core.saturation_seconds,
            error_history_len: core.pid.error_history_len(),
            update_count: core.update_count,
        }
    }

    /// Apply pending requests now unless the controller is busy
    fn try_apply(&self) {
        if let Some(mut core) = self.core.try_lock() {
            if self.apply_requests(&mut core) {
                self.publish(&core);
            }
        }
    }

    /// Apply mailbox requests; returns whether anything was applied.
    /// Order is bind, reset, enable: posting a bind or reset clears an older
    /// enable, so an enable still pending here was posted after them.
    fn apply_requests(&self, core: &mut SyncCore) -> bool {
        let bind = self.bind_request.swap(false, Ordering::AcqRel);
        let reset = self.reset_request.swap(false, Ordering::AcqRel);
        let req = self.enable_request.swap(REQ_NONE, Ordering::AcqRel);
        if !bind && !reset && req == REQ_NONE {
            return false;
        }

        let now = self.clock.now().time_seconds;
        if bind {
            let (target, master) = unpack_pair(self.binding.load(Ordering::Acquire));
            core.target = target;
            core.master = master;
            core.hard_reset(now);
            tracing::info!(target_deck = ?target, master_deck = ?master, "sync decks bound");
        }
        if reset {
            core.hard_reset(now);
            tracing::info!("sync reset for stream restart");
        }
        match req {
            REQ_ENABLE => core.enable(now),
            REQ_DISABLE => core.disable(),
            _ => {}
        }
        true
    }

    fn publish(&self, core: &SyncCore) {
        self.published.store(Arc::new(core.state));
    }

    /// Hold the control lock as an in-flight update would
    #[cfg(test)]
    pub(crate) fn hold_control_lock(&self) -> impl Sized + '_ {
        self.core.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ClockDriver;

    const DT: f64 = 0.05;
    const EPS: f64 = 1e-12;

    fn bound_sync() -> (TempoPhaseSync, ClockDriver) {
        bound_sync_with(SyncConfig::default())
    }

    fn bound_sync_with(config: SyncConfig) -> (TempoPhaseSync, ClockDriver) {
        let (clock, driver) = MasterClock::new(128.0, 48000);
        let sync = TempoPhaseSync::with_config(clock, config).unwrap();
        sync.set_decks(DeckId(1), DeckId(0)).unwrap();
        (sync, driver)
    }

    /// Tick at zero error until the loop reports Locked
    fn lock(sync: &TempoPhaseSync, driver: &mut ClockDriver) {
        sync.enable_sync(true);
        for _ in 0..40 {
            tick(sync, driver, 0.0);
        }
        assert_eq!(sync.get_sync_state().mode, SyncMode::Locked);
    }

    /// Step with a fixed phase error at matched tempo
    fn tick(sync: &TempoPhaseSync, driver: &mut ClockDriver, error: f64) -> SyncState {
        driver.advance(DT);
        let now = driver.clock().now();
        sync.update(0.0, 128.0, error, 128.0, now)
    }

    #[test]
    fn test_same_deck_rejected() {
        let (clock, _driver) = MasterClock::new(128.0, 48000);
        let sync = TempoPhaseSync::new(clock);
        assert!(matches!(
            sync.set_decks(DeckId(0), DeckId(0)),
            Err(SyncError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_unbound_stays_disabled() {
        let (clock, mut driver) = MasterClock::new(128.0, 48000);
        let sync = TempoPhaseSync::new(clock);
        sync.enable_sync(true);
        assert_eq!(sync.get_sync_state().mode, SyncMode::Disabled);

        let state = tick(&sync, &mut driver, 0.2);
        assert_eq!(state, SyncState::default());
    }

    #[test]
    fn test_disabled_update_is_noop() {
        let (sync, mut driver) = bound_sync();
        let before = sync.get_sync_state();
        let after = tick(&sync, &mut driver, 0.3);
        assert_eq!(before, after);
        assert_eq!(sync.diagnostics().update_count, 0);
    }

    #[test]
    fn test_legacy_nudge_unsupported() {
        let (sync, _driver) = bound_sync();
        assert_eq!(
            sync.set_strategy(CorrectionStrategy::LegacyNudge),
            Err(SyncError::UnsupportedStrategy(CorrectionStrategy::LegacyNudge))
        );
        assert!(sync.set_strategy(CorrectionStrategy::RateModulation).is_ok());

        let (clock, _driver) = MasterClock::new(128.0, 48000);
        let config = SyncConfig {
            strategy: CorrectionStrategy::LegacyNudge,
            ..SyncConfig::default()
        };
        assert!(matches!(
            TempoPhaseSync::with_config(clock, config),
            Err(SyncError::UnsupportedStrategy(_))
        ));
    }

    #[test]
    fn test_parameter_validation() {
        let (sync, _driver) = bound_sync();
        assert!(sync.set_pid_gains(-0.1, 0.0, 0.0).is_err());
        assert!(sync.set_pid_gains(0.1, f64::NAN, 0.0).is_err());
        assert!(sync.set_pid_gains(0.2, 0.01, 0.0).is_ok());
        assert_eq!(sync.diagnostics().kp, 0.2);

        assert!(sync.set_correction_limit(0.0).is_err());
        assert!(sync.set_correction_limit(0.006).is_err());
        assert!(sync.set_correction_limit(0.003).is_ok());
        assert_eq!(sync.config().correction_limit, 0.003);
    }

    #[test]
    fn test_constant_error_converges_monotonically() {
        for &error in &[0.3, 0.04, 0.01, -0.01, -0.2, 0.5] {
            let (sync, mut driver) = bound_sync();
            sync.enable_sync(true);

            let mut last = 1.0;
            for _ in 0..2000 {
                let factor = tick(&sync, &mut driver, error).tempo_correction_factor;
                assert!(factor >= 0.995 - EPS && factor <= 1.005 + EPS);
                if error > 0.0 {
                    assert!(factor >= last - EPS, "factor fell for error {error}");
                } else {
                    assert!(factor <= last + EPS, "factor rose for error {error}");
                }
                last = factor;
            }
            assert_eq!(last > 1.0, error > 0.0, "wrong sign for error {error}");
        }
    }

    #[test]
    fn test_disable_ramps_out_without_step() {
        let (sync, mut driver) = bound_sync();
        sync.enable_sync(true);
        for _ in 0..200 {
            tick(&sync, &mut driver, 0.4);
        }
        assert!((sync.get_sync_state().tempo_correction_factor - 1.005).abs() < EPS);

        sync.enable_sync(false);
        let state = sync.get_sync_state();
        assert_eq!(state.mode, SyncMode::Disabled);
        assert!((state.tempo_correction_factor - 1.005).abs() < EPS);

        let mut last = state.tempo_correction_factor;
        let mut ticks = 0;
        while sync.get_sync_state().tempo_correction_factor != 1.0 {
            let factor = tick(&sync, &mut driver, 0.4).tempo_correction_factor;
            // Full band over 0.5 s is 0.0005 per 50 ms tick
            assert!((last - factor).abs() <= 0.0005 + EPS);
            last = factor;
            ticks += 1;
            assert!(ticks < 100);
        }
        let state = sync.get_sync_state();
        assert_eq!(
            state,
            SyncState {
                last_update_time: state.last_update_time,
                tempo_ratio: state.tempo_ratio,
                ..SyncState::default()
            }
        );
    }

    #[test]
    fn test_reenable_after_saturation_is_bumpless() {
        let (sync, mut driver) = bound_sync();
        sync.enable_sync(true);
        for _ in 0..400 {
            tick(&sync, &mut driver, -0.45);
        }

        let mut last = sync.get_sync_state().tempo_correction_factor;
        assert!((last - 0.995).abs() < EPS);

        sync.enable_sync(false);
        let factor = tick(&sync, &mut driver, -0.45).tempo_correction_factor;
        assert!((factor - last).abs() <= 0.0005 + EPS);
        last = factor;

        sync.enable_sync(true);
        assert_eq!(sync.get_sync_state().mode, SyncMode::Locking);
        for error in [0.3, 0.3, 0.3, -0.1, 0.0, 0.0, 0.2] {
            for _ in 0..20 {
                let factor = tick(&sync, &mut driver, error).tempo_correction_factor;
                assert!((factor - last).abs() <= 0.0005 + EPS);
                last = factor;
            }
        }
    }

    #[test]
    fn test_skipped_ticks() {
        let (sync, mut driver) = bound_sync();
        sync.enable_sync(true);
        let first = tick(&sync, &mut driver, 0.1);

        // Same timestamp again: skipped
        let now = driver.clock().now();
        assert_eq!(sync.update(0.0, 128.0, 0.3, 128.0, now), first);

        // Invalid tempo: skipped
        driver.advance(DT);
        let now = driver.clock().now();
        assert_eq!(sync.update(0.0, 0.0, 0.3, 128.0, now), first);
        assert_eq!(sync.update(f64::NAN, 128.0, 0.3, 128.0, now), first);
    }

    #[test]
    fn test_large_dt_is_capped() {
        let (sync, mut driver) = bound_sync();
        sync.enable_sync(true);
        tick(&sync, &mut driver, 0.01);

        // A 10 s stall integrates at most max_dt worth of error
        driver.advance(10.0);
        let before = sync.diagnostics().integral_term;
        let now = driver.clock().now();
        sync.update(0.0, 128.0, 0.01, 128.0, now);
        let after = sync.diagnostics().integral_term;
        assert!((after - before - 0.01 * 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_enable_request_during_update_is_applied_next_tick() {
        let (sync, mut driver) = bound_sync();
        sync.enable_sync(true);
        tick(&sync, &mut driver, 0.2);

        {
            // Simulate an update in flight
            let _guard = sync.core.lock();
            sync.enable_sync(false);
            assert_eq!(sync.get_sync_state().mode, SyncMode::Locking);
        }

        let state = tick(&sync, &mut driver, 0.2);
        assert_eq!(state.mode, SyncMode::Disabled);
    }

    #[test]
    fn test_rebind_while_update_in_flight() {
        let (sync, mut driver) = bound_sync();
        let sync = Arc::new(sync);
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);

        let guard = sync.core.lock();
        let worker = {
            let sync = Arc::clone(&sync);
            std::thread::spawn(move || {
                sync.set_decks(DeckId(2), DeckId(0)).unwrap();
                let pair = sync.decks();
                sync.enable_sync(true);
                done_tx.send(pair).unwrap();
            })
        };
        let pair = done_rx.recv_timeout(std::time::Duration::from_secs(1));
        drop(guard);
        worker.join().unwrap();

        assert_eq!(pair, Ok((Some(DeckId(2)), Some(DeckId(0)))));
        assert_eq!(sync.get_sync_state().mode, SyncMode::Disabled);
        let state = tick(&sync, &mut driver, 0.1);
        assert_eq!(state.mode, SyncMode::Locking);
        assert_eq!(sync.diagnostics().target, Some(DeckId(2)));
    }

    #[test]
    fn test_rebind_drops_older_enable() {
        let (sync, mut driver) = bound_sync();
        {
            let _guard = sync.core.lock();
            sync.enable_sync(true);
            sync.set_decks(DeckId(2), DeckId(0)).unwrap();
        }
        assert_eq!(tick(&sync, &mut driver, 0.1).mode, SyncMode::Disabled);
    }

    #[test]
    fn test_stream_restart_cancels_pending_enable() {
        let (sync, mut driver) = bound_sync();
        {
            let _guard = sync.core.lock();
            sync.enable_sync(true);
            sync.reset_for_stream_restart();
        }
        assert_eq!(tick(&sync, &mut driver, 0.1).mode, SyncMode::Disabled);

        {
            let _guard = sync.core.lock();
            sync.reset_for_stream_restart();
            sync.enable_sync(true);
        }
        assert_eq!(tick(&sync, &mut driver, 0.1).mode, SyncMode::Locking);
    }

    #[test]
    fn test_stream_restart_hard_reset() {
        let (sync, mut driver) = bound_sync();
        sync.enable_sync(true);
        for _ in 0..50 {
            tick(&sync, &mut driver, 0.3);
        }
        assert!(sync.get_sync_state().tempo_correction_factor > 1.0);

        sync.reset_for_stream_restart();
        let state = sync.get_sync_state();
        assert_eq!(state.mode, SyncMode::Disabled);
        assert_eq!(state.tempo_correction_factor, 1.0);
        assert_eq!(state.integral_term, 0.0);
        assert_eq!(sync.diagnostics().saturation_seconds, 0.0);
    }

    #[test]
    fn test_quality_outlier_bounded() {
        let (sync, mut driver) = bound_sync();
        sync.enable_sync(true);
        for _ in 0..600 {
            tick(&sync, &mut driver, 0.001);
        }
        let before = sync.get_sync_state().sync_quality;
        let after = tick(&sync, &mut driver, 0.45).sync_quality;
        assert!((before - after).abs() <= 0.1 + EPS);
    }

    #[test]
    fn test_lock_128_to_127_with_offset() {
        let (clock, mut driver) = MasterClock::new(128.0, 48000);
        let sync = TempoPhaseSync::new(Arc::clone(&clock));
        sync.set_decks(DeckId(1), DeckId(0)).unwrap();
        sync.enable_sync(true);

        let master_bpm = 128.0;
        let target_bpm = 127.0;
        let mut master_beats = 0.2;
        let mut target_beats = 0.0;
        let mut state = sync.get_sync_state();
        let mut seen_locked_at = None;

        for i in 0..4000 {
            driver.advance(DT);
            master_beats += master_bpm / 60.0 * DT;
            target_beats += target_bpm / 60.0 * state.playback_rate() * DT;

            state = sync.update(target_beats, target_bpm, master_beats, master_bpm, clock.now());
            if state.mode == SyncMode::Locked && seen_locked_at.is_none() {
                seen_locked_at = Some(i);
            }
        }

        assert!(seen_locked_at.is_some(), "never locked");
        assert_eq!(state.mode, SyncMode::Locked);
        assert!(state.phase_offset_beats.abs() < 0.02);
        assert!((state.tempo_ratio - 128.0 / 127.0).abs() < EPS);
        assert!(state.grade() >= QualityGrade::Good);
    }

    #[test]
    fn test_adaptive_gain_counts_history() {
        let (sync, mut driver) = bound_sync();
        sync.set_adaptive_gain(true);
        sync.enable_sync(true);
        for _ in 0..30 {
            tick(&sync, &mut driver, 0.01);
        }
        assert_eq!(sync.diagnostics().error_history_len, 20);
    }

    #[test]
    fn test_config_validation() {
        assert!(SyncConfig::default().validate().is_ok());

        let bad = SyncConfig {
            lock_tolerance: 0.2,
            unlock_tolerance: 0.1,
            ..SyncConfig::default()
        };
        assert!(bad.validate().is_err());

        let bad = SyncConfig {
            max_dt: 0.0,
            ..SyncConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_large_error_unlocks_then_reacquires() {
        let (sync, mut driver) = bound_sync();
        lock(&sync, &mut driver);

        assert_eq!(tick(&sync, &mut driver, 0.3).mode, SyncMode::Unstable);

        let mut modes = vec![SyncMode::Unstable];
        for _ in 0..200 {
            let mode = tick(&sync, &mut driver, 0.0).mode;
            if modes.last() != Some(&mode) {
                modes.push(mode);
            }
        }
        assert_eq!(
            modes,
            [SyncMode::Unstable, SyncMode::Locking, SyncMode::Locked]
        );
    }

    #[test]
    fn test_sustained_saturation_unlocks() {
        let (sync, mut driver) = bound_sync();
        lock(&sync, &mut driver);

        // Inside unlock tolerance but enough to pin the output at the limit
        for _ in 0..95 {
            tick(&sync, &mut driver, 0.08);
        }
        assert_eq!(sync.get_sync_state().mode, SyncMode::Locked);

        for _ in 0..10 {
            tick(&sync, &mut driver, 0.08);
        }
        assert_eq!(sync.get_sync_state().mode, SyncMode::Unstable);
        assert!(sync.diagnostics().saturation_seconds >= 5.0);
    }

    #[test]
    fn test_hysteresis_holds_small_moves() {
        let (sync, mut driver) = bound_sync();
        sync.enable_sync(true);
        for _ in 0..20 {
            tick(&sync, &mut driver, 0.001);
        }
        assert_eq!(sync.get_sync_state().tempo_correction_factor, 1.0);

        let (sync, mut driver) = bound_sync_with(SyncConfig {
            hysteresis_threshold: 0.0,
            ..SyncConfig::default()
        });
        sync.enable_sync(true);
        for _ in 0..20 {
            tick(&sync, &mut driver, 0.001);
        }
        assert!(sync.get_sync_state().tempo_correction_factor > 1.0);
    }

    #[test]
    fn test_saturation_dwell_forces_move() {
        // Threshold wider than the whole band: only the dwell can move the factor
        let (sync, mut driver) = bound_sync_with(SyncConfig {
            hysteresis_threshold: 0.01,
            ..SyncConfig::default()
        });
        sync.enable_sync(true);
        for _ in 0..3 {
            tick(&sync, &mut driver, 0.3);
        }
        assert_eq!(sync.get_sync_state().tempo_correction_factor, 1.0);

        for _ in 0..7 {
            tick(&sync, &mut driver, 0.3);
        }
        assert!(sync.get_sync_state().tempo_correction_factor > 1.0);
    }

    #[test]
    fn test_min_update_interval_skips_fast_ticks() {
        let (sync, mut driver) = bound_sync_with(SyncConfig {
            min_update_interval: 0.1,
            ..SyncConfig::default()
        });
        sync.enable_sync(true);
        let update = |driver: &mut ClockDriver, dt: f64| {
            driver.advance(dt);
            sync.update(0.0, 128.0, 0.1, 128.0, driver.clock().now());
            sync.diagnostics().update_count
        };

        assert_eq!(update(&mut driver, 0.05), 0);
        assert_eq!(update(&mut driver, 0.06), 1);
        assert_eq!(update(&mut driver, 0.05), 1);
        assert_eq!(update(&mut driver, 0.06), 2);
    }

    #[test]
    fn test_graded_band_per_grade() {
        let limit = MAX_CORRECTION_LIMIT;
        assert_eq!(graded_band(QualityGrade::Excellent, limit), 0.0005);
        assert_eq!(graded_band(QualityGrade::Good, limit), 0.001);
        assert_eq!(graded_band(QualityGrade::Fair, limit), 0.002);
        assert_eq!(graded_band(QualityGrade::Poor, limit), limit);
        assert_eq!(graded_band(QualityGrade::Fair, 0.001), 0.001);
    }

    #[test]
    fn test_graded_limit_narrows_band_when_locked() {
        let first_move = |graded_limit: bool| {
            let (sync, mut driver) = bound_sync_with(SyncConfig {
                graded_limit,
                hysteresis_threshold: 0.0,
                max_slew_per_second: 1.0,
                ..SyncConfig::default()
            });
            sync.enable_sync(true);
            for _ in 0..200 {
                tick(&sync, &mut driver, 0.0);
            }
            assert_eq!(sync.get_sync_state().grade(), QualityGrade::Excellent);
            tick(&sync, &mut driver, 0.2).tempo_correction_factor - 1.0
        };

        assert!((first_move(true) - 0.0005).abs() < EPS);
        assert!((first_move(false) - 0.005).abs() < EPS);
    }
}

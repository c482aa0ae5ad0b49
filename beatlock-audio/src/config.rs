//! Configuration persistence for beatlock
//!
//! Stored as plain `key=value` lines with `#` comments. Every key has a
//! default; unknown keys are ignored so older files keep loading.

use crate::sync::{SyncConfig, SyncError};
use crate::timestretcher::{QualityMode, StretchConfig, StretchError};
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Errors loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error("invalid sync settings: {0}")]
    Sync(#[from] SyncError),
    #[error("invalid stretch settings: {0}")]
    Stretch(#[from] StretchError),
    #[error("invalid setting: {0}")]
    Invalid(String),
}

/// Application configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub sample_rate: u32,
    pub sync: SyncConfig,
    pub stretch: StretchConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            sync: SyncConfig::default(),
            stretch: StretchConfig::default(),
        }
    }
}

fn parse_value<T: FromStr>(line: usize, key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Parse {
        line,
        message: format!("bad value for {key}: {value:?}"),
    })
}

impl Config {
    /// Load config from the default location
    ///
    /// Returns the default config if the file doesn't exist. A file that
    /// exists but fails to parse or validate is reported.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path();
        match Self::load_from(&path) {
            Err(ConfigError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                Ok(Self::default())
            }
            other => other,
        }
    }

    /// Load and validate config from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config = Self::parse(&content)?;
        tracing::info!(path = %path.display(), "config loaded");
        Ok(config)
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    /// Save config to a specific path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.serialize())?;
        Ok(())
    }

    /// Get the default config file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("beatlock")
            .join("config.txt")
    }

    /// Parse and validate config from the `key=value` format
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for (idx, raw) in content.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::Parse {
                    line: line_no,
                    message: format!("expected key=value, got {line:?}"),
                });
            };
            let key = key.trim();
            let value = value.trim();
            let s = &mut config.sync;

            match key {
                "sample_rate" => config.sample_rate = parse_value(line_no, key, value)?,
                "quality_mode" => {
                    config.stretch.quality_mode =
                        QualityMode::from_name(value).ok_or_else(|| ConfigError::Parse {
                            line: line_no,
                            message: format!("unknown quality_mode {value:?}"),
                        })?;
                }
                "block_size" => config.stretch.block_size = parse_value(line_no, key, value)?,
                "correction_limit" => s.correction_limit = parse_value(line_no, key, value)?,
                "hysteresis_threshold" => {
                    s.hysteresis_threshold = parse_value(line_no, key, value)?
                }
                "saturation_dwell" => s.saturation_dwell = parse_value(line_no, key, value)?,
                "max_slew_per_second" => s.max_slew_per_second = parse_value(line_no, key, value)?,
                "kp" => s.kp = parse_value(line_no, key, value)?,
                "ki" => s.ki = parse_value(line_no, key, value)?,
                "kd" => s.kd = parse_value(line_no, key, value)?,
                "derivative_smoothing" => {
                    s.derivative_smoothing = parse_value(line_no, key, value)?
                }
                "lock_tolerance" => s.lock_tolerance = parse_value(line_no, key, value)?,
                "lock_window" => s.lock_window = parse_value(line_no, key, value)?,
                "unlock_tolerance" => s.unlock_tolerance = parse_value(line_no, key, value)?,
                "saturation_timeout" => s.saturation_timeout = parse_value(line_no, key, value)?,
                "ramp_out_seconds" => s.ramp_out_seconds = parse_value(line_no, key, value)?,
                "min_update_interval" => s.min_update_interval = parse_value(line_no, key, value)?,
                "max_dt" => s.max_dt = parse_value(line_no, key, value)?,
                "quality_tau" => s.quality_tau = parse_value(line_no, key, value)?,
                "quality_recovery_per_second" => {
                    s.quality_recovery_per_second = parse_value(line_no, key, value)?
                }
                "quality_error_scale" => s.quality_error_scale = parse_value(line_no, key, value)?,
                "adaptive_gain" => s.adaptive_gain = parse_value(line_no, key, value)?,
                "graded_limit" => s.graded_limit = parse_value(line_no, key, value)?,
                _ => tracing::debug!(key, "ignoring unknown config key"),
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Check every setting's range
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(8000..=384_000).contains(&self.sample_rate) {
            return Err(ConfigError::Invalid(format!(
                "sample_rate must be in 8000..=384000, got {}",
                self.sample_rate
            )));
        }
        self.sync.validate()?;
        self.stretch.validate()?;
        Ok(())
    }

    /// Serialize config to the `key=value` format
    fn serialize(&self) -> String {
        let s = &self.sync;
        let mut out = String::from("# beatlock configuration\n");
        let entries: [(&str, String); 23] = [
            ("sample_rate", self.sample_rate.to_string()),
            ("quality_mode", self.stretch.quality_mode.name().to_string()),
            ("block_size", self.stretch.block_size.to_string()),
            ("correction_limit", s.correction_limit.to_string()),
            ("hysteresis_threshold", s.hysteresis_threshold.to_string()),
            ("saturation_dwell", s.saturation_dwell.to_string()),
            ("max_slew_per_second", s.max_slew_per_second.to_string()),
            ("kp", s.kp.to_string()),
            ("ki", s.ki.to_string()),
            ("kd", s.kd.to_string()),
            ("derivative_smoothing", s.derivative_smoothing.to_string()),
            ("lock_tolerance", s.lock_tolerance.to_string()),
            ("lock_window", s.lock_window.to_string()),
            ("unlock_tolerance", s.unlock_tolerance.to_string()),
            ("saturation_timeout", s.saturation_timeout.to_string()),
            ("ramp_out_seconds", s.ramp_out_seconds.to_string()),
            ("min_update_interval", s.min_update_interval.to_string()),
            ("max_dt", s.max_dt.to_string()),
            ("quality_tau", s.quality_tau.to_string()),
            (
                "quality_recovery_per_second",
                s.quality_recovery_per_second.to_string(),
            ),
            ("quality_error_scale", s.quality_error_scale.to_string()),
            ("adaptive_gain", s.adaptive_gain.to_string()),
            ("graded_limit", s.graded_limit.to_string()),
        ];
        for (key, value) in entries {
            let _ = writeln!(out, "{key}={value}");
        }
        out
    }
}

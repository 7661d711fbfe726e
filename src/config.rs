//! Engine configuration
//!
//! Every section deserializes with defaults filled in, so a config file only
//! needs to name the values it overrides.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Settle window after tagging a song before readings count
pub const SETTLE_DURATION_MS: i64 = 15_000;

/// Minimum post-settle listening time for a valid result
pub const MIN_RECORDING_SEC: u64 = 60;

/// Highest tachogram resampling rate accepted
pub const MAX_RESAMPLE_HZ: f64 = 32.0;

/// Closed frequency interval in Hz
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrequencyBand {
    pub low_hz: f64,
    pub high_hz: f64,
}

impl FrequencyBand {
    pub const fn new(low_hz: f64, high_hz: f64) -> Self {
        Self { low_hz, high_hz }
    }

    pub fn contains(&self, freq_hz: f64) -> bool {
        freq_hz >= self.low_hz && freq_hz <= self.high_hz
    }
}

/// HRV processor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HrvConfig {
    /// Shortest plausible RR interval (ms); 200 bpm
    pub min_rr_ms: i32,
    /// Longest plausible RR interval (ms); 30 bpm
    pub max_rr_ms: i32,
    /// Maximum summed duration of buffered intervals (ms)
    pub window_span_ms: i64,
    /// Intervals required before a snapshot is produced
    pub min_intervals: usize,
    /// Tachogram resampling rate (Hz)
    pub resample_hz: f64,
    pub coherence_band: FrequencyBand,
    /// Reference band for total power; the DC bin is always excluded
    pub total_band: FrequencyBand,
    /// Flush the window when batches arrive further apart than this
    pub max_batch_gap_ms: Option<i64>,
}

impl Default for HrvConfig {
    fn default() -> Self {
        Self {
            min_rr_ms: 300,
            max_rr_ms: 2000,
            window_span_ms: 64_000,
            min_intervals: 32,
            resample_hz: 4.0,
            coherence_band: FrequencyBand::new(0.04, 0.26),
            total_band: FrequencyBand::new(0.0, 0.4),
            max_batch_gap_ms: Some(10_000),
        }
    }
}

/// Session state machine settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub settle_duration_ms: i64,
    pub min_recording_sec: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            settle_duration_ms: SETTLE_DURATION_MS,
            min_recording_sec: MIN_RECORDING_SEC,
        }
    }
}

/// Movement gate settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MovementConfig {
    /// Mean linear acceleration (m/s²) above which the wearer counts as moving.
    /// At rest ~0.0-0.1, fidgeting ~0.3-0.5, walking >1.0.
    pub threshold: f64,
    /// Rolling window length in samples
    pub window_size: usize,
    /// Samples required before any decision is made
    pub min_samples: usize,
}

impl Default for MovementConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            window_size: 10,
            min_samples: 3,
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub hrv: HrvConfig,
    pub session: SessionConfig,
    pub movement: MovementConfig,
}

impl CoreConfig {
    /// Load and validate a configuration from JSON
    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        let config: CoreConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to JSON
    pub fn to_json(&self) -> Result<String, CoreError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<(), CoreError> {
        let hrv = &self.hrv;
        if hrv.min_rr_ms <= 0 || hrv.min_rr_ms >= hrv.max_rr_ms {
            return Err(CoreError::InvalidConfig(format!(
                "RR bounds must satisfy 0 < min_rr_ms < max_rr_ms (got {}..{})",
                hrv.min_rr_ms, hrv.max_rr_ms
            )));
        }
        if hrv.min_intervals < 2 {
            return Err(CoreError::InvalidConfig(
                "min_intervals must be at least 2".to_string(),
            ));
        }
        if hrv.window_span_ms < i64::from(hrv.max_rr_ms) {
            return Err(CoreError::InvalidConfig(
                "window_span_ms must hold at least one maximal RR interval".to_string(),
            ));
        }
        if !hrv.resample_hz.is_finite()
            || hrv.resample_hz <= 0.0
            || hrv.resample_hz > MAX_RESAMPLE_HZ
        {
            return Err(CoreError::InvalidConfig(format!(
                "resample_hz must be in (0, {MAX_RESAMPLE_HZ}] (got {})",
                hrv.resample_hz
            )));
        }
        for (name, band) in [
            ("coherence_band", hrv.coherence_band),
            ("total_band", hrv.total_band),
        ] {
            if band.low_hz < 0.0 || band.low_hz >= band.high_hz {
                return Err(CoreError::InvalidConfig(format!(
                    "{name} must satisfy 0 <= low_hz < high_hz"
                )));
            }
            if band.high_hz > hrv.resample_hz / 2.0 {
                return Err(CoreError::InvalidConfig(format!(
                    "{name} exceeds the Nyquist frequency of the tachogram"
                )));
            }
        }
        if self.session.settle_duration_ms < 0 {
            return Err(CoreError::InvalidConfig(
                "settle_duration_ms must not be negative".to_string(),
            ));
        }
        if self.movement.window_size == 0 || self.movement.min_samples > self.movement.window_size
        {
            return Err(CoreError::InvalidConfig(
                "movement min_samples must fit inside a non-empty window".to_string(),
            ));
        }
        Ok(())
    }
}

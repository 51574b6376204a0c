//! Controller configuration
//!
//! All knobs are optional with the defaults below; unknown fields are a
//! construction-time error when deserializing.

use anyhow::Result;
use serde::Deserialize;

/// Emergency absolute limits; at or above any of these the engine clamps to 1.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EmergencyLimits {
    pub cpu_temp: f64,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub gpu_temp: f64,
    pub gpu_usage: f64,
}

impl Default for EmergencyLimits {
    fn default() -> Self {
        Self {
            cpu_temp: 95.0,
            cpu_usage: 98.0,
            memory_usage: 95.0,
            gpu_temp: 95.0,
            gpu_usage: 98.0,
        }
    }
}

/// Soft thresholds; crossing these marks a tick near-emergency and starts
/// penalizing predicted load in the reward function.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HighThresholds {
    pub cpu_usage: f64,
    pub cpu_temp: f64,
    pub memory_usage: f64,
    pub gpu_temp: f64,
    pub gpu_usage: f64,
}

impl Default for HighThresholds {
    fn default() -> Self {
        Self {
            cpu_usage: 85.0,
            cpu_temp: 85.0,
            memory_usage: 85.0,
            gpu_temp: 85.0,
            gpu_usage: 85.0,
        }
    }
}

/// Gains for the PID term of the decision blend.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PidGains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    /// Target CPU usage percentage.
    pub setpoint: f64,
}

impl Default for PidGains {
    fn default() -> Self {
        Self {
            kp: 0.5,
            ki: 0.05,
            kd: 0.1,
            setpoint: 90.0,
        }
    }
}

/// Controller configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ControllerConfig {
    /// Hard concurrency cap. Absent means autotune with no fixed ceiling.
    pub max_threads: Option<u32>,

    /// Supervisor tick interval in milliseconds.
    pub monitoring_interval_ms: u64,

    /// Telemetry ring retention by age.
    pub max_history_age_minutes: u64,

    /// Telemetry ring retention by count.
    pub max_data_points: usize,

    /// Completed-request ring size in the admission manager.
    pub max_history_size: usize,

    /// Performance ring size.
    pub max_performance_history: usize,

    pub emergency_limits: EmergencyLimits,
    pub high_thresholds: HighThresholds,
    pub pid: PidGains,

    /// Minimum gap between scaling decisions. Absent means derived as
    /// `min(10000, 2 * thermal_constant_ms)` once history allows, 10000 before.
    pub scale_cooldown_ms: Option<u64>,

    /// Retention for the durable scaling log, in hours.
    pub scaling_history_retention_hours: f64,

    /// Floor for the scale-up validation window derivation.
    pub min_data_window_ms: u64,

    /// Persist usage/scaling history to the platform data directory.
    pub persistence_enabled: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_threads: None,
            monitoring_interval_ms: 1_000,
            max_history_age_minutes: 5,
            max_data_points: 300,
            max_history_size: 100,
            max_performance_history: 200,
            emergency_limits: EmergencyLimits::default(),
            high_thresholds: HighThresholds::default(),
            pid: PidGains::default(),
            scale_cooldown_ms: None,
            scaling_history_retention_hours: 1.0 / 3.0,
            min_data_window_ms: 10_000,
            persistence_enabled: false,
        }
    }
}

impl ControllerConfig {
    /// Load configuration from the environment (prefix `THREADER`), falling
    /// back to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("THREADER"))
            .build()?;

        Ok(config.try_deserialize().unwrap_or_default())
    }

    /// The effective cooldown before thermal history exists.
    pub fn base_cooldown_ms(&self) -> u64 {
        self.scale_cooldown_ms.unwrap_or(10_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = ControllerConfig::default();
        assert_eq!(c.monitoring_interval_ms, 1_000);
        assert_eq!(c.max_data_points, 300);
        assert_eq!(c.max_history_size, 100);
        assert_eq!(c.max_performance_history, 200);
        assert_eq!(c.emergency_limits.cpu_temp, 95.0);
        assert_eq!(c.high_thresholds.cpu_usage, 85.0);
        assert_eq!(c.pid.setpoint, 90.0);
        assert!(c.max_threads.is_none());
        assert_eq!(c.base_cooldown_ms(), 10_000);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = serde_json::from_str::<ControllerConfig>(r#"{"max_threds": 4}"#);
        assert!(err.is_err());
    }

    #[test]
    fn partial_config_fills_defaults() {
        let c: ControllerConfig =
            serde_json::from_str(r#"{"max_threads": 8, "monitoring_interval_ms": 250}"#).unwrap();
        assert_eq!(c.max_threads, Some(8));
        assert_eq!(c.monitoring_interval_ms, 250);
        assert_eq!(c.max_data_points, 300);
    }
}

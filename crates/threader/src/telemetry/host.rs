//! Linux host probe
//!
//! Reads host metrics from the standard kernel interfaces:
//! - /proc/stat for aggregate CPU load (delta between consecutive samples)
//! - /proc/meminfo for memory pressure
//! - /sys/class/hwmon for CPU temperature sensors
//! - /sys/class/drm for the primary GPU controller, when one exists

use super::TelemetrySource;
use crate::models::TelemetrySample;
use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

/// Hwmon chip names treated as CPU temperature sources.
const CPU_HWMON_NAMES: &[&str] = &["coretemp", "k10temp", "zenpower", "cpu_thermal"];

/// Hwmon chip names treated as GPU temperature sources.
const GPU_HWMON_NAMES: &[&str] = &["amdgpu", "nouveau", "nvidia"];

/// Raw jiffy counters from the aggregate cpu line of /proc/stat.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct CpuCounters {
    pub busy: u64,
    pub total: u64,
}

/// Telemetry probe backed by procfs and sysfs.
pub struct HostTelemetrySource {
    proc_root: PathBuf,
    hwmon_root: PathBuf,
    drm_root: PathBuf,
    prev_cpu: Mutex<Option<CpuCounters>>,
}

impl HostTelemetrySource {
    pub fn new() -> Self {
        Self::with_roots("/proc", "/sys/class/hwmon", "/sys/class/drm")
    }

    /// Probe with custom filesystem roots (for testing).
    pub fn with_roots(
        proc_root: impl Into<PathBuf>,
        hwmon_root: impl Into<PathBuf>,
        drm_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            proc_root: proc_root.into(),
            hwmon_root: hwmon_root.into(),
            drm_root: drm_root.into(),
            prev_cpu: Mutex::new(None),
        }
    }

    /// Parse the aggregate "cpu " line of /proc/stat.
    pub(crate) fn parse_proc_stat(content: &str) -> Option<CpuCounters> {
        let line = content.lines().find(|l| l.starts_with("cpu "))?;
        let fields: Vec<u64> = line
            .split_whitespace()
            .skip(1)
            .filter_map(|f| f.parse().ok())
            .collect();
        if fields.len() < 4 {
            return None;
        }

        let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
        let total: u64 = fields.iter().sum();
        Some(CpuCounters {
            busy: total.saturating_sub(idle),
            total,
        })
    }

    /// Parse MemTotal/MemAvailable from /proc/meminfo into a used percentage.
    pub(crate) fn parse_meminfo(content: &str) -> Option<f64> {
        let mut total = None;
        let mut available = None;

        for line in content.lines() {
            let mut parts = line.split_whitespace();
            match parts.next() {
                Some("MemTotal:") => total = parts.next().and_then(|v| v.parse::<u64>().ok()),
                Some("MemAvailable:") => {
                    available = parts.next().and_then(|v| v.parse::<u64>().ok())
                }
                _ => {}
            }
        }

        match (total, available) {
            (Some(t), Some(a)) if t > 0 => Some((1.0 - a as f64 / t as f64) * 100.0),
            _ => None,
        }
    }

    /// CPU usage percentage from the delta of two counter readings.
    pub(crate) fn cpu_usage_from_delta(prev: CpuCounters, curr: CpuCounters) -> Option<f64> {
        let total = curr.total.saturating_sub(prev.total);
        if total == 0 {
            return None;
        }
        let busy = curr.busy.saturating_sub(prev.busy);
        Some((busy as f64 / total as f64 * 100.0).clamp(0.0, 100.0))
    }

    async fn sample_cpu_usage(&self) -> Option<f64> {
        let content = fs::read_to_string(self.proc_root.join("stat")).await.ok()?;
        let curr = Self::parse_proc_stat(&content)?;

        let mut prev = self.prev_cpu.lock().await;
        let usage = prev.and_then(|p| Self::cpu_usage_from_delta(p, curr));
        *prev = Some(curr);
        usage
    }

    async fn sample_mem_usage(&self) -> Option<f64> {
        let content = fs::read_to_string(self.proc_root.join("meminfo"))
            .await
            .ok()?;
        Self::parse_meminfo(&content)
    }

    /// Mean over the present members of (package sensor, per-core sensors,
    /// max sensor) of the first matching hwmon chip.
    async fn sample_cpu_temp(&self) -> Option<f64> {
        let chip = self.find_hwmon_chip(CPU_HWMON_NAMES).await?;
        let readings = read_temp_inputs(&chip).await;
        if readings.is_empty() {
            return None;
        }

        let mut values: Vec<f64> = Vec::new();
        for (label, value) in &readings {
            let label = label.to_ascii_lowercase();
            if label.contains("package") || label.contains("tdie") || label.contains("tctl") {
                values.push(*value);
            } else if label.contains("core") {
                values.push(*value);
            }
        }
        // The max reading participates even when no labeled sensors exist.
        if let Some(max) = readings
            .iter()
            .map(|(_, v)| *v)
            .max_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        {
            values.push(max);
        }

        mean(&values)
    }

    async fn sample_gpu(&self) -> (Option<f64>, Option<f64>) {
        let usage = self.sample_gpu_usage().await;
        let temp = self.sample_gpu_temp().await;
        (usage, temp)
    }

    /// Busy percentage of the primary GPU controller, when one is exposed.
    async fn sample_gpu_usage(&self) -> Option<f64> {
        let mut dir = fs::read_dir(&self.drm_root).await.ok()?;
        while let Ok(Some(entry)) = dir.next_entry().await {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            // Primary controllers are cardN, not connector nodes like card0-DP-1.
            if !name.starts_with("card") || name.contains('-') {
                continue;
            }
            let busy_file = entry.path().join("device/gpu_busy_percent");
            if let Ok(content) = fs::read_to_string(&busy_file).await {
                if let Ok(v) = content.trim().parse::<f64>() {
                    return Some(v.clamp(0.0, 100.0));
                }
            }
        }
        None
    }

    async fn sample_gpu_temp(&self) -> Option<f64> {
        let chip = self.find_hwmon_chip(GPU_HWMON_NAMES).await?;
        let readings = read_temp_inputs(&chip).await;
        let values: Vec<f64> = readings.into_iter().map(|(_, v)| v).collect();
        mean(&values)
    }

    /// Find the first hwmon chip whose name file matches one of `names`.
    async fn find_hwmon_chip(&self, names: &[&str]) -> Option<PathBuf> {
        let mut dir = fs::read_dir(&self.hwmon_root).await.ok()?;
        while let Ok(Some(entry)) = dir.next_entry().await {
            let name_file = entry.path().join("name");
            if let Ok(chip_name) = fs::read_to_string(&name_file).await {
                let chip_name = chip_name.trim();
                if names.iter().any(|n| chip_name.starts_with(n)) {
                    return Some(entry.path());
                }
            }
        }
        None
    }
}

impl Default for HostTelemetrySource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TelemetrySource for HostTelemetrySource {
    async fn sample(&self) -> TelemetrySample {
        let ts = Utc::now().timestamp_millis();

        let cpu_usage = self.sample_cpu_usage().await;
        let cpu_temp = self.sample_cpu_temp().await;
        let mem_usage = self.sample_mem_usage().await;
        let (gpu_usage, gpu_temp) = self.sample_gpu().await;

        if cpu_usage.is_none() && cpu_temp.is_none() && mem_usage.is_none() {
            debug!("Host probe produced no CPU or memory readings");
        }

        TelemetrySample {
            ts,
            cpu_usage,
            cpu_temp,
            mem_usage,
            gpu_usage,
            gpu_temp,
        }
    }
}

/// Read all tempN_input files of a chip, in degrees Celsius, paired with
/// their tempN_label contents (empty string when unlabeled).
async fn read_temp_inputs(chip: &Path) -> Vec<(String, f64)> {
    let mut readings = Vec::new();
    let mut dir = match fs::read_dir(chip).await {
        Ok(d) => d,
        Err(_) => return readings,
    };

    while let Ok(Some(entry)) = dir.next_entry().await {
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        let Some(sensor) = file_name
            .strip_suffix("_input")
            .filter(|s| s.starts_with("temp"))
        else {
            continue;
        };

        let Ok(raw) = fs::read_to_string(entry.path()).await else {
            continue;
        };
        let Ok(millidegrees) = raw.trim().parse::<f64>() else {
            continue;
        };

        let label = fs::read_to_string(chip.join(format!("{sensor}_label")))
            .await
            .map(|s| s.trim().to_string())
            .unwrap_or_default();

        readings.push((label, millidegrees / 1000.0));
    }

    readings
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

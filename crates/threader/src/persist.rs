//! Durable usage and scaling history
//!
//! Three logical relations: usage history, scaling history and per-kind
//! operation profiles. The file backend keeps the first two as JSON lines
//! and the profiles as a single JSON document under the platform data
//! directory. When the backend cannot be opened the controller keeps an
//! in-memory store instead; recording never fails the caller.

use crate::models::{OperationProfile, ScalingRecord, UsageRecord};
use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

const USAGE_FILE: &str = "usage_history.jsonl";
const SCALING_FILE: &str = "scaling_history.jsonl";
const PROFILES_FILE: &str = "operation_profiles.json";

/// Retention bounds for the durable relations.
#[derive(Debug, Clone, Copy)]
pub struct Retention {
    pub usage_max_age_ms: i64,
    pub scaling_max_age_ms: i64,
}

/// Write-side interface for the durable store.
///
/// Recording is best-effort: backends log and swallow their own IO errors so
/// the control loop never dies on persistence trouble.
pub trait ScalingStore: Send + Sync {
    fn record_usage(&self, row: &UsageRecord);
    fn record_scaling(&self, row: &ScalingRecord);
    /// Fold one completed operation into its kind profile.
    fn record_operation(
        &self,
        kind: &str,
        duration_ms: f64,
        cpu: Option<f64>,
        gpu: Option<f64>,
        memory: Option<f64>,
        temperature: Option<f64>,
        ts: i64,
    );
    fn scaling_history(&self) -> Vec<ScalingRecord>;
    fn operation_profiles(&self) -> Vec<OperationProfile>;
    /// Apply age-based retention relative to `now_ms`.
    fn prune(&self, now_ms: i64);
}

/// Volatile fallback store.
pub struct InMemoryScalingStore {
    retention: Retention,
    usage: Mutex<Vec<UsageRecord>>,
    scaling: Mutex<Vec<ScalingRecord>>,
    profiles: Mutex<HashMap<String, OperationProfile>>,
}

impl InMemoryScalingStore {
    pub fn new(retention: Retention) -> Self {
        Self {
            retention,
            usage: Mutex::new(Vec::new()),
            scaling: Mutex::new(Vec::new()),
            profiles: Mutex::new(HashMap::new()),
        }
    }
}

impl ScalingStore for InMemoryScalingStore {
    fn record_usage(&self, row: &UsageRecord) {
        self.usage
            .lock()
            .expect("usage mutex poisoned")
            .push(row.clone());
    }

    fn record_scaling(&self, row: &ScalingRecord) {
        self.scaling
            .lock()
            .expect("scaling mutex poisoned")
            .push(row.clone());
    }

    fn record_operation(
        &self,
        kind: &str,
        duration_ms: f64,
        cpu: Option<f64>,
        gpu: Option<f64>,
        memory: Option<f64>,
        temperature: Option<f64>,
        ts: i64,
    ) {
        let mut profiles = self.profiles.lock().expect("profiles mutex poisoned");
        profiles
            .entry(kind.to_string())
            .or_insert_with(|| OperationProfile::new(kind, ts))
            .fold(duration_ms, cpu, gpu, memory, temperature, ts);
    }

    fn scaling_history(&self) -> Vec<ScalingRecord> {
        self.scaling.lock().expect("scaling mutex poisoned").clone()
    }

    fn operation_profiles(&self) -> Vec<OperationProfile> {
        let profiles = self.profiles.lock().expect("profiles mutex poisoned");
        profiles.values().cloned().collect()
    }

    fn prune(&self, now_ms: i64) {
        let usage_cutoff = now_ms - self.retention.usage_max_age_ms;
        let scaling_cutoff = now_ms - self.retention.scaling_max_age_ms;
        self.usage
            .lock()
            .expect("usage mutex poisoned")
            .retain(|r| r.ts >= usage_cutoff);
        self.scaling
            .lock()
            .expect("scaling mutex poisoned")
            .retain(|r| r.ts >= scaling_cutoff);
    }
}

/// File-backed store: JSON lines for the history relations, one JSON
/// document for the profiles.
pub struct FileScalingStore {
    dir: PathBuf,
    retention: Retention,
    profiles: Mutex<HashMap<String, OperationProfile>>,
    io: Mutex<()>,
}

impl FileScalingStore {
    /// Open the store at `dir`, creating it and loading existing profiles.
    pub fn open(dir: impl Into<PathBuf>, retention: Retention) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create data directory {}", dir.display()))?;

        let profiles = match fs::read_to_string(dir.join(PROFILES_FILE)) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(error = %e, "Discarding unreadable operation profiles");
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };

        debug!(dir = %dir.display(), "Opened durable scaling store");
        Ok(Self {
            dir,
            retention,
            profiles: Mutex::new(profiles),
            io: Mutex::new(()),
        })
    }

    /// Open the store under the platform data directory
    /// (e.g. `$XDG_DATA_HOME/llm-threader`).
    pub fn open_default(retention: Retention) -> Result<Self> {
        let dirs = ProjectDirs::from("", "", "llm-threader")
            .context("No platform data directory available")?;
        Self::open(dirs.data_local_dir(), retention)
    }

    fn append_line<T: serde::Serialize>(&self, file: &str, row: &T) {
        let _io = self.io.lock().expect("io mutex poisoned");
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(file))
            .and_then(|mut f| {
                let line = serde_json::to_string(row).unwrap_or_default();
                writeln!(f, "{line}")
            });
        if let Err(e) = result {
            warn!(file, error = %e, "Failed to append history row");
        }
    }

    fn load_lines<T: serde::de::DeserializeOwned>(path: &Path) -> Vec<T> {
        let Ok(file) = File::open(path) else {
            return Vec::new();
        };
        BufReader::new(file)
            .lines()
            .map_while(|l| l.ok())
            .filter_map(|l| serde_json::from_str(&l).ok())
            .collect()
    }

    fn rewrite_filtered<T, F>(&self, file: &str, keep: F)
    where
        T: serde::Serialize + serde::de::DeserializeOwned,
        F: Fn(&T) -> bool,
    {
        let _io = self.io.lock().expect("io mutex poisoned");
        let path = self.dir.join(file);
        let rows: Vec<T> = Self::load_lines(&path);
        let kept: Vec<&T> = rows.iter().filter(|r| keep(r)).collect();
        if kept.len() == rows.len() {
            return;
        }

        let tmp = path.with_extension("tmp");
        let result = (|| -> std::io::Result<()> {
            let mut f = File::create(&tmp)?;
            for row in &kept {
                writeln!(f, "{}", serde_json::to_string(row).unwrap_or_default())?;
            }
            fs::rename(&tmp, &path)
        })();
        if let Err(e) = result {
            warn!(file, error = %e, "Failed to prune history file");
        }
    }

    fn save_profiles(&self) {
        let profiles = self.profiles.lock().expect("profiles mutex poisoned").clone();
        let _io = self.io.lock().expect("io mutex poisoned");
        let result = serde_json::to_string_pretty(&profiles)
            .map_err(std::io::Error::other)
            .and_then(|json| fs::write(self.dir.join(PROFILES_FILE), json));
        if let Err(e) = result {
            warn!(error = %e, "Failed to save operation profiles");
        }
    }
}

impl ScalingStore for FileScalingStore {
    fn record_usage(&self, row: &UsageRecord) {
        self.append_line(USAGE_FILE, row);
    }

    fn record_scaling(&self, row: &ScalingRecord) {
        self.append_line(SCALING_FILE, row);
    }

    fn record_operation(
        &self,
        kind: &str,
        duration_ms: f64,
        cpu: Option<f64>,
        gpu: Option<f64>,
        memory: Option<f64>,
        temperature: Option<f64>,
        ts: i64,
    ) {
        {
            let mut profiles = self.profiles.lock().expect("profiles mutex poisoned");
            profiles
                .entry(kind.to_string())
                .or_insert_with(|| OperationProfile::new(kind, ts))
                .fold(duration_ms, cpu, gpu, memory, temperature, ts);
        }
        self.save_profiles();
    }

    fn scaling_history(&self) -> Vec<ScalingRecord> {
        let _io = self.io.lock().expect("io mutex poisoned");
        Self::load_lines(&self.dir.join(SCALING_FILE))
    }

    fn operation_profiles(&self) -> Vec<OperationProfile> {
        let profiles = self.profiles.lock().expect("profiles mutex poisoned");
        profiles.values().cloned().collect()
    }

    fn prune(&self, now_ms: i64) {
        let usage_cutoff = now_ms - self.retention.usage_max_age_ms;
        let scaling_cutoff = now_ms - self.retention.scaling_max_age_ms;
        self.rewrite_filtered::<UsageRecord, _>(USAGE_FILE, |r| r.ts >= usage_cutoff);
        self.rewrite_filtered::<ScalingRecord, _>(SCALING_FILE, |r| r.ts >= scaling_cutoff);
    }
}

/// Open the default durable store, falling back to in-memory when the data
/// directory is unavailable. Logs the fallback once.
pub fn open_store(persistence_enabled: bool, retention: Retention) -> Box<dyn ScalingStore> {
    if persistence_enabled {
        match FileScalingStore::open_default(retention) {
            Ok(store) => return Box::new(store),
            Err(e) => {
                warn!(error = %e, "Durable store unavailable, keeping history in memory");
            }
        }
    }
    Box::new(InMemoryScalingStore::new(retention))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OperationMix;
    use tempfile::TempDir;

    fn retention() -> Retention {
        Retention {
            usage_max_age_ms: 5 * 60 * 1000,
            scaling_max_age_ms: 20 * 60 * 1000,
        }
    }

    fn usage_row(ts: i64) -> UsageRecord {
        UsageRecord {
            ts,
            cpu_usage: Some(50.0),
            cpu_temp: Some(70.0),
            memory_usage: Some(40.0),
            gpu_usage: None,
            gpu_temp: None,
            concurrent_threads: 4,
            active_threads: 3,
            queue_pressure: 1,
            operation_mix: OperationMix::default(),
            operation_intensity: 0.2,
        }
    }

    fn scaling_row(ts: i64, threads: u32) -> ScalingRecord {
        ScalingRecord {
            ts,
            thread_count: threads,
            cpu_usage: Some(50.0),
            gpu_usage: None,
            memory_usage: Some(40.0),
            temperature: Some(70.0),
            active_operations: 2,
            queue_length: 0,
            scaling_decision: "demand_scale_up".to_string(),
            pid_output: Some(4.0),
            bayes_optimization: Some(3.0),
            demand_score: Some(0.8),
        }
    }

    #[test]
    fn file_store_round_trips_scaling_rows() {
        let dir = TempDir::new().unwrap();
        let store = FileScalingStore::open(dir.path(), retention()).unwrap();

        store.record_scaling(&scaling_row(1_000, 2));
        store.record_scaling(&scaling_row(2_000, 3));

        let rows = store.scaling_history();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].thread_count, 3);
    }

    #[test]
    fn prune_drops_rows_past_retention() {
        let dir = TempDir::new().unwrap();
        let store = FileScalingStore::open(dir.path(), retention()).unwrap();

        store.record_scaling(&scaling_row(0, 2));
        store.record_scaling(&scaling_row(25 * 60 * 1000, 3));
        store.prune(25 * 60 * 1000);

        let rows = store.scaling_history();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].thread_count, 3);
    }

    #[test]
    fn profiles_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = FileScalingStore::open(dir.path(), retention()).unwrap();
            store.record_operation("inference", 120.0, Some(60.0), None, Some(30.0), None, 1);
            store.record_operation("inference", 80.0, Some(40.0), None, Some(50.0), None, 2);
        }

        let store = FileScalingStore::open(dir.path(), retention()).unwrap();
        let profiles = store.operation_profiles();
        assert_eq!(profiles.len(), 1);
        let p = &profiles[0];
        assert_eq!(p.count, 2);
        assert!((p.duration_avg_ms - 100.0).abs() < 1e-9);
        assert!((p.cpu_avg - 50.0).abs() < 1e-9);
    }

    #[test]
    fn corrupt_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let store = FileScalingStore::open(dir.path(), retention()).unwrap();
        store.record_usage(&usage_row(1_000));
        fs::write(
            dir.path().join(SCALING_FILE),
            "not json\n{\"also\": \"wrong shape\"}\n",
        )
        .unwrap();

        assert!(store.scaling_history().is_empty());
    }

    #[test]
    fn in_memory_store_prunes() {
        let store = InMemoryScalingStore::new(retention());
        store.record_usage(&usage_row(0));
        store.record_usage(&usage_row(6 * 60 * 1000));
        store.prune(6 * 60 * 1000);
        // only pruning scaling/usage by age; the second row survives
        store.record_scaling(&scaling_row(0, 2));
        store.prune(30 * 60 * 1000);
        assert!(store.scaling_history().is_empty());
    }

    #[test]
    fn open_store_falls_back_in_memory_when_disabled() {
        let store = open_store(false, retention());
        store.record_scaling(&scaling_row(1, 2));
        assert_eq!(store.scaling_history().len(), 1);
    }
}

//! Adaptive concurrency controller for expensive host-local workloads
//!
//! This crate provides the core functionality for:
//! - Host telemetry sampling (CPU load, temperatures, memory, optional GPU)
//! - A feedback loop blending PID, reward search and rule-based trends
//! - Priority admission with emergency bypass and deferred scale-down
//! - Bounded usage history with optional durable scaling logs
//!
//! Submit operations with [`Controller::execute`]; the supervisor tunes the
//! concurrency limit to maximize throughput under the configured ceilings.

pub mod admission;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod history;
pub mod models;
pub mod observability;
pub mod perf;
pub mod persist;
pub mod pid;
pub mod reward;
pub mod supervisor;
pub mod telemetry;
pub mod trend;

pub use admission::{AdmissionState, CompletionHandle, SubmitOptions};
pub use config::{ControllerConfig, EmergencyLimits, HighThresholds, PidGains};
pub use controller::{Controller, ControllerBuilder, ControllerState};
pub use error::TaskError;
pub use models::*;
pub use telemetry::{HostTelemetrySource, TelemetrySource};

pub use tokio_util::sync::CancellationToken;

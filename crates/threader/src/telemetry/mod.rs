//! Host telemetry sampling
//!
//! Provides the `TelemetrySource` seam the supervisor samples on every tick
//! and a Linux implementation that reads /proc and the hwmon/drm sysfs trees.
//! A probe must never fail: anything it cannot measure is reported as absent.

mod host;

pub use host::HostTelemetrySource;

use crate::models::TelemetrySample;

pub use async_trait::async_trait;

/// Trait for telemetry probe implementations.
///
/// `sample` is infallible by contract; partial failures surface as absent
/// fields on the returned sample, and the sample timestamp is always set.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Take one snapshot of host metrics.
    async fn sample(&self) -> TelemetrySample;
}

/// Create the default probe for this host.
pub fn create_source() -> std::sync::Arc<dyn TelemetrySource> {
    std::sync::Arc::new(HostTelemetrySource::new())
}

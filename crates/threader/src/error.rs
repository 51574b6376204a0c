//! Error types surfaced to callers
//!
//! Internal plumbing uses `anyhow::Result`; the failure of a submitted
//! operation is reported through this enum so callers can distinguish
//! timeouts and cancellations from operation errors.

use thiserror::Error;

/// Terminal failure of a submitted operation.
#[derive(Error, Debug)]
pub enum TaskError {
    /// The request's timeout elapsed before the operation settled.
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The request's cancellation token fired.
    #[error("request canceled")]
    Canceled,

    /// The operation itself failed; the original error is passed through.
    #[error(transparent)]
    Operation(#[from] anyhow::Error),

    /// The controller was shut down before the operation settled.
    #[error("controller shut down")]
    Shutdown,
}

impl TaskError {
    /// True for the locally generated kinds (timeout, cancel, shutdown).
    pub fn is_local(&self) -> bool {
        !matches!(self, TaskError::Operation(_))
    }
}

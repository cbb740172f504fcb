//! Error types surfaced by task and step construction, restore and fatal
//! declarations.
//!
//! Per-write failures are not errors at this level: lifecycle calls report
//! them as [`TaskEvent`](crate::events::TaskEvent)s so an executor never
//! crashes because a log line could not be stored.

use thiserror::Error;

use crate::config::ConfigError;
use crate::store::backend::StorageError;
use crate::types::status::Status;

/// Errors returned by [`TaskLogger`](crate::TaskLogger) operations that the
/// caller awaits.
#[derive(Error, Debug)]
pub enum TaskLoggerError {
    /// The task was opened without a job id.
    #[error("failed to create taskLogger because jobId must be provided")]
    MissingJobId,

    /// The task was opened without an account id.
    #[error("failed to create taskLogger because accountId must be provided")]
    MissingAccountId,

    /// `fatal_error` was called without a cause.
    #[error("fatalError was called without an error. not valid.")]
    MissingFatalCause,

    /// The backend did not answer the restore read in time.
    #[error("failed to restore steps metadata: no answer from backend within {timeout_ms}ms")]
    RestoreTimeout {
        /// The budget that elapsed.
        timeout_ms: u64,
    },

    /// The backend rejected the restore read.
    #[error("failed to restore steps metadata: {0}")]
    RestoreFailed(#[source] StorageError),

    /// A status change that is not an edge of the state machine.
    #[error("invalid transition from {from} to {to} for step '{step}'")]
    InvalidTransition {
        /// Step being transitioned.
        step: String,
        /// Current status.
        from: Status,
        /// Rejected target status.
        to: Status,
    },

    /// Invalid or incomplete configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A storage operation the caller awaited failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

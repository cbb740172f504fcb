//! Path segments, key names and log formatting shared by the lifecycle and
//! storage layers.

/// Child path under which every step of a task lives.
pub const STEPS_KEY: &str = "steps";

/// Hash of `step name -> status`, mirrored from each step's `status` field.
/// Restore reads this index to rebuild the step map.
pub const STEPS_REFERENCES_KEY: &str = "stepsReferences";

/// Log stream path under a step.
pub const LOGS_LOCATION: &str = "logs";

/// Task-level millisecond timestamp refreshed on every log write.
pub const LAST_UPDATE_KEY: &str = "lastUpdate";

/// Metrics subtree shared by steps and the task.
pub const METRICS_KEY: &str = "metrics";

/// Default key prefix for the key-value backend.
pub const DEFAULT_KEY_ROOT: &str = "build-logs";

/// Default pub/sub channel scope; channels are `<scope>:<jobId>`.
pub const DEFAULT_PUBSUB_SCOPE: &str = "codefresh";

/// Name of the per-task ordered collection on the key-value backend.
pub const CONSOLIDATED_KEY: &str = "consolidated";

/// Path segments that are append-only streams by default.
pub const DEFAULT_STREAM_FIELDS: &[&str] = &["logs", "memory", "cpu"];

/// Upper bound on how long restore waits for the backend.
pub const DEFAULT_RESTORE_TIMEOUT_MS: u64 = 5_000;

/// Step synthesized by `fatal_error` when no step exists yet.
pub const FATAL_STEP_NAME: &str = "Something went wrong";

/// Error message used when the task force-closes open steps.
pub const UNKNOWN_ERROR_MESSAGE: &str = "Unknown error occurred";

/// Event body action for new-step notifications.
pub const NEW_STEP_ACTION: &str = "new-progress-step";

/// Wraps a message in the red highlight used for error lines.
pub fn error_line(message: &str) -> String {
    format!("\x1B[31m{message}\x1B[0m\r\n")
}

/// Wraps a message in the bold yellow highlight used for warnings.
pub fn warning_line(message: &str) -> String {
    format!("\x1B[01;93m{message}\x1B[0m\r\n")
}

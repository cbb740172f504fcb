//! Identity of a tracked job and the optional new-step notification target.

use serde::{Deserialize, Serialize};

use crate::error::TaskLoggerError;

/// Identifies one tracked job. `account_id` and `job_id` together form the
/// storage namespace root.
///
/// # Examples
///
/// ```
/// use task_logger::TaskInfo;
///
/// let task = TaskInfo::new("acc-1", "job-9");
/// assert!(task.validate().is_ok());
/// assert!(TaskInfo::new("acc-1", "").validate().is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    /// Owning account.
    pub account_id: String,
    /// Job (progress) identifier.
    pub job_id: String,
}

impl TaskInfo {
    /// Creates a task identity.
    pub fn new(account_id: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            job_id: job_id.into(),
        }
    }

    /// Checks that both identifiers are present.
    ///
    /// # Errors
    ///
    /// [`TaskLoggerError::MissingJobId`] or [`TaskLoggerError::MissingAccountId`].
    pub fn validate(&self) -> Result<(), TaskLoggerError> {
        if self.job_id.trim().is_empty() {
            return Err(TaskLoggerError::MissingJobId);
        }
        if self.account_id.trim().is_empty() {
            return Err(TaskLoggerError::MissingAccountId);
        }
        Ok(())
    }
}

/// Where to announce newly created steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventReporting {
    /// Endpoint receiving `POST {"action": "new-progress-step", "name": ...}`.
    pub url: String,
    /// Credential sent with the notification. JWTs go in `x-access-token`,
    /// anything else in `Authorization`.
    pub token: String,
}

impl EventReporting {
    /// Creates a reporting target.
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
        }
    }
}

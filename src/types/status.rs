//! Step and task status model.
//!
//! # State Machine
//!
//! ```text
//! Pending         -> Running, Skipped
//! Running         -> Success, Error, Skipped, PendingApproval, Terminating,
//!                    Approved, Denied
//! PendingApproval -> Running, Approved, Denied, Skipped
//! Terminating     -> Terminated, Skipped
//! Success | Error | Skipped | Approved | Denied | Terminated -> (terminal)
//! ```
//!
//! `Running -> Approved/Denied` only happens for a step that carries the
//! pending-approval flag, i.e. one that already passed through
//! `PendingApproval` and was resumed. [`finish_status`] is the single place
//! that decides a terminal status.
//!
//! Warnings are not a status: a step that logged a warning keeps its normal
//! status and carries a `hasWarning` flag instead.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::TaskLoggerError;

/// Lifecycle status shared by steps and the task.
///
/// # Examples
///
/// ```
/// use task_logger::Status;
///
/// assert!(!Status::Running.is_terminal());
/// assert!(Status::Running.can_transition_to(&Status::Terminating));
/// assert!(!Status::Success.can_transition_to(&Status::Running));
/// assert_eq!(Status::PendingApproval.to_string(), "pending-approval");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    /// Created but not started. The only initial status.
    Pending,
    /// Executing.
    Running,
    /// Finished without error (terminal).
    Success,
    /// Finished with an error (terminal).
    Error,
    /// Skipped by request (terminal).
    Skipped,
    /// Waiting for a manual approval.
    PendingApproval,
    /// Approval step finished without error (terminal).
    Approved,
    /// Approval step finished with an error (terminal).
    Denied,
    /// Being stopped.
    Terminating,
    /// Stopped (terminal).
    Terminated,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            "skipped" => Ok(Self::Skipped),
            "pending-approval" => Ok(Self::PendingApproval),
            "approved" => Ok(Self::Approved),
            "denied" => Ok(Self::Denied),
            "terminating" => Ok(Self::Terminating),
            "terminated" => Ok(Self::Terminated),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Returned when parsing a status string that is not part of the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown status: {}", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl Status {
    /// Every status, in declaration order.
    pub const ALL: [Status; 10] = [
        Self::Pending,
        Self::Running,
        Self::Success,
        Self::Error,
        Self::Skipped,
        Self::PendingApproval,
        Self::Approved,
        Self::Denied,
        Self::Terminating,
        Self::Terminated,
    ];

    /// Wire name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
            Self::Skipped => "skipped",
            Self::PendingApproval => "pending-approval",
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
        }
    }

    /// Returns `true` if no further transition is allowed.
    ///
    /// # Examples
    ///
    /// ```
    /// use task_logger::Status;
    ///
    /// assert!(Status::Denied.is_terminal());
    /// assert!(!Status::PendingApproval.is_terminal());
    /// ```
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success
                | Self::Error
                | Self::Skipped
                | Self::Approved
                | Self::Denied
                | Self::Terminated
        )
    }

    /// Returns `true` for the statuses in which a step still accepts log
    /// writes and a `finish` call.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Running | Self::Pending | Self::PendingApproval | Self::Terminating
        )
    }

    /// Returns `true` if moving from this status to `next` is an edge of the
    /// state machine. Self-transitions are rejected.
    pub fn can_transition_to(&self, next: &Self) -> bool {
        if self == next {
            return false;
        }

        match self {
            Self::Pending => matches!(next, Self::Running | Self::Skipped),
            Self::Running => matches!(
                next,
                Self::Success
                    | Self::Error
                    | Self::Skipped
                    | Self::PendingApproval
                    | Self::Terminating
                    | Self::Approved
                    | Self::Denied
            ),
            Self::PendingApproval => matches!(
                next,
                Self::Running | Self::Approved | Self::Denied | Self::Skipped
            ),
            Self::Terminating => matches!(next, Self::Terminated | Self::Skipped),
            Self::Success
            | Self::Error
            | Self::Skipped
            | Self::Approved
            | Self::Denied
            | Self::Terminated => false,
        }
    }

    /// Validates a transition from this status to `next` for the named step.
    ///
    /// # Errors
    ///
    /// Returns [`TaskLoggerError::InvalidTransition`] when `next` is not
    /// reachable from this status.
    ///
    /// # Examples
    ///
    /// ```
    /// use task_logger::Status;
    ///
    /// assert!(Status::Running.validate_transition("build", &Status::Success).is_ok());
    /// assert!(Status::Success.validate_transition("build", &Status::Running).is_err());
    /// ```
    pub fn validate_transition(&self, step: &str, next: &Self) -> Result<(), TaskLoggerError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(TaskLoggerError::InvalidTransition {
                step: step.to_string(),
                from: *self,
                to: *next,
            })
        }
    }
}

/// Computes the terminal status a `finish` call lands on.
///
/// A skip request wins over everything, a terminating step always ends as
/// `Terminated`, and steps that went through an approval gate end as
/// `Approved`/`Denied` instead of `Success`/`Error`.
///
/// # Examples
///
/// ```
/// use task_logger::types::status::finish_status;
/// use task_logger::Status;
///
/// assert_eq!(finish_status(Status::Running, false, false, false), Status::Success);
/// assert_eq!(finish_status(Status::Terminating, true, false, false), Status::Terminated);
/// assert_eq!(finish_status(Status::PendingApproval, true, true, false), Status::Denied);
/// assert_eq!(finish_status(Status::Pending, false, false, true), Status::Skipped);
/// ```
pub fn finish_status(current: Status, has_error: bool, pending_approval: bool, skip: bool) -> Status {
    if skip {
        Status::Skipped
    } else if current == Status::Terminating {
        Status::Terminated
    } else if has_error {
        if pending_approval {
            Status::Denied
        } else {
            Status::Error
        }
    } else if pending_approval {
        Status::Approved
    } else {
        Status::Success
    }
}

/// Who may see a task's progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Visible to anyone with access to the job.
    Public,
    /// Restricted to the owning account.
    #[default]
    Private,
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Public => write!(f, "public"),
            Self::Private => write!(f, "private"),
        }
    }
}

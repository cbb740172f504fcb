//! Non-fatal problems raised by lifecycle calls.
//!
//! Lifecycle operations never return errors for per-write problems. Those
//! become [`TaskEvent`]s: each is logged through `tracing` and, when the task
//! owner registered a channel with [`TaskEvents::channel`], delivered on it.

use std::fmt;

use tokio::sync::mpsc;

use crate::types::Status;

/// A non-fatal problem observed by a step or the task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    /// A write arrived after the step left its active states.
    LateWrite {
        /// Step name.
        step: String,
        /// Operation that was refused (`write`, `info`, `finish`, ...).
        operation: String,
        /// Message or error text carried by the refused call.
        payload: Option<String>,
    },
    /// A transition was requested from a status that does not allow it.
    InvalidTransition {
        /// Step name.
        step: String,
        /// Requested operation.
        operation: String,
        /// Status the step was in.
        current: Status,
    },
    /// The backend rejected a write.
    Backend {
        /// Operation that issued the write.
        operation: String,
        /// Reference of the target path.
        reference: String,
        /// Backend error text.
        message: String,
    },
}

impl fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LateWrite {
                operation,
                payload: Some(payload),
                ..
            } => write!(
                f,
                "progress-logs '{operation}' handler was triggered after the job finished with message: {payload}"
            ),
            Self::LateWrite { operation, .. } => write!(
                f,
                "progress-logs '{operation}' handler was triggered after the job finished"
            ),
            Self::InvalidTransition {
                operation, current, ..
            } => write!(
                f,
                "{operation} is only allowed to step in running state status, current status: {current}"
            ),
            Self::Backend {
                operation,
                reference,
                message,
            } => write!(f, "{operation} failed for {reference}: {message}"),
        }
    }
}

/// Constructor for the event channel.
pub struct TaskEvents;

impl TaskEvents {
    /// Creates a connected sink and receiver.
    ///
    /// # Examples
    ///
    /// ```
    /// use task_logger::events::{TaskEvent, TaskEvents};
    ///
    /// let (sink, mut events) = TaskEvents::channel();
    /// sink.emit(TaskEvent::Backend {
    ///     operation: "write".into(),
    ///     reference: "build-logs:A:J".into(),
    ///     message: "connection reset".into(),
    /// });
    /// assert!(events.try_recv().is_ok());
    /// ```
    pub fn channel() -> (EventSink, mpsc::UnboundedReceiver<TaskEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventSink { tx: Some(tx) }, rx)
    }
}

/// Sending half of the event channel. The default sink only logs.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<TaskEvent>>,
}

impl EventSink {
    /// A sink that only logs.
    pub fn silent() -> Self {
        Self::default()
    }

    /// Logs `event` and forwards it to the registered receiver, if any.
    pub fn emit(&self, event: TaskEvent) {
        match &event {
            TaskEvent::LateWrite { step, operation, .. } => {
                tracing::warn!(step = %step, operation = %operation, "{event}");
            },
            TaskEvent::InvalidTransition { step, current, .. } => {
                tracing::warn!(step = %step, current = %current, "{event}");
            },
            TaskEvent::Backend { reference, .. } => {
                tracing::warn!(reference = %reference, "{event}");
            },
        }
        if let Some(tx) = &self.tx {
            // A dropped receiver means nobody is listening any more.
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn late_write_message_mentions_the_operation() {
        let event = TaskEvent::LateWrite {
            step: "build".to_string(),
            operation: "finish".to_string(),
            payload: None,
        };
        assert_eq!(
            event.to_string(),
            "progress-logs 'finish' handler was triggered after the job finished"
        );
    }

    #[test]
    fn emit_survives_a_dropped_receiver() {
        let (sink, events) = TaskEvents::channel();
        drop(events);
        sink.emit(TaskEvent::InvalidTransition {
            step: "build".to_string(),
            operation: "markTerminating".to_string(),
            current: Status::Pending,
        });
    }
}

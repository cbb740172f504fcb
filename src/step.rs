//! One step of a tracked job.
//!
//! A [`StepLogger`] owns the in-memory state of a step and mirrors every
//! change to its `steps/<name>` reference. Callers get steps from
//! [`TaskLogger::create`](crate::TaskLogger::create); handles are shared
//! (`Arc`) and every method takes `&self`.
//!
//! Lifecycle calls never fail. A call that the current status does not allow
//! becomes a [`TaskEvent`], and so does a write the backend rejected. Once
//! the task is declared fatal every call is a silent no-op.
//!
//! ```text
//! start:            Pending -> Running
//! markPendingApproval: Running -> PendingApproval   (sets pendingApproval)
//! resume:           PendingApproval -> Running
//! markTerminating:  Running -> Terminating
//! finish:           active -> finish_status(..)
//! reset:            any -> Pending
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};

use crate::constants::{error_line, warning_line, LAST_UPDATE_KEY, LOGS_LOCATION, METRICS_KEY};
use crate::events::{EventSink, TaskEvent};
use crate::store::{NullRef, StorageError, StorageRef};
use crate::types::status::{finish_status, Status};

/// State shared by a task and all of its steps.
#[derive(Debug)]
pub(crate) struct TaskShared {
    pub(crate) root: Arc<dyn StorageRef>,
    pub(crate) fatal: AtomicBool,
    pub(crate) events: RwLock<EventSink>,
}

impl TaskShared {
    pub(crate) fn new(root: Arc<dyn StorageRef>) -> Self {
        Self {
            root,
            fatal: AtomicBool::new(false),
            events: RwLock::new(EventSink::silent()),
        }
    }

    pub(crate) fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::SeqCst)
    }

    pub(crate) fn emit(&self, event: TaskEvent) {
        self.events.read().emit(event);
    }

    /// Reports a rejected write as a [`TaskEvent::Backend`].
    pub(crate) fn report<T>(
        &self,
        operation: &str,
        target: &dyn StorageRef,
        result: Result<T, StorageError>,
    ) {
        if let Err(err) = result {
            self.emit(TaskEvent::Backend {
                operation: operation.to_string(),
                reference: target.reference(),
                message: err.to_string(),
            });
        }
    }

    /// Refreshes the task-level `lastUpdate` timestamp (milliseconds).
    pub(crate) async fn touch_last_update(&self, operation: &str) {
        let target = self.root.child(LAST_UPDATE_KEY);
        let result = target.set(json!(Utc::now().timestamp_millis())).await;
        self.report(operation, target.as_ref(), result);
    }
}

#[derive(Debug, Clone)]
struct StepState {
    status: Status,
    pending_approval: bool,
    previously_executed: bool,
    has_warning: bool,
    creation_timestamp: Option<i64>,
    finish_timestamp: Option<i64>,
}

impl StepState {
    fn with_status(status: Status) -> Self {
        Self {
            status,
            pending_approval: status == Status::PendingApproval,
            previously_executed: false,
            has_warning: false,
            creation_timestamp: None,
            finish_timestamp: None,
        }
    }
}

/// Handle to one step of a task.
pub struct StepLogger {
    name: String,
    index: usize,
    writer: Arc<dyn StorageRef>,
    task: Arc<TaskShared>,
    state: Mutex<StepState>,
    inert: bool,
}

impl fmt::Debug for StepLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepLogger")
            .field("name", &self.name)
            .field("index", &self.index)
            .field("state", &*self.state.lock())
            .field("inert", &self.inert)
            .finish()
    }
}

impl StepLogger {
    pub(crate) fn new(
        name: impl Into<String>,
        index: usize,
        writer: Arc<dyn StorageRef>,
        task: Arc<TaskShared>,
    ) -> Self {
        Self::with_status(name, index, writer, task, Status::Pending)
    }

    /// A step rebuilt from the persisted index. `pendingApproval` follows
    /// the status.
    pub(crate) fn with_status(
        name: impl Into<String>,
        index: usize,
        writer: Arc<dyn StorageRef>,
        task: Arc<TaskShared>,
        status: Status,
    ) -> Self {
        Self {
            name: name.into(),
            index,
            writer,
            task,
            state: Mutex::new(StepState::with_status(status)),
            inert: false,
        }
    }

    /// A handle that accepts every call and does nothing.
    pub(crate) fn inert(name: impl Into<String>, task: Arc<TaskShared>) -> Self {
        Self {
            name: name.into(),
            index: 0,
            writer: Arc::new(NullRef::new()),
            task,
            state: Mutex::new(StepState::with_status(Status::Pending)),
            inert: true,
        }
    }

    /// Writes the initial `{name, status, index}` record.
    pub(crate) async fn init(&self) {
        if !self.live() {
            return;
        }
        let record = json!({
            "name": self.name,
            "status": Status::Pending,
            "index": self.index,
        });
        let result = self.writer.update(record).await;
        self.task.report("create", self.writer.as_ref(), result);
    }

    /// Drops logs left at this step's path by an earlier run.
    pub(crate) async fn clear_logs(&self) {
        if !self.live() {
            return;
        }
        let target = self.writer.child(LOGS_LOCATION);
        let result = target.remove().await;
        self.task.report("create", target.as_ref(), result);
    }

    fn live(&self) -> bool {
        !self.inert && !self.task.is_fatal()
    }

    async fn set_field(&self, operation: &str, field: &str, value: Value) {
        let target = self.writer.child(field);
        let result = target.set(value).await;
        self.task.report(operation, target.as_ref(), result);
    }

    async fn push_log(&self, operation: &str, line: String) {
        let target = self.writer.child(LOGS_LOCATION);
        let result = target.push(Value::String(line)).await;
        self.task.report(operation, target.as_ref(), result);
    }

    /// Appends `line` to the logs regardless of the step status.
    pub(crate) async fn append_log(&self, operation: &str, line: String) {
        if self.live() {
            self.push_log(operation, line).await;
        }
    }

    pub(crate) fn status_ref(&self) -> Arc<dyn StorageRef> {
        self.writer.child("status")
    }

    /// Moves a pending step to running and stamps its creation time.
    pub async fn start(&self) {
        if !self.live() {
            return;
        }
        let created = {
            let mut state = self.state.lock();
            if state.status != Status::Pending {
                return;
            }
            let now = Utc::now().timestamp();
            state.status = Status::Running;
            state.creation_timestamp = Some(now);
            state.finish_timestamp = None;
            now
        };
        tracing::info!(step = %self.name, "step started");
        self.set_field("start", "status", json!(Status::Running)).await;
        self.set_field("start", "finishTimeStamp", json!("")).await;
        self.set_field("start", "creationTimeStamp", json!(created)).await;
    }

    /// Moves a step waiting for approval back to running.
    pub async fn resume(&self) {
        if !self.live() {
            return;
        }
        {
            let mut state = self.state.lock();
            if state.status != Status::PendingApproval {
                return;
            }
            state.status = Status::Running;
        }
        tracing::info!(step = %self.name, "step resumed");
        self.set_field("resume", "status", json!(Status::Running)).await;
    }

    /// Puts the step back to pending and clears both timestamps.
    pub async fn reset(&self) {
        if !self.live() {
            return;
        }
        {
            let mut state = self.state.lock();
            state.status = Status::Pending;
            state.pending_approval = false;
            state.creation_timestamp = None;
            state.finish_timestamp = None;
        }
        tracing::info!(step = %self.name, "step reset");
        self.set_field("reset", "creationTimeStamp", json!("")).await;
        self.set_field("reset", "finishTimeStamp", json!("")).await;
        self.set_field("reset", "status", json!(Status::Pending)).await;
    }

    async fn log(&self, operation: &str, message: String, line: String) -> bool {
        if !self.live() {
            return false;
        }
        if !self.state.lock().status.is_active() {
            self.task.emit(TaskEvent::LateWrite {
                step: self.name.clone(),
                operation: operation.to_string(),
                payload: Some(message),
            });
            return false;
        }
        self.push_log(operation, line).await;
        self.task.touch_last_update(operation).await;
        true
    }

    /// Appends `message` to the step's logs verbatim.
    pub async fn write(&self, message: impl Into<String>) {
        let message = message.into();
        self.log("write", message.clone(), message).await;
    }

    /// Appends `message` followed by a line break.
    pub async fn debug(&self, message: impl Into<String>) {
        let message = message.into();
        let line = format!("{message}\r\n");
        self.log("debug", message, line).await;
    }

    /// Appends `message` followed by a line break.
    pub async fn info(&self, message: impl Into<String>) {
        let message = message.into();
        let line = format!("{message}\r\n");
        self.log("info", message, line).await;
    }

    /// Appends a highlighted warning line and flags the step as having
    /// warnings.
    pub async fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        let line = warning_line(&message);
        if !self.log("warning", message, line).await {
            return;
        }
        let first = {
            let mut state = self.state.lock();
            !std::mem::replace(&mut state.has_warning, true)
        };
        if first {
            self.set_field("warning", "hasWarning", json!(true)).await;
        }
    }

    /// Closes the step.
    ///
    /// A pending step is only closed when `skip` is set. The terminal status
    /// comes from [`finish_status`]. An error whose text is neither empty nor
    /// the bare word `Error` is also appended to the logs in red. Finishing
    /// a step that already left its active states changes nothing and emits
    /// one [`TaskEvent::LateWrite`].
    pub async fn finish(&self, err: Option<&(dyn fmt::Display + Sync)>, skip: bool) {
        if !self.live() {
            return;
        }
        let error_text = err.map(ToString::to_string);
        let outcome = {
            let mut state = self.state.lock();
            let current = state.status;
            if current == Status::Pending && !skip {
                return;
            }
            if current.is_active() {
                let next = finish_status(current, err.is_some(), state.pending_approval, skip);
                match current.validate_transition(&self.name, &next) {
                    Ok(()) => {
                        let now = Utc::now().timestamp();
                        state.status = next;
                        state.finish_timestamp = Some(now);
                        Ok((next, now))
                    },
                    Err(err) => Err(Some((current, err))),
                }
            } else {
                Err(None)
            }
        };

        let (status, finished_at) = match outcome {
            Ok(closed) => closed,
            Err(Some((current, err))) => {
                tracing::warn!(step = %self.name, error = %err, "finish rejected");
                self.task.emit(TaskEvent::InvalidTransition {
                    step: self.name.clone(),
                    operation: "finish".to_string(),
                    current,
                });
                return;
            },
            Err(None) => {
                self.task.emit(TaskEvent::LateWrite {
                    step: self.name.clone(),
                    operation: "finish".to_string(),
                    payload: error_text,
                });
                return;
            },
        };

        if let Some(text) = error_text.filter(|text| !text.is_empty() && text != "Error") {
            self.push_log("finish", error_line(&text)).await;
        }
        self.set_field("finish", "status", json!(status)).await;
        self.set_field("finish", "finishTimeStamp", json!(finished_at)).await;
        self.task.touch_last_update("finish").await;
        tracing::info!(step = %self.name, status = %status, "step finished");
    }

    /// Records that the step's result was reused from an earlier run.
    pub async fn mark_previously_executed(&self) {
        if !self.live() {
            return;
        }
        self.state.lock().previously_executed = true;
        self.set_field("markPreviouslyExecuted", "previouslyExecuted", json!(true))
            .await;
    }

    /// Moves the step to `next` if the state machine has that edge.
    /// Otherwise the status stays and the attempt becomes a
    /// [`TaskEvent::InvalidTransition`].
    fn advance(&self, operation: &str, next: Status) -> bool {
        let rejected = {
            let mut state = self.state.lock();
            let current = state.status;
            match current.validate_transition(&self.name, &next) {
                Ok(()) => {
                    state.status = next;
                    if next == Status::PendingApproval {
                        state.pending_approval = true;
                    }
                    None
                },
                Err(err) => Some((current, err)),
            }
        };
        let Some((current, err)) = rejected else {
            return true;
        };
        tracing::debug!(step = %self.name, error = %err, "transition rejected");
        self.task.emit(TaskEvent::InvalidTransition {
            step: self.name.clone(),
            operation: operation.to_string(),
            current,
        });
        false
    }

    /// Parks a running step until someone approves or denies it.
    pub async fn mark_pending_approval(&self) {
        if !self.live() || !self.advance("markPendingApproval", Status::PendingApproval) {
            return;
        }
        tracing::info!(step = %self.name, "step waiting for approval");
        self.set_field("markPendingApproval", "status", json!(Status::PendingApproval))
            .await;
        self.set_field("markPendingApproval", "pendingApproval", json!(true))
            .await;
    }

    /// Marks a running step as being stopped.
    pub async fn mark_terminating(&self) {
        if !self.live() || !self.advance("markTerminating", Status::Terminating) {
            return;
        }
        tracing::info!(step = %self.name, "step terminating");
        self.set_field("markTerminating", "status", json!(Status::Terminating))
            .await;
    }

    async fn push_metric(&self, operation: &str, series: &str, time: i64, usage: f64) {
        if !self.live() {
            return;
        }
        let target = self.writer.child(METRICS_KEY).child(series);
        let result = target.push(json!({ "time": time, "usage": usage })).await;
        self.task.report(operation, target.as_ref(), result);
    }

    /// Appends a memory sample to `metrics.memory`.
    pub async fn update_memory_usage(&self, time: i64, usage: f64) {
        self.push_metric("updateMemoryUsage", "memory", time, usage)
            .await;
    }

    /// Appends a cpu sample to `metrics.cpu`.
    pub async fn update_cpu_usage(&self, time: i64, usage: f64) {
        self.push_metric("updateCpuUsage", "cpu", time, usage).await;
    }

    /// Step name, unique within the task.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Position of the step in creation order.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Current status as last set by this handle.
    pub fn status(&self) -> Status {
        self.state.lock().status
    }

    /// Whether [`warn`](Self::warn) logged anything.
    pub fn has_warning(&self) -> bool {
        self.state.lock().has_warning
    }

    /// Whether the step went through an approval gate.
    pub fn pending_approval(&self) -> bool {
        self.state.lock().pending_approval
    }

    /// Whether the step was marked as reused from an earlier run.
    pub fn previously_executed(&self) -> bool {
        self.state.lock().previously_executed
    }

    /// Unix seconds at which the step started, if it did.
    pub fn creation_timestamp(&self) -> Option<i64> {
        self.state.lock().creation_timestamp
    }

    /// Unix seconds at which the step finished, if it did.
    pub fn finish_timestamp(&self) -> Option<i64> {
        self.state.lock().finish_timestamp
    }

    /// Whether this handle is a no-op stub.
    pub fn is_inert(&self) -> bool {
        self.inert
    }

    /// Reference of the step record. Empty for an inert handle.
    pub fn get_reference(&self) -> String {
        self.writer.reference()
    }

    /// Reference of the step's logs.
    pub fn get_logs_reference(&self) -> String {
        self.writer.child(LOGS_LOCATION).reference()
    }

    /// Reference of the task-level `lastUpdate` timestamp.
    pub fn get_last_update_reference(&self) -> String {
        if self.inert {
            return String::new();
        }
        self.task.root.child(LAST_UPDATE_KEY).reference()
    }

    /// Reference of the step's metric logs.
    pub fn get_metrics_logs_reference(&self) -> String {
        self.writer.child(METRICS_KEY).child(LOGS_LOCATION).reference()
    }
}

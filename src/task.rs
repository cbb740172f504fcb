//! The task aggregate: one tracked job and its steps.
//!
//! A [`TaskLogger`] is bound to one root [`StorageRef`] and owns the
//! insertion-ordered step map. It hands out [`StepLogger`]s, keeps the
//! `stepsReferences` index (step name to status) in sync with every step's
//! `status`, and records task-level fields such as visibility, data and the
//! memory limit.
//!
//! # Fatal and finished
//!
//! [`fatal_error`](TaskLogger::fatal_error) closes every open step and then
//! freezes the task: from then on every step and task write is a silent
//! no-op. [`finish`](TaskLogger::finish) closes open steps the same way but
//! leaves pending steps untouched. After either, [`create`](TaskLogger::create)
//! only returns inert handles.
//!
//! # Example
//!
//! ```
//! use task_logger::{LoggerConfig, TaskInfo, TaskLogger};
//!
//! # async fn example() -> Result<(), task_logger::TaskLoggerError> {
//! let task = TaskLogger::open(TaskInfo::new("account", "job"), &LoggerConfig::default()).await?;
//! let build = task.create("build", None, false).await;
//! build.start().await;
//! build.info("compiling").await;
//! build.finish(None, false).await;
//! task.finish().await;
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::config::LoggerConfig;
use crate::constants::{
    error_line, DEFAULT_RESTORE_TIMEOUT_MS, FATAL_STEP_NAME, LAST_UPDATE_KEY, LOGS_LOCATION,
    METRICS_KEY, STEPS_KEY, STEPS_REFERENCES_KEY, UNKNOWN_ERROR_MESSAGE,
};
use crate::error::TaskLoggerError;
use crate::events::EventSink;
use crate::factory;
use crate::reporting::StepEventReporter;
use crate::step::{StepLogger, TaskShared};
use crate::store::{watcher, StorageRef};
use crate::types::status::{Status, Visibility};
use crate::types::task::{EventReporting, TaskInfo};

/// Progress tracker for one job.
pub struct TaskLogger {
    info: TaskInfo,
    shared: Arc<TaskShared>,
    steps: Mutex<IndexMap<String, Arc<StepLogger>>>,
    watched: Mutex<HashSet<String>>,
    finished: AtomicBool,
    restore_timeout_ms: u64,
    reporter: StepEventReporter,
    memory_limit: Mutex<Option<String>>,
}

impl std::fmt::Debug for TaskLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskLogger")
            .field("info", &self.info)
            .field("steps", &self.steps.lock().keys().collect::<Vec<_>>())
            .field("fatal", &self.is_fatal())
            .field("finished", &self.is_finished())
            .finish_non_exhaustive()
    }
}

impl TaskLogger {
    /// Creates a task writing under `root`.
    ///
    /// # Errors
    ///
    /// [`TaskLoggerError::MissingJobId`] or [`TaskLoggerError::MissingAccountId`].
    pub fn new(info: TaskInfo, root: Arc<dyn StorageRef>) -> Result<Self, TaskLoggerError> {
        info.validate()?;
        Ok(Self {
            info,
            shared: Arc::new(TaskShared::new(root)),
            steps: Mutex::new(IndexMap::new()),
            watched: Mutex::new(HashSet::new()),
            finished: AtomicBool::new(false),
            restore_timeout_ms: DEFAULT_RESTORE_TIMEOUT_MS,
            reporter: StepEventReporter::default(),
            memory_limit: Mutex::new(None),
        })
    }

    /// Connects the backend selected by `config` and creates the task on it.
    ///
    /// # Errors
    ///
    /// Identity, configuration and connection errors.
    pub async fn open(info: TaskInfo, config: &LoggerConfig) -> Result<Self, TaskLoggerError> {
        let root = factory::connect(&info, config).await?;
        Ok(Self::new(info, root)?.with_restore_timeout(config.restore_timeout_ms))
    }

    /// Routes [`TaskEvent`](crate::events::TaskEvent)s to `sink`.
    pub fn with_events(self, sink: EventSink) -> Self {
        *self.shared.events.write() = sink;
        self
    }

    /// Sets how long [`restore_existing_steps`](Self::restore_existing_steps)
    /// waits for the backend.
    pub fn with_restore_timeout(mut self, timeout_ms: u64) -> Self {
        self.restore_timeout_ms = timeout_ms;
        self
    }

    /// Replaces the reporter used for new-step notifications.
    pub fn with_reporter(mut self, reporter: StepEventReporter) -> Self {
        self.reporter = reporter;
        self
    }

    /// Identity of the tracked job.
    pub fn info(&self) -> &TaskInfo {
        &self.info
    }

    /// Whether [`fatal_error`](Self::fatal_error) ran.
    pub fn is_fatal(&self) -> bool {
        self.shared.is_fatal()
    }

    /// Whether [`finish`](Self::finish) ran.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Step handles in creation order.
    pub fn steps(&self) -> Vec<Arc<StepLogger>> {
        self.steps.lock().values().cloned().collect()
    }

    /// The step called `name`, if it was created or restored.
    pub fn step(&self, name: &str) -> Option<Arc<StepLogger>> {
        self.steps.lock().get(name).cloned()
    }

    /// Last limit recorded by [`set_memory_limit`](Self::set_memory_limit),
    /// without its unit.
    pub fn memory_limit(&self) -> Option<String> {
        self.memory_limit.lock().clone()
    }

    /// Reference of the task root.
    pub fn reference(&self) -> String {
        self.shared.root.reference()
    }

    /// Reference of the task-level metric logs.
    pub fn get_metrics_logs_reference(&self) -> String {
        self.shared
            .root
            .child(METRICS_KEY)
            .child(LOGS_LOCATION)
            .reference()
    }

    /// Mirrors every later `status` write of `step` into the index. One
    /// watcher per step name, however often the step is restored.
    fn watch_status(&self, step: &StepLogger) {
        if !self.watched.lock().insert(step.name().to_string()) {
            return;
        }
        let entry = self
            .shared
            .root
            .child(STEPS_REFERENCES_KEY)
            .child(step.name());
        let shared = Arc::clone(&self.shared);
        step.status_ref().watch(watcher(move |value| {
            let entry = Arc::clone(&entry);
            let shared = Arc::clone(&shared);
            async move {
                let result = entry.set(value).await;
                shared.report("updateStepReference", entry.as_ref(), result);
            }
        }));
    }

    /// Returns the step called `name`, creating it on first use.
    ///
    /// A new step writes its initial record, drops logs an earlier run left
    /// at its path, joins the `stepsReferences` index and, when `reporting`
    /// is given, is announced to that endpoint in the background. An existing step is returned as is, or reset
    /// first when `reset_existing` is set. Once the task is fatal or
    /// finished the returned handle is inert.
    pub async fn create(
        &self,
        name: &str,
        reporting: Option<&EventReporting>,
        reset_existing: bool,
    ) -> Arc<StepLogger> {
        if self.is_fatal() || self.is_finished() {
            return Arc::new(StepLogger::inert(name, Arc::clone(&self.shared)));
        }

        let (step, created) = {
            let mut steps = self.steps.lock();
            match steps.get(name) {
                Some(existing) => (Arc::clone(existing), false),
                None => {
                    let writer = self.shared.root.child(STEPS_KEY).child(name);
                    let step = Arc::new(StepLogger::new(
                        name,
                        steps.len(),
                        writer,
                        Arc::clone(&self.shared),
                    ));
                    steps.insert(name.to_string(), Arc::clone(&step));
                    (step, true)
                },
            }
        };

        if !created {
            if reset_existing {
                step.reset().await;
            }
            return step;
        }

        self.watch_status(&step);
        step.init().await;
        step.clear_logs().await;
        let index = self.shared.root.child(STEPS_REFERENCES_KEY);
        let result = index.update(json!({ name: Status::Pending })).await;
        self.shared.report("create", index.as_ref(), result);
        tracing::info!(job_id = %self.info.job_id, step = name, "step created");

        if let Some(target) = reporting {
            self.reporter.spawn_notify(target.clone(), name.to_string());
        }
        step
    }

    /// Drops every status watcher registered by [`watch_status`](Self::watch_status).
    fn unwatch_steps(&self) {
        let names: Vec<String> = self.watched.lock().drain().collect();
        let steps = self.shared.root.child(STEPS_KEY);
        for name in names {
            steps.child(&name).child("status").unwatch();
        }
    }

    /// Rebuilds the step map from the persisted `stepsReferences` index.
    ///
    /// Steps come back in name order with their stored status; a step
    /// stored as `pending-approval` also gets its approval flag. Entries
    /// with an unknown status are skipped. Returns the number of restored
    /// steps.
    ///
    /// # Errors
    ///
    /// [`TaskLoggerError::RestoreTimeout`] when the backend does not answer
    /// in time, [`TaskLoggerError::RestoreFailed`] when it fails. The step
    /// map is left unchanged in both cases.
    pub async fn restore_existing_steps(&self) -> Result<usize, TaskLoggerError> {
        let index = self.shared.root.child(STEPS_REFERENCES_KEY);
        let budget = Duration::from_millis(self.restore_timeout_ms);
        let entries = match tokio::time::timeout(budget, index.get_hash()).await {
            Err(_) => {
                return Err(TaskLoggerError::RestoreTimeout {
                    timeout_ms: self.restore_timeout_ms,
                })
            },
            Ok(Err(err)) => return Err(TaskLoggerError::RestoreFailed(err)),
            Ok(Ok(entries)) => entries,
        };

        let mut entries: Vec<(String, String)> = entries.into_iter().collect();
        entries.sort();

        let mut restored = IndexMap::with_capacity(entries.len());
        for (name, raw) in entries {
            let status: Status = match raw.parse() {
                Ok(status) => status,
                Err(err) => {
                    tracing::warn!(step = %name, error = %err, "skipping step with unknown status");
                    continue;
                },
            };
            let writer = self.shared.root.child(STEPS_KEY).child(&name);
            let step = StepLogger::with_status(
                name.as_str(),
                restored.len(),
                writer,
                Arc::clone(&self.shared),
                status,
            );
            restored.insert(name, Arc::new(step));
        }

        for step in restored.values() {
            self.watch_status(step);
        }
        let count = restored.len();
        *self.steps.lock() = restored;
        tracing::info!(job_id = %self.info.job_id, count, "restored steps");
        Ok(count)
    }

    async fn close_open_steps(&self) {
        for step in self.steps() {
            let status = step.status();
            if status.is_active() && status != Status::Pending {
                step.finish(Some(&UNKNOWN_ERROR_MESSAGE), false).await;
            }
        }
    }

    /// Closes every open step with an "Unknown error occurred" error and
    /// marks the task finished. Pending steps are left untouched.
    pub async fn finish(&self) {
        if self.is_fatal() {
            return;
        }
        self.close_open_steps().await;
        self.finished.store(true, Ordering::SeqCst);
        tracing::info!(job_id = %self.info.job_id, "task finished");
    }

    /// Declares the task failed and freezes it.
    ///
    /// Open steps are closed with an "Unknown error occurred" error. When no
    /// step exists yet, a "Something went wrong" step is created, started
    /// and finished with `err` so the failure is visible.
    ///
    /// # Errors
    ///
    /// [`TaskLoggerError::MissingFatalCause`] when `err` is `None`.
    pub async fn fatal_error(
        &self,
        err: Option<&(dyn std::error::Error + Send + Sync)>,
    ) -> Result<(), TaskLoggerError> {
        let Some(err) = err else {
            return Err(TaskLoggerError::MissingFatalCause);
        };
        if self.is_fatal() {
            return Ok(());
        }

        let has_steps = !self.steps.lock().is_empty();
        if has_steps {
            self.close_open_steps().await;
        } else {
            let step = self.create(FATAL_STEP_NAME, None, false).await;
            step.start().await;
            let message = err.to_string();
            step.finish(Some(&message), false).await;
        }

        self.shared.fatal.store(true, Ordering::SeqCst);
        tracing::error!(job_id = %self.info.job_id, error = %err, "task failed");
        Ok(())
    }

    /// Appends a red `message` line to the logs of the last step.
    ///
    /// Uses the last created step; with an empty step map it falls back to
    /// the last step found in the store.
    ///
    /// # Errors
    ///
    /// [`TaskLoggerError::Storage`] when the fallback lookup or write fails.
    pub async fn add_error_message_to_end_of_steps(
        &self,
        message: &str,
    ) -> Result<(), TaskLoggerError> {
        if self.is_fatal() {
            return Ok(());
        }
        let line = error_line(message);
        let last = self.steps.lock().values().last().cloned();
        if let Some(step) = last {
            step.append_log("addErrorMessageToEndOfSteps", line).await;
            return Ok(());
        }

        let stored = self.shared.root.child(STEPS_KEY).children().await?;
        if let Some(step) = stored.last() {
            step.child(LOGS_LOCATION).push(Value::String(line)).await?;
        }
        Ok(())
    }

    async fn set_root_field(&self, operation: &str, field: &str, value: Value) {
        if self.is_fatal() {
            return;
        }
        let target = self.shared.root.child(field);
        let result = target.set(value).await;
        self.shared.report(operation, target.as_ref(), result);
    }

    async fn push_root_metric(&self, operation: &str, target: Arc<dyn StorageRef>, value: Value) {
        if self.is_fatal() {
            return;
        }
        let result = target.push(value).await;
        self.shared.report(operation, target.as_ref(), result);
    }

    /// Appends a task-level memory sample to `metrics.memory`.
    pub async fn update_memory_usage(&self, time: i64, usage: f64) {
        let target = self.shared.root.child(METRICS_KEY).child("memory");
        self.push_root_metric("updateMemoryUsage", target, json!({ "time": time, "usage": usage }))
            .await;
    }

    /// Records the memory limit (e.g. `"512Mi"`, stored as `"512"`) and
    /// appends it to `metrics.limits.memory`.
    pub async fn set_memory_limit(&self, limit: &str) {
        if self.is_fatal() {
            return;
        }
        let limit = limit.replacen("Mi", "", 1);
        *self.memory_limit.lock() = Some(limit.clone());
        let target = self
            .shared
            .root
            .child(METRICS_KEY)
            .child("limits")
            .child("memory");
        self.push_root_metric("setMemoryLimit", target, Value::String(limit))
            .await;
    }

    /// Writes the task's `visibility` field.
    pub async fn set_visibility(&self, visibility: Visibility) {
        self.set_root_field("setVisibility", "visibility", json!(visibility))
            .await;
    }

    /// Stores an arbitrary data blob on the task.
    pub async fn set_data(&self, data: Value) {
        self.set_root_field("setData", "data", data).await;
    }

    /// Writes the task-level `status` field. Step statuses are untouched.
    pub async fn set_status(&self, status: Status) {
        self.set_root_field("setStatus", "status", json!(status))
            .await;
    }

    /// Writes the job id to the task's `id` field.
    pub async fn report_id(&self) {
        let id = self.info.job_id.clone();
        self.set_root_field("reportId", "id", Value::String(id)).await;
    }

    /// Writes the account id to the task's `accountId` field.
    pub async fn report_account_id(&self) {
        let account = self.info.account_id.clone();
        self.set_root_field("reportAccountId", "accountId", Value::String(account))
            .await;
    }

    /// Millisecond timestamp of the last log write, if any.
    ///
    /// # Errors
    ///
    /// [`TaskLoggerError::Storage`] when the read fails.
    pub async fn get_last_update(&self) -> Result<Option<i64>, TaskLoggerError> {
        let value = self
            .shared
            .root
            .child(LAST_UPDATE_KEY)
            .get()
            .await?;
        Ok(value.and_then(|v| v.as_i64()))
    }

    /// Everything stored at the task root.
    ///
    /// # Errors
    ///
    /// [`TaskLoggerError::Storage`] when the read fails.
    pub async fn get_raw(&self) -> Result<Option<Value>, TaskLoggerError> {
        Ok(self.shared.root.get().await?)
    }

    /// Deletes every stored step. The in-memory step map is emptied too.
    ///
    /// # Errors
    ///
    /// [`TaskLoggerError::Storage`] when the delete fails.
    pub async fn clear_steps(&self) -> Result<(), TaskLoggerError> {
        self.shared.root.child(STEPS_KEY).remove().await?;
        self.steps.lock().clear();
        self.unwatch_steps();
        Ok(())
    }

    /// Deletes everything stored for the task.
    ///
    /// # Errors
    ///
    /// [`TaskLoggerError::Storage`] when the delete fails.
    pub async fn delete(&self) -> Result<(), TaskLoggerError> {
        self.shared.root.remove().await?;
        self.steps.lock().clear();
        self.unwatch_steps();
        tracing::info!(job_id = %self.info.job_id, "task deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::kv::KeyValueRef;
    use crate::store::memory::InMemoryKvBackend;
    use crate::store::strategy::StreamFields;
    use pretty_assertions::assert_eq;

    fn task(backend: &Arc<InMemoryKvBackend>) -> TaskLogger {
        let info = TaskInfo::new("A", "J");
        let root = KeyValueRef::for_task(backend.clone(), &info, "build-logs", StreamFields::default());
        TaskLogger::new(info, Arc::new(root)).unwrap()
    }

    #[test]
    fn new_rejects_missing_job_id() {
        let root: Arc<dyn StorageRef> = Arc::new(crate::store::NullRef::new());
        let err = TaskLogger::new(TaskInfo::new("A", ""), root).unwrap_err();
        assert_eq!(
            err.to_string(),
            "failed to create taskLogger because jobId must be provided"
        );
    }

    #[tokio::test]
    async fn create_indexes_and_mirrors_status() {
        let backend = Arc::new(InMemoryKvBackend::new());
        let task = task(&backend);
        let step = task.create("build", None, false).await;

        let index = backend.hash("build-logs:A:J:stepsReferences");
        assert_eq!(index.get("build").map(String::as_str), Some("pending"));

        step.start().await;
        let index = backend.hash("build-logs:A:J:stepsReferences");
        assert_eq!(index.get("build").map(String::as_str), Some("running"));

        let record = backend.hash("build-logs:A:J:steps:build");
        assert_eq!(record.get("name").map(String::as_str), Some("build"));
        assert_eq!(record.get("index").map(String::as_str), Some("0"));
    }

    #[tokio::test]
    async fn memory_limit_drops_unit() {
        let backend = Arc::new(InMemoryKvBackend::new());
        let task = task(&backend);
        task.set_memory_limit("512Mi").await;
        assert_eq!(task.memory_limit().as_deref(), Some("512"));
    }
}

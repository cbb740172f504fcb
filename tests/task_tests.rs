//! Task aggregate tests: step creation, restore, finish and fatal paths,
//! and the task-level fields.
//!
//! Most tests run over the in-memory key-value backend. Restore timeouts and
//! failures use [`StubRef`], a reference whose reads hang or fail on demand.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use task_logger::constants::error_line;
use task_logger::store::kv::{ConsolidatedRecord, KeyValueRef};
use task_logger::store::memory::InMemoryKvBackend;
use task_logger::store::strategy::StreamFields;
use task_logger::store::{StorageError, StorageRef, WatchCallback, WriteReceipt};
use task_logger::{
    EventReporting, LoggerConfig, Status, TaskInfo, TaskLogger, TaskLoggerError, Visibility,
};

const INDEX_KEY: &str = "build-logs:A:J:stepsReferences";

fn kv_root(backend: &Arc<InMemoryKvBackend>) -> KeyValueRef {
    KeyValueRef::for_task(
        backend.clone(),
        &TaskInfo::new("A", "J"),
        "build-logs",
        StreamFields::default(),
    )
}

fn task_on(backend: &Arc<InMemoryKvBackend>) -> TaskLogger {
    TaskLogger::new(TaskInfo::new("A", "J"), Arc::new(kv_root(backend))).unwrap()
}

async fn feed(backend: &Arc<InMemoryKvBackend>) -> Vec<ConsolidatedRecord> {
    kv_root(backend).consolidated_since(0).await.unwrap()
}

/// Reference whose reads either never answer or fail. Writes succeed.
#[derive(Debug, Clone)]
struct StubRef {
    hang: bool,
}

#[async_trait]
impl StorageRef for StubRef {
    fn child(&self, _name: &str) -> Arc<dyn StorageRef> {
        Arc::new(self.clone())
    }

    fn path(&self) -> &[String] {
        &[]
    }

    async fn push(&self, _value: Value) -> Result<WriteReceipt, StorageError> {
        Ok(WriteReceipt::unsequenced(""))
    }

    async fn set(&self, _value: Value) -> Result<WriteReceipt, StorageError> {
        Ok(WriteReceipt::unsequenced(""))
    }

    async fn update(&self, _value: Value) -> Result<WriteReceipt, StorageError> {
        Ok(WriteReceipt::unsequenced(""))
    }

    fn watch(&self, _callback: WatchCallback) {}

    fn unwatch(&self) {}

    fn reference(&self) -> String {
        "stub".to_string()
    }

    async fn get_hash(&self) -> Result<HashMap<String, String>, StorageError> {
        if self.hang {
            futures::future::pending::<()>().await;
        }
        Err(StorageError::Backend {
            message: "connection reset".to_string(),
            source: None,
        })
    }

    async fn children(&self) -> Result<Vec<Arc<dyn StorageRef>>, StorageError> {
        Ok(Vec::new())
    }

    async fn get(&self) -> Result<Option<Value>, StorageError> {
        Ok(None)
    }

    async fn remove(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

// ─── Construction ───────────────────────────────────────────────────────────

mod construction {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn open_with_default_config_uses_memory() {
        let task = TaskLogger::open(TaskInfo::new("A", "J"), &LoggerConfig::default())
            .await
            .unwrap();
        assert_eq!(task.reference(), "build-logs:A:J");
        assert!(task.steps().is_empty());
    }

    #[tokio::test]
    async fn open_requires_identity() {
        let err = TaskLogger::open(TaskInfo::new("", "J"), &LoggerConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskLoggerError::MissingAccountId));
        assert_eq!(
            err.to_string(),
            "failed to create taskLogger because accountId must be provided"
        );
    }
}

// ─── Step Creation ──────────────────────────────────────────────────────────

mod create {
    use super::*;
    use mockito::Matcher;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn create_is_idempotent() {
        let backend = Arc::new(InMemoryKvBackend::new());
        let task = task_on(&backend);

        let first = task.create("build", None, false).await;
        let writes = backend.write_count();
        let second = task.create("build", None, false).await;

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(backend.write_count(), writes);
        assert_eq!(task.steps().len(), 1);
        assert_eq!(backend.hash(INDEX_KEY).len(), 1);
    }

    #[tokio::test]
    async fn steps_keep_creation_order() {
        let backend = Arc::new(InMemoryKvBackend::new());
        let task = task_on(&backend);
        for name in ["clone", "build", "test"] {
            task.create(name, None, false).await;
        }
        let names: Vec<String> = task.steps().iter().map(|s| s.name().to_string()).collect();
        let indexes: Vec<usize> = task.steps().iter().map(|s| s.index()).collect();
        assert_eq!(names, vec!["clone", "build", "test"]);
        assert_eq!(indexes, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn create_with_reset_existing_reopens_step() {
        let backend = Arc::new(InMemoryKvBackend::new());
        let task = task_on(&backend);
        let step = task.create("build", None, false).await;
        step.start().await;
        step.finish(None, false).await;

        let again = task.create("build", None, true).await;
        assert_eq!(again.status(), Status::Pending);
        assert_eq!(
            backend.hash(INDEX_KEY).get("build").map(String::as_str),
            Some("pending")
        );
    }

    #[tokio::test]
    async fn status_changes_mirror_into_index() {
        let backend = Arc::new(InMemoryKvBackend::new());
        let task = task_on(&backend);
        let step = task.create("build", None, false).await;
        step.start().await;
        assert_eq!(
            backend.hash(INDEX_KEY).get("build").map(String::as_str),
            Some("running")
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn new_step_is_reported_once() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/events")
            .match_header("authorization", "plain-token")
            .match_body(Matcher::Json(json!({"action": "new-progress-step", "name": "build"})))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let backend = Arc::new(InMemoryKvBackend::new());
        let task = task_on(&backend);
        let reporting = EventReporting::new(format!("{}/events", server.url()), "plain-token");
        task.create("build", Some(&reporting), false).await;
        task.create("build", Some(&reporting), false).await;

        for _ in 0..50 {
            if mock.matched_async().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn unreachable_reporting_does_not_block_creation() {
        let backend = Arc::new(InMemoryKvBackend::new());
        let task = task_on(&backend);
        let reporting = EventReporting::new("http://127.0.0.1:9/events", "t");
        let step = task.create("build", Some(&reporting), false).await;
        assert_eq!(step.status(), Status::Pending);
        assert!(!step.is_inert());
    }
}

// ─── Restore ────────────────────────────────────────────────────────────────

mod restore {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn rebuilds_steps_from_index() {
        let backend = Arc::new(InMemoryKvBackend::new());
        {
            let task = task_on(&backend);
            let deploy = task.create("deploy", None, false).await;
            let build = task.create("build", None, false).await;
            build.start().await;
            build.finish(None, false).await;
            deploy.start().await;
            deploy.mark_pending_approval().await;
        }

        let task = task_on(&backend);
        assert_eq!(task.restore_existing_steps().await.unwrap(), 2);

        let names: Vec<String> = task.steps().iter().map(|s| s.name().to_string()).collect();
        assert_eq!(names, vec!["build", "deploy"]);

        let build = task.step("build").unwrap();
        assert_eq!(build.status(), Status::Success);
        assert!(!build.pending_approval());

        let deploy = task.step("deploy").unwrap();
        assert_eq!(deploy.status(), Status::PendingApproval);
        assert!(deploy.pending_approval());

        deploy.resume().await;
        deploy.finish(None, false).await;
        assert_eq!(deploy.status(), Status::Approved);
        assert_eq!(
            backend.hash(INDEX_KEY).get("deploy").map(String::as_str),
            Some("approved")
        );
    }

    #[tokio::test]
    async fn repeated_restore_mirrors_status_once() {
        let backend = Arc::new(InMemoryKvBackend::new());
        let task = task_on(&backend);
        task.create("build", None, false).await;
        task.restore_existing_steps().await.unwrap();
        task.restore_existing_steps().await.unwrap();

        let writes = backend.write_count();
        task.step("build").unwrap().start().await;
        // status, finishTimeStamp, creationTimeStamp and one index mirror
        assert_eq!(backend.write_count(), writes + 4);
        assert_eq!(
            backend.hash(INDEX_KEY).get("build").map(String::as_str),
            Some("running")
        );
    }

    #[tokio::test]
    async fn cleared_steps_are_watched_again_once() {
        let backend = Arc::new(InMemoryKvBackend::new());
        let task = task_on(&backend);
        task.create("build", None, false).await;
        task.clear_steps().await.unwrap();

        let step = task.create("build", None, false).await;
        let writes = backend.write_count();
        step.start().await;
        assert_eq!(backend.write_count(), writes + 4);
    }

    #[tokio::test]
    async fn unknown_statuses_are_skipped() {
        let backend = Arc::new(InMemoryKvBackend::new());
        let root = kv_root(&backend);
        root.child("stepsReferences")
            .update(json!({"build": "running", "legacy": "warning"}))
            .await
            .unwrap();

        let task = task_on(&backend);
        assert_eq!(task.restore_existing_steps().await.unwrap(), 1);
        assert!(task.step("legacy").is_none());
        assert_eq!(task.step("build").unwrap().status(), Status::Running);
    }

    #[tokio::test]
    async fn empty_index_restores_nothing() {
        let backend = Arc::new(InMemoryKvBackend::new());
        let task = task_on(&backend);
        assert_eq!(task.restore_existing_steps().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_backend_times_out() {
        let task = TaskLogger::new(TaskInfo::new("A", "J"), Arc::new(StubRef { hang: true }))
            .unwrap()
            .with_restore_timeout(5_000);
        task.create("build", None, false).await;

        let started = tokio::time::Instant::now();
        let err = task.restore_existing_steps().await.unwrap_err();
        assert!(started.elapsed() >= Duration::from_millis(5_000));
        assert!(matches!(err, TaskLoggerError::RestoreTimeout { timeout_ms: 5_000 }));
        assert!(err.to_string().starts_with("failed to restore"));
        assert_eq!(task.steps().len(), 1, "step map unchanged");
    }

    #[tokio::test]
    async fn failing_backend_reports_restore_failure() {
        let task =
            TaskLogger::new(TaskInfo::new("A", "J"), Arc::new(StubRef { hang: false })).unwrap();
        let err = task.restore_existing_steps().await.unwrap_err();
        assert!(matches!(err, TaskLoggerError::RestoreFailed(_)));
        assert!(err.to_string().starts_with("failed to restore"));
        assert!(task.steps().is_empty());
    }
}

// ─── Finish and Fatal ───────────────────────────────────────────────────────

mod closing {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn finish_closes_open_steps_only() {
        let backend = Arc::new(InMemoryKvBackend::new());
        let task = task_on(&backend);
        let running = task.create("running", None, false).await;
        let pending = task.create("pending", None, false).await;
        let done = task.create("done", None, false).await;
        running.start().await;
        done.start().await;
        done.finish(None, false).await;

        task.finish().await;
        assert!(task.is_finished());
        assert_eq!(running.status(), Status::Error);
        assert_eq!(pending.status(), Status::Pending);
        assert_eq!(done.status(), Status::Success);

        let records = feed(&backend).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].slot, "steps.running.logs");
        assert_eq!(records[0].payload, json!(error_line("Unknown error occurred")));
    }

    #[tokio::test]
    async fn create_after_finish_is_inert() {
        let backend = Arc::new(InMemoryKvBackend::new());
        let task = task_on(&backend);
        task.finish().await;
        let writes = backend.write_count();

        let late = task.create("late", None, false).await;
        late.start().await;
        late.write("x").await;
        assert!(late.is_inert());
        assert_eq!(backend.write_count(), writes);
        assert!(task.step("late").is_none());
    }

    #[tokio::test]
    async fn fatal_without_steps_creates_visible_step() {
        let backend = Arc::new(InMemoryKvBackend::new());
        let task = task_on(&backend);
        let cause = std::io::Error::other("image not found");
        task.fatal_error(Some(&cause)).await.unwrap();

        assert!(task.is_fatal());
        let step = task.step("Something went wrong").unwrap();
        assert_eq!(step.status(), Status::Error);
        let records = feed(&backend).await;
        assert_eq!(records[0].slot, "steps.Something went wrong.logs");
        assert_eq!(records[0].payload, json!(error_line("image not found")));
    }

    #[tokio::test]
    async fn fatal_freezes_the_task() {
        let backend = Arc::new(InMemoryKvBackend::new());
        let task = task_on(&backend);
        let step = task.create("build", None, false).await;
        step.start().await;
        let cause = std::io::Error::other("oom");
        task.fatal_error(Some(&cause)).await.unwrap();
        let writes = backend.write_count();

        step.info("after fatal").await;
        task.set_status(Status::Error).await;
        task.set_memory_limit("256Mi").await;
        task.add_error_message_to_end_of_steps("ignored").await.unwrap();
        let late = task.create("late", None, false).await;
        late.start().await;

        assert_eq!(backend.write_count(), writes);
        assert!(late.is_inert());
        assert!(task.fatal_error(Some(&cause)).await.is_ok());
    }

    fn assert_send<F: Send>(_: F) {}

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn closing_runs_on_spawned_workers() {
        let backend = Arc::new(InMemoryKvBackend::new());
        let task = Arc::new(task_on(&backend));
        let step = task.create("build", None, false).await;
        let cause = std::io::Error::other("boom");
        assert_send(step.finish(None, false));
        assert_send(task.finish());
        assert_send(task.fatal_error(Some(&cause)));

        let worker = Arc::clone(&step);
        tokio::spawn(async move {
            worker.start().await;
            worker.finish(Some(&"exit code 1"), false).await;
        })
        .await
        .unwrap();
        let closer = Arc::clone(&task);
        tokio::spawn(async move { closer.finish().await })
            .await
            .unwrap();

        assert_eq!(step.status(), Status::Error);
        assert!(task.is_finished());
    }

    #[tokio::test]
    async fn fatal_requires_a_cause() {
        let backend = Arc::new(InMemoryKvBackend::new());
        let task = task_on(&backend);
        let err = task.fatal_error(None).await.unwrap_err();
        assert!(matches!(err, TaskLoggerError::MissingFatalCause));
        assert!(!task.is_fatal());
    }
}

// ─── Task Fields ────────────────────────────────────────────────────────────

mod fields {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn error_message_goes_to_last_step() {
        let backend = Arc::new(InMemoryKvBackend::new());
        let task = task_on(&backend);
        task.create("build", None, false).await;
        let test = task.create("test", None, false).await;
        test.start().await;
        test.finish(None, false).await;

        task.add_error_message_to_end_of_steps("pipeline aborted")
            .await
            .unwrap();
        let records = feed(&backend).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].slot, "steps.test.logs");
        assert_eq!(records[0].payload, json!(error_line("pipeline aborted")));
    }

    #[tokio::test]
    async fn error_message_falls_back_to_stored_steps() {
        let backend = Arc::new(InMemoryKvBackend::new());
        {
            let task = task_on(&backend);
            task.create("a", None, false).await;
            task.create("b", None, false).await;
        }

        let task = task_on(&backend);
        task.add_error_message_to_end_of_steps("lost").await.unwrap();
        let records = feed(&backend).await;
        assert_eq!(records[0].slot, "steps.b.logs");
    }

    #[tokio::test]
    async fn memory_limit_drops_unit() {
        let backend = Arc::new(InMemoryKvBackend::new());
        let task = task_on(&backend);
        task.set_memory_limit("512Mi").await;
        task.update_memory_usage(1000, 200.0).await;

        assert_eq!(task.memory_limit().as_deref(), Some("512"));
        let records = feed(&backend).await;
        assert_eq!(records[0].slot, "metrics.limits.memory");
        assert_eq!(records[0].payload, json!("512"));
        assert_eq!(records[1].slot, "metrics.memory");
        assert_eq!(records[1].payload, json!({"time": 1000, "usage": 200.0}));
    }

    #[tokio::test]
    async fn task_fields_read_back_through_raw() {
        let backend = Arc::new(InMemoryKvBackend::new());
        let task = task_on(&backend);
        task.set_visibility(Visibility::Public).await;
        task.set_status(Status::Running).await;
        task.report_id().await;
        task.report_account_id().await;
        task.set_data(json!({"repo": "api"})).await;

        assert_eq!(
            task.get_raw().await.unwrap(),
            Some(json!({
                "accountId": "A",
                "id": "J",
                "status": "running",
                "visibility": "public"
            }))
        );
        assert_eq!(
            kv_root(&backend).child("data").get().await.unwrap(),
            Some(json!({"repo": "api"}))
        );
    }

    #[tokio::test]
    async fn clear_steps_and_delete() {
        let backend = Arc::new(InMemoryKvBackend::new());
        let task = task_on(&backend);
        let step = task.create("build", None, false).await;
        step.start().await;
        step.write("x").await;
        task.report_id().await;

        task.clear_steps().await.unwrap();
        assert!(task.steps().is_empty());
        assert!(backend.hash("build-logs:A:J:steps:build").is_empty());
        assert!(task.get_raw().await.unwrap().is_some());

        task.delete().await.unwrap();
        assert_eq!(task.get_raw().await.unwrap(), None);
        assert!(feed(&backend).await.is_empty());
    }

    #[tokio::test]
    async fn references_follow_the_key_layout() {
        let backend = Arc::new(InMemoryKvBackend::new());
        let task = task_on(&backend);
        let step = task.create("build", None, false).await;
        assert_eq!(step.get_reference(), "build-logs:A:J:steps:build");
        assert_eq!(step.get_logs_reference(), "build-logs:A:J:steps:build:logs");
        assert_eq!(step.get_last_update_reference(), "build-logs:A:J:lastUpdate");
        assert_eq!(
            task.get_metrics_logs_reference(),
            "build-logs:A:J:metrics:logs"
        );
    }
}

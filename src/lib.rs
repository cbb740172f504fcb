//! # task-logger
//!
//! Live progress tracking for multi-step build and deploy jobs.
//!
//! A [`TaskLogger`] tracks one job; its [`StepLogger`]s stream status, logs
//! and resource metrics to a remotely observable store, so a UI can follow
//! the job in real time and a restarted producer can pick up where it left
//! off ([`TaskLogger::restore_existing_steps`]).
//!
//! ## Storage
//!
//! Lifecycle code only sees [`StorageRef`](store::StorageRef), a capability
//! bound to one logical path. Two families of stores sit behind it:
//!
//! - flat key-value stores ([`store::kv`]), which emulate the document tree
//!   through the [`store::strategy`] chain and keep a per-task consolidated
//!   feed with strictly increasing sequence ids;
//! - the Firebase document store ([`store::document`]).
//!
//! [`store::pubsub::PubSubRef`] can wrap either to mirror every accepted
//! write onto a notification channel.
//!
//! ## Quick Start
//!
//! ```
//! use task_logger::{LoggerConfig, Status, TaskInfo, TaskLogger};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), task_logger::TaskLoggerError> {
//! let task = TaskLogger::open(TaskInfo::new("account", "job-1"), &LoggerConfig::default()).await?;
//!
//! let clone = task.create("clone", None, false).await;
//! clone.start().await;
//! clone.info("cloning repository").await;
//! clone.finish(None, false).await;
//! assert_eq!(clone.status(), Status::Success);
//!
//! task.finish().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Errors
//!
//! Construction, configuration, restore and fatal declarations return
//! [`TaskLoggerError`]. Everything a step does after that is fire-and-report:
//! refused or failed writes become [`events::TaskEvent`]s.

pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod factory;
#[cfg(feature = "logging")]
pub mod logging;
pub mod reporting;
pub mod step;
pub mod store;
pub mod task;
pub mod types;

pub use config::{BackendType, LoggerConfig};
pub use error::TaskLoggerError;
pub use events::{EventSink, TaskEvent, TaskEvents};
pub use step::StepLogger;
pub use task::TaskLogger;
pub use types::{EventReporting, Status, TaskInfo, Visibility};

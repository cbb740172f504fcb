//! Domain value types: status model and task identity.

pub mod status;
pub mod task;

pub use status::{finish_status, Status, UnknownStatus, Visibility};
pub use task::{EventReporting, TaskInfo};

mod task_action;
pub use task_action::TaskAction;

mod task_meta;
pub use task_meta::TaskMeta;

mod task_status;
pub use task_status::{ParseStatusError, TaskStatus};

/// Server-assigned task identifier, unique across the job server.
pub type TaskId = i64;

/// Execution attempt counter chosen by the server.
///
/// A new clock for the same [`TaskId`] means "run it again".
pub type Clock = i64;

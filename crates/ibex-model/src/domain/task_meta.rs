use crate::TaskMetaResponse;

/// Everything needed to materialise one task on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskMeta {
    pub script: String,
    /// Argument blob, `,,`-separated.
    pub args: String,
    /// Target account the script should run as.
    pub account: String,
    pub stdin: String,
}

impl From<TaskMetaResponse> for TaskMeta {
    fn from(resp: TaskMetaResponse) -> Self {
        Self {
            script: resp.script,
            args: resp.args,
            account: resp.account,
            stdin: resp.stdin,
        }
    }
}

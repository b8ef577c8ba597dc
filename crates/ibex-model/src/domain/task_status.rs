use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Externally visible state of one execution attempt.
///
/// The string labels are part of the server contract and are also the content of the done marker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum TaskStatus {
    /// Never observed (no attempt has started yet).
    #[default]
    Empty,
    /// A child process is executing.
    Running,
    /// A kill was requested and is in flight.
    Killing,
    /// Child exited successfully.
    Success,
    /// Child exited with an error.
    Failed,
    /// Child was terminated by a signal or by an explicit kill.
    Killed,
    /// Group kill failed.
    KillFailed,
    /// Reserved; not produced by the agent.
    Timeout,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown task status: {0:?}")]
pub struct ParseStatusError(pub String);

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Empty => "",
            TaskStatus::Running => "running",
            TaskStatus::Killing => "killing",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
            TaskStatus::Killed => "killed",
            TaskStatus::KillFailed => "killfailed",
            TaskStatus::Timeout => "timeout",
        }
    }

    /// Returns `true` once the attempt has ended and will not transition further.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success
                | TaskStatus::Failed
                | TaskStatus::Killed
                | TaskStatus::KillFailed
                | TaskStatus::Timeout
        )
    }
}

impl FromStr for TaskStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" => Ok(TaskStatus::Empty),
            "running" => Ok(TaskStatus::Running),
            "killing" => Ok(TaskStatus::Killing),
            "success" => Ok(TaskStatus::Success),
            "failed" => Ok(TaskStatus::Failed),
            "killed" => Ok(TaskStatus::Killed),
            "killfailed" => Ok(TaskStatus::KillFailed),
            "timeout" => Ok(TaskStatus::Timeout),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

impl TryFrom<String> for TaskStatus {
    type Error = ParseStatusError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TaskStatus> for String {
    fn from(status: TaskStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

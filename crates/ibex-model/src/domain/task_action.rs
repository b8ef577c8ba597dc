use std::fmt;

use serde::{Deserialize, Serialize};

/// What the server wants done with an assigned attempt.
///
/// Unknown labels are preserved so that a newer server never breaks decoding of a whole report.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskAction {
    /// The attempt should be running or have completed.
    Start,
    /// Stop the attempt now.
    Kill,
    Other(String),
}

impl TaskAction {
    pub fn as_str(&self) -> &str {
        match self {
            TaskAction::Start => "start",
            TaskAction::Kill => "kill",
            TaskAction::Other(s) => s.as_str(),
        }
    }
}

impl From<String> for TaskAction {
    fn from(value: String) -> Self {
        match value.as_str() {
            "start" => TaskAction::Start,
            "kill" => TaskAction::Kill,
            _ => TaskAction::Other(value),
        }
    }
}

impl From<&str> for TaskAction {
    fn from(value: &str) -> Self {
        TaskAction::from(value.to_string())
    }
}

impl From<TaskAction> for String {
    fn from(action: TaskAction) -> Self {
        match action {
            TaskAction::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for TaskAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_action_is_kept() {
        let action: TaskAction = serde_json::from_str(r#""pause""#).unwrap();
        assert_eq!(action, TaskAction::Other("pause".into()));
        assert_eq!(serde_json::to_string(&action).unwrap(), r#""pause""#);
    }

    #[test]
    fn known_actions() {
        assert_eq!(TaskAction::from("start"), TaskAction::Start);
        assert_eq!(TaskAction::from("kill"), TaskAction::Kill);
        assert_eq!(TaskAction::Kill.to_string(), "kill");
    }
}

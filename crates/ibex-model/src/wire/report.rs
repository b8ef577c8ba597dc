use serde::{Deserialize, Serialize};

use super::nullable;
use crate::{Clock, TaskAction, TaskId, TaskStatus};

/// One task as the agent currently sees it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReportTask {
    pub id: TaskId,
    pub clock: Clock,
    pub status: TaskStatus,
    /// Tail of captured stdout; only filled for terminal statuses.
    #[serde(default, deserialize_with = "nullable::string")]
    pub stdout: String,
    /// Tail of captured stderr; only filled for terminal statuses.
    #[serde(default, deserialize_with = "nullable::string")]
    pub stderr: String,
}

/// Argument of `Server.Report`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReportRequest {
    pub ident: String,
    #[serde(default, deserialize_with = "nullable::vec")]
    pub report_tasks: Vec<ReportTask>,
}

/// One entry of the server's authoritative assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AssignTask {
    pub id: TaskId,
    pub clock: Clock,
    pub action: TaskAction,
}

/// Reply to `Server.Report`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ReportResponse {
    #[serde(deserialize_with = "nullable::string")]
    pub message: String,
    #[serde(deserialize_with = "nullable::vec")]
    pub assign_tasks: Vec<AssignTask>,
}

impl AssignTask {
    pub fn new(id: TaskId, clock: Clock, action: impl Into<TaskAction>) -> Self {
        Self {
            id,
            clock,
            action: action.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_request_uses_server_field_names() {
        let req = ReportRequest {
            ident: "10.0.0.1".into(),
            report_tasks: vec![ReportTask {
                id: 3,
                clock: 7,
                status: TaskStatus::Success,
                stdout: "out".into(),
                stderr: String::new(),
            }],
        };

        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains(r#""Ident":"10.0.0.1""#));
        assert!(json.contains(r#""ReportTasks":[{"Id":3,"Clock":7,"Status":"success""#));
    }

    #[test]
    fn null_assignment_is_empty() {
        let resp: ReportResponse =
            serde_json::from_str(r#"{"Message":"","AssignTasks":null}"#).unwrap();
        assert!(resp.assign_tasks.is_empty());

        let resp: ReportResponse = serde_json::from_str("{}").unwrap();
        assert!(resp.assign_tasks.is_empty());
        assert!(resp.message.is_empty());
    }

    #[test]
    fn assignment_decodes_actions() {
        let resp: ReportResponse = serde_json::from_str(
            r#"{"Message":"","AssignTasks":[{"Id":2,"Clock":1,"Action":"kill"}]}"#,
        )
        .unwrap();
        assert_eq!(resp.assign_tasks, vec![AssignTask::new(2, 1, TaskAction::Kill)]);
    }
}

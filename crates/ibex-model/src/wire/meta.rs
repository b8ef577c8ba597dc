use serde::{Deserialize, Serialize};

use super::nullable;

/// Reply to `Server.GetTaskMeta`.
///
/// A non-empty `message` is a logical error; the other fields are meaningless then.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TaskMetaResponse {
    #[serde(deserialize_with = "nullable::string")]
    pub message: String,
    #[serde(deserialize_with = "nullable::string")]
    pub script: String,
    #[serde(deserialize_with = "nullable::string")]
    pub args: String,
    #[serde(deserialize_with = "nullable::string")]
    pub account: String,
    #[serde(deserialize_with = "nullable::string")]
    pub stdin: String,
}

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::protocol::ResponseCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Created,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            TaskStatus::Created => 0,
            TaskStatus::Running => 1,
            TaskStatus::Completed | TaskStatus::Failed => 2,
        }
    }

    /// Status only moves forward, and never leaves a terminal state.
    pub fn can_advance_to(self, next: TaskStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Created => write!(f, "created"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Script,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Script => write!(f, "script"),
        }
    }
}

/// Outcome classification of a script run. Exactly one applies per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScriptErrorCode {
    CreateTempFileFailed,
    WriteTempFileFailed,
    CloseTempFileFailed,
    ChmodTempFileFailed,
    StartFailed,
    Timeout,
    Stopped,
    Success,
}

impl ScriptErrorCode {
    pub fn response_code(self) -> ResponseCode {
        match self {
            ScriptErrorCode::Success => ResponseCode::Success,
            ScriptErrorCode::Timeout => ResponseCode::Timeout,
            _ => ResponseCode::Error,
        }
    }
}

impl std::fmt::Display for ScriptErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ScriptErrorCode::CreateTempFileFailed => "CREATE_TEMP_FILE_FAILED",
            ScriptErrorCode::WriteTempFileFailed => "WRITE_TEMP_FILE_FAILED",
            ScriptErrorCode::CloseTempFileFailed => "CLOSE_TEMP_FILE_FAILED",
            ScriptErrorCode::ChmodTempFileFailed => "CHMOD_TEMP_FILE_FAILED",
            ScriptErrorCode::StartFailed => "START_FAILED",
            ScriptErrorCode::Timeout => "TIMEOUT",
            ScriptErrorCode::Stopped => "STOPPED",
            ScriptErrorCode::Success => "SUCCESS",
        };
        write!(f, "{}", text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptResult {
    pub task_id: String,
    pub code: ScriptErrorCode,
    pub stdout: String,
    pub stderr: String,
    pub error: String,
    /// Absent when the process never exited on its own (timeout, stop, signal).
    pub exit_code: Option<i32>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl ScriptResult {
    /// Result of a run that ended before or instead of a normal exit.
    pub fn failed(task_id: &str, code: ScriptErrorCode, error: impl Into<String>) -> Self {
        Self {
            task_id: task_id.to_string(),
            code,
            stdout: String::new(),
            stderr: String::new(),
            error: error.into(),
            exit_code: None,
            start_time: None,
            end_time: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == ScriptErrorCode::Success
    }
}

/// Body of a `v1/ExecuteScript` request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptTaskRequest {
    #[serde(default, alias = "task_id")]
    pub task_id: String,
    #[serde(rename = "type", default)]
    pub task_type: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub work_dir: Option<String>,
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default, alias = "Env")]
    pub env: HashMap<String, String>,
    #[serde(default, alias = "timeout")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub interpreter: Option<String>,
    #[serde(default)]
    pub stdin: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptTaskRecord {
    pub id: String,
    pub status: TaskStatus,
    pub request: ScriptTaskRequest,
    pub result: Option<ScriptResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Point-in-time state of a task, tagged by kind. This is the durable format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskRecord {
    Script(ScriptTaskRecord),
}

impl TaskRecord {
    pub fn id(&self) -> &str {
        match self {
            TaskRecord::Script(r) => &r.id,
        }
    }

    pub fn kind(&self) -> TaskKind {
        match self {
            TaskRecord::Script(_) => TaskKind::Script,
        }
    }

    pub fn status(&self) -> TaskStatus {
        match self {
            TaskRecord::Script(r) => r.status,
        }
    }

    pub fn content(&self) -> &[u8] {
        match self {
            TaskRecord::Script(r) => r.request.content.as_bytes(),
        }
    }

    pub fn result_value(&self) -> Value {
        match self {
            TaskRecord::Script(r) => r
                .result
                .as_ref()
                .and_then(|res| serde_json::to_value(res).ok())
                .unwrap_or(Value::Null),
        }
    }

    /// Mark a record left non-terminal by a previous process as failed.
    pub fn interrupted(self) -> Self {
        match self {
            TaskRecord::Script(mut r) => {
                if !r.status.is_terminal() {
                    r.status = TaskStatus::Failed;
                    r.updated_at = Utc::now();
                    r.result = Some(ScriptResult::failed(
                        &r.id,
                        ScriptErrorCode::Stopped,
                        "agent restarted before the task finished",
                    ));
                }
                TaskRecord::Script(r)
            }
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Reply body for task-info queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    pub task_id: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub result: Value,
}

impl From<&TaskRecord> for TaskInfo {
    fn from(record: &TaskRecord) -> Self {
        Self {
            task_id: record.id().to_string(),
            kind: record.kind(),
            status: record.status(),
            result: record.result_value(),
        }
    }
}

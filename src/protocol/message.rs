use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;

/// Routing keys understood by the agent and the control plane.
pub mod types {
    pub const REGISTER: &str = "Register";
    pub const HEARTBEAT: &str = "Heartbeat";
    pub const EXECUTE_SCRIPT: &str = "v1/ExecuteScript";
    pub const EXECUTE_SCRIPT_RESPONSE: &str = "v1/ExecuteScript/Response";
    pub const GET_TASK_INFO: &str = "v1/GetTaskInfo";
    pub const GET_TASK_INFO_RESPONSE: &str = "v1/GetTaskInfo/Response";
    pub const DOWNLOAD_FILE: &str = "v1/DownloadFile";
    pub const GET_FILE_INFO: &str = "v1/GetFileInfo";
    pub const DELETE_FILE: &str = "v1/DeleteFile";
    pub const MOVE_FILE: &str = "v1/MoveFile";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    #[default]
    Request,
    Response,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Method::Request => write!(f, "request"),
            Method::Response => write!(f, "response"),
        }
    }
}

/// Machine-readable outcome carried by responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseCode {
    Success,
    Error,
    Timeout,
}

impl std::fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseCode::Success => write!(f, "success"),
            ResponseCode::Error => write!(f, "error"),
            ResponseCode::Timeout => write!(f, "timeout"),
        }
    }
}

impl FromStr for ResponseCode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "success" => Ok(ResponseCode::Success),
            "error" => Ok(ResponseCode::Error),
            "timeout" => Ok(ResponseCode::Timeout),
            other => Err(format!("unknown response code: {}", other)),
        }
    }
}

/// Requests travel with `"code": ""`; map that to `None` and back. Codes this
/// agent does not know also decode as `None` so the frame still routes.
mod optional_code {
    use super::ResponseCode;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        code: &Option<ResponseCode>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match code {
            Some(code) => code.serialize(serializer),
            None => serializer.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<ResponseCode>, D::Error> {
        match Option::<String>::deserialize(deserializer)?.as_deref() {
            None | Some("") => Ok(None),
            Some(raw) => match raw.parse() {
                Ok(code) => Ok(Some(code)),
                Err(e) => {
                    tracing::warn!(code = %raw, error = %e, "Ignoring unrecognised response code");
                    Ok(None)
                }
            },
        }
    }
}

/// One frame on the control-plane session.
///
/// `id` correlates a request with its response; a response echoes the
/// request's `id`, `type`, `traceId` and `taskId`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub msg_type: String,
    #[serde(default)]
    pub method: Method,
    #[serde(default)]
    pub data: Value,
    #[serde(default, with = "optional_code")]
    pub code: Option<ResponseCode>,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub trace_id: String,
    #[serde(default)]
    pub task_id: String,
    /// Handler deadline in seconds; 0 means none.
    #[serde(default)]
    pub timeout: u64,
}

impl Message {
    /// Build a request with a fresh correlation id.
    pub fn request(msg_type: &str, data: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            msg_type: msg_type.to_string(),
            method: Method::Request,
            data,
            ..Default::default()
        }
    }

    /// Build the response to this message, keeping its correlation fields.
    pub fn reply(&self, code: ResponseCode, msg: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            from: String::new(),
            to: self.from.clone(),
            id: self.id.clone(),
            msg_type: self.msg_type.clone(),
            method: Method::Response,
            data: data.unwrap_or(Value::Null),
            code: Some(code),
            msg: msg.into(),
            trace_id: self.trace_id.clone(),
            task_id: self.task_id.clone(),
            timeout: 0,
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Deadline declared by the sender, if any.
    pub fn deadline(&self) -> Option<Duration> {
        (self.timeout > 0).then(|| Duration::from_secs(self.timeout))
    }

    pub fn is_response(&self) -> bool {
        self.method == Method::Response
    }
}

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::executor::ExecutorAnnouncement;

pub const RUN_ACTION: &str = "RUN";

/// A `RUN` request after boundary parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRequest {
    pub execution_ids: Vec<Value>,
    pub workspaces: Vec<String>,
    pub executor: Option<String>,
    pub args: Map<String, Value>,
    pub plugin_args: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    InvalidJson(String),
    MissingAction,
    UnrecognizedAction(String),
    MissingExecutionIds,
    MissingWorkspaces,
    InvalidField { field: &'static str, expected: &'static str },
}

impl ProtocolError {
    /// Structured reply the server expects for a rejected frame.
    pub fn response(&self) -> Value {
        match self {
            Self::InvalidJson(_) => json!({ "error": "Invalid JSON message" }),
            Self::MissingAction => {
                json!({ "error": "'action' key is mandatory in this websocket connection" })
            }
            Self::UnrecognizedAction(action) => {
                let mut body = Map::new();
                body.insert(
                    format!("{action}_RESPONSE"),
                    Value::String("Error: Unrecognized action".to_owned()),
                );
                Value::Object(body)
            }
            Self::MissingExecutionIds => json!({
                "error": "'execution_ids' key is mandatory in this websocket connection"
            }),
            Self::MissingWorkspaces => json!({
                "error": "'workspaces' key is mandatory in this websocket connection"
            }),
            Self::InvalidField { field, expected } => json!({
                "error": format!("'{field}' key must be {expected}")
            }),
        }
    }
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidJson(err) => write!(f, "invalid json frame: {err}"),
            Self::MissingAction => f.write_str("frame without action"),
            Self::UnrecognizedAction(action) => write!(f, "unrecognized action {action}"),
            Self::MissingExecutionIds => f.write_str("run without execution_ids"),
            Self::MissingWorkspaces => f.write_str("run without workspaces"),
            Self::InvalidField { field, expected } => {
                write!(f, "field {field} must be {expected}")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Parses one inbound text frame. Checks run in a fixed order so a frame with
/// several problems always yields the same single error.
pub fn parse_inbound(text: &str) -> Result<RunRequest, ProtocolError> {
    let frame: Value =
        serde_json::from_str(text).map_err(|err| ProtocolError::InvalidJson(err.to_string()))?;
    let Value::Object(mut frame) = frame else {
        return Err(ProtocolError::MissingAction);
    };

    let action = match frame.get("action") {
        Some(Value::String(action)) if !action.trim().is_empty() => action.trim().to_owned(),
        _ => return Err(ProtocolError::MissingAction),
    };
    if action != RUN_ACTION {
        return Err(ProtocolError::UnrecognizedAction(action));
    }

    let execution_ids = match take_either(&mut frame, "execution_ids", "execution_id") {
        Some(Value::Array(ids)) if !ids.is_empty() => ids,
        Some(Value::Null) | None => return Err(ProtocolError::MissingExecutionIds),
        Some(Value::Array(_)) => return Err(ProtocolError::MissingExecutionIds),
        Some(single) => vec![single],
    };

    let workspaces = match take_either(&mut frame, "workspaces", "workspace") {
        Some(Value::Array(items)) => {
            let mut workspaces = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(name) if !name.trim().is_empty() => {
                        workspaces.push(name.trim().to_owned())
                    }
                    _ => {
                        return Err(ProtocolError::InvalidField {
                            field: "workspaces",
                            expected: "a list of workspace names",
                        })
                    }
                }
            }
            workspaces
        }
        Some(Value::String(name)) if !name.trim().is_empty() => vec![name.trim().to_owned()],
        _ => Vec::new(),
    };
    if workspaces.is_empty() {
        return Err(ProtocolError::MissingWorkspaces);
    }

    let executor = match frame.remove("executor") {
        Some(Value::String(name)) if !name.trim().is_empty() => Some(name.trim().to_owned()),
        _ => None,
    };
    let args = take_object(&mut frame, "args")?;
    let plugin_args = take_object(&mut frame, "plugin_args")?;

    Ok(RunRequest {
        execution_ids,
        workspaces,
        executor,
        args,
        plugin_args,
    })
}

fn take_either(frame: &mut Map<String, Value>, plural: &str, singular: &str) -> Option<Value> {
    frame.remove(plural).or_else(|| frame.remove(singular))
}

fn take_object(
    frame: &mut Map<String, Value>,
    field: &'static str,
) -> Result<Map<String, Value>, ProtocolError> {
    match frame.remove(field) {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map),
        Some(_) => Err(ProtocolError::InvalidField {
            field,
            expected: "an object",
        }),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunStatus {
    pub execution_ids: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub running: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub successful: Option<bool>,
    pub message: String,
}

impl RunStatus {
    pub fn rejected(
        execution_ids: &[Value],
        executor_name: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            execution_ids: execution_ids.to_vec(),
            executor_name: executor_name.map(str::to_owned),
            running: Some(false),
            successful: None,
            message: message.into(),
        }
    }

    pub fn running(execution_ids: &[Value], executor_name: &str, message: String) -> Self {
        Self {
            execution_ids: execution_ids.to_vec(),
            executor_name: Some(executor_name.to_owned()),
            running: Some(true),
            successful: None,
            message,
        }
    }

    pub fn finished(
        execution_ids: &[Value],
        executor_name: &str,
        successful: bool,
        message: String,
    ) -> Self {
        Self {
            execution_ids: execution_ids.to_vec(),
            executor_name: Some(executor_name.to_owned()),
            running: Some(false),
            successful: Some(successful),
            message,
        }
    }
}

/// Frames the agent writes to the channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action")]
pub enum AgentMessage {
    #[serde(rename = "JOIN_AGENT")]
    Join {
        token: String,
        executors: Vec<ExecutorAnnouncement>,
    },
    #[serde(rename = "RUN_STATUS")]
    RunStatus(RunStatus),
    #[serde(rename = "LEAVE_AGENT")]
    Leave { token: String, reason: String },
}

impl AgentMessage {
    pub fn to_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

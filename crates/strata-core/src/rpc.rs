//! Wire envelope between the control plane and agents.
//!
//! The transport only pushes messages in both directions. A call is a [`RpcRequest`]
//! pushed to the agent, answered later by an [`AgentMessage::Response`] carrying the same
//! transaction id.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::ids::{AgentKey, JobRunTaskId, TransactionId};

/// Methods the control plane may invoke on an agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RpcMethod {
    TestSqlServer,
    GetDatabaseList,
    Run,
    Stop,
    Encrypt,
}

impl RpcMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TestSqlServer => "TestSqlServer",
            Self::GetDatabaseList => "GetDatabaseList",
            Self::Run => "Run",
            Self::Stop => "Stop",
            Self::Encrypt => "Encrypt",
        }
    }
}

impl std::fmt::Display for RpcMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RpcMethod {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TestSqlServer" => Ok(Self::TestSqlServer),
            "GetDatabaseList" => Ok(Self::GetDatabaseList),
            "Run" => Ok(Self::Run),
            "Stop" => Ok(Self::Stop),
            "Encrypt" => Ok(Self::Encrypt),
            other => Err(format!("Method not found: {other}")),
        }
    }
}

/// `{ transactionId, request, payload }` where payload is a JSON array of arguments
/// serialized to a string.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcRequest {
    pub transaction_id: TransactionId,
    pub request: String,
    pub payload: String,
}

impl RpcRequest {
    pub fn new(method: RpcMethod, args: Vec<serde_json::Value>) -> Result<Self, serde_json::Error> {
        Ok(Self {
            transaction_id: TransactionId::new(),
            request: method.as_str().to_string(),
            payload: serde_json::to_string(&args)?,
        })
    }

    pub fn method(&self) -> Result<RpcMethod, String> {
        self.request.parse()
    }

    pub fn args(&self) -> Result<Vec<serde_json::Value>, String> {
        serde_json::from_str(&self.payload).map_err(|e| format!("Invalid payload: {e}"))
    }
}

/// Decode the positional argument at `index`.
pub fn arg<T: DeserializeOwned>(args: &[serde_json::Value], index: usize) -> Result<T, String> {
    let value = args
        .get(index)
        .cloned()
        .unwrap_or(serde_json::Value::Null);
    serde_json::from_value(value).map_err(|e| format!("Invalid argument {index}: {e}"))
}

/// `{ transactionId, result, error }`. Exactly one of `result`/`error` is set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcResult {
    pub transaction_id: TransactionId,
    pub result: Option<String>,
    pub error: Option<String>,
}

impl RpcResult {
    pub fn ok<T: Serialize>(transaction_id: TransactionId, value: &T) -> Self {
        match serde_json::to_string(value) {
            Ok(json) => Self {
                transaction_id,
                result: Some(json),
                error: None,
            },
            Err(e) => Self::error(transaction_id, format!("Cannot serialize result: {e}")),
        }
    }

    pub fn error(transaction_id: TransactionId, message: impl Into<String>) -> Self {
        Self {
            transaction_id,
            result: None,
            error: Some(message.into()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgress {
    pub job_run_task_id: JobRunTaskId,
    pub message: String,
    pub is_error: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskComplete {
    pub job_run_task_id: JobRunTaskId,
    pub message: String,
    pub result_artifact: Option<String>,
    pub is_error: bool,
}

/// Frames pushed by the control plane to an agent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    Request(RpcRequest),
    /// Sent before closing a connection whose `Connect` was refused.
    Rejected { reason: String },
}

/// Frames pushed by an agent to the control plane.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AgentMessage {
    #[serde(rename_all = "camelCase")]
    Connect { agent_key: AgentKey },
    Response(RpcResult),
    TaskProgress(TaskProgress),
    TaskComplete(TaskComplete),
}

impl AgentMessage {
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Response(_) => "response",
            Self::TaskProgress(_) => "taskProgress",
            Self::TaskComplete(_) => "taskComplete",
        }
    }
}

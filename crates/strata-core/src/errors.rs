use std::time::Duration;

use crate::ids::{AgentKey, JobRunTaskId};
use crate::models::TaskKind;

/// Failures of dispatching work to agents and executing it there.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum OrchestrationError {
    #[error("no connection found for agent {0}")]
    AgentUnreachable(AgentKey),

    #[error("no response received within {0:?}")]
    RpcTimeout(Duration),

    /// Opaque error payload reported by the agent.
    #[error("agent reported an error: {0}")]
    RemoteFault(String),

    #[error("unknown task type {0}")]
    UnknownTaskType(TaskKind),

    #[error("task {0} is already running")]
    DuplicateDispatch(JobRunTaskId),

    #[error("could not enter the dispatch gate within {0:?}")]
    DispatchGateTimeout(Duration),

    #[error("dispatch of task {0} was cancelled")]
    DispatchCancelled(JobRunTaskId),

    #[error("task {task_id} failed: {message}")]
    TaskExecutionError {
        task_id: JobRunTaskId,
        message: String,
    },
}

impl OrchestrationError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AgentUnreachable(_) => "agent_unreachable",
            Self::RpcTimeout(_) => "rpc_timeout",
            Self::RemoteFault(_) => "remote_fault",
            Self::UnknownTaskType(_) => "unknown_task_type",
            Self::DuplicateDispatch(_) => "duplicate_dispatch",
            Self::DispatchGateTimeout(_) => "dispatch_gate_timeout",
            Self::DispatchCancelled(_) => "dispatch_cancelled",
            Self::TaskExecutionError { .. } => "task_execution_error",
        }
    }

    /// Whether the failure happened before the remote side could act on the request.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::AgentUnreachable(_) | Self::RpcTimeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = OrchestrationError::AgentUnreachable(AgentKey::from("db-01"));
        assert_eq!(err.to_string(), "no connection found for agent db-01");

        let err = OrchestrationError::UnknownTaskType(TaskKind::Upload);
        assert_eq!(err.to_string(), "unknown task type upload");

        let err = OrchestrationError::TaskExecutionError {
            task_id: JobRunTaskId::from_raw("rtask_1"),
            message: "disk full".into(),
        };
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn transport_classification() {
        assert!(OrchestrationError::RpcTimeout(Duration::from_secs(30)).is_transport());
        assert!(OrchestrationError::AgentUnreachable(AgentKey::from("a")).is_transport());
        assert!(!OrchestrationError::RemoteFault("x".into()).is_transport());
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(
            OrchestrationError::DispatchGateTimeout(Duration::from_secs(30)).error_kind(),
            "dispatch_gate_timeout"
        );
        assert_eq!(
            OrchestrationError::DuplicateDispatch(JobRunTaskId::from_raw("t")).error_kind(),
            "duplicate_dispatch"
        );
    }
}

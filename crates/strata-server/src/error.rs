use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use strata_core::ids::{JobId, JobRunId, JobTaskId};
use strata_core::OrchestrationError;
use strata_store::StoreError;

/// Failures of control-plane run operations.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Orchestration(#[from] OrchestrationError),
    #[error("job {0} has no tasks")]
    EmptyJob(JobId),
    #[error("job {job_id} is already running as {run_id}")]
    AlreadyRunning { job_id: JobId, run_id: JobRunId },
    #[error("run {0} is already completed")]
    AlreadyCompleted(JobRunId),
    #[error("invalid settings for task {task_id}: {message}")]
    InvalidTask { task_id: JobTaskId, message: String },
}

impl RunError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::AlreadyRunning { .. } | Self::AlreadyCompleted(_) => StatusCode::CONFLICT,
            Self::EmptyJob(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Orchestration(_) => StatusCode::BAD_GATEWAY,
            Self::Store(_) | Self::InvalidTask { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RunError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(
            RunError::Store(StoreError::NotFound("job x".into())).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            RunError::AlreadyCompleted(JobRunId::from_raw("run_1")).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            RunError::from(OrchestrationError::RemoteFault("x".into())).status_code(),
            StatusCode::BAD_GATEWAY
        );
    }
}

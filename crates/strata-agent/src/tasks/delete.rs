use async_trait::async_trait;

use strata_core::models::{TaskKind, TaskSettings};

use crate::executor::{TaskContext, TaskError, TaskExecutor, TaskOutcome};

/// Removes a local file. Earlier steps are never rolled back on failure.
pub struct DeleteExecutor;

#[async_trait]
impl TaskExecutor for DeleteExecutor {
    fn kind(&self) -> TaskKind {
        TaskKind::Delete
    }

    async fn run(&self, ctx: &TaskContext) -> Result<TaskOutcome, TaskError> {
        let TaskSettings::Delete(settings) = &ctx.task.settings else {
            return Err(TaskError::InvalidSettings("expected delete settings".into()));
        };
        let path = match settings.path.as_deref() {
            Some(path) if !path.is_empty() => path.to_string(),
            _ => ctx.previous_artifact()?.to_string(),
        };
        ctx.check_cancelled()?;

        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(TaskOutcome {
                message: format!("Deleted {path}"),
                artifact: None,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && settings.ignore_missing => {
                Ok(TaskOutcome {
                    message: format!("{path} did not exist"),
                    artifact: None,
                })
            }
            Err(e) => Err(TaskError::Command(format!("Cannot delete {path}: {e}"))),
        }
    }
}

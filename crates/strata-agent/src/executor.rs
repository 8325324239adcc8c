//! Contract shared by every task kind.
//!
//! An executor reports progress through its [`TaskContext`] and returns once. The runner turns
//! that return value into the single completion event for the task, so an executor can never
//! complete twice or forget to complete.

use std::path::Path;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use strata_core::ids::JobRunTaskId;
use strata_core::models::{JobRunTask, TaskKind};
use strata_core::rpc::{AgentMessage, TaskProgress};
use strata_core::secrets::SecretError;

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task was cancelled")]
    Cancelled,

    #[error("No artifact available from the previous task")]
    MissingArtifact,

    #[error("Invalid task settings: {0}")]
    InvalidSettings(String),

    #[error("Cannot decrypt connection string password: {0}")]
    Secret(#[from] SecretError),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Command(String),

    #[error("Task crashed: {0}")]
    Crashed(String),
}

/// Successful result of a task body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskOutcome {
    pub message: String,
    pub artifact: Option<String>,
}

/// Emits progress lines for one task. Cloneable into blocking sections.
#[derive(Clone, Debug)]
pub struct ProgressReporter {
    task_id: JobRunTaskId,
    events: mpsc::Sender<AgentMessage>,
}

impl ProgressReporter {
    pub fn new(task_id: JobRunTaskId, events: mpsc::Sender<AgentMessage>) -> Self {
        Self { task_id, events }
    }

    pub async fn report(&self, message: impl Into<String>, is_error: bool) {
        let _ = self.events.send(self.message(message.into(), is_error)).await;
    }

    /// For use from `spawn_blocking` sections only.
    pub fn report_blocking(&self, message: impl Into<String>) {
        let _ = self.events.blocking_send(self.message(message.into(), false));
    }

    fn message(&self, message: String, is_error: bool) -> AgentMessage {
        AgentMessage::TaskProgress(TaskProgress {
            job_run_task_id: self.task_id.clone(),
            message,
            is_error,
        })
    }
}

/// Everything an executor sees while it runs.
pub struct TaskContext {
    pub task: JobRunTask,
    pub previous: Option<JobRunTask>,
    pub cancel: CancellationToken,
    reporter: ProgressReporter,
}

impl TaskContext {
    pub fn new(
        task: JobRunTask,
        previous: Option<JobRunTask>,
        cancel: CancellationToken,
        events: mpsc::Sender<AgentMessage>,
    ) -> Self {
        let reporter = ProgressReporter::new(task.id.clone(), events);
        Self {
            task,
            previous,
            cancel,
            reporter,
        }
    }

    pub async fn progress(&self, message: impl Into<String>) {
        self.reporter.report(message, false).await;
    }

    pub async fn warn(&self, message: impl Into<String>) {
        self.reporter.report(message, true).await;
    }

    pub fn reporter(&self) -> ProgressReporter {
        self.reporter.clone()
    }

    /// Cooperative cancellation point.
    pub fn check_cancelled(&self) -> Result<(), TaskError> {
        if self.cancel.is_cancelled() {
            Err(TaskError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Artifact produced by the predecessor run task for this item.
    pub fn previous_artifact(&self) -> Result<&str, TaskError> {
        self.previous
            .as_ref()
            .and_then(|p| p.result_artifact.as_deref())
            .filter(|a| !a.is_empty())
            .ok_or(TaskError::MissingArtifact)
    }
}

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    fn kind(&self) -> TaskKind;

    async fn run(&self, ctx: &TaskContext) -> Result<TaskOutcome, TaskError>;
}

/// Replace `{Token}` placeholders in a file-name template.
pub fn render_template(template: &str, tokens: &[(&str, &str)]) -> String {
    let mut rendered = template.to_string();
    for (name, value) in tokens {
        rendered = rendered.replace(&format!("{{{name}}}"), value);
    }
    rendered
}

/// Make an item name safe to embed in a single path component.
pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

/// Final path component of an artifact reference.
pub fn artifact_file_name(artifact: &str) -> String {
    Path::new(artifact)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| sanitize_file_name(artifact))
}

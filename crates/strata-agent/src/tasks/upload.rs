use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::warn;

use strata_core::models::{TaskKind, TaskSettings};

use crate::executor::{
    artifact_file_name, render_template, sanitize_file_name, TaskContext, TaskError, TaskExecutor,
    TaskOutcome,
};

/// Where uploaded artifacts go. Returns the remote reference of the stored object.
#[async_trait]
pub trait UploadTarget: Send + Sync {
    async fn upload(
        &self,
        source: &Path,
        destination: &str,
        object_name: &str,
        ctx: &TaskContext,
    ) -> Result<String, TaskError>;
}

/// Copies artifacts into a directory, e.g. a mounted share.
pub struct FileSystemTarget;

#[async_trait]
impl UploadTarget for FileSystemTarget {
    async fn upload(
        &self,
        source: &Path,
        destination: &str,
        object_name: &str,
        ctx: &TaskContext,
    ) -> Result<String, TaskError> {
        if destination.is_empty() {
            return Err(TaskError::InvalidSettings("upload destination is empty".into()));
        }
        let target = PathBuf::from(destination).join(object_name);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut input = tokio::fs::File::open(source).await?;
        let total = input.metadata().await?.len();
        let mut output = tokio::fs::File::create(&target).await?;
        let mut buffer = vec![0u8; 256 * 1024];
        let mut copied: u64 = 0;
        let mut last_reported: u64 = 0;

        loop {
            if ctx.cancel.is_cancelled() {
                drop(output);
                let _ = tokio::fs::remove_file(&target).await;
                return Err(TaskError::Cancelled);
            }
            let read = input.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            output.write_all(&buffer[..read]).await?;
            copied += read as u64;
            if total > 0 {
                let percent = copied * 100 / total;
                if percent >= last_reported + 25 {
                    last_reported = percent - percent % 25;
                    ctx.progress(format!("Uploaded {percent}%")).await;
                }
            }
        }
        output.flush().await?;
        output.sync_all().await?;
        Ok(target.to_string_lossy().into_owned())
    }
}

/// Uploads the predecessor's artifact. A failed upload is final for the item.
pub struct UploadExecutor {
    target: Arc<dyn UploadTarget>,
}

impl UploadExecutor {
    pub fn new(target: Arc<dyn UploadTarget>) -> Self {
        Self { target }
    }
}

#[async_trait]
impl TaskExecutor for UploadExecutor {
    fn kind(&self) -> TaskKind {
        TaskKind::Upload
    }

    async fn run(&self, ctx: &TaskContext) -> Result<TaskOutcome, TaskError> {
        let TaskSettings::Upload(settings) = &ctx.task.settings else {
            return Err(TaskError::InvalidSettings("expected upload settings".into()));
        };
        let source = ctx.previous_artifact()?.to_string();
        let item = sanitize_file_name(&ctx.task.item_name);
        let artifact_name = artifact_file_name(&source);
        let object_name = render_template(
            &settings.file_name,
            &[("ItemName", item.as_str()), ("ArtifactName", artifact_name.as_str())],
        );

        ctx.progress(format!("Uploading {source} to {}", settings.destination))
            .await;
        let reference = self
            .target
            .upload(Path::new(&source), &settings.destination, &object_name, ctx)
            .await
            .inspect_err(|e| {
                warn!(job_run_task_id = %ctx.task.id, error = %e, "upload failed");
            })?;

        Ok(TaskOutcome {
            message: format!("Uploaded {source} to {reference}"),
            artifact: Some(reference),
        })
    }
}

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio_util::sync::CancellationToken;

use strata_core::models::{TaskKind, TaskSettings};

use crate::executor::{
    artifact_file_name, render_template, sanitize_file_name, ProgressReporter, TaskContext,
    TaskError, TaskExecutor, TaskOutcome,
};

const CHUNK_SIZE: usize = 256 * 1024;

/// Gzips the predecessor's artifact.
pub struct CompressExecutor {
    temp_path: PathBuf,
}

impl CompressExecutor {
    pub fn new(temp_path: PathBuf) -> Self {
        Self { temp_path }
    }
}

#[async_trait]
impl TaskExecutor for CompressExecutor {
    fn kind(&self) -> TaskKind {
        TaskKind::Compress
    }

    async fn run(&self, ctx: &TaskContext) -> Result<TaskOutcome, TaskError> {
        let TaskSettings::Compress(settings) = &ctx.task.settings else {
            return Err(TaskError::InvalidSettings("expected compress settings".into()));
        };
        if settings.level > 9 {
            return Err(TaskError::InvalidSettings(format!(
                "compression level {} is out of range 0-9",
                settings.level
            )));
        }
        let source = PathBuf::from(ctx.previous_artifact()?);
        let item = sanitize_file_name(&ctx.task.item_name);
        let artifact_name = artifact_file_name(&source.to_string_lossy());
        let file_name = render_template(
            &settings.file_name,
            &[("ItemName", item.as_str()), ("ArtifactName", artifact_name.as_str())],
        );
        tokio::fs::create_dir_all(&self.temp_path).await?;
        let destination = self.temp_path.join(file_name);

        ctx.progress(format!("Compressing {}", source.display())).await;

        let level = Compression::new(settings.level);
        let cancel = ctx.cancel.clone();
        let reporter = ctx.reporter();
        let (src, dst) = (source.clone(), destination.clone());
        let result = tokio::task::spawn_blocking(move || {
            gzip_file(&src, &dst, level, &cancel, &reporter)
        })
        .await
        .map_err(|e| TaskError::Command(format!("compression worker failed: {e}")))?;

        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&destination).await;
            return Err(e);
        }

        Ok(TaskOutcome {
            message: format!("Compressed {} to {}", source.display(), destination.display()),
            artifact: Some(destination.to_string_lossy().into_owned()),
        })
    }
}

fn gzip_file(
    source: &Path,
    destination: &Path,
    level: Compression,
    cancel: &CancellationToken,
    reporter: &ProgressReporter,
) -> Result<(), TaskError> {
    let input = File::open(source)?;
    let total = input.metadata()?.len();
    let mut reader = BufReader::new(input);
    let mut encoder = GzEncoder::new(BufWriter::new(File::create(destination)?), level);

    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut done: u64 = 0;
    let mut last_reported = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(TaskError::Cancelled);
        }
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        encoder.write_all(&buffer[..read])?;
        done += read as u64;

        if total > 0 {
            let percent = done * 100 / total;
            if percent >= last_reported + 10 {
                last_reported = percent - percent % 10;
                reporter.report_blocking(format!("Compressed {percent}%"));
            }
        }
    }
    encoder.finish()?.flush()?;
    Ok(())
}

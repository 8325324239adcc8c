use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use strata_core::models::{TaskKind, TaskSettings};
use strata_core::secrets::Cipher;

use crate::database::{resolve_connection, BackupRequest, DatabaseServer};
use crate::executor::{
    render_template, sanitize_file_name, TaskContext, TaskError, TaskExecutor, TaskOutcome,
};

/// Backs up the run task's item (a database) into the agent's temp directory.
pub struct CreateBackupExecutor {
    server: Arc<dyn DatabaseServer>,
    cipher: Arc<Cipher>,
    temp_path: PathBuf,
}

impl CreateBackupExecutor {
    pub fn new(server: Arc<dyn DatabaseServer>, cipher: Arc<Cipher>, temp_path: PathBuf) -> Self {
        Self {
            server,
            cipher,
            temp_path,
        }
    }
}

#[async_trait]
impl TaskExecutor for CreateBackupExecutor {
    fn kind(&self) -> TaskKind {
        TaskKind::CreateBackup
    }

    async fn run(&self, ctx: &TaskContext) -> Result<TaskOutcome, TaskError> {
        let TaskSettings::CreateBackup(settings) = &ctx.task.settings else {
            return Err(TaskError::InvalidSettings(
                "expected createBackup settings".into(),
            ));
        };
        let database = ctx.task.item_name.as_str();
        let connection = resolve_connection(&self.cipher, &settings.connection())?;

        let item = sanitize_file_name(database);
        let started = ctx
            .task
            .started
            .unwrap_or_else(Utc::now)
            .format("%Y%m%d%H%M%S")
            .to_string();
        let file_name = render_template(
            &settings.file_name,
            &[
                ("ItemName", item.as_str()),
                ("Started", started.as_str()),
                ("BackupType", settings.backup_type.as_str()),
            ],
        );
        tokio::fs::create_dir_all(&self.temp_path).await?;
        let destination = self.temp_path.join(file_name);

        ctx.progress(format!(
            "Starting {} backup of database {database}",
            settings.backup_type.as_str()
        ))
        .await;
        ctx.check_cancelled()?;

        self.server
            .backup(
                BackupRequest {
                    connection: &connection,
                    database,
                    backup_type: settings.backup_type,
                    destination: &destination,
                },
                ctx,
            )
            .await?;

        let artifact = destination.to_string_lossy().into_owned();
        info!(job_run_task_id = %ctx.task.id, database, artifact = %artifact, "backup created");
        Ok(TaskOutcome {
            message: format!("Created backup of database {database}"),
            artifact: Some(artifact),
        })
    }
}

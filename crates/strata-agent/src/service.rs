use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use strata_core::secrets::{Cipher, SecretError};

use crate::config::AgentSettings;
use crate::connection::AgentConnection;
use crate::database::{CommandDatabaseServer, DatabaseServer};
use crate::handlers::AgentHandlers;
use crate::runner::TaskRunner;
use crate::tasks::{
    CompressExecutor, CreateBackupExecutor, DeleteExecutor, FileSystemTarget, UploadExecutor,
};

const EVENT_QUEUE_CAPACITY: usize = 1024;

/// A fully wired agent: runner, executors, RPC handlers and the control-plane connection.
pub struct AgentService {
    runner: Arc<TaskRunner>,
    connection: AgentConnection,
    tasks_shutdown: CancellationToken,
}

impl AgentService {
    pub fn from_settings(settings: &AgentSettings) -> Result<Self, SecretError> {
        let cipher = Arc::new(Cipher::load_or_create(&settings.key_path)?);
        let database: Arc<dyn DatabaseServer> =
            Arc::new(CommandDatabaseServer::new(settings.database.clone()));
        Ok(Self::with_database(settings, cipher, database))
    }

    /// Wire an agent around a custom database backend.
    pub fn with_database(
        settings: &AgentSettings,
        cipher: Arc<Cipher>,
        database: Arc<dyn DatabaseServer>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let temp = settings.temp_path.clone();

        let runner = Arc::new(
            TaskRunner::new(events_tx.clone())
                .with_executor(Arc::new(CreateBackupExecutor::new(
                    Arc::clone(&database),
                    Arc::clone(&cipher),
                    temp.clone(),
                )))
                .with_executor(Arc::new(CompressExecutor::new(temp)))
                .with_executor(Arc::new(UploadExecutor::new(Arc::new(FileSystemTarget))))
                .with_executor(Arc::new(DeleteExecutor)),
        );
        let tasks_shutdown = CancellationToken::new();
        let handlers = Arc::new(
            AgentHandlers::new(
                Arc::clone(&runner),
                database,
                cipher,
                settings.default_connection.clone(),
            )
            .with_shutdown(tasks_shutdown.clone()),
        );
        let connection = AgentConnection::new(
            settings.server_url.clone(),
            settings.agent_key(),
            handlers,
            events_tx,
            events_rx,
            settings.reconnect.clone(),
        );
        Self {
            runner,
            connection,
            tasks_shutdown,
        }
    }

    pub fn runner(&self) -> Arc<TaskRunner> {
        Arc::clone(&self.runner)
    }

    /// Serve until `shutdown` fires, then cancel every running task.
    pub async fn run(self, shutdown: CancellationToken) {
        let runner = Arc::clone(&self.runner);
        let tasks_shutdown = self.tasks_shutdown.clone();
        self.connection.run(shutdown).await;
        let stopped = runner.stop_all_tasks();
        tasks_shutdown.cancel();
        info!(stopped, "agent shut down");
    }
}

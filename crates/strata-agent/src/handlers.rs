//! RPC methods the control plane can invoke on this agent.

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use strata_core::ids::JobRunTaskId;
use strata_core::models::{DatabaseConnection, JobRunTask};
use strata_core::rpc::{arg, RpcMethod, RpcRequest, RpcResult};
use strata_core::secrets::Cipher;
use strata_core::OrchestrationError;

use crate::database::{resolve_connection, DatabaseServer};
use crate::runner::TaskRunner;

pub struct AgentHandlers {
    runner: Arc<TaskRunner>,
    database: Arc<dyn DatabaseServer>,
    cipher: Arc<Cipher>,
    default_connection: DatabaseConnection,
    shutdown: CancellationToken,
}

impl AgentHandlers {
    pub fn new(
        runner: Arc<TaskRunner>,
        database: Arc<dyn DatabaseServer>,
        cipher: Arc<Cipher>,
        default_connection: DatabaseConnection,
    ) -> Self {
        Self {
            runner,
            database,
            cipher,
            default_connection,
            shutdown: CancellationToken::new(),
        }
    }

    /// Tasks started through `Run` are cancelled when `shutdown` fires.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn runner(&self) -> &Arc<TaskRunner> {
        &self.runner
    }

    /// Answer one request. Failures become the `error` side of the result.
    #[instrument(skip_all, fields(method = %request.request, transaction_id = %request.transaction_id))]
    pub async fn handle(&self, request: &RpcRequest) -> RpcResult {
        let tid = request.transaction_id;
        let method = match request.method() {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "unknown rpc method");
                return RpcResult::error(tid, e);
            }
        };
        let args = match request.args() {
            Ok(a) => a,
            Err(e) => return RpcResult::error(tid, e),
        };

        let outcome = match method {
            RpcMethod::TestSqlServer => self.test_sql_server(&args).await,
            RpcMethod::GetDatabaseList => self.get_database_list(&args).await,
            RpcMethod::Run => self.run(&args).await,
            RpcMethod::Stop => self.stop(&args),
            RpcMethod::Encrypt => self.encrypt(&args),
        };
        match outcome {
            Ok(value) => RpcResult::ok(tid, &value),
            Err(message) => {
                debug!(error = %message, "rpc failed");
                RpcResult::error(tid, message)
            }
        }
    }

    fn connection_arg(&self, args: &[Value], index: usize) -> Result<DatabaseConnection, String> {
        let conn: Option<DatabaseConnection> = arg(args, index)?;
        Ok(conn
            .filter(|c| !c.connection_string.is_empty())
            .unwrap_or_else(|| self.default_connection.clone()))
    }

    /// Connection problems are reported as the result value, never as a fault.
    async fn test_sql_server(&self, args: &[Value]) -> Result<Value, String> {
        let conn = self.connection_arg(args, 0)?;
        let message = match resolve_connection(&self.cipher, &conn) {
            Ok(secret) => match self.database.test_connection(&secret).await {
                Ok(()) => "Success".to_string(),
                Err(e) => e.to_string(),
            },
            Err(e) => e.to_string(),
        };
        Ok(Value::String(message))
    }

    async fn get_database_list(&self, args: &[Value]) -> Result<Value, String> {
        let conn = self.connection_arg(args, 0)?;
        let secret = resolve_connection(&self.cipher, &conn).map_err(|e| e.to_string())?;
        let databases = self
            .database
            .list_databases(&secret)
            .await
            .map_err(|e| e.to_string())?;
        serde_json::to_value(databases).map_err(|e| e.to_string())
    }

    async fn run(&self, args: &[Value]) -> Result<Value, String> {
        let task: JobRunTask = arg(args, 0)?;
        let previous: Option<JobRunTask> = arg(args, 1)?;
        match self.runner.execute_task(task, previous, &self.shutdown).await {
            Ok(()) => Ok(Value::String("Started".into())),
            Err(OrchestrationError::DuplicateDispatch(_)) => {
                Ok(Value::String("Already running".into()))
            }
            // The runner already emitted an error completion for this task.
            Err(e @ OrchestrationError::UnknownTaskType(_)) => Ok(Value::String(e.to_string())),
            Err(e) => Err(e.to_string()),
        }
    }

    fn stop(&self, args: &[Value]) -> Result<Value, String> {
        let id: JobRunTaskId = arg(args, 0)?;
        let _ = self.runner.stop_task(&id);
        Ok(Value::String("Success".into()))
    }

    fn encrypt(&self, args: &[Value]) -> Result<Value, String> {
        let plaintext: String = arg(args, 0)?;
        self.cipher
            .encrypt(&plaintext)
            .map(Value::String)
            .map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::BackupRequest;
    use crate::executor::test_support::run_task;
    use crate::executor::{TaskContext, TaskError, TaskExecutor, TaskOutcome};
    use crate::tasks::DeleteExecutor;
    use async_trait::async_trait;
    use secrecy::{ExposeSecret, SecretString};
    use serde_json::json;
    use std::time::Duration;
    use strata_core::models::{Database, DeleteSettings, TaskKind, TaskSettings, UploadSettings};
    use strata_core::rpc::{AgentMessage, TaskComplete};
    use tokio::sync::mpsc;

    struct FakeServer;

    #[async_trait]
    impl DatabaseServer for FakeServer {
        async fn test_connection(&self, connection: &SecretString) -> Result<(), TaskError> {
            if connection.expose_secret().contains("bad") {
                Err(TaskError::Command("Login failed".into()))
            } else {
                Ok(())
            }
        }

        async fn list_databases(&self, _: &SecretString) -> Result<Vec<Database>, TaskError> {
            Ok(vec![Database {
                database_name: "app".into(),
                is_system: false,
                has_access: true,
            }])
        }

        async fn backup(&self, _: BackupRequest<'_>, _: &TaskContext) -> Result<(), TaskError> {
            Ok(())
        }
    }

    /// Runs until stopped.
    struct UntilStopped;

    #[async_trait]
    impl TaskExecutor for UntilStopped {
        fn kind(&self) -> TaskKind {
            TaskKind::Upload
        }

        async fn run(&self, ctx: &TaskContext) -> Result<TaskOutcome, TaskError> {
            ctx.cancel.cancelled().await;
            Err(TaskError::Cancelled)
        }
    }

    fn handlers() -> (AgentHandlers, mpsc::Receiver<AgentMessage>) {
        let (tx, rx) = mpsc::channel(64);
        let runner = Arc::new(
            TaskRunner::new(tx)
                .with_executor(Arc::new(DeleteExecutor))
                .with_executor(Arc::new(UntilStopped)),
        );
        let handlers = AgentHandlers::new(
            runner,
            Arc::new(FakeServer),
            Arc::new(Cipher::generate()),
            DatabaseConnection::default(),
        );
        (handlers, rx)
    }

    fn request(method: RpcMethod, args: Vec<Value>) -> RpcRequest {
        RpcRequest::new(method, args).unwrap()
    }

    #[tokio::test]
    async fn test_sql_server_reports_failure_as_result() {
        let (h, _rx) = handlers();
        let ok = h
            .handle(&request(
                RpcMethod::TestSqlServer,
                vec![json!({"connectionString": "Server=good"})],
            ))
            .await;
        assert_eq!(ok.result.as_deref(), Some(r#""Success""#));

        let bad = h
            .handle(&request(
                RpcMethod::TestSqlServer,
                vec![json!({"connectionString": "Server=bad"})],
            ))
            .await;
        assert!(bad.error.is_none());
        assert!(bad.result.unwrap().contains("Login failed"));
    }

    #[tokio::test]
    async fn database_list_is_serialized() {
        let (h, _rx) = handlers();
        let res = h.handle(&request(RpcMethod::GetDatabaseList, vec![])).await;
        let dbs: Vec<Database> = serde_json::from_str(&res.result.unwrap()).unwrap();
        assert_eq!(dbs[0].database_name, "app");
    }

    #[tokio::test]
    async fn unknown_method_is_an_error_result() {
        let (h, _rx) = handlers();
        let mut req = request(RpcMethod::Stop, vec![]);
        req.request = "Reboot".into();
        let res = h.handle(&req).await;
        assert!(res.result.is_none());
        assert_eq!(res.error.as_deref(), Some("Method not found: Reboot"));
    }

    #[tokio::test]
    async fn encrypt_round_trips_through_cipher() {
        let (h, _rx) = handlers();
        let res = h
            .handle(&request(RpcMethod::Encrypt, vec![json!("pw")]))
            .await;
        let encrypted: String = serde_json::from_str(&res.result.unwrap()).unwrap();
        assert_eq!(h.cipher.decrypt(&encrypted).unwrap().expose_secret(), "pw");
    }

    #[tokio::test]
    async fn run_starts_task_and_reports_completion() {
        let (h, mut rx) = handlers();
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("x.bak");
        std::fs::write(&file, b"x").unwrap();
        let task = run_task(
            TaskSettings::Delete(DeleteSettings {
                path: Some(file.to_string_lossy().into_owned()),
                ignore_missing: false,
            }),
            "app",
        );

        let res = h
            .handle(&request(
                RpcMethod::Run,
                vec![serde_json::to_value(&task).unwrap(), Value::Null],
            ))
            .await;
        assert_eq!(res.result.as_deref(), Some(r#""Started""#));

        match rx.recv().await.unwrap() {
            AgentMessage::TaskComplete(c) => {
                assert_eq!(c.job_run_task_id, task.id);
                assert!(!c.is_error, "{}", c.message);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn stop_of_unknown_task_succeeds() {
        let (h, _rx) = handlers();
        let res = h
            .handle(&request(RpcMethod::Stop, vec![json!("rtask_nope")]))
            .await;
        assert_eq!(res.result.as_deref(), Some(r#""Success""#));
    }

    async fn next_complete(rx: &mut mpsc::Receiver<AgentMessage>) -> TaskComplete {
        loop {
            match rx.recv().await.unwrap() {
                AgentMessage::TaskComplete(c) => return c,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn duplicate_run_reports_already_running() {
        let (h, mut rx) = handlers();
        let task = run_task(TaskSettings::Upload(UploadSettings::default()), "app");
        let run = request(
            RpcMethod::Run,
            vec![serde_json::to_value(&task).unwrap(), Value::Null],
        );

        let first = h.handle(&run).await;
        assert_eq!(first.result.as_deref(), Some(r#""Started""#));

        let second = h
            .handle(&request(
                RpcMethod::Run,
                vec![serde_json::to_value(&task).unwrap(), Value::Null],
            ))
            .await;
        assert_eq!(second.error, None);
        assert_eq!(second.result.as_deref(), Some(r#""Already running""#));
        assert_eq!(h.runner().running_count(), 1);

        let _ = h.handle(&request(RpcMethod::Stop, vec![json!(task.id)])).await;
        let complete = next_complete(&mut rx).await;
        assert_eq!(complete.job_run_task_id, task.id);
        assert_eq!(complete.message, "Task was stopped");

        let extra = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(extra.is_err(), "second completion: {extra:?}");
    }

    #[tokio::test]
    async fn shutdown_cancels_tasks_started_over_rpc() {
        let (h, mut rx) = handlers();
        let shutdown = CancellationToken::new();
        let h = h.with_shutdown(shutdown.clone());
        let task = run_task(TaskSettings::Upload(UploadSettings::default()), "app");

        let res = h
            .handle(&request(
                RpcMethod::Run,
                vec![serde_json::to_value(&task).unwrap(), Value::Null],
            ))
            .await;
        assert_eq!(res.result.as_deref(), Some(r#""Started""#));

        shutdown.cancel();
        let complete = next_complete(&mut rx).await;
        assert_eq!(complete.job_run_task_id, task.id);
        assert!(complete.is_error);
    }
}

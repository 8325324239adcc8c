//! Job configuration and run-state records shared by the control plane and agents.
//!
//! Field names are camelCase on the wire; the same structs travel inside RPC payloads
//! (`Run(jobRunTask, previousTask)`) and are what the repository persists.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AgentKey, JobId, JobRunId, JobRunTaskId, JobTaskId, LogId};

/// A registered agent. The key is what the agent presents on `Connect`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub key: AgentKey,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// The closed set of task kinds an agent knows how to execute.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskKind {
    CreateBackup,
    Compress,
    Upload,
    Delete,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreateBackup => "createBackup",
            Self::Compress => "compress",
            Self::Upload => "upload",
            Self::Delete => "delete",
        }
    }

    /// Kinds that cannot run without the artifact of a predecessor task.
    pub fn requires_previous_artifact(self) -> bool {
        matches!(self, Self::Compress | Self::Upload)
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a JobTask relates to its siblings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Items dispatch together; no wait on earlier siblings beyond the explicit predecessor.
    #[default]
    Parallel,
    /// Items dispatch one at a time and the step waits for all earlier steps.
    Sequential,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupType {
    #[default]
    Full,
    Differential,
    Log,
}

impl BackupType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "Full",
            Self::Differential => "Differential",
            Self::Log => "Log",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateBackupSettings {
    /// Connection string; `{password}` is replaced by the decrypted password.
    pub connection_string: String,
    /// Password encrypted with the agent's key (see `Encrypt`).
    pub connection_string_password: Option<String>,
    pub backup_type: BackupType,
    /// Destination file name template. Tokens: `{ItemName}`, `{Started}`, `{BackupType}`.
    pub file_name: String,
    pub backup_default_exclude: bool,
    pub backup_exclude_system_databases: bool,
    pub backup_include_regex: Option<String>,
    pub backup_exclude_regex: Option<String>,
    pub backup_include_manual: Vec<String>,
    pub backup_exclude_manual: Vec<String>,
}

impl Default for CreateBackupSettings {
    fn default() -> Self {
        Self {
            connection_string: String::new(),
            connection_string_password: None,
            backup_type: BackupType::Full,
            file_name: "{ItemName}_{BackupType}_{Started}.bak".into(),
            backup_default_exclude: false,
            backup_exclude_system_databases: true,
            backup_include_regex: None,
            backup_exclude_regex: None,
            backup_include_manual: Vec::new(),
            backup_exclude_manual: Vec::new(),
        }
    }
}

impl CreateBackupSettings {
    pub fn connection(&self) -> DatabaseConnection {
        DatabaseConnection {
            connection_string: self.connection_string.clone(),
            connection_string_password: self.connection_string_password.clone(),
        }
    }
}

/// Connection details passed to `TestSqlServer` and `GetDatabaseList`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseConnection {
    pub connection_string: String,
    /// Encrypted with the agent's key. Substituted for `{password}` after decryption.
    pub connection_string_password: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompressSettings {
    /// Output file name template. Tokens: `{ItemName}`, `{ArtifactName}`.
    pub file_name: String,
    /// gzip level, 0-9.
    pub level: u32,
}

impl Default for CompressSettings {
    fn default() -> Self {
        Self {
            file_name: "{ArtifactName}.gz".into(),
            level: 6,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UploadSettings {
    /// Destination container (a directory for the filesystem target).
    pub destination: String,
    /// Remote object name template. Tokens: `{ItemName}`, `{ArtifactName}`.
    pub file_name: String,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            destination: String::new(),
            file_name: "{ArtifactName}".into(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeleteSettings {
    /// Explicit path to delete. When absent the predecessor's artifact is deleted.
    pub path: Option<String>,
    pub ignore_missing: bool,
}

/// Kind-specific settings, tagged by kind so a mismatch is caught when the catalogue loads.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TaskSettings {
    CreateBackup(CreateBackupSettings),
    Compress(CompressSettings),
    Upload(UploadSettings),
    Delete(DeleteSettings),
}

impl TaskSettings {
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::CreateBackup(_) => TaskKind::CreateBackup,
            Self::Compress(_) => TaskKind::Compress,
            Self::Upload(_) => TaskKind::Upload,
            Self::Delete(_) => TaskKind::Delete,
        }
    }
}

/// One step of a job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobTask {
    pub id: JobTaskId,
    pub job_id: JobId,
    pub name: String,
    pub kind: TaskKind,
    pub agent_key: AgentKey,
    #[serde(default)]
    pub mode: ExecutionMode,
    /// The step whose artifacts feed this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_previous_task_artifacts_from: Option<JobTaskId>,
    pub order: u32,
    /// Seconds before the agent cancels the task. `None` means unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    pub settings: TaskSettings,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobRunStatus {
    Running,
    Completed,
    CompletedWithErrors,
    Stopped,
}

impl JobRunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// One execution of a job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRun {
    pub id: JobRunId,
    pub job_id: JobId,
    pub status: JobRunStatus,
    pub started: DateTime<Utc>,
    pub completed: Option<DateTime<Utc>>,
    pub is_error: bool,
    pub result: Option<String>,
    /// Whole seconds between start and completion, fixed at finalization.
    pub run_time: Option<i64>,
}

impl JobRun {
    pub fn start(job_id: JobId) -> Self {
        Self {
            id: JobRunId::new(),
            job_id,
            status: JobRunStatus::Running,
            started: Utc::now(),
            completed: None,
            is_error: false,
            result: None,
            run_time: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Error,
    Stopped,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Stopped)
    }

    pub fn can_transition(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Pending, Error)
                | (Pending, Stopped)
                | (Running, Completed)
                | (Running, Error)
                | (Running, Stopped)
        )
    }
}

/// One concrete unit of work: one item of one step within a run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRunTask {
    pub id: JobRunTaskId,
    pub job_run_id: JobRunId,
    pub job_task_id: JobTaskId,
    pub agent_key: AgentKey,
    pub kind: TaskKind,
    pub item_name: String,
    pub item_order: u32,
    /// Order of the owning JobTask within the job.
    pub task_order: u32,
    pub mode: ExecutionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_previous_task_artifacts_from: Option<JobTaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    pub settings: TaskSettings,
    pub status: TaskStatus,
    pub started: Option<DateTime<Utc>>,
    pub completed: Option<DateTime<Utc>>,
    pub is_error: bool,
    pub result: Option<String>,
    pub result_artifact: Option<String>,
}

impl JobRunTask {
    /// Build a pending run task for one item of `job_task`.
    pub fn pending(job_run_id: &JobRunId, job_task: &JobTask, item_name: &str, item_order: u32) -> Self {
        Self {
            id: JobRunTaskId::new(),
            job_run_id: job_run_id.clone(),
            job_task_id: job_task.id.clone(),
            agent_key: job_task.agent_key.clone(),
            kind: job_task.kind,
            item_name: item_name.to_string(),
            item_order,
            task_order: job_task.order,
            mode: job_task.mode,
            use_previous_task_artifacts_from: job_task.use_previous_task_artifacts_from.clone(),
            timeout_secs: job_task.timeout_secs,
            settings: job_task.settings.clone(),
            status: TaskStatus::Pending,
            started: None,
            completed: None,
            is_error: false,
            result: None,
            result_artifact: None,
        }
    }
}

/// A progress or completion line recorded against a run task.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRunTaskLog {
    pub id: LogId,
    pub job_run_task_id: JobRunTaskId,
    pub date: DateTime<Utc>,
    pub message: String,
    pub is_error: bool,
}

impl JobRunTaskLog {
    pub fn new(job_run_task_id: JobRunTaskId, message: impl Into<String>, is_error: bool) -> Self {
        Self {
            id: LogId::new(),
            job_run_task_id,
            date: Utc::now(),
            message: message.into(),
            is_error,
        }
    }
}

/// A database reported by an agent's `GetDatabaseList`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Database {
    pub database_name: String,
    #[serde(default)]
    pub is_system: bool,
    #[serde(default = "default_true")]
    pub has_access: bool,
}

fn default_true() -> bool {
    true
}

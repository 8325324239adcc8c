//! Persistence contract the orchestration core relies on.
//!
//! The core owns no schema. Any relational backend can implement [`Repository`];
//! [`crate::InMemoryStore`] is the process-local implementation.

use chrono::{DateTime, Utc};

use strata_core::ids::{AgentKey, JobId, JobRunId, JobRunTaskId, JobTaskId};
use strata_core::models::{Agent, Job, JobRun, JobRunTask, JobRunTaskLog, JobTask};

use crate::error::StoreError;

/// Terminal values written to a run exactly once.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunCompletion {
    pub status: strata_core::models::JobRunStatus,
    pub completed: DateTime<Utc>,
    pub is_error: bool,
    pub result: String,
    pub run_time: i64,
}

pub trait Repository: Send + Sync {
    // Agents
    fn upsert_agent(&self, agent: Agent) -> Result<(), StoreError>;
    fn get_agent(&self, key: &AgentKey) -> Result<Agent, StoreError>;
    fn list_agents(&self) -> Result<Vec<Agent>, StoreError>;

    // Jobs and steps
    fn upsert_job(&self, job: Job) -> Result<(), StoreError>;
    fn get_job(&self, id: &JobId) -> Result<Job, StoreError>;
    fn list_jobs(&self) -> Result<Vec<Job>, StoreError>;
    fn upsert_job_task(&self, task: JobTask) -> Result<(), StoreError>;
    fn get_job_task(&self, id: &JobTaskId) -> Result<JobTask, StoreError>;
    /// Steps of a job ordered by `order`.
    fn job_tasks_for_job(&self, job_id: &JobId) -> Result<Vec<JobTask>, StoreError>;

    // Runs
    fn create_run(&self, run: JobRun) -> Result<(), StoreError>;
    fn get_run(&self, id: &JobRunId) -> Result<JobRun, StoreError>;
    /// Runs with no completion time, optionally for one job.
    fn running_runs(&self, job_id: Option<&JobId>) -> Result<Vec<JobRun>, StoreError>;
    /// Write the completion of a run. Returns `false` without touching anything when the
    /// run was already completed.
    fn complete_run(&self, id: &JobRunId, completion: RunCompletion) -> Result<bool, StoreError>;

    // Run tasks
    fn create_run_tasks(&self, tasks: Vec<JobRunTask>) -> Result<(), StoreError>;
    fn get_run_task(&self, id: &JobRunTaskId) -> Result<JobRunTask, StoreError>;
    /// Tasks of a run ordered by step order then item order.
    fn run_tasks_for_run(&self, run_id: &JobRunId) -> Result<Vec<JobRunTask>, StoreError>;
    fn update_run_task(&self, task: &JobRunTask) -> Result<(), StoreError>;

    // Task logs
    fn add_log(&self, log: JobRunTaskLog) -> Result<(), StoreError>;
    fn logs_for_task(&self, id: &JobRunTaskId) -> Result<Vec<JobRunTaskLog>, StoreError>;

    /// Remove runs of `job_id` started before `cutoff` with their tasks and logs.
    fn delete_runs_before(&self, job_id: &JobId, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;
}

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;

use strata_core::ids::{AgentKey, JobId, JobRunId, JobRunTaskId, JobTaskId};
use strata_core::models::{Agent, Job, JobRun, JobRunTask, JobRunTaskLog, JobTask};

use crate::error::StoreError;
use crate::repository::{RunCompletion, Repository};

#[derive(Default)]
struct Tables {
    agents: HashMap<AgentKey, Agent>,
    jobs: HashMap<JobId, Job>,
    job_tasks: HashMap<JobTaskId, JobTask>,
    runs: HashMap<JobRunId, JobRun>,
    run_tasks: HashMap<JobRunTaskId, JobRunTask>,
    logs: HashMap<JobRunTaskId, Vec<JobRunTaskLog>>,
}

/// Process-local [`Repository`]. All tables sit behind one lock so multi-row writes are atomic.
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(what: &str, id: impl std::fmt::Display) -> StoreError {
    StoreError::NotFound(format!("{what} {id}"))
}

impl Repository for InMemoryStore {
    fn upsert_agent(&self, agent: Agent) -> Result<(), StoreError> {
        let _ = self.tables.write().agents.insert(agent.key.clone(), agent);
        Ok(())
    }

    fn get_agent(&self, key: &AgentKey) -> Result<Agent, StoreError> {
        self.tables
            .read()
            .agents
            .get(key)
            .cloned()
            .ok_or_else(|| not_found("agent", key))
    }

    fn list_agents(&self) -> Result<Vec<Agent>, StoreError> {
        let mut agents: Vec<Agent> = self.tables.read().agents.values().cloned().collect();
        agents.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(agents)
    }

    fn upsert_job(&self, job: Job) -> Result<(), StoreError> {
        let _ = self.tables.write().jobs.insert(job.id.clone(), job);
        Ok(())
    }

    fn get_job(&self, id: &JobId) -> Result<Job, StoreError> {
        self.tables
            .read()
            .jobs
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("job", id))
    }

    fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self.tables.read().jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(jobs)
    }

    fn upsert_job_task(&self, task: JobTask) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        if !tables.jobs.contains_key(&task.job_id) {
            return Err(not_found("job", &task.job_id));
        }
        let _ = tables.job_tasks.insert(task.id.clone(), task);
        Ok(())
    }

    fn get_job_task(&self, id: &JobTaskId) -> Result<JobTask, StoreError> {
        self.tables
            .read()
            .job_tasks
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("job task", id))
    }

    fn job_tasks_for_job(&self, job_id: &JobId) -> Result<Vec<JobTask>, StoreError> {
        let mut tasks: Vec<JobTask> = self
            .tables
            .read()
            .job_tasks
            .values()
            .filter(|t| &t.job_id == job_id)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
        Ok(tasks)
    }

    fn create_run(&self, run: JobRun) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        if !tables.jobs.contains_key(&run.job_id) {
            return Err(not_found("job", &run.job_id));
        }
        if tables.runs.contains_key(&run.id) {
            return Err(StoreError::Conflict(format!("run {} already exists", run.id)));
        }
        let _ = tables.runs.insert(run.id.clone(), run);
        Ok(())
    }

    fn get_run(&self, id: &JobRunId) -> Result<JobRun, StoreError> {
        self.tables
            .read()
            .runs
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("run", id))
    }

    fn running_runs(&self, job_id: Option<&JobId>) -> Result<Vec<JobRun>, StoreError> {
        let mut runs: Vec<JobRun> = self
            .tables
            .read()
            .runs
            .values()
            .filter(|r| r.completed.is_none())
            .filter(|r| job_id.map_or(true, |id| &r.job_id == id))
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.started);
        Ok(runs)
    }

    fn complete_run(&self, id: &JobRunId, completion: RunCompletion) -> Result<bool, StoreError> {
        let mut tables = self.tables.write();
        let run = tables.runs.get_mut(id).ok_or_else(|| not_found("run", id))?;
        if run.completed.is_some() {
            debug!(run_id = %id, "run already completed, ignoring");
            return Ok(false);
        }
        run.status = completion.status;
        run.completed = Some(completion.completed);
        run.is_error = completion.is_error;
        run.result = Some(completion.result);
        run.run_time = Some(completion.run_time);
        Ok(true)
    }

    fn create_run_tasks(&self, tasks: Vec<JobRunTask>) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        for task in &tasks {
            if !tables.runs.contains_key(&task.job_run_id) {
                return Err(not_found("run", &task.job_run_id));
            }
            if tables.run_tasks.contains_key(&task.id) {
                return Err(StoreError::Conflict(format!("run task {} already exists", task.id)));
            }
        }
        for task in tasks {
            let _ = tables.run_tasks.insert(task.id.clone(), task);
        }
        Ok(())
    }

    fn get_run_task(&self, id: &JobRunTaskId) -> Result<JobRunTask, StoreError> {
        self.tables
            .read()
            .run_tasks
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("run task", id))
    }

    fn run_tasks_for_run(&self, run_id: &JobRunId) -> Result<Vec<JobRunTask>, StoreError> {
        let mut tasks: Vec<JobRunTask> = self
            .tables
            .read()
            .run_tasks
            .values()
            .filter(|t| &t.job_run_id == run_id)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| {
            a.task_order
                .cmp(&b.task_order)
                .then(a.item_order.cmp(&b.item_order))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(tasks)
    }

    fn update_run_task(&self, task: &JobRunTask) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        let existing = tables
            .run_tasks
            .get_mut(&task.id)
            .ok_or_else(|| not_found("run task", &task.id))?;
        if existing.status != task.status && !existing.status.can_transition(task.status) {
            return Err(StoreError::Conflict(format!(
                "run task {} cannot move from {:?} to {:?}",
                task.id, existing.status, task.status
            )));
        }
        *existing = task.clone();
        Ok(())
    }

    fn add_log(&self, log: JobRunTaskLog) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        if !tables.run_tasks.contains_key(&log.job_run_task_id) {
            return Err(not_found("run task", &log.job_run_task_id));
        }
        tables
            .logs
            .entry(log.job_run_task_id.clone())
            .or_default()
            .push(log);
        Ok(())
    }

    fn logs_for_task(&self, id: &JobRunTaskId) -> Result<Vec<JobRunTaskLog>, StoreError> {
        Ok(self.tables.read().logs.get(id).cloned().unwrap_or_default())
    }

    fn delete_runs_before(&self, job_id: &JobId, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut tables = self.tables.write();
        let doomed: Vec<JobRunId> = tables
            .runs
            .values()
            .filter(|r| &r.job_id == job_id && r.started < cutoff && r.completed.is_some())
            .map(|r| r.id.clone())
            .collect();

        for run_id in &doomed {
            let _ = tables.runs.remove(run_id);
        }
        let task_ids: Vec<JobRunTaskId> = tables
            .run_tasks
            .values()
            .filter(|t| doomed.contains(&t.job_run_id))
            .map(|t| t.id.clone())
            .collect();
        for task_id in &task_ids {
            let _ = tables.run_tasks.remove(task_id);
            let _ = tables.logs.remove(task_id);
        }

        debug!(job_id = %job_id, runs = doomed.len(), tasks = task_ids.len(), "deleted old runs");
        Ok(doomed.len())
    }
}

//! Job run orchestration.
//!
//! `JobRunner` expands a job into run tasks, decides which of them may start, dispatches them to
//! agents and folds completions back into run state. Every scheduling decision for a run is taken
//! under that run's lock; RPCs are issued after the lock is released.

use std::sync::Arc;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use strata_core::filter::DatabaseFilter;
use strata_core::ids::{JobId, JobRunId, JobRunTaskId};
use strata_core::models::{
    ExecutionMode, JobRun, JobRunStatus, JobRunTask, JobRunTaskLog, JobTask, TaskSettings,
    TaskStatus,
};
use strata_core::rpc::{TaskComplete, TaskProgress};
use strata_store::{Repository, RunCompletion, StoreError};

use crate::error::RunError;
use crate::remote::AgentRemote;

pub const SKIPPED_MESSAGE: &str = "Skipped because previous task failed";
pub const STOPPED_MESSAGE: &str = "Task was stopped";

pub struct JobRunner {
    store: Arc<dyn Repository>,
    remote: Arc<dyn AgentRemote>,
    active_runs: DashMap<JobId, JobRunId>,
    run_locks: DashMap<JobRunId, Arc<Mutex<()>>>,
}

impl JobRunner {
    pub fn new(store: Arc<dyn Repository>, remote: Arc<dyn AgentRemote>) -> Self {
        Self {
            store,
            remote,
            active_runs: DashMap::new(),
            run_locks: DashMap::new(),
        }
    }

    /// Start a run of `job_id`: fan out its steps and dispatch whatever is ready.
    #[instrument(skip_all, fields(job_id = %job_id))]
    pub async fn start_run(self: &Arc<Self>, job_id: &JobId) -> Result<JobRun, RunError> {
        let job = self.store.get_job(job_id)?;
        let job_tasks = self.store.job_tasks_for_job(&job.id)?;
        if job_tasks.is_empty() {
            return Err(RunError::EmptyJob(job.id));
        }
        if let Some(active) = self.store.running_runs(Some(&job.id))?.into_iter().next() {
            return Err(RunError::AlreadyRunning {
                job_id: job.id,
                run_id: active.id,
            });
        }

        let run = JobRun::start(job.id.clone());
        match self.active_runs.entry(job.id.clone()) {
            Entry::Occupied(existing) => {
                return Err(RunError::AlreadyRunning {
                    job_id: job.id,
                    run_id: existing.get().clone(),
                });
            }
            Entry::Vacant(slot) => {
                let _ = slot.insert(run.id.clone());
            }
        }

        if let Err(e) = self.store.create_run(run.clone()) {
            let _ = self.active_runs.remove(&job.id);
            return Err(e.into());
        }
        info!(job_run_id = %run.id, "job run started");

        if let Err(e) = self.populate(&run.id, &job_tasks).await {
            error!(job_run_id = %run.id, error = %e, "job failed to start");
            if let Err(finish_err) = self.finish(&run, JobRunStatus::CompletedWithErrors, true, |_| {
                format!("Job failed to start: {e}")
            }) {
                error!(job_run_id = %run.id, error = %finish_err, "could not close failed run");
            }
            return Err(e);
        }
        Ok(self.store.get_run(&run.id)?)
    }

    /// Create the run tasks of a freshly stored run and dispatch the first ones.
    async fn populate(self: &Arc<Self>, run_id: &JobRunId, job_tasks: &[JobTask]) -> Result<(), RunError> {
        let tasks = self.fan_out(run_id, job_tasks).await?;
        info!(job_run_id = %run_id, tasks = tasks.len(), "run tasks created");
        self.store.create_run_tasks(tasks)?;
        self.advance(run_id).await
    }

    /// One run task per item per step. Backup steps list databases on their agent; chained
    /// steps mirror their predecessor's items.
    async fn fan_out(
        &self,
        run_id: &JobRunId,
        job_tasks: &[JobTask],
    ) -> Result<Vec<JobRunTask>, RunError> {
        let mut created: Vec<JobRunTask> = Vec::new();
        for job_task in job_tasks {
            if let Some(predecessor) = &job_task.use_previous_task_artifacts_from {
                let mirrored: Vec<JobRunTask> = created
                    .iter()
                    .filter(|t| &t.job_task_id == predecessor)
                    .map(|t| JobRunTask::pending(run_id, job_task, &t.item_name, t.item_order))
                    .collect();
                created.extend(mirrored);
                continue;
            }

            match &job_task.settings {
                TaskSettings::CreateBackup(settings) => {
                    let filter =
                        DatabaseFilter::from_settings(settings).map_err(|e| RunError::InvalidTask {
                            task_id: job_task.id.clone(),
                            message: e.to_string(),
                        })?;
                    let databases = self
                        .remote
                        .get_database_list(&job_task.agent_key, &settings.connection())
                        .await?;
                    let included = filter.included(&databases);
                    debug!(
                        job_task_id = %job_task.id,
                        listed = databases.len(),
                        included = included.len(),
                        "databases selected"
                    );
                    created.extend(included.iter().enumerate().map(|(i, name)| {
                        JobRunTask::pending(run_id, job_task, name, i as u32 + 1)
                    }));
                }
                _ => created.push(JobRunTask::pending(run_id, job_task, &job_task.name, 1)),
            }
        }
        Ok(created)
    }

    fn lock_for(&self, run_id: &JobRunId) -> Arc<Mutex<()>> {
        Arc::clone(self.run_locks.entry(run_id.clone()).or_default().value())
    }

    /// Re-evaluate a run and dispatch every task that became ready.
    async fn advance(self: &Arc<Self>, run_id: &JobRunId) -> Result<(), RunError> {
        let lock = self.lock_for(run_id);
        let dispatches = {
            let _guard = lock.lock().await;
            self.schedule_locked(run_id)?
        };
        for (task, previous) in dispatches {
            self.spawn_dispatch(task, previous);
        }
        Ok(())
    }

    /// Apply a scheduling pass and persist it. Caller holds the run lock.
    fn schedule_locked(
        &self,
        run_id: &JobRunId,
    ) -> Result<Vec<(JobRunTask, Option<JobRunTask>)>, RunError> {
        let run = self.store.get_run(run_id)?;
        if run.status.is_terminal() {
            return Ok(Vec::new());
        }

        let mut tasks = self.store.run_tasks_for_run(run_id)?;
        let plan = schedule(&mut tasks);
        for &i in &plan.updated {
            let task = &tasks[i];
            self.store.update_run_task(task)?;
            if task.status == TaskStatus::Error {
                self.log(&task.id, SKIPPED_MESSAGE, true);
                info!(job_run_task_id = %task.id, item = %task.item_name, "task skipped");
            }
        }

        if tasks.iter().all(|t| t.status.is_terminal()) {
            self.finalize(&run, &tasks)?;
            return Ok(Vec::new());
        }

        Ok(plan
            .dispatch
            .iter()
            .map(|&i| {
                let previous = predecessor_of(&tasks, i).map(|p| tasks[p].clone());
                (tasks[i].clone(), previous)
            })
            .collect())
    }

    fn spawn_dispatch(self: &Arc<Self>, task: JobRunTask, previous: Option<JobRunTask>) {
        let runner = Arc::clone(self);
        tokio::spawn(async move {
            match runner.remote.run(&task, previous.as_ref()).await {
                Ok(reply) => {
                    debug!(job_run_task_id = %task.id, agent_key = %task.agent_key, reply = %reply, "task dispatched")
                }
                Err(e) => {
                    warn!(job_run_task_id = %task.id, agent_key = %task.agent_key, error = %e, "dispatch failed");
                    let complete = TaskComplete {
                        job_run_task_id: task.id.clone(),
                        message: e.to_string(),
                        result_artifact: None,
                        is_error: true,
                    };
                    if let Err(e) = runner.on_task_complete(complete).await {
                        error!(job_run_task_id = %task.id, error = %e, "failed to record dispatch failure");
                    }
                }
            }
        });
    }

    pub fn on_progress(&self, progress: TaskProgress) {
        self.log(&progress.job_run_task_id, &progress.message, progress.is_error);
    }

    /// Record a task's completion and schedule its successors. Completions for tasks that are
    /// not running, or for finished runs, are logged and otherwise ignored.
    #[instrument(skip_all, fields(job_run_task_id = %complete.job_run_task_id))]
    pub async fn on_task_complete(self: &Arc<Self>, complete: TaskComplete) -> Result<(), RunError> {
        let task_id = complete.job_run_task_id.clone();
        let run_id = match self.store.get_run_task(&task_id) {
            Ok(task) => task.job_run_id,
            Err(StoreError::NotFound(_)) => {
                warn!("completion for unknown task");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        self.log(&task_id, &complete.message, complete.is_error);

        let lock = self.lock_for(&run_id);
        let dispatches = {
            let _guard = lock.lock().await;
            let run = self.store.get_run(&run_id)?;
            if run.status.is_terminal() {
                debug!(job_run_id = %run_id, "completion after run finished ignored");
                Vec::new()
            } else {
                let mut task = self.store.get_run_task(&task_id)?;
                if task.status != TaskStatus::Running {
                    debug!(status = ?task.status, "completion for task that is not running ignored");
                    return Ok(());
                }
                task.status = if complete.is_error {
                    TaskStatus::Error
                } else {
                    TaskStatus::Completed
                };
                task.completed = Some(Utc::now());
                task.is_error = complete.is_error;
                task.result = Some(complete.message);
                task.result_artifact = complete.result_artifact;
                self.store.update_run_task(&task)?;
                info!(status = ?task.status, item = %task.item_name, "task finished");

                self.schedule_locked(&run_id)?
            }
        };
        if dispatches.is_empty() && !self.run_is_open(&run_id) {
            let _ = self.run_locks.remove(&run_id);
        }
        for (task, previous) in dispatches {
            self.spawn_dispatch(task, previous);
        }
        Ok(())
    }

    /// Stop a run: unfinished tasks become Stopped and running ones are told to stop.
    #[instrument(skip_all, fields(job_run_id = %run_id))]
    pub async fn stop_run(&self, run_id: &JobRunId) -> Result<JobRun, RunError> {
        let _ = self.store.get_run(run_id)?;
        let lock = self.lock_for(run_id);
        let to_stop = {
            let _guard = lock.lock().await;
            let run = self.store.get_run(run_id)?;
            if run.status.is_terminal() {
                let _ = self.run_locks.remove(run_id);
                return Err(RunError::AlreadyCompleted(run.id));
            }

            let now = Utc::now();
            let mut to_stop = Vec::new();
            let mut tasks = self.store.run_tasks_for_run(run_id)?;
            for task in tasks.iter_mut().filter(|t| !t.status.is_terminal()) {
                if task.status == TaskStatus::Running {
                    to_stop.push(task.clone());
                }
                task.status = TaskStatus::Stopped;
                task.completed = Some(now);
                task.result = Some(STOPPED_MESSAGE.to_string());
                self.store.update_run_task(task)?;
                self.log(&task.id, STOPPED_MESSAGE, false);
            }

            let has_errors = tasks.iter().any(|t| t.status == TaskStatus::Error);
            self.finish(&run, JobRunStatus::Stopped, has_errors, |d| {
                format!("Job was manually stopped after {d}")
            })?;
            to_stop
        };

        for task in to_stop {
            let remote = Arc::clone(&self.remote);
            tokio::spawn(async move {
                if let Err(e) = remote.stop(&task).await {
                    warn!(job_run_task_id = %task.id, agent_key = %task.agent_key, error = %e, "stop request failed");
                }
            });
        }
        Ok(self.store.get_run(run_id)?)
    }

    /// A run with its tasks in execution order.
    pub fn run_details(&self, run_id: &JobRunId) -> Result<(JobRun, Vec<JobRunTask>), RunError> {
        let run = self.store.get_run(run_id)?;
        let tasks = self.store.run_tasks_for_run(run_id)?;
        Ok((run, tasks))
    }

    fn run_is_open(&self, run_id: &JobRunId) -> bool {
        self.store
            .get_run(run_id)
            .map(|r| !r.status.is_terminal())
            .unwrap_or(false)
    }

    fn finalize(&self, run: &JobRun, tasks: &[JobRunTask]) -> Result<(), RunError> {
        let errors = tasks.iter().filter(|t| t.is_error).count();
        if errors == 0 {
            self.finish(run, JobRunStatus::Completed, false, |d| {
                format!("Job completed successfully in {d}")
            })
        } else {
            self.finish(run, JobRunStatus::CompletedWithErrors, true, |d| {
                format!("Job completed with {errors} errors in {d}")
            })
        }
    }

    fn finish(
        &self,
        run: &JobRun,
        status: JobRunStatus,
        is_error: bool,
        summary: impl FnOnce(&str) -> String,
    ) -> Result<(), RunError> {
        let completed = Utc::now();
        let run_time = (completed - run.started).num_seconds().max(0);
        let result = summary(&format_duration(run_time));
        let applied = self.store.complete_run(
            &run.id,
            RunCompletion {
                status,
                completed,
                is_error,
                result: result.clone(),
                run_time,
            },
        );
        let _ = self
            .active_runs
            .remove_if(&run.job_id, |_, active| active == &run.id);
        let _ = self.run_locks.remove(&run.id);
        let applied = applied?;
        if applied {
            info!(job_run_id = %run.id, status = ?status, run_time, result = %result, "job run finished");
        }
        Ok(())
    }

    fn log(&self, task_id: &JobRunTaskId, message: &str, is_error: bool) {
        if let Err(e) = self
            .store
            .add_log(JobRunTaskLog::new(task_id.clone(), message, is_error))
        {
            warn!(job_run_task_id = %task_id, error = %e, "dropping task log");
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Plan {
    /// Indices of tasks whose state changed.
    updated: Vec<usize>,
    /// Indices of tasks moved to Running that must be sent to their agent.
    dispatch: Vec<usize>,
}

enum Readiness {
    Wait,
    Ready,
    Skip,
}

/// Move pending tasks forward in place. Runs to a fixed point so a failure skips its whole chain.
fn schedule(tasks: &mut [JobRunTask]) -> Plan {
    let now = Utc::now();
    let mut plan = Plan::default();
    loop {
        let mut progressed = false;
        for i in 0..tasks.len() {
            if tasks[i].status != TaskStatus::Pending {
                continue;
            }
            match readiness(tasks, i) {
                Readiness::Wait => {}
                Readiness::Ready => {
                    let task = &mut tasks[i];
                    task.status = TaskStatus::Running;
                    task.started = Some(now);
                    plan.updated.push(i);
                    plan.dispatch.push(i);
                    progressed = true;
                }
                Readiness::Skip => {
                    let task = &mut tasks[i];
                    task.status = TaskStatus::Error;
                    task.is_error = true;
                    task.completed = Some(now);
                    task.result = Some(SKIPPED_MESSAGE.to_string());
                    plan.updated.push(i);
                    progressed = true;
                }
            }
        }
        if !progressed {
            return plan;
        }
    }
}

fn readiness(tasks: &[JobRunTask], i: usize) -> Readiness {
    let task = &tasks[i];
    if task.use_previous_task_artifacts_from.is_some() {
        if let Some(p) = predecessor_of(tasks, i) {
            match tasks[p].status {
                TaskStatus::Completed => {}
                status if status.is_terminal() => return Readiness::Skip,
                _ => return Readiness::Wait,
            }
        }
    } else if task.mode == ExecutionMode::Sequential
        && tasks
            .iter()
            .any(|t| t.task_order < task.task_order && !t.status.is_terminal())
    {
        return Readiness::Wait;
    }

    if task.mode == ExecutionMode::Sequential
        && tasks
            .iter()
            .any(|t| t.job_task_id == task.job_task_id && t.status == TaskStatus::Running)
    {
        return Readiness::Wait;
    }
    Readiness::Ready
}

/// The run task of the predecessor step for the same item.
fn predecessor_of(tasks: &[JobRunTask], i: usize) -> Option<usize> {
    let task = &tasks[i];
    let step = task.use_previous_task_artifacts_from.as_ref()?;
    tasks
        .iter()
        .position(|t| &t.job_task_id == step && t.item_name == task.item_name)
}

/// `3s`, `2m 5s`, `1h 0m 12s`.
pub fn format_duration(total_secs: i64) -> String {
    let total_secs = total_secs.max(0);
    let (h, m, s) = (total_secs / 3600, (total_secs % 3600) / 60, total_secs % 60);
    if h > 0 {
        format!("{h}h {m}m {s}s")
    } else if m > 0 {
        format!("{m}m {s}s")
    } else {
        format!("{s}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use strata_core::ids::{AgentKey, JobTaskId};
    use strata_core::models::{
        Agent, CompressSettings, CreateBackupSettings, Database, DatabaseConnection,
        DeleteSettings, Job, TaskKind,
    };
    use strata_core::OrchestrationError;
    use strata_store::InMemoryStore;
    use tokio::sync::mpsc;

    struct MockRemote {
        databases: Vec<Database>,
        fail_runs: bool,
        runs: mpsc::UnboundedSender<(JobRunTask, Option<JobRunTask>)>,
        stops: mpsc::UnboundedSender<JobRunTaskId>,
    }

    #[async_trait]
    impl AgentRemote for MockRemote {
        async fn test_sql_server(
            &self,
            _agent: &AgentKey,
            _connection: &DatabaseConnection,
        ) -> Result<String, OrchestrationError> {
            Ok("Success".into())
        }

        async fn get_database_list(
            &self,
            _agent: &AgentKey,
            _connection: &DatabaseConnection,
        ) -> Result<Vec<Database>, OrchestrationError> {
            Ok(self.databases.clone())
        }

        async fn run(
            &self,
            task: &JobRunTask,
            previous: Option<&JobRunTask>,
        ) -> Result<String, OrchestrationError> {
            if self.fail_runs {
                return Err(OrchestrationError::AgentUnreachable(task.agent_key.clone()));
            }
            let _ = self.runs.send((task.clone(), previous.cloned()));
            Ok("Started".into())
        }

        async fn stop(&self, task: &JobRunTask) -> Result<String, OrchestrationError> {
            let _ = self.stops.send(task.id.clone());
            Ok("Success".into())
        }

        async fn encrypt(&self, _agent: &AgentKey, plaintext: &str) -> Result<String, OrchestrationError> {
            Ok(plaintext.to_string())
        }
    }

    struct Harness {
        runner: Arc<JobRunner>,
        store: Arc<InMemoryStore>,
        runs: mpsc::UnboundedReceiver<(JobRunTask, Option<JobRunTask>)>,
        stops: mpsc::UnboundedReceiver<JobRunTaskId>,
        job_id: JobId,
    }

    fn db(name: &str, is_system: bool) -> Database {
        Database {
            database_name: name.into(),
            is_system,
            has_access: true,
        }
    }

    fn step(id: &str, order: u32, mode: ExecutionMode, previous: Option<&str>, settings: TaskSettings) -> JobTask {
        JobTask {
            id: JobTaskId::from_raw(id),
            job_id: JobId::from_raw("nightly"),
            name: id.to_string(),
            kind: settings.kind(),
            agent_key: AgentKey::from("db-01"),
            mode,
            use_previous_task_artifacts_from: previous.map(JobTaskId::from_raw),
            order,
            timeout_secs: None,
            settings,
        }
    }

    fn backup() -> TaskSettings {
        TaskSettings::CreateBackup(CreateBackupSettings::default())
    }

    fn compress() -> TaskSettings {
        TaskSettings::Compress(CompressSettings::default())
    }

    fn delete() -> TaskSettings {
        TaskSettings::Delete(DeleteSettings::default())
    }

    fn harness(databases: Vec<Database>, fail_runs: bool, steps: Vec<JobTask>) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        store
            .upsert_agent(Agent {
                key: AgentKey::from("db-01"),
                name: "db-01".into(),
                description: None,
            })
            .unwrap();
        let job_id = JobId::from_raw("nightly");
        store
            .upsert_job(Job {
                id: job_id.clone(),
                name: "Nightly".into(),
                description: None,
            })
            .unwrap();
        for s in steps {
            store.upsert_job_task(s).unwrap();
        }

        let (runs_tx, runs) = mpsc::unbounded_channel();
        let (stops_tx, stops) = mpsc::unbounded_channel();
        let remote = Arc::new(MockRemote {
            databases,
            fail_runs,
            runs: runs_tx,
            stops: stops_tx,
        });
        let repo: Arc<dyn Repository> = store.clone();
        Harness {
            runner: Arc::new(JobRunner::new(repo, remote)),
            store,
            runs,
            stops,
            job_id,
        }
    }

    async fn next_dispatch(h: &mut Harness) -> (JobRunTask, Option<JobRunTask>) {
        tokio::time::timeout(Duration::from_secs(5), h.runs.recv())
            .await
            .expect("no dispatch within 5s")
            .expect("dispatch channel closed")
    }

    fn complete(task: &JobRunTask, artifact: Option<&str>, is_error: bool) -> TaskComplete {
        TaskComplete {
            job_run_task_id: task.id.clone(),
            message: if is_error { "failed".into() } else { "done".into() },
            result_artifact: artifact.map(str::to_string),
            is_error,
        }
    }

    async fn wait_for_finish(store: &InMemoryStore, run_id: &JobRunId) -> JobRun {
        for _ in 0..500 {
            let run = store.get_run(run_id).unwrap();
            if run.status.is_terminal() {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run {run_id} did not finish");
    }

    fn backup_then_compress() -> Vec<JobTask> {
        vec![
            step("backup", 1, ExecutionMode::Parallel, None, backup()),
            step("compress", 2, ExecutionMode::Sequential, Some("backup"), compress()),
        ]
    }

    #[tokio::test]
    async fn backup_then_compress_chains_artifacts_per_item() {
        let mut h = harness(vec![db("master", true), db("app", false)], false, backup_then_compress());
        let run = h.runner.start_run(&h.job_id).await.unwrap();

        let tasks = h.store.run_tasks_for_run(&run.id).unwrap();
        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().all(|t| t.item_name == "app"));

        let (backup_task, previous) = next_dispatch(&mut h).await;
        assert_eq!(backup_task.kind, TaskKind::CreateBackup);
        assert!(previous.is_none());
        assert_eq!(
            h.store.run_tasks_for_run(&run.id).unwrap()[1].status,
            TaskStatus::Pending
        );

        h.runner
            .on_task_complete(complete(&backup_task, Some("/tmp/app.bak"), false))
            .await
            .unwrap();
        let (compress_task, previous) = next_dispatch(&mut h).await;
        assert_eq!(compress_task.kind, TaskKind::Compress);
        let previous = previous.unwrap();
        assert_eq!(previous.id, backup_task.id);
        assert_eq!(previous.result_artifact.as_deref(), Some("/tmp/app.bak"));

        h.runner
            .on_task_complete(complete(&compress_task, Some("/tmp/app.bak.gz"), false))
            .await
            .unwrap();
        let run = h.store.get_run(&run.id).unwrap();
        assert_eq!(run.status, JobRunStatus::Completed);
        assert!(!run.is_error);
        assert!(run.result.unwrap().starts_with("Job completed successfully in "));
        assert!(run.run_time.is_some());
    }

    #[tokio::test]
    async fn manual_include_overrides_regex_exclude_in_fan_out() {
        let settings = CreateBackupSettings {
            backup_exclude_regex: Some("app.*".into()),
            backup_include_manual: vec!["app2".into()],
            ..CreateBackupSettings::default()
        };
        let steps = vec![step(
            "backup",
            1,
            ExecutionMode::Parallel,
            None,
            TaskSettings::CreateBackup(settings),
        )];
        let h = harness(
            vec![db("sys", true), db("app1", false), db("app2", false)],
            false,
            steps,
        );
        let run = h.runner.start_run(&h.job_id).await.unwrap();
        let names: Vec<String> = h
            .store
            .run_tasks_for_run(&run.id)
            .unwrap()
            .into_iter()
            .map(|t| t.item_name)
            .collect();
        assert_eq!(names, vec!["app2".to_string()]);
    }

    #[tokio::test]
    async fn failed_step_skips_its_chain() {
        let mut h = harness(vec![db("app", false)], false, backup_then_compress());
        let run = h.runner.start_run(&h.job_id).await.unwrap();
        let (backup_task, _) = next_dispatch(&mut h).await;

        h.runner
            .on_task_complete(complete(&backup_task, None, true))
            .await
            .unwrap();

        let tasks = h.store.run_tasks_for_run(&run.id).unwrap();
        assert_eq!(tasks[1].status, TaskStatus::Error);
        assert_eq!(tasks[1].result.as_deref(), Some(SKIPPED_MESSAGE));
        let run = h.store.get_run(&run.id).unwrap();
        assert_eq!(run.status, JobRunStatus::CompletedWithErrors);
        assert!(run.is_error);
        assert!(run.result.unwrap().starts_with("Job completed with 2 errors in "));
        assert!(h.runs.try_recv().is_err());
    }

    #[tokio::test]
    async fn dispatch_failure_becomes_error_completion() {
        let h = harness(vec![], true, vec![step("cleanup", 1, ExecutionMode::Parallel, None, delete())]);
        let run = h.runner.start_run(&h.job_id).await.unwrap();

        let run = wait_for_finish(&h.store, &run.id).await;
        assert_eq!(run.status, JobRunStatus::CompletedWithErrors);
        let task = &h.store.run_tasks_for_run(&run.id).unwrap()[0];
        assert_eq!(task.status, TaskStatus::Error);
        assert!(task.result.as_deref().unwrap().contains("no connection found"));
    }

    #[tokio::test]
    async fn straggler_completion_leaves_finished_run_untouched() {
        let mut h = harness(vec![], false, vec![step("cleanup", 1, ExecutionMode::Parallel, None, delete())]);
        let run = h.runner.start_run(&h.job_id).await.unwrap();
        let (task, _) = next_dispatch(&mut h).await;
        h.runner.on_task_complete(complete(&task, None, false)).await.unwrap();
        let finished = h.store.get_run(&run.id).unwrap();

        h.runner.on_task_complete(complete(&task, None, true)).await.unwrap();
        assert_eq!(h.store.get_run(&run.id).unwrap(), finished);
        assert_eq!(h.store.get_run_task(&task.id).unwrap().status, TaskStatus::Completed);
        assert_eq!(h.store.logs_for_task(&task.id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn sequential_step_waits_for_earlier_steps() {
        let mut h = harness(
            vec![],
            false,
            vec![
                step("first", 1, ExecutionMode::Parallel, None, delete()),
                step("second", 2, ExecutionMode::Sequential, None, delete()),
            ],
        );
        let run = h.runner.start_run(&h.job_id).await.unwrap();
        let (first, _) = next_dispatch(&mut h).await;
        assert_eq!(first.item_name, "first");
        assert_eq!(
            h.store.run_tasks_for_run(&run.id).unwrap()[1].status,
            TaskStatus::Pending
        );

        h.runner.on_task_complete(complete(&first, None, false)).await.unwrap();
        let (second, _) = next_dispatch(&mut h).await;
        assert_eq!(second.item_name, "second");
    }

    #[tokio::test]
    async fn sequential_fan_out_runs_one_item_at_a_time() {
        let mut h = harness(
            vec![db("a", false), db("b", false)],
            false,
            vec![step("backup", 1, ExecutionMode::Sequential, None, backup())],
        );
        let run = h.runner.start_run(&h.job_id).await.unwrap();
        let (a, _) = next_dispatch(&mut h).await;
        assert_eq!((a.item_name.as_str(), a.item_order), ("a", 1));
        let statuses: Vec<TaskStatus> = h
            .store
            .run_tasks_for_run(&run.id)
            .unwrap()
            .iter()
            .map(|t| t.status)
            .collect();
        assert_eq!(statuses, vec![TaskStatus::Running, TaskStatus::Pending]);

        h.runner.on_task_complete(complete(&a, Some("/tmp/a.bak"), false)).await.unwrap();
        let (b, _) = next_dispatch(&mut h).await;
        assert_eq!((b.item_name.as_str(), b.item_order), ("b", 2));
    }

    #[tokio::test]
    async fn stop_run_stops_unfinished_tasks() {
        let mut h = harness(vec![db("app", false)], false, backup_then_compress());
        let run = h.runner.start_run(&h.job_id).await.unwrap();
        let (backup_task, _) = next_dispatch(&mut h).await;

        let stopped = h.runner.stop_run(&run.id).await.unwrap();
        assert_eq!(stopped.status, JobRunStatus::Stopped);
        assert!(!stopped.is_error);
        assert!(stopped.result.unwrap().starts_with("Job was manually stopped after "));
        assert!(h
            .store
            .run_tasks_for_run(&run.id)
            .unwrap()
            .iter()
            .all(|t| t.status == TaskStatus::Stopped));

        let stop = tokio::time::timeout(Duration::from_secs(5), h.stops.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stop, backup_task.id);

        assert!(matches!(
            h.runner.stop_run(&run.id).await,
            Err(RunError::AlreadyCompleted(_))
        ));
        // The agent's own completion for the stopped task changes nothing.
        h.runner
            .on_task_complete(complete(&backup_task, None, true))
            .await
            .unwrap();
        assert_eq!(h.store.get_run(&run.id).unwrap().status, JobRunStatus::Stopped);
        assert_eq!(h.runner.run_locks.len(), 0);
    }

    #[tokio::test]
    async fn stopping_unknown_run_leaves_no_lock_behind() {
        let h = harness(vec![], false, vec![]);
        for _ in 0..3 {
            assert!(matches!(
                h.runner.stop_run(&JobRunId::from_raw("run_missing")).await,
                Err(RunError::Store(StoreError::NotFound(_)))
            ));
        }
        assert_eq!(h.runner.run_locks.len(), 0);
    }

    /// Refuses every batch of run tasks.
    struct RejectsRunTasks(InMemoryStore);

    impl Repository for RejectsRunTasks {
        fn upsert_agent(&self, agent: Agent) -> Result<(), StoreError> {
            self.0.upsert_agent(agent)
        }
        fn get_agent(&self, key: &AgentKey) -> Result<Agent, StoreError> {
            self.0.get_agent(key)
        }
        fn list_agents(&self) -> Result<Vec<Agent>, StoreError> {
            self.0.list_agents()
        }
        fn upsert_job(&self, job: Job) -> Result<(), StoreError> {
            self.0.upsert_job(job)
        }
        fn get_job(&self, id: &JobId) -> Result<Job, StoreError> {
            self.0.get_job(id)
        }
        fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
            self.0.list_jobs()
        }
        fn upsert_job_task(&self, task: JobTask) -> Result<(), StoreError> {
            self.0.upsert_job_task(task)
        }
        fn get_job_task(&self, id: &JobTaskId) -> Result<JobTask, StoreError> {
            self.0.get_job_task(id)
        }
        fn job_tasks_for_job(&self, job_id: &JobId) -> Result<Vec<JobTask>, StoreError> {
            self.0.job_tasks_for_job(job_id)
        }
        fn create_run(&self, run: JobRun) -> Result<(), StoreError> {
            self.0.create_run(run)
        }
        fn get_run(&self, id: &JobRunId) -> Result<JobRun, StoreError> {
            self.0.get_run(id)
        }
        fn running_runs(&self, job_id: Option<&JobId>) -> Result<Vec<JobRun>, StoreError> {
            self.0.running_runs(job_id)
        }
        fn complete_run(&self, id: &JobRunId, completion: RunCompletion) -> Result<bool, StoreError> {
            self.0.complete_run(id, completion)
        }
        fn create_run_tasks(&self, _tasks: Vec<JobRunTask>) -> Result<(), StoreError> {
            Err(StoreError::Conflict("run tasks rejected".into()))
        }
        fn get_run_task(&self, id: &JobRunTaskId) -> Result<JobRunTask, StoreError> {
            self.0.get_run_task(id)
        }
        fn run_tasks_for_run(&self, run_id: &JobRunId) -> Result<Vec<JobRunTask>, StoreError> {
            self.0.run_tasks_for_run(run_id)
        }
        fn update_run_task(&self, task: &JobRunTask) -> Result<(), StoreError> {
            self.0.update_run_task(task)
        }
        fn add_log(&self, log: JobRunTaskLog) -> Result<(), StoreError> {
            self.0.add_log(log)
        }
        fn logs_for_task(&self, id: &JobRunTaskId) -> Result<Vec<JobRunTaskLog>, StoreError> {
            self.0.logs_for_task(id)
        }
        fn delete_runs_before(
            &self,
            job_id: &JobId,
            cutoff: chrono::DateTime<Utc>,
        ) -> Result<usize, StoreError> {
            self.0.delete_runs_before(job_id, cutoff)
        }
    }

    #[tokio::test]
    async fn store_failure_after_run_created_closes_the_run() {
        let store = Arc::new(RejectsRunTasks(InMemoryStore::new()));
        let job_id = JobId::from_raw("nightly");
        store
            .upsert_job(Job {
                id: job_id.clone(),
                name: "Nightly".into(),
                description: None,
            })
            .unwrap();
        store
            .upsert_job_task(step("cleanup", 1, ExecutionMode::Parallel, None, delete()))
            .unwrap();
        let (runs_tx, _runs) = mpsc::unbounded_channel();
        let (stops_tx, _stops) = mpsc::unbounded_channel();
        let remote = Arc::new(MockRemote {
            databases: vec![],
            fail_runs: false,
            runs: runs_tx,
            stops: stops_tx,
        });
        let repo: Arc<dyn Repository> = store.clone();
        let runner = Arc::new(JobRunner::new(repo, remote));

        for _ in 0..2 {
            // A retry hits the same store error, not AlreadyRunning.
            assert!(matches!(
                runner.start_run(&job_id).await,
                Err(RunError::Store(StoreError::Conflict(_)))
            ));
        }
        assert!(store.running_runs(Some(&job_id)).unwrap().is_empty());
        assert_eq!(runner.active_runs.len(), 0);
        assert_eq!(runner.run_locks.len(), 0);
    }

    #[tokio::test]
    async fn second_start_while_running_is_rejected() {
        let h = harness(vec![], false, vec![step("cleanup", 1, ExecutionMode::Parallel, None, delete())]);
        let first = h.runner.start_run(&h.job_id).await.unwrap();
        match h.runner.start_run(&h.job_id).await {
            Err(RunError::AlreadyRunning { run_id, .. }) => assert_eq!(run_id, first.id),
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_job_and_unknown_job() {
        let h = harness(vec![], false, vec![]);
        assert!(matches!(
            h.runner.start_run(&h.job_id).await,
            Err(RunError::EmptyJob(_))
        ));
        assert!(matches!(
            h.runner.start_run(&JobId::from_raw("missing")).await,
            Err(RunError::Store(StoreError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn backup_with_no_matching_databases_finishes_immediately() {
        let h = harness(vec![db("master", true)], false, backup_then_compress());
        let run = h.runner.start_run(&h.job_id).await.unwrap();
        assert_eq!(run.status, JobRunStatus::Completed);
        assert!(h.store.run_tasks_for_run(&run.id).unwrap().is_empty());
    }

    #[test]
    fn durations() {
        assert_eq!(format_duration(3), "3s");
        assert_eq!(format_duration(125), "2m 5s");
        assert_eq!(format_duration(3612), "1h 0m 12s");
        assert_eq!(format_duration(-4), "0s");
    }
}

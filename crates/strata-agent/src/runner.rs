//! Agent-side task runner.
//!
//! A single-permit gate serializes the dispatch decision (executor lookup, duplicate check,
//! registration). Task bodies run outside the gate, fully concurrent with each other. Every
//! accepted task produces exactly one `TaskComplete` on the event channel, after any progress
//! it emitted, and is removed from the running registry before that completion is sent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use strata_core::ids::JobRunTaskId;
use strata_core::models::{JobRunTask, TaskKind};
use strata_core::rpc::{AgentMessage, TaskComplete};
use strata_core::OrchestrationError;

use crate::executor::{TaskContext, TaskError, TaskExecutor};

pub const DISPATCH_GATE_TIMEOUT: Duration = Duration::from_secs(30);

struct RunningTask {
    cancel: CancellationToken,
    started: Instant,
}

pub struct TaskRunner {
    executors: HashMap<TaskKind, Arc<dyn TaskExecutor>>,
    gate: Semaphore,
    gate_timeout: Duration,
    running: Arc<DashMap<JobRunTaskId, RunningTask>>,
    events: mpsc::Sender<AgentMessage>,
}

impl TaskRunner {
    pub fn new(events: mpsc::Sender<AgentMessage>) -> Self {
        Self {
            executors: HashMap::new(),
            gate: Semaphore::new(1),
            gate_timeout: DISPATCH_GATE_TIMEOUT,
            running: Arc::new(DashMap::new()),
            events,
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        let _ = self.executors.insert(executor.kind(), executor);
        self
    }

    pub fn with_gate_timeout(mut self, timeout: Duration) -> Self {
        self.gate_timeout = timeout;
        self
    }

    /// Accept a run task and start it in the background.
    ///
    /// Returns once the task is registered, not when it finishes. The task's own cancellation
    /// is a child of `cancel`. Rejections:
    /// - `DispatchGateTimeout`: the gate stayed busy; nothing is emitted.
    /// - `DispatchCancelled`: `cancel` fired while waiting for the gate; nothing is emitted.
    /// - `UnknownTaskType`: no executor; a synthetic error completion is emitted.
    /// - `DuplicateDispatch`: the id is already running; the running instance is untouched.
    pub async fn execute_task(
        &self,
        task: JobRunTask,
        previous: Option<JobRunTask>,
        cancel: &CancellationToken,
    ) -> Result<(), OrchestrationError> {
        let task_id = task.id.clone();
        debug!(job_run_task_id = %task_id, kind = %task.kind, "dispatching task");

        let permit = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(job_run_task_id = %task_id, "dispatch cancelled before entering the gate");
                return Err(OrchestrationError::DispatchCancelled(task_id));
            }
            acquired = tokio::time::timeout(self.gate_timeout, self.gate.acquire()) => match acquired {
                Ok(Ok(permit)) => permit,
                _ => {
                    error!(
                        job_run_task_id = %task_id,
                        timeout = ?self.gate_timeout,
                        "could not enter dispatch gate"
                    );
                    return Err(OrchestrationError::DispatchGateTimeout(self.gate_timeout));
                }
            },
        };

        let Some(executor) = self.executors.get(&task.kind).cloned() else {
            drop(permit);
            let err = OrchestrationError::UnknownTaskType(task.kind);
            self.complete(&task_id, err.to_string(), None, true).await;
            return Err(err);
        };

        let cancel = cancel.child_token();
        match self.running.entry(task_id.clone()) {
            Entry::Occupied(_) => {
                debug!(job_run_task_id = %task_id, "task is already running");
                return Err(OrchestrationError::DuplicateDispatch(task_id));
            }
            Entry::Vacant(slot) => {
                let _ = slot.insert(RunningTask {
                    cancel: cancel.clone(),
                    started: Instant::now(),
                });
            }
        }
        drop(permit);

        let timeout = task.timeout_secs.filter(|s| *s > 0).map(Duration::from_secs);
        let ctx = TaskContext::new(task, previous, cancel, self.events.clone());
        let running = Arc::clone(&self.running);
        let events = self.events.clone();
        tokio::spawn(run_body(executor, ctx, timeout, running, events));
        Ok(())
    }

    /// Request cancellation of a running task. Absent ids are ignored.
    pub fn stop_task(&self, id: &JobRunTaskId) -> bool {
        match self.running.get(id) {
            Some(entry) => {
                info!(job_run_task_id = %id, "stopping task");
                entry.cancel.cancel();
                true
            }
            None => {
                debug!(job_run_task_id = %id, "stop requested for task that is not running");
                false
            }
        }
    }

    pub fn stop_all_tasks(&self) -> usize {
        let mut stopped = 0;
        for entry in self.running.iter() {
            entry.cancel.cancel();
            stopped += 1;
        }
        if stopped > 0 {
            info!(count = stopped, "stopping all tasks");
        }
        stopped
    }

    pub fn is_running(&self, id: &JobRunTaskId) -> bool {
        self.running.contains_key(id)
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    async fn complete(
        &self,
        id: &JobRunTaskId,
        message: String,
        artifact: Option<String>,
        is_error: bool,
    ) {
        send_complete(&self.events, id, message, artifact, is_error).await;
    }
}

async fn run_body(
    executor: Arc<dyn TaskExecutor>,
    ctx: TaskContext,
    timeout: Option<Duration>,
    running: Arc<DashMap<JobRunTaskId, RunningTask>>,
    events: mpsc::Sender<AgentMessage>,
) {
    let task_id = ctx.task.id.clone();
    let timed_out = Arc::new(AtomicBool::new(false));

    // Expiry cancels through the same token a manual stop uses.
    let watchdog = timeout.map(|limit| {
        let cancel = ctx.cancel.clone();
        let timed_out = Arc::clone(&timed_out);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(limit) => {
                    timed_out.store(true, Ordering::SeqCst);
                    cancel.cancel();
                }
                _ = cancel.cancelled() => {}
            }
        })
    });

    // A panicking body must still deregister and report.
    let body = tokio::spawn(async move { executor.run(&ctx).await });
    let result = match body.await {
        Ok(result) => result,
        Err(e) => Err(TaskError::Crashed(e.to_string())),
    };
    if let Some(watchdog) = watchdog {
        watchdog.abort();
    }

    let elapsed = running
        .remove(&task_id)
        .map(|(_, entry)| entry.started.elapsed())
        .unwrap_or_default();

    let (message, artifact, is_error) = match result {
        Ok(outcome) => {
            info!(job_run_task_id = %task_id, elapsed = ?elapsed, "task completed");
            (outcome.message, outcome.artifact, false)
        }
        Err(TaskError::Cancelled) if timed_out.load(Ordering::SeqCst) => {
            let secs = timeout.map(|t| t.as_secs()).unwrap_or_default();
            warn!(job_run_task_id = %task_id, timeout_secs = secs, "task timed out");
            (format!("Task timed out after {secs} seconds"), None, true)
        }
        Err(TaskError::Cancelled) => {
            info!(job_run_task_id = %task_id, "task stopped");
            ("Task was stopped".to_string(), None, true)
        }
        Err(e) => {
            let err = OrchestrationError::TaskExecutionError {
                task_id: task_id.clone(),
                message: e.to_string(),
            };
            warn!(job_run_task_id = %task_id, error = %err, "task failed");
            (e.to_string(), None, true)
        }
    };

    send_complete(&events, &task_id, message, artifact, is_error).await;
}

async fn send_complete(
    events: &mpsc::Sender<AgentMessage>,
    id: &JobRunTaskId,
    message: String,
    artifact: Option<String>,
    is_error: bool,
) {
    let complete = AgentMessage::TaskComplete(TaskComplete {
        job_run_task_id: id.clone(),
        message,
        result_artifact: artifact,
        is_error,
    });
    if events.send(complete).await.is_err() {
        error!(job_run_task_id = %id, "event channel closed, completion lost");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::test_support::*;
    use crate::executor::TaskOutcome;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use strata_core::models::{CompressSettings, DeleteSettings, TaskSettings};

    /// Emits one progress line, then waits for `release` or cancellation.
    struct Blocking {
        kind: TaskKind,
        started: Arc<AtomicUsize>,
        release: CancellationToken,
    }

    impl Blocking {
        fn new(kind: TaskKind) -> Arc<Self> {
            Arc::new(Self {
                kind,
                started: Arc::new(AtomicUsize::new(0)),
                release: CancellationToken::new(),
            })
        }
    }

    #[async_trait]
    impl TaskExecutor for Blocking {
        fn kind(&self) -> TaskKind {
            self.kind
        }

        async fn run(&self, ctx: &TaskContext) -> Result<TaskOutcome, TaskError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            ctx.progress("working").await;
            tokio::select! {
                _ = self.release.cancelled() => Ok(TaskOutcome {
                    message: "done".into(),
                    artifact: Some(format!("/tmp/{}.out", ctx.task.item_name)),
                }),
                _ = ctx.cancel.cancelled() => Err(TaskError::Cancelled),
            }
        }
    }

    fn delete_task() -> JobRunTask {
        run_task(TaskSettings::Delete(DeleteSettings::default()), "app")
    }

    async fn start(runner: &TaskRunner, task: JobRunTask) -> Result<(), OrchestrationError> {
        runner.execute_task(task, None, &CancellationToken::new()).await
    }

    async fn next_complete(rx: &mut mpsc::Receiver<AgentMessage>) -> TaskComplete {
        loop {
            match rx.recv().await {
                Some(AgentMessage::TaskComplete(c)) => return c,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    }

    #[tokio::test]
    async fn completion_follows_progress_and_deregisters() {
        let (tx, mut rx) = mpsc::channel(64);
        let exec = Blocking::new(TaskKind::Delete);
        let runner = TaskRunner::new(tx).with_executor(exec.clone());
        let task = delete_task();
        let id = task.id.clone();

        start(&runner, task).await.unwrap();
        assert!(runner.is_running(&id));

        match rx.recv().await.unwrap() {
            AgentMessage::TaskProgress(p) => assert_eq!(p.message, "working"),
            other => panic!("expected progress first, got {other:?}"),
        }
        exec.release.cancel();
        let complete = next_complete(&mut rx).await;
        assert_eq!(complete.job_run_task_id, id);
        assert!(!complete.is_error);
        assert_eq!(complete.result_artifact.as_deref(), Some("/tmp/app.out"));
        assert!(!runner.is_running(&id));
    }

    #[tokio::test]
    async fn duplicate_dispatch_starts_nothing() {
        let (tx, _rx) = mpsc::channel(64);
        let exec = Blocking::new(TaskKind::Delete);
        let runner = TaskRunner::new(tx).with_executor(exec.clone());
        let task = delete_task();

        start(&runner, task.clone()).await.unwrap();
        let err = start(&runner, task.clone()).await.unwrap_err();
        assert_eq!(err, OrchestrationError::DuplicateDispatch(task.id.clone()));
        assert_eq!(runner.running_count(), 1);

        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(exec.started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_duplicates_register_once() {
        let (tx, _rx) = mpsc::channel(64);
        let runner = Arc::new(TaskRunner::new(tx).with_executor(Blocking::new(TaskKind::Delete)));
        let task = delete_task();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let runner = Arc::clone(&runner);
            let task = task.clone();
            handles.push(tokio::spawn(async move { start(&runner, task).await }));
        }
        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);
        assert_eq!(runner.running_count(), 1);
    }

    #[tokio::test]
    async fn unknown_kind_emits_synthetic_error() {
        let (tx, mut rx) = mpsc::channel(64);
        let runner = TaskRunner::new(tx);
        let task = run_task(TaskSettings::Compress(CompressSettings::default()), "app");

        let err = start(&runner, task.clone()).await.unwrap_err();
        assert_eq!(err, OrchestrationError::UnknownTaskType(TaskKind::Compress));

        let complete = next_complete(&mut rx).await;
        assert!(complete.is_error);
        assert_eq!(complete.job_run_task_id, task.id);
        assert_eq!(runner.running_count(), 0);
    }

    #[tokio::test]
    async fn stop_of_absent_task_is_noop() {
        let (tx, _rx) = mpsc::channel(8);
        let runner = TaskRunner::new(tx);
        assert!(!runner.stop_task(&JobRunTaskId::from_raw("rtask_missing")));
        assert_eq!(runner.stop_all_tasks(), 0);
    }

    #[tokio::test]
    async fn stop_cancels_running_task() {
        let (tx, mut rx) = mpsc::channel(64);
        let runner = TaskRunner::new(tx).with_executor(Blocking::new(TaskKind::Delete));
        let task = delete_task();
        let id = task.id.clone();

        start(&runner, task).await.unwrap();
        assert!(runner.stop_task(&id));

        let complete = next_complete(&mut rx).await;
        assert!(complete.is_error);
        assert_eq!(complete.message, "Task was stopped");
        assert!(!runner.is_running(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_cancels_like_a_stop() {
        let (tx, mut rx) = mpsc::channel(64);
        let runner = TaskRunner::new(tx).with_executor(Blocking::new(TaskKind::Delete));
        let mut task = delete_task();
        task.timeout_secs = Some(5);

        start(&runner, task).await.unwrap();
        let complete = next_complete(&mut rx).await;
        assert!(complete.is_error);
        assert_eq!(complete.message, "Task timed out after 5 seconds");
        assert_eq!(runner.running_count(), 0);
    }

    #[tokio::test]
    async fn stop_all_signals_every_task() {
        let (tx, mut rx) = mpsc::channel(64);
        let runner = TaskRunner::new(tx).with_executor(Blocking::new(TaskKind::Delete));
        start(&runner, delete_task()).await.unwrap();
        start(&runner, delete_task()).await.unwrap();

        assert_eq!(runner.stop_all_tasks(), 2);
        next_complete(&mut rx).await;
        next_complete(&mut rx).await;
        assert_eq!(runner.running_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn busy_gate_times_out() {
        let (tx, _rx) = mpsc::channel(8);
        let runner = TaskRunner::new(tx)
            .with_executor(Blocking::new(TaskKind::Delete))
            .with_gate_timeout(Duration::from_secs(30));
        let _held = runner.gate.acquire().await.unwrap();

        let err = start(&runner, delete_task()).await.unwrap_err();
        assert_eq!(err, OrchestrationError::DispatchGateTimeout(Duration::from_secs(30)));
        assert_eq!(runner.running_count(), 0);
    }

    struct Panicking;

    #[async_trait]
    impl TaskExecutor for Panicking {
        fn kind(&self) -> TaskKind {
            TaskKind::Delete
        }

        async fn run(&self, _ctx: &TaskContext) -> Result<TaskOutcome, TaskError> {
            panic!("executor bug");
        }
    }

    #[tokio::test]
    async fn panicking_body_still_completes_and_deregisters() {
        let (tx, mut rx) = mpsc::channel(64);
        let runner = TaskRunner::new(tx).with_executor(Arc::new(Panicking));
        let task = delete_task();

        start(&runner, task.clone()).await.unwrap();
        let complete = next_complete(&mut rx).await;
        assert_eq!(complete.job_run_task_id, task.id);
        assert!(complete.is_error);
        assert!(complete.message.starts_with("Task crashed"), "got {}", complete.message);
        assert!(!runner.is_running(&task.id));

        // The id is free again, so a redelivered Run is accepted.
        start(&runner, task.clone()).await.unwrap();
        assert!(next_complete(&mut rx).await.is_error);
    }

    #[tokio::test]
    async fn caller_cancel_aborts_gate_wait() {
        let (tx, _rx) = mpsc::channel(8);
        let runner = TaskRunner::new(tx).with_executor(Blocking::new(TaskKind::Delete));
        let _held = runner.gate.acquire().await.unwrap();
        let task = delete_task();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = runner.execute_task(task.clone(), None, &cancel).await.unwrap_err();
        assert_eq!(err, OrchestrationError::DispatchCancelled(task.id));
        assert_eq!(runner.running_count(), 0);
    }

    #[tokio::test]
    async fn caller_cancel_reaches_running_task() {
        let (tx, mut rx) = mpsc::channel(64);
        let runner = TaskRunner::new(tx).with_executor(Blocking::new(TaskKind::Delete));
        let cancel = CancellationToken::new();

        runner.execute_task(delete_task(), None, &cancel).await.unwrap();
        cancel.cancel();
        let complete = next_complete(&mut rx).await;
        assert_eq!(complete.message, "Task was stopped");
        assert_eq!(runner.running_count(), 0);
    }
}

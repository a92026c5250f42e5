use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use tokio::runtime::Handle;
use tokio::sync::{Notify, mpsc};

use crate::config::RuntimeConfig;
use crate::models::{
    ArtifactFile, CoreError, CoreErrorKind, Stage, SubTaskRef, SubTaskStatus, SubTaskUpdate, Task,
    TaskId, TaskParams, TaskStatus,
};
use crate::naming::{FileInfo, subtask_name_at};
use crate::orchestration::executor::{
    ABANDONED_MESSAGE, Lease, LeaseState, StageEvent, StageEventSink,
};
use crate::orchestration::{
    EntityLocks, Notifier, OrchestrationResult, Snapshot, StageExecutor, StageFailure, StageInput,
    StageOutput, StageReporter, StageResult, StatusSynchronizer, blocking, retry_on_conflict,
    workflow,
};
use crate::persistence::{ArtifactStore, TaskStore};

const INTERRUPTED_MESSAGE: &str = "interrupted by restart";

/// Outcome of [`WorkflowRuntime::recover`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RecoveryReport {
    pub dispatched: Vec<TaskId>,
    pub parked: Vec<TaskId>,
    pub failed: Vec<TaskId>,
}

/// Drives tasks through their stages. Stage completions and progress arrive
/// as events on a per-task channel and are applied in delivery order; tasks
/// are processed independently of each other.
#[derive(Clone)]
pub struct WorkflowRuntime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    handle: Handle,
    tasks: Arc<dyn TaskStore>,
    executors: HashMap<Stage, Arc<dyn StageExecutor>>,
    notifier: Arc<dyn Notifier>,
    locks: Arc<EntityLocks>,
    synchronizer: StatusSynchronizer,
    config: RuntimeConfig,
    workers: Mutex<HashMap<TaskId, mpsc::UnboundedSender<StageEvent>>>,
    completion_notifiers: Mutex<HashMap<TaskId, Arc<Notify>>>,
}

struct EventRouter {
    inner: Arc<RuntimeInner>,
}

impl StageEventSink for EventRouter {
    fn deliver(&self, task_id: &TaskId, event: StageEvent) {
        RuntimeInner::route(&self.inner, task_id, event);
    }
}

impl WorkflowRuntime {
    /// Every executing stage needs exactly one executor. Must be called from
    /// within a tokio runtime.
    pub fn new(
        task_store: Arc<dyn TaskStore>,
        artifact_store: Arc<dyn ArtifactStore>,
        executors: impl IntoIterator<Item = Arc<dyn StageExecutor>>,
        notifier: Arc<dyn Notifier>,
        config: RuntimeConfig,
    ) -> OrchestrationResult<Self> {
        let handle = Handle::try_current().map_err(|error| {
            CoreError::internal(format!(
                "workflow runtime must be created inside a tokio runtime: {error}"
            ))
        })?;

        let mut mapped = HashMap::new();
        for executor in executors {
            let stage = executor.stage();
            if !stage.is_executing() {
                return Err(CoreError::validation(format!(
                    "stage '{stage}' is not run by an executor"
                ))
                .at_stage(stage));
            }
            if mapped.insert(stage, executor).is_some() {
                return Err(CoreError::validation(format!(
                    "duplicate executor registration for stage '{stage}'"
                ))
                .at_stage(stage));
            }
        }
        if let Some(stage) = Stage::EXECUTING
            .into_iter()
            .find(|stage| !mapped.contains_key(stage))
        {
            return Err(CoreError::validation(format!(
                "no executor is registered for stage '{stage}'"
            ))
            .at_stage(stage));
        }

        let locks = Arc::new(EntityLocks::new());
        let synchronizer = StatusSynchronizer::new(
            task_store.clone(),
            artifact_store,
            locks.clone(),
            notifier.clone(),
            config.store_retry,
        );

        Ok(Self {
            inner: Arc::new(RuntimeInner {
                handle,
                tasks: task_store,
                executors: mapped,
                notifier,
                locks,
                synchronizer,
                config,
                workers: Mutex::new(HashMap::new()),
                completion_notifiers: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn synchronizer(&self) -> &StatusSynchronizer {
        &self.inner.synchronizer
    }

    /// Validates `params`, persists a new pending task and dispatches its
    /// first stage.
    pub async fn create_task(&self, mut params: TaskParams) -> OrchestrationResult<Task> {
        if params.quality.trim().is_empty() {
            params.quality = self.inner.config.default_quality.clone();
        }
        params.validate()?;

        let task = Task::new(TaskId::generate(), params, SystemTime::now());
        {
            let _guard = self.inner.locks.task(&task.task_id).await;
            self.inner.save_task(&task).await?;
            self.inner.publish_task(&task);
        }
        tracing::info!(
            task_id = %task.task_id,
            source_url = %task.params.source_url,
            "task created"
        );
        self.inner.spawn_dispatch(task.task_id.clone(), task.stage);
        Ok(task)
    }

    pub async fn get_task(&self, task_id: &TaskId) -> OrchestrationResult<Task> {
        self.inner.load_existing(task_id).await
    }

    pub async fn get_artifact(&self, artifact_path: &str) -> OrchestrationResult<ArtifactFile> {
        self.inner
            .synchronizer
            .load_artifact(artifact_path)
            .await?
            .ok_or_else(|| CoreError::artifact_not_found(artifact_path))
    }

    pub async fn list_tasks(&self, limit: usize) -> OrchestrationResult<Vec<Task>> {
        blocking(&self.inner.tasks, "list_tasks", move |store| {
            store.list_tasks(limit)
        })
        .await
    }

    /// Applies executor progress for `stage`. Progress for a stage the task
    /// has left is ignored.
    pub async fn report_progress(
        &self,
        task_id: &TaskId,
        stage: Stage,
        stage_progress: f64,
        message: impl Into<String>,
    ) -> OrchestrationResult<()> {
        self.inner
            .apply_progress_event(task_id, stage, None, stage_progress, message.into())
            .await
    }

    /// Records the terminal result of `stage` and schedules what follows.
    /// A completion for a stage the task has already left is a no-op.
    pub async fn on_stage_complete(
        &self,
        task_id: &TaskId,
        stage: Stage,
        result: StageResult,
    ) -> OrchestrationResult<()> {
        self.inner.complete_stage(task_id, stage, None, result).await
    }

    pub async fn sync_subtask_status(
        &self,
        task_id: &TaskId,
        subtask_name: &str,
        artifact_path: &str,
        update: SubTaskUpdate,
    ) -> OrchestrationResult<SubTaskStatus> {
        self.inner
            .synchronizer
            .sync_subtask_status(task_id, subtask_name, artifact_path, update)
            .await
    }

    pub async fn delete_subtask(
        &self,
        artifact_path: &str,
        subtask_name: &str,
    ) -> OrchestrationResult<bool> {
        self.inner
            .synchronizer
            .delete_subtask(artifact_path, subtask_name)
            .await
    }

    /// Releases a task parked in a waiting stage and dispatches the next stage.
    pub async fn resume(&self, task_id: &TaskId) -> OrchestrationResult<Task> {
        self.inner.resume(task_id).await
    }

    /// Re-attaches unfinished tasks after a restart. Call once at startup.
    pub async fn recover(&self) -> OrchestrationResult<RecoveryReport> {
        self.inner.recover().await
    }

    /// Waits until the task is completed or failed.
    pub async fn wait_for_terminal(
        &self,
        task_id: &TaskId,
        timeout: Option<Duration>,
    ) -> OrchestrationResult<Task> {
        self.inner.wait_for_terminal(task_id, timeout).await
    }
}

impl RuntimeInner {
    fn route(inner: &Arc<Self>, task_id: &TaskId, event: StageEvent) {
        let mut workers = inner.lock_workers();
        let event = match workers.get(task_id) {
            Some(sender) => match sender.send(event) {
                Ok(()) => return,
                Err(returned) => returned.0,
            },
            None => event,
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        // The receiver is alive, so this cannot fail.
        let _ = sender.send(event);
        workers.insert(task_id.clone(), sender);
        drop(workers);

        let worker = inner.clone();
        let task_id = task_id.clone();
        inner
            .handle
            .spawn(async move { worker.drain(task_id, receiver).await });
    }

    async fn drain(self: Arc<Self>, task_id: TaskId, mut receiver: mpsc::UnboundedReceiver<StageEvent>) {
        loop {
            let next = match receiver.try_recv() {
                Ok(event) => Some(event),
                Err(_) => {
                    // Senders only send while holding the map lock.
                    let mut workers = self.lock_workers();
                    match receiver.try_recv() {
                        Ok(event) => Some(event),
                        Err(_) => {
                            workers.remove(&task_id);
                            None
                        }
                    }
                }
            };
            let Some(event) = next else {
                return;
            };
            self.handle_event(&task_id, event).await;
        }
    }

    async fn handle_event(self: &Arc<Self>, task_id: &TaskId, event: StageEvent) {
        let outcome = match event {
            StageEvent::Progress {
                stage,
                run,
                progress,
                message,
            } => {
                self.apply_progress_event(task_id, stage, Some(run), progress, message)
                    .await
            }
            StageEvent::SubTask {
                stage,
                run,
                subtask,
                update,
            } => {
                match self
                    .synchronizer
                    .sync_subtask_status(task_id, &subtask.name, &subtask.artifact_path, update)
                    .await
                {
                    Err(error) if error.kind == CoreErrorKind::ConcurrencyConflict => {
                        let failure = StageFailure::new(format!(
                            "sub-task '{}' could not be persisted: {}",
                            subtask.name, error.message
                        ));
                        self.complete_stage(task_id, stage, Some(run), Err(failure))
                            .await
                    }
                    other => other.map(|_| ()),
                }
            }
            StageEvent::Completed { stage, run, result } => {
                self.complete_stage(task_id, stage, Some(run), result).await
            }
        };

        if let Err(error) = outcome {
            tracing::error!(
                task_id = %task_id,
                stage = ?error.stage,
                kind = ?error.kind,
                message = %error.message,
                "failed to apply stage event"
            );
        }
    }

    async fn apply_progress_event(
        &self,
        task_id: &TaskId,
        stage: Stage,
        run: Option<u32>,
        stage_progress: f64,
        message: String,
    ) -> OrchestrationResult<()> {
        let guard = self.locks.task(task_id).await;
        let mut task = self.load_existing(task_id).await?;
        if is_stale(&task, stage, run) {
            log_duplicate(&task, stage, "progress");
            return Ok(());
        }
        let changed = workflow::apply_progress(
            &mut task,
            stage,
            stage_progress,
            Some(&message),
            SystemTime::now(),
        )?;
        if !changed {
            return Ok(());
        }
        self.save_task(&task).await?;
        self.publish_task(&task);
        drop(guard);
        Ok(())
    }

    async fn complete_stage(
        self: &Arc<Self>,
        task_id: &TaskId,
        stage: Stage,
        run: Option<u32>,
        result: StageResult,
    ) -> OrchestrationResult<()> {
        let task = self.load_existing(task_id).await?;
        if is_stale(&task, stage, run) {
            log_duplicate(&task, stage, "completion");
            return Ok(());
        }
        let run = task.run_of(stage);

        let result = match result {
            Ok(output) => match self.record_stage_files(&task, stage, &output).await {
                Ok(()) => Ok(output),
                Err(error) => {
                    tracing::warn!(
                        task_id = %task_id,
                        stage = %stage,
                        kind = ?error.kind,
                        message = %error.message,
                        "failed to record stage files"
                    );
                    Err(StageFailure::new(error.message))
                }
            },
            Err(failure) => Err(failure),
        };
        if let Err(failure) = &result {
            self.fail_open_subtasks(&task, stage, &failure.message).await;
        }

        let guard = self.locks.task(task_id).await;
        let task = self.load_existing(task_id).await?;
        if is_stale(&task, stage, Some(run)) {
            log_duplicate(&task, stage, "completion");
            return Ok(());
        }
        let now = SystemTime::now();
        let mut task = workflow::advance(task, stage, result, now)?;
        while !task.is_terminal()
            && task.stage.is_waiting()
            && self.config.auto_releases(task.stage)
        {
            task = workflow::release(task, now)?;
        }
        self.save_task(&task).await?;
        self.publish_task(&task);
        drop(guard);

        match task.status {
            TaskStatus::Failed => tracing::warn!(
                task_id = %task_id,
                stage = %stage,
                error = task.error.as_deref().unwrap_or_default(),
                "task failed"
            ),
            _ => tracing::info!(
                task_id = %task_id,
                from = %stage,
                to = %task.stage,
                progress = task.progress,
                "stage completed"
            ),
        }
        if task.is_terminal() {
            self.notify_terminal(task_id);
        } else if task.stage.is_executing() {
            self.spawn_dispatch(task_id.clone(), task.stage);
        }
        Ok(())
    }

    /// Tracks new artifact files and completes the current run's sub-tasks
    /// with the outputs derived from their files.
    async fn record_stage_files(
        &self,
        task: &Task,
        stage: Stage,
        output: &StageOutput,
    ) -> OrchestrationResult<()> {
        for path in &output.artifact_paths {
            self.synchronizer
                .register_artifact(&task.task_id, path, stage, &task.params)
                .await?;
        }

        let current: Vec<SubTaskRef> = task.current_subtasks(stage).cloned().collect();
        let single = current.len() == 1;
        for subtask in &current {
            let produced: Vec<String> = output
                .outputs
                .iter()
                .filter(|descriptor| match descriptor.source.as_deref() {
                    Some(source) => source == subtask.artifact_path,
                    None => single,
                })
                .map(|descriptor| descriptor.path.clone())
                .collect();
            let existing = self
                .synchronizer
                .load_subtask(&subtask.artifact_path, &subtask.name)
                .await?;
            if existing.is_some_and(|status| status.status == TaskStatus::Failed) {
                continue;
            }
            self.synchronizer
                .sync_subtask_status(
                    &task.task_id,
                    &subtask.name,
                    &subtask.artifact_path,
                    SubTaskUpdate::completed(produced, "Completed"),
                )
                .await?;
        }
        Ok(())
    }

    /// Marks unfinished sub-tasks of the current run failed. Best effort.
    async fn fail_open_subtasks(&self, task: &Task, stage: Stage, message: &str) {
        for subtask in task.current_subtasks(stage) {
            if let Err(error) = self.fail_subtask(&task.task_id, subtask, message).await {
                tracing::warn!(
                    task_id = %task.task_id,
                    subtask = %subtask.name,
                    kind = ?error.kind,
                    message = %error.message,
                    "failed to mark sub-task failed"
                );
            }
        }
    }

    async fn fail_subtask(
        &self,
        task_id: &TaskId,
        subtask: &SubTaskRef,
        message: &str,
    ) -> OrchestrationResult<()> {
        let existing = self
            .synchronizer
            .load_subtask(&subtask.artifact_path, &subtask.name)
            .await?;
        if existing.is_some_and(|status| status.status.is_terminal()) {
            return Ok(());
        }
        self.synchronizer
            .sync_subtask_status(
                task_id,
                &subtask.name,
                &subtask.artifact_path,
                SubTaskUpdate::failed(message),
            )
            .await?;
        Ok(())
    }

    fn spawn_dispatch(self: &Arc<Self>, task_id: TaskId, stage: Stage) {
        let inner = self.clone();
        self.handle.spawn(async move {
            let Err(error) = inner.dispatch(&task_id, stage).await else {
                return;
            };
            tracing::error!(
                task_id = %task_id,
                stage = %stage,
                kind = ?error.kind,
                message = %error.message,
                "stage dispatch failed"
            );
            // Nothing holds the stage now; fail it so the task reaches a terminal status.
            let failure = StageFailure::new(format!(
                "dispatch of stage '{stage}' failed: {}",
                error.message
            ));
            if let Err(error) = inner
                .complete_stage(&task_id, stage, None, Err(failure))
                .await
            {
                tracing::error!(
                    task_id = %task_id,
                    stage = %stage,
                    kind = ?error.kind,
                    message = %error.message,
                    "failed to record dispatch failure"
                );
            }
        });
    }

    async fn dispatch(self: &Arc<Self>, task_id: &TaskId, stage: Stage) -> OrchestrationResult<()> {
        let Some(input) = self.prepare_run(task_id, stage).await? else {
            return Ok(());
        };
        let executor = self.executors.get(&stage).cloned().ok_or_else(|| {
            CoreError::internal(format!("no executor is registered for stage '{stage}'"))
                .for_task(task_id)
                .at_stage(stage)
        })?;

        let policy = self.config.dispatch_retry;
        let run = input.run;
        let mut attempt = 1;
        loop {
            let lease = Arc::new(Lease::new());
            let reporter = StageReporter::new(
                task_id.clone(),
                stage,
                run,
                Arc::new(EventRouter {
                    inner: self.clone(),
                }),
                lease.clone(),
            );
            match executor.start(input.clone(), reporter) {
                Ok(handle) => {
                    if lease.arm() == LeaseState::Abandoned {
                        Self::route(
                            self,
                            task_id,
                            StageEvent::Completed {
                                stage,
                                run,
                                result: Err(StageFailure::new(ABANDONED_MESSAGE)),
                            },
                        );
                    }
                    tracing::info!(
                        task_id = %task_id,
                        stage = %stage,
                        run,
                        handle = %handle.0,
                        "stage dispatched"
                    );
                    return self.mark_running(task_id, stage, run).await;
                }
                // The executor reported a result before failing to return.
                Err(_) if lease.is_done() => return Ok(()),
                Err(error) if attempt < policy.attempts() => {
                    let delay = policy.backoff(attempt);
                    tracing::warn!(
                        task_id = %task_id,
                        stage = %stage,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        kind = ?error.kind,
                        message = %error.message,
                        "stage dispatch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => {
                    let failure = StageFailure::new(format!(
                        "dispatch of stage '{stage}' failed after {attempt} attempts: {}",
                        error.message
                    ));
                    return self
                        .complete_stage(task_id, stage, Some(run), Err(failure))
                        .await;
                }
            }
        }
    }

    /// Opens a new run of `stage`: bumps the run counter and creates one
    /// pending sub-task per segment-plan file for per-file stages.
    async fn prepare_run(
        &self,
        task_id: &TaskId,
        stage: Stage,
    ) -> OrchestrationResult<Option<StageInput>> {
        let snapshot = self.load_existing(task_id).await?;
        if snapshot.is_terminal() || snapshot.stage != stage {
            return Ok(None);
        }

        let now = SystemTime::now();
        let mut planned = Vec::new();
        if let Some(kind) = stage.subtask_kind() {
            for artifact in snapshot.artifacts_from(Stage::AiGeneration) {
                let file = self.synchronizer.load_artifact(&artifact.path).await?;
                let name = match &file {
                    Some(file) => subtask_name_at(kind, file, now),
                    None => subtask_name_at(
                        kind,
                        FileInfo {
                            system_prompt_id: Some(&snapshot.params.system_prompt_id),
                            user_prompt_id: Some(&snapshot.params.user_prompt_id),
                        },
                        now,
                    ),
                };
                planned.push((kind, artifact.path.clone(), name));
            }
        }

        let guard = self.locks.task(task_id).await;
        let mut task = self.load_existing(task_id).await?;
        if task.is_terminal() || task.stage != stage {
            return Ok(None);
        }
        let run = task.run_of(stage) + 1;
        task.runs.insert(stage, run);
        for (kind, artifact_path, name) in &planned {
            task.subtasks.push(SubTaskRef {
                name: name.clone(),
                kind: *kind,
                artifact_path: artifact_path.clone(),
                stage,
                run,
            });
        }
        task.message = stage.default_message().to_string();
        task.updated_at = now;
        self.save_task(&task).await?;
        self.publish_task(&task);
        drop(guard);

        for (_, artifact_path, name) in &planned {
            self.synchronizer
                .sync_subtask_status(task_id, name, artifact_path, SubTaskUpdate::pending("Queued"))
                .await?;
        }

        Ok(Some(StageInput {
            task_id: task.task_id.clone(),
            stage,
            run,
            subtasks: task.current_subtasks(stage).cloned().collect(),
            params: task.params,
            artifacts: task.artifacts,
            outputs: task.outputs,
            payloads: task.stage_payloads,
        }))
    }

    async fn mark_running(&self, task_id: &TaskId, stage: Stage, run: u32) -> OrchestrationResult<()> {
        let guard = self.locks.task(task_id).await;
        let mut task = self.load_existing(task_id).await?;
        if is_stale(&task, stage, Some(run)) || task.status != TaskStatus::Pending {
            return Ok(());
        }
        task.status = TaskStatus::Running;
        task.updated_at = SystemTime::now();
        self.save_task(&task).await?;
        self.publish_task(&task);
        drop(guard);
        Ok(())
    }

    async fn resume(self: &Arc<Self>, task_id: &TaskId) -> OrchestrationResult<Task> {
        let guard = self.locks.task(task_id).await;
        let task = self.load_existing(task_id).await?;
        let waited = task.stage;
        let task = workflow::release(task, SystemTime::now())?;
        self.save_task(&task).await?;
        self.publish_task(&task);
        drop(guard);

        tracing::info!(
            task_id = %task_id,
            from = %waited,
            to = %task.stage,
            "task resumed"
        );
        self.spawn_dispatch(task_id.clone(), task.stage);
        Ok(task)
    }

    async fn recover(self: &Arc<Self>) -> OrchestrationResult<RecoveryReport> {
        let unfinished = blocking(&self.tasks, "list_unfinished_tasks", |store| {
            store.list_unfinished_tasks()
        })
        .await?;

        let mut report = RecoveryReport::default();
        for task in unfinished {
            let task_id = task.task_id.clone();
            let stage = task.stage;
            if stage.is_waiting() {
                if self.config.auto_releases(stage) {
                    self.resume(&task_id).await?;
                    report.dispatched.push(task_id);
                } else {
                    report.parked.push(task_id);
                }
                continue;
            }
            if !stage.is_executing() {
                continue;
            }

            let never_started = task.status == TaskStatus::Pending && task.run_of(stage) == 0;
            if never_started {
                self.spawn_dispatch(task_id.clone(), stage);
                report.dispatched.push(task_id);
            } else if self.config.resume_interrupted {
                self.fail_open_subtasks(&task, stage, INTERRUPTED_MESSAGE)
                    .await;
                self.spawn_dispatch(task_id.clone(), stage);
                report.dispatched.push(task_id);
            } else {
                self.complete_stage(
                    &task_id,
                    stage,
                    None,
                    Err(StageFailure::new(INTERRUPTED_MESSAGE)),
                )
                .await?;
                report.failed.push(task_id);
            }
        }

        tracing::info!(
            dispatched = report.dispatched.len(),
            parked = report.parked.len(),
            failed = report.failed.len(),
            "recovered unfinished tasks"
        );
        Ok(report)
    }

    async fn wait_for_terminal(
        &self,
        task_id: &TaskId,
        timeout: Option<Duration>,
    ) -> OrchestrationResult<Task> {
        let deadline = timeout.map(|timeout| tokio::time::Instant::now() + timeout);
        loop {
            let notify = self.completion_notify(task_id);
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let task = self.load_existing(task_id).await?;
            if task.is_terminal() {
                return Ok(task);
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified.as_mut()).await.is_err() {
                        self.release_completion_notify(task_id, &notify);
                        return Err(CoreError {
                            task: Some(task_id.clone()),
                            stage: Some(task.stage),
                            kind: CoreErrorKind::Timeout,
                            message: format!(
                                "task '{task_id}' did not finish in time; it is in stage '{}'",
                                task.stage
                            ),
                        });
                    }
                }
                None => notified.await,
            }
        }
    }

    fn completion_notify(&self, task_id: &TaskId) -> Arc<Notify> {
        lock_ignoring_poison(&self.completion_notifiers)
            .entry(task_id.clone())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Drops the waiter entry once the last waiter on it gives up.
    fn release_completion_notify(&self, task_id: &TaskId, notify: &Arc<Notify>) {
        let mut notifiers = lock_ignoring_poison(&self.completion_notifiers);
        // One reference in the map, one held by this waiter.
        if Arc::strong_count(notify) == 2
            && notifiers
                .get(task_id)
                .is_some_and(|held| Arc::ptr_eq(held, notify))
        {
            notifiers.remove(task_id);
        }
    }

    fn notify_terminal(&self, task_id: &TaskId) {
        if let Some(notify) = lock_ignoring_poison(&self.completion_notifiers).remove(task_id) {
            notify.notify_waiters();
        }
    }

    async fn load_existing(&self, task_id: &TaskId) -> OrchestrationResult<Task> {
        self.synchronizer
            .load_task(task_id)
            .await?
            .ok_or_else(|| CoreError::task_not_found(task_id))
    }

    async fn save_task(&self, task: &Task) -> OrchestrationResult<()> {
        let synchronizer = &self.synchronizer;
        retry_on_conflict(&self.config.store_retry, "save_task", move || {
            synchronizer.save_task(task.clone())
        })
        .await
        .map_err(|error| error.for_task(&task.task_id))
    }

    fn publish_task(&self, task: &Task) {
        self.notifier
            .publish(&task.task_id, Snapshot::Task(Box::new(task.clone())));
    }

    fn lock_workers(&self) -> MutexGuard<'_, HashMap<TaskId, mpsc::UnboundedSender<StageEvent>>> {
        lock_ignoring_poison(&self.workers)
    }
}

fn is_stale(task: &Task, stage: Stage, run: Option<u32>) -> bool {
    task.is_terminal()
        || task.stage != stage
        || run.is_some_and(|run| run != task.run_of(stage))
}

fn log_duplicate(task: &Task, stage: Stage, event: &str) {
    tracing::debug!(
        task_id = %task.task_id,
        stage = %stage,
        current_stage = %task.stage,
        status = task.status.as_str(),
        event,
        "ignoring event for a stage the task has left"
    );
}

fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::{WorkflowRuntime, lock_ignoring_poison};
    use crate::config::RuntimeConfig;
    use crate::models::{CoreErrorKind, Stage, TaskParams};
    use crate::orchestration::{
        NoopNotifier, OrchestrationResult, StageExecutor, StageHandle, StageInput, StageReporter,
    };
    use crate::persistence::InMemoryStore;

    struct Holding {
        stage: Stage,
        reporters: Mutex<Vec<StageReporter>>,
    }

    impl StageExecutor for Holding {
        fn stage(&self) -> Stage {
            self.stage
        }

        fn start(
            &self,
            _input: StageInput,
            reporter: StageReporter,
        ) -> OrchestrationResult<StageHandle> {
            self.reporters.lock().unwrap().push(reporter);
            Ok(StageHandle(self.stage.to_string()))
        }
    }

    fn runtime() -> WorkflowRuntime {
        let store = Arc::new(InMemoryStore::new());
        let executors = Stage::EXECUTING.into_iter().map(|stage| {
            Arc::new(Holding {
                stage,
                reporters: Mutex::new(Vec::new()),
            }) as Arc<dyn StageExecutor>
        });
        WorkflowRuntime::new(
            store.clone(),
            store,
            executors,
            Arc::new(NoopNotifier),
            RuntimeConfig::default(),
        )
        .unwrap()
    }

    fn waiter_entries(runtime: &WorkflowRuntime) -> usize {
        lock_ignoring_poison(&runtime.inner.completion_notifiers).len()
    }

    #[tokio::test]
    async fn timed_out_waiters_leave_no_entry_behind() {
        let runtime = runtime();
        let task = runtime
            .create_task(TaskParams::new("https://example.org/watch/ep1", "P1", "P2"))
            .await
            .unwrap();

        let patient = {
            let runtime = runtime.clone();
            let task_id = task.task_id.clone();
            tokio::spawn(async move {
                runtime
                    .wait_for_terminal(&task_id, Some(Duration::from_millis(300)))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let error = runtime
            .wait_for_terminal(&task.task_id, Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::Timeout);
        assert_eq!(waiter_entries(&runtime), 1);

        let error = patient.await.unwrap().unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::Timeout);
        assert_eq!(waiter_entries(&runtime), 0);
    }
}

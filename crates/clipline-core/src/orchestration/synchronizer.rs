use std::sync::Arc;
use std::time::SystemTime;

use crate::models::{
    ArtifactFile, CoreError, OutputDescriptor, Stage, SubTaskKind, SubTaskStatus, SubTaskUpdate,
    Task, TaskId, TaskParams, TaskStatus,
};
use crate::naming::parse_subtask_kind;
use crate::orchestration::{
    EntityLocks, Notifier, OrchestrationResult, RetryPolicy, Snapshot, blocking,
    retry_on_conflict, workflow,
};
use crate::persistence::{ArtifactStore, TaskStore};

/// Single write path for sub-task status. Each update is a read-modify-write
/// of one artifact file under that file's lock, followed by the owning task
/// under the task lock.
#[derive(Clone)]
pub struct StatusSynchronizer {
    tasks: Arc<dyn TaskStore>,
    artifacts: Arc<dyn ArtifactStore>,
    locks: Arc<EntityLocks>,
    notifier: Arc<dyn Notifier>,
    store_retry: RetryPolicy,
}

impl StatusSynchronizer {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        artifacts: Arc<dyn ArtifactStore>,
        locks: Arc<EntityLocks>,
        notifier: Arc<dyn Notifier>,
        store_retry: RetryPolicy,
    ) -> Self {
        Self {
            tasks,
            artifacts,
            locks,
            notifier,
            store_retry,
        }
    }

    /// Creates or updates the sub-task `subtask_name` of `artifact_path`.
    ///
    /// A second update for an existing name mutates that entry in place. When
    /// the entry is completed with outputs, they are appended to the task.
    pub async fn sync_subtask_status(
        &self,
        task_id: &TaskId,
        subtask_name: &str,
        artifact_path: &str,
        update: SubTaskUpdate,
    ) -> OrchestrationResult<SubTaskStatus> {
        if artifact_path.trim().is_empty() {
            return Err(CoreError::validation("artifact path must not be empty").for_task(task_id));
        }
        let kind = parse_subtask_kind(subtask_name).ok_or_else(|| {
            CoreError::validation(format!("'{subtask_name}' is not a sub-task name"))
                .for_task(task_id)
        })?;
        if self.load_task(task_id).await?.is_none() {
            return Err(CoreError::task_not_found(task_id));
        }

        let now = SystemTime::now();
        let artifact_guard = self.locks.artifact(artifact_path).await;
        let update = &update;
        let status = retry_on_conflict(&self.store_retry, "sync_subtask_status", move || {
            self.write_entry(task_id, subtask_name, kind, artifact_path, update, now)
        })
        .await?;

        let task_guard = self.locks.task(task_id).await;
        let status_ref = &status;
        let task = retry_on_conflict(&self.store_retry, "sync_subtask_status", move || {
            self.refresh_task(task_id, artifact_path, status_ref, now)
        })
        .await?;
        if let Some(task) = task {
            self.notifier.publish(task_id, Snapshot::Task(Box::new(task)));
        }
        drop(task_guard);
        self.notifier.publish(
            task_id,
            Snapshot::SubTask {
                artifact_path: artifact_path.to_string(),
                status: status.clone(),
            },
        );
        drop(artifact_guard);

        tracing::debug!(
            task_id = %task_id,
            subtask = subtask_name,
            artifact = artifact_path,
            status = status.status.as_str(),
            progress = status.progress,
            "sub-task status synchronized"
        );
        Ok(status)
    }

    /// Removes one sub-task entry. Returns whether it existed.
    pub async fn delete_subtask(
        &self,
        artifact_path: &str,
        subtask_name: &str,
    ) -> OrchestrationResult<bool> {
        let _artifact_guard = self.locks.artifact(artifact_path).await;
        let Some(mut file) = self.load_artifact(artifact_path).await? else {
            return Err(CoreError::artifact_not_found(artifact_path));
        };
        if file.sub_tasks.remove(subtask_name).is_none() {
            return Ok(false);
        }
        file.updated_at = SystemTime::now();
        let owner = file.task_id.clone();
        self.save_artifact(file).await?;

        if let Some(task_id) = owner {
            let _task_guard = self.locks.task(&task_id).await;
            if let Some(mut task) = self.load_task(&task_id).await? {
                let before = task.subtasks.len();
                task.subtasks.retain(|subtask| {
                    !(subtask.name == subtask_name && subtask.artifact_path == artifact_path)
                });
                if task.subtasks.len() != before {
                    task.updated_at = SystemTime::now();
                    self.save_task(task.clone()).await?;
                    self.notifier
                        .publish(&task_id, Snapshot::Task(Box::new(task)));
                }
            }
        }
        tracing::info!(
            artifact = artifact_path,
            subtask = subtask_name,
            "sub-task deleted"
        );
        Ok(true)
    }

    pub async fn load_subtask(
        &self,
        artifact_path: &str,
        subtask_name: &str,
    ) -> OrchestrationResult<Option<SubTaskStatus>> {
        Ok(self
            .load_artifact(artifact_path)
            .await?
            .and_then(|file| file.sub_tasks.get(subtask_name).cloned()))
    }

    /// Starts tracking `artifact_path` for `task_id`. Segment plans carry the
    /// task's prompt configuration so sub-task names can be derived from them.
    pub(crate) async fn register_artifact(
        &self,
        task_id: &TaskId,
        artifact_path: &str,
        stage: Stage,
        params: &TaskParams,
    ) -> OrchestrationResult<ArtifactFile> {
        let _artifact_guard = self.locks.artifact(artifact_path).await;
        let now = SystemTime::now();
        let existing = self.load_artifact(artifact_path).await?;
        let mut file = existing
            .clone()
            .unwrap_or_else(|| ArtifactFile::new(artifact_path, now));

        match &file.task_id {
            Some(owner) if owner != task_id => {
                tracing::debug!(
                    task_id = %task_id,
                    owner = %owner,
                    artifact = artifact_path,
                    "artifact already tracked by another task"
                );
            }
            Some(_) => {}
            None => file.task_id = Some(task_id.clone()),
        }
        if stage == Stage::AiGeneration {
            file.system_prompt_id
                .get_or_insert_with(|| params.system_prompt_id.clone());
            file.user_prompt_id
                .get_or_insert_with(|| params.user_prompt_id.clone());
        }

        if existing.as_ref() != Some(&file) {
            file.updated_at = now;
            self.save_artifact(file.clone()).await?;
        }
        Ok(file)
    }

    async fn write_entry(
        &self,
        task_id: &TaskId,
        subtask_name: &str,
        kind: SubTaskKind,
        artifact_path: &str,
        update: &SubTaskUpdate,
        now: SystemTime,
    ) -> OrchestrationResult<SubTaskStatus> {
        let mut file = self
            .load_artifact(artifact_path)
            .await?
            .unwrap_or_else(|| ArtifactFile::new(artifact_path, now));
        if let Some(owner) = &file.task_id
            && owner != task_id
        {
            return Err(CoreError::validation(format!(
                "artifact '{artifact_path}' belongs to task '{owner}'"
            ))
            .for_task(task_id));
        }
        file.task_id = Some(task_id.clone());

        let entry = file
            .sub_tasks
            .entry(subtask_name.to_string())
            .or_insert_with(|| SubTaskStatus::new(subtask_name, kind, now));
        entry.apply(update, now);
        let status = entry.clone();
        file.updated_at = now;
        self.save_artifact(file).await?;
        Ok(status)
    }

    /// Folds a sub-task change into its task. Returns the task when it changed.
    async fn refresh_task(
        &self,
        task_id: &TaskId,
        artifact_path: &str,
        status: &SubTaskStatus,
        now: SystemTime,
    ) -> OrchestrationResult<Option<Task>> {
        let Some(mut task) = self.load_task(task_id).await? else {
            return Err(CoreError::task_not_found(task_id));
        };

        let mut changed = false;
        if status.status == TaskStatus::Completed && !status.outputs.is_empty() {
            let produced = status.outputs.iter().map(|path| OutputDescriptor {
                path: path.clone(),
                kind: status.kind.into(),
                source: Some(artifact_path.to_string()),
                subtask: Some(status.name.clone()),
            });
            changed |= task.append_outputs(produced) > 0;
        }

        if let Some(mean) = self
            .current_run_progress(&task, artifact_path, status)
            .await?
        {
            let stage = task.stage;
            changed |= workflow::apply_progress(&mut task, stage, mean, None, now)?;
        }

        if !changed {
            return Ok(None);
        }
        task.updated_at = now;
        self.save_task(task.clone()).await?;
        Ok(Some(task))
    }

    /// Mean progress of the sub-tasks of the task's current stage run, when
    /// `status` is one of them.
    async fn current_run_progress(
        &self,
        task: &Task,
        artifact_path: &str,
        status: &SubTaskStatus,
    ) -> OrchestrationResult<Option<f64>> {
        if task.is_terminal() || task.stage.subtask_kind() != Some(status.kind) {
            return Ok(None);
        }
        let current: Vec<_> = task.current_subtasks(task.stage).cloned().collect();
        let is_current = current
            .iter()
            .any(|subtask| subtask.name == status.name && subtask.artifact_path == artifact_path);
        if !is_current {
            return Ok(None);
        }

        let mut total = 0.0;
        for subtask in &current {
            if subtask.name == status.name && subtask.artifact_path == artifact_path {
                total += status.progress;
            } else if let Some(sibling) = self
                .load_artifact(&subtask.artifact_path)
                .await?
                .and_then(|file| file.sub_tasks.get(&subtask.name).cloned())
            {
                total += sibling.progress;
            }
        }
        Ok(Some(total / current.len() as f64))
    }

    pub async fn load_task(&self, task_id: &TaskId) -> OrchestrationResult<Option<Task>> {
        let task_id = task_id.clone();
        blocking(&self.tasks, "load_task", move |store| {
            store.load_task(&task_id)
        })
        .await
    }

    pub(crate) async fn save_task(&self, task: Task) -> OrchestrationResult<()> {
        blocking(&self.tasks, "save_task", move |store| store.save_task(&task)).await
    }

    pub async fn load_artifact(
        &self,
        artifact_path: &str,
    ) -> OrchestrationResult<Option<ArtifactFile>> {
        let artifact_path = artifact_path.to_string();
        blocking(&self.artifacts, "load_artifact", move |store| {
            store.load_artifact(&artifact_path)
        })
        .await
    }

    async fn save_artifact(&self, file: ArtifactFile) -> OrchestrationResult<()> {
        blocking(&self.artifacts, "save_artifact", move |store| {
            store.save_artifact(&file)
        })
        .await
    }
}

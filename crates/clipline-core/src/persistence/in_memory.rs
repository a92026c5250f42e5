use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::models::{ArtifactFile, CoreError, Task, TaskId};
use crate::persistence::{ArtifactStore, PersistenceResult, TaskStore};

/// Process-local store for tests and embeddings without a database.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
}

#[derive(Default)]
struct StoreState {
    tasks: HashMap<TaskId, Task>,
    artifacts: HashMap<String, ArtifactFile>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> PersistenceResult<MutexGuard<'_, StoreState>> {
        self.state
            .lock()
            .map_err(|_| CoreError::internal("in-memory store mutex poisoned"))
    }
}

impl TaskStore for InMemoryStore {
    fn load_task(&self, task_id: &TaskId) -> PersistenceResult<Option<Task>> {
        Ok(self.lock_state()?.tasks.get(task_id).cloned())
    }

    fn save_task(&self, task: &Task) -> PersistenceResult<()> {
        self.lock_state()?
            .tasks
            .insert(task.task_id.clone(), task.clone());
        Ok(())
    }

    fn list_tasks(&self, limit: usize) -> PersistenceResult<Vec<Task>> {
        let state = self.lock_state()?;
        let mut tasks: Vec<Task> = state.tasks.values().cloned().collect();
        tasks.sort_by(|left, right| {
            right
                .created_at
                .cmp(&left.created_at)
                .then_with(|| right.task_id.cmp(&left.task_id))
        });
        tasks.truncate(limit);
        Ok(tasks)
    }

    fn list_unfinished_tasks(&self) -> PersistenceResult<Vec<Task>> {
        let state = self.lock_state()?;
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|task| !task.is_terminal())
            .cloned()
            .collect();
        tasks.sort_by(|left, right| {
            left.created_at
                .cmp(&right.created_at)
                .then_with(|| left.task_id.cmp(&right.task_id))
        });
        Ok(tasks)
    }
}

impl ArtifactStore for InMemoryStore {
    fn load_artifact(&self, file_path: &str) -> PersistenceResult<Option<ArtifactFile>> {
        Ok(self.lock_state()?.artifacts.get(file_path).cloned())
    }

    fn save_artifact(&self, file: &ArtifactFile) -> PersistenceResult<()> {
        self.lock_state()?
            .artifacts
            .insert(file.file_path.clone(), file.clone());
        Ok(())
    }

    fn list_artifacts_for_task(&self, task_id: &TaskId) -> PersistenceResult<Vec<ArtifactFile>> {
        let state = self.lock_state()?;
        let mut files: Vec<ArtifactFile> = state
            .artifacts
            .values()
            .filter(|file| file.task_id.as_ref() == Some(task_id))
            .cloned()
            .collect();
        files.sort_by(|left, right| left.file_path.cmp(&right.file_path));
        Ok(files)
    }
}

pub mod in_memory;

pub use in_memory::InMemoryStore;

use crate::models::{ArtifactFile, CoreError, Task, TaskId};

pub type PersistenceResult<T> = Result<T, CoreError>;

pub trait MigrationStore: Send + Sync {
    fn current_version(&self) -> PersistenceResult<i64>;

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()>;
}

/// Durable task records. Callers read-modify-write under the task's lock.
pub trait TaskStore: Send + Sync {
    fn load_task(&self, task_id: &TaskId) -> PersistenceResult<Option<Task>>;

    fn save_task(&self, task: &Task) -> PersistenceResult<()>;

    /// Newest first.
    fn list_tasks(&self, limit: usize) -> PersistenceResult<Vec<Task>>;

    /// Tasks whose status is not terminal, oldest first.
    fn list_unfinished_tasks(&self) -> PersistenceResult<Vec<Task>>;
}

/// Durable artifact files keyed by path. Callers read-modify-write under the
/// file's lock.
pub trait ArtifactStore: Send + Sync {
    fn load_artifact(&self, file_path: &str) -> PersistenceResult<Option<ArtifactFile>>;

    fn save_artifact(&self, file: &ArtifactFile) -> PersistenceResult<()>;

    fn list_artifacts_for_task(&self, task_id: &TaskId) -> PersistenceResult<Vec<ArtifactFile>>;
}

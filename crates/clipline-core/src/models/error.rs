use crate::models::{Stage, TaskId};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CoreErrorKind {
    Validation,
    NotFound,
    StageExecution,
    ConcurrencyConflict,
    DuplicateEvent,
    InvalidTransition,
    Timeout,
    StorageFailure,
    Internal,
}

impl CoreErrorKind {
    /// Errors of these kinds are reported synchronously to the calling client.
    pub fn is_client_facing(self) -> bool {
        matches!(self, CoreErrorKind::Validation | CoreErrorKind::NotFound)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct CoreError {
    pub task: Option<TaskId>,
    pub stage: Option<Stage>,
    pub kind: CoreErrorKind,
    pub message: String,
}

impl CoreError {
    pub fn new(kind: CoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            task: None,
            stage: None,
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::Validation, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::Internal, message)
    }

    pub fn task_not_found(task_id: &TaskId) -> Self {
        Self {
            task: Some(task_id.clone()),
            stage: None,
            kind: CoreErrorKind::NotFound,
            message: format!("unknown task id '{task_id}'"),
        }
    }

    pub fn artifact_not_found(path: &str) -> Self {
        Self::new(
            CoreErrorKind::NotFound,
            format!("unknown artifact path '{path}'"),
        )
    }

    pub fn for_task(mut self, task_id: &TaskId) -> Self {
        self.task.get_or_insert_with(|| task_id.clone());
        self
    }

    pub fn at_stage(mut self, stage: Stage) -> Self {
        self.stage.get_or_insert(stage);
        self
    }
}

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::models::{
    ArtifactRef, OutputDescriptor, Stage, SubTaskRef, SubTaskUpdate, TaskId, TaskParams,
};
use crate::orchestration::OrchestrationResult;

/// Everything a stage executor gets to work with.
#[derive(Clone, Debug, PartialEq)]
pub struct StageInput {
    pub task_id: TaskId,
    pub stage: Stage,
    /// Dispatch number of this stage for the task, starting at 1.
    pub run: u32,
    pub params: TaskParams,
    pub artifacts: Vec<ArtifactRef>,
    pub outputs: Vec<OutputDescriptor>,
    pub payloads: BTreeMap<Stage, serde_json::Value>,
    /// Per-file sub-tasks created for this run.
    pub subtasks: Vec<SubTaskRef>,
}

impl StageInput {
    pub fn artifacts_from(&self, stage: Stage) -> impl Iterator<Item = &ArtifactRef> {
        self.artifacts
            .iter()
            .filter(move |artifact| artifact.stage == stage)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct StageOutput {
    pub outputs: Vec<OutputDescriptor>,
    /// Files to track in the artifact store, e.g. segment plans.
    pub artifact_paths: Vec<String>,
    pub payload: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StageFailure {
    pub message: String,
}

impl StageFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub type StageResult = Result<StageOutput, StageFailure>;

/// Identifier of the work an executor started, for logs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StageHandle(pub String);

/// Performs the work of one executing stage. `start` must return promptly and
/// report through the reporter, which may be moved to another thread or task.
pub trait StageExecutor: Send + Sync {
    fn stage(&self) -> Stage;

    fn start(&self, input: StageInput, reporter: StageReporter)
    -> OrchestrationResult<StageHandle>;
}

#[derive(Debug)]
pub(crate) enum StageEvent {
    Progress {
        stage: Stage,
        run: u32,
        progress: f64,
        message: String,
    },
    SubTask {
        stage: Stage,
        run: u32,
        subtask: SubTaskRef,
        update: SubTaskUpdate,
    },
    Completed {
        stage: Stage,
        run: u32,
        result: StageResult,
    },
}

pub(crate) trait StageEventSink: Send + Sync {
    fn deliver(&self, task_id: &TaskId, event: StageEvent);
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum LeaseState {
    Starting,
    Armed,
    Abandoned,
    Done,
}

/// Tracks whether a dispatched stage still owes its completion.
pub(crate) struct Lease(Mutex<LeaseState>);

impl Lease {
    pub(crate) fn new() -> Self {
        Self(Mutex::new(LeaseState::Starting))
    }

    /// Called once `start` returned successfully.
    pub(crate) fn arm(&self) -> LeaseState {
        let mut state = self.lock();
        if *state == LeaseState::Starting {
            *state = LeaseState::Armed;
        }
        *state
    }

    pub(crate) fn is_done(&self) -> bool {
        *self.lock() == LeaseState::Done
    }

    fn finish(&self) {
        *self.lock() = LeaseState::Done;
    }

    /// Returns true when the dropped reporter owed a completion.
    fn release_on_drop(&self) -> bool {
        let mut state = self.lock();
        match *state {
            LeaseState::Starting => {
                *state = LeaseState::Abandoned;
                false
            }
            LeaseState::Armed => {
                *state = LeaseState::Done;
                true
            }
            LeaseState::Abandoned | LeaseState::Done => false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LeaseState> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub(crate) const ABANDONED_MESSAGE: &str = "stage executor exited without reporting a result";

/// Progress and completion callbacks for one dispatched stage run.
///
/// Dropping the reporter without calling [`StageReporter::complete`] fails the
/// stage.
pub struct StageReporter {
    task_id: TaskId,
    stage: Stage,
    run: u32,
    sink: Arc<dyn StageEventSink>,
    lease: Arc<Lease>,
}

impl StageReporter {
    pub(crate) fn new(
        task_id: TaskId,
        stage: Stage,
        run: u32,
        sink: Arc<dyn StageEventSink>,
        lease: Arc<Lease>,
    ) -> Self {
        Self {
            task_id,
            stage,
            run,
            sink,
            lease,
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn run(&self) -> u32 {
        self.run
    }

    /// `progress` is the stage-internal percentage, 0 to 100.
    pub fn progress(&self, progress: f64, message: impl Into<String>) {
        self.sink.deliver(
            &self.task_id,
            StageEvent::Progress {
                stage: self.stage,
                run: self.run,
                progress,
                message: message.into(),
            },
        );
    }

    pub fn subtask(&self, subtask: &SubTaskRef, update: SubTaskUpdate) {
        self.sink.deliver(
            &self.task_id,
            StageEvent::SubTask {
                stage: self.stage,
                run: self.run,
                subtask: subtask.clone(),
                update,
            },
        );
    }

    pub fn complete(self, result: StageResult) {
        self.lease.finish();
        self.sink.deliver(
            &self.task_id,
            StageEvent::Completed {
                stage: self.stage,
                run: self.run,
                result,
            },
        );
    }
}

impl Drop for StageReporter {
    fn drop(&mut self) {
        if self.lease.release_on_drop() {
            self.sink.deliver(
                &self.task_id,
                StageEvent::Completed {
                    stage: self.stage,
                    run: self.run,
                    result: Err(StageFailure::new(ABANDONED_MESSAGE)),
                },
            );
        }
    }
}

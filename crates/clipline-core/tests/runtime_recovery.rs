use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use clipline_core::config::RuntimeConfig;
use clipline_core::models::{
    ArtifactFile, ArtifactRef, Stage, SubTaskKind, SubTaskRef, SubTaskStatus, SubTaskUpdate, Task,
    TaskId, TaskParams, TaskStatus,
};
use clipline_core::orchestration::{
    NoopNotifier, OrchestrationResult, StageExecutor, StageHandle, StageInput, StageReporter,
    WorkflowRuntime,
};
use clipline_core::persistence::{ArtifactStore, InMemoryStore, TaskStore};

const PLAN: &str = "plans/ep7.json";
const OLD_CLIP: &str = "clipping_P1_P2_20250101_000000";

/// Accepts work and never reports, so recovered tasks stay where dispatch
/// put them.
struct ParkingExecutor {
    stage: Stage,
    started: Mutex<Vec<StageInput>>,
    reporters: Mutex<Vec<StageReporter>>,
}

impl ParkingExecutor {
    fn new(stage: Stage) -> Arc<Self> {
        Arc::new(Self {
            stage,
            started: Mutex::new(Vec::new()),
            reporters: Mutex::new(Vec::new()),
        })
    }

    fn started(&self) -> Vec<StageInput> {
        self.started.lock().unwrap().clone()
    }
}

impl StageExecutor for ParkingExecutor {
    fn stage(&self) -> Stage {
        self.stage
    }

    fn start(&self, input: StageInput, reporter: StageReporter) -> OrchestrationResult<StageHandle> {
        self.started.lock().unwrap().push(input);
        self.reporters.lock().unwrap().push(reporter);
        Ok(StageHandle(format!("parked-{}", self.stage)))
    }
}

fn executors() -> Vec<Arc<ParkingExecutor>> {
    Stage::EXECUTING.into_iter().map(ParkingExecutor::new).collect()
}

fn runtime(
    store: &Arc<InMemoryStore>,
    executors: &[Arc<ParkingExecutor>],
    config: RuntimeConfig,
) -> WorkflowRuntime {
    WorkflowRuntime::new(
        store.clone(),
        store.clone(),
        executors
            .iter()
            .map(|executor| executor.clone() as Arc<dyn StageExecutor>),
        Arc::new(NoopNotifier),
        config,
    )
    .unwrap()
}

fn executor(executors: &[Arc<ParkingExecutor>], stage: Stage) -> &ParkingExecutor {
    executors
        .iter()
        .find(|executor| executor.stage == stage)
        .unwrap()
}

fn seeded(id: &str, stage: Stage, status: TaskStatus) -> Task {
    let mut task = Task::new(
        TaskId::from(id),
        TaskParams::new("https://example.org/watch/ep7", "P1", "P2"),
        SystemTime::now(),
    );
    task.stage = stage;
    task.status = status;
    task.progress = stage.progress_range().start;
    if status != TaskStatus::Pending && stage.is_executing() {
        task.runs.insert(stage, 1);
    }
    task
}

async fn wait_for_starts(executor: &ParkingExecutor, expected: usize) {
    for _ in 0..200 {
        if executor.started().len() >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("executor for {} was not started", executor.stage);
}

#[tokio::test]
async fn recovery_dispatches_parks_and_fails_by_state() {
    let store = Arc::new(InMemoryStore::new());
    for task in [
        seeded("pending", Stage::Downloading, TaskStatus::Pending),
        seeded("waiting", Stage::WaitingTranscription, TaskStatus::Running),
        seeded("interrupted", Stage::Transcribing, TaskStatus::Running),
        seeded("done", Stage::Completed, TaskStatus::Completed),
    ] {
        store.save_task(&task).unwrap();
    }

    let executors = executors();
    let runtime = runtime(&store, &executors, RuntimeConfig::default());
    let report = runtime.recover().await.unwrap();

    assert_eq!(report.dispatched, vec![TaskId::from("pending")]);
    assert_eq!(report.parked, vec![TaskId::from("waiting")]);
    assert_eq!(report.failed, vec![TaskId::from("interrupted")]);

    let interrupted = runtime.get_task(&TaskId::from("interrupted")).await.unwrap();
    assert_eq!(interrupted.status, TaskStatus::Failed);
    assert_eq!(interrupted.stage, Stage::Transcribing);
    assert_eq!(interrupted.error.as_deref(), Some("interrupted by restart"));

    wait_for_starts(executor(&executors, Stage::Downloading), 1).await;
    let waiting = runtime.get_task(&TaskId::from("waiting")).await.unwrap();
    assert_eq!(waiting.stage, Stage::WaitingTranscription);
    assert!(executor(&executors, Stage::Transcribing).started().is_empty());
}

#[tokio::test]
async fn automated_waits_are_released_on_recovery() {
    let store = Arc::new(InMemoryStore::new());
    store
        .save_task(&seeded("shorts", Stage::WaitingShorts, TaskStatus::Running))
        .unwrap();

    let executors = executors();
    let runtime = runtime(&store, &executors, RuntimeConfig::default());
    let report = runtime.recover().await.unwrap();

    assert_eq!(report.dispatched, vec![TaskId::from("shorts")]);
    wait_for_starts(executor(&executors, Stage::ShortsCreation), 1).await;
    let task = runtime.get_task(&TaskId::from("shorts")).await.unwrap();
    assert_eq!(task.stage, Stage::ShortsCreation);
}

#[tokio::test]
async fn interrupted_stage_is_redispatched_with_fresh_subtasks() {
    let store = Arc::new(InMemoryStore::new());
    let now = SystemTime::now();

    let mut task = seeded("clip", Stage::Clipping, TaskStatus::Running);
    task.artifacts.push(ArtifactRef {
        path: PLAN.to_string(),
        stage: Stage::AiGeneration,
    });
    task.subtasks.push(SubTaskRef {
        name: OLD_CLIP.to_string(),
        kind: SubTaskKind::Clipping,
        artifact_path: PLAN.to_string(),
        stage: Stage::Clipping,
        run: 1,
    });
    store.save_task(&task).unwrap();

    let mut plan = ArtifactFile::new(PLAN, now);
    plan.task_id = Some(task.task_id.clone());
    plan.system_prompt_id = Some("P1".to_string());
    plan.user_prompt_id = Some("P2".to_string());
    let mut entry = SubTaskStatus::new(OLD_CLIP, SubTaskKind::Clipping, now);
    entry.apply(&SubTaskUpdate::running(30.0, "cutting"), now);
    plan.sub_tasks.insert(OLD_CLIP.to_string(), entry);
    store.save_artifact(&plan).unwrap();

    let executors = executors();
    let config = RuntimeConfig {
        resume_interrupted: true,
        ..RuntimeConfig::default()
    };
    let runtime = runtime(&store, &executors, config);
    let report = runtime.recover().await.unwrap();
    assert_eq!(report.dispatched, vec![task.task_id.clone()]);

    let clipping = executor(&executors, Stage::Clipping);
    wait_for_starts(clipping, 1).await;
    let input = &clipping.started()[0];
    assert_eq!(input.run, 2);
    assert_eq!(input.subtasks.len(), 1);
    assert_ne!(input.subtasks[0].name, OLD_CLIP);
    assert_eq!(input.subtasks[0].artifact_path, PLAN);

    let plan = runtime.get_artifact(PLAN).await.unwrap();
    let old = &plan.sub_tasks[OLD_CLIP];
    assert_eq!(old.status, TaskStatus::Failed);
    assert_eq!(old.error.as_deref(), Some("interrupted by restart"));
    assert_eq!(old.progress, 30.0);
    let fresh = &plan.sub_tasks[&input.subtasks[0].name];
    assert_eq!(fresh.status, TaskStatus::Pending);

    let task = runtime.get_task(&task.task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(task.run_of(Stage::Clipping), 2);
    assert_eq!(task.current_subtasks(Stage::Clipping).count(), 1);
}

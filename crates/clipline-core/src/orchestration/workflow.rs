//! Pure transitions of a task through its stage sequence.

use std::time::SystemTime;

use crate::models::{CoreError, CoreErrorKind, Stage, Task, TaskStatus};
use crate::orchestration::{OrchestrationResult, StageResult};

/// Applies the terminal result of `stage` to `task`.
///
/// Success moves to the next stage with progress at the end of the finished
/// stage's range. Failure fails the task at `stage`, keeping the progress it
/// held when the stage was entered.
pub fn advance(
    mut task: Task,
    stage: Stage,
    result: StageResult,
    now: SystemTime,
) -> OrchestrationResult<Task> {
    ensure_current(&task, stage)?;
    if !stage.is_executing() {
        return Err(invalid_transition(
            &task,
            format!("stage '{stage}' is not run by an executor"),
        ));
    }

    match result {
        Ok(output) => {
            let next = stage.next().ok_or_else(|| {
                invalid_transition(&task, format!("stage '{stage}' has no successor"))
            })?;
            if !stage.can_transition_to(next) {
                return Err(invalid_transition(
                    &task,
                    format!("'{stage}' cannot transition to '{next}'"),
                ));
            }
            task.append_outputs(output.outputs);
            for path in &output.artifact_paths {
                task.add_artifact(path, stage);
            }
            if let Some(payload) = output.payload {
                task.stage_payloads.insert(stage, payload);
            }
            task.progress = task.progress.max(stage.progress_range().end);
            enter(&mut task, next);
        }
        Err(failure) => {
            task.status = TaskStatus::Failed;
            task.progress = task.progress.min(stage.progress_range().start);
            task.message = format!("Stage '{stage}' failed");
            task.error = Some(failure.message);
        }
    }
    task.updated_at = now;
    Ok(task)
}

/// Releases a task parked in a waiting stage.
pub fn release(mut task: Task, now: SystemTime) -> OrchestrationResult<Task> {
    if task.is_terminal() || !task.stage.is_waiting() {
        return Err(CoreError::validation(format!(
            "task is in stage '{}' and not waiting for a signal",
            task.effective_stage()
        ))
        .for_task(&task.task_id)
        .at_stage(task.stage));
    }
    let next = task.stage.next().ok_or_else(|| {
        invalid_transition(&task, format!("stage '{}' has no successor", task.stage))
    })?;
    enter(&mut task, next);
    task.updated_at = now;
    Ok(task)
}

/// Maps executor progress of `stage` into the task. Returns whether the task
/// changed. Progress never decreases.
pub fn apply_progress(
    task: &mut Task,
    stage: Stage,
    stage_progress: f64,
    message: Option<&str>,
    now: SystemTime,
) -> OrchestrationResult<bool> {
    ensure_current(task, stage)?;
    let mapped = stage.progress_range().map(stage_progress);
    let mut changed = false;
    if mapped > task.progress {
        task.progress = mapped;
        changed = true;
    }
    if let Some(message) = message.filter(|message| !message.is_empty())
        && task.message != message
    {
        task.message = message.to_string();
        changed = true;
    }
    if task.status == TaskStatus::Pending {
        task.status = TaskStatus::Running;
        changed = true;
    }
    if changed {
        task.updated_at = now;
    }
    Ok(changed)
}

fn enter(task: &mut Task, next: Stage) {
    task.stage = next;
    task.message = next.default_message().to_string();
    if next == Stage::Completed {
        task.status = TaskStatus::Completed;
        task.progress = 100.0;
    } else {
        task.status = TaskStatus::Running;
        task.progress = task.progress.max(next.progress_range().start);
    }
}

fn ensure_current(task: &Task, stage: Stage) -> OrchestrationResult<()> {
    if task.is_terminal() || task.stage != stage {
        return Err(CoreError {
            task: Some(task.task_id.clone()),
            stage: Some(stage),
            kind: CoreErrorKind::DuplicateEvent,
            message: format!(
                "event for stage '{stage}' but task is in stage '{}' with status '{}'",
                task.stage,
                task.status.as_str()
            ),
        });
    }
    Ok(())
}

fn invalid_transition(task: &Task, message: String) -> CoreError {
    CoreError {
        task: Some(task.task_id.clone()),
        stage: Some(task.stage),
        kind: CoreErrorKind::InvalidTransition,
        message,
    }
}

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::models::{CoreError, Stage, SubTaskKind};

#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl FromStr for TaskStatus {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            _ => Err(()),
        }
    }
}

/// Input configuration captured when a task is created. Never modified afterwards.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TaskParams {
    pub source_url: String,
    pub season: Option<u32>,
    pub episode: Option<u32>,
    pub translator_id: Option<u32>,
    pub quality: String,
    pub system_prompt_id: String,
    pub user_prompt_id: String,
    #[serde(default)]
    pub shorts_settings: BTreeMap<String, serde_json::Value>,
}

impl TaskParams {
    pub fn new(
        source_url: impl Into<String>,
        system_prompt_id: impl Into<String>,
        user_prompt_id: impl Into<String>,
    ) -> Self {
        Self {
            source_url: source_url.into(),
            season: None,
            episode: None,
            translator_id: None,
            quality: crate::config::DEFAULT_QUALITY.to_string(),
            system_prompt_id: system_prompt_id.into(),
            user_prompt_id: user_prompt_id.into(),
            shorts_settings: BTreeMap::new(),
        }
    }

    pub fn episode(mut self, season: u32, episode: u32) -> Self {
        self.season = Some(season);
        self.episode = Some(episode);
        self
    }

    pub fn quality(mut self, quality: impl Into<String>) -> Self {
        self.quality = quality.into();
        self
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        let url = self.source_url.trim();
        if url.is_empty() {
            return Err(CoreError::validation("source url must not be empty"));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(CoreError::validation(format!(
                "source url '{url}' must use http or https"
            )));
        }
        if self.system_prompt_id.trim().is_empty() || self.user_prompt_id.trim().is_empty() {
            return Err(CoreError::validation(
                "system_prompt_id and user_prompt_id are required",
            ));
        }
        match (self.season, self.episode) {
            (Some(0), _) | (_, Some(0)) => {
                return Err(CoreError::validation(
                    "season and episode numbers start at 1",
                ));
            }
            (Some(_), None) | (None, Some(_)) => {
                return Err(CoreError::validation(
                    "season and episode must be given together",
                ));
            }
            _ => {}
        }
        if self.quality.trim().is_empty() {
            return Err(CoreError::validation("quality must not be empty"));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    SourceVideo,
    Audio,
    Transcript,
    SegmentPlan,
    Clip,
    Compilation,
    Short,
}

impl From<SubTaskKind> for OutputKind {
    fn from(kind: SubTaskKind) -> Self {
        match kind {
            SubTaskKind::Clipping => OutputKind::Clip,
            SubTaskKind::Compilation => OutputKind::Compilation,
            SubTaskKind::ShortsCreation => OutputKind::Short,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct OutputDescriptor {
    pub path: String,
    pub kind: OutputKind,
    /// Artifact file the output was derived from.
    #[serde(default)]
    pub source: Option<String>,
    /// Sub-task that produced the output.
    #[serde(default)]
    pub subtask: Option<String>,
}

impl OutputDescriptor {
    pub fn new(path: impl Into<String>, kind: OutputKind) -> Self {
        Self {
            path: path.into(),
            kind,
            source: None,
            subtask: None,
        }
    }

    pub fn from_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Back-reference to an artifact file tracked in the artifact store.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub path: String,
    pub stage: Stage,
}

/// Back-reference to a sub-task living in an artifact file's sub-task map.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SubTaskRef {
    pub name: String,
    pub kind: SubTaskKind,
    pub artifact_path: String,
    pub stage: Stage,
    pub run: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub stage: Stage,
    pub progress: f64,
    pub message: String,
    pub error: Option<String>,
    pub params: TaskParams,
    pub outputs: Vec<OutputDescriptor>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactRef>,
    #[serde(default)]
    pub subtasks: Vec<SubTaskRef>,
    #[serde(default)]
    pub stage_payloads: BTreeMap<Stage, serde_json::Value>,
    #[serde(default)]
    pub runs: BTreeMap<Stage, u32>,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
}

impl Task {
    pub fn new(task_id: TaskId, params: TaskParams, now: SystemTime) -> Self {
        Self {
            task_id,
            status: TaskStatus::Pending,
            stage: Stage::Downloading,
            progress: 0.0,
            message: "Task created".to_string(),
            error: None,
            params,
            outputs: Vec::new(),
            artifacts: Vec::new(),
            subtasks: Vec::new(),
            stage_payloads: BTreeMap::new(),
            runs: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Stage as reported to clients: a failed task reports `failed` even though
    /// `stage` keeps the stage that failed.
    pub fn effective_stage(&self) -> Stage {
        match self.status {
            TaskStatus::Failed => Stage::Failed,
            TaskStatus::Completed => Stage::Completed,
            _ => self.stage,
        }
    }

    pub fn run_of(&self, stage: Stage) -> u32 {
        self.runs.get(&stage).copied().unwrap_or(0)
    }

    /// Sub-tasks belonging to the latest dispatch of `stage`.
    pub fn current_subtasks(&self, stage: Stage) -> impl Iterator<Item = &SubTaskRef> {
        let run = self.run_of(stage);
        self.subtasks
            .iter()
            .filter(move |subtask| subtask.stage == stage && subtask.run == run)
    }

    pub fn artifacts_from(&self, stage: Stage) -> impl Iterator<Item = &ArtifactRef> {
        self.artifacts
            .iter()
            .filter(move |artifact| artifact.stage == stage)
    }

    /// Appends outputs whose path is not yet listed. Returns how many were added.
    pub fn append_outputs(&mut self, outputs: impl IntoIterator<Item = OutputDescriptor>) -> usize {
        let mut added = 0;
        for output in outputs {
            if self.outputs.iter().any(|known| known.path == output.path) {
                continue;
            }
            self.outputs.push(output);
            added += 1;
        }
        added
    }

    pub fn add_artifact(&mut self, path: &str, stage: Stage) -> bool {
        if self.artifacts.iter().any(|known| known.path == path) {
            return false;
        }
        self.artifacts.push(ArtifactRef {
            path: path.to_string(),
            stage,
        });
        true
    }

    pub fn summary(&self) -> TaskSummary {
        let stage = self.effective_stage();
        let status = match stage {
            Stage::Completed => "completed",
            Stage::Failed => "failed",
            _ => "processing",
        };
        TaskSummary {
            task_id: self.task_id.clone(),
            status,
            stage,
            progress: (self.progress * 10.0).round() / 10.0,
            message: self.message.clone(),
            error: self.error.clone(),
            outputs: self.outputs.iter().map(|output| output.path.clone()).collect(),
        }
    }
}

/// Client-facing view of a task.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TaskSummary {
    pub task_id: TaskId,
    pub status: &'static str,
    pub stage: Stage,
    pub progress: f64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use super::{OutputDescriptor, OutputKind, Task, TaskId, TaskParams, TaskStatus};
    use crate::models::{CoreErrorKind, Stage};

    fn params() -> TaskParams {
        TaskParams::new("https://example.org/watch/1", "P1", "P2")
    }

    #[test]
    fn params_require_url_and_prompts() {
        assert!(params().validate().is_ok());

        let mut missing_url = params();
        missing_url.source_url = "  ".to_string();
        assert_eq!(
            missing_url.validate().unwrap_err().kind,
            CoreErrorKind::Validation
        );

        let mut bad_scheme = params();
        bad_scheme.source_url = "ftp://example.org/video".to_string();
        assert!(bad_scheme.validate().is_err());

        let mut missing_prompt = params();
        missing_prompt.user_prompt_id = String::new();
        assert!(missing_prompt.validate().is_err());
    }

    #[test]
    fn season_and_episode_travel_together() {
        assert!(params().episode(1, 3).validate().is_ok());

        let mut season_only = params();
        season_only.season = Some(2);
        assert!(season_only.validate().is_err());

        assert!(params().episode(0, 1).validate().is_err());
    }

    #[test]
    fn append_outputs_skips_known_paths() {
        let mut task = Task::new(TaskId::from("t-1"), params(), UNIX_EPOCH);
        let added = task.append_outputs([
            OutputDescriptor::new("a.mp4", OutputKind::Clip),
            OutputDescriptor::new("b.mp4", OutputKind::Clip),
            OutputDescriptor::new("a.mp4", OutputKind::Short),
        ]);
        assert_eq!(added, 2);
        assert_eq!(task.outputs.len(), 2);
        assert_eq!(task.outputs[0].kind, OutputKind::Clip);
    }

    #[test]
    fn summary_reports_failed_stage_and_rounds_progress() {
        let mut task = Task::new(
            TaskId::from("t-2"),
            params(),
            UNIX_EPOCH + Duration::from_secs(10),
        );
        task.stage = Stage::Clipping;
        task.progress = 57.25;
        assert_eq!(task.summary().status, "processing");
        assert_eq!(task.summary().progress, 57.3);

        task.status = TaskStatus::Failed;
        task.error = Some("disk full".to_string());
        let summary = task.summary();
        assert_eq!(summary.status, "failed");
        assert_eq!(summary.stage, Stage::Failed);
        assert_eq!(task.stage, Stage::Clipping);
    }
}

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::models::{TaskId, TaskStatus};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubTaskKind {
    Clipping,
    Compilation,
    ShortsCreation,
}

impl SubTaskKind {
    pub const ALL: [SubTaskKind; 3] = [
        SubTaskKind::Clipping,
        SubTaskKind::Compilation,
        SubTaskKind::ShortsCreation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SubTaskKind::Clipping => "clipping",
            SubTaskKind::Compilation => "compilation",
            SubTaskKind::ShortsCreation => "shorts_creation",
        }
    }
}

impl Display for SubTaskKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubTaskKind {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        SubTaskKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubTaskStatus {
    pub name: String,
    pub kind: SubTaskKind,
    pub status: TaskStatus,
    pub message: String,
    pub progress: f64,
    pub error: Option<String>,
    pub outputs: Vec<String>,
    pub updated_at: SystemTime,
}

impl SubTaskStatus {
    pub fn new(name: impl Into<String>, kind: SubTaskKind, now: SystemTime) -> Self {
        Self {
            name: name.into(),
            kind,
            status: TaskStatus::Pending,
            message: String::new(),
            progress: 0.0,
            error: None,
            outputs: Vec::new(),
            updated_at: now,
        }
    }

    pub fn apply(&mut self, update: &SubTaskUpdate, now: SystemTime) {
        self.status = update.status;
        if let Some(message) = &update.message {
            self.message.clone_from(message);
        }
        if let Some(progress) = update.progress {
            self.progress = progress.clamp(0.0, 100.0);
        }
        for output in &update.outputs {
            if !self.outputs.contains(output) {
                self.outputs.push(output.clone());
            }
        }
        if let Some(error) = &update.error {
            self.error = Some(error.clone());
            self.status = TaskStatus::Failed;
        }
        self.updated_at = now;
    }
}

/// A partial update for a sub-task. Unset fields keep their stored value and
/// outputs are merged into the existing list.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SubTaskUpdate {
    pub status: TaskStatus,
    pub message: Option<String>,
    pub progress: Option<f64>,
    pub outputs: Vec<String>,
    pub error: Option<String>,
}

impl SubTaskUpdate {
    pub fn pending(message: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Pending,
            message: Some(message.into()),
            progress: Some(0.0),
            ..Self::default()
        }
    }

    pub fn running(progress: f64, message: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Running,
            message: Some(message.into()),
            progress: Some(progress),
            ..Self::default()
        }
    }

    pub fn completed(outputs: Vec<String>, message: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Completed,
            message: Some(message.into()),
            progress: Some(100.0),
            outputs,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failed,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// A tracked media file and the downstream operations applied to it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArtifactFile {
    pub file_path: String,
    pub task_id: Option<TaskId>,
    pub system_prompt_id: Option<String>,
    pub user_prompt_id: Option<String>,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
    #[serde(default)]
    pub sub_tasks: BTreeMap<String, SubTaskStatus>,
}

impl ArtifactFile {
    pub fn new(file_path: impl Into<String>, now: SystemTime) -> Self {
        Self {
            file_path: file_path.into(),
            task_id: None,
            system_prompt_id: None,
            user_prompt_id: None,
            created_at: now,
            updated_at: now,
            sub_tasks: BTreeMap::new(),
        }
    }

    pub fn subtask(&self, name: &str) -> Option<&SubTaskStatus> {
        self.sub_tasks.get(name)
    }
}

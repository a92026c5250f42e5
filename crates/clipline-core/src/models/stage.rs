use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::models::SubTaskKind;

/// One ordered phase of the pipeline.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Downloading,
    WaitingTranscription,
    Transcribing,
    AiGeneration,
    Clipping,
    WaitingShorts,
    ShortsCreation,
    Completed,
    Failed,
}

/// Allowed successful transitions. Failure is allowed from every executing
/// stage and is handled separately.
const TRANSITIONS: &[(Stage, Stage)] = &[
    (Stage::Downloading, Stage::WaitingTranscription),
    (Stage::WaitingTranscription, Stage::Transcribing),
    (Stage::Transcribing, Stage::AiGeneration),
    (Stage::AiGeneration, Stage::Clipping),
    (Stage::Clipping, Stage::WaitingShorts),
    (Stage::WaitingShorts, Stage::ShortsCreation),
    (Stage::ShortsCreation, Stage::Completed),
];

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProgressRange {
    pub start: f64,
    pub end: f64,
}

impl ProgressRange {
    const fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    /// Maps an executor-reported percentage into this range.
    pub fn map(self, stage_progress: f64) -> f64 {
        let clamped = if stage_progress.is_finite() {
            stage_progress.clamp(0.0, 100.0)
        } else {
            0.0
        };
        self.start + (self.end - self.start) * clamped / 100.0
    }
}

impl Stage {
    pub const ALL: [Stage; 9] = [
        Stage::Downloading,
        Stage::WaitingTranscription,
        Stage::Transcribing,
        Stage::AiGeneration,
        Stage::Clipping,
        Stage::WaitingShorts,
        Stage::ShortsCreation,
        Stage::Completed,
        Stage::Failed,
    ];

    /// Stages that are run by a stage executor.
    pub const EXECUTING: [Stage; 5] = [
        Stage::Downloading,
        Stage::Transcribing,
        Stage::AiGeneration,
        Stage::Clipping,
        Stage::ShortsCreation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Downloading => "downloading",
            Stage::WaitingTranscription => "waiting_transcription",
            Stage::Transcribing => "transcribing",
            Stage::AiGeneration => "ai_generation",
            Stage::Clipping => "clipping",
            Stage::WaitingShorts => "waiting_shorts",
            Stage::ShortsCreation => "shorts_creation",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
        }
    }

    pub fn next(self) -> Option<Stage> {
        TRANSITIONS
            .iter()
            .find(|(from, _)| *from == self)
            .map(|(_, to)| *to)
    }

    pub fn can_transition_to(self, to: Stage) -> bool {
        if to == Stage::Failed {
            return self.is_executing();
        }
        TRANSITIONS.contains(&(self, to))
    }

    pub fn is_executing(self) -> bool {
        Self::EXECUTING.contains(&self)
    }

    pub fn is_waiting(self) -> bool {
        matches!(self, Stage::WaitingTranscription | Stage::WaitingShorts)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Completed | Stage::Failed)
    }

    pub fn progress_range(self) -> ProgressRange {
        match self {
            Stage::Downloading => ProgressRange::new(0.0, 20.0),
            Stage::WaitingTranscription => ProgressRange::new(20.0, 20.0),
            Stage::Transcribing => ProgressRange::new(20.0, 30.0),
            Stage::AiGeneration => ProgressRange::new(30.0, 50.0),
            Stage::Clipping => ProgressRange::new(50.0, 70.0),
            Stage::WaitingShorts => ProgressRange::new(70.0, 70.0),
            Stage::ShortsCreation => ProgressRange::new(70.0, 100.0),
            Stage::Completed => ProgressRange::new(100.0, 100.0),
            Stage::Failed => ProgressRange::new(0.0, 0.0),
        }
    }

    /// The per-file sub-task a stage creates for each segment-plan file.
    pub fn subtask_kind(self) -> Option<SubTaskKind> {
        match self {
            Stage::Clipping => Some(SubTaskKind::Clipping),
            Stage::ShortsCreation => Some(SubTaskKind::ShortsCreation),
            _ => None,
        }
    }

    pub fn default_message(self) -> &'static str {
        match self {
            Stage::Downloading => "Downloading source video",
            Stage::WaitingTranscription => {
                "Waiting for transcription. Video downloaded and audio extracted"
            }
            Stage::Transcribing => "Transcribing audio",
            Stage::AiGeneration => "Generating segment plan",
            Stage::Clipping => "Cutting clips from source video",
            Stage::WaitingShorts => "Clipping finished. Waiting to start shorts creation",
            Stage::ShortsCreation => "Creating shorts",
            Stage::Completed => "All shorts are ready",
            Stage::Failed => "Processing failed",
        }
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == value)
            .ok_or(())
    }
}

pub mod artifact;
pub mod error;
pub mod stage;
pub mod task;

pub use artifact::{ArtifactFile, SubTaskKind, SubTaskStatus, SubTaskUpdate};
pub use error::{CoreError, CoreErrorKind};
pub use stage::{ProgressRange, Stage};
pub use task::{
    ArtifactRef, OutputDescriptor, OutputKind, SubTaskRef, Task, TaskId, TaskParams, TaskStatus,
    TaskSummary,
};

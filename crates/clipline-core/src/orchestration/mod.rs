pub mod executor;
pub mod locks;
pub mod notify;
pub mod retry;
pub mod runtime;
pub mod synchronizer;
pub mod workflow;

pub use executor::{
    StageExecutor, StageFailure, StageHandle, StageInput, StageOutput, StageReporter, StageResult,
};
pub use locks::{EntityLocks, KeyedLocks};
pub use notify::{BroadcastNotifier, NoopNotifier, Notification, Notifier, Snapshot};
pub use retry::{RetryPolicy, retry_on_conflict};
pub use runtime::{RecoveryReport, WorkflowRuntime};
pub use synchronizer::StatusSynchronizer;

use std::sync::Arc;

use crate::models::CoreError;
use crate::persistence::PersistenceResult;

pub type OrchestrationResult<T> = Result<T, CoreError>;

/// Runs a synchronous store call on the blocking pool.
pub(crate) async fn blocking<S, T>(
    store: &Arc<S>,
    operation_name: &'static str,
    operation: impl FnOnce(&S) -> PersistenceResult<T> + Send + 'static,
) -> OrchestrationResult<T>
where
    S: ?Sized + Send + Sync + 'static,
    T: Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || operation(&store))
        .await
        .map_err(|join_error| {
            CoreError::internal(format!("{operation_name} join failure: {join_error}"))
        })?
}

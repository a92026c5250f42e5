use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::{SubTaskStatus, Task, TaskId};

/// Immutable view published after every mutation.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Snapshot {
    Task(Box<Task>),
    SubTask {
        artifact_path: String,
        status: SubTaskStatus,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Notification {
    pub task_id: TaskId,
    pub snapshot: Snapshot,
}

/// Push side of the transport layer. Delivery is best-effort; the durable
/// store remains the source of truth.
pub trait Notifier: Send + Sync {
    fn publish(&self, task_id: &TaskId, snapshot: Snapshot);
}

pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn publish(&self, _task_id: &TaskId, _snapshot: Snapshot) {}
}

/// Fans notifications out to any number of subscribers. Slow subscribers
/// lose the oldest notifications.
#[derive(Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<Notification>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }
}

impl Notifier for BroadcastNotifier {
    fn publish(&self, task_id: &TaskId, snapshot: Snapshot) {
        // No receivers is not an error.
        let _ = self.sender.send(Notification {
            task_id: task_id.clone(),
            snapshot,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::UNIX_EPOCH;

    use super::{BroadcastNotifier, Notifier, Snapshot};
    use crate::models::{SubTaskKind, SubTaskStatus, TaskId};

    #[tokio::test]
    async fn subscribers_receive_published_snapshots() {
        let notifier = BroadcastNotifier::new(4);
        let mut receiver = notifier.subscribe();
        let status = SubTaskStatus::new("clipping_a_b_c", SubTaskKind::Clipping, UNIX_EPOCH);
        notifier.publish(
            &TaskId::from("t-1"),
            Snapshot::SubTask {
                artifact_path: "plan.json".to_string(),
                status: status.clone(),
            },
        );

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.task_id, TaskId::from("t-1"));
        assert_eq!(
            received.snapshot,
            Snapshot::SubTask {
                artifact_path: "plan.json".to_string(),
                status,
            }
        );
    }

    #[test]
    fn publishing_without_subscribers_is_silent() {
        let notifier = BroadcastNotifier::new(1);
        notifier.publish(
            &TaskId::from("t-2"),
            Snapshot::SubTask {
                artifact_path: "x".to_string(),
                status: SubTaskStatus::new("compilation_a_b_c", SubTaskKind::Compilation, UNIX_EPOCH),
            },
        );
    }
}

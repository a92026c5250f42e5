use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::models::TaskId;

const PRUNE_THRESHOLD: usize = 1024;

/// One async mutex per key. Unrelated keys never contend.
pub struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
        self.entry(key).lock_owned().await
    }

    /// Returns `None` when the key is currently held.
    pub fn try_lock(&self, key: &K) -> Option<OwnedMutexGuard<()>> {
        self.entry(key).try_lock_owned().ok()
    }

    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .map(|locks| locks.len())
            .unwrap_or_else(|poisoned| poisoned.into_inner().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry(&self, key: &K) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if locks.len() >= PRUNE_THRESHOLD {
            // Only the map holds an unused lock.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

/// The two lock spaces of the core. A caller that needs both takes the
/// artifact lock first, then the task lock.
#[derive(Default)]
pub struct EntityLocks {
    artifacts: KeyedLocks<String>,
    tasks: KeyedLocks<TaskId>,
}

impl EntityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn artifact(&self, file_path: &str) -> OwnedMutexGuard<()> {
        self.artifacts.lock(&file_path.to_string()).await
    }

    pub async fn task(&self, task_id: &TaskId) -> OwnedMutexGuard<()> {
        self.tasks.lock(task_id).await
    }
}

//! In-memory store implementations.
//!
//! Back the matching layer for single-process deployments and tests.
//! They honor the same conditional semantics as a real store, and expose
//! a couple of hooks (lease stealing, injected outages) so ownership and
//! retry behavior can be exercised without a database.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;

use crate::queue::QueueKey;
use crate::store::{QueueLease, StoreError, TaskStore, UserDataStore, VersionedUserData};
use crate::task::AllocatedTask;

#[derive(Debug, Default)]
struct QueueState {
    range_id: i64,
    ack_level: i64,
    tasks: BTreeMap<i64, AllocatedTask>,
}

/// [`TaskStore`] held entirely in process memory.
#[derive(Default)]
pub struct InMemoryTaskStore {
    queues: Mutex<HashMap<QueueKey, QueueState>>,
    /// When non-zero, the next N calls fail with `Unavailable`.
    outages: AtomicU32,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` store calls fail transiently.
    pub fn inject_outages(&self, n: u32) {
        self.outages.store(n, Ordering::SeqCst);
    }

    /// Advance the range id out from under the current holder, as a
    /// competing process taking over the partition would.
    pub fn steal_lease(&self, queue: &QueueKey) -> i64 {
        let mut queues = self.queues.lock().unwrap();
        let state = queues.entry(queue.clone()).or_default();
        state.range_id += 1;
        state.range_id
    }

    pub fn task_count(&self, queue: &QueueKey) -> usize {
        self.queues
            .lock()
            .unwrap()
            .get(queue)
            .map(|s| s.tasks.len())
            .unwrap_or(0)
    }

    pub fn task_ids(&self, queue: &QueueKey) -> Vec<i64> {
        self.queues
            .lock()
            .unwrap()
            .get(queue)
            .map(|s| s.tasks.keys().copied().collect())
            .unwrap_or_default()
    }

    fn check_outage(&self) -> Result<(), StoreError> {
        let prior = self
            .outages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .unwrap_or(0);
        if prior > 0 {
            return Err(StoreError::Unavailable("injected outage".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn renew_lease(
        &self,
        queue: &QueueKey,
        expected_range_id: Option<i64>,
    ) -> Result<QueueLease, StoreError> {
        self.check_outage()?;
        let mut queues = self.queues.lock().unwrap();
        let state = queues.entry(queue.clone()).or_default();
        if let Some(expected) = expected_range_id {
            if state.range_id != expected {
                return Err(StoreError::ConditionFailed(format!(
                    "expected range {expected}, store has {}",
                    state.range_id
                )));
            }
        }
        state.range_id += 1;
        Ok(QueueLease {
            range_id: state.range_id,
            ack_level: state.ack_level,
        })
    }

    async fn append_tasks(
        &self,
        queue: &QueueKey,
        range_id: i64,
        tasks: &[AllocatedTask],
    ) -> Result<(), StoreError> {
        self.check_outage()?;
        let mut queues = self.queues.lock().unwrap();
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| StoreError::Internal(format!("unknown queue {queue}")))?;
        if state.range_id != range_id {
            return Err(StoreError::ConditionFailed(format!(
                "append with range {range_id}, store has {}",
                state.range_id
            )));
        }
        for task in tasks {
            debug_assert!(task.task_id > 0, "sentinel task ids must never be persisted");
            state.tasks.insert(task.task_id, task.clone());
        }
        Ok(())
    }

    async fn get_tasks(
        &self,
        queue: &QueueKey,
        after_task_id: i64,
        max_count: usize,
    ) -> Result<Vec<AllocatedTask>, StoreError> {
        self.check_outage()?;
        let queues = self.queues.lock().unwrap();
        let Some(state) = queues.get(queue) else {
            return Ok(Vec::new());
        };
        Ok(state
            .tasks
            .range(after_task_id + 1..)
            .take(max_count)
            .map(|(_, t)| t.clone())
            .collect())
    }

    async fn complete_tasks_less_equal(
        &self,
        queue: &QueueKey,
        ack_level: i64,
    ) -> Result<usize, StoreError> {
        self.check_outage()?;
        let mut queues = self.queues.lock().unwrap();
        let Some(state) = queues.get_mut(queue) else {
            return Ok(0);
        };
        let keep = state.tasks.split_off(&(ack_level + 1));
        let deleted = state.tasks.len();
        state.tasks = keep;
        state.ack_level = state.ack_level.max(ack_level);
        Ok(deleted)
    }
}

/// [`UserDataStore`] held in process memory. Counts reads so tests can
/// assert the owner loads exactly once.
#[derive(Default)]
pub struct InMemoryUserDataStore {
    entries: Mutex<HashMap<(String, String), VersionedUserData>>,
    get_calls: AtomicUsize,
}

impl InMemoryUserDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UserDataStore for InMemoryUserDataStore {
    async fn get_user_data(
        &self,
        namespace_id: &str,
        queue_name: &str,
    ) -> Result<Option<VersionedUserData>, StoreError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .get(&(namespace_id.to_string(), queue_name.to_string()))
            .cloned())
    }

    async fn update_user_data(
        &self,
        namespace_id: &str,
        queue_name: &str,
        data: Option<Bytes>,
        expected_version: i64,
    ) -> Result<i64, StoreError> {
        let mut entries = self.entries.lock().unwrap();
        let key = (namespace_id.to_string(), queue_name.to_string());
        let current = entries.get(&key).map(|d| d.version).unwrap_or(0);
        if current != expected_version {
            return Err(StoreError::ConditionFailed(format!(
                "user data version {expected_version} expected, store has {current}"
            )));
        }
        let version = current + 1;
        entries.insert(key, VersionedUserData { version, data });
        Ok(version)
    }
}

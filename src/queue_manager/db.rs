//! Lease-aware adapter over the task store.
//!
//! All durable access for one partition funnels through here so the
//! conditional range-id discipline lives in one place: renewals pass the
//! last observed range id as the expectation, and appends are
//! conditioned on it. A condition failure anywhere means another
//! process took the partition over.

use std::sync::{Arc, Mutex};

use crate::queue::QueueKey;
use crate::store::{QueueLease, StoreError, TaskStore};
use crate::task::AllocatedTask;

pub struct QueueDb {
    store: Arc<dyn TaskStore>,
    queue: QueueKey,
    range_id: Mutex<Option<i64>>,
}

impl QueueDb {
    pub fn new(store: Arc<dyn TaskStore>, queue: QueueKey) -> Self {
        Self {
            store,
            queue,
            range_id: Mutex::new(None),
        }
    }

    pub fn queue(&self) -> &QueueKey {
        &self.queue
    }

    /// Range id from the last successful renewal, 0 before the first.
    pub fn range_id(&self) -> i64 {
        self.range_id.lock().unwrap().unwrap_or(0)
    }

    /// Conditionally advance the range id. On success the adapter owns
    /// the new range until the next condition failure.
    pub async fn renew_lease(&self) -> Result<QueueLease, StoreError> {
        let expected = *self.range_id.lock().unwrap();
        let lease = self.store.renew_lease(&self.queue, expected).await?;
        *self.range_id.lock().unwrap() = Some(lease.range_id);
        Ok(lease)
    }

    pub async fn append_tasks(&self, tasks: &[AllocatedTask]) -> Result<(), StoreError> {
        debug_assert!(
            tasks.iter().all(|t| t.task_id > 0),
            "sentinel task ids must never be persisted"
        );
        self.store
            .append_tasks(&self.queue, self.range_id(), tasks)
            .await
    }

    pub async fn get_tasks(
        &self,
        after_task_id: i64,
        max_count: usize,
    ) -> Result<Vec<AllocatedTask>, StoreError> {
        self.store
            .get_tasks(&self.queue, after_task_id, max_count)
            .await
    }

    pub async fn complete_tasks_less_equal(&self, ack_level: i64) -> Result<usize, StoreError> {
        self.store
            .complete_tasks_less_equal(&self.queue, ack_level)
            .await
    }
}

//! Persistence seams: the durable task log and the user-data store.
//!
//! The matching layer never talks to a database directly; it consumes
//! these traits. The conditional range-id update in [`TaskStore`] is the
//! sole ownership mechanism: at any moment exactly one process observes
//! itself as the holder of a partition's current range id.

pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::queue::QueueKey;
use crate::task::AllocatedTask;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The conditional range-id check failed: another process holds the
    /// lease. Fatal for the observing manager, never retried.
    #[error("range id condition failed: {0}")]
    ConditionFailed(String),

    /// Transient failure (timeout, unavailable). Retried with backoff.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store failure: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Result of a successful lease renewal.
#[derive(Debug, Clone, Copy)]
pub struct QueueLease {
    pub range_id: i64,
    /// Ack level persisted for this partition, seeding the tracker on
    /// manager start.
    pub ack_level: i64,
}

/// Durable, append-ordered task log keyed by (queue, task id).
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Conditionally advance the partition's range id. When
    /// `expected_range_id` is `Some`, the stored value must match or the
    /// call fails with [`StoreError::ConditionFailed`].
    async fn renew_lease(
        &self,
        queue: &QueueKey,
        expected_range_id: Option<i64>,
    ) -> Result<QueueLease, StoreError>;

    /// Append a batch atomically, conditional on `range_id` still being
    /// current.
    async fn append_tasks(
        &self,
        queue: &QueueKey,
        range_id: i64,
        tasks: &[AllocatedTask],
    ) -> Result<(), StoreError>;

    /// Read up to `max_count` tasks with id strictly greater than
    /// `after_task_id`, in ascending id order.
    async fn get_tasks(
        &self,
        queue: &QueueKey,
        after_task_id: i64,
        max_count: usize,
    ) -> Result<Vec<AllocatedTask>, StoreError>;

    /// Best-effort range delete of tasks with id <= `ack_level`. Returns
    /// the number deleted.
    async fn complete_tasks_less_equal(
        &self,
        queue: &QueueKey,
        ack_level: i64,
    ) -> Result<usize, StoreError>;
}

/// User data blob with its monotonic version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedUserData {
    pub version: i64,
    pub data: Option<Bytes>,
}

/// Durable store for queue-scoped user data. Only the root workflow
/// partition of a queue ever writes here.
#[async_trait]
pub trait UserDataStore: Send + Sync {
    async fn get_user_data(
        &self,
        namespace_id: &str,
        queue_name: &str,
    ) -> Result<Option<VersionedUserData>, StoreError>;

    /// Conditional update: `expected_version` must match the stored
    /// version (0 when absent). Returns the new version.
    async fn update_user_data(
        &self,
        namespace_id: &str,
        queue_name: &str,
        data: Option<Bytes>,
        expected_version: i64,
    ) -> Result<i64, StoreError>;
}

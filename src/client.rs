//! RPC client seam for talking to other partitions of the same queue.
//!
//! The forwarder uses it to push tasks, queries and polls one level up
//! the partition tree; the user-data manager uses it to long-poll its
//! upstream for fresh user data.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::queue::{QueueKey, QueueType};
use crate::store::VersionedUserData;
use crate::task::TaskSource;

#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// The parent was asked to only attempt a sync match and no poller
    /// took the task. The caller should persist it locally.
    #[error("remote sync match failed")]
    RemoteSyncMatchFailed,

    #[error("peer unavailable: {0}")]
    Unavailable(String),

    /// The peer is an older build without this RPC.
    #[error("call not implemented by peer")]
    Unimplemented,

    #[error("rpc failure: {0}")]
    Internal(String),
}

impl ClientError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Unavailable(_))
    }
}

#[derive(Debug, Clone)]
pub struct ForwardedAddRequest {
    pub target: QueueKey,
    pub payload: Bytes,
    pub source: TaskSource,
    /// RPC name of the partition doing the forwarding.
    pub forwarded_from: String,
}

#[derive(Debug, Clone)]
pub struct ForwardedPollRequest {
    pub target: QueueKey,
    pub forwarded_from: String,
    /// How long the parent may hold the poll open.
    pub timeout: Duration,
}

/// A task handed back by a parent partition in answer to a forwarded
/// poll. Query tasks carry their query task id so the receiver can
/// reconstruct the query shape.
#[derive(Debug, Clone)]
pub struct ForwardedTask {
    pub payload: Bytes,
    pub query_task_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ForwardedQueryRequest {
    pub target: QueueKey,
    pub task_id: String,
    pub request: Bytes,
    pub forwarded_from: String,
}

#[derive(Debug, Clone)]
pub struct GetUserDataRequest {
    pub namespace_id: String,
    /// RPC name of the partition being asked (encodes the partition
    /// index; see [`QueueKey::rpc_name`]).
    pub queue_name: String,
    pub queue_type: QueueType,
    pub last_known_version: i64,
    /// `false` primes the cache immediately; `true` long-polls until a
    /// newer version exists or the peer's deadline elapses.
    pub wait_new_data: bool,
}

#[derive(Debug, Clone)]
pub struct GetUserDataResponse {
    /// `None` when the caller is already current (or no user data
    /// exists yet).
    pub user_data: Option<VersionedUserData>,
}

/// Client for the matching service itself, resolved per target partition.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Add a forwarded task to the target partition. `Ok(())` means the
    /// parent either sync-matched or persisted it.
    async fn add_task(&self, req: ForwardedAddRequest) -> Result<(), ClientError>;

    /// Long-poll the target partition for a task. `Ok(None)` is an empty
    /// poll (deadline elapsed upstream).
    async fn poll_task(
        &self,
        req: ForwardedPollRequest,
    ) -> Result<Option<ForwardedTask>, ClientError>;

    /// Offer a query to the target partition and wait for the response.
    async fn query_task(&self, req: ForwardedQueryRequest) -> Result<Bytes, ClientError>;

    async fn get_user_data(
        &self,
        req: GetUserDataRequest,
    ) -> Result<GetUserDataResponse, ClientError>;
}

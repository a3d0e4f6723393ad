//! Upstream forwarding through the partition tree.
//!
//! Each non-root partition may push tasks, queries, and polls one level
//! up toward the root so producers and pollers that landed on different
//! partitions can still meet. Admission is bounded by two small token
//! pools; task forwards are additionally rate capped so a hot child
//! cannot monopolize its parent.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::client::{
    ClientError, ForwardedAddRequest, ForwardedPollRequest, ForwardedQueryRequest, QueueClient,
};
use crate::limiter::DispatchLimiter;
use crate::queue::QueueKey;
use crate::settings::ForwarderSettings;
use crate::task::{InternalTask, TaskSource, TaskVariant};

#[derive(Debug, Clone, Error)]
pub enum ForwardError {
    /// All admission tokens are in use. Callers fall back immediately.
    #[error("forwarder has no capacity")]
    NoCapacity,

    #[error(transparent)]
    Remote(#[from] ClientError),
}

pub struct Forwarder {
    client: Arc<dyn QueueClient>,
    /// This partition, named as the `forwarded_from` of every request.
    queue: QueueKey,
    parent: QueueKey,
    task_tokens: Semaphore,
    poll_tokens: Semaphore,
    limiter: DispatchLimiter,
}

impl Forwarder {
    /// Build a forwarder for `queue`, or `None` when forwarding is not
    /// allowed: the root has no parent, sticky queues never forward, and
    /// a zero fan-in degree disables the tree.
    pub fn new(
        settings: &ForwarderSettings,
        queue: QueueKey,
        client: Arc<dyn QueueClient>,
    ) -> Option<Self> {
        let parent = queue.parent(settings.max_children_per_node)?;
        Some(Self {
            client,
            queue,
            parent,
            task_tokens: Semaphore::new(settings.max_outstanding_tasks),
            poll_tokens: Semaphore::new(settings.max_outstanding_polls),
            limiter: DispatchLimiter::new(settings.max_rate_per_second),
        })
    }

    pub fn parent(&self) -> &QueueKey {
        &self.parent
    }

    /// Push a task to the parent for sync match. `Ok(())` means the
    /// parent either matched it or persisted it.
    pub async fn forward_task(&self, task: &InternalTask) -> Result<(), ForwardError> {
        let _permit = self
            .task_tokens
            .try_acquire()
            .map_err(|_| ForwardError::NoCapacity)?;
        self.limiter.until_ready().await;
        self.client
            .add_task(ForwardedAddRequest {
                target: self.parent.clone(),
                payload: task.payload(),
                source: task.source,
                forwarded_from: self.queue.rpc_name(),
            })
            .await?;
        Ok(())
    }

    /// Push a query to the parent and wait for its response.
    pub async fn forward_query(&self, task: &InternalTask) -> Result<Bytes, ForwardError> {
        let TaskVariant::Query { task_id, request } = &task.variant else {
            return Err(ForwardError::Remote(ClientError::Internal(
                "forward_query on a non-query task".into(),
            )));
        };
        let _permit = self
            .task_tokens
            .try_acquire()
            .map_err(|_| ForwardError::NoCapacity)?;
        let response = self
            .client
            .query_task(ForwardedQueryRequest {
                target: self.parent.clone(),
                task_id: task_id.clone(),
                request: request.clone(),
                forwarded_from: self.queue.rpc_name(),
            })
            .await?;
        Ok(response)
    }

    /// Long-poll the parent for a task on behalf of a local poller.
    /// Waits for an admission token; the enclosing race provides
    /// cancellation by dropping this future. `Ok(None)` is an empty poll.
    pub async fn forward_poll(&self, timeout: Duration) -> Result<Option<InternalTask>, ForwardError> {
        let _permit = self
            .poll_tokens
            .acquire()
            .await
            .expect("poll token semaphore is never closed");
        let polled = self
            .client
            .poll_task(ForwardedPollRequest {
                target: self.parent.clone(),
                forwarded_from: self.queue.rpc_name(),
                timeout,
            })
            .await?;
        Ok(polled.map(|task| match task.query_task_id {
            Some(id) => InternalTask::query(id, task.payload, None),
            None => InternalTask::sync_match(task.payload, TaskSource::History, None),
        }))
    }
}

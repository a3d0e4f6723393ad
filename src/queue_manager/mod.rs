//! Per-partition queue manager.
//!
//! One manager instance owns all in-memory state for a single physical
//! partition: the lease-backed id allocator, the writer and reader, the
//! matcher, the user-data view, and the poller bookkeeping. Submodules:
//!
//! - `db`: lease/range adapter over the task store
//! - `ack`: in-flight task tracking and the ack level
//! - `gc`: ranged deletion of acknowledged tasks
//! - `writer`: serialized durable appends and id blocks
//! - `reader`: backlog pump, redelivery, completion handling
//! - `poller_history`: recent pollers for Describe

pub mod ack;
pub mod db;
pub mod gc;
pub mod poller_history;
pub mod reader;
pub mod writer;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::client::QueueClient;
use crate::error::{MatchingError, Result};
use crate::forwarder::Forwarder;
use crate::matcher::TaskMatcher;
use crate::namespaces::NamespaceRegistry;
use crate::queue::QueueKey;
use crate::retry::retry;
use crate::settings::MatchingSettings;
use crate::store::{StoreError, TaskStore, UserDataStore};
use crate::task::{InternalTask, TaskSource};
use crate::user_data::UserDataManager;

use self::ack::AckTracker;
use self::db::QueueDb;
use self::gc::TaskGc;
use self::poller_history::{PollerHistory, PollerInfo};
use self::reader::TaskReader;
use self::writer::{block_for_range, TaskIdBlock, TaskWriter};

/// Shutdown plumbing shared by the manager and its background loops.
/// The first `request_stop` wins: it cancels the token every loop and
/// wait selects on, and fires the unload callback (registry removal)
/// exactly once.
#[derive(Clone)]
pub struct Lifecycle {
    cancel: CancellationToken,
    stopped: Arc<AtomicBool>,
    unload: Arc<dyn Fn() + Send + Sync>,
}

impl Lifecycle {
    pub fn new(unload: Arc<dyn Fn() + Send + Sync>) -> Self {
        Self {
            cancel: CancellationToken::new(),
            stopped: Arc::new(AtomicBool::new(false)),
            unload,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Returns true if this call performed the stop.
    pub fn request_stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.cancel.cancel();
        (self.unload)();
        true
    }
}

#[derive(Debug, Clone)]
pub struct AddTaskParams {
    pub payload: Bytes,
    pub source: TaskSource,
    /// Set when a child partition forwarded this task: sync match only,
    /// the child persists on miss.
    pub forwarded_from: Option<String>,
    pub deadline: Option<Instant>,
}

#[derive(Debug, Clone, Default)]
pub struct PollOptions {
    /// Frontend-assigned id usable with [`QueueManager::cancel_poller`].
    pub poller_id: Option<String>,
    pub identity: Option<String>,
    /// Client-advertised dispatch rate for the whole queue.
    pub max_tasks_per_second: Option<f64>,
    pub deadline: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct PolledTask {
    pub task: InternalTask,
    pub namespace: String,
    pub backlog_count_hint: i64,
}

#[derive(Debug, Clone)]
pub struct QueueStatus {
    pub read_level: i64,
    pub ack_level: i64,
    pub backlog_count_hint: i64,
    pub rate_per_second: f64,
    pub task_id_block: TaskIdBlock,
}

#[derive(Debug, Clone)]
pub struct DescribeResponse {
    pub pollers: Vec<PollerInfo>,
    pub status: Option<QueueStatus>,
}

pub struct QueueManager {
    queue: QueueKey,
    settings: Arc<MatchingSettings>,
    db: Arc<QueueDb>,
    ack: Arc<AckTracker>,
    gc: Arc<TaskGc>,
    matcher: Arc<TaskMatcher>,
    user_data: Arc<UserDataManager>,
    namespaces: Arc<dyn NamespaceRegistry>,
    poller_history: PollerHistory,
    outstanding_polls: Mutex<HashMap<String, CancellationToken>>,
    lifecycle: Lifecycle,
    writer: OnceLock<Arc<TaskWriter>>,
    reader: OnceLock<TaskReader>,
}

impl QueueManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: QueueKey,
        settings: Arc<MatchingSettings>,
        task_store: Arc<dyn TaskStore>,
        user_data_store: Arc<dyn UserDataStore>,
        client: Arc<dyn QueueClient>,
        namespaces: Arc<dyn NamespaceRegistry>,
        unload: Arc<dyn Fn() + Send + Sync>,
    ) -> Arc<Self> {
        let lifecycle = Lifecycle::new(unload);
        let db = Arc::new(QueueDb::new(task_store, queue.clone()));
        let ack = Arc::new(AckTracker::new());
        let gc = Arc::new(TaskGc::new(Arc::clone(&db), &settings));
        let forwarder = Forwarder::new(&settings.forwarder, queue.clone(), Arc::clone(&client));
        let matcher = Arc::new(TaskMatcher::new(
            settings.default_task_dispatch_rps,
            forwarder,
            settings.forwarder.forward_error_backoff(),
        ));
        let user_data = UserDataManager::new(
            queue.clone(),
            Arc::clone(&settings),
            user_data_store,
            client,
            lifecycle.token().child_token(),
        );
        let poller_history = PollerHistory::new(settings.poller_history.clone());

        Arc::new(Self {
            queue,
            settings,
            db,
            ack,
            gc,
            matcher,
            user_data,
            namespaces,
            poller_history,
            outstanding_polls: Mutex::new(HashMap::new()),
            lifecycle,
            writer: OnceLock::new(),
            reader: OnceLock::new(),
        })
    }

    pub fn queue(&self) -> &QueueKey {
        &self.queue
    }

    pub fn user_data(&self) -> &Arc<UserDataManager> {
        &self.user_data
    }

    pub fn is_stopped(&self) -> bool {
        self.lifecycle.is_stopped()
    }

    /// Grab the range lease, seed the ack level, and start the
    /// background loops. A lease that cannot be acquired is fatal.
    pub async fn start(&self) -> Result<()> {
        let lease = retry(
            &self.settings.persistence_retry,
            self.lifecycle.token(),
            |err: &StoreError| err.is_transient(),
            || self.db.renew_lease(),
        )
        .await
        .map_err(|err| {
            error!(queue = %self.queue, error = %err, "initial lease acquisition failed");
            self.lifecycle.request_stop();
            MatchingError::from(err)
        })?;

        self.ack.set_ack_level(lease.ack_level);
        let block = block_for_range(lease.range_id, self.settings.range_size);

        let writer = TaskWriter::start(
            Arc::clone(&self.db),
            Arc::clone(&self.ack),
            Arc::clone(&self.settings),
            self.lifecycle.clone(),
            block,
        );
        let reader = TaskReader::start(
            Arc::clone(&self.db),
            Arc::clone(&self.ack),
            Arc::clone(&self.gc),
            Arc::clone(&writer),
            Arc::clone(&self.matcher),
            Arc::clone(&self.settings),
            self.lifecycle.clone(),
        );
        let _ = self.writer.set(writer);
        let _ = self.reader.set(reader);

        self.user_data.start();
        info!(queue = %self.queue, range_id = lease.range_id, "queue manager started");
        Ok(())
    }

    /// Idempotent shutdown: cancels every loop and in-flight wait and
    /// removes this manager from the engine registry.
    pub fn stop(&self) {
        if !self.lifecycle.request_stop() {
            return;
        }
        self.user_data.stop();
        info!(queue = %self.queue, "queue manager stopped");
    }

    /// Add a task: try a synchronous handoff first, spill to the store
    /// on miss. Returns whether the task was sync-matched.
    pub async fn add_task(&self, params: AddTaskParams) -> Result<bool> {
        if self.lifecycle.is_stopped() {
            return Err(MatchingError::QueueClosed);
        }
        let namespace = self.namespaces.get(&self.queue.namespace_id)?;

        // Standby namespaces do not dispatch; spill directly.
        if !namespace.active {
            self.writer()?.append(params.payload, 0).await?;
            self.reader()?.signal();
            return Ok(false);
        }

        if self.try_sync_match(&params).await? {
            return Ok(true);
        }

        if params.forwarded_from.is_some() {
            // A child partition forwarded this for sync match only; it
            // keeps the durable copy on miss.
            return Err(MatchingError::RemoteSyncMatchFailed);
        }

        self.writer()?.append(params.payload, 0).await?;
        self.reader()?.signal();
        Ok(false)
    }

    async fn try_sync_match(&self, params: &AddTaskParams) -> Result<bool> {
        let deadline = child_deadline(
            params.deadline,
            self.settings.max_sync_match_wait(),
            Duration::from_secs(1),
        );
        let task = InternalTask::sync_match(
            params.payload.clone(),
            params.source,
            params.forwarded_from.clone(),
        );
        self.matcher
            .offer(self.lifecycle.token(), Some(deadline), task)
            .await
    }

    /// Long-poll for a task. `Ok(None)` is the empty task: deadline hit
    /// (shortened by the return budget) or the poll was cancelled.
    pub async fn get_task(&self, options: PollOptions) -> Result<Option<PolledTask>> {
        if self.lifecycle.is_stopped() {
            return Err(MatchingError::QueueClosed);
        }
        let deadline = child_deadline(
            options.deadline,
            self.settings.long_poll_expiration(),
            self.settings.return_empty_task_time_budget(),
        );

        let poll_cancel = self.lifecycle.token().child_token();
        if let Some(poller_id) = &options.poller_id {
            self.outstanding_polls
                .lock()
                .unwrap()
                .insert(poller_id.clone(), poll_cancel.clone());
        }

        let result = self.poll_inner(&options, deadline, &poll_cancel).await;

        if let Some(poller_id) = &options.poller_id {
            self.outstanding_polls.lock().unwrap().remove(poller_id);
        }
        result
    }

    async fn poll_inner(
        &self,
        options: &PollOptions,
        deadline: Instant,
        poll_cancel: &CancellationToken,
    ) -> Result<Option<PolledTask>> {
        if let Some(identity) = &options.identity {
            self.poller_history
                .update(identity, options.max_tasks_per_second);
        }
        let namespace = self.namespaces.get(&self.queue.namespace_id)?;

        // The queue-wide dispatch rate comes from pollers; last writer
        // wins when they disagree.
        self.matcher.update_rate_limit(options.max_tasks_per_second);

        let polled = if namespace.active {
            self.matcher.poll(poll_cancel, Some(deadline)).await
        } else {
            self.matcher.poll_for_query(poll_cancel, Some(deadline)).await
        };

        Ok(polled.map(|task| PolledTask {
            task,
            namespace: namespace.name,
            backlog_count_hint: self.ack.backlog_count_hint(),
        }))
    }

    /// Redeliver a backlog task. No durable fallback: blocks until a
    /// poller or the parent takes it, or `cancel` fires.
    pub async fn dispatch_task(
        &self,
        cancel: &CancellationToken,
        task: InternalTask,
    ) -> Result<()> {
        self.matcher.must_offer(cancel, task).await
    }

    /// Dispatch a query. `Ok(None)` when a local poller took it (the
    /// response flows out-of-band), `Ok(Some(response))` when a parent
    /// partition answered.
    pub async fn dispatch_query_task(
        &self,
        task_id: impl Into<String>,
        request: Bytes,
        forwarded_from: Option<String>,
        deadline: Option<Instant>,
    ) -> Result<Option<Bytes>> {
        if self.lifecycle.is_stopped() {
            return Err(MatchingError::QueueClosed);
        }
        let deadline = child_deadline(
            deadline,
            self.settings.long_poll_expiration(),
            Duration::ZERO,
        );
        let task = InternalTask::query(task_id, request, forwarded_from);
        self.matcher
            .offer_query(self.lifecycle.token(), Some(deadline), task)
            .await
    }

    /// Cancel an in-flight poll by its frontend-assigned id. Used when
    /// the frontend detects the client connection closed, so tasks are
    /// not dispatched to zombie pollers.
    pub fn cancel_poller(&self, poller_id: &str) {
        let token = self
            .outstanding_polls
            .lock()
            .unwrap()
            .get(poller_id)
            .cloned();
        if let Some(token) = token {
            token.cancel();
        }
    }

    pub fn has_outstanding_poll(&self, poller_id: &str) -> bool {
        self.outstanding_polls
            .lock()
            .unwrap()
            .contains_key(poller_id)
    }

    /// Pollers seen in the last few minutes.
    pub fn get_all_poller_info(&self) -> Vec<PollerInfo> {
        self.poller_history.pollers()
    }

    pub fn describe(&self, include_status: bool) -> DescribeResponse {
        let status = include_status.then(|| QueueStatus {
            read_level: self.ack.read_level(),
            ack_level: self.ack.ack_level(),
            backlog_count_hint: self.ack.backlog_count_hint(),
            rate_per_second: self.matcher.rate(),
            task_id_block: block_for_range(self.db.range_id(), self.settings.range_size),
        });
        DescribeResponse {
            pollers: self.get_all_poller_info(),
            status,
        }
    }

    fn writer(&self) -> Result<&Arc<TaskWriter>> {
        self.writer
            .get()
            .ok_or_else(|| MatchingError::Internal("queue manager not started".into()))
    }

    fn reader(&self) -> Result<&TaskReader> {
        self.reader
            .get()
            .ok_or_else(|| MatchingError::Internal("queue manager not started".into()))
    }
}

/// Deadline for a child operation: `timeout` from now, but never closer
/// to the parent deadline than `tailroom`, so the parent keeps enough
/// time to return a graceful answer instead of a timeout.
fn child_deadline(
    parent_deadline: Option<Instant>,
    timeout: Duration,
    tailroom: Duration,
) -> Instant {
    let now = Instant::now();
    let mut timeout = timeout;
    if let Some(deadline) = parent_deadline {
        let remaining = deadline.saturating_duration_since(now).saturating_sub(tailroom);
        if remaining < timeout {
            timeout = remaining;
        }
    }
    now + timeout
}

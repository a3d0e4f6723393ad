//! Serialized durable appends.
//!
//! One actor task owns the current task-id block and performs every
//! store append for the partition, so ids are strictly monotonic and the
//! conditional range check races with nobody local. Producers submit
//! through a channel and wait on a reply; pending appends are coalesced
//! into batches. Exhausting the block renews the lease for the next one.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::error::MatchingError;
use crate::queue_manager::ack::AckTracker;
use crate::queue_manager::db::QueueDb;
use crate::queue_manager::Lifecycle;
use crate::retry::retry;
use crate::settings::MatchingSettings;
use crate::store::StoreError;
use crate::task::{now_epoch_ms, AllocatedTask};

/// Appends that may queue before producers start blocking.
const MAX_OUTSTANDING_APPENDS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskIdBlock {
    pub start: i64,
    pub end: i64,
}

/// The id block granted by holding `range_id`.
pub fn block_for_range(range_id: i64, range_size: i64) -> TaskIdBlock {
    TaskIdBlock {
        start: (range_id - 1) * range_size + 1,
        end: range_id * range_size,
    }
}

struct AppendRequest {
    payload: Bytes,
    rewrites: u32,
    reply: oneshot::Sender<Result<AllocatedTask, MatchingError>>,
}

pub struct TaskWriter {
    tx: mpsc::Sender<AppendRequest>,
}

impl TaskWriter {
    pub fn start(
        db: Arc<QueueDb>,
        ack: Arc<AckTracker>,
        settings: Arc<MatchingSettings>,
        lifecycle: Lifecycle,
        initial_block: TaskIdBlock,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(MAX_OUTSTANDING_APPENDS);
        let state = WriterLoop {
            db,
            ack,
            settings,
            lifecycle,
            next_id: initial_block.start,
            block: initial_block,
        };
        tokio::spawn(state.run(rx));
        Arc::new(Self { tx })
    }

    /// Durably append one task and return it with its allocated id.
    pub async fn append(
        &self,
        payload: Bytes,
        rewrites: u32,
    ) -> Result<AllocatedTask, MatchingError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(AppendRequest {
                payload,
                rewrites,
                reply,
            })
            .await
            .map_err(|_| MatchingError::QueueClosed)?;
        response.await.map_err(|_| MatchingError::QueueClosed)?
    }
}

struct WriterLoop {
    db: Arc<QueueDb>,
    ack: Arc<AckTracker>,
    settings: Arc<MatchingSettings>,
    lifecycle: Lifecycle,
    block: TaskIdBlock,
    next_id: i64,
}

impl WriterLoop {
    async fn run(mut self, mut rx: mpsc::Receiver<AppendRequest>) {
        loop {
            let first = tokio::select! {
                req = rx.recv() => match req {
                    Some(req) => req,
                    None => break,
                },
                _ = self.lifecycle.token().cancelled() => break,
            };

            let mut batch = vec![first];
            while batch.len() < self.settings.max_append_batch_size {
                match rx.try_recv() {
                    Ok(req) => batch.push(req),
                    Err(_) => break,
                }
            }
            self.write_batch(batch).await;
        }
        debug!(queue = %self.db.queue(), "task writer stopped");
    }

    async fn write_batch(&mut self, batch: Vec<AppendRequest>) {
        let now_ms = now_epoch_ms();
        let mut tasks = Vec::with_capacity(batch.len());
        let mut alloc_error: Option<MatchingError> = None;

        for req in &batch {
            if self.next_id > self.block.end {
                match self.alloc_task_id_block().await {
                    Ok(block) => {
                        self.block = block;
                        self.next_id = block.start;
                    }
                    Err(err) => {
                        alloc_error = Some(err);
                        break;
                    }
                }
            }
            tasks.push(AllocatedTask {
                task_id: self.next_id,
                payload: req.payload.clone(),
                created_at_ms: now_ms,
                rewrites: req.rewrites,
            });
            self.next_id += 1;
        }

        let result = match alloc_error {
            Some(err) => Err(err),
            None => self.append_with_retry(&tasks).await,
        };

        match result {
            Ok(()) => {
                // The store write succeeded; only now may the durable
                // high-water mark move.
                if let Some(last) = tasks.last() {
                    self.ack.note_appended(last.task_id);
                }
                for (req, task) in batch.into_iter().zip(tasks) {
                    let _ = req.reply.send(Ok(task));
                }
            }
            Err(err) => {
                for req in batch {
                    let _ = req.reply.send(Err(err.clone()));
                }
            }
        }
    }

    async fn append_with_retry(&self, tasks: &[AllocatedTask]) -> Result<(), MatchingError> {
        let result = retry(
            &self.settings.persistence_retry,
            self.lifecycle.token(),
            |err: &StoreError| err.is_transient(),
            || self.db.append_tasks(tasks),
        )
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(err @ StoreError::ConditionFailed(_)) => {
                error!(
                    queue = %self.db.queue(),
                    error = %err,
                    "append hit a stale range id, another host owns this partition"
                );
                self.lifecycle.request_stop();
                Err(err.into())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Exchange the exhausted block for the next one by renewing the
    /// lease. Any renewal failure unloads the partition: losing it is
    /// fatal, and a store that cannot answer is indistinguishable.
    async fn alloc_task_id_block(&self) -> Result<TaskIdBlock, MatchingError> {
        let current = block_for_range(self.db.range_id(), self.settings.range_size);
        if current.end != self.block.end {
            return Err(MatchingError::Internal(format!(
                "alloc_task_id_block: block end {} does not match current range block {:?}",
                self.block.end, current
            )));
        }

        let result = retry(
            &self.settings.persistence_retry,
            self.lifecycle.token(),
            |err: &StoreError| err.is_transient(),
            || self.db.renew_lease(),
        )
        .await;

        match result {
            Ok(lease) => Ok(block_for_range(lease.range_id, self.settings.range_size)),
            Err(err) => {
                error!(queue = %self.db.queue(), error = %err, "lease renewal failed, unloading");
                self.lifecycle.request_stop();
                Err(err.into())
            }
        }
    }
}

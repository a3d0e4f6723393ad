//! Task values exchanged between producers, the backlog, and pollers.
//!
//! Tasks flowing through the matcher come in three shapes: backlog tasks
//! read back from the persistent store (these carry a completion
//! capability routed to the reader), sync-match tasks synthesized by
//! `AddTask` before any id is allocated, and query tasks whose response
//! travels back through the forwarding path.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::MatchingError;

/// Placeholder task id carried by sync-match tasks. Sync-matched tasks
/// are handed to a poller without touching durable storage, so no real
/// id is ever allocated for them; this value must never be persisted.
pub const SYNC_MATCH_TASK_ID: i64 = -137;

pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}

/// Where a task entered this partition from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSource {
    /// Freshly produced by the history service.
    History,
    /// Read back from the durable backlog.
    DbBacklog,
}

/// A task with an allocated (or sentinel) id and its opaque payload.
#[derive(Debug, Clone)]
pub struct AllocatedTask {
    pub task_id: i64,
    pub payload: Bytes,
    pub created_at_ms: i64,
    /// Number of times this task has been re-appended after a dispatch
    /// failure. Bounded by `max_dispatch_rewrites`.
    pub rewrites: u32,
}

/// Outcome of dispatching a backlog task, reported by the consumer.
#[derive(Debug)]
pub struct TaskCompletion {
    pub task: AllocatedTask,
    pub error: Option<MatchingError>,
}

pub type CompletionSender = mpsc::UnboundedSender<TaskCompletion>;

#[derive(Debug, Clone)]
pub enum TaskVariant {
    /// Durable task pumped out of the store by the reader.
    Backlog {
        allocated: AllocatedTask,
        completion: CompletionSender,
    },
    /// Producer-side task offered for synchronous handoff. Never
    /// persisted; `allocated.task_id` is [`SYNC_MATCH_TASK_ID`].
    SyncMatch { allocated: AllocatedTask },
    /// Query round-trip. Locally matched queries answer out-of-band
    /// through the frontend; forwarded queries answer through the RPC
    /// return value.
    Query { task_id: String, request: Bytes },
}

#[derive(Debug, Clone)]
pub struct InternalTask {
    pub source: TaskSource,
    /// RPC name of the child partition this task was forwarded from, if
    /// any. Forwarded tasks are only eligible for sync match here; the
    /// child persists them on miss.
    pub forwarded_from: Option<String>,
    pub variant: TaskVariant,
}

impl InternalTask {
    pub fn backlog(allocated: AllocatedTask, completion: CompletionSender) -> Self {
        Self {
            source: TaskSource::DbBacklog,
            forwarded_from: None,
            variant: TaskVariant::Backlog {
                allocated,
                completion,
            },
        }
    }

    pub fn sync_match(payload: Bytes, source: TaskSource, forwarded_from: Option<String>) -> Self {
        Self {
            source,
            forwarded_from,
            variant: TaskVariant::SyncMatch {
                allocated: AllocatedTask {
                    task_id: SYNC_MATCH_TASK_ID,
                    payload,
                    created_at_ms: now_epoch_ms(),
                    rewrites: 0,
                },
            },
        }
    }

    pub fn query(
        task_id: impl Into<String>,
        request: Bytes,
        forwarded_from: Option<String>,
    ) -> Self {
        Self {
            source: TaskSource::History,
            forwarded_from,
            variant: TaskVariant::Query {
                task_id: task_id.into(),
                request,
            },
        }
    }

    pub fn is_forwarded(&self) -> bool {
        self.forwarded_from.is_some()
    }

    pub fn is_query(&self) -> bool {
        matches!(self.variant, TaskVariant::Query { .. })
    }

    pub fn allocated(&self) -> Option<&AllocatedTask> {
        match &self.variant {
            TaskVariant::Backlog { allocated, .. } | TaskVariant::SyncMatch { allocated } => {
                Some(allocated)
            }
            TaskVariant::Query { .. } => None,
        }
    }

    /// Opaque payload bytes, for forwarding upstream.
    pub fn payload(&self) -> Bytes {
        match &self.variant {
            TaskVariant::Backlog { allocated, .. } | TaskVariant::SyncMatch { allocated } => {
                allocated.payload.clone()
            }
            TaskVariant::Query { request, .. } => request.clone(),
        }
    }

    /// Report the dispatch outcome. Only backlog tasks route anywhere;
    /// sync-match and query tasks carry a no-op completion.
    pub fn finish(&self, error: Option<MatchingError>) {
        if let TaskVariant::Backlog {
            allocated,
            completion,
        } = &self.variant
        {
            let _ = completion.send(TaskCompletion {
                task: allocated.clone(),
                error,
            });
        }
    }
}

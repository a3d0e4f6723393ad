//! The rendezvous between task producers and pollers.
//!
//! Two zero-capacity channels carry the handoff: a send completes only
//! when a poller takes the task, which is exactly the sync-match
//! contract. Producers race the local send against a forward to the
//! parent partition and their own deadline; pollers race the local
//! receives against a forwarded poll. Every race is committed by a
//! single `select!` arm, and local arms are listed first so a
//! simultaneous local and remote match resolves local.

use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::MatchingError;
use crate::forwarder::Forwarder;
use crate::limiter::{Acquire, DispatchLimiter};
use crate::task::InternalTask;

pub struct TaskMatcher {
    task_tx: flume::Sender<InternalTask>,
    task_rx: flume::Receiver<InternalTask>,
    query_tx: flume::Sender<InternalTask>,
    query_rx: flume::Receiver<InternalTask>,
    limiter: DispatchLimiter,
    forwarder: Option<Forwarder>,
    forward_error_backoff: Duration,
}

/// Resolves when the caller should give up waiting: the deadline passes
/// or the token fires.
async fn done(deadline: Option<Instant>, cancel: &CancellationToken) {
    match deadline {
        Some(deadline) => {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = cancel.cancelled() => {}
            }
        }
        None => cancel.cancelled().await,
    }
}

fn remaining(deadline: Option<Instant>, fallback: Duration) -> Duration {
    deadline
        .map(|d| d.saturating_duration_since(Instant::now()))
        .unwrap_or(fallback)
}

impl TaskMatcher {
    pub fn new(
        default_rps: f64,
        forwarder: Option<Forwarder>,
        forward_error_backoff: Duration,
    ) -> Self {
        let (task_tx, task_rx) = flume::bounded(0);
        let (query_tx, query_rx) = flume::bounded(0);
        Self {
            task_tx,
            task_rx,
            query_tx,
            query_rx,
            limiter: DispatchLimiter::new(default_rps),
            forwarder,
            forward_error_backoff,
        }
    }

    /// Current dispatch rate, for Describe.
    pub fn rate(&self) -> f64 {
        self.limiter.rate()
    }

    /// Adopt a poller-advertised dispatch rate (last writer wins).
    pub fn update_rate_limit(&self, rate: Option<f64>) {
        self.limiter.set_rate(rate);
    }

    /// Attempt a synchronous match within the deadline. `Ok(false)` is a
    /// miss (rate budget or deadline elapsed, or no poller showed up);
    /// the caller decides whether to spill to the store.
    pub async fn offer(
        &self,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
        task: InternalTask,
    ) -> Result<bool, MatchingError> {
        // Forwarded tasks already paid a token on the child partition.
        if !task.is_forwarded() {
            match self.limiter.acquire(deadline, cancel).await {
                Acquire::Acquired => {}
                Acquire::DeadlineElapsed | Acquire::Cancelled => return Ok(false),
            }
        }

        let mut forwarder = self.forwarder.as_ref();
        loop {
            match forwarder {
                Some(fwdr) => {
                    tokio::select! {
                        biased;
                        res = self.task_tx.send_async(task.clone()) => {
                            debug_assert!(res.is_ok(), "matcher channels outlive the matcher");
                            return Ok(true);
                        }
                        forwarded = fwdr.forward_task(&task) => match forwarded {
                            Ok(()) => return Ok(true),
                            Err(err) => {
                                // No capacity, remote miss, or a dead
                                // parent: finish the attempt locally.
                                debug!(error = %err, "task forward failed, retrying local-only");
                                forwarder = None;
                            }
                        },
                        _ = done(deadline, cancel) => return Ok(false),
                    }
                }
                None => {
                    tokio::select! {
                        biased;
                        res = self.task_tx.send_async(task.clone()) => {
                            debug_assert!(res.is_ok(), "matcher channels outlive the matcher");
                            return Ok(true);
                        }
                        _ = done(deadline, cancel) => return Ok(false),
                    }
                }
            }
        }
    }

    /// Blocking variant used for backlog redelivery: waits for rate
    /// budget and keeps racing local handoff against forwarding until
    /// the task is owned by someone else or the token fires.
    pub async fn must_offer(
        &self,
        cancel: &CancellationToken,
        task: InternalTask,
    ) -> Result<(), MatchingError> {
        if !self.limiter.acquire_blocking(cancel).await {
            return Err(MatchingError::Cancelled);
        }

        loop {
            match self.forwarder.as_ref() {
                Some(fwdr) => {
                    tokio::select! {
                        biased;
                        res = self.task_tx.send_async(task.clone()) => {
                            debug_assert!(res.is_ok(), "matcher channels outlive the matcher");
                            return Ok(());
                        }
                        forwarded = fwdr.forward_task(&task) => match forwarded {
                            Ok(()) => {
                                // The parent matched or persisted it; the
                                // local backlog copy is done.
                                task.finish(None);
                                return Ok(());
                            }
                            Err(err) => {
                                debug!(error = %err, "backlog forward failed, cooling down");
                                tokio::select! {
                                    biased;
                                    res = self.task_tx.send_async(task.clone()) => {
                                        debug_assert!(res.is_ok(), "matcher channels outlive the matcher");
                                        return Ok(());
                                    }
                                    _ = tokio::time::sleep(self.forward_error_backoff) => {}
                                    _ = cancel.cancelled() => return Err(MatchingError::Cancelled),
                                }
                            }
                        },
                        _ = cancel.cancelled() => return Err(MatchingError::Cancelled),
                    }
                }
                None => {
                    tokio::select! {
                        biased;
                        res = self.task_tx.send_async(task.clone()) => {
                            debug_assert!(res.is_ok(), "matcher channels outlive the matcher");
                            return Ok(());
                        }
                        _ = cancel.cancelled() => return Err(MatchingError::Cancelled),
                    }
                }
            }
        }
    }

    /// Offer a query. Returns `Ok(None)` when a local poller took it
    /// (the response flows out-of-band) and `Ok(Some(response))` when it
    /// was answered by a parent partition.
    pub async fn offer_query(
        &self,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
        task: InternalTask,
    ) -> Result<Option<Bytes>, MatchingError> {
        let mut forwarder = self.forwarder.as_ref();
        loop {
            match forwarder {
                Some(fwdr) => {
                    tokio::select! {
                        biased;
                        res = self.query_tx.send_async(task.clone()) => {
                            debug_assert!(res.is_ok(), "matcher channels outlive the matcher");
                            return Ok(None);
                        }
                        forwarded = fwdr.forward_query(&task) => match forwarded {
                            Ok(response) => return Ok(Some(response)),
                            Err(err) => {
                                debug!(error = %err, "query forward failed, retrying local-only");
                                forwarder = None;
                            }
                        },
                        _ = done(deadline, cancel) => return Err(MatchingError::Cancelled),
                    }
                }
                None => {
                    tokio::select! {
                        biased;
                        res = self.query_tx.send_async(task.clone()) => {
                            debug_assert!(res.is_ok(), "matcher channels outlive the matcher");
                            return Ok(None);
                        }
                        _ = done(deadline, cancel) => return Err(MatchingError::Cancelled),
                    }
                }
            }
        }
    }

    /// Consumer side: wait for a task or query, racing a forwarded poll
    /// to the parent. `None` is the empty task (deadline or cancel).
    pub async fn poll(
        &self,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Option<InternalTask> {
        loop {
            // Drain anything already waiting before arming the race, so
            // local offers win ties with the parent.
            if let Ok(task) = self.task_rx.try_recv() {
                return Some(task);
            }
            if let Ok(task) = self.query_rx.try_recv() {
                return Some(task);
            }

            match self.forwarder.as_ref() {
                Some(fwdr) => {
                    let timeout = remaining(deadline, self.forward_error_backoff);
                    tokio::select! {
                        biased;
                        task = self.task_rx.recv_async() => return task.ok(),
                        task = self.query_rx.recv_async() => return task.ok(),
                        forwarded = fwdr.forward_poll(timeout) => match forwarded {
                            Ok(Some(task)) => return Some(task),
                            Ok(None) => continue,
                            Err(err) => {
                                debug!(error = %err, "poll forward failed, cooling down");
                                tokio::select! {
                                    biased;
                                    task = self.task_rx.recv_async() => return task.ok(),
                                    task = self.query_rx.recv_async() => return task.ok(),
                                    _ = tokio::time::sleep(self.forward_error_backoff) => {}
                                    _ = done(deadline, cancel) => return None,
                                }
                            }
                        },
                        _ = done(deadline, cancel) => return None,
                    }
                }
                None => {
                    tokio::select! {
                        biased;
                        task = self.task_rx.recv_async() => return task.ok(),
                        task = self.query_rx.recv_async() => return task.ok(),
                        _ = done(deadline, cancel) => return None,
                    }
                }
            }
        }
    }

    /// Consumer side for standby namespaces: only query tasks are
    /// served; backlog tasks stay put for the active cluster.
    pub async fn poll_for_query(
        &self,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Option<InternalTask> {
        if let Ok(task) = self.query_rx.try_recv() {
            return Some(task);
        }
        tokio::select! {
            biased;
            task = self.query_rx.recv_async() => task.ok(),
            _ = done(deadline, cancel) => None,
        }
    }
}

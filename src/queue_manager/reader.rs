//! Backlog pump and redelivery.
//!
//! Three loops move spilled tasks back toward pollers:
//!
//! - the pump pages tasks out of the store into a bounded buffer,
//!   parking when the backlog is drained until a producer signal or an
//!   idle probe timer fires (the probe catches signals lost to crashes);
//! - the dispatch loop offers buffered tasks to the matcher, blocking
//!   until a poller or the parent partition takes each one;
//! - the completion loop acks dispatched tasks, triggers GC, and
//!   re-appends tasks whose dispatch failed so one bad task cannot
//!   wedge the ack level.

use std::sync::Arc;

use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, warn};

use crate::matcher::TaskMatcher;
use crate::queue_manager::ack::AckTracker;
use crate::queue_manager::db::QueueDb;
use crate::queue_manager::gc::TaskGc;
use crate::queue_manager::writer::TaskWriter;
use crate::queue_manager::Lifecycle;
use crate::retry::retry;
use crate::settings::MatchingSettings;
use crate::store::StoreError;
use crate::task::{AllocatedTask, CompletionSender, InternalTask, TaskCompletion};

pub struct TaskReader {
    signal: Arc<Notify>,
    completion_tx: CompletionSender,
}

impl TaskReader {
    pub fn start(
        db: Arc<QueueDb>,
        ack: Arc<AckTracker>,
        gc: Arc<TaskGc>,
        writer: Arc<TaskWriter>,
        matcher: Arc<TaskMatcher>,
        settings: Arc<MatchingSettings>,
        lifecycle: Lifecycle,
    ) -> Self {
        let signal = Arc::new(Notify::new());
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (buffer_tx, buffer_rx) = mpsc::channel(settings.max_buffered_tasks);

        tokio::spawn(pump_loop(
            Arc::clone(&db),
            Arc::clone(&ack),
            Arc::clone(&settings),
            lifecycle.clone(),
            Arc::clone(&signal),
            buffer_tx,
        ));
        tokio::spawn(dispatch_loop(
            matcher,
            lifecycle.clone(),
            completion_tx.clone(),
            buffer_rx,
        ));
        tokio::spawn(completion_loop(
            db,
            ack,
            gc,
            writer,
            settings,
            lifecycle,
            Arc::clone(&signal),
            completion_rx,
        ));

        Self {
            signal,
            completion_tx,
        }
    }

    /// Wake the pump: a producer spilled new work.
    pub fn signal(&self) {
        self.signal.notify_one();
    }

    /// Capability attached to every backlog task this reader hands out.
    pub fn completion_sender(&self) -> CompletionSender {
        self.completion_tx.clone()
    }
}

async fn pump_loop(
    db: Arc<QueueDb>,
    ack: Arc<AckTracker>,
    settings: Arc<MatchingSettings>,
    lifecycle: Lifecycle,
    signal: Arc<Notify>,
    buffer_tx: mpsc::Sender<AllocatedTask>,
) {
    let page_size = settings.max_tasks_per_page;
    loop {
        if lifecycle.token().is_cancelled() {
            break;
        }

        let page = retry(
            &settings.persistence_retry,
            lifecycle.token(),
            |err: &StoreError| err.is_transient(),
            || db.get_tasks(ack.ack_level(), page_size),
        )
        .await;

        let page = match page {
            Ok(page) => page,
            Err(err) => {
                warn!(queue = %db.queue(), error = %err, "backlog read failed");
                tokio::select! {
                    _ = tokio::time::sleep(settings.backlog_idle_poll_interval()) => continue,
                    _ = lifecycle.token().cancelled() => break,
                }
            }
        };

        let mut buffered = 0usize;
        for task in page {
            // Ids already tracked are in flight, or completed and
            // awaiting GC. Racing the writer here is expected.
            if ack.is_tracked(task.task_id) {
                continue;
            }
            ack.add_task(task.task_id);
            tokio::select! {
                res = buffer_tx.send(task) => {
                    if res.is_err() {
                        return;
                    }
                }
                _ = lifecycle.token().cancelled() => return,
            }
            buffered += 1;
        }

        if buffered > 0 {
            continue;
        }

        // Nothing new at this ack level. Park until a producer signals,
        // a completion moves the ack level, or the idle probe fires (it
        // catches signals lost to crashes).
        tokio::select! {
            _ = signal.notified() => {}
            _ = tokio::time::sleep(settings.backlog_idle_poll_interval()) => {}
            _ = lifecycle.token().cancelled() => break,
        }
    }
    debug!(queue = %db.queue(), "backlog pump stopped");
}

async fn dispatch_loop(
    matcher: Arc<TaskMatcher>,
    lifecycle: Lifecycle,
    completion_tx: CompletionSender,
    mut buffer_rx: mpsc::Receiver<AllocatedTask>,
) {
    loop {
        let task = tokio::select! {
            task = buffer_rx.recv() => match task {
                Some(task) => task,
                None => break,
            },
            _ = lifecycle.token().cancelled() => break,
        };

        let task = InternalTask::backlog(task, completion_tx.clone());
        if matcher.must_offer(lifecycle.token(), task).await.is_err() {
            break;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn completion_loop(
    db: Arc<QueueDb>,
    ack: Arc<AckTracker>,
    gc: Arc<TaskGc>,
    writer: Arc<TaskWriter>,
    settings: Arc<MatchingSettings>,
    lifecycle: Lifecycle,
    signal: Arc<Notify>,
    mut completion_rx: mpsc::UnboundedReceiver<TaskCompletion>,
) {
    loop {
        let completion = tokio::select! {
            completion = completion_rx.recv() => match completion {
                Some(completion) => completion,
                None => break,
            },
            _ = lifecycle.token().cancelled() => break,
        };

        match completion.error {
            None => {
                let ack_level = ack.complete_task(completion.task.task_id);
                // Completions open room at the front of the backlog; let
                // the pump read the next page.
                signal.notify_one();
                gc.run(ack_level).await;
            }
            Some(dispatch_err) => {
                // The task failed to start. It cannot be dropped, so it
                // is written back with a fresh, higher id; the old id is
                // acked and the backlog keeps moving.
                let task = completion.task;
                let rewrites = task.rewrites + 1;
                if rewrites > settings.max_dispatch_rewrites {
                    error!(
                        queue = %db.queue(),
                        task_id = task.task_id,
                        rewrites = task.rewrites,
                        "task exceeded the dispatch rewrite budget, unloading"
                    );
                    lifecycle.request_stop();
                    break;
                }
                warn!(
                    queue = %db.queue(),
                    task_id = task.task_id,
                    rewrites,
                    error = %dispatch_err,
                    "dispatch failed, re-appending task with a new id"
                );
                match writer.append(task.payload.clone(), rewrites).await {
                    Ok(rewritten) => {
                        debug!(
                            queue = %db.queue(),
                            old_task_id = task.task_id,
                            new_task_id = rewritten.task_id,
                            "task rewritten"
                        );
                        signal.notify_one();
                        let ack_level = ack.complete_task(task.task_id);
                        gc.run(ack_level).await;
                    }
                    Err(err) => {
                        // The store is down too. Keep the durable copy
                        // and unload loudly rather than lose the task.
                        error!(
                            queue = %db.queue(),
                            task_id = task.task_id,
                            error = %err,
                            "re-append failed, unloading to avoid task loss"
                        );
                        lifecycle.request_stop();
                        break;
                    }
                }
            }
        }
    }
}

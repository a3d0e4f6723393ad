//! Backlog garbage collection.
//!
//! Acknowledged tasks are deleted from the store in ranges, but only
//! when enough acks accumulated or enough time passed; GC must never
//! get in the way of dispatch. Failures are logged and retried by the
//! next trigger; the ack level makes the delete idempotent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::queue_manager::db::QueueDb;
use crate::settings::MatchingSettings;

struct GcState {
    last_deleted_level: i64,
    last_run: Instant,
}

pub struct TaskGc {
    db: Arc<QueueDb>,
    task_threshold: i64,
    min_interval: std::time::Duration,
    state: Mutex<GcState>,
    running: AtomicBool,
}

impl TaskGc {
    pub fn new(db: Arc<QueueDb>, settings: &MatchingSettings) -> Self {
        Self {
            db,
            task_threshold: settings.gc_task_threshold,
            min_interval: settings.gc_min_interval(),
            state: Mutex::new(GcState {
                last_deleted_level: 0,
                last_run: Instant::now(),
            }),
            running: AtomicBool::new(false),
        }
    }

    /// Offer an ack-level observation. Runs the range delete when the
    /// level advanced by the threshold or the interval elapsed; at most
    /// one delete is in flight at a time.
    pub async fn run(&self, ack_level: i64) {
        {
            let state = self.state.lock().unwrap();
            let advanced = ack_level - state.last_deleted_level;
            if advanced < self.task_threshold && state.last_run.elapsed() < self.min_interval {
                return;
            }
            if advanced <= 0 {
                return;
            }
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let result = self.db.complete_tasks_less_equal(ack_level).await;
        match result {
            Ok(deleted) => {
                let mut state = self.state.lock().unwrap();
                state.last_deleted_level = ack_level;
                state.last_run = Instant::now();
                debug!(queue = %self.db.queue(), ack_level, deleted, "task gc completed");
            }
            Err(err) => {
                warn!(queue = %self.db.queue(), ack_level, error = %err, "task gc failed");
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }
}

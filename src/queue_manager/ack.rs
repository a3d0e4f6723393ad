//! In-flight task bookkeeping.
//!
//! Tracks every task id handed to the matcher and computes the ack
//! level: the highest id such that everything at or below it has been
//! acknowledged. Completions may arrive out of order; the level only
//! advances over the completed prefix. Entries stay in the map until
//! they fall inside that prefix, which also lets the reader recognize
//! completed-but-not-yet-deleted ids when it re-reads a page.

use std::collections::BTreeMap;
use std::sync::Mutex;

use tracing::warn;

#[derive(Debug, Default)]
struct AckState {
    ack_level: i64,
    read_level: i64,
    /// Highest id durably appended by the writer.
    append_level: i64,
    /// id -> completed. Ordered so the prefix scan is a front pop.
    outstanding: BTreeMap<i64, bool>,
    /// Entries in `outstanding` not yet completed.
    in_flight: usize,
}

#[derive(Debug, Default)]
pub struct AckTracker {
    state: Mutex<AckState>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed levels from the persisted ack level. Start-time only.
    pub fn set_ack_level(&self, level: i64) {
        let mut state = self.state.lock().unwrap();
        state.ack_level = state.ack_level.max(level);
        state.read_level = state.read_level.max(level);
    }

    pub fn ack_level(&self) -> i64 {
        self.state.lock().unwrap().ack_level
    }

    pub fn read_level(&self) -> i64 {
        self.state.lock().unwrap().read_level
    }

    pub fn append_level(&self) -> i64 {
        self.state.lock().unwrap().append_level
    }

    /// Record that the writer durably appended up to `task_id`. Called
    /// only after the store write succeeded.
    pub fn note_appended(&self, task_id: i64) {
        let mut state = self.state.lock().unwrap();
        state.append_level = state.append_level.max(task_id);
    }

    /// Track a task the reader is about to buffer. Ids arrive in
    /// ascending order; a regression indicates a reader bug.
    pub fn add_task(&self, task_id: i64) {
        let mut state = self.state.lock().unwrap();
        if task_id <= state.read_level {
            warn!(
                task_id,
                read_level = state.read_level,
                "task id not larger than read level"
            );
        }
        state.read_level = state.read_level.max(task_id);
        if state.outstanding.insert(task_id, false).is_none() {
            state.in_flight += 1;
        }
    }

    /// Whether `task_id` is already tracked (in flight, or completed but
    /// not yet below the ack level).
    pub fn is_tracked(&self, task_id: i64) -> bool {
        self.state.lock().unwrap().outstanding.contains_key(&task_id)
    }

    /// Mark `task_id` completed and advance the ack level over the
    /// contiguous completed prefix. Returns the new ack level.
    pub fn complete_task(&self, task_id: i64) -> i64 {
        let mut state = self.state.lock().unwrap();
        let newly_completed = match state.outstanding.get_mut(&task_id) {
            Some(completed) if !*completed => {
                *completed = true;
                true
            }
            _ => false,
        };
        if newly_completed {
            state.in_flight -= 1;
        }
        loop {
            let front = state
                .outstanding
                .first_key_value()
                .map(|(&id, &completed)| (id, completed));
            match front {
                Some((id, true)) => {
                    state.outstanding.remove(&id);
                    state.ack_level = id;
                }
                _ => break,
            }
        }
        state.ack_level
    }

    /// Approximate backlog size: tracked tasks not yet completed.
    pub fn backlog_count_hint(&self) -> i64 {
        self.state.lock().unwrap().in_flight as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_level_advances_over_contiguous_prefix() {
        let tracker = AckTracker::new();
        tracker.set_ack_level(0);
        for id in 1..=4 {
            tracker.add_task(id);
        }
        assert_eq!(tracker.read_level(), 4);
        assert_eq!(tracker.complete_task(2), 0);
        assert_eq!(tracker.complete_task(1), 2);
        assert_eq!(tracker.complete_task(4), 2);
        assert_eq!(tracker.complete_task(3), 4);
        assert_eq!(tracker.backlog_count_hint(), 0);
    }

    #[test]
    fn completed_ids_stay_tracked_until_prefix_moves() {
        let tracker = AckTracker::new();
        tracker.add_task(1);
        tracker.add_task(2);
        tracker.complete_task(2);
        assert!(tracker.is_tracked(2), "gap keeps id 2 tracked");
        tracker.complete_task(1);
        assert!(!tracker.is_tracked(2));
        assert_eq!(tracker.ack_level(), 2);
    }
}

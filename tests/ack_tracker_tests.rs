use switchboard::queue_manager::ack::AckTracker;

#[test]
fn seed_level_bounds_both_levels() {
    let tracker = AckTracker::new();
    tracker.set_ack_level(41);
    assert_eq!(tracker.ack_level(), 41);
    assert_eq!(tracker.read_level(), 41);
}

#[test]
fn out_of_order_completions_never_regress_the_ack_level() {
    let tracker = AckTracker::new();
    for id in 1..=6 {
        tracker.add_task(id);
    }

    let mut last_level = 0;
    for id in [3, 6, 1, 5, 2, 4] {
        let level = tracker.complete_task(id);
        assert!(level >= last_level, "ack level regressed at id {id}");
        last_level = level;
    }
    assert_eq!(last_level, 6);
    assert_eq!(tracker.backlog_count_hint(), 0);
}

#[test]
fn gaps_from_skipped_ids_do_not_block_advance() {
    // Ids 1, 5, 9 exist; the writer skipped the rest (block churn).
    let tracker = AckTracker::new();
    for id in [1, 5, 9] {
        tracker.add_task(id);
    }
    tracker.complete_task(1);
    tracker.complete_task(5);
    assert_eq!(tracker.ack_level(), 5);
    assert_eq!(tracker.complete_task(9), 9);
}

#[test]
fn backlog_hint_counts_only_incomplete_tasks() {
    let tracker = AckTracker::new();
    for id in 1..=4 {
        tracker.add_task(id);
    }
    assert_eq!(tracker.backlog_count_hint(), 4);
    tracker.complete_task(3);
    tracker.complete_task(4);
    // Still tracked (gap at 1-2), but no longer in flight.
    assert_eq!(tracker.backlog_count_hint(), 2);
    assert!(tracker.is_tracked(3));
}

#[test]
fn append_level_follows_the_writer_monotonically() {
    let tracker = AckTracker::new();
    tracker.note_appended(10);
    tracker.note_appended(7);
    assert_eq!(tracker.append_level(), 10);
    tracker.note_appended(12);
    assert_eq!(tracker.append_level(), 12);
}

#[test]
fn double_completion_is_idempotent() {
    let tracker = AckTracker::new();
    tracker.add_task(1);
    tracker.add_task(2);
    assert_eq!(tracker.complete_task(2), 0);
    assert_eq!(tracker.complete_task(2), 0);
    assert_eq!(tracker.backlog_count_hint(), 1);
    assert_eq!(tracker.complete_task(1), 2);
}

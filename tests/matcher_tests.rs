
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use switchboard::matcher::TaskMatcher;
use switchboard::task::{InternalTask, TaskSource, SYNC_MATCH_TASK_ID};
use test_helpers::task_payload_str;

fn local_matcher(rps: f64) -> Arc<TaskMatcher> {
    Arc::new(TaskMatcher::new(rps, None, Duration::from_millis(10)))
}

fn sync_task(data: &str) -> InternalTask {
    InternalTask::sync_match(
        Bytes::copy_from_slice(data.as_bytes()),
        TaskSource::History,
        None,
    )
}

#[tokio::test]
async fn offer_hands_task_to_waiting_poller() {
    let matcher = local_matcher(100_000.0);
    let cancel = CancellationToken::new();

    let poller = {
        let matcher = Arc::clone(&matcher);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            matcher
                .poll(&cancel, Some(Instant::now() + Duration::from_secs(5)))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let matched = with_timeout!(1_000, {
        matcher
            .offer(
                &cancel,
                Some(Instant::now() + Duration::from_millis(500)),
                sync_task("x"),
            )
            .await
            .expect("offer")
    });
    assert!(matched, "poller was waiting, offer must match");

    let polled = poller.await.unwrap().expect("poller should get the task");
    assert_eq!(task_payload_str(&polled), "x");
    assert_eq!(polled.allocated().unwrap().task_id, SYNC_MATCH_TASK_ID);
}

#[tokio::test]
async fn offer_misses_when_no_poller_arrives() {
    let matcher = local_matcher(100_000.0);
    let cancel = CancellationToken::new();

    let started = Instant::now();
    let matched = matcher
        .offer(
            &cancel,
            Some(Instant::now() + Duration::from_millis(50)),
            sync_task("x"),
        )
        .await
        .expect("offer");
    assert!(!matched);
    assert!(started.elapsed() >= Duration::from_millis(45));
}

#[tokio::test]
async fn offer_misses_when_rate_budget_is_exhausted() {
    // Burst of one token at a negligible refill rate.
    let matcher = local_matcher(0.001);
    let cancel = CancellationToken::new();

    // First offer takes the only token (and misses, nobody polling).
    let matched = matcher
        .offer(
            &cancel,
            Some(Instant::now() + Duration::from_millis(20)),
            sync_task("a"),
        )
        .await
        .expect("offer");
    assert!(!matched);

    // A poller is now waiting, but no token arrives within the deadline.
    let poller = {
        let matcher = Arc::clone(&matcher);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            matcher
                .poll(&cancel, Some(Instant::now() + Duration::from_secs(2)))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let matched = matcher
        .offer(
            &cancel,
            Some(Instant::now() + Duration::from_millis(50)),
            sync_task("b"),
        )
        .await
        .expect("offer");
    assert!(!matched, "offer must miss on rate limit even with a poller waiting");

    cancel.cancel();
    assert!(poller.await.unwrap().is_none());
}

#[tokio::test]
async fn must_offer_blocks_until_poller_arrives() {
    let matcher = local_matcher(100_000.0);
    let cancel = CancellationToken::new();

    let offerer = {
        let matcher = Arc::clone(&matcher);
        let cancel = cancel.clone();
        tokio::spawn(async move { matcher.must_offer(&cancel, sync_task("backlog")).await })
    };

    // Let it block for a while with no poller.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!offerer.is_finished());

    let polled = with_timeout!(1_000, {
        matcher
            .poll(&cancel, Some(Instant::now() + Duration::from_secs(2)))
            .await
    });
    assert_eq!(task_payload_str(&polled.unwrap()), "backlog");
    offerer.await.unwrap().expect("must_offer resolves");
}

#[tokio::test]
async fn poll_returns_empty_at_deadline() {
    let matcher = local_matcher(100_000.0);
    let cancel = CancellationToken::new();

    let started = Instant::now();
    let polled = matcher
        .poll(&cancel, Some(Instant::now() + Duration::from_millis(50)))
        .await;
    assert!(polled.is_none());
    assert!(started.elapsed() >= Duration::from_millis(45));
}

#[tokio::test]
async fn poll_returns_empty_on_cancellation() {
    let matcher = local_matcher(100_000.0);
    let cancel = CancellationToken::new();

    let poller = {
        let matcher = Arc::clone(&matcher);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            matcher
                .poll(&cancel, Some(Instant::now() + Duration::from_secs(30)))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    let polled = with_timeout!(500, { poller.await.unwrap() });
    assert!(polled.is_none());
}

#[tokio::test]
async fn query_matched_locally_returns_no_response() {
    let matcher = local_matcher(100_000.0);
    let cancel = CancellationToken::new();

    let poller = {
        let matcher = Arc::clone(&matcher);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            matcher
                .poll(&cancel, Some(Instant::now() + Duration::from_secs(5)))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let task = InternalTask::query("q-1", Bytes::from_static(b"state?"), None);
    let response = with_timeout!(1_000, {
        matcher
            .offer_query(&cancel, Some(Instant::now() + Duration::from_secs(1)), task)
            .await
            .expect("offer_query")
    });
    assert!(response.is_none(), "local match answers out-of-band");

    let polled = poller.await.unwrap().expect("poller receives the query");
    assert!(polled.is_query());
    assert_eq!(task_payload_str(&polled), "state?");
}

#[tokio::test]
async fn backlog_task_dispatch_order_is_fifo_per_offerer() {
    let matcher = local_matcher(100_000.0);
    let cancel = CancellationToken::new();

    let offerer = {
        let matcher = Arc::clone(&matcher);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            for data in ["t1", "t2", "t3"] {
                matcher.must_offer(&cancel, sync_task(data)).await.unwrap();
            }
        })
    };

    let mut seen = Vec::new();
    for _ in 0..3 {
        let polled = with_timeout!(1_000, {
            matcher
                .poll(&cancel, Some(Instant::now() + Duration::from_secs(2)))
                .await
        });
        seen.push(task_payload_str(&polled.unwrap()));
    }
    assert_eq!(seen, vec!["t1", "t2", "t3"]);
    offerer.await.unwrap();
}

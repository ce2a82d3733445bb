//! End-to-end dispatcher scenarios against scripted in-process sinks.

mod support;

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use logship::{
    breaker::BreakerState,
    config::OverflowPolicy,
    event::{Cursor, DeliveryStatus, SourceAck},
    Dispatcher, SubmitOutcome,
};
use tempfile::tempdir;

use support::{
    file_origin, mock_sink_config, record, test_config, wait_until, MockSink, Scripted,
};

#[tokio::test]
async fn happy_path_delivers_and_advances_positions() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());
    let dispatcher = Dispatcher::new(&config).unwrap();
    let sink = MockSink::ok("mock");
    dispatcher
        .add_sink(sink.clone(), &mock_sink_config())
        .unwrap();
    dispatcher.start().await.unwrap();

    let origin = file_origin("/var/log/app.log");
    for n in 0..100 {
        let outcome = dispatcher.submit(record(&origin, n, &format!("line {n}")));
        assert_eq!(outcome, SubmitOutcome::Accepted);
    }

    wait_until("100 deliveries", Duration::from_secs(10), || {
        sink.received_count() == 100
    })
    .await;

    wait_until("position advance", Duration::from_secs(5), || {
        dispatcher.positions().get(&origin) == Some(Cursor::Bytes(99))
    })
    .await;

    let stats = dispatcher.stats();
    assert_eq!(stats.delivered, 100);
    assert_eq!(stats.dlq_depth, 0);
    assert_eq!(stats.dead_lettered, 0);
    dispatcher.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn transient_failures_retry_to_success() {
    let dir = tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.dispatcher.worker_count = 1;
    let dispatcher = Dispatcher::new(&config).unwrap();
    let sink = MockSink::scripted(
        "mock",
        vec![Scripted::Transient, Scripted::Transient, Scripted::Transient],
        Scripted::Ok,
    );
    dispatcher
        .add_sink(sink.clone(), &mock_sink_config())
        .unwrap();
    dispatcher.start().await.unwrap();

    let origin = file_origin("/var/log/app.log");
    for n in 0..10 {
        dispatcher.submit(record(&origin, n, &format!("line {n}")));
    }

    wait_until("10 deliveries after retries", Duration::from_secs(10), || {
        sink.received_count() == 10
    })
    .await;

    assert!(sink.invocations() <= 5, "saw {} attempts", sink.invocations());
    let stats = dispatcher.stats();
    assert_eq!(stats.dlq_depth, 0);
    assert_eq!(stats.sinks["mock"].circuit_state, BreakerState::Closed);
    dispatcher.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn permanent_rejection_dead_letters_without_retry() {
    let dir = tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.dispatcher.worker_count = 1;
    let dispatcher = Dispatcher::new(&config).unwrap();
    let sink = MockSink::scripted("mock", vec![], Scripted::Permanent);
    dispatcher
        .add_sink(sink.clone(), &mock_sink_config())
        .unwrap();
    dispatcher.start().await.unwrap();

    let origin = file_origin("/var/log/app.log");
    for n in 0..5 {
        dispatcher.submit(record(&origin, n, &format!("line {n}")));
    }

    wait_until("5 DLQ entries", Duration::from_secs(10), || {
        dispatcher.stats().dlq_depth == 5
    })
    .await;

    // One batch, one invocation: permanent errors are never retried.
    assert_eq!(sink.invocations(), 1);
    assert_eq!(sink.received_count(), 0);

    // Dead-lettered records are terminally handled, so positions advance.
    wait_until("position advance", Duration::from_secs(5), || {
        dispatcher.positions().get(&origin) == Some(Cursor::Bytes(4))
    })
    .await;
    assert_eq!(
        dispatcher.stats().sinks["mock"].circuit_state,
        BreakerState::Closed
    );
    dispatcher.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn sustained_failure_opens_breaker_and_bounds_invocations() {
    let dir = tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.dispatcher.worker_count = 1;
    config.dispatcher.max_attempts = 2;
    config.dispatcher.open_defer_limit = 2;
    let dispatcher = Dispatcher::new(&config).unwrap();

    let mut sink_config = mock_sink_config();
    sink_config.circuit_breaker.max_failures = 2;
    let sink = MockSink::scripted("mock", vec![], Scripted::Transient);
    dispatcher.add_sink(sink.clone(), &sink_config).unwrap();
    dispatcher.start().await.unwrap();

    let origin = file_origin("/var/log/app.log");
    for n in 0..20 {
        dispatcher.submit(record(&origin, n, &format!("line {n}")));
    }

    wait_until("all records dead lettered", Duration::from_secs(15), || {
        dispatcher.stats().dlq_depth == 20
    })
    .await;

    // Breaker opens after max_failures, then batches are deferred and dead
    // lettered without invoking the sink.
    assert!(
        sink.invocations() <= (2 + 2) as u64,
        "saw {} invocations",
        sink.invocations()
    );
    assert_eq!(
        dispatcher.stats().sinks["mock"].circuit_state,
        BreakerState::Open
    );
    dispatcher.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn duplicates_within_ttl_reach_the_sink_once() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());
    let dispatcher = Dispatcher::new(&config).unwrap();
    let sink = MockSink::ok("mock");
    dispatcher
        .add_sink(sink.clone(), &mock_sink_config())
        .unwrap();
    dispatcher.start().await.unwrap();

    let origin = file_origin("/var/log/app.log");
    for _ in 0..1000 {
        let outcome = dispatcher.submit(record(&origin, 0, "the same line"));
        assert_eq!(outcome, SubmitOutcome::Accepted);
    }

    wait_until("single delivery", Duration::from_secs(10), || {
        sink.received_count() == 1
    })
    .await;
    // Give a straggler batch a moment to prove there isn't one.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(sink.received_count(), 1);

    let stats = dispatcher.stats();
    assert_eq!(stats.dedup_duplicates, 999);
    assert!(stats.dedup_hit_ratio > 0.99);
    dispatcher.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn restart_resumes_from_persisted_positions() {
    let dir = tempdir().unwrap();
    let origin = file_origin("/var/log/app.log");
    {
        let dispatcher = Dispatcher::new(&test_config(dir.path())).unwrap();
        let sink = MockSink::ok("mock");
        dispatcher
            .add_sink(sink.clone(), &mock_sink_config())
            .unwrap();
        dispatcher.start().await.unwrap();
        for n in 0..500 {
            dispatcher.submit(record(&origin, n, &format!("line {n}")));
        }
        wait_until("500 deliveries", Duration::from_secs(10), || {
            sink.received_count() == 500
        })
        .await;
        dispatcher.stop(Duration::from_secs(5)).await;
    }

    let dispatcher = Dispatcher::new(&test_config(dir.path())).unwrap();
    dispatcher
        .add_sink(MockSink::ok("mock"), &mock_sink_config())
        .unwrap();
    dispatcher.start().await.unwrap();
    assert_eq!(dispatcher.positions().get(&origin), Some(Cursor::Bytes(499)));
    dispatcher.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn shutdown_residue_spills_to_disk_and_replays_on_restart() {
    let dir = tempdir().unwrap();
    let origin = file_origin("/var/log/app.log");
    let first_run_delivered;
    {
        let dispatcher = Dispatcher::new(&test_config(dir.path())).unwrap();
        let sink = MockSink::slow("mock", Duration::from_secs(1));
        dispatcher
            .add_sink(sink.clone(), &mock_sink_config())
            .unwrap();
        dispatcher.start().await.unwrap();

        for n in 0..40 {
            assert_eq!(
                dispatcher.submit(record(&origin, n, &format!("line {n}"))),
                SubmitOutcome::Accepted
            );
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        dispatcher.stop(Duration::from_millis(200)).await;

        let stats = dispatcher.stats();
        first_run_delivered = stats.delivered;
        assert_eq!(
            stats.delivered + stats.disk_buffer_depth,
            40,
            "every record is either delivered or on disk"
        );
        assert!(stats.disk_buffer_depth > 0);
    }

    let dispatcher = Dispatcher::new(&test_config(dir.path())).unwrap();
    let sink = MockSink::ok("mock");
    dispatcher
        .add_sink(sink.clone(), &mock_sink_config())
        .unwrap();
    dispatcher.start().await.unwrap();

    let expected = 40 - first_run_delivered as usize;
    wait_until("buffered records replay", Duration::from_secs(10), || {
        sink.received_count() == expected
    })
    .await;
    dispatcher.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn overflow_spills_to_disk_and_everything_is_delivered() {
    let dir = tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.dispatcher.queue_size = 200;
    let dispatcher = Dispatcher::new(&config).unwrap();
    let sink = MockSink::slow("mock", Duration::from_millis(1));
    dispatcher
        .add_sink(sink.clone(), &mock_sink_config())
        .unwrap();
    dispatcher.start().await.unwrap();

    let origin = file_origin("/var/log/app.log");
    for n in 0..10_000u64 {
        let outcome = dispatcher.submit(record(&origin, n, &format!("line {n}")));
        assert_eq!(outcome, SubmitOutcome::Accepted);
    }
    // With a 200-slot queue the bulk must have gone through the buffer.
    assert!(dispatcher.stats().disk_buffer_depth > 0);

    wait_until("all 10k delivered", Duration::from_secs(60), || {
        sink.received_count() == 10_000
    })
    .await;
    let stats = dispatcher.stats();
    assert_eq!(stats.dropped_backpressure, 0);
    assert_eq!(stats.dlq_depth, 0);
    dispatcher.stop(Duration::from_secs(10)).await;
}

#[tokio::test]
async fn drop_new_policy_rejects_at_capacity() {
    let dir = tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.dispatcher.worker_count = 1;
    config.dispatcher.queue_size = 20;
    config.dispatcher.overflow_policy = OverflowPolicy::DropNew;
    let dispatcher = Dispatcher::new(&config).unwrap();
    let sink = MockSink::slow("mock", Duration::from_millis(200));
    dispatcher
        .add_sink(sink.clone(), &mock_sink_config())
        .unwrap();
    dispatcher.start().await.unwrap();

    let origin = file_origin("/var/log/app.log");
    let mut rejected = 0;
    for n in 0..200 {
        if dispatcher.submit(record(&origin, n, &format!("line {n}")))
            == SubmitOutcome::RejectedBackpressure
        {
            rejected += 1;
        }
    }
    assert!(rejected > 0);
    assert_eq!(dispatcher.stats().dropped_backpressure, rejected);
    dispatcher.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn dlq_reprocess_redelivers_after_restart() {
    let dir = tempdir().unwrap();
    let origin = file_origin("/var/log/app.log");
    {
        let mut config = test_config(dir.path());
        config.dispatcher.worker_count = 1;
        let dispatcher = Dispatcher::new(&config).unwrap();
        dispatcher
            .add_sink(
                MockSink::scripted("mock", vec![], Scripted::Permanent),
                &mock_sink_config(),
            )
            .unwrap();
        dispatcher.start().await.unwrap();
        for n in 0..5 {
            dispatcher.submit(record(&origin, n, &format!("line {n}")));
        }
        wait_until("5 DLQ entries", Duration::from_secs(10), || {
            dispatcher.stats().dlq_depth == 5
        })
        .await;
        dispatcher.stop(Duration::from_secs(5)).await;
    }

    let dispatcher = Dispatcher::new(&test_config(dir.path())).unwrap();
    let sink = MockSink::ok("mock");
    dispatcher
        .add_sink(sink.clone(), &mock_sink_config())
        .unwrap();
    dispatcher.start().await.unwrap();
    assert_eq!(dispatcher.stats().dlq_depth, 5);

    let requeued = dispatcher.reprocess_dlq(10).await.unwrap();
    assert_eq!(requeued, 5);

    wait_until("reprocessed deliveries", Duration::from_secs(10), || {
        sink.received_count() == 5
    })
    .await;
    assert_eq!(dispatcher.stats().dlq_depth, 0);
    dispatcher.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn dlq_replay_honors_current_submit_filters() {
    let dir = tempdir().unwrap();
    let origin = file_origin("/var/log/app.log");
    {
        let mut config = test_config(dir.path());
        config.dispatcher.worker_count = 1;
        let dispatcher = Dispatcher::new(&config).unwrap();
        dispatcher
            .add_sink(
                MockSink::scripted("mock", vec![], Scripted::Permanent),
                &mock_sink_config(),
            )
            .unwrap();
        dispatcher.start().await.unwrap();
        for n in 0..5 {
            let mut rec = record(&origin, n, &format!("line {n}"));
            rec.set_label("source", "replayme".to_string());
            dispatcher.submit(rec);
        }
        wait_until("5 DLQ entries", Duration::from_secs(10), || {
            dispatcher.stats().dlq_depth == 5
        })
        .await;
        dispatcher.stop(Duration::from_secs(5)).await;
    }

    // Second run drops those records at the submit boundary; the replay
    // still consumes them from the DLQ.
    let mut config = test_config(dir.path());
    config.submit_filters.push(logship::config::SubmitFilter {
        label: "source".to_string(),
        pattern: "replayme".to_string(),
    });
    let dispatcher = Dispatcher::new(&config).unwrap();
    let sink = MockSink::ok("mock");
    dispatcher
        .add_sink(sink.clone(), &mock_sink_config())
        .unwrap();
    dispatcher.start().await.unwrap();

    let requeued = dispatcher.reprocess_dlq(10).await.unwrap();
    assert_eq!(requeued, 5);
    assert_eq!(dispatcher.stats().dlq_depth, 0);
    assert_eq!(dispatcher.stats().filtered, 5);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(sink.received_count(), 0);
    dispatcher.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn lifecycle_guards_submit_and_reconfiguration() {
    let dir = tempdir().unwrap();
    let dispatcher = Dispatcher::new(&test_config(dir.path())).unwrap();
    let origin = file_origin("/var/log/app.log");

    // Not started yet.
    assert_eq!(
        dispatcher.submit(record(&origin, 0, "early")),
        SubmitOutcome::RejectedShutdown
    );

    dispatcher
        .add_sink(MockSink::ok("mock"), &mock_sink_config())
        .unwrap();
    dispatcher.start().await.unwrap();

    // Start is not re-entrant.
    assert!(dispatcher.start().await.is_err());
    // Sinks are fixed once running.
    assert!(dispatcher
        .add_sink(MockSink::ok("late"), &mock_sink_config())
        .is_err());

    dispatcher.stop(Duration::from_secs(5)).await;
    assert_eq!(
        dispatcher.submit(record(&origin, 1, "late")),
        SubmitOutcome::RejectedShutdown
    );
    assert_eq!(dispatcher.stats().state, "stopped");
}

#[tokio::test]
async fn reload_applies_filters_and_dedup() {
    let dir = tempdir().unwrap();
    let dispatcher = Dispatcher::new(&test_config(dir.path())).unwrap();
    let sink = MockSink::ok("mock");
    dispatcher
        .add_sink(sink.clone(), &mock_sink_config())
        .unwrap();
    dispatcher.start().await.unwrap();

    let origin = file_origin("/var/log/app.log");
    dispatcher.submit(record(&origin, 0, "before reload"));
    wait_until("first delivery", Duration::from_secs(10), || {
        sink.received_count() == 1
    })
    .await;

    // New document: dedup off, plus a filter dropping internal records.
    let mut config = test_config(dir.path());
    config.deduplication.enabled = false;
    config.submit_filters.push(logship::config::SubmitFilter {
        label: "source".to_string(),
        pattern: "internal".to_string(),
    });
    dispatcher.reload(&config).unwrap();

    // The same payload again: with dedup off it flows through.
    dispatcher.submit(record(&origin, 1, "before reload"));
    wait_until("post-reload delivery", Duration::from_secs(10), || {
        sink.received_count() == 2
    })
    .await;

    // And the new filter drops matching records at the boundary.
    let mut filtered = record(&origin, 2, "self log");
    filtered.set_label("source", "internal".to_string());
    dispatcher.submit(filtered);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(sink.received_count(), 2);
    assert_eq!(dispatcher.stats().filtered, 1);

    // A broken document is rejected wholesale.
    let mut bad = test_config(dir.path());
    bad.submit_filters.push(logship::config::SubmitFilter {
        label: "x".to_string(),
        pattern: "(unclosed".to_string(),
    });
    assert!(dispatcher.reload(&bad).is_err());

    dispatcher.stop(Duration::from_secs(5)).await;
}

struct CountingAck {
    delivered: AtomicU64,
    dropped: AtomicU64,
    dead_lettered: AtomicU64,
}

impl SourceAck for CountingAck {
    fn ack(&self, status: DeliveryStatus) {
        match status {
            DeliveryStatus::Delivered => self.delivered.fetch_add(1, Ordering::SeqCst),
            DeliveryStatus::Dropped => self.dropped.fetch_add(1, Ordering::SeqCst),
            DeliveryStatus::DeadLettered => self.dead_lettered.fetch_add(1, Ordering::SeqCst),
        };
    }
}

#[tokio::test]
async fn source_acks_reflect_terminal_disposition() {
    let dir = tempdir().unwrap();
    let dispatcher = Dispatcher::new(&test_config(dir.path())).unwrap();
    let sink = MockSink::ok("mock");
    dispatcher
        .add_sink(sink.clone(), &mock_sink_config())
        .unwrap();
    dispatcher.start().await.unwrap();

    let acks = Arc::new(CountingAck {
        delivered: AtomicU64::new(0),
        dropped: AtomicU64::new(0),
        dead_lettered: AtomicU64::new(0),
    });
    let origin = file_origin("/var/log/app.log");
    for n in 0..3 {
        let rec = record(&origin, n, &format!("line {n}")).with_ack(acks.clone());
        dispatcher.submit(rec);
    }
    // A duplicate of the first record is acked as dropped at submit.
    let dup = record(&origin, 0, "line 0").with_ack(acks.clone());
    dispatcher.submit(dup);

    wait_until("3 delivered acks", Duration::from_secs(10), || {
        acks.delivered.load(Ordering::SeqCst) == 3
    })
    .await;
    assert_eq!(acks.dropped.load(Ordering::SeqCst), 1);
    assert_eq!(acks.dead_lettered.load(Ordering::SeqCst), 0);
    dispatcher.stop(Duration::from_secs(5)).await;
}

// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Command queue tests: priority, rate spacing, deadline, and shutdown
//! accounting. All tests run on the paused clock, so the 60-second budget
//! windows execute instantly.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use camrelay::error::RelayError;
use camrelay::queue::CommandQueue;

type Log = Arc<Mutex<Vec<(&'static str, Instant)>>>;

fn record(log: &Log, label: &'static str) {
    log.lock().push((label, Instant::now()));
}

#[tokio::test(start_paused = true)]
async fn test_extend_dispatches_before_older_generate() {
    // QPM = 1: the first permit matures at t = 60 s, by which time both
    // tickets are enqueued and strict priority decides the order.
    let queue = CommandQueue::new(1, Duration::from_secs(30));
    queue.start();
    let start = Instant::now();
    let log: Log = Arc::new(Mutex::new(Vec::new()));

    let generate = {
        let queue = queue.clone();
        let log = log.clone();
        tokio::spawn(async move {
            queue
                .submit_generate("cam-a", 0, async move {
                    record(&log, "generate-a");
                    Ok(())
                })
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;

    let extend = {
        let queue = queue.clone();
        let log = log.clone();
        tokio::spawn(async move {
            queue
                .submit_extend("cam-b", async move {
                    record(&log, "extend-b");
                    Ok(())
                })
                .await
        })
    };

    extend.await.expect("join").expect("extend result");
    generate.await.expect("join").expect("generate result");

    let entries = log.lock().clone();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].0, "extend-b", "keep-alive must dispatch first");
    assert_eq!(entries[1].0, "generate-a");

    let gap = entries[1].1 - entries[0].1;
    assert!(gap >= Duration::from_secs(60), "inter-dispatch gap was {gap:?}");
    assert!(entries[0].1 - start >= Duration::from_secs(60));
}

#[tokio::test(start_paused = true)]
async fn test_fifo_within_priority_band() {
    let queue = CommandQueue::new(6000, Duration::from_secs(30));
    let log: Log = Arc::new(Mutex::new(Vec::new()));

    // Enqueue before the worker starts so arrival order is fixed.
    let mut handles = Vec::new();
    for label in ["gen-1", "gen-2"] {
        let queue = queue.clone();
        let log = log.clone();
        handles.push(tokio::spawn(async move {
            queue
                .submit_generate("cam", 0, async move {
                    record(&log, label);
                    Ok(())
                })
                .await
        }));
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    for label in ["ext-1", "ext-2"] {
        let queue = queue.clone();
        let log = log.clone();
        handles.push(tokio::spawn(async move {
            queue
                .submit_extend("cam", async move {
                    record(&log, label);
                    Ok(())
                })
                .await
        }));
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    queue.start();
    for handle in handles {
        handle.await.expect("join").expect("command result");
    }

    let order: Vec<&str> = log.lock().iter().map(|(l, _)| *l).collect();
    assert_eq!(order, vec!["ext-1", "ext-2", "gen-1", "gen-2"]);
}

#[tokio::test(start_paused = true)]
async fn test_dispatch_spacing_honors_budget() {
    // QPM = 60: exactly one dispatch per second.
    let queue = CommandQueue::new(60, Duration::from_secs(30));
    queue.start();
    let log: Log = Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for _ in 0..5 {
        let queue = queue.clone();
        let log = log.clone();
        handles.push(tokio::spawn(async move {
            queue
                .submit_extend("cam", async move {
                    record(&log, "call");
                    Ok(())
                })
                .await
        }));
    }
    for handle in handles {
        handle.await.expect("join").expect("command result");
    }

    let times: Vec<Instant> = log.lock().iter().map(|(_, t)| *t).collect();
    assert_eq!(times.len(), 5);
    for pair in times.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(
            gap >= Duration::from_millis(990),
            "dispatches only {gap:?} apart"
        );
    }
    // 5 calls span 4 gaps: comfortably within a single 60 s window budget.
    assert!(times[4] - times[0] <= Duration::from_secs(60));
}

#[tokio::test(start_paused = true)]
async fn test_command_deadline_reports_timeout() {
    let queue = CommandQueue::new(6000, Duration::from_secs(1));
    queue.start();

    let result = queue
        .submit_extend("cam", async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        })
        .await;
    match result {
        Err(RelayError::CommandTimeout(d)) => assert_eq!(d, Duration::from_secs(1)),
        other => panic!("expected CommandTimeout, got {other:?}"),
    }

    let stats = queue.stats();
    assert_eq!(stats.total_executed, 1);
    assert_eq!(stats.total_failed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_execution_error_propagates_to_caller() {
    let queue = CommandQueue::new(6000, Duration::from_secs(30));
    queue.start();

    let result = queue
        .submit_generate("cam", 2, async {
            Err(RelayError::RateLimited("HTTP 429".into()))
        })
        .await;
    assert!(matches!(result, Err(RelayError::RateLimited(_))));
}

#[tokio::test(start_paused = true)]
async fn test_stop_resolves_every_pending_ticket_once() {
    // Worker intentionally not started: everything stays enqueued.
    let queue = CommandQueue::new(1, Duration::from_secs(30));

    let mut handles = Vec::new();
    for i in 0..8 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            if i % 2 == 0 {
                queue.submit_extend("cam", async { Ok(()) }).await
            } else {
                queue.submit_generate("cam", 0, async { Ok(()) }).await
            }
        }));
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    queue.stop().await;

    for handle in handles {
        let result = handle.await.expect("join");
        assert!(matches!(result, Err(RelayError::QueueClosed)));
    }

    let stats = queue.stats();
    assert_eq!(stats.depth, 0);
    assert_eq!(stats.total_enqueued, 8);
    assert_eq!(stats.total_failed, 8, "each cancelled ticket is accounted");
    assert_eq!(stats.total_executed, 0);

    // Submissions after stop are refused outright.
    let late = queue.submit_extend("cam", async { Ok(()) }).await;
    assert!(matches!(late, Err(RelayError::QueueClosed)));
}

#[tokio::test(start_paused = true)]
async fn test_stats_counts_by_kind_and_tracks_wait() {
    let queue = CommandQueue::new(600, Duration::from_secs(30));
    queue.start();

    let mut handles = Vec::new();
    for _ in 0..3 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            queue.submit_extend("cam", async { Ok(()) }).await
        }));
    }
    for _ in 0..2 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            queue.submit_generate("cam", 1, async { Ok(()) }).await
        }));
    }
    for handle in handles {
        handle.await.expect("join").expect("command result");
    }

    let stats = queue.stats();
    assert_eq!(stats.extend_count, 3);
    assert_eq!(stats.generate_count, 2);
    assert_eq!(stats.total_enqueued, 5);
    assert_eq!(stats.total_executed, 5);
    assert_eq!(stats.total_failed, 0);
    // Everything queued behind a 100 ms-interval gate: waits are non-zero.
    assert!(stats.avg_wait_ms > 0.0);
}

// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Pacer tests on the paused clock: burst smoothing, delay clamping,
//! catch-up, wrap handling, and FIFO ordering.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;

use camrelay::media::pacer::{Pacer, PacerConfig};
use camrelay::media::AccessUnit;
use camrelay::stats::PipelineStats;

fn unit(seq: u8, rtp_timestamp: u32) -> AccessUnit {
    AccessUnit {
        data: Bytes::from(vec![seq]),
        rtp_timestamp,
        is_keyframe: false,
    }
}

fn config(capacity: usize, catchup_threshold: usize) -> PacerConfig {
    PacerConfig {
        capacity,
        catchup_threshold,
        catchup_multiplier: 1.1,
        max_delay: Duration::from_millis(200),
        clock_rate: 90_000,
    }
}

type SendLog = Arc<Mutex<Vec<(u8, Instant)>>>;

fn spawn_pacer(
    cfg: PacerConfig,
    stats: Arc<PipelineStats>,
    shutdown: watch::Receiver<bool>,
) -> (Pacer, SendLog, tokio::task::JoinHandle<()>) {
    let log: SendLog = Arc::new(Mutex::new(Vec::new()));
    let log2 = log.clone();
    let (pacer, handle) = Pacer::spawn("video", cfg, stats, shutdown, move |u: AccessUnit| {
        let log = log2.clone();
        async move {
            log.lock().push((u.data[0], Instant::now()));
            Ok(())
        }
    });
    (pacer, log, handle)
}

async fn wait_for_sends(log: &SendLog, n: usize) {
    for _ in 0..10_000 {
        if log.lock().len() >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("timed out waiting for {n} sends (got {})", log.lock().len());
}

#[tokio::test(start_paused = true)]
async fn test_burst_restored_to_frame_spacing() {
    // 10 frames, 3000 ticks apart at 90 kHz = 33.3 ms nominal spacing,
    // enqueued back-to-back. Catch-up disabled so spacing is exact.
    let stats = Arc::new(PipelineStats::new());
    let (_keep, shutdown) = watch::channel(false);
    let (pacer, log, _handle) = spawn_pacer(config(10, 100), stats.clone(), shutdown);

    for i in 0..10u8 {
        pacer.enqueue(unit(i, 1000 + i as u32 * 3000)).await.expect("enqueue");
    }
    wait_for_sends(&log, 10).await;

    let entries = log.lock().clone();
    // First frame forwarded immediately, the rest restored to ~33.3 ms.
    for pair in entries.windows(2) {
        let gap = pair[1].1 - pair[0].1;
        assert!(
            gap >= Duration::from_micros(33_200) && gap <= Duration::from_micros(33_500),
            "inter-send gap {gap:?} outside nominal spacing"
        );
    }
    assert_eq!(stats.catchup_events.load(Ordering::Relaxed), 0);
}

#[tokio::test(start_paused = true)]
async fn test_fifo_order_preserved() {
    let stats = Arc::new(PipelineStats::new());
    let (_keep, shutdown) = watch::channel(false);
    let (pacer, log, _handle) = spawn_pacer(config(10, 100), stats, shutdown);

    for i in 0..10u8 {
        pacer.enqueue(unit(i, i as u32 * 3000)).await.expect("enqueue");
    }
    wait_for_sends(&log, 10).await;

    let order: Vec<u8> = log.lock().iter().map(|(seq, _)| *seq).collect();
    assert_eq!(order, (0..10u8).collect::<Vec<_>>());
}

#[tokio::test(start_paused = true)]
async fn test_full_channel_blocks_and_counts_bursts() {
    let stats = Arc::new(PipelineStats::new());
    let (_keep, shutdown) = watch::channel(false);
    let (pacer, log, _handle) = spawn_pacer(config(4, 100), stats.clone(), shutdown);

    // 12 frames through a 4-deep channel: enqueue must block rather than
    // drop, and the blocks are accounted as absorbed bursts.
    for i in 0..12u8 {
        pacer.enqueue(unit(i, i as u32 * 3000)).await.expect("enqueue");
    }
    wait_for_sends(&log, 12).await;

    assert_eq!(log.lock().len(), 12, "nothing dropped");
    assert!(
        stats.bursts_absorbed.load(Ordering::Relaxed) >= 1,
        "full channel must count as an absorbed burst"
    );
}

#[tokio::test(start_paused = true)]
async fn test_catchup_when_queue_deep() {
    let stats = Arc::new(PipelineStats::new());
    let (_keep, shutdown) = watch::channel(false);
    // Catch-up from depth 2.
    let (pacer, log, _handle) = spawn_pacer(config(10, 2), stats.clone(), shutdown);

    for i in 0..10u8 {
        pacer.enqueue(unit(i, i as u32 * 3000)).await.expect("enqueue");
    }
    wait_for_sends(&log, 10).await;

    assert!(
        stats.catchup_events.load(Ordering::Relaxed) > 0,
        "deep queue must trigger catch-up"
    );
    // Catch-up divides the delay, so at least one gap lands below nominal.
    let entries = log.lock().clone();
    let accelerated = entries
        .windows(2)
        .any(|p| (p[1].1 - p[0].1) < Duration::from_micros(33_000));
    assert!(accelerated, "expected at least one accelerated gap");
}

#[tokio::test(start_paused = true)]
async fn test_anomalous_delay_clamped() {
    let stats = Arc::new(PipelineStats::new());
    let (_keep, shutdown) = watch::channel(false);
    let (pacer, log, _handle) = spawn_pacer(config(10, 100), stats, shutdown);

    // 90 000 ticks = one full second of nominal delay; the cap is 200 ms.
    pacer.enqueue(unit(0, 0)).await.expect("enqueue");
    pacer.enqueue(unit(1, 90_000)).await.expect("enqueue");
    wait_for_sends(&log, 2).await;

    let entries = log.lock().clone();
    let gap = entries[1].1 - entries[0].1;
    assert!(
        gap >= Duration::from_millis(195) && gap <= Duration::from_millis(205),
        "anomalous delay must clamp to the cap, got {gap:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn test_wrapped_timestamp_is_a_short_delta() {
    let stats = Arc::new(PipelineStats::new());
    let (_keep, shutdown) = watch::channel(false);
    let (pacer, log, _handle) = spawn_pacer(config(10, 100), stats, shutdown);

    // 0xFFFF_FFF0 → 0x10 wraps to a 32-tick delta (~0.36 ms), not a huge
    // negative jump.
    pacer.enqueue(unit(0, 0xFFFF_FFF0)).await.expect("enqueue");
    pacer.enqueue(unit(1, 0x0000_0010)).await.expect("enqueue");
    wait_for_sends(&log, 2).await;

    let entries = log.lock().clone();
    let gap = entries[1].1 - entries[0].1;
    assert!(gap <= Duration::from_millis(5), "wrap delta should be tiny, got {gap:?}");
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_drain() {
    let stats = Arc::new(PipelineStats::new());
    let (stop, shutdown) = watch::channel(false);
    let (pacer, log, handle) = spawn_pacer(config(10, 100), stats, shutdown);

    pacer.enqueue(unit(0, 0)).await.expect("enqueue");
    wait_for_sends(&log, 1).await;

    stop.send(true).expect("signal");
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("drain exits promptly")
        .expect("no panic");
}

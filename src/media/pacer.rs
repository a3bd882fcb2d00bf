// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Leaky-bucket output pacer.
//!
//! RTSP over TCP delivers media in bursts; the pacer restores the
//! inter-frame spacing the RTP timestamps imply before frames hit the peer
//! connection. One bounded channel and one drain task per track: a full
//! channel blocks the ingest task (deliberate backpressure), and a deep
//! queue switches the drain into catch-up so latency stays bounded.

use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{RelayError, Result};
use crate::stats::PipelineStats;

use super::AccessUnit;

#[derive(Debug, Clone)]
pub struct PacerConfig {
    pub capacity: usize,
    pub catchup_threshold: usize,
    pub catchup_multiplier: f64,
    pub max_delay: Duration,
    pub clock_rate: u32,
}

/// Enqueue side of one paced track.
pub struct Pacer {
    tx: mpsc::Sender<AccessUnit>,
    stats: Arc<PipelineStats>,
}

impl Pacer {
    /// Spawn the drain task for one track. `write` is called once per access
    /// unit, in FIFO order, after the pacing delay.
    pub fn spawn<F, Fut>(
        label: &'static str,
        cfg: PacerConfig,
        stats: Arc<PipelineStats>,
        shutdown: watch::Receiver<bool>,
        write: F,
    ) -> (Pacer, JoinHandle<()>)
    where
        F: FnMut(AccessUnit) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(cfg.capacity.max(1));
        let drain_stats = stats.clone();
        let handle = tokio::spawn(async move {
            drain_loop(label, cfg, drain_stats, rx, shutdown, write).await;
        });
        (Pacer { tx, stats }, handle)
    }

    /// Hand one access unit to the drain task. Blocks when the channel is
    /// full, which backpressures the RTSP reader; each such block counts as
    /// an absorbed burst.
    pub async fn enqueue(&self, unit: AccessUnit) -> Result<()> {
        if self.tx.capacity() == 0 {
            self.stats.bursts_absorbed.fetch_add(1, Ordering::Relaxed);
        }
        self.tx
            .send(unit)
            .await
            .map_err(|_| RelayError::UpstreamDisconnect("pacer channel closed".into()))
    }
}

async fn drain_loop<F, Fut>(
    label: &'static str,
    cfg: PacerConfig,
    stats: Arc<PipelineStats>,
    mut rx: mpsc::Receiver<AccessUnit>,
    mut shutdown: watch::Receiver<bool>,
    mut write: F,
) where
    F: FnMut(AccessUnit) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let mut last: Option<(u32, Instant)> = None;

    loop {
        let unit = tokio::select! {
            _ = shutdown.changed() => return,
            item = rx.recv() => match item {
                Some(unit) => unit,
                None => return,
            },
        };

        if let Some((last_ts, last_sent_at)) = last {
            let ticks = wrapped_delta(last_ts, unit.rtp_timestamp);
            let ideal = Duration::from_secs_f64(ticks as f64 / cfg.clock_rate.max(1) as f64);
            let mut delay = ideal.saturating_sub(last_sent_at.elapsed());

            if delay > cfg.max_delay {
                // A jump this large is a clock anomaly, not real spacing.
                debug!(
                    track = label,
                    delay_ms = delay.as_millis() as u64,
                    cap_ms = cfg.max_delay.as_millis() as u64,
                    "Clamping pacer delay"
                );
                delay = cfg.max_delay;
            }
            if rx.len() >= cfg.catchup_threshold {
                delay = delay.div_f64(cfg.catchup_multiplier);
                stats.catchup_events.fetch_add(1, Ordering::Relaxed);
            }
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => return,
                }
            }
        }

        let ts = unit.rtp_timestamp;
        if let Err(e) = write(unit).await {
            debug!(track = label, error = %e, "Paced write failed");
        }
        last = Some((ts, Instant::now()));
    }
}

/// Delta between two 32-bit RTP timestamps, wrap-aware.
pub fn wrapped_delta(last: u32, current: u32) -> u64 {
    if current >= last {
        (current - last) as u64
    } else {
        (0xFFFF_FFFF - last) as u64 + current as u64 + 1
    }
}

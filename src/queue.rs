// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Rate-limited priority command queue.
//!
//! Every control-plane call in the relay goes through this queue: a single
//! worker pops the highest-priority ticket, waits for a token from the rate
//! gate, and runs the command under a bounded deadline. Keep-alive (Extend)
//! always dispatches before recovery (Generate); ties break FIFO.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{RelayError, Result};

/// Priority class of a control-plane command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Keep-alive for a live lease. Dispatched first.
    Extend,
    /// (Re)creation of a lease for a failed or starting camera.
    Generate,
}

impl CommandKind {
    fn rank(self) -> u8 {
        match self {
            CommandKind::Extend => 0,
            CommandKind::Generate => 1,
        }
    }
}

type CommandFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// One enqueued command. Owned by the heap until popped, then by the worker
/// until the sink has been signaled exactly once.
struct Ticket {
    kind: CommandKind,
    camera_id: String,
    attempt: u32,
    seq: u64,
    enqueued_at: Instant,
    execute: CommandFuture,
    sink: oneshot::Sender<Result<()>>,
}

// BinaryHeap is a max-heap; order tickets so the "largest" is the lowest
// (rank, seq) pair: strict priority, FIFO within a rank.
impl PartialEq for Ticket {
    fn eq(&self, other: &Self) -> bool {
        self.kind.rank() == other.kind.rank() && self.seq == other.seq
    }
}
impl Eq for Ticket {}
impl PartialOrd for Ticket {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for Ticket {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.kind.rank(), other.seq).cmp(&(self.kind.rank(), self.seq))
    }
}

/// Token bucket with burst = 1: permits are spaced exactly one interval
/// apart, so the per-minute budget is never front-loaded. The bucket starts
/// empty (the first permit matures one interval after the gate is armed),
/// which keeps cold-start traffic as smooth as steady-state traffic.
struct RateGate {
    interval: Duration,
    next: Mutex<Option<Instant>>,
}

impl RateGate {
    fn new(per_minute: u32) -> Self {
        RateGate {
            interval: Duration::from_secs_f64(60.0 / per_minute.max(1) as f64),
            next: Mutex::new(None),
        }
    }

    /// Acquire one permit, sleeping until it is due.
    async fn acquire(&self) {
        let wait = {
            let mut next = self.next.lock();
            let now = Instant::now();
            let due = next.unwrap_or(now + self.interval).max(now);
            *next = Some(due + self.interval);
            due.saturating_duration_since(now)
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Default)]
struct Counters {
    total_enqueued: AtomicU64,
    total_executed: AtomicU64,
    total_failed: AtomicU64,
    extend_count: AtomicU64,
    generate_count: AtomicU64,
    // Exponential moving average of enqueue-to-dispatch wait, microseconds.
    avg_wait_micros: AtomicU64,
}

struct QueueState {
    heap: BinaryHeap<Ticket>,
    closed: bool,
    next_seq: u64,
}

struct QueueInner {
    state: Mutex<QueueState>,
    notify: Notify,
    gate: RateGate,
    rpc_timeout: Duration,
    counters: Counters,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Snapshot of queue accounting. `total_failed` includes commands cancelled
/// by shutdown; executed and failed are therefore not disjoint with
/// enqueued, but every enqueued ticket is resolved exactly once.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub depth: usize,
    pub total_enqueued: u64,
    pub total_executed: u64,
    pub total_failed: u64,
    pub extend_count: u64,
    pub generate_count: u64,
    pub avg_wait_ms: f64,
}

/// The shared command queue. Cheap to clone.
#[derive(Clone)]
pub struct CommandQueue {
    inner: Arc<QueueInner>,
}

impl CommandQueue {
    pub fn new(qpm: u32, rpc_timeout: Duration) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        CommandQueue {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    heap: BinaryHeap::new(),
                    closed: false,
                    next_seq: 0,
                }),
                notify: Notify::new(),
                gate: RateGate::new(qpm),
                rpc_timeout,
                counters: Counters::default(),
                shutdown_tx,
                worker: Mutex::new(None),
            }),
        }
    }

    /// Launch the single dispatch worker.
    pub fn start(&self) {
        let mut slot = self.inner.worker.lock();
        if slot.is_some() {
            return;
        }
        let inner = self.inner.clone();
        let shutdown_rx = self.inner.shutdown_tx.subscribe();
        *slot = Some(tokio::spawn(async move {
            worker_loop(inner, shutdown_rx).await;
        }));
        info!("Command queue worker started");
    }

    /// Submit a keep-alive command and block until it has run (or the queue
    /// shut down). Returns the command's own error on failure.
    pub async fn submit_extend<F>(&self, camera_id: &str, fut: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.submit(CommandKind::Extend, camera_id, 0, Box::pin(fut)).await
    }

    /// Submit a lease (re)generation command; lower priority than Extend.
    pub async fn submit_generate<F>(&self, camera_id: &str, attempt: u32, fut: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.submit(CommandKind::Generate, camera_id, attempt, Box::pin(fut)).await
    }

    async fn submit(
        &self,
        kind: CommandKind,
        camera_id: &str,
        attempt: u32,
        execute: CommandFuture,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(RelayError::QueueClosed);
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.heap.push(Ticket {
                kind,
                camera_id: camera_id.to_string(),
                attempt,
                seq,
                enqueued_at: Instant::now(),
                execute,
                sink: tx,
            });
        }
        self.inner.counters.total_enqueued.fetch_add(1, Ordering::Relaxed);
        match kind {
            CommandKind::Extend => {
                self.inner.counters.extend_count.fetch_add(1, Ordering::Relaxed)
            }
            CommandKind::Generate => {
                self.inner.counters.generate_count.fetch_add(1, Ordering::Relaxed)
            }
        };
        self.inner.notify.notify_one();
        rx.await.map_err(|_| RelayError::QueueClosed)?
    }

    /// Shut the queue down, cancelling every pending ticket with
    /// [`RelayError::QueueClosed`]. Idempotent.
    pub async fn stop(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        self.inner.notify.notify_one();
        let handle = self.inner.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        } else {
            // Never started; cancel whatever was enqueued.
            drain_pending(&self.inner);
        }
        info!("Command queue stopped");
    }

    pub fn stats(&self) -> QueueStats {
        let depth = self.inner.state.lock().heap.len();
        let c = &self.inner.counters;
        QueueStats {
            depth,
            total_enqueued: c.total_enqueued.load(Ordering::Relaxed),
            total_executed: c.total_executed.load(Ordering::Relaxed),
            total_failed: c.total_failed.load(Ordering::Relaxed),
            extend_count: c.extend_count.load(Ordering::Relaxed),
            generate_count: c.generate_count.load(Ordering::Relaxed),
            avg_wait_ms: c.avg_wait_micros.load(Ordering::Relaxed) as f64 / 1000.0,
        }
    }
}

async fn worker_loop(inner: Arc<QueueInner>, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            drain_pending(&inner);
            return;
        }

        if inner.state.lock().heap.is_empty() {
            tokio::select! {
                _ = inner.notify.notified() => {}
                _ = shutdown.changed() => {}
            }
            continue;
        }

        // Acquire the permit first, then pop: tickets that arrive while the
        // permit matures still compete on priority, so a fresh Extend beats
        // a Generate that has been waiting longer.
        tokio::select! {
            _ = inner.gate.acquire() => {}
            _ = shutdown.changed() => {
                drain_pending(&inner);
                return;
            }
        }

        let popped = inner.state.lock().heap.pop();
        let Some(ticket) = popped else { continue };
        dispatch(&inner, ticket).await;
    }
}

async fn dispatch(inner: &Arc<QueueInner>, ticket: Ticket) {
    let waited = ticket.enqueued_at.elapsed();
    update_avg_wait(&inner.counters, waited);

    debug!(
        camera = ticket.camera_id,
        kind = ?ticket.kind,
        attempt = ticket.attempt,
        waited_ms = waited.as_millis() as u64,
        "Dispatching command"
    );

    let result = match tokio::time::timeout(inner.rpc_timeout, ticket.execute).await {
        Ok(r) => r,
        Err(_) => {
            warn!(
                camera = ticket.camera_id,
                kind = ?ticket.kind,
                timeout_s = inner.rpc_timeout.as_secs(),
                "Command deadline expired"
            );
            Err(RelayError::CommandTimeout(inner.rpc_timeout))
        }
    };

    inner.counters.total_executed.fetch_add(1, Ordering::Relaxed);
    if result.is_err() {
        inner.counters.total_failed.fetch_add(1, Ordering::Relaxed);
    }
    // Receiver may have given up (caller cancelled); the ticket is still
    // accounted for.
    let _ = ticket.sink.send(result);
}

fn drain_pending(inner: &Arc<QueueInner>) {
    let mut state = inner.state.lock();
    state.closed = true;
    let mut cancelled = 0u64;
    while let Some(ticket) = state.heap.pop() {
        let _ = ticket.sink.send(Err(RelayError::QueueClosed));
        cancelled += 1;
    }
    drop(state);
    if cancelled > 0 {
        inner.counters.total_failed.fetch_add(cancelled, Ordering::Relaxed);
        info!(cancelled, "Cancelled pending commands on shutdown");
    }
}

fn update_avg_wait(counters: &Counters, sample: Duration) {
    let sample_us = sample.as_micros() as i64;
    let old = counters.avg_wait_micros.load(Ordering::Relaxed) as i64;
    // EMA with weight 1/10; the worker is the only writer.
    let new = if old == 0 { sample_us } else { old + (sample_us - old) / 10 };
    counters.avg_wait_micros.store(new.max(0) as u64, Ordering::Relaxed);
}

// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Per-camera stream lifecycle.
//!
//! Each camera owns at most one short-lived upstream lease. A monitor loop
//! keeps healthy leases extended ahead of expiry; a per-camera recovery loop
//! regenerates lost leases with capped exponential backoff, degrading to a
//! slow fixed retry after repeated failures. All provider traffic flows
//! through the [`CommandQueue`] so keep-alives are never starved by
//! recoveries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::config::RelayTuning;
use crate::error::{RelayError, Result};
use crate::provider::{self, ControlPlane, LeaseExtension};
use crate::queue::CommandQueue;

/// A time-bounded right to one upstream stream URL.
///
/// Created by Generate, mutated only by Extend, destroyed by Stop or when a
/// successor lease is issued for the same camera.
#[derive(Debug, Clone)]
pub struct StreamLease {
    pub camera_id: String,
    pub stream_url: String,
    pub extension_token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl StreamLease {
    pub fn time_until_expiry(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CameraState {
    /// Initial Generate in flight.
    Starting,
    /// Lease valid; monitor keeps it extended.
    Running,
    /// Lease lost; recovery backoff in progress.
    Failed,
    /// Too many consecutive failures; slow fixed-interval retry.
    Degraded,
    /// Terminal until an explicit restart.
    Stopped,
}

/// Mutable per-camera record. Owned exclusively by the supervisor; every
/// mutation goes through [`CameraSlot::update`] under the record lock, which
/// serializes transitions per camera.
#[derive(Debug)]
pub struct CameraRecord {
    pub camera_id: String,
    pub state: CameraState,
    pub lease: Option<StreamLease>,
    pub failure_count: u32,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_extension_at: Option<DateTime<Utc>>,
    /// At most one in-flight control-plane intent per camera.
    intent_in_flight: bool,
    /// A recovery loop exists for this camera.
    recovery_active: bool,
}

pub(crate) struct CameraSlot {
    record: Mutex<CameraRecord>,
}

impl CameraSlot {
    fn new(camera_id: &str) -> Self {
        CameraSlot {
            record: Mutex::new(CameraRecord {
                camera_id: camera_id.to_string(),
                state: CameraState::Starting,
                lease: None,
                failure_count: 0,
                last_error: None,
                last_attempt_at: None,
                last_extension_at: None,
                intent_in_flight: false,
                recovery_active: false,
            }),
        }
    }

    /// The single guarded mutation point for a camera record.
    fn update<R>(&self, f: impl FnOnce(&mut CameraRecord) -> R) -> R {
        let mut record = self.record.lock();
        f(&mut record)
    }
}

/// One row of `status()` output.
#[derive(Debug, Clone, Serialize)]
pub struct CameraStatus {
    pub camera_id: String,
    pub state: CameraState,
    pub failure_count: u32,
    pub last_error: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub time_until_expiry_secs: Option<i64>,
}

struct SupervisorInner {
    queue: CommandQueue,
    provider: Arc<dyn ControlPlane>,
    tuning: RelayTuning,
    records: RwLock<HashMap<String, Arc<CameraSlot>>>,
    shutdown_tx: watch::Sender<bool>,
    monitor_started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Fleet-wide lifecycle supervisor. Cheap to clone.
#[derive(Clone)]
pub struct StreamSupervisor {
    inner: Arc<SupervisorInner>,
}

impl StreamSupervisor {
    pub fn new(queue: CommandQueue, provider: Arc<dyn ControlPlane>, tuning: RelayTuning) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        StreamSupervisor {
            inner: Arc::new(SupervisorInner {
                queue,
                provider,
                tuning,
                records: RwLock::new(HashMap::new()),
                shutdown_tx,
                monitor_started: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Begin bring-up for a set of cameras. Initial Generates are staggered
    /// so they do not burst the rate limiter. Cameras already known and not
    /// Stopped are left alone; Stopped cameras are restarted.
    pub fn start_cameras(&self, ids: &[String]) {
        let mut fresh = Vec::new();
        {
            let mut records = self.inner.records.write();
            for id in ids {
                match records.get(id) {
                    Some(slot) => {
                        let restarted = slot.update(|r| {
                            if r.state == CameraState::Stopped {
                                r.state = CameraState::Starting;
                                r.failure_count = 0;
                                r.last_error = None;
                                r.lease = None;
                                true
                            } else {
                                false
                            }
                        });
                        if restarted {
                            fresh.push(id.clone());
                        }
                    }
                    None => {
                        records.insert(id.clone(), Arc::new(CameraSlot::new(id)));
                        fresh.push(id.clone());
                    }
                }
            }
        }

        if self
            .inner
            .monitor_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let inner = self.inner.clone();
            let handle = tokio::spawn(async move { monitor_loop(inner).await });
            self.inner.tasks.lock().push(handle);
        }

        if fresh.is_empty() {
            return;
        }
        info!(cameras = fresh.len(), stagger_s = self.inner.tuning.stagger_secs, "Starting cameras");
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move { bring_up(inner, fresh).await });
        self.inner.tasks.lock().push(handle);
    }

    /// Current lease for a camera, if it is Running.
    pub fn stream(&self, camera_id: &str) -> Option<StreamLease> {
        let slot = self.inner.records.read().get(camera_id).cloned()?;
        slot.update(|r| {
            if r.state == CameraState::Running {
                r.lease.clone()
            } else {
                None
            }
        })
    }

    /// All cameras currently Running, with their leases.
    pub fn running(&self) -> Vec<StreamLease> {
        let slots: Vec<_> = self.inner.records.read().values().cloned().collect();
        slots
            .iter()
            .filter_map(|slot| {
                slot.update(|r| {
                    if r.state == CameraState::Running {
                        r.lease.clone()
                    } else {
                        None
                    }
                })
            })
            .collect()
    }

    pub fn status(&self) -> Vec<CameraStatus> {
        let now = Utc::now();
        let mut slots: Vec<_> = self.inner.records.read().values().cloned().collect();
        slots.sort_by(|a, b| a.update(|r| r.camera_id.clone()).cmp(&b.update(|r| r.camera_id.clone())));
        slots
            .iter()
            .map(|slot| {
                slot.update(|r| CameraStatus {
                    camera_id: r.camera_id.clone(),
                    state: r.state,
                    failure_count: r.failure_count,
                    last_error: r.last_error.clone(),
                    expires_at: r.lease.as_ref().map(|l| l.expires_at),
                    time_until_expiry_secs: r
                        .lease
                        .as_ref()
                        .map(|l| (l.expires_at - now).num_seconds()),
                })
            })
            .collect()
    }

    /// Transition every camera to Stopped, tear leases down best-effort, and
    /// cancel the monitor and recovery workers.
    pub async fn stop(&self) {
        let _ = self.inner.shutdown_tx.send(true);

        let mut teardowns = Vec::new();
        {
            let slots: Vec<_> = self.inner.records.read().values().cloned().collect();
            for slot in slots {
                let lease = slot.update(|r| {
                    let lease = r.lease.take();
                    r.state = CameraState::Stopped;
                    lease
                });
                if let Some(lease) = lease {
                    teardowns.push(lease);
                }
            }
        }

        // Best-effort provider Stop for every live lease, bounded so a
        // saturated queue cannot stall shutdown.
        let mut join = JoinSet::new();
        for lease in teardowns {
            let inner = self.inner.clone();
            join.spawn(async move {
                let provider = inner.provider.clone();
                let camera_id = lease.camera_id.clone();
                let token = lease.extension_token.clone();
                let result = inner
                    .queue
                    .submit_extend(&lease.camera_id, async move {
                        provider::stop_stream(provider.as_ref(), &camera_id, &token).await
                    })
                    .await;
                if let Err(e) = result {
                    debug!(camera = lease.camera_id, error = %e, "Stream stop skipped");
                }
            });
        }
        let timed_out = tokio::time::timeout(Duration::from_secs(15), async {
            while join.join_next().await.is_some() {}
        })
        .await
        .is_err();
        if timed_out {
            warn!("Provider stream teardown timed out, continuing shutdown");
            join.abort_all();
        }

        let handles: Vec<_> = self.inner.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("Stream supervisor stopped");
    }

    /// Accounting snapshot of the underlying command queue.
    pub fn queue_stats(&self) -> crate::queue::QueueStats {
        self.inner.queue.stats()
    }
}

fn slot_of(inner: &SupervisorInner, camera_id: &str) -> Option<Arc<CameraSlot>> {
    inner.records.read().get(camera_id).cloned()
}

async fn bring_up(inner: Arc<SupervisorInner>, ids: Vec<String>) {
    let mut shutdown = inner.shutdown_tx.subscribe();
    let stagger = inner.tuning.stagger();
    for (i, id) in ids.iter().enumerate() {
        if *shutdown.borrow() {
            return;
        }
        if i > 0 {
            tokio::select! {
                _ = tokio::time::sleep(stagger) => {}
                _ = shutdown.changed() => return,
            }
        }
        let Some(slot) = slot_of(&inner, id) else { continue };
        let claimed = slot.update(|r| {
            if r.state == CameraState::Starting && !r.intent_in_flight {
                r.intent_in_flight = true;
                r.last_attempt_at = Some(Utc::now());
                true
            } else {
                false
            }
        });
        if !claimed {
            continue;
        }
        let inner2 = inner.clone();
        let id2 = id.clone();
        tokio::spawn(async move {
            let outcome = run_generate(&inner2, &id2, 0).await;
            apply_generate_outcome(&inner2, &id2, outcome);
        });
    }
}

/// Submit one Generate through the queue and return the issued lease.
async fn run_generate(
    inner: &Arc<SupervisorInner>,
    camera_id: &str,
    attempt: u32,
) -> Result<StreamLease> {
    let issued: Arc<Mutex<Option<StreamLease>>> = Arc::new(Mutex::new(None));
    let provider = inner.provider.clone();
    let cam = camera_id.to_string();
    let out = issued.clone();
    inner
        .queue
        .submit_generate(camera_id, attempt, async move {
            let lease = provider::generate_stream(provider.as_ref(), &cam).await?;
            *out.lock() = Some(lease);
            Ok(())
        })
        .await?;
    let result = issued
        .lock()
        .take()
        .ok_or_else(|| RelayError::Fatal("generate succeeded without a lease".into()));
    result
}

/// Apply a Generate result to the record and kick recovery if needed.
fn apply_generate_outcome(
    inner: &Arc<SupervisorInner>,
    camera_id: &str,
    outcome: Result<StreamLease>,
) {
    let Some(slot) = slot_of(inner, camera_id) else { return };
    match outcome {
        Ok(lease) => {
            let accepted = slot.update(|r| {
                r.intent_in_flight = false;
                if r.state == CameraState::Stopped {
                    return false;
                }
                info!(
                    camera = r.camera_id,
                    expires_at = %lease.expires_at,
                    "Stream lease issued"
                );
                r.lease = Some(lease);
                r.state = CameraState::Running;
                r.failure_count = 0;
                r.last_error = None;
                true
            });
            if !accepted {
                debug!(camera = camera_id, "Lease issued after stop, discarded");
            }
        }
        Err(RelayError::QueueClosed) => {
            slot.update(|r| r.intent_in_flight = false);
        }
        Err(e) => {
            let spawn_recovery = slot.update(|r| {
                r.intent_in_flight = false;
                if r.state == CameraState::Stopped {
                    return false;
                }
                r.failure_count += 1;
                r.last_error = Some(e.to_string());
                warn!(
                    camera = r.camera_id,
                    failures = r.failure_count,
                    error = %e,
                    "Stream generate failed"
                );
                if r.state != CameraState::Degraded {
                    r.state = if r.failure_count >= inner.tuning.max_failures {
                        CameraState::Degraded
                    } else {
                        CameraState::Failed
                    };
                }
                true
            });
            if spawn_recovery {
                ensure_recovery(inner, camera_id);
            }
        }
    }
}

/// Monitor loop: one task for the whole fleet, ticking every few seconds and
/// submitting Extends as leases approach expiry.
async fn monitor_loop(inner: Arc<SupervisorInner>) {
    let mut shutdown = inner.shutdown_tx.subscribe();
    let tick = inner.tuning.monitor_tick();
    let horizon = inner.tuning.extend_horizon();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(tick) => {}
            _ = shutdown.changed() => return,
        }

        let slots: Vec<(String, Arc<CameraSlot>)> = inner
            .records
            .read()
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();

        for (camera_id, slot) in slots {
            enum Intent {
                None,
                Extend(String),
                ExpiredInPlace,
            }
            let intent = slot.update(|r| {
                if r.state != CameraState::Running || r.intent_in_flight {
                    return Intent::None;
                }
                let Some(lease) = r.lease.as_ref() else {
                    return Intent::None;
                };
                let now = Utc::now();
                if lease.expires_at <= now {
                    // Too late to extend; fail in place and let recovery
                    // generate a successor.
                    r.state = CameraState::Failed;
                    r.failure_count += 1;
                    r.last_error = Some("lease expired before extension".into());
                    return Intent::ExpiredInPlace;
                }
                if lease.time_until_expiry(now) < horizon {
                    r.intent_in_flight = true;
                    r.last_attempt_at = Some(now);
                    return Intent::Extend(lease.extension_token.clone());
                }
                Intent::None
            });

            match intent {
                Intent::None => {}
                Intent::ExpiredInPlace => {
                    warn!(camera = camera_id, "Lease expired before extension");
                    ensure_recovery(&inner, &camera_id);
                }
                Intent::Extend(token) => {
                    let inner2 = inner.clone();
                    let id2 = camera_id.clone();
                    tokio::spawn(async move {
                        run_extend(&inner2, &id2, token).await;
                    });
                }
            }
        }
    }
}

/// Submit one Extend through the queue and apply the outcome.
async fn run_extend(inner: &Arc<SupervisorInner>, camera_id: &str, token: String) {
    let extension: Arc<Mutex<Option<LeaseExtension>>> = Arc::new(Mutex::new(None));
    let provider = inner.provider.clone();
    let cam = camera_id.to_string();
    let out = extension.clone();
    let result = inner
        .queue
        .submit_extend(camera_id, async move {
            let ext = provider::extend_stream(provider.as_ref(), &cam, &token).await?;
            *out.lock() = Some(ext);
            Ok(())
        })
        .await;

    let Some(slot) = slot_of(inner, camera_id) else { return };
    match result {
        Ok(()) => {
            let ext = extension.lock().take();
            slot.update(|r| {
                r.intent_in_flight = false;
                if r.state != CameraState::Running {
                    return;
                }
                if let (Some(lease), Some(ext)) = (r.lease.as_mut(), ext) {
                    debug!(
                        camera = r.camera_id,
                        expires_at = %ext.expires_at,
                        "Stream lease extended"
                    );
                    lease.extension_token = ext.extension_token;
                    lease.expires_at = ext.expires_at;
                    r.last_extension_at = Some(Utc::now());
                    r.failure_count = 0;
                    r.last_error = None;
                }
            });
        }
        Err(RelayError::QueueClosed) => {
            slot.update(|r| r.intent_in_flight = false);
        }
        Err(e @ RelayError::LeaseExpired(_)) => {
            slot.update(|r| {
                r.intent_in_flight = false;
                if r.state != CameraState::Running {
                    return;
                }
                warn!(camera = r.camera_id, error = %e, "Lease gone, regenerating");
                r.state = CameraState::Failed;
                r.failure_count += 1;
                r.last_error = Some(e.to_string());
            });
            ensure_recovery(inner, camera_id);
        }
        Err(e) => {
            // Transient (including rate-limit and timeout): stay Running and
            // retry on the next monitor tick while the lease is still valid.
            slot.update(|r| {
                r.intent_in_flight = false;
                if r.state != CameraState::Running {
                    return;
                }
                r.failure_count += 1;
                r.last_error = Some(e.to_string());
                warn!(
                    camera = r.camera_id,
                    failures = r.failure_count,
                    error = %e,
                    "Lease extension failed, will retry"
                );
            });
        }
    }
}

/// Spawn the per-camera recovery loop unless one is already active.
fn ensure_recovery(inner: &Arc<SupervisorInner>, camera_id: &str) {
    let Some(slot) = slot_of(inner, camera_id) else { return };
    let spawn = slot.update(|r| {
        if r.recovery_active || r.state == CameraState::Stopped {
            false
        } else {
            r.recovery_active = true;
            true
        }
    });
    if !spawn {
        return;
    }
    let inner2 = inner.clone();
    let id = camera_id.to_string();
    let handle = tokio::spawn(async move {
        recovery_loop(inner2, id).await;
    });
    inner.tasks.lock().push(handle);
}

/// Recovery loop for one camera: capped exponential backoff while Failed, a
/// slow fixed interval while Degraded, exiting once the camera is healthy or
/// stopped.
async fn recovery_loop(inner: Arc<SupervisorInner>, camera_id: String) {
    let mut shutdown = inner.shutdown_tx.subscribe();
    let base = inner.tuning.recovery_base_delay();
    let cap = inner.tuning.recovery_max_delay();

    loop {
        let Some(slot) = slot_of(&inner, &camera_id) else { return };
        let delay = slot.update(|r| match r.state {
            CameraState::Failed => Some(backoff_delay(base, cap, r.failure_count)),
            CameraState::Degraded => Some(inner.tuning.degraded_retry()),
            _ => None,
        });
        let Some(delay) = delay else {
            slot.update(|r| r.recovery_active = false);
            return;
        };

        debug!(camera = camera_id, delay_s = delay.as_secs(), "Recovery backoff");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {
                slot.update(|r| r.recovery_active = false);
                return;
            }
        }

        let attempt = slot.update(|r| {
            if !matches!(r.state, CameraState::Failed | CameraState::Degraded)
                || r.intent_in_flight
            {
                None
            } else {
                r.intent_in_flight = true;
                r.last_attempt_at = Some(Utc::now());
                Some(r.failure_count)
            }
        });
        let Some(attempt) = attempt else {
            // State changed while we slept; re-evaluate (and possibly exit).
            continue;
        };

        let outcome = run_generate(&inner, &camera_id, attempt).await;
        let recovered = matches!(outcome, Ok(_));
        apply_generate_outcome(&inner, &camera_id, outcome);
        if recovered {
            // The monitor may already have failed the fresh lease again;
            // clear the flag and re-arm in the same guarded update so the
            // camera is never left Failed without a recovery worker.
            let rearm = slot.update(|r| {
                r.recovery_active = false;
                matches!(r.state, CameraState::Failed | CameraState::Degraded)
            });
            if rearm {
                ensure_recovery(&inner, &camera_id);
            } else {
                info!(camera = camera_id, "Camera recovered");
            }
            return;
        }
    }
}

/// BaseDelay·2^(failures−1), capped. `failures` is at least 1 when a camera
/// is Failed.
fn backoff_delay(base: Duration, cap: Duration, failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exp).min(cap)
}

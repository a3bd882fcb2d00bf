// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Relay orchestrator: reconciles lifecycle state against running media
//! pipelines.
//!
//! Every reconcile tick, cameras that are Running get a pipeline (bridge →
//! negotiate → wait for Connected → open RTSP → wire packets through the
//! depacketizers and pacers into the bridge), and pipelines whose camera
//! stopped being Running, or whose peer connection or upstream died, are
//! torn down. Pipeline creation is slow, so it never happens under the
//! pipeline-map lock.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bridge::{BridgeConfig, WebRtcBridge};
use crate::config::RelayTuning;
use crate::error::Result;
use crate::lifecycle::{CameraStatus, StreamLease, StreamSupervisor};
use crate::media::aac::AacDepacketizer;
use crate::media::h264::H264Depacketizer;
use crate::media::pacer::{Pacer, PacerConfig};
use crate::queue::QueueStats;
use crate::rtsp::sdp::MediaKind;
use crate::rtsp::{RtspClient, RtspConfig, RtspControl, RtspEvent, RtspReader};
use crate::sfu::SfuApi;
use crate::stats::{PipelineSnapshot, PipelineStats};

struct PipelineHandle {
    camera_id: String,
    stream_url: String,
    shutdown_tx: watch::Sender<bool>,
    /// Exits on upstream I/O error; reconcile watches for that.
    read_task: JoinHandle<()>,
    tasks: Vec<JoinHandle<()>>,
    control: RtspControl,
    bridge: Arc<WebRtcBridge>,
    stats: Arc<PipelineStats>,
}

struct OrchestratorInner {
    supervisor: StreamSupervisor,
    sfu: Arc<dyn SfuApi>,
    tuning: RelayTuning,
    bridge_cfg: BridgeConfig,
    pipelines: Mutex<HashMap<String, PipelineHandle>>,
    /// Cameras with a pipeline creation in progress (created outside the
    /// map lock; this set prevents duplicate creations across ticks).
    creating: Mutex<HashSet<String>>,
    shutdown_tx: watch::Sender<bool>,
    reconcile_task: Mutex<Option<JoinHandle<()>>>,
}

/// Fleet orchestrator. Cheap to clone.
#[derive(Clone)]
pub struct RelayOrchestrator {
    inner: Arc<OrchestratorInner>,
}

/// One row of pipeline status output.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub camera_id: String,
    pub stats: PipelineSnapshot,
}

/// Aggregated status for the HTTP API and CLI.
#[derive(Debug, Clone, Serialize)]
pub struct RelaySnapshot {
    pub cameras: Vec<CameraStatus>,
    pub pipelines: Vec<PipelineStatus>,
    pub queue: QueueStats,
}

impl RelayOrchestrator {
    pub fn new(
        supervisor: StreamSupervisor,
        sfu: Arc<dyn SfuApi>,
        tuning: RelayTuning,
        ice_urls: Vec<String>,
    ) -> Self {
        let bridge_cfg = BridgeConfig {
            ice_urls,
            mtu: tuning.mtu,
            ice_gather_timeout: tuning.ice_gather_timeout(),
        };
        let (shutdown_tx, _) = watch::channel(false);
        RelayOrchestrator {
            inner: Arc::new(OrchestratorInner {
                supervisor,
                sfu,
                tuning,
                bridge_cfg,
                pipelines: Mutex::new(HashMap::new()),
                creating: Mutex::new(HashSet::new()),
                shutdown_tx,
                reconcile_task: Mutex::new(None),
            }),
        }
    }

    /// Launch the reconciliation loop.
    pub fn start(&self) {
        let mut slot = self.inner.reconcile_task.lock();
        if slot.is_some() {
            return;
        }
        let inner = self.inner.clone();
        *slot = Some(tokio::spawn(async move {
            let mut shutdown = inner.shutdown_tx.subscribe();
            let interval = inner.tuning.reconcile_interval();
            loop {
                reconcile(&inner).await;
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => return,
                }
            }
        }));
        info!(
            interval_s = self.inner.tuning.reconcile_secs,
            "Relay orchestrator started"
        );
    }

    pub fn status(&self) -> RelaySnapshot {
        let pipelines = {
            let map = self.inner.pipelines.lock();
            let mut rows: Vec<PipelineStatus> = map
                .values()
                .map(|h| PipelineStatus {
                    camera_id: h.camera_id.clone(),
                    stats: h.stats.snapshot(),
                })
                .collect();
            rows.sort_by(|a, b| a.camera_id.cmp(&b.camera_id));
            rows
        };
        RelaySnapshot {
            cameras: self.inner.supervisor.status(),
            pipelines,
            queue: self.inner.supervisor.queue_stats(),
        }
    }

    /// Stop the reconcile loop and tear every pipeline down.
    pub async fn stop(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        let reconcile = self.inner.reconcile_task.lock().take();
        if let Some(task) = reconcile {
            let _ = task.await;
        }
        let handles: Vec<PipelineHandle> = {
            let mut map = self.inner.pipelines.lock();
            map.drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            stop_pipeline(handle, "relay shutdown").await;
        }
        info!("Relay orchestrator stopped");
    }
}

async fn reconcile(inner: &Arc<OrchestratorInner>) {
    let running: HashMap<String, StreamLease> = inner
        .supervisor
        .running()
        .into_iter()
        .map(|lease| (lease.camera_id.clone(), lease))
        .collect();

    // Collect doomed pipelines under the lock, tear them down outside it.
    let mut doomed: Vec<(PipelineHandle, &'static str)> = Vec::new();
    {
        let mut pipelines = inner.pipelines.lock();
        let ids: Vec<String> = pipelines.keys().cloned().collect();
        for id in ids {
            let reason = {
                let handle = &pipelines[&id];
                if handle.stats.peer_state().is_down() {
                    Some("peer connection lost")
                } else if handle.read_task.is_finished() {
                    Some("upstream disconnected")
                } else {
                    match running.get(&id) {
                        None => Some("camera no longer running"),
                        Some(lease) if lease.stream_url != handle.stream_url => {
                            Some("lease superseded")
                        }
                        Some(_) => None,
                    }
                }
            };
            if let Some(reason) = reason {
                if let Some(handle) = pipelines.remove(&id) {
                    doomed.push((handle, reason));
                }
            }
        }
    }
    for (handle, reason) in doomed {
        stop_pipeline(handle, reason).await;
    }

    // Spawn creations for running cameras without a pipeline. Creation is
    // slow (ICE, RTSP handshake), so each runs in its own task guarded by
    // the `creating` set.
    let to_create: Vec<StreamLease> = {
        let pipelines = inner.pipelines.lock();
        let creating = inner.creating.lock();
        running
            .into_values()
            .filter(|lease| {
                !pipelines.contains_key(&lease.camera_id)
                    && !creating.contains(&lease.camera_id)
            })
            .collect()
    };
    for lease in to_create {
        inner.creating.lock().insert(lease.camera_id.clone());
        let inner2 = inner.clone();
        tokio::spawn(async move {
            let camera_id = lease.camera_id.clone();
            match build_pipeline(&inner2, lease).await {
                Ok(handle) => install_pipeline(&inner2, handle).await,
                Err(e) => {
                    warn!(camera = camera_id, error = %e, "Pipeline creation failed");
                }
            }
            inner2.creating.lock().remove(&camera_id);
        });
    }
}

/// Insert a freshly built pipeline, unless the world moved on while it was
/// being built (camera left Running, lease replaced, or relay stopping).
async fn install_pipeline(inner: &Arc<OrchestratorInner>, handle: PipelineHandle) {
    let still_wanted = !*inner.shutdown_tx.subscribe().borrow()
        && inner
            .supervisor
            .stream(&handle.camera_id)
            .map(|lease| lease.stream_url == handle.stream_url)
            .unwrap_or(false);
    if !still_wanted {
        stop_pipeline(handle, "stale by the time it was built").await;
        return;
    }
    let handle_if_duplicate = {
        let mut pipelines = inner.pipelines.lock();
        if pipelines.contains_key(&handle.camera_id) {
            Some(handle)
        } else {
            info!(camera = handle.camera_id, "Pipeline installed");
            pipelines.insert(handle.camera_id.clone(), handle);
            None
        }
    };
    if let Some(handle) = handle_if_duplicate {
        stop_pipeline(handle, "duplicate pipeline").await;
    }
}

enum TrackSink {
    Video { depacketizer: H264Depacketizer, pacer: Pacer },
    Audio { depacketizer: AacDepacketizer, pacer: Pacer },
}

struct TrackRoute {
    channel: u8,
    sink: TrackSink,
}

async fn build_pipeline(
    inner: &Arc<OrchestratorInner>,
    lease: StreamLease,
) -> Result<PipelineHandle> {
    let camera_id = lease.camera_id.clone();
    let tuning = &inner.tuning;
    let stats = Arc::new(PipelineStats::new());

    let bridge = Arc::new(
        WebRtcBridge::connect(
            inner.sfu.clone(),
            &inner.bridge_cfg,
            &camera_id,
            stats.clone(),
        )
        .await?,
    );
    // Gate ingest on the connection: packets written before Connected are
    // dropped by the stack and poison the subscriber's decoder.
    if let Err(e) = bridge.wait_until_connected(tuning.rpc_timeout()).await {
        bridge.close().await;
        return Err(e);
    }

    let rtsp = match RtspClient::connect(
        &lease.stream_url,
        RtspConfig { read_timeout: tuning.rtsp_read_timeout() },
    )
    .await
    {
        Ok(rtsp) => rtsp,
        Err(e) => {
            bridge.close().await;
            return Err(e);
        }
    };
    let session_timeout = rtsp.session_timeout();
    let channels = rtsp.channels().to_vec();
    let (reader, control) = rtsp.into_parts();

    let (shutdown_tx, _) = watch::channel(false);
    let mut tasks = Vec::new();
    let mut routes = Vec::new();
    for channel in &channels {
        match channel.kind {
            MediaKind::Video => {
                let cfg = PacerConfig {
                    capacity: tuning.pacer_capacity,
                    catchup_threshold: tuning.catchup_threshold,
                    catchup_multiplier: tuning.catchup_multiplier,
                    max_delay: tuning.max_packet_delay(),
                    clock_rate: if channel.clock_rate > 0 {
                        channel.clock_rate
                    } else {
                        tuning.video_clock_rate
                    },
                };
                let bridge2 = bridge.clone();
                let (pacer, drain) = Pacer::spawn(
                    "video",
                    cfg,
                    stats.clone(),
                    shutdown_tx.subscribe(),
                    move |unit| {
                        let bridge = bridge2.clone();
                        async move { bridge.write_video(unit).await }
                    },
                );
                tasks.push(drain);
                routes.push(TrackRoute {
                    channel: channel.interleaved_id,
                    sink: TrackSink::Video { depacketizer: H264Depacketizer::new(), pacer },
                });
            }
            MediaKind::Audio => {
                let cfg = PacerConfig {
                    capacity: tuning.pacer_capacity,
                    catchup_threshold: tuning.catchup_threshold,
                    catchup_multiplier: tuning.catchup_multiplier,
                    max_delay: tuning.max_packet_delay(),
                    clock_rate: if channel.clock_rate > 0 {
                        channel.clock_rate
                    } else {
                        tuning.audio_clock_rate
                    },
                };
                let bridge2 = bridge.clone();
                let (pacer, drain) = Pacer::spawn(
                    "audio",
                    cfg,
                    stats.clone(),
                    shutdown_tx.subscribe(),
                    move |unit| {
                        let bridge = bridge2.clone();
                        async move { bridge.write_audio(unit).await }
                    },
                );
                tasks.push(drain);
                routes.push(TrackRoute {
                    channel: channel.interleaved_id,
                    sink: TrackSink::Audio { depacketizer: AacDepacketizer::new(), pacer },
                });
            }
        }
    }

    let read_task = {
        let camera = camera_id.clone();
        let stats2 = stats.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            read_loop(camera, reader, routes, stats2, shutdown_rx).await;
        })
    };

    // Keep the RTSP session alive for as long as the pipeline runs.
    {
        let control2 = control.clone();
        let camera = camera_id.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        let interval = tuning
            .rtsp_keepalive()
            .min(session_timeout / 2)
            .max(Duration::from_secs(1));
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown_rx.changed() => return,
                }
                if let Err(e) = control2.keepalive().await {
                    debug!(camera, error = %e, "RTSP keep-alive failed");
                    return;
                }
            }
        }));
    }

    Ok(PipelineHandle {
        camera_id,
        stream_url: lease.stream_url,
        shutdown_tx,
        read_task,
        tasks,
        control,
        bridge,
        stats,
    })
}

async fn read_loop(
    camera_id: String,
    mut reader: RtspReader,
    mut routes: Vec<TrackRoute>,
    stats: Arc<PipelineStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    use std::sync::atomic::Ordering;
    loop {
        let event = tokio::select! {
            _ = shutdown.changed() => return,
            event = reader.next_event() => event,
        };
        match event {
            Ok(RtspEvent::Rtp { channel, packet }) => {
                let Some(route) = routes.iter_mut().find(|r| r.channel == channel) else {
                    continue;
                };
                match &mut route.sink {
                    TrackSink::Video { depacketizer, pacer } => {
                        stats.video_packets.fetch_add(1, Ordering::Relaxed);
                        if let Some(unit) = depacketizer.push(&packet) {
                            if pacer.enqueue(unit).await.is_err() {
                                return;
                            }
                        }
                    }
                    TrackSink::Audio { depacketizer, pacer } => {
                        stats.audio_packets.fetch_add(1, Ordering::Relaxed);
                        for unit in depacketizer.push(&packet) {
                            if pacer.enqueue(unit).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
            Ok(RtspEvent::Rtcp { .. }) => {
                stats.rtsp_rtcp_packets.fetch_add(1, Ordering::Relaxed);
            }
            Ok(RtspEvent::Response { status }) => {
                debug!(camera = camera_id, status, "In-band RTSP response");
            }
            Err(e) => {
                warn!(camera = camera_id, error = %e, "Upstream disconnected");
                return;
            }
        }
    }
}

async fn stop_pipeline(handle: PipelineHandle, reason: &str) {
    info!(camera = handle.camera_id, reason, "Stopping pipeline");
    let teardown = handle.control.teardown();
    if tokio::time::timeout(Duration::from_secs(2), teardown).await.is_err() {
        debug!(camera = handle.camera_id, "RTSP teardown timed out");
    }
    let _ = handle.shutdown_tx.send(true);

    // Join every pipeline task before closing the peer connection so no
    // write races the close.
    let join_deadline = Duration::from_secs(5);
    let mut read_task = handle.read_task;
    let timed_out = tokio::time::timeout(join_deadline, &mut read_task).await.is_err();
    if timed_out {
        debug!(camera = handle.camera_id, "Read task did not exit in time");
        read_task.abort();
    }
    for mut task in handle.tasks {
        let timed_out = tokio::time::timeout(join_deadline, &mut task).await.is_err();
        if timed_out {
            debug!(camera = handle.camera_id, "Pipeline task did not exit in time");
            task.abort();
        }
    }
    handle.bridge.close().await;
}

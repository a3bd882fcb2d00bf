// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Lifecycle tests: staggered bring-up, extend-ahead-of-expiry, the degrade
//! schedule, and shutdown. A mock control plane records every call with its
//! virtual timestamp; the paused clock makes the multi-minute schedules run
//! instantly and deterministically.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::time::Instant;

use camrelay::config::RelayTuning;
use camrelay::error::{RelayError, Result};
use camrelay::lifecycle::{CameraState, StreamSupervisor};
use camrelay::provider::ControlPlane;
use camrelay::queue::CommandQueue;

type Behavior = Box<dyn Fn(&str, usize) -> Result<Value> + Send + Sync>;

#[derive(Debug, Clone)]
struct CallRecord {
    camera: String,
    command: String,
    at: Duration,
}

struct MockProvider {
    started: Instant,
    calls: Mutex<Vec<CallRecord>>,
    in_flight: Mutex<HashMap<String, u32>>,
    overlap_detected: Mutex<bool>,
    latency: Duration,
    on_generate: Behavior,
    on_extend: Behavior,
}

impl MockProvider {
    fn new(on_generate: Behavior, on_extend: Behavior) -> Arc<Self> {
        Arc::new(MockProvider {
            started: Instant::now(),
            calls: Mutex::new(Vec::new()),
            in_flight: Mutex::new(HashMap::new()),
            overlap_detected: Mutex::new(false),
            latency: Duration::ZERO,
            on_generate,
            on_extend,
        })
    }

    fn with_latency(on_generate: Behavior, on_extend: Behavior, latency: Duration) -> Arc<Self> {
        let mut p = MockProvider::new(on_generate, on_extend);
        Arc::get_mut(&mut p).expect("fresh arc").latency = latency;
        p
    }

    fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().clone()
    }

    fn calls_matching(&self, fragment: &str) -> Vec<CallRecord> {
        self.calls()
            .into_iter()
            .filter(|c| c.command.contains(fragment))
            .collect()
    }
}

#[async_trait]
impl ControlPlane for MockProvider {
    async fn execute_command(&self, camera_id: &str, command: &str, _params: Value) -> Result<Value> {
        let nth = {
            let mut calls = self.calls.lock();
            let nth = calls
                .iter()
                .filter(|c| c.camera == camera_id && c.command == command)
                .count();
            calls.push(CallRecord {
                camera: camera_id.to_string(),
                command: command.to_string(),
                at: self.started.elapsed(),
            });
            nth
        };

        {
            let mut in_flight = self.in_flight.lock();
            let slot = in_flight.entry(camera_id.to_string()).or_insert(0);
            *slot += 1;
            if *slot > 1 {
                *self.overlap_detected.lock() = true;
            }
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        {
            let mut in_flight = self.in_flight.lock();
            *in_flight.get_mut(camera_id).expect("tracked") -= 1;
        }

        if command.contains("Generate") {
            (self.on_generate)(camera_id, nth)
        } else if command.contains("Extend") {
            (self.on_extend)(camera_id, nth)
        } else {
            Ok(json!({}))
        }
    }
}

fn lease_json(expires_in_secs: i64) -> Value {
    json!({
        "streamUrls": { "rtspUrl": "rtsps://cam.example.net:322/live" },
        "streamExtensionToken": "tok-0",
        "expiresAt": (Utc::now() + chrono::Duration::seconds(expires_in_secs)).to_rfc3339(),
    })
}

fn extension_json(expires_in_secs: i64) -> Value {
    json!({
        "streamExtensionToken": "tok-extended",
        "expiresAt": (Utc::now() + chrono::Duration::seconds(expires_in_secs)).to_rfc3339(),
    })
}

fn tuning(qpm: u32) -> RelayTuning {
    RelayTuning { qpm, ..Default::default() }
}

async fn wait_for<F: Fn() -> bool>(what: &str, max_virtual_secs: u64, cond: F) {
    for _ in 0..max_virtual_secs {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test(start_paused = true)]
async fn test_staggered_bring_up() {
    let provider = MockProvider::new(
        Box::new(|_, _| Ok(lease_json(3600))),
        Box::new(|_, _| Ok(extension_json(3600))),
    );
    // A high budget keeps the limiter out of the stagger measurement.
    let queue = CommandQueue::new(6000, Duration::from_secs(30));
    queue.start();
    let supervisor = StreamSupervisor::new(queue.clone(), provider.clone(), tuning(6000));

    let ids: Vec<String> = (1..=20).map(|i| format!("cam-{i:02}")).collect();
    let started = Instant::now();
    supervisor.start_cameras(&ids);

    wait_for("all cameras running", 600, || {
        let status = supervisor.status();
        status.len() == 20 && status.iter().all(|c| c.state == CameraState::Running)
    })
    .await;

    // Fleet converged well within 20 stagger intervals plus one RPC budget.
    assert!(started.elapsed() <= Duration::from_secs(20 * 12 + 30));

    let generates = provider.calls_matching("Generate");
    assert_eq!(generates.len(), 20);
    for (k, call) in generates.iter().enumerate() {
        let expected = Duration::from_secs(12 * k as u64);
        let diff = call.at.checked_sub(expected).unwrap_or_else(|| expected - call.at);
        assert!(
            diff <= Duration::from_secs(2),
            "camera {} generated at {:?}, expected ≈{:?}",
            call.camera,
            call.at,
            expected
        );
    }
    queue.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_degrade_schedule_after_persistent_failure() {
    let provider = MockProvider::new(
        Box::new(|_, _| Err(RelayError::Transient("HTTP 503: unavailable".into()))),
        Box::new(|_, _| Ok(extension_json(300))),
    );
    let queue = CommandQueue::new(6000, Duration::from_secs(30));
    queue.start();
    let supervisor = StreamSupervisor::new(queue.clone(), provider.clone(), tuning(6000));

    supervisor.start_cameras(&["cam-x".to_string()]);

    // Attempts at ≈0, 10, 30, 70, 150 (backoff 10·2^k capped) and, once
    // Degraded after the fifth failure, at 150 + 300.
    wait_for("six generate attempts", 600, || {
        provider.calls_matching("Generate").len() >= 6
    })
    .await;

    let expected = [0u64, 10, 30, 70, 150, 450];
    let generates = provider.calls_matching("Generate");
    for (call, expected_secs) in generates.iter().zip(expected) {
        let expected = Duration::from_secs(expected_secs);
        let diff = call.at.checked_sub(expected).unwrap_or_else(|| expected - call.at);
        assert!(
            diff <= Duration::from_secs(3),
            "attempt at {:?}, expected ≈{:?}",
            call.at,
            expected
        );
    }

    let status = supervisor.status();
    assert_eq!(status[0].state, CameraState::Degraded);
    assert!(status[0].failure_count >= 5);
    assert!(status[0].last_error.as_deref().unwrap_or("").contains("503"));
    queue.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_extend_ahead_of_expiry_resets_failures() {
    // Lease expires in 60 s, inside the 90 s horizon: the monitor extends
    // on its first tick. The slow provider exposes double-submission bugs.
    let provider = MockProvider::with_latency(
        Box::new(|_, _| Ok(lease_json(60))),
        Box::new(|_, _| Ok(extension_json(300))),
        Duration::from_secs(3),
    );
    let queue = CommandQueue::new(6000, Duration::from_secs(30));
    queue.start();
    let supervisor = StreamSupervisor::new(queue.clone(), provider.clone(), tuning(6000));

    supervisor.start_cameras(&["cam-e".to_string()]);

    wait_for("lease extension", 120, || {
        !provider.calls_matching("Extend").is_empty()
            && supervisor
                .status()
                .first()
                .map(|c| c.time_until_expiry_secs.unwrap_or(0) > 200)
                .unwrap_or(false)
    })
    .await;

    let status = supervisor.status();
    assert_eq!(status[0].state, CameraState::Running);
    assert_eq!(status[0].failure_count, 0);
    assert!(
        !*provider.overlap_detected.lock(),
        "at most one in-flight intent per camera"
    );

    let lease = supervisor.stream("cam-e").expect("running lease");
    assert_eq!(lease.extension_token, "tok-extended");
    queue.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_expired_extend_triggers_regenerate() {
    // First extend reports the stream gone; recovery must generate a fresh
    // lease rather than keep extending.
    let provider = MockProvider::new(
        Box::new(|_, nth| {
            if nth == 0 {
                Ok(lease_json(60))
            } else {
                Ok(lease_json(3600))
            }
        }),
        Box::new(|_, _| Err(RelayError::LeaseExpired("HTTP 404: stream expired".into()))),
    );
    let queue = CommandQueue::new(6000, Duration::from_secs(30));
    queue.start();
    let supervisor = StreamSupervisor::new(queue.clone(), provider.clone(), tuning(6000));

    supervisor.start_cameras(&["cam-r".to_string()]);

    wait_for("regeneration after 404", 300, || {
        provider.calls_matching("Generate").len() >= 2
            && supervisor
                .status()
                .first()
                .map(|c| {
                    c.state == CameraState::Running && c.time_until_expiry_secs.unwrap_or(0) > 600
                })
                .unwrap_or(false)
    })
    .await;

    assert!(!provider.calls_matching("Extend").is_empty());
    let status = supervisor.status();
    assert_eq!(status[0].state, CameraState::Running);
    assert_eq!(status[0].failure_count, 0);
    queue.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_already_expired_lease_fails_in_place() {
    // The first lease is dead on arrival; the monitor must skip Extend and
    // fail in place, and recovery then brings the camera back.
    let provider = MockProvider::new(
        Box::new(|_, nth| {
            if nth == 0 {
                Ok(lease_json(-1))
            } else {
                Ok(lease_json(3600))
            }
        }),
        Box::new(|_, _| Ok(extension_json(300))),
    );
    let queue = CommandQueue::new(6000, Duration::from_secs(30));
    queue.start();
    let supervisor = StreamSupervisor::new(queue.clone(), provider.clone(), tuning(6000));

    supervisor.start_cameras(&["cam-d".to_string()]);

    wait_for("recovery from dead lease", 300, || {
        let status = supervisor.status();
        provider.calls_matching("Generate").len() >= 2
            && status.first().map(|c| c.state == CameraState::Running).unwrap_or(false)
    })
    .await;

    // The dead lease was never extended.
    assert!(provider.calls_matching("Extend").is_empty());
    queue.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_tears_down_and_is_terminal() {
    let provider = MockProvider::new(
        Box::new(|_, _| Ok(lease_json(3600))),
        Box::new(|_, _| Ok(extension_json(3600))),
    );
    let queue = CommandQueue::new(6000, Duration::from_secs(30));
    queue.start();
    let supervisor = StreamSupervisor::new(queue.clone(), provider.clone(), tuning(6000));

    let ids = vec!["cam-1".to_string(), "cam-2".to_string()];
    supervisor.start_cameras(&ids);
    wait_for("both running", 120, || {
        let status = supervisor.status();
        status.len() == 2 && status.iter().all(|c| c.state == CameraState::Running)
    })
    .await;

    supervisor.stop().await;

    let status = supervisor.status();
    assert!(status.iter().all(|c| c.state == CameraState::Stopped));
    assert!(supervisor.stream("cam-1").is_none());
    assert!(supervisor.stream("cam-2").is_none());
    assert_eq!(provider.calls_matching("Stop").len(), 2, "best-effort provider stop per lease");
    queue.stop().await;
}

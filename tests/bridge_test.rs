// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Bridge gating and RTCP classification tests. The connected gate is the
//! invariant that keeps RTP writes from preceding the Connected state; here
//! the state channel is driven directly, without a real peer connection.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use webrtc::rtcp;

use camrelay::bridge::{classify_rtcp, PeerStateGate};
use camrelay::error::{RelayError, Result};
use camrelay::stats::{PeerState, PipelineStats};

type GateOutcome = Arc<Mutex<Option<Result<()>>>>;

fn spawn_waiter(gate: PeerStateGate, timeout: Duration) -> (GateOutcome, tokio::task::JoinHandle<()>) {
    let outcome: GateOutcome = Arc::new(Mutex::new(None));
    let outcome2 = outcome.clone();
    let handle = tokio::spawn(async move {
        let result = gate.wait_until_connected(timeout).await;
        *outcome2.lock() = Some(result);
    });
    (outcome, handle)
}

#[tokio::test(start_paused = true)]
async fn test_gate_holds_until_connected() {
    let (state_tx, gate) = PeerStateGate::channel(PeerState::New);
    assert_eq!(gate.current(), PeerState::New);
    let (outcome, waiter) = spawn_waiter(gate, Duration::from_secs(60));

    // Neither New nor Connecting releases the gate.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(outcome.lock().is_none(), "gate released while New");

    state_tx.send(PeerState::Connecting).expect("send");
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(outcome.lock().is_none(), "gate released while Connecting");

    state_tx.send(PeerState::Connected).expect("send");
    waiter.await.expect("join");
    match outcome.lock().take() {
        Some(Ok(())) => {}
        other => panic!("expected release on Connected, got {other:?}"),
    };
}

#[tokio::test(start_paused = true)]
async fn test_gate_fails_when_connection_goes_down() {
    let (state_tx, gate) = PeerStateGate::channel(PeerState::Connecting);
    let (outcome, waiter) = spawn_waiter(gate, Duration::from_secs(60));

    tokio::time::sleep(Duration::from_secs(1)).await;
    state_tx.send(PeerState::Failed).expect("send");
    waiter.await.expect("join");

    match outcome.lock().take() {
        Some(Err(RelayError::PeerConnectionFailed(_))) => {}
        other => panic!("expected PeerConnectionFailed, got {other:?}"),
    };
}

#[tokio::test(start_paused = true)]
async fn test_gate_times_out_without_progress() {
    let (_state_tx, gate) = PeerStateGate::channel(PeerState::Connecting);
    let (outcome, waiter) = spawn_waiter(gate, Duration::from_secs(30));

    waiter.await.expect("join");
    match outcome.lock().take() {
        Some(Err(RelayError::PeerConnectionFailed(msg))) => {
            assert!(msg.contains("timed out"), "unexpected message: {msg}");
        }
        other => panic!("expected timeout error, got {other:?}"),
    };
}

#[tokio::test(start_paused = true)]
async fn test_gate_already_connected_resolves_immediately() {
    let (_state_tx, gate) = PeerStateGate::channel(PeerState::Connected);
    gate.wait_until_connected(Duration::from_secs(1))
        .await
        .expect("already-connected gate must not block");
}

#[test]
fn test_rtcp_classification_moves_counters() {
    use rtcp::payload_feedbacks::full_intra_request::FullIntraRequest;
    use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
    use rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate;
    use rtcp::receiver_report::ReceiverReport;
    use rtcp::sender_report::SenderReport;
    use rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack;

    let stats = PipelineStats::new();

    classify_rtcp("cam", "video", &PictureLossIndication::default(), &stats);
    classify_rtcp("cam", "video", &FullIntraRequest::default(), &stats);
    classify_rtcp("cam", "video", &TransportLayerNack::default(), &stats);
    classify_rtcp("cam", "video", &ReceiverReport::default(), &stats);
    classify_rtcp("cam", "audio", &SenderReport::default(), &stats);
    classify_rtcp("cam", "video", &ReceiverEstimatedMaximumBitrate::default(), &stats);

    assert_eq!(stats.keyframe_requests.load(Ordering::Relaxed), 2, "PLI + FIR");
    assert_eq!(stats.nacks.load(Ordering::Relaxed), 1);
    assert_eq!(stats.receiver_reports.load(Ordering::Relaxed), 3, "RR + SR + REMB");
}

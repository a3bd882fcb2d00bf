//! Hot-path pipeline counters.
//!
//! All counters are atomics so the media path never takes a lock to account
//! for a packet; readers get a consistent-enough snapshot for status output.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use serde::Serialize;

/// Cached peer-connection state, written by the state-change callback and
/// read without blocking by the orchestrator and the media path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerState {
    fn from_u8(v: u8) -> PeerState {
        match v {
            1 => PeerState::Connecting,
            2 => PeerState::Connected,
            3 => PeerState::Disconnected,
            4 => PeerState::Failed,
            5 => PeerState::Closed,
            _ => PeerState::New,
        }
    }

    pub fn is_down(self) -> bool {
        matches!(self, PeerState::Disconnected | PeerState::Failed | PeerState::Closed)
    }
}

/// Monotonic counters for one camera pipeline.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub video_packets: AtomicU64,
    pub audio_packets: AtomicU64,
    /// RTCP frames on odd interleaved RTSP channels; counted, not parsed.
    pub rtsp_rtcp_packets: AtomicU64,
    pub video_frames: AtomicU64,
    pub audio_frames: AtomicU64,
    pub audio_dropped: AtomicU64,
    pub write_errors: AtomicU64,
    pub bursts_absorbed: AtomicU64,
    pub catchup_events: AtomicU64,
    pub keyframe_requests: AtomicU64,
    pub nacks: AtomicU64,
    pub receiver_reports: AtomicU64,
    peer_state: AtomicU8,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_peer_state(&self, state: PeerState) {
        self.peer_state.store(state as u8, Ordering::Release);
    }

    pub fn peer_state(&self) -> PeerState {
        PeerState::from_u8(self.peer_state.load(Ordering::Acquire))
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            video_packets: self.video_packets.load(Ordering::Relaxed),
            audio_packets: self.audio_packets.load(Ordering::Relaxed),
            rtsp_rtcp_packets: self.rtsp_rtcp_packets.load(Ordering::Relaxed),
            video_frames: self.video_frames.load(Ordering::Relaxed),
            audio_frames: self.audio_frames.load(Ordering::Relaxed),
            audio_dropped: self.audio_dropped.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            bursts_absorbed: self.bursts_absorbed.load(Ordering::Relaxed),
            catchup_events: self.catchup_events.load(Ordering::Relaxed),
            keyframe_requests: self.keyframe_requests.load(Ordering::Relaxed),
            nacks: self.nacks.load(Ordering::Relaxed),
            receiver_reports: self.receiver_reports.load(Ordering::Relaxed),
            peer_state: self.peer_state(),
        }
    }
}

/// Point-in-time copy of [`PipelineStats`], serializable for status output.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineSnapshot {
    pub video_packets: u64,
    pub audio_packets: u64,
    pub rtsp_rtcp_packets: u64,
    pub video_frames: u64,
    pub audio_frames: u64,
    pub audio_dropped: u64,
    pub write_errors: u64,
    pub bursts_absorbed: u64,
    pub catchup_events: u64,
    pub keyframe_requests: u64,
    pub nacks: u64,
    pub receiver_reports: u64,
    pub peer_state: PeerState,
}

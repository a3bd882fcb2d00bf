// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! WebRTC bridge: one SFU session, one peer connection, two sendonly
//! tracks.
//!
//! Negotiation offers H.264 (Main profile, matching the upstream cameras)
//! and Opus to the SFU, then repacketizes upstream access units into WebRTC
//! RTP with passthrough timestamps. The cached peer-connection state gates
//! ingest start: nothing is written before the connection reports
//! Connected, because premature writes are dropped by the stack and leave
//! subscribers requesting keyframes forever.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp;
use webrtc::rtp;
use webrtc::rtp::packetizer::Payloader;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

use crate::error::{RelayError, Result};
use crate::media::{split_nal_units, AccessUnit};
use crate::sfu::{SessionDescription, SfuApi, TrackLocator};
use crate::stats::{PeerState, PipelineStats};

pub const VIDEO_PAYLOAD_TYPE: u8 = 96;
pub const AUDIO_PAYLOAD_TYPE: u8 = 111;

/// Main profile, matching the upstream camera streams; a mismatched
/// profile-level-id makes browsers reject the decoder outright.
const VIDEO_FMTP: &str =
    "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=4d001f";
const AUDIO_FMTP: &str = "minptime=10;useinbandfec=1";

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub ice_urls: Vec<String>,
    pub mtu: usize,
    pub ice_gather_timeout: Duration,
}

/// Cached peer-connection state as a waitable gate: the state-change
/// callback drives the sender side, and ingest blocks on
/// [`wait_until_connected`](Self::wait_until_connected) before any media
/// flows.
pub struct PeerStateGate {
    rx: watch::Receiver<PeerState>,
}

impl PeerStateGate {
    pub fn channel(initial: PeerState) -> (watch::Sender<PeerState>, PeerStateGate) {
        let (tx, rx) = watch::channel(initial);
        (tx, PeerStateGate { rx })
    }

    /// Latest cached state; never blocks.
    pub fn current(&self) -> PeerState {
        *self.rx.borrow()
    }

    /// Resolve once the state reaches Connected; error if the connection
    /// goes down or the deadline passes first.
    pub async fn wait_until_connected(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.rx.clone();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let state = *rx.borrow();
            match state {
                PeerState::Connected => return Ok(()),
                s if s.is_down() => {
                    return Err(RelayError::PeerConnectionFailed(format!(
                        "peer connection entered {s:?} before connecting"
                    )));
                }
                _ => {}
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(RelayError::PeerConnectionFailed(
                            "peer connection dropped".into(),
                        ));
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(RelayError::PeerConnectionFailed(format!(
                        "timed out waiting for connection (state {:?})",
                        *rx.borrow()
                    )));
                }
            }
        }
    }
}

struct VideoWriter {
    track: Arc<TrackLocalStaticRTP>,
    payloader: Mutex<rtp::codecs::h264::H264Payloader>,
    sequence: AtomicU16,
    ssrc: u32,
    mtu: usize,
}

impl VideoWriter {
    fn next_sequence(&self) -> u16 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }
}

/// One camera's WebRTC leg.
pub struct WebRtcBridge {
    camera_id: String,
    session_id: String,
    pc: Arc<RTCPeerConnection>,
    video: VideoWriter,
    mids: Vec<String>,
    gate: PeerStateGate,
    stats: Arc<PipelineStats>,
    sfu: Arc<dyn SfuApi>,
    rtcp_shutdown: watch::Sender<bool>,
    rtcp_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WebRtcBridge {
    /// Create the SFU session, negotiate offer/answer, and start the RTCP
    /// readers. The peer connection is usually still connecting on return;
    /// callers must [`wait_until_connected`](Self::wait_until_connected)
    /// before pushing media.
    pub async fn connect(
        sfu: Arc<dyn SfuApi>,
        cfg: &BridgeConfig,
        camera_id: &str,
        stats: Arc<PipelineStats>,
    ) -> Result<WebRtcBridge> {
        let session_id = sfu.create_session().await?;
        debug!(camera = camera_id, session = session_id, "SFU session created");

        let video_capability = RTCRtpCodecCapability {
            mime_type: MIME_TYPE_H264.to_owned(),
            clock_rate: 90_000,
            channels: 0,
            sdp_fmtp_line: VIDEO_FMTP.to_owned(),
            rtcp_feedback: vec![
                RTCPFeedback { typ: "goog-remb".to_owned(), parameter: String::new() },
                RTCPFeedback { typ: "ccm".to_owned(), parameter: "fir".to_owned() },
                RTCPFeedback { typ: "nack".to_owned(), parameter: String::new() },
                RTCPFeedback { typ: "nack".to_owned(), parameter: "pli".to_owned() },
            ],
        };
        let audio_capability = RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48_000,
            channels: 2,
            sdp_fmtp_line: AUDIO_FMTP.to_owned(),
            rtcp_feedback: vec![],
        };

        let mut media_engine = MediaEngine::default();
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: video_capability.clone(),
                payload_type: VIDEO_PAYLOAD_TYPE,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: audio_capability.clone(),
                payload_type: AUDIO_PAYLOAD_TYPE,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: if cfg.ice_urls.is_empty() {
                // Host candidates only; fine for same-network SFUs.
                Vec::new()
            } else {
                vec![RTCIceServer { urls: cfg.ice_urls.clone(), ..Default::default() }]
            },
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(rtc_config).await?);

        let (state_tx, gate) = PeerStateGate::channel(PeerState::New);
        stats.set_peer_state(PeerState::New);
        {
            let stats = stats.clone();
            let camera = camera_id.to_string();
            pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let mapped = map_peer_state(s);
                stats.set_peer_state(mapped);
                let _ = state_tx.send(mapped);
                debug!(camera, state = %s, "Peer connection state changed");
                Box::pin(async {})
            }));
        }

        let stream_id = format!("camrelay-{camera_id}");
        let video_track = Arc::new(TrackLocalStaticRTP::new(
            video_capability,
            "video".to_owned(),
            stream_id.clone(),
        ));
        let audio_track = Arc::new(TrackLocalStaticRTP::new(
            audio_capability,
            "audio".to_owned(),
            stream_id,
        ));
        // A failed negotiation must not strand the freshly created peer
        // connection (the orchestrator retries every reconcile tick).
        let negotiated = Self::negotiate(
            &sfu,
            &session_id,
            camera_id,
            cfg,
            &pc,
            &video_track,
            &audio_track,
        )
        .await;
        let (mids, video_sender, audio_sender) = match negotiated {
            Ok(parts) => parts,
            Err(e) => {
                let _ = pc.close().await;
                return Err(e);
            }
        };

        let (rtcp_shutdown, _) = watch::channel(false);
        let rtcp_tasks = vec![
            spawn_rtcp_reader(
                video_sender,
                "video",
                camera_id.to_string(),
                stats.clone(),
                rtcp_shutdown.subscribe(),
            ),
            spawn_rtcp_reader(
                audio_sender,
                "audio",
                camera_id.to_string(),
                stats.clone(),
                rtcp_shutdown.subscribe(),
            ),
        ];

        info!(camera = camera_id, session = session_id, "WebRTC bridge negotiated");
        Ok(WebRtcBridge {
            camera_id: camera_id.to_string(),
            session_id,
            pc,
            video: VideoWriter {
                track: video_track,
                payloader: Mutex::new(rtp::codecs::h264::H264Payloader::default()),
                sequence: AtomicU16::new(rand::random::<u16>()),
                ssrc: rand::random::<u32>(),
                mtu: cfg.mtu,
            },
            mids,
            gate,
            stats,
            sfu,
            rtcp_shutdown,
            rtcp_tasks: Mutex::new(rtcp_tasks),
        })
    }

    /// Offer/answer with the SFU: add the local tracks, ship the gathered
    /// offer plus per-media mids, apply the returned answer.
    async fn negotiate(
        sfu: &Arc<dyn SfuApi>,
        session_id: &str,
        camera_id: &str,
        cfg: &BridgeConfig,
        pc: &Arc<RTCPeerConnection>,
        video_track: &Arc<TrackLocalStaticRTP>,
        audio_track: &Arc<TrackLocalStaticRTP>,
    ) -> Result<(Vec<String>, Arc<RTCRtpSender>, Arc<RTCRtpSender>)> {
        let video_sender = pc
            .add_track(Arc::clone(video_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        let audio_sender = pc
            .add_track(Arc::clone(audio_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        let offer = pc.create_offer(None).await?;
        let mut gather_complete = pc.gathering_complete_promise().await;
        pc.set_local_description(offer).await?;
        // Bounded wait so a host without a viable interface cannot hang the
        // pipeline; the offer simply ships with whatever was gathered.
        if tokio::time::timeout(cfg.ice_gather_timeout, gather_complete.recv())
            .await
            .is_err()
        {
            warn!(camera = camera_id, "ICE gathering did not finish in time");
        }
        let local = pc
            .local_description()
            .await
            .ok_or_else(|| RelayError::PeerConnectionFailed("no local description".into()))?;

        let video_mid = find_mid(&local.sdp, "video").ok_or_else(|| {
            RelayError::PeerConnectionFailed("offer has no video mid".into())
        })?;
        let audio_mid = find_mid(&local.sdp, "audio").ok_or_else(|| {
            RelayError::PeerConnectionFailed("offer has no audio mid".into())
        })?;
        let mids = vec![video_mid.clone(), audio_mid.clone()];

        let response = sfu
            .add_tracks(
                session_id,
                SessionDescription::offer(local.sdp.clone()),
                vec![
                    TrackLocator::local(video_mid, "video"),
                    TrackLocator::local(audio_mid, "audio"),
                ],
            )
            .await?;
        let answer = response
            .session_description
            .ok_or_else(|| RelayError::Sfu("add_tracks returned no answer".into()))?;
        if answer.kind != "answer" {
            return Err(RelayError::Sfu(format!(
                "expected answer from SFU, got '{}'",
                answer.kind
            )));
        }
        for track in &response.tracks {
            if let Some(code) = &track.error_code {
                return Err(RelayError::Sfu(format!(
                    "track '{}' rejected: {} {}",
                    track.track_name.as_deref().unwrap_or("?"),
                    code,
                    track.error_description.as_deref().unwrap_or(""),
                )));
            }
        }
        if response.requires_immediate_renegotiation {
            // Never expected for local sendonly tracks; renegotiation is for
            // sessions that also pull remote tracks.
            warn!(camera = camera_id, "SFU requested immediate renegotiation");
        }
        pc.set_remote_description(RTCSessionDescription::answer(answer.sdp)?)
            .await?;

        Ok((mids, video_sender, audio_sender))
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Cached peer-connection state; never blocks.
    pub fn peer_state(&self) -> PeerState {
        self.stats.peer_state()
    }

    /// Block until the peer connection reports Connected. Ingest must not
    /// start before this resolves.
    pub async fn wait_until_connected(&self, timeout: Duration) -> Result<()> {
        self.gate.wait_until_connected(timeout).await
    }

    /// Repacketize one video access unit and write it to the local track.
    /// Timestamps pass through unchanged; the marker lands on the final
    /// packet of the final NALU.
    pub async fn write_video(&self, unit: AccessUnit) -> Result<()> {
        let nalus = split_nal_units(&unit.data)?;
        let payloads: Vec<Bytes> = {
            let mut payloader = self.video.payloader.lock();
            let mut all = Vec::new();
            for nalu in &nalus {
                let fragments = payloader
                    .payload(self.video.mtu, nalu)
                    .map_err(|e| RelayError::PacketMalformed(format!("payload: {e}")))?;
                all.extend(fragments);
            }
            all
        };

        let total = payloads.len();
        for (index, payload) in payloads.into_iter().enumerate() {
            let packet = rtp::packet::Packet {
                header: rtp::header::Header {
                    version: 2,
                    marker: index + 1 == total,
                    payload_type: VIDEO_PAYLOAD_TYPE,
                    sequence_number: self.video.next_sequence(),
                    timestamp: unit.rtp_timestamp,
                    ssrc: self.video.ssrc,
                    ..Default::default()
                },
                payload,
            };
            if let Err(e) = self.video.track.write_rtp(&packet).await {
                if matches!(e, webrtc::Error::ErrClosedPipe) {
                    // Track not bound yet (or being unbound); not a failure.
                    return Ok(());
                }
                self.stats.write_errors.fetch_add(1, Ordering::Relaxed);
                return Err(RelayError::PeerConnectionFailed(format!(
                    "write_rtp failed in state {:?}: {e}",
                    self.peer_state()
                )));
            }
        }
        self.stats.video_frames.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Account for one audio frame. The audio m-line is negotiated so the
    /// SFU accepts the offer, but upstream AAC is not transcoded to Opus;
    /// frames are counted and dropped.
    pub async fn write_audio(&self, _unit: AccessUnit) -> Result<()> {
        self.stats.audio_frames.fetch_add(1, Ordering::Relaxed);
        self.stats.audio_dropped.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Close SFU tracks (best-effort), stop the RTCP readers, and close the
    /// peer connection.
    pub async fn close(&self) {
        let _ = self.rtcp_shutdown.send(true);
        let close_tracks = self.sfu.close_tracks(&self.session_id, &self.mids, true);
        match tokio::time::timeout(Duration::from_secs(5), close_tracks).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(camera = self.camera_id, error = %e, "SFU close_tracks failed")
            }
            Err(_) => debug!(camera = self.camera_id, "SFU close_tracks timed out"),
        }
        let tasks: Vec<_> = self.rtcp_tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        if let Err(e) = self.pc.close().await {
            warn!(camera = self.camera_id, error = %e, "Peer connection close failed");
        }
    }
}

fn map_peer_state(s: RTCPeerConnectionState) -> PeerState {
    match s {
        RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => PeerState::New,
        RTCPeerConnectionState::Connecting => PeerState::Connecting,
        RTCPeerConnectionState::Connected => PeerState::Connected,
        RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
        RTCPeerConnectionState::Failed => PeerState::Failed,
        RTCPeerConnectionState::Closed => PeerState::Closed,
    }
}

/// `a=mid:` value of the first m-line of the given media type.
fn find_mid(sdp: &str, media: &str) -> Option<String> {
    let mut in_section = false;
    for raw in sdp.lines() {
        let line = raw.trim_end_matches('\r');
        if let Some(rest) = line.strip_prefix("m=") {
            in_section = rest.split_whitespace().next() == Some(media);
        } else if in_section {
            if let Some(mid) = line.strip_prefix("a=mid:") {
                return Some(mid.trim().to_string());
            }
        }
    }
    None
}

/// One reader per sender: classify RTCP feedback into counters. PLI/FIR are
/// logged but not forwarded upstream.
fn spawn_rtcp_reader(
    sender: Arc<RTCRtpSender>,
    label: &'static str,
    camera_id: String,
    stats: Arc<PipelineStats>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let packets = tokio::select! {
                _ = shutdown.changed() => return,
                result = sender.read_rtcp() => match result {
                    Ok((packets, _)) => packets,
                    Err(_) => return,
                },
            };
            for packet in packets {
                classify_rtcp(&camera_id, label, packet.as_ref(), &stats);
            }
        }
    })
}

/// Sort one RTCP feedback packet from an RTP sender into the pipeline
/// counters. PLI/FIR are logged as keyframe requests, not forwarded
/// upstream.
pub fn classify_rtcp(
    camera_id: &str,
    label: &str,
    packet: &(dyn rtcp::packet::Packet + Send + Sync),
    stats: &PipelineStats,
) {
    use rtcp::payload_feedbacks::full_intra_request::FullIntraRequest;
    use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
    use rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate;
    use rtcp::receiver_report::ReceiverReport;
    use rtcp::sender_report::SenderReport;
    use rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack;

    let any = packet.as_any();
    if any.downcast_ref::<PictureLossIndication>().is_some() {
        stats.keyframe_requests.fetch_add(1, Ordering::Relaxed);
        debug!(camera = camera_id, track = label, "PLI: keyframe requested");
    } else if any.downcast_ref::<FullIntraRequest>().is_some() {
        stats.keyframe_requests.fetch_add(1, Ordering::Relaxed);
        debug!(camera = camera_id, track = label, "FIR: keyframe requested");
    } else if let Some(nack) = any.downcast_ref::<TransportLayerNack>() {
        stats.nacks.fetch_add(1, Ordering::Relaxed);
        debug!(camera = camera_id, track = label, nacks = nack.nacks.len(), "NACK received");
    } else if let Some(remb) = any.downcast_ref::<ReceiverEstimatedMaximumBitrate>() {
        stats.receiver_reports.fetch_add(1, Ordering::Relaxed);
        debug!(camera = camera_id, track = label, bitrate = remb.bitrate, "REMB received");
    } else if any.downcast_ref::<ReceiverReport>().is_some()
        || any.downcast_ref::<SenderReport>().is_some()
    {
        stats.receiver_reports.fetch_add(1, Ordering::Relaxed);
    }
}

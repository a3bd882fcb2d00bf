// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// Provider reports the stream gone (404 / "expired"); a new lease must
    /// be generated.
    #[error("Stream lease expired: {0}")]
    LeaseExpired(String),

    /// Provider refused the call (429); back off and retry.
    #[error("Provider rate limit: {0}")]
    RateLimited(String),

    /// Network failure, timeout, or 5xx; retried with backoff.
    #[error("Transient provider error: {0}")]
    Transient(String),

    /// Authentication/authorization or other 4xx; surfaced as lastError.
    #[error("Provider rejected call: {0}")]
    Fatal(String),

    /// RTSP read/write failure; the owning pipeline is disposed.
    #[error("Upstream disconnect: {0}")]
    UpstreamDisconnect(String),

    /// Peer connection entered failed/disconnected; the pipeline is disposed
    /// and recreated on the next reconcile pass.
    #[error("Peer connection failed: {0}")]
    PeerConnectionFailed(String),

    /// RTP/NAL/SDP parse error; logged at debug and dropped, never fatal.
    #[error("Malformed packet: {0}")]
    PacketMalformed(String),

    #[error("RTSP error: {0}")]
    Rtsp(String),

    #[error("SDP error: {0}")]
    Sdp(String),

    #[error("SFU error: {0}")]
    Sfu(String),

    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Command queue shut down")]
    QueueClosed,

    #[error("Command timed out after {0:?}")]
    CommandTimeout(Duration),
}

impl RelayError {
    /// Whether the lifecycle should keep the camera in its current state and
    /// retry later, as opposed to escalating to regeneration.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayError::RateLimited(_) | RelayError::Transient(_) | RelayError::CommandTimeout(_)
        )
    }

    /// Classify a provider HTTP response into the relay error taxonomy.
    ///
    /// Status codes are authoritative; the body substring check catches
    /// providers that report lease expiry under a non-404 status.
    pub fn classify_provider(status: u16, body: &str) -> RelayError {
        let summary = summarize(body);
        match status {
            404 => RelayError::LeaseExpired(format!("HTTP 404: {summary}")),
            429 => RelayError::RateLimited(format!("HTTP 429: {summary}")),
            s if s >= 500 => RelayError::Transient(format!("HTTP {s}: {summary}")),
            s if body.to_ascii_lowercase().contains("expired") => {
                RelayError::LeaseExpired(format!("HTTP {s}: {summary}"))
            }
            s => RelayError::Fatal(format!("HTTP {s}: {summary}")),
        }
    }
}

fn summarize(body: &str) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(200) {
        Some((idx, _)) => format!("{}…", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(e: reqwest::Error) -> Self {
        RelayError::Transient(format!("request failed: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

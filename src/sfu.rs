//! Hosted-SFU control plane.
//!
//! The bridge publishes tracks by exchanging SDP with the SFU's session
//! REST surface. [`SfuApi`] is the seam the core consumes; [`HostedSfuClient`]
//! speaks the HTTP shape (`/sessions/new`, `/sessions/{id}/tracks/new`, …)
//! with bearer auth.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::SfuConfig;
use crate::error::{RelayError, Result};

/// `{type, sdp}` pair exchanged with the SFU.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: String) -> Self {
        SessionDescription { kind: "offer".into(), sdp }
    }

    pub fn answer(sdp: String) -> Self {
        SessionDescription { kind: "answer".into(), sdp }
    }
}

/// A track reference in an `add_tracks`/`update_tracks` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackLocator {
    /// `"local"` for tracks this peer produces.
    pub location: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    pub track_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl TrackLocator {
    pub fn local(mid: String, track_name: &str) -> Self {
        TrackLocator {
            location: "local".into(),
            mid: Some(mid),
            track_name: track_name.to_string(),
            session_id: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackResult {
    #[serde(default)]
    pub mid: Option<String>,
    #[serde(default)]
    pub track_name: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TracksResponse {
    #[serde(default)]
    pub session_description: Option<SessionDescription>,
    #[serde(default)]
    pub tracks: Vec<TrackResult>,
    #[serde(default)]
    pub requires_immediate_renegotiation: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewSessionResponse {
    session_id: String,
}

/// Operations the relay needs from the SFU control plane.
#[async_trait]
pub trait SfuApi: Send + Sync {
    async fn create_session(&self) -> Result<String>;

    /// Submit the local offer plus track metadata; returns the SFU answer.
    async fn add_tracks(
        &self,
        session_id: &str,
        offer: SessionDescription,
        tracks: Vec<TrackLocator>,
    ) -> Result<TracksResponse>;

    async fn renegotiate(&self, session_id: &str, answer: SessionDescription) -> Result<()>;

    async fn update_tracks(
        &self,
        session_id: &str,
        tracks: Vec<TrackLocator>,
    ) -> Result<TracksResponse>;

    async fn close_tracks(&self, session_id: &str, mids: &[String], force: bool) -> Result<()>;

    async fn session_state(&self, session_id: &str) -> Result<Value>;
}

/// HTTP client for a hosted SFU session API.
pub struct HostedSfuClient {
    http: reqwest::Client,
    base: String,
    token: String,
}

impl HostedSfuClient {
    pub fn new(http: reqwest::Client, cfg: &SfuConfig) -> Self {
        HostedSfuClient {
            base: format!("{}/{}", cfg.base_url.trim_end_matches('/'), cfg.app_id),
            token: cfg.app_token.clone(),
            http,
        }
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<T> {
        let url = format!("{}{}", self.base, path);
        debug!(%method, path, "SFU request");
        let mut req = self.http.request(method, &url).bearer_auth(&self.token);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req.send().await?;
        let status = resp.status().as_u16();
        let text = resp.text().await?;
        if !(200..300).contains(&status) {
            return Err(RelayError::Sfu(format!("HTTP {status} on {path}: {text}")));
        }
        serde_json::from_str(&text)
            .map_err(|e| RelayError::Sfu(format!("unparseable response from {path}: {e}")))
    }
}

#[async_trait]
impl SfuApi for HostedSfuClient {
    async fn create_session(&self) -> Result<String> {
        let resp: NewSessionResponse = self
            .call(reqwest::Method::POST, "/sessions/new", None)
            .await?;
        Ok(resp.session_id)
    }

    async fn add_tracks(
        &self,
        session_id: &str,
        offer: SessionDescription,
        tracks: Vec<TrackLocator>,
    ) -> Result<TracksResponse> {
        self.call(
            reqwest::Method::POST,
            &format!("/sessions/{session_id}/tracks/new"),
            Some(serde_json::json!({
                "sessionDescription": offer,
                "tracks": tracks,
            })),
        )
        .await
    }

    async fn renegotiate(&self, session_id: &str, answer: SessionDescription) -> Result<()> {
        let _: Value = self
            .call(
                reqwest::Method::PUT,
                &format!("/sessions/{session_id}/renegotiate"),
                Some(serde_json::json!({ "sessionDescription": answer })),
            )
            .await?;
        Ok(())
    }

    async fn update_tracks(
        &self,
        session_id: &str,
        tracks: Vec<TrackLocator>,
    ) -> Result<TracksResponse> {
        self.call(
            reqwest::Method::PUT,
            &format!("/sessions/{session_id}/tracks/update"),
            Some(serde_json::json!({ "tracks": tracks })),
        )
        .await
    }

    async fn close_tracks(&self, session_id: &str, mids: &[String], force: bool) -> Result<()> {
        let tracks: Vec<Value> = mids
            .iter()
            .map(|mid| serde_json::json!({ "mid": mid }))
            .collect();
        let _: Value = self
            .call(
                reqwest::Method::PUT,
                &format!("/sessions/{session_id}/tracks/close"),
                Some(serde_json::json!({ "tracks": tracks, "force": force })),
            )
            .await?;
        Ok(())
    }

    async fn session_state(&self, session_id: &str) -> Result<Value> {
        self.call(reqwest::Method::GET, &format!("/sessions/{session_id}"), None)
            .await
    }
}

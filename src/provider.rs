// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Camera-provider control plane.
//!
//! The relay core only needs one capability from the provider: an
//! authenticated `executeCommand` call. [`ControlPlane`] captures that seam
//! so tests can substitute the provider wholesale; [`HttpControlPlane`] is
//! the production implementation with a cached OAuth2 access token.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::ProviderConfig;
use crate::error::{RelayError, Result};
use crate::lifecycle::StreamLease;

pub const GENERATE_COMMAND: &str = "CameraLiveStream.GenerateRtspStream";
pub const EXTEND_COMMAND: &str = "CameraLiveStream.ExtendRtspStream";
pub const STOP_COMMAND: &str = "CameraLiveStream.StopRtspStream";

/// Refresh the cached token this long before it actually expires, so a
/// burst of callers never races a token that dies mid-request.
const TOKEN_EXPIRY_SKEW: Duration = Duration::from_secs(30);

/// The single capability the relay core requires from the provider.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Execute a device command, returning the provider's `results` object.
    async fn execute_command(
        &self,
        camera_id: &str,
        command: &str,
        params: Value,
    ) -> Result<Value>;
}

/// Issue a fresh lease for `camera_id`.
pub async fn generate_stream(cp: &dyn ControlPlane, camera_id: &str) -> Result<StreamLease> {
    let results = cp.execute_command(camera_id, GENERATE_COMMAND, json!({})).await?;
    parse_lease(camera_id, &results)
}

/// Extend a live lease; returns the replacement token and expiry.
pub async fn extend_stream(
    cp: &dyn ControlPlane,
    camera_id: &str,
    extension_token: &str,
) -> Result<LeaseExtension> {
    let results = cp
        .execute_command(
            camera_id,
            EXTEND_COMMAND,
            json!({ "streamExtensionToken": extension_token }),
        )
        .await?;
    parse_extension(&results)
}

/// Tear a lease down; best-effort on shutdown.
pub async fn stop_stream(
    cp: &dyn ControlPlane,
    camera_id: &str,
    extension_token: &str,
) -> Result<()> {
    cp.execute_command(
        camera_id,
        STOP_COMMAND,
        json!({ "streamExtensionToken": extension_token }),
    )
    .await?;
    Ok(())
}

/// Replacement token and expiry returned by a successful Extend.
#[derive(Debug, Clone)]
pub struct LeaseExtension {
    pub extension_token: String,
    pub expires_at: DateTime<Utc>,
}

fn parse_lease(camera_id: &str, results: &Value) -> Result<StreamLease> {
    let stream_url = results
        .pointer("/streamUrls/rtspUrl")
        .and_then(Value::as_str)
        .ok_or_else(|| RelayError::Fatal("response missing streamUrls.rtspUrl".into()))?;
    let extension_token = results
        .get("streamExtensionToken")
        .and_then(Value::as_str)
        .ok_or_else(|| RelayError::Fatal("response missing streamExtensionToken".into()))?;
    let expires_at = parse_expiry(results)?;
    Ok(StreamLease {
        camera_id: camera_id.to_string(),
        stream_url: stream_url.to_string(),
        extension_token: extension_token.to_string(),
        issued_at: Utc::now(),
        expires_at,
    })
}

fn parse_extension(results: &Value) -> Result<LeaseExtension> {
    let extension_token = results
        .get("streamExtensionToken")
        .and_then(Value::as_str)
        .ok_or_else(|| RelayError::Fatal("response missing streamExtensionToken".into()))?;
    let expires_at = parse_expiry(results)?;
    Ok(LeaseExtension { extension_token: extension_token.to_string(), expires_at })
}

fn parse_expiry(results: &Value) -> Result<DateTime<Utc>> {
    let raw = results
        .get("expiresAt")
        .and_then(Value::as_str)
        .ok_or_else(|| RelayError::Fatal("response missing expiresAt".into()))?;
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RelayError::Fatal(format!("bad expiresAt '{raw}': {e}")))
}

/// Something that can hand out a currently-valid bearer token.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn access_token(&self) -> Result<String>;
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// OAuth2 refresh-token grant with a read-mostly cache. The common path is
/// a shared read of the cached token; refresh happens under the write lock
/// so concurrent callers do not stampede the token endpoint.
pub struct OauthTokenSource {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    refresh_token: String,
    cached: RwLock<Option<CachedToken>>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

impl OauthTokenSource {
    pub fn new(http: reqwest::Client, cfg: &ProviderConfig) -> Self {
        OauthTokenSource {
            http,
            token_url: cfg.token_url.clone(),
            client_id: cfg.client_id.clone(),
            client_secret: cfg.client_secret.clone(),
            refresh_token: cfg.refresh_token.clone(),
            cached: RwLock::new(None),
        }
    }

    async fn refresh(&self) -> Result<CachedToken> {
        debug!("Refreshing provider access token");
        let resp = self
            .http
            .post(&self.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", self.refresh_token.as_str()),
            ])
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(RelayError::Fatal(format!(
                "token refresh failed with HTTP {status}: {body}"
            )));
        }
        let parsed: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| RelayError::Fatal(format!("bad token response: {e}")))?;
        let ttl = Duration::from_secs(parsed.expires_in).saturating_sub(TOKEN_EXPIRY_SKEW);
        info!(ttl_s = ttl.as_secs(), "Provider access token refreshed");
        Ok(CachedToken { token: parsed.access_token, expires_at: Instant::now() + ttl })
    }
}

#[async_trait]
impl TokenSource for OauthTokenSource {
    async fn access_token(&self) -> Result<String> {
        {
            let cached = self.cached.read().await;
            if let Some(c) = cached.as_ref() {
                if c.expires_at > Instant::now() {
                    return Ok(c.token.clone());
                }
            }
        }
        let mut cached = self.cached.write().await;
        // Another caller may have refreshed while we waited for the lock.
        if let Some(c) = cached.as_ref() {
            if c.expires_at > Instant::now() {
                return Ok(c.token.clone());
            }
        }
        let fresh = self.refresh().await?;
        let token = fresh.token.clone();
        *cached = Some(fresh);
        Ok(token)
    }
}

/// Production control plane: POSTs `executeCommand` to the device API with
/// a bearer token from the [`TokenSource`].
pub struct HttpControlPlane {
    http: reqwest::Client,
    base_url: String,
    device_path: String,
    tokens: Arc<dyn TokenSource>,
}

impl HttpControlPlane {
    pub fn new(http: reqwest::Client, cfg: &ProviderConfig, tokens: Arc<dyn TokenSource>) -> Self {
        HttpControlPlane {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            device_path: cfg.device_path.trim_matches('/').to_string(),
            tokens,
        }
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn execute_command(
        &self,
        camera_id: &str,
        command: &str,
        params: Value,
    ) -> Result<Value> {
        let token = self.tokens.access_token().await?;
        let url = format!(
            "{}/{}/{}:executeCommand",
            self.base_url, self.device_path, camera_id
        );
        debug!(camera = camera_id, command, "Provider executeCommand");
        let resp = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&json!({ "command": command, "params": params }))
            .send()
            .await?;
        let status = resp.status().as_u16();
        let body = resp.text().await?;
        if !(200..300).contains(&status) {
            return Err(RelayError::classify_provider(status, &body));
        }
        let parsed: Value = serde_json::from_str(&body)
            .map_err(|e| RelayError::Transient(format!("unparseable provider response: {e}")))?;
        Ok(parsed.get("results").cloned().unwrap_or(Value::Null))
    }
}

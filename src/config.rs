use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{RelayError, Result};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Camera-provider control plane.
    pub provider: ProviderConfig,
    /// Hosted SFU control plane.
    pub sfu: SfuConfig,
    /// Relay tuning knobs (all optional, sane defaults).
    #[serde(default)]
    pub relay: RelayTuning,
    /// HTTP status API (optional).
    #[serde(default)]
    pub api: ApiConfig,
    /// Cameras to relay.
    pub cameras: Vec<CameraConfig>,
}

/// Camera-provider control-plane configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    /// Base URL of the device API, e.g.
    /// `https://smartdevicemanagement.googleapis.com/v1`.
    pub base_url: String,
    /// Path to device resources, e.g. `enterprises/<project>/devices`.
    pub device_path: String,
    /// OAuth2 token endpoint.
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
}

/// Hosted SFU control-plane configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct SfuConfig {
    /// Base URL of the SFU API, e.g. `https://rtc.example.com/v1/apps`.
    pub base_url: String,
    /// Application id appended to the base URL.
    pub app_id: String,
    /// Bearer token for the SFU API.
    pub app_token: String,
    /// STUN/TURN URLs handed to the peer connection.
    #[serde(default = "default_ice_urls")]
    pub ice_urls: Vec<String>,
}

/// HTTP status API configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_api_enabled")]
    pub enabled: bool,
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { enabled: default_api_enabled(), port: default_api_port() }
    }
}

fn default_api_enabled() -> bool { true }
fn default_api_port() -> u16 { 8080 }
fn default_ice_urls() -> Vec<String> {
    vec!["stun:stun.cloudflare.com:3478".to_string()]
}

/// Per-camera configuration.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CameraConfig {
    /// Provider device id, used as the fleet-wide camera id.
    pub id: String,
    /// Human-readable label shown in status output.
    pub name: String,
}

/// Relay tuning parameters. Every field has a default matching the shipped
/// behavior; override individual fields in the `[relay]` TOML table.
#[derive(Debug, Deserialize, Clone)]
pub struct RelayTuning {
    /// Control-plane budget in queries per minute.
    #[serde(default = "default_qpm")]
    pub qpm: u32,
    /// Gap between initial camera bring-ups.
    #[serde(default = "default_stagger_secs")]
    pub stagger_secs: u64,
    /// Submit Extend when time-to-expiry drops below this.
    #[serde(default = "default_extend_horizon_secs")]
    pub extend_horizon_secs: u64,
    /// Consecutive failures before a camera is marked Degraded.
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    /// Fixed retry interval while Degraded.
    #[serde(default = "default_degraded_retry_secs")]
    pub degraded_retry_secs: u64,
    /// First recovery delay; doubles per attempt.
    #[serde(default = "default_recovery_base_delay_secs")]
    pub recovery_base_delay_secs: u64,
    /// Recovery delay cap.
    #[serde(default = "default_recovery_max_delay_secs")]
    pub recovery_max_delay_secs: u64,
    /// Lifecycle monitor tick.
    #[serde(default = "default_monitor_tick_secs")]
    pub monitor_tick_secs: u64,
    /// Bounded per-track pacer channel capacity.
    #[serde(default = "default_pacer_capacity")]
    pub pacer_capacity: usize,
    /// Queue depth at which the pacer starts catching up.
    #[serde(default = "default_catchup_threshold")]
    pub catchup_threshold: usize,
    /// Divisor applied to the ideal delay while catching up.
    #[serde(default = "default_catchup_multiplier")]
    pub catchup_multiplier: f64,
    /// Upper bound on a single pacer sleep, in milliseconds.
    #[serde(default = "default_max_packet_delay_ms")]
    pub max_packet_delay_ms: u64,
    #[serde(default = "default_video_clock_rate")]
    pub video_clock_rate: u32,
    #[serde(default = "default_audio_clock_rate")]
    pub audio_clock_rate: u32,
    /// RTP payload MTU for repacketized video.
    #[serde(default = "default_mtu")]
    pub mtu: usize,
    /// Deadline for a single control-plane RPC.
    #[serde(default = "default_rpc_timeout_secs")]
    pub rpc_timeout_secs: u64,
    /// Bound on ICE candidate gathering.
    #[serde(default = "default_ice_gather_timeout_secs")]
    pub ice_gather_timeout_secs: u64,
    /// Orchestrator reconciliation interval.
    #[serde(default = "default_reconcile_secs")]
    pub reconcile_secs: u64,
    /// RTSP read deadline, re-armed per iteration.
    #[serde(default = "default_rtsp_read_timeout_secs")]
    pub rtsp_read_timeout_secs: u64,
    /// Interval between RTSP OPTIONS keep-alives.
    #[serde(default = "default_rtsp_keepalive_secs")]
    pub rtsp_keepalive_secs: u64,
}

fn default_qpm() -> u32 { 10 }
fn default_stagger_secs() -> u64 { 12 }
fn default_extend_horizon_secs() -> u64 { 90 }
fn default_max_failures() -> u32 { 5 }
fn default_degraded_retry_secs() -> u64 { 300 }
fn default_recovery_base_delay_secs() -> u64 { 10 }
fn default_recovery_max_delay_secs() -> u64 { 300 }
fn default_monitor_tick_secs() -> u64 { 5 }
fn default_pacer_capacity() -> usize { 10 }
fn default_catchup_threshold() -> usize { 5 }
fn default_catchup_multiplier() -> f64 { 1.1 }
fn default_max_packet_delay_ms() -> u64 { 200 }
fn default_video_clock_rate() -> u32 { 90_000 }
fn default_audio_clock_rate() -> u32 { 48_000 }
fn default_mtu() -> usize { 1200 }
fn default_rpc_timeout_secs() -> u64 { 30 }
fn default_ice_gather_timeout_secs() -> u64 { 10 }
fn default_reconcile_secs() -> u64 { 10 }
fn default_rtsp_read_timeout_secs() -> u64 { 10 }
fn default_rtsp_keepalive_secs() -> u64 { 25 }

impl Default for RelayTuning {
    fn default() -> Self {
        Self {
            qpm: default_qpm(),
            stagger_secs: default_stagger_secs(),
            extend_horizon_secs: default_extend_horizon_secs(),
            max_failures: default_max_failures(),
            degraded_retry_secs: default_degraded_retry_secs(),
            recovery_base_delay_secs: default_recovery_base_delay_secs(),
            recovery_max_delay_secs: default_recovery_max_delay_secs(),
            monitor_tick_secs: default_monitor_tick_secs(),
            pacer_capacity: default_pacer_capacity(),
            catchup_threshold: default_catchup_threshold(),
            catchup_multiplier: default_catchup_multiplier(),
            max_packet_delay_ms: default_max_packet_delay_ms(),
            video_clock_rate: default_video_clock_rate(),
            audio_clock_rate: default_audio_clock_rate(),
            mtu: default_mtu(),
            rpc_timeout_secs: default_rpc_timeout_secs(),
            ice_gather_timeout_secs: default_ice_gather_timeout_secs(),
            reconcile_secs: default_reconcile_secs(),
            rtsp_read_timeout_secs: default_rtsp_read_timeout_secs(),
            rtsp_keepalive_secs: default_rtsp_keepalive_secs(),
        }
    }
}

impl RelayTuning {
    pub fn stagger(&self) -> Duration { Duration::from_secs(self.stagger_secs) }
    pub fn extend_horizon(&self) -> Duration { Duration::from_secs(self.extend_horizon_secs) }
    pub fn degraded_retry(&self) -> Duration { Duration::from_secs(self.degraded_retry_secs) }
    pub fn recovery_base_delay(&self) -> Duration { Duration::from_secs(self.recovery_base_delay_secs) }
    pub fn recovery_max_delay(&self) -> Duration { Duration::from_secs(self.recovery_max_delay_secs) }
    pub fn monitor_tick(&self) -> Duration { Duration::from_secs(self.monitor_tick_secs) }
    pub fn max_packet_delay(&self) -> Duration { Duration::from_millis(self.max_packet_delay_ms) }
    pub fn rpc_timeout(&self) -> Duration { Duration::from_secs(self.rpc_timeout_secs) }
    pub fn ice_gather_timeout(&self) -> Duration { Duration::from_secs(self.ice_gather_timeout_secs) }
    pub fn reconcile_interval(&self) -> Duration { Duration::from_secs(self.reconcile_secs) }
    pub fn rtsp_read_timeout(&self) -> Duration { Duration::from_secs(self.rtsp_read_timeout_secs) }
    pub fn rtsp_keepalive(&self) -> Duration { Duration::from_secs(self.rtsp_keepalive_secs) }
}

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RelayError::Config(format!("Cannot read config file: {e}")))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| RelayError::Config(format!("Invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cameras.is_empty() {
            return Err(RelayError::Config("No cameras defined".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for cam in &self.cameras {
            if !seen.insert(&cam.id) {
                return Err(RelayError::Config(format!("Duplicate camera id '{}'", cam.id)));
            }
        }
        if self.relay.qpm == 0 {
            return Err(RelayError::Config("relay.qpm must be > 0".into()));
        }
        if self.relay.catchup_multiplier <= 1.0 {
            return Err(RelayError::Config("relay.catchup_multiplier must be > 1.0".into()));
        }
        if self.relay.pacer_capacity == 0 {
            return Err(RelayError::Config("relay.pacer_capacity must be > 0".into()));
        }
        if self.relay.mtu < 64 {
            return Err(RelayError::Config("relay.mtu must be >= 64".into()));
        }
        if self.relay.max_failures == 0 {
            return Err(RelayError::Config("relay.max_failures must be > 0".into()));
        }
        Ok(())
    }
}

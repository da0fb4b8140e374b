//! Wacast configuration system.
//!
//! Loaded from `~/.wacast/config.toml` when present, with environment
//! overrides for the pieces operators actually set per deployment
//! (`WACAST_DATA_DIR`, `DASH_USER`, `DASH_PASS`, `WACAST_BRIDGE_URL`).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, WacastError};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WacastConfig {
    /// Directory holding the JSON document, media uploads, and the lock.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Dashboard account synthesized from the environment on every read.
    #[serde(default = "default_dash_user")]
    pub dash_user: String,
    #[serde(default = "default_dash_pass")]
    pub dash_pass: String,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".wacast")
        .join("data")
}
fn default_dash_user() -> String {
    "admin".into()
}
fn default_dash_pass() -> String {
    "admin123".into()
}

impl Default for WacastConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            dash_user: default_dash_user(),
            dash_pass: default_dash_pass(),
            worker: WorkerConfig::default(),
            lock: LockConfig::default(),
            bridge: BridgeConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

impl WacastConfig {
    /// Load from the default path, falling back to defaults, then apply
    /// environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// Load config from a specific path (no env overrides).
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| WacastError::Config(format!("failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| WacastError::Config(format!("failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Environment variables win over the file.
    pub fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("WACAST_DATA_DIR") {
            if !dir.trim().is_empty() {
                self.data_dir = PathBuf::from(dir);
            }
        }
        if let Ok(user) = std::env::var("DASH_USER") {
            if !user.trim().is_empty() {
                self.dash_user = user.trim().to_string();
            }
        }
        if let Ok(pass) = std::env::var("DASH_PASS") {
            if !pass.is_empty() {
                self.dash_pass = pass;
            }
        }
        if let Ok(url) = std::env::var("WACAST_BRIDGE_URL") {
            if !url.trim().is_empty() {
                self.bridge.base_url = url.trim().to_string();
            }
        }
    }

    /// Default config path (~/.wacast/config.toml).
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".wacast")
            .join("config.toml")
    }

    /// Path of the JSON document inside the data directory.
    pub fn document_path(&self) -> PathBuf {
        self.data_dir.join("data.json")
    }
}

/// Worker loop tuning. Defaults match the production deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// How often missing per-user messengers are (re)connected.
    #[serde(default = "default_messenger_sync_ms")]
    pub messenger_sync_interval_ms: u64,
    /// Retry spacing for status broadcasts inside a delivery window.
    #[serde(default = "default_retry_interval_ms")]
    pub status_retry_interval_ms: i64,
    /// Retry spacing for message-flow sends.
    #[serde(default = "default_retry_interval_ms")]
    pub flow_retry_interval_ms: i64,
    /// Attempt budget per message-flow send (terminal failure after).
    #[serde(default = "default_flow_max_attempts")]
    pub flow_max_attempts: u32,
    #[serde(default = "default_wait_reply_timeout_ms")]
    pub wait_reply_timeout_ms: i64,
    /// Minimum spacing of skipped-tick and store-busy log entries.
    #[serde(default = "default_guard_log_interval_ms")]
    pub guard_log_interval_ms: i64,
    /// Minimum per-user spacing of session-desync log entries.
    #[serde(default = "default_desync_log_interval_ms")]
    pub desync_log_interval_ms: i64,
}

fn default_tick_interval_ms() -> u64 {
    1000
}
fn default_messenger_sync_ms() -> u64 {
    3000
}
fn default_retry_interval_ms() -> i64 {
    15_000
}
fn default_flow_max_attempts() -> u32 {
    3
}
fn default_wait_reply_timeout_ms() -> i64 {
    24 * 60 * 60 * 1000
}
fn default_guard_log_interval_ms() -> i64 {
    30_000
}
fn default_desync_log_interval_ms() -> i64 {
    60_000
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            messenger_sync_interval_ms: default_messenger_sync_ms(),
            status_retry_interval_ms: default_retry_interval_ms(),
            flow_retry_interval_ms: default_retry_interval_ms(),
            flow_max_attempts: default_flow_max_attempts(),
            wait_reply_timeout_ms: default_wait_reply_timeout_ms(),
            guard_log_interval_ms: default_guard_log_interval_ms(),
            desync_log_interval_ms: default_desync_log_interval_ms(),
        }
    }
}

/// Document-lock tuning (staleness, heartbeat, acquisition retries).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lock holder presumed dead after this long without a heartbeat.
    #[serde(default = "default_stale_ms")]
    pub stale_ms: u64,
    /// Heartbeat refresh interval while the lock is held.
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    #[serde(default = "default_lock_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_min_delay_ms")]
    pub retry_min_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

fn default_stale_ms() -> u64 {
    15_000
}
fn default_heartbeat_ms() -> u64 {
    5_000
}
fn default_lock_retries() -> u32 {
    40
}
fn default_retry_min_delay_ms() -> u64 {
    50
}
fn default_retry_max_delay_ms() -> u64 {
    500
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_ms: default_stale_ms(),
            heartbeat_ms: default_heartbeat_ms(),
            retries: default_lock_retries(),
            retry_min_delay_ms: default_retry_min_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

/// WhatsApp sidecar bridge endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_bridge_url")]
    pub base_url: String,
    /// Optional bearer token for the bridge.
    #[serde(default)]
    pub token: String,
    /// Bridge event-poll interval.
    #[serde(default = "default_bridge_poll_ms")]
    pub poll_interval_ms: u64,
}

fn default_bridge_url() -> String {
    "http://127.0.0.1:3500".into()
}
fn default_bridge_poll_ms() -> u64 {
    2000
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            base_url: default_bridge_url(),
            token: String::new(),
            poll_interval_ms: default_bridge_poll_ms(),
        }
    }
}

/// HTTP gateway binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_host")]
    pub host: String,
    #[serde(default = "default_gateway_port")]
    pub port: u16,
}

fn default_gateway_host() -> String {
    "127.0.0.1".into()
}
fn default_gateway_port() -> u16 {
    8080
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_gateway_host(),
            port: default_gateway_port(),
        }
    }
}

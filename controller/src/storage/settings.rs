//! Settings file management

use std::path::Path;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::OtaError;
use crate::logs::LogLevel;

/// Default settings file location
pub const DEFAULT_SETTINGS_PATH: &str = "/etc/fleetota/settings.json";

/// Controller settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit logs as JSON lines
    #[serde(default)]
    pub log_json: bool,

    /// Also write daily-rolling log files here
    #[serde(default)]
    pub log_dir: Option<String>,

    /// MQTT broker configuration
    #[serde(default)]
    pub mqtt: MqttSettings,

    /// Command dispatch RPC configuration
    #[serde(default)]
    pub rpc: RpcSettings,

    /// Status merge pipeline tuning
    #[serde(default)]
    pub pipeline: PipelineSettings,

    /// Upgrade state machine tuning
    #[serde(default)]
    pub ota: OtaSettings,

    /// Command garbage collection
    #[serde(default)]
    pub gc: GcSettings,

    /// Reconciliation workers
    #[serde(default)]
    pub controller: ControllerSettings,
}

impl Settings {
    /// Read settings from a JSON file; a missing file yields the defaults
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, OtaError> {
        let path = path.as_ref();
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No settings file at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        let settings: Settings = serde_json::from_slice(&raw)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject settings that would wedge a worker
    pub fn validate(&self) -> Result<(), OtaError> {
        let checks = [
            (self.mqtt.topic_root.trim().is_empty(), "mqtt.topic_root must not be empty"),
            (self.pipeline.capacity == 0, "pipeline.capacity must be positive"),
            (self.pipeline.flush_interval_ms == 0, "pipeline.flush_interval_ms must be positive"),
            (self.pipeline.flush_threshold == 0, "pipeline.flush_threshold must be positive"),
            (self.ota.base_delay_secs == 0, "ota.base_delay_secs must be positive"),
            (self.ota.command_timeout_secs == 0, "ota.command_timeout_secs must be positive"),
            (self.gc.interval_secs == 0, "gc.interval_secs must be positive"),
            (self.gc.retention_days == 0, "gc.retention_days must be positive"),
            (self.controller.workers == 0, "controller.workers must be positive"),
        ];
        for (failed, message) in checks {
            if failed {
                return Err(OtaError::ConfigError(message.to_string()));
            }
        }
        if let Some(ref base_url) = self.rpc.base_url {
            url::Url::parse(base_url)
                .map_err(|e| OtaError::ConfigError(format!("rpc.base_url {base_url}: {e}")))?;
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

/// MQTT broker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttSettings {
    /// Broker host; empty disables the bus
    #[serde(default)]
    pub host: String,

    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    #[serde(default = "default_true")]
    pub tls: bool,

    /// Optional path to a PEM-encoded CA certificate for broker TLS verification.
    /// When absent, the system certificate store is used.
    #[serde(default)]
    pub ca_cert_path: Option<String>,

    /// MQTT client id; a random one is generated when absent
    #[serde(default)]
    pub client_id: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default, skip_serializing)]
    pub password: Option<SecretString>,

    /// First segment of every topic
    #[serde(default = "default_topic_root")]
    pub topic_root: String,

    /// Shared subscription group; lets several controller replicas split the load
    #[serde(default)]
    pub share_group: Option<String>,

    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
}

fn default_mqtt_port() -> u16 {
    8883
}

fn default_topic_root() -> String {
    "fleet".to_string()
}

fn default_keep_alive() -> u64 {
    30
}

fn default_reconnect_delay() -> u64 {
    5
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_mqtt_port(),
            tls: true,
            ca_cert_path: None,
            client_id: None,
            username: None,
            password: None,
            topic_root: default_topic_root(),
            share_group: None,
            keep_alive_secs: default_keep_alive(),
            reconnect_delay_secs: default_reconnect_delay(),
        }
    }
}

/// Command dispatch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcSettings {
    /// Dispatch gateway; when absent commands are published over MQTT
    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default = "default_rpc_timeout")]
    pub timeout_secs: u64,

    /// Template for firmware download URLs, `{version}` and `{vehicle}` are substituted
    #[serde(default = "default_firmware_url_template")]
    pub firmware_url_template: String,
}

fn default_rpc_timeout() -> u64 {
    10
}

fn default_firmware_url_template() -> String {
    "https://firmware.invalid/{vehicle}/{version}.bin".to_string()
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_secs: default_rpc_timeout(),
            firmware_url_template: default_firmware_url_template(),
        }
    }
}

/// Status merge pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    #[serde(default = "default_flush_threshold")]
    pub flush_threshold: usize,
}

fn default_capacity() -> usize {
    5000
}

fn default_flush_interval_ms() -> u64 {
    1000
}

fn default_flush_threshold() -> usize {
    1000
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            flush_interval_ms: default_flush_interval_ms(),
            flush_threshold: default_flush_threshold(),
        }
    }
}

/// Upgrade state machine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtaSettings {
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,

    #[serde(default = "default_base_delay")]
    pub base_delay_secs: u64,

    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    #[serde(default = "default_pending_requeue")]
    pub pending_requeue_secs: u64,
}

fn default_max_retry_count() -> u32 {
    5
}

fn default_base_delay() -> u64 {
    60
}

fn default_command_timeout() -> u64 {
    600
}

fn default_pending_requeue() -> u64 {
    30
}

impl Default for OtaSettings {
    fn default() -> Self {
        Self {
            max_retry_count: default_max_retry_count(),
            base_delay_secs: default_base_delay(),
            command_timeout_secs: default_command_timeout(),
            pending_requeue_secs: default_pending_requeue(),
        }
    }
}

/// Garbage collector settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcSettings {
    #[serde(default = "default_gc_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
}

fn default_gc_interval() -> u64 {
    3600
}

fn default_retention_days() -> u64 {
    30
}

impl Default for GcSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_gc_interval(),
            retention_days: default_retention_days(),
        }
    }
}

impl GcSettings {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days * 24 * 3600)
    }
}

/// Reconciliation worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerSettings {
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_max_error_backoff")]
    pub max_error_backoff_secs: u64,
}

fn default_workers() -> usize {
    4
}

fn default_max_error_backoff() -> u64 {
    300
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_error_backoff_secs: default_max_error_backoff(),
        }
    }
}

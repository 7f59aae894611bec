//! Application configuration options

use std::time::Duration;

use crate::mqtt::bus;
use crate::mqtt::client::{MqttAddress, SessionOptions};
use crate::ota::OtaOptions;
use crate::storage::settings::Settings;
use crate::utils::CooldownOptions;
use crate::workers::{gc, status};

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Broker connection and topic layout
    pub mqtt: MqttOptions,

    /// Dispatch gateway; commands are published over MQTT when absent
    pub rpc_base_url: Option<String>,

    pub rpc_timeout: Duration,

    pub firmware_url_template: String,

    /// Status merge pipeline options
    pub pipeline: status::Options,

    /// Upgrade state machine options
    pub ota: OtaOptions,

    /// In-flight commands are timed out after this long
    pub command_timeout: Duration,

    /// Garbage collector options
    pub gc: gc::Options,

    /// Reconcile worker options
    pub controller: ControllerOptions,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            mqtt: MqttOptions::default(),
            rpc_base_url: None,
            rpc_timeout: Duration::from_secs(10),
            firmware_url_template: "https://firmware.invalid/{vehicle}/{version}.bin".to_string(),
            pipeline: status::Options::default(),
            ota: OtaOptions::default(),
            command_timeout: Duration::from_secs(600),
            gc: gc::Options::default(),
            controller: ControllerOptions::default(),
        }
    }
}

impl From<&Settings> for AppOptions {
    fn from(settings: &Settings) -> Self {
        let mut session = SessionOptions {
            username: settings.mqtt.username.clone(),
            password: settings.mqtt.password.clone(),
            keep_alive: Duration::from_secs(settings.mqtt.keep_alive_secs),
            ..Default::default()
        };
        if let Some(ref client_id) = settings.mqtt.client_id {
            session.client_id = client_id.clone();
        }

        Self {
            lifecycle: LifecycleOptions::default(),
            mqtt: MqttOptions {
                address: MqttAddress {
                    host: settings.mqtt.host.clone(),
                    port: settings.mqtt.port,
                    use_tls: settings.mqtt.tls,
                    ca_cert_path: settings.mqtt.ca_cert_path.clone(),
                },
                session,
                bus: bus::Options {
                    reconnect_delay: Duration::from_secs(settings.mqtt.reconnect_delay_secs),
                },
                topic_root: settings.mqtt.topic_root.clone(),
                share_group: settings.mqtt.share_group.clone(),
            },
            rpc_base_url: settings.rpc.base_url.clone(),
            rpc_timeout: Duration::from_secs(settings.rpc.timeout_secs),
            firmware_url_template: settings.rpc.firmware_url_template.clone(),
            pipeline: status::Options {
                capacity: settings.pipeline.capacity,
                flush_interval: Duration::from_millis(settings.pipeline.flush_interval_ms),
                flush_threshold: settings.pipeline.flush_threshold,
            },
            ota: OtaOptions {
                max_retry_count: settings.ota.max_retry_count,
                base_delay: Duration::from_secs(settings.ota.base_delay_secs),
                pending_requeue: Duration::from_secs(settings.ota.pending_requeue_secs),
            },
            command_timeout: Duration::from_secs(settings.ota.command_timeout_secs),
            gc: gc::Options {
                interval: Duration::from_secs(settings.gc.interval_secs),
                retention: settings.gc.retention(),
            },
            controller: ControllerOptions {
                workers: settings.controller.workers,
                error_backoff: CooldownOptions {
                    max_delay: Duration::from_secs(settings.controller.max_error_backoff_secs),
                    ..Default::default()
                },
            },
        }
    }
}

/// Lifecycle options for the controller
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// Broker options
#[derive(Debug, Clone)]
pub struct MqttOptions {
    /// Broker address; an empty host disables the bus
    pub address: MqttAddress,

    pub session: SessionOptions,

    pub bus: bus::Options,

    pub topic_root: String,

    pub share_group: Option<String>,
}

impl Default for MqttOptions {
    fn default() -> Self {
        Self {
            address: MqttAddress::default(),
            session: SessionOptions::default(),
            bus: bus::Options::default(),
            topic_root: "fleet".to_string(),
            share_group: None,
        }
    }
}

/// Reconcile worker options, shared by the vehicle and command controllers
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Concurrent workers per controller
    pub workers: usize,

    /// Requeue backoff after a failed pass
    pub error_backoff: CooldownOptions,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            error_backoff: CooldownOptions::default(),
        }
    }
}

//! MQTT transport built on rumqttc

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, EventLoop, MqttOptions, QoS};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::errors::OtaError;

/// MQTT broker address
#[derive(Debug, Clone)]
pub struct MqttAddress {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    /// Optional path to a PEM-encoded CA certificate for broker verification.
    /// When `None` and `use_tls` is `true`, the system certificate store is used.
    pub ca_cert_path: Option<String>,
}

impl Default for MqttAddress {
    fn default() -> Self {
        Self {
            host: "".to_string(),
            port: 8883,
            use_tls: true,
            ca_cert_path: None,
        }
    }
}

/// Session parameters for the controller's broker connection
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    pub keep_alive: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            client_id: format!("fleetota-{}", crate::utils::generate_uuid()),
            username: None,
            password: None,
            keep_alive: Duration::from_secs(30),
        }
    }
}

/// Minimal broker surface the bus needs; faked in tests
#[async_trait]
pub trait Transport: Send + Sync {
    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), OtaError>;

    async fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<(), OtaError>;

    async fn disconnect(&self) -> Result<(), OtaError>;
}

/// rumqttc-backed transport. The paired [`EventLoop`] must be polled for
/// anything to reach the broker.
pub struct MqttTransport {
    client: AsyncClient,
}

impl MqttTransport {
    /// Create the client and its event loop; connection happens on first poll
    pub fn new(
        address: &MqttAddress,
        session: &SessionOptions,
    ) -> Result<(Self, EventLoop), OtaError> {
        if address.host.is_empty() {
            return Err(OtaError::MqttError("MQTT host is not configured".to_string()));
        }

        let mut options = MqttOptions::new(&session.client_id, &address.host, address.port);
        options.set_keep_alive(session.keep_alive);
        // Subscriptions are re-issued by the bus on every ConnAck
        options.set_clean_session(true);
        if let Some(ref username) = session.username {
            let password = session
                .password
                .as_ref()
                .map(|p| p.expose_secret().to_string())
                .unwrap_or_default();
            options.set_credentials(username, password);
        }

        if address.use_tls {
            use rumqttc::{TlsConfiguration, Transport as RumqttTransport};
            use rustls::ClientConfig;
            use std::sync::Arc;

            let mut root_cert_store = rustls::RootCertStore::empty();

            if let Some(ref ca_path) = address.ca_cert_path {
                let ca_pem = std::fs::read(ca_path).map_err(|e| {
                    OtaError::MqttError(format!("Failed to read CA cert {ca_path}: {e}"))
                })?;
                let mut cursor = std::io::Cursor::new(ca_pem);
                for cert in rustls_pemfile::certs(&mut cursor).flatten() {
                    let _ = root_cert_store.add(cert);
                }
            } else {
                for cert in rustls_native_certs::load_native_certs().unwrap_or_default() {
                    let _ = root_cert_store.add(cert);
                }
            }

            let client_config = ClientConfig::builder()
                .with_root_certificates(root_cert_store)
                .with_no_client_auth();

            options.set_transport(RumqttTransport::tls_with_config(TlsConfiguration::Rustls(
                Arc::new(client_config),
            )));
        }

        info!(
            client_id = %session.client_id,
            "MQTT client configured for {}:{}", address.host, address.port
        );
        let (client, eventloop) = AsyncClient::new(options, 64);
        Ok((Self { client }, eventloop))
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), OtaError> {
        self.client
            .subscribe(filter, qos)
            .await
            .map_err(|e| OtaError::MqttError(e.to_string()))?;
        debug!("Subscribe requested: {}", filter);
        Ok(())
    }

    async fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<(), OtaError> {
        self.client
            .publish(topic, qos, false, payload)
            .await
            .map_err(|e| OtaError::MqttError(e.to_string()))?;
        debug!("Published to: {}", topic);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), OtaError> {
        self.client
            .disconnect()
            .await
            .map_err(|e| OtaError::MqttError(e.to_string()))?;
        info!("MQTT disconnected");
        Ok(())
    }
}

/// MQTT message
#[derive(Debug, Clone)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl MqttMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Parse payload as JSON
    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T, OtaError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| OtaError::ValidationError(format!("{}: {}", self.topic, e)))
    }
}

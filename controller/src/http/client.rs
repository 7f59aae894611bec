//! HTTP client for the fleet backend

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, error};

use crate::dispatch::channel::{CommandChannel, DispatchRequest, DispatchResponse};
use crate::errors::OtaError;
use crate::ota::firmware::FirmwareUrlProvider;

/// HTTP client for backend communication
pub struct HttpClient {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct FirmwareUrlResponse {
    url: String,
}

impl HttpClient {
    /// Create a new HTTP client; every request is bounded by `timeout`
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, OtaError> {
        url::Url::parse(base_url)
            .map_err(|e| OtaError::ConfigError(format!("invalid backend url {}: {}", base_url, e)))?;

        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Make a GET request
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, OtaError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("GET {}", url);

        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("HTTP GET failed: {} - {}", status, body);
            return Err(OtaError::RpcError(format!("{}: {}", status, body)));
        }

        let body = response.json().await?;
        Ok(body)
    }

    /// Make a POST request
    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, OtaError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("POST {}", url);

        let response = self.client.post(&url).json(body).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("HTTP POST failed: {} - {}", status, body);
            return Err(OtaError::RpcError(format!("{}: {}", status, body)));
        }

        let body = response.json().await?;
        Ok(body)
    }
}

#[async_trait]
impl CommandChannel for HttpClient {
    async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchResponse, OtaError> {
        self.post("/commands", request).await
    }
}

#[async_trait]
impl FirmwareUrlProvider for HttpClient {
    async fn firmware_url(&self, vehicle_id: &str, version: &str) -> Result<String, OtaError> {
        let path = format!("/firmware/{}/{}/url", vehicle_id, version);
        let response: FirmwareUrlResponse = self.get(&path).await?;
        Ok(response.url)
    }
}

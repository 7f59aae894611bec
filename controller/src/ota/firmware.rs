//! Firmware download locations handed to devices

use async_trait::async_trait;

use crate::errors::OtaError;

/// Resolves where a vehicle can fetch a firmware image
#[async_trait]
pub trait FirmwareUrlProvider: Send + Sync {
    async fn firmware_url(&self, vehicle_id: &str, version: &str) -> Result<String, OtaError>;
}

/// Fills `{vehicle}` and `{version}` in a fixed URL template
#[derive(Debug, Clone)]
pub struct TemplateUrlProvider {
    template: String,
}

impl TemplateUrlProvider {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }
}

#[async_trait]
impl FirmwareUrlProvider for TemplateUrlProvider {
    async fn firmware_url(&self, vehicle_id: &str, version: &str) -> Result<String, OtaError> {
        if version.is_empty() {
            return Err(OtaError::ValidationError(format!(
                "no firmware version for vehicle {}",
                vehicle_id
            )));
        }
        Ok(self
            .template
            .replace("{vehicle}", vehicle_id)
            .replace("{version}", version))
    }
}

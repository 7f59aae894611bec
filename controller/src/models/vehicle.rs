//! Vehicle record: desired firmware in, reported firmware and upgrade progress out

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::condition::Condition;
use crate::storage::object::{Object, ObjectMeta};

/// Coarse upgrade lifecycle stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OtaPhase {
    #[default]
    Idle,
    Pending,
    Succeeded,
    Failed,
}

impl fmt::Display for OtaPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OtaPhase::Idle => "Idle",
            OtaPhase::Pending => "Pending",
            OtaPhase::Succeeded => "Succeeded",
            OtaPhase::Failed => "Failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleSpec {
    /// Firmware the fleet operator wants on this vehicle; empty means "no opinion"
    #[serde(default)]
    pub desired_version: String,

    #[serde(default)]
    pub desired_config: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleStatus {
    #[serde(default)]
    pub reported_version: String,

    #[serde(default)]
    pub online: bool,

    pub last_heartbeat: Option<DateTime<Utc>>,

    #[serde(default)]
    pub phase: OtaPhase,

    #[serde(default)]
    pub retry_count: u32,

    #[serde(default)]
    pub message: String,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vehicle {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: VehicleSpec,
    #[serde(default)]
    pub status: VehicleStatus,
}

impl Vehicle {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::new(id),
            spec: VehicleSpec::default(),
            status: VehicleStatus::default(),
        }
    }

    pub fn with_desired_version(mut self, version: impl Into<String>) -> Self {
        self.spec.desired_version = version.into();
        self
    }

    pub fn with_reported_version(mut self, version: impl Into<String>) -> Self {
        self.status.reported_version = version.into();
        self
    }

    pub fn id(&self) -> &str {
        &self.metadata.name
    }

    /// An upgrade is wanted and not yet reflected by the device
    pub fn needs_upgrade(&self) -> bool {
        !self.spec.desired_version.is_empty()
            && self.spec.desired_version != self.status.reported_version
    }
}

impl Object for Vehicle {
    type Spec = VehicleSpec;
    type Status = VehicleStatus;

    const KIND: &'static str = "Vehicle";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn spec(&self) -> &VehicleSpec {
        &self.spec
    }

    fn status(&self) -> &VehicleStatus {
        &self.status
    }

    fn status_mut(&mut self) -> &mut VehicleStatus {
        &mut self.status
    }

    fn phase(&self) -> String {
        self.status.phase.to_string()
    }
}

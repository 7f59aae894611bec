//! Command record: one instruction sent to one vehicle

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::condition::Condition;
use crate::storage::object::{Object, ObjectMeta};
use crate::utils::{sha256_hash, slugify};

/// Label carrying the owning vehicle's id
pub const VEHICLE_LABEL: &str = "fleetota.io/vehicle";

/// Label carrying the slugged target firmware version
pub const TARGET_VERSION_LABEL: &str = "fleetota.io/target-version";

/// Command type for firmware upgrades
pub const OTA_UPGRADE: &str = "ota_upgrade";

/// Parameter keys understood by the device agent
pub mod params {
    pub const VERSION: &str = "version";
    pub const RETRY: &str = "retry";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CommandPhase {
    #[default]
    Pending,
    Sent,
    Acknowledged,
    Running,
    Succeeded,
    Failed,
    Timeout,
}

impl CommandPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandPhase::Succeeded | CommandPhase::Failed | CommandPhase::Timeout
        )
    }

    /// Position along the forward-only lifecycle; all terminal phases share the last rank
    pub fn rank(&self) -> u8 {
        match self {
            CommandPhase::Pending => 0,
            CommandPhase::Sent => 1,
            CommandPhase::Acknowledged => 2,
            CommandPhase::Running => 3,
            CommandPhase::Succeeded | CommandPhase::Failed | CommandPhase::Timeout => 4,
        }
    }

    /// The device has been told about the command and has not finished it
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            CommandPhase::Sent | CommandPhase::Acknowledged | CommandPhase::Running
        )
    }
}

impl fmt::Display for CommandPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandPhase::Pending => "Pending",
            CommandPhase::Sent => "Sent",
            CommandPhase::Acknowledged => "Acknowledged",
            CommandPhase::Running => "Running",
            CommandPhase::Succeeded => "Succeeded",
            CommandPhase::Failed => "Failed",
            CommandPhase::Timeout => "Timeout",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandSpec {
    pub vehicle_id: String,

    /// Method the device agent should run, e.g. `ota_upgrade`
    pub command_type: String,

    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandStatus {
    #[serde(default)]
    pub phase: CommandPhase,

    #[serde(default)]
    pub message: String,

    pub sent_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub metadata: ObjectMeta,
    pub spec: CommandSpec,
    #[serde(default)]
    pub status: CommandStatus,
}

/// Hex digits of the identity hash kept in command names
const NAME_HASH_LEN: usize = 10;

/// Deterministic command name for one upgrade attempt.
///
/// The slug keeps names readable; the hash over the raw vehicle id and
/// version keeps `1.2.0` and `1-2-0` apart. Each retry gets a fresh record
/// instead of colliding with the stale one.
pub fn command_name(vehicle_id: &str, version: &str, retry_count: u32) -> String {
    let identity = format!("{}\0{}", vehicle_id, version);
    let hash = sha256_hash(identity.as_bytes());
    format!(
        "{}-ota-{}-{}-{}",
        vehicle_id,
        slugify(version),
        &hash[..NAME_HASH_LEN],
        retry_count
    )
}

impl Command {
    /// Build the upgrade command for `(vehicle, version, retry_count)`
    pub fn ota_upgrade(vehicle_id: &str, version: &str, retry_count: u32) -> Self {
        let metadata = ObjectMeta::new(command_name(vehicle_id, version, retry_count))
            .with_label(VEHICLE_LABEL, vehicle_id)
            .with_label(TARGET_VERSION_LABEL, slugify(version));

        let mut parameters = BTreeMap::new();
        parameters.insert(params::VERSION.to_string(), version.to_string());
        parameters.insert(params::RETRY.to_string(), retry_count.to_string());

        Self {
            metadata,
            spec: CommandSpec {
                vehicle_id: vehicle_id.to_string(),
                command_type: OTA_UPGRADE.to_string(),
                parameters,
            },
            status: CommandStatus::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Timestamp the retention window is measured from
    pub fn age_anchor(&self) -> DateTime<Utc> {
        self.status.completed_at.unwrap_or(self.metadata.created_at)
    }

    /// Whether this command upgrades `vehicle_id` to exactly `version`
    pub fn is_attempt_of(&self, vehicle_id: &str, version: &str) -> bool {
        self.spec.vehicle_id == vehicle_id
            && self.spec.parameters.get(params::VERSION).map(String::as_str) == Some(version)
    }

    /// Move to `phase`, stamping the matching timestamp
    pub fn set_phase(&mut self, phase: CommandPhase, message: impl Into<String>) {
        let now = Utc::now();
        match phase {
            CommandPhase::Sent => {
                self.status.sent_at.get_or_insert(now);
            }
            CommandPhase::Acknowledged | CommandPhase::Running => {
                self.status.acknowledged_at.get_or_insert(now);
            }
            CommandPhase::Succeeded | CommandPhase::Failed | CommandPhase::Timeout => {
                self.status.completed_at.get_or_insert(now);
            }
            CommandPhase::Pending => {}
        }
        self.status.phase = phase;
        self.status.message = message.into();
    }
}

impl Object for Command {
    type Spec = CommandSpec;
    type Status = CommandStatus;

    const KIND: &'static str = "Command";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    fn status(&self) -> &CommandStatus {
        &self.status
    }

    fn status_mut(&mut self) -> &mut CommandStatus {
        &mut self.status
    }

    fn phase(&self) -> String {
        self.status.phase.to_string()
    }
}

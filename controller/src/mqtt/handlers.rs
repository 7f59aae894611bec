//! Handlers for device-originated topics

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rumqttc::QoS;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::OtaError;
use crate::models::command::{Command, CommandPhase};
use crate::models::condition::{remove_condition, set_condition, types, Condition, ConditionStatus};
use crate::models::vehicle::Vehicle;
use crate::mqtt::bus::{Bus, MessageHandler};
use crate::mqtt::client::{MqttMessage, Transport};
use crate::mqtt::events::{DeviceEvent, EventTable};
use crate::mqtt::topics::last_segment;
use crate::ota::firmware::FirmwareUrlProvider;
use crate::storage::Store;
use crate::workers::status::{StatusPipeline, StatusUpdate};

/// Attempts for an ack write that keeps losing to concurrent writers
const ACK_WRITE_ATTEMPTS: usize = 3;

fn vehicle_from_topic(msg: &MqttMessage) -> Result<String, OtaError> {
    last_segment(&msg.topic)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| OtaError::ValidationError(format!("no vehicle id in topic {}", msg.topic)))
}

/// Empty payloads read as the type's default
fn parse_or_default<T: DeserializeOwned + Default>(msg: &MqttMessage) -> Result<T, OtaError> {
    if msg.payload.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    msg.parse_json()
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterPayload {
    vehicle_id: Option<String>,
    firmware_version: Option<String>,
}

/// First contact: make sure the vehicle exists and mark it online
pub struct RegisterHandler {
    vehicles: Arc<dyn Store<Vehicle>>,
    pipeline: StatusPipeline,
}

impl RegisterHandler {
    pub fn new(vehicles: Arc<dyn Store<Vehicle>>, pipeline: StatusPipeline) -> Self {
        Self { vehicles, pipeline }
    }
}

#[async_trait]
impl MessageHandler for RegisterHandler {
    async fn handle(&self, msg: &MqttMessage) -> Result<(), OtaError> {
        let payload: RegisterPayload = parse_or_default(msg)?;
        let vehicle_id = match payload.vehicle_id.filter(|id| !id.is_empty()) {
            Some(id) => id,
            None => vehicle_from_topic(msg)?,
        };

        if self.vehicles.get(&vehicle_id).await?.is_none() {
            let vehicle = Vehicle::new(&vehicle_id)
                .with_reported_version(payload.firmware_version.unwrap_or_default());
            match self.vehicles.create(vehicle).await {
                Ok(_) => info!(vehicle = %vehicle_id, "Vehicle registered"),
                Err(OtaError::AlreadyExists(_)) => {}
                Err(e) => return Err(e),
            }
        } else {
            debug!(vehicle = %vehicle_id, "Vehicle already registered");
        }

        self.pipeline
            .push(StatusUpdate::new(vehicle_id, true, Utc::now()));
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct OnlinePayload {
    #[serde(default = "default_online")]
    online: bool,
    timestamp: Option<DateTime<Utc>>,
}

impl Default for OnlinePayload {
    fn default() -> Self {
        Self {
            online: default_online(),
            timestamp: None,
        }
    }
}

fn default_online() -> bool {
    true
}

/// Heartbeats go straight into the merge pipeline
pub struct OnlineHandler {
    pipeline: StatusPipeline,
}

impl OnlineHandler {
    pub fn new(pipeline: StatusPipeline) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl MessageHandler for OnlineHandler {
    async fn handle(&self, msg: &MqttMessage) -> Result<(), OtaError> {
        let vehicle_id = vehicle_from_topic(msg)?;
        let payload: OnlinePayload = parse_or_default(msg)?;
        let timestamp = payload.timestamp.unwrap_or_else(Utc::now);
        self.pipeline
            .push(StatusUpdate::new(vehicle_id, payload.online, timestamp));
        Ok(())
    }
}

/// Progress a device reports for a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckPhase {
    #[serde(alias = "acknowledged")]
    Acknowledged,
    #[serde(alias = "running")]
    Running,
    #[serde(alias = "succeeded")]
    Succeeded,
    #[serde(alias = "failed")]
    Failed,
}

impl From<AckPhase> for CommandPhase {
    fn from(phase: AckPhase) -> Self {
        match phase {
            AckPhase::Acknowledged => CommandPhase::Acknowledged,
            AckPhase::Running => CommandPhase::Running,
            AckPhase::Succeeded => CommandPhase::Succeeded,
            AckPhase::Failed => CommandPhase::Failed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckPayload {
    pub command_name: String,
    pub phase: AckPhase,
    #[serde(default)]
    pub message: String,
    /// Sub-phase of a running upgrade, e.g. `Downloading`
    pub stage: Option<String>,
}

/// Fold an ack into `command`; returns whether anything changed.
///
/// Phases only move forward and terminal commands are frozen, so stale
/// and redelivered acks are no-ops.
pub fn apply_ack(command: &mut Command, ack: &AckPayload) -> bool {
    let current = command.status.phase;
    if current.is_terminal() {
        return false;
    }

    let target = CommandPhase::from(ack.phase);
    if target.rank() < current.rank() {
        return false;
    }

    let before = command.status.clone();
    if target != current {
        command.set_phase(target, ack.message.clone());
    }

    let generation = command.metadata.generation;
    if target.is_terminal() {
        remove_condition(&mut command.status.conditions, types::PROGRESSING);
    } else if let Some(ref stage) = ack.stage {
        set_condition(
            &mut command.status.conditions,
            Condition::new(types::PROGRESSING, ConditionStatus::True, stage, ack.message.clone(), generation),
        );
    }

    command.status != before
}

/// Command acknowledgements and completion reports
pub struct AckHandler {
    commands: Arc<dyn Store<Command>>,
}

impl AckHandler {
    pub fn new(commands: Arc<dyn Store<Command>>) -> Self {
        Self { commands }
    }
}

#[async_trait]
impl MessageHandler for AckHandler {
    async fn handle(&self, msg: &MqttMessage) -> Result<(), OtaError> {
        let vehicle_id = vehicle_from_topic(msg)?;
        let ack: AckPayload = msg.parse_json()?;

        let mut last_error = None;
        for _ in 0..ACK_WRITE_ATTEMPTS {
            let Some(mut command) = self.commands.get(&ack.command_name).await? else {
                warn!(vehicle = %vehicle_id, command = %ack.command_name, "Ack for unknown command");
                return Ok(());
            };
            if command.spec.vehicle_id != vehicle_id {
                warn!(
                    vehicle = %vehicle_id,
                    command = %ack.command_name,
                    "Ack from a vehicle that does not own the command"
                );
                return Ok(());
            }
            if !apply_ack(&mut command, &ack) {
                debug!(command = %ack.command_name, "Stale or duplicate ack ignored");
                return Ok(());
            }

            match self.commands.update_status(&command).await {
                Ok(_) => {
                    info!(command = %ack.command_name, "Command is now {}", command.status.phase);
                    return Ok(());
                }
                Err(e @ OtaError::Conflict(_)) => {
                    debug!(command = %ack.command_name, "Ack write conflicted, retrying");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| OtaError::Internal("ack write retries exhausted".to_string())))
    }
}

#[derive(Debug, Default, Deserialize)]
struct OtaRequestPayload {
    version: Option<String>,
}

/// Reply sent on the vehicle's OTA response topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OtaResponse {
    pub vehicle_id: String,
    pub version: String,
    pub url: String,
}

/// Answers firmware download requests
pub struct OtaRequestHandler {
    vehicles: Arc<dyn Store<Vehicle>>,
    firmware: Arc<dyn FirmwareUrlProvider>,
    transport: Arc<dyn Transport>,
    events: Arc<EventTable>,
}

impl OtaRequestHandler {
    pub fn new(
        vehicles: Arc<dyn Store<Vehicle>>,
        firmware: Arc<dyn FirmwareUrlProvider>,
        transport: Arc<dyn Transport>,
        events: Arc<EventTable>,
    ) -> Self {
        Self {
            vehicles,
            firmware,
            transport,
            events,
        }
    }
}

#[async_trait]
impl MessageHandler for OtaRequestHandler {
    async fn handle(&self, msg: &MqttMessage) -> Result<(), OtaError> {
        let vehicle_id = vehicle_from_topic(msg)?;
        let payload: OtaRequestPayload = parse_or_default(msg)?;

        let version = match payload.version.filter(|v| !v.is_empty()) {
            Some(version) => version,
            None => self
                .vehicles
                .get(&vehicle_id)
                .await?
                .map(|v| v.spec.desired_version)
                .ok_or_else(|| OtaError::NotFound(format!("Vehicle {}", vehicle_id)))?,
        };
        if version.is_empty() {
            return Err(OtaError::ValidationError(format!(
                "No firmware version requested or desired for vehicle {}",
                vehicle_id
            )));
        }

        let url = self.firmware.firmware_url(&vehicle_id, &version).await?;
        let response = OtaResponse {
            vehicle_id: vehicle_id.clone(),
            version,
            url,
        };
        let topic = self.events.topic_for(DeviceEvent::OtaResponse, &vehicle_id);
        self.transport
            .publish(&topic, QoS::AtLeastOnce, serde_json::to_vec(&response)?)
            .await?;
        debug!(vehicle = %vehicle_id, "Firmware url sent for {}", response.version);
        Ok(())
    }
}

/// Collaborators the inbound handlers need
pub struct HandlerDeps {
    pub vehicles: Arc<dyn Store<Vehicle>>,
    pub commands: Arc<dyn Store<Command>>,
    pub pipeline: StatusPipeline,
    pub firmware: Arc<dyn FirmwareUrlProvider>,
    pub events: Arc<EventTable>,
}

/// Subscribe one handler per device-originated event
pub async fn register_handlers(bus: &Bus, deps: HandlerDeps) -> Result<(), OtaError> {
    let events = deps.events;
    let register: Arc<dyn MessageHandler> =
        Arc::new(RegisterHandler::new(deps.vehicles.clone(), deps.pipeline.clone()));
    let online: Arc<dyn MessageHandler> = Arc::new(OnlineHandler::new(deps.pipeline));
    let ack: Arc<dyn MessageHandler> = Arc::new(AckHandler::new(deps.commands));
    let ota_request: Arc<dyn MessageHandler> = Arc::new(OtaRequestHandler::new(
        deps.vehicles,
        deps.firmware,
        bus.transport(),
        events.clone(),
    ));

    let handlers = [
        (DeviceEvent::Register, register),
        (DeviceEvent::Online, online),
        (DeviceEvent::CommandAck, ack),
        (DeviceEvent::OtaRequest, ota_request),
    ];

    for (event, handler) in handlers {
        bus.subscribe(events.subscription_filter(event), QoS::AtLeastOnce, handler)
            .await?;
    }
    Ok(())
}

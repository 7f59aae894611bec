//! Channels a command can be submitted through

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::OtaError;
use crate::models::command::Command;
use crate::mqtt::client::Transport;
use crate::mqtt::events::{DeviceEvent, EventTable};

/// Command submission sent to the remote side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    pub command_name: String,
    pub vehicle_id: String,
    pub command_type: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl From<&Command> for DispatchRequest {
    fn from(command: &Command) -> Self {
        Self {
            command_name: command.name().to_string(),
            vehicle_id: command.spec.vehicle_id.clone(),
            command_type: command.spec.command_type.clone(),
            parameters: command.spec.parameters.clone(),
        }
    }
}

/// Whether the remote side took the command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchResponse {
    pub accepted: bool,
    #[serde(default)]
    pub message: String,
}

impl DispatchResponse {
    pub fn accepted(message: impl Into<String>) -> Self {
        Self {
            accepted: true,
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            accepted: false,
            message: message.into(),
        }
    }
}

/// Submits a command without waiting for the device to act on it.
///
/// An `Err` is a transport failure worth retrying; a response with
/// `accepted == false` is a final answer.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchResponse, OtaError>;
}

/// Publishes commands on the vehicle's command topic
pub struct MqttCommandChannel {
    transport: Arc<dyn Transport>,
    events: Arc<EventTable>,
}

impl MqttCommandChannel {
    pub fn new(transport: Arc<dyn Transport>, events: Arc<EventTable>) -> Self {
        Self { transport, events }
    }
}

#[async_trait]
impl CommandChannel for MqttCommandChannel {
    async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchResponse, OtaError> {
        if request.vehicle_id.is_empty() {
            return Ok(DispatchResponse::rejected("command has no vehicle"));
        }
        let topic = self.events.topic_for(DeviceEvent::Command, &request.vehicle_id);
        let payload = serde_json::to_vec(request)?;
        self.transport
            .publish(&topic, QoS::AtLeastOnce, payload)
            .await?;
        debug!(command = %request.command_name, "Published to {}", topic);
        Ok(DispatchResponse::accepted(format!("published to {}", topic)))
    }
}

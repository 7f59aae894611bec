//! Logical device events and the topics they travel on

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::errors::OtaError;
use crate::mqtt::topics::{last_segment, topic_matches, TopicBuilder};

/// Logical event names exchanged with vehicles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceEvent {
    Register,
    Online,
    Command,
    CommandAck,
    OtaRequest,
    OtaResponse,
}

impl DeviceEvent {
    pub const ALL: [DeviceEvent; 6] = [
        DeviceEvent::Register,
        DeviceEvent::Online,
        DeviceEvent::Command,
        DeviceEvent::CommandAck,
        DeviceEvent::OtaRequest,
        DeviceEvent::OtaResponse,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            DeviceEvent::Register => "register",
            DeviceEvent::Online => "online",
            DeviceEvent::Command => "command",
            DeviceEvent::CommandAck => "command_ack",
            DeviceEvent::OtaRequest => "ota_request",
            DeviceEvent::OtaResponse => "ota_response",
        }
    }

    fn default_segment(&self) -> &'static str {
        match self {
            DeviceEvent::Register => "register",
            DeviceEvent::Online => "online",
            DeviceEvent::Command => "command",
            DeviceEvent::CommandAck => "command/ack",
            DeviceEvent::OtaRequest => "ota/request",
            DeviceEvent::OtaResponse => "ota/response",
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            DeviceEvent::Command | DeviceEvent::OtaResponse => Direction::CloudToDevice,
            _ => Direction::DeviceToCloud,
        }
    }
}

impl fmt::Display for DeviceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DeviceEvent {
    type Err = OtaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeviceEvent::ALL
            .into_iter()
            .find(|e| e.name() == s)
            .ok_or_else(|| OtaError::ValidationError(format!("unknown device event {:?}", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    DeviceToCloud,
    CloudToDevice,
}

/// Event name to topic segment table, built once at startup and shared by reference
#[derive(Debug, Clone)]
pub struct EventTable {
    root: String,
    share_group: Option<String>,
    segments: HashMap<DeviceEvent, String>,
}

impl EventTable {
    pub fn new(root: impl Into<String>) -> Self {
        let segments = DeviceEvent::ALL
            .into_iter()
            .map(|e| (e, e.default_segment().to_string()))
            .collect();
        Self {
            root: root.into(),
            share_group: None,
            segments,
        }
    }

    /// Subscribe through `$share/<group>/...` so replicas split inbound traffic
    pub fn with_share_group(mut self, group: Option<String>) -> Self {
        self.share_group = group.filter(|g| !g.is_empty());
        self
    }

    /// Override the physical segment for one event
    pub fn with_segment(mut self, event: DeviceEvent, segment: impl Into<String>) -> Self {
        self.segments.insert(event, segment.into());
        self
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn segment(&self, event: DeviceEvent) -> &str {
        self.segments
            .get(&event)
            .map(String::as_str)
            .unwrap_or_else(|| event.default_segment())
    }

    /// Filter the controller subscribes to for a device-originated event
    pub fn subscription_filter(&self, event: DeviceEvent) -> String {
        let builder = TopicBuilder::new(&self.root)
            .segment(self.segment(event))
            .single_level();
        match self.share_group {
            Some(ref group) => builder.shared(group.clone()).build(),
            None => builder.build(),
        }
    }

    /// Concrete topic addressed to (or from) one vehicle
    pub fn topic_for(&self, event: DeviceEvent, vehicle_id: &str) -> String {
        TopicBuilder::new(&self.root)
            .segment(self.segment(event))
            .segment(vehicle_id)
            .build()
    }

    /// Resolve an inbound topic to its event and vehicle id.
    ///
    /// The longest matching segment wins so `command/ack/x` is never read as `command`.
    pub fn classify(&self, topic: &str) -> Option<(DeviceEvent, String)> {
        let vehicle_id = last_segment(topic)?;
        DeviceEvent::ALL
            .into_iter()
            .filter(|e| {
                let filter = TopicBuilder::new(&self.root)
                    .segment(self.segment(*e))
                    .single_level()
                    .build();
                topic_matches(&filter, topic)
            })
            .max_by_key(|e| self.segment(*e).len())
            .map(|e| (e, vehicle_id.to_string()))
    }
}

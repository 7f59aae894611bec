//! MQTT plumbing: topics, transport, bus and device handlers

pub mod bus;
pub mod client;
pub mod events;
pub mod handlers;
pub mod topics;

pub use bus::{Bus, ConnectionState, MessageHandler};
pub use client::{MqttAddress, MqttMessage, MqttTransport, SessionOptions, Transport};
pub use events::{DeviceEvent, EventTable};

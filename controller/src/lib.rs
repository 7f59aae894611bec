//! Fleet OTA controller library
//!
//! Reconciliation engine, upgrade state machine, status pipeline and
//! MQTT bus for driving firmware upgrades across a vehicle fleet.

pub mod app;
pub mod dispatch;
pub mod errors;
pub mod http;
pub mod logs;
pub mod metrics;
pub mod models;
pub mod mqtt;
pub mod ota;
pub mod reconcile;
pub mod storage;
pub mod utils;
pub mod workers;

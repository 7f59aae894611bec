//! Application state management

use std::sync::Arc;

use tracing::info;

use crate::app::options::AppOptions;
use crate::metrics::{DispatchMetrics, PipelineMetrics};
use crate::models::command::Command;
use crate::models::vehicle::Vehicle;
use crate::mqtt::events::EventTable;
use crate::reconcile::{EventRecorder, LogRecorder};
use crate::storage::{MemoryStore, Store};

/// Shared state handed to every component at startup
pub struct AppState {
    /// Vehicle records
    pub vehicles: Arc<MemoryStore<Vehicle>>,

    /// Command records
    pub commands: Arc<MemoryStore<Command>>,

    /// Event name to topic table
    pub events: Arc<EventTable>,

    /// Dispatch counters
    pub dispatch_metrics: Arc<DispatchMetrics>,

    /// Transition events sink
    pub recorder: Arc<dyn EventRecorder>,
}

impl AppState {
    /// Initialize application state
    pub fn init(options: &AppOptions) -> Self {
        info!("Initializing application state...");

        let events = EventTable::new(&options.mqtt.topic_root)
            .with_share_group(options.mqtt.share_group.clone());

        Self {
            vehicles: Arc::new(MemoryStore::new()),
            commands: Arc::new(MemoryStore::new()),
            events: Arc::new(events),
            dispatch_metrics: Arc::new(DispatchMetrics::new()),
            recorder: Arc::new(LogRecorder),
        }
    }

    pub fn vehicle_store(&self) -> Arc<dyn Store<Vehicle>> {
        self.vehicles.clone()
    }

    pub fn command_store(&self) -> Arc<dyn Store<Command>> {
        self.commands.clone()
    }

    /// Log final counters
    pub fn shutdown(&self, pipeline_metrics: Option<&PipelineMetrics>) {
        info!("Shutting down application state...");
        info!(
            vehicles = self.vehicles.len(),
            commands = self.commands.len(),
            "Dispatch totals: {:?}",
            self.dispatch_metrics.snapshot()
        );
        if let Some(metrics) = pipeline_metrics {
            info!("Status pipeline totals: {:?}", metrics.snapshot());
        }
    }
}

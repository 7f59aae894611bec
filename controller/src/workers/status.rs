//! Write-merging status pipeline for high-frequency heartbeats

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::errors::OtaError;
use crate::metrics::PipelineMetrics;
use crate::models::vehicle::Vehicle;
use crate::storage::Store;

/// Ephemeral online/heartbeat observation for one vehicle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub vehicle_id: String,
    pub online: bool,
    pub timestamp: DateTime<Utc>,
}

impl StatusUpdate {
    pub fn new(vehicle_id: impl Into<String>, online: bool, timestamp: DateTime<Utc>) -> Self {
        Self {
            vehicle_id: vehicle_id.into(),
            online,
            timestamp,
        }
    }
}

/// Destination of flushed updates
#[async_trait]
pub trait HeartbeatSink: Send + Sync {
    async fn apply(&self, update: &StatusUpdate) -> Result<(), OtaError>;
}

/// Pipeline options
#[derive(Debug, Clone)]
pub struct Options {
    /// Ingress queue capacity; pushes beyond it are dropped
    pub capacity: usize,

    /// Periodic flush interval
    pub flush_interval: Duration,

    /// Flush early once this many distinct vehicles are buffered
    pub flush_threshold: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            capacity: 5000,
            flush_interval: Duration::from_secs(1),
            flush_threshold: 1000,
        }
    }
}

/// Producer handle. Cheap to clone; never blocks.
#[derive(Clone)]
pub struct StatusPipeline {
    tx: mpsc::Sender<StatusUpdate>,
    metrics: Arc<PipelineMetrics>,
}

impl StatusPipeline {
    /// Create the producer handle and the receiver the consumer task drains
    pub fn new(options: &Options) -> (Self, mpsc::Receiver<StatusUpdate>) {
        let (tx, rx) = mpsc::channel(options.capacity.max(1));
        let pipeline = Self {
            tx,
            metrics: Arc::new(PipelineMetrics::new()),
        };
        (pipeline, rx)
    }

    /// Enqueue an update. Returns `false` when it was shed.
    pub fn push(&self, update: StatusUpdate) -> bool {
        match self.tx.try_send(update) {
            Ok(()) => {
                self.metrics.inc_pushed();
                true
            }
            Err(TrySendError::Full(update)) => {
                let dropped = self.metrics.inc_dropped();
                warn!(
                    vehicle = %update.vehicle_id,
                    dropped_total = dropped,
                    "Status queue full, dropping update"
                );
                false
            }
            Err(TrySendError::Closed(update)) => {
                debug!(vehicle = %update.vehicle_id, "Status pipeline closed, dropping update");
                false
            }
        }
    }

    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        self.metrics.clone()
    }
}

/// Run the single consumer: merge by vehicle, flush on timer, threshold and shutdown
pub async fn run<S, F>(
    options: &Options,
    mut rx: mpsc::Receiver<StatusUpdate>,
    sink: Arc<dyn HeartbeatSink>,
    metrics: Arc<PipelineMetrics>,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Status pipeline starting...");

    let mut buffer: HashMap<String, StatusUpdate> = HashMap::new();
    let mut tick = Box::pin(sleep_fn(options.flush_interval));

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                // Take whatever producers managed to enqueue before the signal
                while let Ok(update) = rx.try_recv() {
                    buffer.insert(update.vehicle_id.clone(), update);
                }
                info!("Status pipeline shutting down, final flush of {} updates", buffer.len());
                flush(&mut buffer, sink.as_ref(), &metrics).await;
                return;
            }
            received = rx.recv() => {
                match received {
                    Some(update) => {
                        buffer.insert(update.vehicle_id.clone(), update);
                        if buffer.len() >= options.flush_threshold {
                            debug!("Status buffer reached {} vehicles, flushing early", buffer.len());
                            flush(&mut buffer, sink.as_ref(), &metrics).await;
                            tick = Box::pin(sleep_fn(options.flush_interval));
                        }
                    }
                    None => {
                        info!("All status producers gone, final flush of {} updates", buffer.len());
                        flush(&mut buffer, sink.as_ref(), &metrics).await;
                        return;
                    }
                }
            }
            _ = &mut tick => {
                flush(&mut buffer, sink.as_ref(), &metrics).await;
                tick = Box::pin(sleep_fn(options.flush_interval));
            }
        }
    }
}

async fn flush(
    buffer: &mut HashMap<String, StatusUpdate>,
    sink: &dyn HeartbeatSink,
    metrics: &PipelineMetrics,
) {
    if buffer.is_empty() {
        return;
    }
    let count = buffer.len();
    for (_, update) in buffer.drain() {
        match sink.apply(&update).await {
            Ok(()) => metrics.inc_flushed(),
            Err(e) => {
                metrics.inc_flush_failures();
                warn!(vehicle = %update.vehicle_id, "Failed to apply status update: {}", e);
            }
        }
    }
    debug!("Flushed {} status updates", count);
}

/// Writes heartbeats onto vehicle records, creating a vehicle on first contact
pub struct VehicleHeartbeatSink {
    store: Arc<dyn Store<Vehicle>>,
}

impl VehicleHeartbeatSink {
    const ATTEMPTS: usize = 2;

    pub fn new(store: Arc<dyn Store<Vehicle>>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl HeartbeatSink for VehicleHeartbeatSink {
    async fn apply(&self, update: &StatusUpdate) -> Result<(), OtaError> {
        let mut last_error = None;
        for _ in 0..Self::ATTEMPTS {
            let result = match self.store.get(&update.vehicle_id).await? {
                None => {
                    let mut vehicle = Vehicle::new(&update.vehicle_id);
                    vehicle.status.online = update.online;
                    vehicle.status.last_heartbeat = Some(update.timestamp);
                    info!(vehicle = %update.vehicle_id, "Registering vehicle on first heartbeat");
                    self.store.create(vehicle).await.map(|_| ())
                }
                Some(mut vehicle) => {
                    if vehicle.status.online == update.online
                        && vehicle.status.last_heartbeat == Some(update.timestamp)
                    {
                        return Ok(());
                    }
                    vehicle.status.online = update.online;
                    vehicle.status.last_heartbeat = Some(update.timestamp);
                    self.store.update_status(&vehicle).await.map(|_| ())
                }
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e @ (OtaError::Conflict(_) | OtaError::AlreadyExists(_))) => {
                    debug!(vehicle = %update.vehicle_id, "Heartbeat write raced, retrying: {}", e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            OtaError::Conflict(format!("heartbeat for {}", update.vehicle_id))
        }))
    }
}

//! Main application run loop

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::app::state::AppState;
use crate::dispatch::{CommandChannel, DispatchStep, MqttCommandChannel, TimeoutStep};
use crate::errors::OtaError;
use crate::http::client::HttpClient;
use crate::models::command::Command;
use crate::models::vehicle::Vehicle;
use crate::mqtt::bus::{self, Bus};
use crate::mqtt::client::{MqttTransport, Transport};
use crate::mqtt::handlers::{register_handlers, HandlerDeps};
use crate::ota::{
    owner_vehicle, CommandCleanup, FirmwareUrlProvider, OtaStateMachine, TemplateUrlProvider,
    CLEANUP_FINALIZER,
};
use crate::reconcile::{forward_changes, same_key, Controller, Reconciler, WorkQueue};
use crate::workers::status::{self, StatusPipeline, VehicleHeartbeatSink};
use crate::workers::gc;

/// Shutdown future handed to each component
pub type ShutdownSignal = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Run the controller until `shutdown_signal` resolves
pub async fn run(
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), OtaError> {
    info!("Initializing fleet OTA controller...");

    let mut shutdown_manager = ShutdownManager::new(options.lifecycle.clone());

    let app_state = match init(&options, &mut shutdown_manager).await {
        Ok(state) => state,
        Err(e) => return Err(shutdown_manager.abort_start(e).await),
    };

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    let result = shutdown_manager.shutdown().await;
    app_state.state.shutdown(Some(app_state.pipeline.metrics().as_ref()));
    result
}

/// What `init` leaves running
struct Started {
    state: Arc<AppState>,
    pipeline: StatusPipeline,
}

// =============================== INITIALIZATION ================================== //

async fn init(options: &AppOptions, shutdown_manager: &mut ShutdownManager) -> Result<Started, OtaError> {
    let state = Arc::new(AppState::init(options));

    // Created up front so the command channel can publish through it; the
    // connection itself is only opened once the bus starts polling
    let mqtt = if options.mqtt.address.host.is_empty() {
        warn!("MQTT host not configured, inbound device traffic is disabled");
        None
    } else {
        let (transport, eventloop) = MqttTransport::new(&options.mqtt.address, &options.mqtt.session)?;
        Some((Arc::new(transport) as Arc<dyn Transport>, eventloop))
    };

    let http_client = match options.rpc_base_url {
        Some(ref base_url) => Some(Arc::new(HttpClient::new(base_url, options.rpc_timeout)?)),
        None => None,
    };

    let pipeline = init_status_pipeline(options, &state, shutdown_manager);
    init_vehicle_controller(options, &state, shutdown_manager);

    let channel: Arc<dyn CommandChannel> = match (&http_client, &mqtt) {
        (Some(client), _) => client.clone() as Arc<dyn CommandChannel>,
        (None, Some((transport, _))) => Arc::new(MqttCommandChannel::new(
            transport.clone(),
            state.events.clone(),
        )) as Arc<dyn CommandChannel>,
        (None, None) => {
            return Err(OtaError::ConfigError(
                "either mqtt.host or rpc.base_url must be configured".to_string(),
            ));
        }
    };
    init_command_controller(options, &state, channel, shutdown_manager);
    init_gc_worker(options, &state, shutdown_manager);

    if let Some((transport, eventloop)) = mqtt {
        let firmware: Arc<dyn FirmwareUrlProvider> = match http_client {
            Some(client) => client as Arc<dyn FirmwareUrlProvider>,
            None => Arc::new(TemplateUrlProvider::new(&options.firmware_url_template)),
        };
        init_bus(options, &state, transport, eventloop, pipeline.clone(), firmware, shutdown_manager).await?;
    }

    info!("Fleet OTA controller started");
    Ok(Started { state, pipeline })
}

fn init_status_pipeline(
    options: &AppOptions,
    state: &Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
) -> StatusPipeline {
    info!("Initializing status pipeline...");

    let (pipeline, rx) = StatusPipeline::new(&options.pipeline);
    let sink = Arc::new(VehicleHeartbeatSink::new(state.vehicle_store()));
    let metrics = pipeline.metrics();
    let pipeline_options = options.pipeline.clone();

    shutdown_manager.spawn("status pipeline", move |signal| async move {
        status::run(&pipeline_options, rx, sink, metrics, tokio::time::sleep, signal).await;
    });
    pipeline
}

fn init_vehicle_controller(
    options: &AppOptions,
    state: &Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
) {
    info!("Initializing vehicle controller...");

    let commands = state.command_store();
    let reconciler = Reconciler::<Vehicle>::new(state.vehicle_store(), state.recorder.clone())
        .with_finalizer(CLEANUP_FINALIZER, Arc::new(CommandCleanup::new(commands.clone())))
        .with_step(Arc::new(OtaStateMachine::new(commands.clone(), options.ota.clone())));

    let queue = Arc::new(WorkQueue::new(options.controller.error_backoff.clone()));
    let controller = Controller::new(
        "vehicle",
        Arc::new(reconciler),
        queue.clone(),
        options.controller.workers,
    );
    shutdown_manager.spawn("vehicle controller", move |signal| async move {
        controller.run(signal).await;
    });

    let vehicles = state.vehicle_store();
    let vehicle_queue = queue.clone();
    shutdown_manager.spawn("vehicle watch", move |signal| async move {
        forward_changes(vehicles, vehicle_queue, same_key, signal).await;
    });
    // Command progress wakes up the owning vehicle
    shutdown_manager.spawn("command to vehicle watch", move |signal| async move {
        forward_changes(commands, queue, owner_vehicle, signal).await;
    });
}

fn init_command_controller(
    options: &AppOptions,
    state: &Arc<AppState>,
    channel: Arc<dyn CommandChannel>,
    shutdown_manager: &mut ShutdownManager,
) {
    info!("Initializing command controller...");

    let reconciler = Reconciler::<Command>::new(state.command_store(), state.recorder.clone())
        .with_step(Arc::new(DispatchStep::new(channel, state.dispatch_metrics.clone())))
        .with_step(Arc::new(TimeoutStep::new(options.command_timeout)));

    let queue = Arc::new(WorkQueue::new(options.controller.error_backoff.clone()));
    let controller = Controller::new(
        "command",
        Arc::new(reconciler),
        queue.clone(),
        options.controller.workers,
    );
    shutdown_manager.spawn("command controller", move |signal| async move {
        controller.run(signal).await;
    });

    let commands = state.command_store();
    shutdown_manager.spawn("command watch", move |signal| async move {
        forward_changes(commands, queue, same_key, signal).await;
    });
}

fn init_gc_worker(options: &AppOptions, state: &Arc<AppState>, shutdown_manager: &mut ShutdownManager) {
    info!("Initializing command GC worker...");

    let gc_options = options.gc.clone();
    let commands = state.command_store();
    shutdown_manager.spawn("command gc", move |signal| async move {
        gc::run(&gc_options, commands, tokio::time::sleep, signal).await;
    });
}

async fn init_bus(
    options: &AppOptions,
    state: &Arc<AppState>,
    transport: Arc<dyn Transport>,
    eventloop: rumqttc::EventLoop,
    pipeline: StatusPipeline,
    firmware: Arc<dyn FirmwareUrlProvider>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), OtaError> {
    info!("Initializing MQTT bus...");

    let bus = Arc::new(Bus::new(transport));
    register_handlers(
        &bus,
        HandlerDeps {
            vehicles: state.vehicle_store(),
            commands: state.command_store(),
            pipeline,
            firmware,
            events: state.events.clone(),
        },
    )
    .await?;

    let state_rx = bus.watch_state();
    shutdown_manager.spawn("connection monitor", move |signal| async move {
        bus::monitor_connection(state_rx, signal).await;
    });

    let bus_options = options.mqtt.bus.clone();
    shutdown_manager.spawn("mqtt bus", move |signal| async move {
        bus::run(&bus_options, bus, eventloop, tokio::time::sleep, signal).await;
    });
    Ok(())
}

// ================================= SHUTDOWN ===================================== //

struct Component {
    name: &'static str,
    trigger: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Stops components in reverse start order, each on its own trigger
struct ShutdownManager {
    lifecycle_options: LifecycleOptions,
    components: Vec<Component>,
}

impl ShutdownManager {
    fn new(lifecycle_options: LifecycleOptions) -> Self {
        Self {
            lifecycle_options,
            components: Vec::new(),
        }
    }

    /// Spawn a component, handing it the signal that stops it
    fn spawn<F, Fut>(&mut self, name: &'static str, task: F)
    where
        F: FnOnce(ShutdownSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (trigger, rx) = oneshot::channel::<()>();
        let signal: ShutdownSignal = Box::pin(async move {
            let _ = rx.await;
        });
        let handle = tokio::spawn(task(signal));
        self.components.push(Component {
            name,
            trigger,
            handle,
        });
    }

    async fn shutdown(&mut self) -> Result<(), OtaError> {
        let max_delay = self.lifecycle_options.max_shutdown_delay;
        match tokio::time::timeout(max_delay, self.shutdown_impl()).await {
            Ok(result) => result,
            Err(_) => {
                error!("Shutdown timed out after {:?}", max_delay);
                for component in self.components.drain(..) {
                    component.handle.abort();
                }
                Err(OtaError::ShutdownError(format!("timed out after {:?}", max_delay)))
            }
        }
    }

    /// Stop whatever `init` already started; the start error is what the caller sees
    async fn abort_start(&mut self, e: OtaError) -> OtaError {
        error!("Failed to start controller: {}", e);
        if let Err(shutdown_err) = self.shutdown().await {
            error!("Shutdown after failed start also failed: {}", shutdown_err);
        }
        e
    }

    async fn shutdown_impl(&mut self) -> Result<(), OtaError> {
        info!("Shutting down fleet OTA controller...");

        let mut first_error = None;
        while let Some(component) = self.components.pop() {
            info!("Stopping {}...", component.name);
            let _ = component.trigger.send(());
            if let Err(e) = component.handle.await {
                error!("{} did not stop cleanly: {}", component.name, e);
                first_error.get_or_insert(OtaError::ShutdownError(format!("{}: {}", component.name, e)));
            }
        }

        info!("Shutdown complete");
        first_error.map_or(Ok(()), Err)
    }
}

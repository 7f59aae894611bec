//! Topic-routed message bus with reconnection-safe resubscription

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use rumqttc::{Event, EventLoop, Packet, QoS};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::errors::OtaError;
use crate::mqtt::client::{MqttMessage, Transport};
use crate::mqtt::topics::{topic_matches, validate_filter};

/// Handles messages delivered on a subscribed filter.
///
/// Delivery is at-least-once; implementations must tolerate redelivery.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, msg: &MqttMessage) -> Result<(), OtaError>;
}

/// Broker connection state as seen by the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Reconnecting,
}

#[derive(Clone)]
struct Subscription {
    qos: QoS,
    handler: Arc<dyn MessageHandler>,
}

/// Registry of `(filter, qos, handler)` plus routing of inbound messages
pub struct Bus {
    transport: Arc<dyn Transport>,
    subscriptions: DashMap<String, Subscription>,
    state: watch::Sender<ConnectionState>,
}

impl Bus {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            subscriptions: DashMap::new(),
            state,
        }
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch connection state changes
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Register a handler. Issued to the broker right away when connected,
    /// otherwise on the next ConnAck.
    pub async fn subscribe(
        &self,
        filter: impl Into<String>,
        qos: QoS,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), OtaError> {
        let filter = filter.into();
        validate_filter(&filter)?;
        self.subscriptions
            .insert(filter.clone(), Subscription { qos, handler });
        info!("Registered handler for: {}", filter);

        if self.connection_state() == ConnectionState::Connected {
            self.transport.subscribe(&filter, qos).await?;
        }
        Ok(())
    }

    /// Registered filters, sorted
    pub fn filters(&self) -> Vec<String> {
        let mut filters: Vec<String> = self.subscriptions.iter().map(|e| e.key().clone()).collect();
        filters.sort();
        filters
    }

    /// Publish a JSON payload with at-least-once delivery
    pub async fn publish_json<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        payload: &T,
    ) -> Result<(), OtaError> {
        let payload = serde_json::to_vec(payload)?;
        self.transport.publish(topic, QoS::AtLeastOnce, payload).await
    }

    /// Mark the session live and re-issue every registered subscription.
    ///
    /// A new session starts with no subscriptions, so the whole registry is
    /// sent each time. Every entry is attempted; the first failure is returned.
    pub async fn on_connected(&self) -> Result<(), OtaError> {
        self.state.send_replace(ConnectionState::Connected);

        // Snapshot first so no map guard is held across an await
        let entries: Vec<(String, QoS)> = self
            .subscriptions
            .iter()
            .map(|e| (e.key().clone(), e.value().qos))
            .collect();

        let mut first_error = None;
        for (filter, qos) in entries {
            match self.transport.subscribe(&filter, qos).await {
                Ok(()) => debug!("Resubscribed: {}", filter),
                Err(e) => {
                    error!("Failed to resubscribe {}: {}", filter, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        info!("Subscriptions restored ({} filters)", self.subscriptions.len());
        first_error.map_or(Ok(()), Err)
    }

    pub fn on_connection_lost(&self) {
        self.state.send_replace(ConnectionState::Reconnecting);
    }

    /// Route one inbound message to every matching handler; returns how many matched
    pub async fn route(&self, msg: &MqttMessage) -> usize {
        let handlers: Vec<(String, Arc<dyn MessageHandler>)> = self
            .subscriptions
            .iter()
            .filter(|e| topic_matches(e.key(), &msg.topic))
            .map(|e| (e.key().clone(), e.value().handler.clone()))
            .collect();

        if handlers.is_empty() {
            debug!("No handler for topic: {}", msg.topic);
            return 0;
        }

        for (filter, handler) in &handlers {
            if let Err(e) = handler.handle(msg).await {
                warn!(topic = %msg.topic, filter = %filter, "Handler failed: {}", e);
            }
        }
        handlers.len()
    }

    pub async fn disconnect(&self) -> Result<(), OtaError> {
        self.state.send_replace(ConnectionState::Disconnected);
        self.transport.disconnect().await
    }
}

/// Bus event loop options
#[derive(Debug, Clone)]
pub struct Options {
    /// Pause after a connection error before polling (and so reconnecting) again
    pub reconnect_delay: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

/// Drive the rumqttc event loop until shutdown.
///
/// Each inbound publish is routed on its own task so slow handlers never
/// stall keep-alives. Polling again after an error reconnects.
pub async fn run<S, F>(
    options: &Options,
    bus: Arc<Bus>,
    mut eventloop: EventLoop,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("MQTT bus starting...");

    loop {
        let event = tokio::select! {
            _ = &mut shutdown_signal => {
                info!("MQTT bus shutting down...");
                if let Err(e) = bus.disconnect().await {
                    warn!("Disconnect failed: {}", e);
                }
                return;
            }
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("MQTT connected");
                // Subscribe requests flow through this event loop, so they must
                // not be awaited from inside it
                let bus = bus.clone();
                tokio::spawn(async move {
                    if let Err(e) = bus.on_connected().await {
                        error!("Resubscription incomplete: {}", e);
                    }
                });
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let msg = MqttMessage::new(publish.topic.clone(), publish.payload.to_vec());
                debug!("Received message on topic: {}", msg.topic);
                let bus = bus.clone();
                tokio::spawn(async move {
                    bus.route(&msg).await;
                });
            }
            Ok(Event::Incoming(Packet::SubAck(_))) => {
                debug!("Subscription acknowledged");
            }
            Ok(_) => {}
            Err(e) => {
                warn!("MQTT connection error: {}, reconnecting...", e);
                bus.on_connection_lost();
                tokio::select! {
                    _ = &mut shutdown_signal => {
                        info!("MQTT bus shutting down...");
                        bus.state.send_replace(ConnectionState::Disconnected);
                        return;
                    }
                    _ = sleep_fn(options.reconnect_delay) => {}
                }
            }
        }
    }
}

/// Log connection state changes until shutdown
pub async fn monitor_connection(
    mut state_rx: watch::Receiver<ConnectionState>,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                debug!("Connection monitor shutting down...");
                return;
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                let state = *state_rx.borrow_and_update();
                match state {
                    ConnectionState::Connected => info!("Broker connection established"),
                    ConnectionState::Reconnecting => warn!("Broker connection lost, retrying"),
                    ConnectionState::Disconnected => info!("Broker connection closed"),
                }
            }
        }
    }
}

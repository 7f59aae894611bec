//! Bus routing and resubscription

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rumqttc::QoS;

use fleetota::errors::OtaError;
use fleetota::mqtt::topics::topic_matches;
use fleetota::mqtt::{Bus, ConnectionState, MessageHandler, MqttMessage};

use crate::common::RecordingTransport;

#[derive(Default)]
struct CountingHandler {
    calls: AtomicUsize,
    fail: bool,
}

impl CountingHandler {
    fn failing() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail: true,
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageHandler for CountingHandler {
    async fn handle(&self, _msg: &MqttMessage) -> Result<(), OtaError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(OtaError::Internal("handler failed".to_string()));
        }
        Ok(())
    }
}

#[test]
fn test_wildcard_matching() {
    assert!(topic_matches("root/command/+", "root/command/veh1"));
    assert!(!topic_matches("root/command/+", "root/command/veh1/extra"));
    assert!(topic_matches("root/sys/#", "root/sys/a/b/c"));
    assert!(topic_matches("root/sys/#", "root/sys"));
    assert!(topic_matches("$share/g1/root/command/+", "root/command/veh1"));
}

#[tokio::test]
async fn test_every_reconnect_restores_all_filters() {
    let transport = Arc::new(RecordingTransport::default());
    let bus = Bus::new(transport.clone());
    for filter in ["root/online/+", "root/register/+"] {
        bus.subscribe(filter, QoS::AtLeastOnce, Arc::new(CountingHandler::default()))
            .await
            .unwrap();
    }

    bus.on_connected().await.unwrap();
    assert_eq!(bus.connection_state(), ConnectionState::Connected);

    bus.on_connection_lost();
    assert_eq!(bus.connection_state(), ConnectionState::Reconnecting);
    bus.on_connected().await.unwrap();

    let mut subscribed = transport.subscribed.lock().unwrap().clone();
    subscribed.sort();
    assert_eq!(
        subscribed,
        vec![
            "root/online/+",
            "root/online/+",
            "root/register/+",
            "root/register/+"
        ]
    );
}

#[tokio::test]
async fn test_subscribe_while_connected_is_immediate() {
    let transport = Arc::new(RecordingTransport::default());
    let bus = Bus::new(transport.clone());
    bus.on_connected().await.unwrap();

    bus.subscribe(
        "root/command/ack/+",
        QoS::AtLeastOnce,
        Arc::new(CountingHandler::default()),
    )
    .await
    .unwrap();
    assert_eq!(
        *transport.subscribed.lock().unwrap(),
        vec!["root/command/ack/+"]
    );
}

#[tokio::test]
async fn test_failing_handler_does_not_block_others() {
    let bus = Bus::new(Arc::new(RecordingTransport::default()));
    let failing = Arc::new(CountingHandler::failing());
    let healthy = Arc::new(CountingHandler::default());
    bus.subscribe("root/sys/#", QoS::AtLeastOnce, failing.clone())
        .await
        .unwrap();
    bus.subscribe("root/sys/+/b/c", QoS::AtLeastOnce, healthy.clone())
        .await
        .unwrap();

    let matched = bus.route(&MqttMessage::new("root/sys/a/b/c", b"{}".to_vec())).await;
    assert_eq!(matched, 2);
    assert_eq!(failing.calls(), 1);
    assert_eq!(healthy.calls(), 1);
}

#[tokio::test]
async fn test_shared_filter_routes_plain_topics() {
    let bus = Bus::new(Arc::new(RecordingTransport::default()));
    let handler = Arc::new(CountingHandler::default());
    bus.subscribe("$share/ota/root/online/+", QoS::AtLeastOnce, handler.clone())
        .await
        .unwrap();

    bus.route(&MqttMessage::new("root/online/veh1", Vec::new())).await;
    assert_eq!(handler.calls(), 1);
}

#[tokio::test]
async fn test_publish_json_and_disconnect() {
    let transport = Arc::new(RecordingTransport::default());
    let bus = Bus::new(transport.clone());

    bus.publish_json("root/command/veh1", &serde_json::json!({"a": 1}))
        .await
        .unwrap();
    assert_eq!(
        transport.published_json(),
        vec![("root/command/veh1".to_string(), serde_json::json!({"a": 1}))]
    );

    bus.on_connected().await.unwrap();
    bus.disconnect().await.unwrap();
    assert_eq!(bus.connection_state(), ConnectionState::Disconnected);
}

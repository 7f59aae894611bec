//! Device message handlers

use std::sync::Arc;

use fleetota::errors::OtaError;
use fleetota::models::command::{command_name, Command, CommandPhase};
use fleetota::models::condition::{find_condition, types};
use fleetota::models::vehicle::Vehicle;
use fleetota::mqtt::bus::MessageHandler;
use fleetota::mqtt::handlers::{
    apply_ack, register_handlers, AckHandler, AckPayload, AckPhase, HandlerDeps, OnlineHandler,
    OtaRequestHandler, RegisterHandler,
};
use fleetota::mqtt::{Bus, EventTable, MqttMessage};
use fleetota::ota::TemplateUrlProvider;
use fleetota::storage::{MemoryStore, Store};
use fleetota::workers::status::{Options, StatusPipeline};

use crate::common::RecordingTransport;

fn ack(name: &str, phase: AckPhase, stage: Option<&str>) -> AckPayload {
    AckPayload {
        command_name: name.to_string(),
        phase,
        message: String::new(),
        stage: stage.map(str::to_string),
    }
}

fn ack_message(vehicle: &str, body: serde_json::Value) -> MqttMessage {
    MqttMessage::new(
        format!("fleet/command/ack/{}", vehicle),
        serde_json::to_vec(&body).unwrap(),
    )
}

#[tokio::test]
async fn test_register_creates_vehicle_and_marks_online() {
    let vehicles = Arc::new(MemoryStore::<Vehicle>::new());
    let (pipeline, mut rx) = StatusPipeline::new(&Options::default());
    let handler = RegisterHandler::new(vehicles.clone(), pipeline);

    let msg = MqttMessage::new(
        "fleet/register/veh1",
        br#"{"firmwareVersion": "v1"}"#.to_vec(),
    );
    handler.handle(&msg).await.unwrap();
    handler.handle(&msg).await.unwrap();

    let vehicle = vehicles.get("veh1").await.unwrap().unwrap();
    assert_eq!(vehicle.status.reported_version, "v1");
    assert_eq!(vehicles.len(), 1);

    let first = rx.try_recv().unwrap();
    assert_eq!(first.vehicle_id, "veh1");
    assert!(first.online);
    assert!(rx.try_recv().is_ok());
}

#[tokio::test]
async fn test_register_prefers_payload_vehicle_id() {
    let vehicles = Arc::new(MemoryStore::<Vehicle>::new());
    let (pipeline, _rx) = StatusPipeline::new(&Options::default());
    let handler = RegisterHandler::new(vehicles.clone(), pipeline);

    let msg = MqttMessage::new("fleet/register/gw1", br#"{"vehicleId": "veh9"}"#.to_vec());
    handler.handle(&msg).await.unwrap();
    assert!(vehicles.get("veh9").await.unwrap().is_some());
    assert!(vehicles.get("gw1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_online_handler_defaults() {
    let (pipeline, mut rx) = StatusPipeline::new(&Options::default());
    let handler = OnlineHandler::new(pipeline);

    handler
        .handle(&MqttMessage::new("fleet/online/veh1", Vec::new()))
        .await
        .unwrap();
    handler
        .handle(&MqttMessage::new(
            "fleet/online/veh2",
            br#"{"online": false, "timestamp": "2024-01-01T00:00:00Z"}"#.to_vec(),
        ))
        .await
        .unwrap();

    let first = rx.try_recv().unwrap();
    assert_eq!(first.vehicle_id, "veh1");
    assert!(first.online);

    let second = rx.try_recv().unwrap();
    assert_eq!(second.vehicle_id, "veh2");
    assert!(!second.online);
    assert_eq!(second.timestamp.to_rfc3339(), "2024-01-01T00:00:00+00:00");
}

#[tokio::test]
async fn test_online_handler_rejects_garbage() {
    let (pipeline, _rx) = StatusPipeline::new(&Options::default());
    let handler = OnlineHandler::new(pipeline);
    let result = handler
        .handle(&MqttMessage::new("fleet/online/veh1", b"not json".to_vec()))
        .await;
    assert!(result.is_err());
}

#[test]
fn test_ack_moves_forward_only() {
    let mut command = Command::ota_upgrade("veh1", "v2", 0);
    command.set_phase(CommandPhase::Sent, "");

    assert!(apply_ack(&mut command, &ack("c", AckPhase::Running, Some("Downloading"))));
    assert_eq!(command.status.phase, CommandPhase::Running);
    let progressing = find_condition(&command.status.conditions, types::PROGRESSING).unwrap();
    assert_eq!(progressing.reason, "Downloading");

    // A late acknowledgement cannot move the command back
    assert!(!apply_ack(&mut command, &ack("c", AckPhase::Acknowledged, None)));
    assert_eq!(command.status.phase, CommandPhase::Running);

    // Same phase, new stage
    assert!(apply_ack(&mut command, &ack("c", AckPhase::Running, Some("Installing"))));
    // Redelivery
    assert!(!apply_ack(&mut command, &ack("c", AckPhase::Running, Some("Installing"))));
}

#[test]
fn test_terminal_ack_freezes_command() {
    let mut command = Command::ota_upgrade("veh1", "v2", 0);
    command.set_phase(CommandPhase::Running, "");
    apply_ack(&mut command, &ack("c", AckPhase::Running, Some("Installing")));

    assert!(apply_ack(&mut command, &ack("c", AckPhase::Succeeded, None)));
    assert_eq!(command.status.phase, CommandPhase::Succeeded);
    assert!(command.status.completed_at.is_some());
    assert!(find_condition(&command.status.conditions, types::PROGRESSING).is_none());

    assert!(!apply_ack(&mut command, &ack("c", AckPhase::Failed, None)));
    assert_eq!(command.status.phase, CommandPhase::Succeeded);
}

#[tokio::test]
async fn test_ack_handler_updates_owned_command() {
    let commands = Arc::new(MemoryStore::<Command>::new());
    commands
        .create(Command::ota_upgrade("veh1", "v2", 0))
        .await
        .unwrap();
    let handler = AckHandler::new(commands.clone());

    handler
        .handle(&ack_message(
            "veh1",
            serde_json::json!({"commandName": command_name("veh1", "v2", 0), "phase": "running", "stage": "Downloading"}),
        ))
        .await
        .unwrap();

    let command = commands.get(&command_name("veh1", "v2", 0)).await.unwrap().unwrap();
    assert_eq!(command.status.phase, CommandPhase::Running);
    assert!(command.status.acknowledged_at.is_some());
}

#[tokio::test]
async fn test_ack_handler_ignores_foreign_and_unknown_commands() {
    let commands = Arc::new(MemoryStore::<Command>::new());
    commands
        .create(Command::ota_upgrade("veh1", "v2", 0))
        .await
        .unwrap();
    let handler = AckHandler::new(commands.clone());

    handler
        .handle(&ack_message(
            "veh2",
            serde_json::json!({"commandName": command_name("veh1", "v2", 0), "phase": "Succeeded"}),
        ))
        .await
        .unwrap();
    handler
        .handle(&ack_message(
            "veh1",
            serde_json::json!({"commandName": command_name("veh1", "v9", 0), "phase": "Succeeded"}),
        ))
        .await
        .unwrap();

    let command = commands.get(&command_name("veh1", "v2", 0)).await.unwrap().unwrap();
    assert_eq!(command.status.phase, CommandPhase::Pending);
}

#[tokio::test]
async fn test_ack_handler_rejects_malformed_payload() {
    let handler = AckHandler::new(Arc::new(MemoryStore::<Command>::new()));
    let err = handler
        .handle(&ack_message("veh1", serde_json::json!({"phase": "Succeeded"})))
        .await
        .unwrap_err();
    assert!(matches!(err, OtaError::ValidationError(_)));
}

#[tokio::test]
async fn test_ota_request_answers_with_url() {
    let vehicles = Arc::new(MemoryStore::<Vehicle>::new());
    vehicles
        .create(Vehicle::new("veh1").with_desired_version("v2"))
        .await
        .unwrap();
    let transport = Arc::new(RecordingTransport::default());
    let handler = OtaRequestHandler::new(
        vehicles,
        Arc::new(TemplateUrlProvider::new("https://fw.example.com/{vehicle}/{version}.bin")),
        transport.clone(),
        Arc::new(EventTable::new("fleet")),
    );

    handler
        .handle(&MqttMessage::new("fleet/ota/request/veh1", Vec::new()))
        .await
        .unwrap();
    handler
        .handle(&MqttMessage::new(
            "fleet/ota/request/veh1",
            br#"{"version": "v3"}"#.to_vec(),
        ))
        .await
        .unwrap();

    assert_eq!(
        transport.published_json(),
        vec![
            (
                "fleet/ota/response/veh1".to_string(),
                serde_json::json!({
                    "vehicleId": "veh1",
                    "version": "v2",
                    "url": "https://fw.example.com/veh1/v2.bin"
                })
            ),
            (
                "fleet/ota/response/veh1".to_string(),
                serde_json::json!({
                    "vehicleId": "veh1",
                    "version": "v3",
                    "url": "https://fw.example.com/veh1/v3.bin"
                })
            ),
        ]
    );
}

#[tokio::test]
async fn test_ota_request_for_unknown_vehicle() {
    let handler = OtaRequestHandler::new(
        Arc::new(MemoryStore::<Vehicle>::new()),
        Arc::new(TemplateUrlProvider::new("https://fw/{version}")),
        Arc::new(RecordingTransport::default()),
        Arc::new(EventTable::new("fleet")),
    );
    let err = handler
        .handle(&MqttMessage::new("fleet/ota/request/ghost", Vec::new()))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_ota_request_without_any_version() {
    let vehicles = Arc::new(MemoryStore::<Vehicle>::new());
    vehicles.create(Vehicle::new("veh1")).await.unwrap();
    let transport = Arc::new(RecordingTransport::default());
    let handler = OtaRequestHandler::new(
        vehicles,
        Arc::new(TemplateUrlProvider::new("https://fw/{version}")),
        transport.clone(),
        Arc::new(EventTable::new("fleet")),
    );

    let err = handler
        .handle(&MqttMessage::new(
            "fleet/ota/request/veh1",
            br#"{"version": ""}"#.to_vec(),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, OtaError::ValidationError(_)));
    assert!(transport.published_json().is_empty());
}

#[tokio::test]
async fn test_register_handlers_subscribes_device_topics() {
    let transport = Arc::new(RecordingTransport::default());
    let bus = Bus::new(transport.clone());
    let (pipeline, _rx) = StatusPipeline::new(&Options::default());
    let events = Arc::new(EventTable::new("fleet").with_share_group(Some("ota".to_string())));

    register_handlers(
        &bus,
        HandlerDeps {
            vehicles: Arc::new(MemoryStore::<Vehicle>::new()),
            commands: Arc::new(MemoryStore::<Command>::new()),
            pipeline,
            firmware: Arc::new(TemplateUrlProvider::new("https://fw/{version}")),
            events,
        },
    )
    .await
    .unwrap();

    assert_eq!(
        bus.filters(),
        vec![
            "$share/ota/fleet/command/ack/+",
            "$share/ota/fleet/online/+",
            "$share/ota/fleet/ota/request/+",
            "$share/ota/fleet/register/+",
        ]
    );

    bus.on_connected().await.unwrap();
    assert_eq!(transport.subscribed.lock().unwrap().len(), 4);

    let matched = bus
        .route(&MqttMessage::new("fleet/online/veh1", Vec::new()))
        .await;
    assert_eq!(matched, 1);
}

//! Upgrade state machine tests

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_test::{assert_err, assert_ok};

use fleetota::errors::OtaError;
use fleetota::models::command::{command_name, Command, CommandPhase};
use fleetota::models::condition::{find_condition, set_condition, types, Condition, ConditionStatus};
use fleetota::models::vehicle::{OtaPhase, Vehicle};
use fleetota::ota::{fire, OtaEvent, OtaOptions, OtaStateMachine};
use fleetota::reconcile::Step;
use fleetota::storage::{MemoryStore, Selector, Store};

fn setup() -> (Arc<MemoryStore<Command>>, OtaStateMachine) {
    let commands = Arc::new(MemoryStore::<Command>::new());
    let machine = OtaStateMachine::new(commands.clone(), OtaOptions::default());
    (commands, machine)
}

fn vehicle(desired: &str, reported: &str) -> Vehicle {
    let mut vehicle = Vehicle::new("veh1")
        .with_desired_version(desired)
        .with_reported_version(reported);
    vehicle.metadata.generation = 1;
    vehicle
}

/// Vehicle that failed `ago` seconds back at the current generation
fn failed_vehicle(retry_count: u32, ago: i64) -> Vehicle {
    let mut vehicle = vehicle("v2", "v1");
    vehicle.status.phase = OtaPhase::Failed;
    vehicle.status.retry_count = retry_count;
    let mut failure = Condition::new(types::FAILED, ConditionStatus::True, "UpgradeFailed", "flash error", 1);
    failure.last_transition_time = Utc::now() - chrono::Duration::seconds(ago);
    set_condition(&mut vehicle.status.conditions, failure);
    vehicle
}

async fn put_command(commands: &MemoryStore<Command>, retry: u32, phase: CommandPhase, message: &str) {
    let created = commands
        .create(Command::ota_upgrade("veh1", "v2", retry))
        .await
        .unwrap();
    let mut command = created;
    command.set_phase(phase, message);
    commands.update_status(&command).await.unwrap();
}

#[tokio::test]
async fn test_idle_requests_upgrade_and_creates_command() {
    let (commands, machine) = setup();
    let mut vehicle = vehicle("v2", "v1");

    let requeue = machine.reconcile(&mut vehicle).await.unwrap();

    assert_eq!(vehicle.status.phase, OtaPhase::Pending);
    assert_eq!(vehicle.status.retry_count, 0);
    assert_eq!(requeue, Some(Duration::from_secs(30)));
    let command = commands.get(&command_name("veh1", "v2", 0)).await.unwrap().unwrap();
    assert_eq!(command.status.phase, CommandPhase::Pending);
}

#[tokio::test]
async fn test_idle_without_new_version_stays_idle() {
    let (commands, machine) = setup();
    let mut vehicle = vehicle("v1", "v1");
    let before = vehicle.clone();

    assert_eq!(machine.reconcile(&mut vehicle).await.unwrap(), None);
    assert_eq!(vehicle, before);
    assert!(commands.is_empty());
}

#[tokio::test]
async fn test_repeated_pending_passes_settle() {
    let (commands, machine) = setup();
    let mut vehicle = vehicle("v2", "v1");

    machine.reconcile(&mut vehicle).await.unwrap();
    machine.reconcile(&mut vehicle).await.unwrap();
    let settled = vehicle.clone();
    machine.reconcile(&mut vehicle).await.unwrap();

    assert_eq!(commands.len(), 1);
    assert_eq!(vehicle, settled);
    assert_eq!(vehicle.status.phase, OtaPhase::Pending);
}

#[tokio::test]
async fn test_pending_success_then_idle() {
    let (commands, machine) = setup();
    let mut vehicle = vehicle("v2", "v1");
    machine.reconcile(&mut vehicle).await.unwrap();

    let mut command = commands.get(&command_name("veh1", "v2", 0)).await.unwrap().unwrap();
    command.set_phase(CommandPhase::Succeeded, "done");
    commands.update_status(&command).await.unwrap();

    machine.reconcile(&mut vehicle).await.unwrap();
    assert_eq!(vehicle.status.phase, OtaPhase::Succeeded);
    assert_eq!(vehicle.status.reported_version, "v2");
    assert!(find_condition(&vehicle.status.conditions, types::SYNCED).unwrap().is_true());

    machine.reconcile(&mut vehicle).await.unwrap();
    assert_eq!(vehicle.status.phase, OtaPhase::Idle);
    assert_eq!(commands.len(), 1);
}

#[tokio::test]
async fn test_pending_failure_backs_off() {
    let (commands, machine) = setup();
    let mut vehicle = vehicle("v2", "v1");
    vehicle.status.phase = OtaPhase::Pending;
    put_command(&commands, 0, CommandPhase::Failed, "checksum mismatch").await;

    let requeue = machine.reconcile(&mut vehicle).await.unwrap().unwrap();

    assert_eq!(vehicle.status.phase, OtaPhase::Failed);
    assert_eq!(vehicle.status.message, "checksum mismatch");
    assert!(requeue <= Duration::from_secs(60));
    assert!(requeue > Duration::from_secs(55));
}

#[tokio::test]
async fn test_timed_out_command_fails_vehicle() {
    let (commands, machine) = setup();
    let mut vehicle = vehicle("v2", "v1");
    vehicle.status.phase = OtaPhase::Pending;
    put_command(&commands, 0, CommandPhase::Timeout, "").await;

    machine.reconcile(&mut vehicle).await.unwrap();
    assert_eq!(vehicle.status.phase, OtaPhase::Failed);
    assert!(vehicle.status.message.contains("Timeout"));
}

#[tokio::test]
async fn test_in_flight_stage_is_mirrored() {
    let (commands, machine) = setup();
    let mut vehicle = vehicle("v2", "v1");
    vehicle.status.phase = OtaPhase::Pending;
    put_command(&commands, 0, CommandPhase::Running, "").await;

    let mut command = commands.get(&command_name("veh1", "v2", 0)).await.unwrap().unwrap();
    set_condition(
        &mut command.status.conditions,
        Condition::new(types::PROGRESSING, ConditionStatus::True, "Installing", "", 1),
    );
    commands.update_status(&command).await.unwrap();

    machine.reconcile(&mut vehicle).await.unwrap();
    assert_eq!(vehicle.status.phase, OtaPhase::Pending);
    let progressing = find_condition(&vehicle.status.conditions, types::PROGRESSING).unwrap();
    assert_eq!(progressing.reason, "Installing");
    let synced = find_condition(&vehicle.status.conditions, types::SYNCED).unwrap();
    assert_eq!(synced.reason, "InProgress");
}

#[tokio::test]
async fn test_retry_waits_for_backoff() {
    let (commands, machine) = setup();
    // Third retry waits 4 minutes; 3 have passed
    let mut vehicle = failed_vehicle(2, 180);

    let requeue = machine.reconcile(&mut vehicle).await.unwrap().unwrap();

    assert_eq!(vehicle.status.phase, OtaPhase::Failed);
    assert!(requeue <= Duration::from_secs(60));
    assert!(requeue > Duration::from_secs(50));
    assert!(commands.is_empty());
}

#[tokio::test]
async fn test_retry_after_backoff_creates_fresh_command() {
    let (commands, machine) = setup();
    let mut vehicle = failed_vehicle(0, 90);

    machine.reconcile(&mut vehicle).await.unwrap();

    assert_eq!(vehicle.status.phase, OtaPhase::Pending);
    assert_eq!(vehicle.status.retry_count, 1);
    assert!(commands.get(&command_name("veh1", "v2", 1)).await.unwrap().is_some());
    let failed = find_condition(&vehicle.status.conditions, types::FAILED).unwrap();
    assert_eq!(failed.status, ConditionStatus::False);
}

#[tokio::test]
async fn test_no_retry_after_max_attempts() {
    let (commands, machine) = setup();
    let mut vehicle = failed_vehicle(5, 24 * 3600);
    let before = vehicle.clone();

    assert_eq!(machine.reconcile(&mut vehicle).await.unwrap(), None);
    assert_eq!(vehicle, before);
    assert!(commands.is_empty());
}

#[tokio::test]
async fn test_spec_change_is_manual_retry() {
    let (commands, machine) = setup();
    let mut vehicle = failed_vehicle(5, 0);
    vehicle.spec.desired_version = "v3".to_string();
    vehicle.metadata.generation = 2;

    machine.reconcile(&mut vehicle).await.unwrap();

    assert_eq!(vehicle.status.phase, OtaPhase::Pending);
    assert_eq!(vehicle.status.retry_count, 6);
    assert!(commands.get(&command_name("veh1", "v3", 6)).await.unwrap().is_some());
}

#[tokio::test]
async fn test_revert_to_reported_version_cancels() {
    let (commands, machine) = setup();
    let mut vehicle = failed_vehicle(1, 0);
    vehicle.spec.desired_version = "v1".to_string();
    vehicle.metadata.generation = 2;
    let before = vehicle.clone();

    assert_eq!(machine.reconcile(&mut vehicle).await.unwrap(), None);
    assert_eq!(vehicle, before);
    assert_eq!(vehicle.status.phase, OtaPhase::Failed);
    assert!(commands.list(&Selector::everything()).await.unwrap().is_empty());

    // Still nothing on the next pass
    machine.reconcile(&mut vehicle).await.unwrap();
    assert_eq!(vehicle, before);
}

#[tokio::test]
async fn test_cleared_desired_version_while_pending_fails() {
    let (_commands, machine) = setup();
    let mut vehicle = vehicle("", "v1");
    vehicle.status.phase = OtaPhase::Pending;

    machine.reconcile(&mut vehicle).await.unwrap();
    assert_eq!(vehicle.status.phase, OtaPhase::Failed);
    assert_eq!(vehicle.status.message, "desired version is empty");
}

#[tokio::test]
async fn test_versions_with_same_slug_get_separate_commands() {
    let (commands, machine) = setup();
    let mut done = commands
        .create(Command::ota_upgrade("veh1", "1.2.0", 0))
        .await
        .unwrap();
    done.set_phase(CommandPhase::Succeeded, "");
    commands.update_status(&done).await.unwrap();

    let mut vehicle = vehicle("1-2-0", "1.2.0");
    machine.reconcile(&mut vehicle).await.unwrap();

    assert_eq!(vehicle.status.phase, OtaPhase::Pending);
    let command = commands.get(&command_name("veh1", "1-2-0", 0)).await.unwrap().unwrap();
    assert_eq!(command.status.phase, CommandPhase::Pending);
    assert_eq!(command.spec.parameters["version"], "1-2-0");
    assert_eq!(commands.list(&Selector::everything()).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_foreign_command_under_attempt_name_is_not_trusted() {
    let (commands, machine) = setup();
    let mut foreign = Command::ota_upgrade("veh1", "v9", 0);
    foreign.metadata.name = command_name("veh1", "v2", 0);
    let mut foreign = commands.create(foreign).await.unwrap();
    foreign.set_phase(CommandPhase::Succeeded, "");
    commands.update_status(&foreign).await.unwrap();

    let mut vehicle = vehicle("v2", "v1");
    let err = machine.reconcile(&mut vehicle).await.unwrap_err();

    assert!(matches!(err, OtaError::Conflict(_)));
    assert_ne!(vehicle.status.phase, OtaPhase::Succeeded);
    assert_eq!(vehicle.status.reported_version, "v1");
}

#[test]
fn test_fire_rejects_undefined_edge() {
    let mut vehicle = vehicle("v2", "v1");
    assert_err!(fire(&mut vehicle, OtaEvent::Success));
    assert_eq!(vehicle.status.phase, OtaPhase::Idle);
    assert!(assert_ok!(fire(&mut vehicle, OtaEvent::Request)));
}

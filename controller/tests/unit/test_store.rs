//! Memory store semantics

use fleetota::errors::OtaError;
use fleetota::models::command::{command_name, Command, VEHICLE_LABEL};
use fleetota::models::vehicle::Vehicle;
use fleetota::storage::{MemoryStore, Selector, Store, WatchEventKind};

#[tokio::test]
async fn test_create_rejects_duplicates() {
    let store = MemoryStore::<Vehicle>::new();
    let created = store.create(Vehicle::new("veh1")).await.unwrap();
    assert_eq!(created.metadata.generation, 1);
    assert!(created.metadata.resource_version > 0);

    let err = store.create(Vehicle::new("veh1")).await.unwrap_err();
    assert!(matches!(err, OtaError::AlreadyExists(_)));
}

#[tokio::test]
async fn test_stale_write_conflicts() {
    let store = MemoryStore::<Vehicle>::new();
    let first = store.create(Vehicle::new("veh1")).await.unwrap();

    let mut fresh = first.clone();
    fresh.spec.desired_version = "v2".to_string();
    store.update(&fresh).await.unwrap();

    let mut stale = first;
    stale.status.online = true;
    let err = store.update_status(&stale).await.unwrap_err();
    assert!(matches!(err, OtaError::Conflict(_)));
}

#[tokio::test]
async fn test_generation_tracks_spec_changes_only() {
    let store = MemoryStore::<Vehicle>::new();
    let vehicle = store.create(Vehicle::new("veh1")).await.unwrap();

    let mut labelled = vehicle.clone();
    labelled.metadata.labels.insert("tier".to_string(), "canary".to_string());
    let labelled = store.update(&labelled).await.unwrap();
    assert_eq!(labelled.metadata.generation, 1);

    let mut status = labelled.clone();
    status.status.reported_version = "v1".to_string();
    let status = store.update_status(&status).await.unwrap();
    assert_eq!(status.metadata.generation, 1);

    let mut desired = status.clone();
    desired.spec.desired_version = "v2".to_string();
    let desired = store.update(&desired).await.unwrap();
    assert_eq!(desired.metadata.generation, 2);
    assert_eq!(desired.status.reported_version, "v1");
}

#[tokio::test]
async fn test_spec_write_keeps_stored_status() {
    let store = MemoryStore::<Vehicle>::new();
    let mut vehicle = store.create(Vehicle::new("veh1")).await.unwrap();
    vehicle.spec.desired_version = "v2".to_string();
    vehicle.status.reported_version = "bogus".to_string();

    let written = store.update(&vehicle).await.unwrap();
    assert_eq!(written.status.reported_version, "");
}

#[tokio::test]
async fn test_delete_with_finalizer_only_marks() {
    let store = MemoryStore::<Vehicle>::new();
    let mut vehicle = Vehicle::new("veh1");
    vehicle.metadata.add_finalizer("fleetota.io/cleanup");
    store.create(vehicle).await.unwrap();

    store.delete("veh1").await.unwrap();
    let marked = store.get("veh1").await.unwrap().unwrap();
    assert!(marked.metadata.deletion_requested);

    let mut released = marked;
    released.metadata.remove_finalizer("fleetota.io/cleanup");
    store.update(&released).await.unwrap();
    assert!(store.get("veh1").await.unwrap().is_none());
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_delete_missing_record() {
    let store = MemoryStore::<Vehicle>::new();
    let err = store.delete("ghost").await.unwrap_err();
    assert!(matches!(err, OtaError::NotFound(_)));
}

#[tokio::test]
async fn test_watch_reports_changes_with_labels() {
    let store = MemoryStore::<Command>::new();
    let mut watch = store.watch();

    let command = store
        .create(Command::ota_upgrade("veh1", "v2", 0))
        .await
        .unwrap();
    store.delete(command.name()).await.unwrap();

    let created = watch.recv().await.unwrap();
    assert_eq!(created.key, command_name("veh1", "v2", 0));
    assert_eq!(created.kind, WatchEventKind::Created);
    assert_eq!(created.labels.get(VEHICLE_LABEL).map(String::as_str), Some("veh1"));

    let deleted = watch.recv().await.unwrap();
    assert_eq!(deleted.kind, WatchEventKind::Deleted);
}

#[tokio::test]
async fn test_list_by_selector() {
    let store = MemoryStore::<Command>::new();
    store.create(Command::ota_upgrade("veh2", "v2", 0)).await.unwrap();
    store.create(Command::ota_upgrade("veh1", "v2", 1)).await.unwrap();
    store.create(Command::ota_upgrade("veh1", "v2", 0)).await.unwrap();

    let selector = Selector::parse(&format!("{}=veh1", VEHICLE_LABEL)).unwrap();
    let names: Vec<String> = store
        .list(&selector)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.metadata.name)
        .collect();
    assert_eq!(
        names,
        vec![command_name("veh1", "v2", 0), command_name("veh1", "v2", 1)]
    );

    assert_eq!(store.list(&Selector::everything()).await.unwrap().len(), 3);
}

#[test]
fn test_selector_parse_errors() {
    assert!(Selector::parse("a=b,,c=d").is_err());
    assert!(Selector::parse("bad key=x").is_err());
    assert!(Selector::parse("").unwrap().is_everything());
}

//! Shared fakes for the integration tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use rumqttc::QoS;
use tokio::sync::broadcast;

use fleetota::dispatch::{CommandChannel, DispatchRequest, DispatchResponse};
use fleetota::errors::OtaError;
use fleetota::mqtt::Transport;
use fleetota::storage::{MemoryStore, Object, Selector, Store, WatchEvent};
use fleetota::workers::status::{HeartbeatSink, StatusUpdate};

/// Memory store that counts writes
pub struct CountingStore<T: Object> {
    pub inner: MemoryStore<T>,
    pub updates: AtomicUsize,
    pub status_updates: AtomicUsize,
}

impl<T: Object> CountingStore<T> {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            updates: AtomicUsize::new(0),
            status_updates: AtomicUsize::new(0),
        }
    }

    pub fn writes(&self) -> usize {
        self.updates.load(Ordering::SeqCst) + self.status_updates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<T: Object> Store<T> for CountingStore<T> {
    async fn get(&self, key: &str) -> Result<Option<T>, OtaError> {
        self.inner.get(key).await
    }

    async fn create(&self, object: T) -> Result<T, OtaError> {
        self.inner.create(object).await
    }

    async fn update(&self, object: &T) -> Result<T, OtaError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.inner.update(object).await
    }

    async fn update_status(&self, object: &T) -> Result<T, OtaError> {
        self.status_updates.fetch_add(1, Ordering::SeqCst);
        self.inner.update_status(object).await
    }

    async fn list(&self, selector: &Selector) -> Result<Vec<T>, OtaError> {
        self.inner.list(selector).await
    }

    async fn delete(&self, key: &str) -> Result<(), OtaError> {
        self.inner.delete(key).await
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.inner.watch()
    }
}

/// Transport recording everything sent through it
#[derive(Default)]
pub struct RecordingTransport {
    pub subscribed: Mutex<Vec<String>>,
    pub published: Mutex<Vec<(String, Vec<u8>)>>,
}

impl RecordingTransport {
    pub fn published_json(&self) -> Vec<(String, serde_json::Value)> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(topic, payload)| (topic.clone(), serde_json::from_slice(payload).unwrap()))
            .collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn subscribe(&self, filter: &str, _qos: QoS) -> Result<(), OtaError> {
        self.subscribed.lock().unwrap().push(filter.to_string());
        Ok(())
    }

    async fn publish(&self, topic: &str, _qos: QoS, payload: Vec<u8>) -> Result<(), OtaError> {
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload));
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), OtaError> {
        Ok(())
    }
}

/// What a scripted channel answers
#[derive(Debug, Clone)]
pub enum Reply {
    Accept,
    Reject(String),
    Fail,
}

/// Command channel answering with a fixed reply
pub struct ScriptedChannel {
    reply: Mutex<Reply>,
    pub requests: Mutex<Vec<DispatchRequest>>,
}

impl ScriptedChannel {
    pub fn new(reply: Reply) -> Self {
        Self {
            reply: Mutex::new(reply),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn set_reply(&self, reply: Reply) {
        *self.reply.lock().unwrap() = reply;
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl CommandChannel for ScriptedChannel {
    async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchResponse, OtaError> {
        self.requests.lock().unwrap().push(request.clone());
        let reply = self.reply.lock().unwrap().clone();
        match reply {
            Reply::Accept => Ok(DispatchResponse::accepted("ok")),
            Reply::Reject(message) => Ok(DispatchResponse::rejected(message)),
            Reply::Fail => Err(OtaError::RpcError("connection refused".to_string())),
        }
    }
}

/// Heartbeat sink keeping every applied update
#[derive(Default)]
pub struct RecordingSink {
    pub applied: Mutex<Vec<StatusUpdate>>,
    pub fail_for: Mutex<Option<String>>,
}

impl RecordingSink {
    pub fn applied(&self) -> Vec<StatusUpdate> {
        let mut applied = self.applied.lock().unwrap().clone();
        applied.sort_by(|a, b| a.vehicle_id.cmp(&b.vehicle_id));
        applied
    }
}

#[async_trait]
impl HeartbeatSink for RecordingSink {
    async fn apply(&self, update: &StatusUpdate) -> Result<(), OtaError> {
        if self.fail_for.lock().unwrap().as_deref() == Some(update.vehicle_id.as_str()) {
            return Err(OtaError::StoreError("write refused".to_string()));
        }
        self.applied.lock().unwrap().push(update.clone());
        Ok(())
    }
}

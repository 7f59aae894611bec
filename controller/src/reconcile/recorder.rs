//! Human readable events about entity transitions

use std::sync::Mutex;

use tracing::info;

/// Sink for transition events
pub trait EventRecorder: Send + Sync {
    fn record(&self, kind: &str, key: &str, reason: &str, message: &str);
}

/// Emits events as structured log lines
#[derive(Debug, Default)]
pub struct LogRecorder;

impl EventRecorder for LogRecorder {
    fn record(&self, kind: &str, key: &str, reason: &str, message: &str) {
        info!(kind = %kind, key = %key, reason = %reason, "{}", message);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub kind: String,
    pub key: String,
    pub reason: String,
    pub message: String,
}

/// Keeps events in memory so tests can assert on them
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }
}

impl EventRecorder for MemoryRecorder {
    fn record(&self, kind: &str, key: &str, reason: &str, message: &str) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedEvent {
                kind: kind.to_string(),
                key: key.to_string(),
                reason: reason.to_string(),
                message: message.to_string(),
            });
    }
}

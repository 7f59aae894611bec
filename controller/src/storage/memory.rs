//! In-memory versioned record store

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::errors::OtaError;
use crate::storage::object::Object;
use crate::storage::selector::Selector;
use crate::storage::store::{Store, WatchEvent, WatchEventKind};

const WATCH_CAPACITY: usize = 1024;

/// Store backed by a map, suitable for tests and single-replica deployments
pub struct MemoryStore<T: Object> {
    records: RwLock<HashMap<String, T>>,
    version: AtomicU64,
    events: broadcast::Sender<WatchEvent>,
}

impl<T: Object> MemoryStore<T> {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            records: RwLock::new(HashMap::new()),
            version: AtomicU64::new(0),
            events,
        }
    }

    /// Number of stored records, including ones pending finalization
    pub fn len(&self) -> usize {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn notify(&self, object: &T, kind: WatchEventKind) {
        trace!(kind = T::KIND, key = %object.key(), ?kind, "store change");
        // No receivers is fine
        let _ = self.events.send(WatchEvent {
            key: object.key().to_string(),
            kind,
            labels: object.meta().labels.clone(),
        });
    }

    fn check_version(stored: &T, incoming: &T) -> Result<(), OtaError> {
        if stored.meta().resource_version != incoming.meta().resource_version {
            return Err(OtaError::Conflict(format!(
                "{} {} is at version {}, write was based on {}",
                T::KIND,
                stored.key(),
                stored.meta().resource_version,
                incoming.meta().resource_version
            )));
        }
        Ok(())
    }
}

impl<T: Object> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Object> Store<T> for MemoryStore<T> {
    async fn get(&self, key: &str) -> Result<Option<T>, OtaError> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        Ok(records.get(key).cloned())
    }

    async fn create(&self, mut object: T) -> Result<T, OtaError> {
        let created = {
            let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
            if records.contains_key(object.key()) {
                return Err(OtaError::AlreadyExists(format!("{} {}", T::KIND, object.key())));
            }
            let meta = object.meta_mut();
            meta.generation = 1;
            meta.resource_version = self.next_version();
            meta.deletion_requested = false;
            meta.created_at = Utc::now();
            records.insert(object.key().to_string(), object.clone());
            object
        };
        debug!(kind = T::KIND, key = %created.key(), "created record");
        self.notify(&created, WatchEventKind::Created);
        Ok(created)
    }

    async fn update(&self, object: &T) -> Result<T, OtaError> {
        let (result, kind) = {
            let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
            let stored = records
                .get(object.key())
                .ok_or_else(|| OtaError::NotFound(format!("{} {}", T::KIND, object.key())))?;
            Self::check_version(stored, object)?;

            // Status stays as stored; deletion can only be requested through delete()
            let spec_changed = stored.spec() != object.spec();
            let mut next = object.clone();
            *next.status_mut() = stored.status().clone();
            let meta = next.meta_mut();
            meta.generation = stored.meta().generation + i64::from(spec_changed);
            meta.resource_version = self.next_version();
            meta.deletion_requested = stored.meta().deletion_requested;
            meta.created_at = stored.meta().created_at;

            if next.meta().deletion_requested && next.meta().finalizers.is_empty() {
                records.remove(object.key());
                (next, WatchEventKind::Deleted)
            } else {
                records.insert(object.key().to_string(), next.clone());
                (next, WatchEventKind::Updated)
            }
        };
        self.notify(&result, kind);
        Ok(result)
    }

    async fn update_status(&self, object: &T) -> Result<T, OtaError> {
        let result = {
            let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
            let stored = records
                .get_mut(object.key())
                .ok_or_else(|| OtaError::NotFound(format!("{} {}", T::KIND, object.key())))?;
            Self::check_version(stored, object)?;
            *stored.status_mut() = object.status().clone();
            stored.meta_mut().resource_version = self.next_version();
            stored.clone()
        };
        self.notify(&result, WatchEventKind::Updated);
        Ok(result)
    }

    async fn list(&self, selector: &Selector) -> Result<Vec<T>, OtaError> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        let mut matched: Vec<T> = records
            .values()
            .filter(|r| selector.matches(&r.meta().labels))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.key().cmp(b.key()));
        Ok(matched)
    }

    async fn delete(&self, key: &str) -> Result<(), OtaError> {
        let (object, kind) = {
            let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
            let stored = records
                .get_mut(key)
                .ok_or_else(|| OtaError::NotFound(format!("{} {}", T::KIND, key)))?;
            if stored.meta().finalizers.is_empty() {
                let removed = records
                    .remove(key)
                    .ok_or_else(|| OtaError::NotFound(format!("{} {}", T::KIND, key)))?;
                (removed, WatchEventKind::Deleted)
            } else {
                if stored.meta().deletion_requested {
                    return Ok(());
                }
                stored.meta_mut().deletion_requested = true;
                stored.meta_mut().resource_version = self.next_version();
                (stored.clone(), WatchEventKind::Updated)
            }
        };
        debug!(kind = T::KIND, key = %key, finalizing = kind == WatchEventKind::Updated, "delete requested");
        self.notify(&object, kind);
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}

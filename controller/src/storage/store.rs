//! Store capability required by the controller

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::errors::OtaError;
use crate::storage::object::Object;
use crate::storage::selector::Selector;

/// What happened to a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Created,
    Updated,
    Deleted,
}

/// Change notification emitted by a store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub key: String,
    pub kind: WatchEventKind,
    /// Labels of the record at the time of the change
    pub labels: std::collections::BTreeMap<String, String>,
}

/// Versioned record store.
///
/// `update` and `update_status` are conditional on the caller's
/// `resource_version` and fail with [`OtaError::Conflict`] when the record
/// moved on underneath them.
#[async_trait]
pub trait Store<T: Object>: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<T>, OtaError>;

    /// Insert a new record. Fails with [`OtaError::AlreadyExists`] on collision.
    async fn create(&self, object: T) -> Result<T, OtaError>;

    /// Write metadata and spec. The status on `object` is ignored.
    async fn update(&self, object: &T) -> Result<T, OtaError>;

    /// Write status only.
    async fn update_status(&self, object: &T) -> Result<T, OtaError>;

    async fn list(&self, selector: &Selector) -> Result<Vec<T>, OtaError>;

    /// Request deletion. Records holding finalizers are only marked.
    async fn delete(&self, key: &str) -> Result<(), OtaError>;

    fn watch(&self) -> broadcast::Receiver<WatchEvent>;
}

//! Versioned record metadata shared by every persisted entity

use std::collections::BTreeMap;
use std::fmt::Debug;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bookkeeping fields the store owns on every record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Stable record key
    pub name: String,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Bumped by the store on every spec change
    #[serde(default)]
    pub generation: i64,

    /// Bumped by the store on every write; conditional writes compare against it
    #[serde(default)]
    pub resource_version: u64,

    #[serde(default)]
    pub finalizers: Vec<String>,

    #[serde(default)]
    pub deletion_requested: bool,

    pub created_at: DateTime<Utc>,
}

impl ObjectMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            labels: BTreeMap::new(),
            generation: 0,
            resource_version: 0,
            finalizers: Vec::new(),
            deletion_requested: false,
            created_at: Utc::now(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    pub fn add_finalizer(&mut self, finalizer: &str) {
        if !self.has_finalizer(finalizer) {
            self.finalizers.push(finalizer.to_string());
        }
    }

    pub fn remove_finalizer(&mut self, finalizer: &str) {
        self.finalizers.retain(|f| f != finalizer);
    }
}

/// A persisted entity with separately patchable spec and status
pub trait Object: Clone + Debug + Send + Sync + 'static {
    type Spec: Clone + Debug + PartialEq + Send + Sync;
    type Status: Clone + Debug + PartialEq + Send + Sync;

    /// Human readable kind used in logs and events
    const KIND: &'static str;

    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;
    fn spec(&self) -> &Self::Spec;
    fn status(&self) -> &Self::Status;
    fn status_mut(&mut self) -> &mut Self::Status;

    /// Coarse lifecycle phase, reported in transition events
    fn phase(&self) -> String;

    fn key(&self) -> &str {
        &self.meta().name
    }
}

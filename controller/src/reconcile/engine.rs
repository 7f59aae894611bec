//! Reconciliation engine: fetch, snapshot, run steps, patch what changed

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::errors::OtaError;
use crate::reconcile::recorder::EventRecorder;
use crate::storage::{Object, Store};

/// One in-memory mutation unit of a reconcile pass.
///
/// Steps never write the entity they are given; the engine persists
/// whatever they changed once the whole chain succeeded. A returned
/// duration asks for another pass after that long.
#[async_trait]
pub trait Step<T: Object>: Send + Sync {
    fn name(&self) -> &'static str;

    async fn reconcile(&self, object: &mut T) -> Result<Option<Duration>, OtaError>;
}

/// Cleanup that must finish before a finalized entity may disappear
#[async_trait]
pub trait Cleanup<T: Object>: Send + Sync {
    async fn cleanup(&self, object: &T) -> Result<(), OtaError>;
}

struct Finalizer<T: Object> {
    name: String,
    cleanup: Arc<dyn Cleanup<T>>,
}

/// Generic reconciler for one entity type
pub struct Reconciler<T: Object> {
    store: Arc<dyn Store<T>>,
    steps: Vec<Arc<dyn Step<T>>>,
    finalizer: Option<Finalizer<T>>,
    recorder: Arc<dyn EventRecorder>,
}

impl<T: Object> Reconciler<T> {
    pub fn new(store: Arc<dyn Store<T>>, recorder: Arc<dyn EventRecorder>) -> Self {
        Self {
            store,
            steps: Vec::new(),
            finalizer: None,
            recorder,
        }
    }

    /// Append a step; steps run in insertion order
    pub fn with_step(mut self, step: Arc<dyn Step<T>>) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_finalizer(mut self, name: impl Into<String>, cleanup: Arc<dyn Cleanup<T>>) -> Self {
        self.finalizer = Some(Finalizer {
            name: name.into(),
            cleanup,
        });
        self
    }

    /// One reconcile pass for `key`.
    ///
    /// Returns the smallest positive requeue hint any step asked for. An
    /// error means nothing was persisted and the caller should back off.
    pub async fn reconcile(&self, key: &str) -> Result<Option<Duration>, OtaError> {
        let Some(mut object) = self.store.get(key).await? else {
            debug!(kind = T::KIND, key = %key, "Entity gone, nothing to reconcile");
            return Ok(None);
        };
        let original = object.clone();

        if object.meta().deletion_requested {
            return self.finalize(object).await;
        }

        if let Some(ref finalizer) = self.finalizer {
            if !object.meta().has_finalizer(&finalizer.name) {
                object.meta_mut().add_finalizer(&finalizer.name);
                self.store.update(&object).await?;
                debug!(kind = T::KIND, key = %key, "Finalizer added");
                return Ok(None);
            }
        }

        let mut requeue_after: Option<Duration> = None;
        for step in &self.steps {
            match step.reconcile(&mut object).await {
                Ok(Some(after)) if !after.is_zero() => {
                    requeue_after = Some(requeue_after.map_or(after, |current| current.min(after)));
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(kind = T::KIND, key = %key, step = step.name(), "Step failed: {}", e);
                    return Err(e);
                }
            }
        }

        self.persist(&original, object).await?;
        Ok(requeue_after)
    }

    async fn finalize(&self, mut object: T) -> Result<Option<Duration>, OtaError> {
        let Some(ref finalizer) = self.finalizer else {
            return Ok(None);
        };
        if !object.meta().has_finalizer(&finalizer.name) {
            return Ok(None);
        }

        finalizer.cleanup.cleanup(&object).await?;
        object.meta_mut().remove_finalizer(&finalizer.name);
        match self.store.update(&object).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        info!(kind = T::KIND, key = %object.key(), "Finalizer removed");
        self.recorder.record(
            T::KIND,
            object.key(),
            "Finalized",
            &format!("cleanup for {} finished", object.key()),
        );
        Ok(None)
    }

    /// Write spec and status separately, each only when it differs from the snapshot
    async fn persist(&self, original: &T, mut object: T) -> Result<(), OtaError> {
        let spec_changed = original.spec() != object.spec() || original.meta() != object.meta();
        let status_changed = original.status() != object.status();

        if !spec_changed && !status_changed {
            return Ok(());
        }

        if spec_changed {
            let updated = self.store.update(&object).await?;
            // The status write below must be based on the version just written
            *object.meta_mut() = updated.meta().clone();
        }
        if status_changed {
            self.store.update_status(&object).await?;
        }

        let (before, after) = (original.phase(), object.phase());
        if before != after {
            self.recorder.record(
                T::KIND,
                object.key(),
                "PhaseChanged",
                &format!("{} {}: {} -> {}", T::KIND, object.key(), before, after),
            );
        } else if status_changed {
            debug!(kind = T::KIND, key = %object.key(), "Status patched");
        }
        Ok(())
    }
}

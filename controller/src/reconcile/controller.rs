//! Controller runtime: workers draining a work queue into a reconciler

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use crate::reconcile::engine::Reconciler;
use crate::reconcile::queue::WorkQueue;
use crate::storage::{Object, Selector, Store, WatchEvent};

/// Maps a store change to the key that should be reconciled, if any
pub type KeyMapper = fn(&WatchEvent) -> Option<String>;

/// Reconcile the changed record itself
pub fn same_key(event: &WatchEvent) -> Option<String> {
    Some(event.key.clone())
}

/// Runs `workers` concurrent reconcile loops for one entity type
pub struct Controller<T: Object> {
    name: &'static str,
    reconciler: Arc<Reconciler<T>>,
    queue: Arc<WorkQueue>,
    workers: usize,
}

impl<T: Object> Controller<T> {
    pub fn new(
        name: &'static str,
        reconciler: Arc<Reconciler<T>>,
        queue: Arc<WorkQueue>,
        workers: usize,
    ) -> Self {
        Self {
            name,
            reconciler,
            queue,
            workers: workers.max(1),
        }
    }

    pub fn queue(&self) -> Arc<WorkQueue> {
        self.queue.clone()
    }

    /// Process keys until shutdown; in-flight passes finish before returning
    pub async fn run(&self, shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>) {
        info!("{} controller starting with {} workers...", self.name, self.workers);

        let handles: Vec<_> = (0..self.workers)
            .map(|_| {
                let reconciler = self.reconciler.clone();
                let queue = self.queue.clone();
                let name = self.name;
                tokio::spawn(async move { worker(name, reconciler, queue).await })
            })
            .collect();

        shutdown_signal.await;
        info!("{} controller shutting down...", self.name);
        self.queue.shutdown();

        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!("{} worker panicked: {}", self.name, e);
            }
        }
    }
}

async fn worker<T: Object>(name: &'static str, reconciler: Arc<Reconciler<T>>, queue: Arc<WorkQueue>) {
    while let Some(key) = queue.get().await {
        match reconciler.reconcile(&key).await {
            Ok(Some(after)) => {
                queue.forget(&key);
                debug!(controller = name, key = %key, "Requeue in {:?}", after);
                queue.add_after(&key, after);
            }
            Ok(None) => queue.forget(&key),
            Err(e) => {
                let delay = queue.add_rate_limited(&key);
                warn!(controller = name, key = %key, "Reconcile failed, retrying in {:?}: {}", delay, e);
            }
        }
        queue.done(&key);
    }
}

/// Feed a queue from a store's change stream.
///
/// Lists the store once up front, and again whenever the stream lagged,
/// so no change is lost for good.
pub async fn forward_changes<W: Object>(
    store: Arc<dyn Store<W>>,
    queue: Arc<WorkQueue>,
    mapper: KeyMapper,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) {
    // Subscribe before listing so nothing slips between the two
    let mut changes = store.watch();
    resync(store.as_ref(), &queue, mapper).await;

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                debug!("{} change forwarder shutting down...", W::KIND);
                return;
            }
            received = changes.recv() => match received {
                Ok(event) => {
                    if let Some(key) = mapper(&event) {
                        queue.add(&key);
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!("{} change stream lagged by {} events, resyncing", W::KIND, missed);
                    resync(store.as_ref(), &queue, mapper).await;
                }
                Err(RecvError::Closed) => {
                    info!("{} change stream closed", W::KIND);
                    return;
                }
            }
        }
    }
}

async fn resync<W: Object>(store: &dyn Store<W>, queue: &WorkQueue, mapper: KeyMapper) {
    match store.list(&Selector::everything()).await {
        Ok(objects) => {
            for object in &objects {
                let event = WatchEvent {
                    key: object.key().to_string(),
                    kind: crate::storage::WatchEventKind::Updated,
                    labels: object.meta().labels.clone(),
                };
                if let Some(key) = mapper(&event) {
                    queue.add(&key);
                }
            }
            debug!("Resynced {} {} records", objects.len(), W::KIND);
        }
        Err(e) => error!("Failed to list {} records: {}", W::KIND, e),
    }
}

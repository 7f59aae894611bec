//! Garbage collection of finished commands

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::errors::OtaError;
use crate::models::command::Command;
use crate::storage::{Selector, Store};

/// GC worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Sweep interval
    pub interval: Duration,

    /// Terminal commands older than this are deleted
    pub retention: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),            // 1 hour
            retention: Duration::from_secs(30 * 24 * 3600), // 30 days
        }
    }
}

/// Result of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub deleted: usize,
    pub failed: usize,
}

/// Delete terminal commands whose completion (or creation) is older than `retention`
pub async fn sweep(
    store: &dyn Store<Command>,
    retention: Duration,
    now: DateTime<Utc>,
) -> Result<SweepReport, OtaError> {
    let retention = chrono::Duration::from_std(retention)
        .map_err(|e| OtaError::ConfigError(format!("retention out of range: {e}")))?;
    let cutoff = now - retention;

    let commands = store.list(&Selector::everything()).await?;
    let mut report = SweepReport {
        scanned: commands.len(),
        ..Default::default()
    };

    for command in commands
        .iter()
        .filter(|c| c.status.phase.is_terminal() && c.age_anchor() < cutoff)
    {
        match store.delete(command.name()).await {
            Ok(()) => {
                debug!(command = %command.name(), phase = %command.status.phase, "Deleted expired command");
                report.deleted += 1;
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                warn!(command = %command.name(), "Failed to delete expired command: {}", e);
                report.failed += 1;
            }
        }
    }

    Ok(report)
}

/// Run the GC worker
pub async fn run<S, F>(
    options: &Options,
    store: Arc<dyn Store<Command>>,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Command GC worker starting...");

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Command GC worker shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }

        match sweep(store.as_ref(), options.retention, Utc::now()).await {
            Ok(report) if report.deleted > 0 || report.failed > 0 => {
                info!(
                    "Command GC: scanned {}, deleted {}, failed {}",
                    report.scanned, report.deleted, report.failed
                );
            }
            Ok(report) => debug!("Command GC: scanned {}, nothing to delete", report.scanned),
            Err(e) => error!("Command GC sweep failed: {}", e),
        }
    }
}

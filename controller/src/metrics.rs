//! In-process counters for dispatch and status ingestion

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Outcome of one dispatch attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Accepted,
    Rejected,
    Error,
}

impl DispatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchOutcome::Accepted => "accepted",
            DispatchOutcome::Rejected => "rejected",
            DispatchOutcome::Error => "error",
        }
    }
}

/// Dispatch counters
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    accepted: AtomicU64,
    rejected: AtomicU64,
    errors: AtomicU64,
    latency_micros_total: AtomicU64,
}

impl DispatchMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, outcome: DispatchOutcome, latency: Duration) {
        let counter = match outcome {
            DispatchOutcome::Accepted => &self.accepted,
            DispatchOutcome::Rejected => &self.rejected,
            DispatchOutcome::Error => &self.errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.latency_micros_total.fetch_add(micros, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatchSnapshot {
        let accepted = self.accepted.load(Ordering::Relaxed);
        let rejected = self.rejected.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);
        let total = accepted + rejected + errors;
        let latency_total = self.latency_micros_total.load(Ordering::Relaxed);
        DispatchSnapshot {
            accepted,
            rejected,
            errors,
            mean_latency_micros: if total > 0 { latency_total / total } else { 0 },
        }
    }
}

/// Point-in-time view of [`DispatchMetrics`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchSnapshot {
    pub accepted: u64,
    pub rejected: u64,
    pub errors: u64,
    pub mean_latency_micros: u64,
}

/// Status pipeline counters
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pushed: AtomicU64,
    dropped: AtomicU64,
    flushed: AtomicU64,
    flush_failures: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_pushed(&self) {
        self.pushed.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the new drop total
    pub fn inc_dropped(&self) -> u64 {
        self.dropped.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn inc_flushed(&self) {
        self.flushed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_flush_failures(&self) {
        self.flush_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            pushed: self.pushed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            flushed: self.flushed.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`PipelineMetrics`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSnapshot {
    pub pushed: u64,
    pub dropped: u64,
    pub flushed: u64,
    pub flush_failures: u64,
}

//! Level-triggered reconciliation: engine, work queue and controller runtime

pub mod controller;
pub mod engine;
pub mod queue;
pub mod recorder;

pub use controller::{forward_changes, same_key, Controller, KeyMapper};
pub use engine::{Cleanup, Reconciler, Step};
pub use queue::WorkQueue;
pub use recorder::{EventRecorder, LogRecorder, MemoryRecorder, RecordedEvent};

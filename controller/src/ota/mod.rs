//! Per-vehicle OTA upgrade lifecycle

pub mod firmware;
pub mod fsm;
pub mod machine;

pub use firmware::{FirmwareUrlProvider, TemplateUrlProvider};
pub use fsm::{fire, next_phase, OtaEvent};
pub use machine::{owner_vehicle, CommandCleanup, OtaOptions, OtaStateMachine, CLEANUP_FINALIZER};

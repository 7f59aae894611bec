//! Transition table for the vehicle upgrade lifecycle

use std::fmt;

use tracing::debug;

use crate::errors::OtaError;
use crate::models::condition::{remove_condition, set_condition, types, Condition, ConditionStatus};
use crate::models::vehicle::{OtaPhase, Vehicle};

/// Upgrade lifecycle event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtaEvent {
    /// A new desired version was requested
    Request,

    /// The upgrade command finished successfully
    Success,

    /// The upgrade command failed, with the reason
    Fail(String),

    /// Acknowledge a success and return to idle
    Finalize,

    /// Start another attempt after a failure
    Retry,
}

impl OtaEvent {
    pub fn name(&self) -> &'static str {
        match self {
            OtaEvent::Request => "Request",
            OtaEvent::Success => "Success",
            OtaEvent::Fail(_) => "Fail",
            OtaEvent::Finalize => "Finalize",
            OtaEvent::Retry => "Retry",
        }
    }
}

impl fmt::Display for OtaEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Target phase of `event` fired from `from`, or an error for an edge that does not exist
pub fn next_phase(from: OtaPhase, event: &OtaEvent) -> Result<OtaPhase, OtaError> {
    let to = match (from, event) {
        (OtaPhase::Idle, OtaEvent::Request) => OtaPhase::Pending,
        (OtaPhase::Pending, OtaEvent::Success) => OtaPhase::Succeeded,
        (OtaPhase::Pending, OtaEvent::Fail(_)) => OtaPhase::Failed,
        (OtaPhase::Succeeded, OtaEvent::Finalize) => OtaPhase::Idle,
        (OtaPhase::Failed, OtaEvent::Retry) => OtaPhase::Pending,
        (from, event) => {
            return Err(OtaError::InvalidTransition {
                from: from.to_string(),
                event: event.to_string(),
            });
        }
    };
    Ok(to)
}

/// Whether `event` may fire for `vehicle` right now
fn guard(vehicle: &Vehicle, event: &OtaEvent) -> bool {
    match event {
        OtaEvent::Request | OtaEvent::Retry => vehicle.needs_upgrade(),
        OtaEvent::Success | OtaEvent::Fail(_) | OtaEvent::Finalize => true,
    }
}

/// Field changes that come with entering the target phase of `event`
fn enter(vehicle: &mut Vehicle, event: &OtaEvent) {
    let generation = vehicle.metadata.generation;
    let desired = vehicle.spec.desired_version.clone();
    let status = &mut vehicle.status;

    match event {
        OtaEvent::Request => {
            status.retry_count = 0;
            status.conditions.clear();
            status.message = format!("upgrading to {}", desired);
            set_condition(
                &mut status.conditions,
                Condition::new(types::SYNCED, ConditionStatus::False, "Pending", &status.message, generation),
            );
        }
        OtaEvent::Success => {
            status.reported_version = desired.clone();
            status.message = format!("running {}", desired);
            remove_condition(&mut status.conditions, types::PROGRESSING);
            set_condition(
                &mut status.conditions,
                Condition::new(types::SYNCED, ConditionStatus::True, "UpgradeSucceeded", &status.message, generation),
            );
        }
        OtaEvent::Fail(reason) => {
            status.message = reason.clone();
            remove_condition(&mut status.conditions, types::PROGRESSING);
            set_condition(
                &mut status.conditions,
                Condition::new(types::FAILED, ConditionStatus::True, "UpgradeFailed", reason.clone(), generation),
            );
            set_condition(
                &mut status.conditions,
                Condition::new(types::SYNCED, ConditionStatus::False, "UpgradeFailed", reason.clone(), generation),
            );
        }
        OtaEvent::Retry => {
            status.retry_count += 1;
            status.message = format!("retrying upgrade to {} (attempt {})", desired, status.retry_count + 1);
            set_condition(
                &mut status.conditions,
                Condition::new(types::FAILED, ConditionStatus::False, "Retrying", &status.message, generation),
            );
            set_condition(
                &mut status.conditions,
                Condition::new(types::SYNCED, ConditionStatus::False, "Pending", &status.message, generation),
            );
        }
        OtaEvent::Finalize => {}
    }
}

/// Fire `event` on `vehicle`.
///
/// Returns `Ok(false)` when the guard cancelled the transition; the
/// vehicle is left untouched in that case.
pub fn fire(vehicle: &mut Vehicle, event: OtaEvent) -> Result<bool, OtaError> {
    let from = vehicle.status.phase;
    let to = next_phase(from, &event)?;

    if !guard(vehicle, &event) {
        debug!(vehicle = %vehicle.id(), "{} from {} cancelled by guard", event, from);
        return Ok(false);
    }

    enter(vehicle, &event);
    vehicle.status.phase = to;
    debug!(vehicle = %vehicle.id(), "{}: {} -> {}", event, from, to);
    Ok(true)
}

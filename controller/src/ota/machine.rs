//! OTA state machine step hosted by the vehicle reconciler

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::errors::OtaError;
use crate::models::command::{command_name, params, Command, CommandPhase, VEHICLE_LABEL};
use crate::models::condition::{find_condition, set_condition, types, Condition, ConditionStatus};
use crate::models::vehicle::{OtaPhase, Vehicle};
use crate::ota::fsm::{fire, OtaEvent};
use crate::reconcile::{Cleanup, Step};
use crate::storage::{Selector, Store, WatchEvent};

/// Finalizer guarding vehicle deletion until its commands are gone
pub const CLEANUP_FINALIZER: &str = "fleetota.io/cleanup";

/// Upper bound on transitions chained inside one pass
const MAX_TRANSITIONS_PER_PASS: usize = 4;

#[derive(Debug, Clone)]
pub struct OtaOptions {
    /// Automatic retries before giving up
    pub max_retry_count: u32,

    /// Backoff before the first automatic retry; doubles per attempt
    pub base_delay: Duration,

    /// Safety-net requeue while a command is outstanding
    pub pending_requeue: Duration,
}

impl Default for OtaOptions {
    fn default() -> Self {
        Self {
            max_retry_count: 5,
            base_delay: Duration::from_secs(60),
            pending_requeue: Duration::from_secs(30),
        }
    }
}

enum Flow {
    Continue,
    Done(Option<Duration>),
}

/// Drives one vehicle through Idle, Pending, Succeeded and Failed
pub struct OtaStateMachine {
    commands: Arc<dyn Store<Command>>,
    options: OtaOptions,
}

impl OtaStateMachine {
    pub fn new(commands: Arc<dyn Store<Command>>, options: OtaOptions) -> Self {
        Self { commands, options }
    }

    /// Wait before automatic retry number `retry_count + 1`
    pub fn retry_backoff(&self, retry_count: u32) -> Duration {
        self.options
            .base_delay
            .saturating_mul(2u32.saturating_pow(retry_count))
    }

    async fn handle_pending(&self, vehicle: &mut Vehicle) -> Result<Flow, OtaError> {
        if !vehicle.needs_upgrade() {
            if vehicle.spec.desired_version.is_empty() {
                fire(vehicle, OtaEvent::Fail("desired version is empty".to_string()))?;
                return Ok(Flow::Continue);
            }
            // Device already runs what is wanted
            fire(vehicle, OtaEvent::Success)?;
            return Ok(Flow::Done(None));
        }

        let name = command_name(
            vehicle.id(),
            &vehicle.spec.desired_version,
            vehicle.status.retry_count,
        );

        let Some(command) = self.commands.get(&name).await? else {
            let command = Command::ota_upgrade(
                vehicle.id(),
                &vehicle.spec.desired_version,
                vehicle.status.retry_count,
            );
            match self.commands.create(command).await {
                Ok(_) => info!(vehicle = %vehicle.id(), command = %name, "Upgrade command created"),
                Err(OtaError::AlreadyExists(_)) => {
                    debug!(vehicle = %vehicle.id(), command = %name, "Upgrade command already exists")
                }
                Err(e) => return Err(e),
            }
            self.mark_in_progress(vehicle, format!("dispatching {}", name));
            return Ok(Flow::Done(Some(self.options.pending_requeue)));
        };

        if !command.is_attempt_of(vehicle.id(), &vehicle.spec.desired_version) {
            warn!(
                vehicle = %vehicle.id(),
                command = %name,
                "Command targets {} for vehicle {}, not this attempt",
                command.spec.parameters.get(params::VERSION).map(String::as_str).unwrap_or(""),
                command.spec.vehicle_id
            );
            return Err(OtaError::Conflict(format!(
                "command {} does not belong to vehicle {} at version {}",
                name,
                vehicle.id(),
                vehicle.spec.desired_version
            )));
        }

        match command.status.phase {
            CommandPhase::Succeeded => {
                fire(vehicle, OtaEvent::Success)?;
                Ok(Flow::Done(None))
            }
            CommandPhase::Failed | CommandPhase::Timeout => {
                let reason = if command.status.message.is_empty() {
                    format!("command {} ended in {}", name, command.status.phase)
                } else {
                    command.status.message.clone()
                };
                warn!(vehicle = %vehicle.id(), command = %name, "Upgrade failed: {}", reason);
                fire(vehicle, OtaEvent::Fail(reason))?;
                Ok(Flow::Continue)
            }
            phase => {
                self.mark_in_progress(vehicle, format!("command {} is {}", name, phase));
                if let Some(stage) = find_condition(&command.status.conditions, types::PROGRESSING) {
                    let generation = vehicle.metadata.generation;
                    set_condition(
                        &mut vehicle.status.conditions,
                        Condition::new(
                            types::PROGRESSING,
                            stage.status,
                            &stage.reason,
                            stage.message.clone(),
                            generation,
                        ),
                    );
                }
                Ok(Flow::Done(Some(self.options.pending_requeue)))
            }
        }
    }

    fn mark_in_progress(&self, vehicle: &mut Vehicle, message: String) {
        let generation = vehicle.metadata.generation;
        set_condition(
            &mut vehicle.status.conditions,
            Condition::new(types::SYNCED, ConditionStatus::False, "InProgress", message.clone(), generation),
        );
        vehicle.status.message = message;
    }

    fn handle_failed(&self, vehicle: &mut Vehicle) -> Result<Flow, OtaError> {
        let failure = find_condition(&vehicle.status.conditions, types::FAILED).cloned();

        if let Some(ref failure) = failure {
            if failure.observed_generation < vehicle.metadata.generation {
                // Spec changed since the failure: retry now, or stay put if the change was a revert
                if fire(vehicle, OtaEvent::Retry)? {
                    info!(vehicle = %vehicle.id(), "Manual retry requested");
                    return Ok(Flow::Continue);
                }
                debug!(vehicle = %vehicle.id(), "Upgrade cancelled, staying Failed");
                return Ok(Flow::Done(None));
            }
        }

        if vehicle.status.retry_count >= self.options.max_retry_count {
            debug!(vehicle = %vehicle.id(), "Retries exhausted ({})", vehicle.status.retry_count);
            return Ok(Flow::Done(None));
        }

        let backoff = self.retry_backoff(vehicle.status.retry_count);
        if let Some(failure) = failure {
            let elapsed = (Utc::now() - failure.last_transition_time)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if elapsed < backoff {
                return Ok(Flow::Done(Some(backoff - elapsed)));
            }
        }

        if fire(vehicle, OtaEvent::Retry)? {
            info!(
                vehicle = %vehicle.id(),
                "Retrying upgrade, attempt {}", vehicle.status.retry_count + 1
            );
            return Ok(Flow::Continue);
        }
        Ok(Flow::Done(None))
    }
}

#[async_trait]
impl Step<Vehicle> for OtaStateMachine {
    fn name(&self) -> &'static str {
        "ota"
    }

    async fn reconcile(&self, vehicle: &mut Vehicle) -> Result<Option<Duration>, OtaError> {
        for _ in 0..MAX_TRANSITIONS_PER_PASS {
            let flow = match vehicle.status.phase {
                OtaPhase::Idle => {
                    if fire(vehicle, OtaEvent::Request)? {
                        Flow::Continue
                    } else {
                        Flow::Done(None)
                    }
                }
                OtaPhase::Pending => self.handle_pending(vehicle).await?,
                OtaPhase::Succeeded => {
                    fire(vehicle, OtaEvent::Finalize)?;
                    Flow::Continue
                }
                OtaPhase::Failed => self.handle_failed(vehicle)?,
            };
            if let Flow::Done(requeue) = flow {
                return Ok(requeue);
            }
        }
        Ok(None)
    }
}

/// Vehicle owning a changed command, taken from its label
pub fn owner_vehicle(event: &WatchEvent) -> Option<String> {
    event.labels.get(VEHICLE_LABEL).cloned()
}

/// Deletes every command of a vehicle that is being removed
pub struct CommandCleanup {
    commands: Arc<dyn Store<Command>>,
}

impl CommandCleanup {
    pub fn new(commands: Arc<dyn Store<Command>>) -> Self {
        Self { commands }
    }
}

#[async_trait]
impl Cleanup<Vehicle> for CommandCleanup {
    async fn cleanup(&self, vehicle: &Vehicle) -> Result<(), OtaError> {
        let owned = self
            .commands
            .list(&Selector::eq(VEHICLE_LABEL, vehicle.id()))
            .await?;
        for command in &owned {
            match self.commands.delete(command.name()).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        info!(vehicle = %vehicle.id(), "Deleted {} commands", owned.len());
        Ok(())
    }
}

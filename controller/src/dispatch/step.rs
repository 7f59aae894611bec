//! Reconcile steps for command records

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use crate::dispatch::channel::{CommandChannel, DispatchRequest};
use crate::errors::OtaError;
use crate::metrics::{DispatchMetrics, DispatchOutcome};
use crate::models::command::{Command, CommandPhase};
use crate::reconcile::Step;

/// Hands pending commands to the channel
pub struct DispatchStep {
    channel: Arc<dyn CommandChannel>,
    metrics: Arc<DispatchMetrics>,
}

impl DispatchStep {
    pub fn new(channel: Arc<dyn CommandChannel>, metrics: Arc<DispatchMetrics>) -> Self {
        Self { channel, metrics }
    }
}

#[async_trait]
impl Step<Command> for DispatchStep {
    fn name(&self) -> &'static str {
        "dispatch"
    }

    async fn reconcile(&self, command: &mut Command) -> Result<Option<Duration>, OtaError> {
        if command.status.phase != CommandPhase::Pending {
            return Ok(None);
        }

        let request = DispatchRequest::from(&*command);
        let started = Instant::now();
        let response = match self.channel.dispatch(&request).await {
            Ok(response) => response,
            Err(e) => {
                self.metrics.record(DispatchOutcome::Error, started.elapsed());
                return Err(e);
            }
        };

        if response.accepted {
            self.metrics.record(DispatchOutcome::Accepted, started.elapsed());
            info!(command = %command.name(), "Command sent");
            command.set_phase(CommandPhase::Sent, response.message);
        } else {
            self.metrics.record(DispatchOutcome::Rejected, started.elapsed());
            warn!(command = %command.name(), "Command rejected: {}", response.message);
            command.set_phase(CommandPhase::Failed, format!("rejected: {}", response.message));
        }
        Ok(None)
    }
}

/// Fails commands the device has not finished in time
pub struct TimeoutStep {
    timeout: Duration,
}

impl TimeoutStep {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Step<Command> for TimeoutStep {
    fn name(&self) -> &'static str {
        "timeout"
    }

    async fn reconcile(&self, command: &mut Command) -> Result<Option<Duration>, OtaError> {
        if !command.status.phase.is_in_flight() {
            return Ok(None);
        }

        let started = command.status.sent_at.unwrap_or(command.metadata.created_at);
        let elapsed = (Utc::now() - started).to_std().unwrap_or(Duration::ZERO);
        if elapsed < self.timeout {
            return Ok(Some(self.timeout - elapsed));
        }

        warn!(command = %command.name(), "No completion after {:?}", self.timeout);
        command.set_phase(
            CommandPhase::Timeout,
            format!("device did not complete within {}s", self.timeout.as_secs()),
        );
        Ok(None)
    }
}

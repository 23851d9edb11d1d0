// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command dispatcher
//!
//! A single task drains the queue, which is what makes the one-command-
//! in-flight guarantee hold; running two dispatchers against one queue
//! would break it (the queue itself refuses to hand out a second command,
//! but nobody would be making progress).
//!
//! Each dispatch races the handler against the command's deadline.  The
//! loser of the race is dropped at its next suspension point; the bus lock
//! scopes are bounded per exchange, so a dropped handler never leaves the
//! bus held, and an exchange already on the wire completes on its own.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tracing::{error, info, warn};

use drv_inverter_devices::{InverterError, Spf5000Es};
use publish_api::{CommandResponse, DeviceIdentity, PublishSink, TopicScheme};

use crate::command::{Command, CommandError, CommandKind, Schedule};
use crate::queue::CommandQueue;

/// How long the run loop dozes when the queue is empty and nobody rings
/// the bell.
const IDLE_POLL: Duration = Duration::from_millis(100);

pub struct Dispatcher {
    queue: Arc<CommandQueue>,
    device: Arc<Spf5000Es>,
    sink: Arc<dyn PublishSink>,
    identity: DeviceIdentity,
    topics: TopicScheme,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<CommandQueue>,
        device: Arc<Spf5000Es>,
        sink: Arc<dyn PublishSink>,
        identity: DeviceIdentity,
        topics: TopicScheme,
    ) -> Self {
        Self {
            queue,
            device,
            sink,
            identity,
            topics,
        }
    }

    /// Drains the queue until shutdown is signalled.  An in-flight command
    /// is allowed to finish; only dequeuing stops.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("command dispatcher running");

        loop {
            if *shutdown.borrow() {
                break;
            }
            if !self.process_next().await {
                tokio::select! {
                    _ = self.queue.notified() => {}
                    _ = tokio::time::sleep(IDLE_POLL) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        info!("command dispatcher stopped");
    }

    /// Dispatches at most one command.  Returns false if there was nothing
    /// to do.
    pub async fn process_next(&self) -> bool {
        let Some(cmd) = self.queue.take_next() else {
            return false;
        };

        info!(
            id = %cmd.id,
            kind = cmd.kind.name(),
            attempt = cmd.attempts,
            "executing command"
        );

        match tokio::time::timeout(cmd.timeout, self.execute(&cmd.kind)).await {
            Ok(Ok(result)) => {
                self.queue.complete(&cmd.id, result.clone());
                info!(id = %cmd.id, "command completed");
                self.respond(&cmd, Ok(result)).await;
            }
            Ok(Err(err)) => {
                let message = err.to_string();
                if self.queue.fail(&cmd.id, message.clone()) {
                    error!(id = %cmd.id, %message, "command failed permanently");
                    self.respond(&cmd, Err(message)).await;
                } else {
                    warn!(
                        id = %cmd.id,
                        %message,
                        attempt = cmd.attempts,
                        "command failed, requeued"
                    );
                }
            }
            Err(_) => {
                let message = CommandError::Timeout(cmd.timeout.as_secs()).to_string();
                self.queue.mark_timeout(&cmd.id, message.clone());
                error!(id = %cmd.id, timeout = cmd.timeout.as_secs(), "command timed out");
                self.respond(&cmd, Err(message)).await;
            }
        }

        true
    }

    async fn respond(&self, cmd: &Command, outcome: Result<Value, String>) {
        let response = CommandResponse::new(&self.identity, &cmd.id, outcome);
        let topic = cmd
            .response_topic
            .clone()
            .unwrap_or_else(|| self.topics.command_response());

        let payload = match serde_json::to_value(&response) {
            Ok(payload) => payload,
            Err(err) => {
                error!(id = %cmd.id, %err, "unserializable command response");
                return;
            }
        };

        if let Err(err) = self.sink.publish(&topic, payload, false).await {
            warn!(id = %cmd.id, %err, "failed to publish command response");
        }
    }

    async fn execute(&self, kind: &CommandKind) -> Result<Value, InverterError> {
        match kind {
            CommandKind::ReadRegister { register } => {
                let value = self.device.read_register(register).await?;
                Ok(value.into())
            }
            CommandKind::WriteRegister { register, value } => {
                self.device.write_register(register, *value).await?;
                Ok(Value::Bool(true))
            }
            CommandKind::ReadAll => {
                let data = self.device.read_monitoring().await;
                let map = data
                    .into_iter()
                    .map(|(name, value)| (name.to_string(), value.into()))
                    .collect();
                Ok(Value::Object(map))
            }
            CommandKind::SetChargeMode { enable } => {
                self.device
                    .write_register("enable_charge", f64::from(u8::from(*enable)))
                    .await?;
                Ok(Value::Bool(true))
            }
            CommandKind::SetDischargeMode { enable } => {
                self.device
                    .write_register("enable_discharge", f64::from(u8::from(*enable)))
                    .await?;
                Ok(Value::Bool(true))
            }
            CommandKind::SetChargePower { power } => {
                self.device
                    .write_register("charge_power_limit", *power)
                    .await?;
                Ok(Value::Bool(true))
            }
            CommandKind::SetDischargePower { power } => {
                self.device
                    .write_register("discharge_power_limit", *power)
                    .await?;
                Ok(Value::Bool(true))
            }
            CommandKind::SetChargeSchedule(schedule) => {
                self.write_schedule("charge", schedule).await
            }
            CommandKind::SetDischargeSchedule(schedule) => {
                self.write_schedule("discharge", schedule).await
            }
        }
    }

    /// Writes a schedule window as two register writes inside one dispatch.
    /// Nothing else can run between them: the dispatcher is the only thing
    /// driving the queue, so the pair is atomic as far as commands are
    /// concerned.
    async fn write_schedule(
        &self,
        direction: &str,
        schedule: &Schedule,
    ) -> Result<Value, InverterError> {
        let start = format!("{}_time_{}_start", direction, schedule.slot);
        let end = format!("{}_time_{}_end", direction, schedule.slot);

        self.device
            .write_register(&start, f64::from(schedule.start))
            .await?;
        self.device
            .write_register(&end, f64::from(schedule.end))
            .await?;
        Ok(Value::Bool(true))
    }
}

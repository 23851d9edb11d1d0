// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Priority command queue
//!
//! Producers submit from any task; the dispatcher drains.  The whole queue
//! state lives behind one short-held mutex, and every status transition
//! commits a command's status together with its result or error, so a
//! snapshot taken at any moment is internally consistent.
//!
//! Ordering: a new command is inserted at the first position whose occupant
//! has strictly lower priority.  Equal priorities keep submission order,
//! and a retried command re-enters through the same rule, which places it
//! behind any queued peers of its own band.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{info, warn};
use uuid::Uuid;

use crate::command::{
    Command, CommandError, CommandSnapshot, CommandSpec, CommandStatus,
};

#[derive(Clone, Debug)]
pub struct QueueConfig {
    pub max_queue_size: usize,
    /// Applied when a submission does not name its own timeout.
    pub default_timeout: Duration,
    pub default_max_attempts: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 100,
            default_timeout: Duration::from_secs(30),
            default_max_attempts: 3,
        }
    }
}

/// Aggregate view for introspection.
#[derive(Clone, Debug, Serialize)]
pub struct QueueStatus {
    pub queue_size: usize,
    pub processing: bool,
    pub current_command: Option<String>,
    pub total_commands: usize,
    pub status_counts: BTreeMap<&'static str, usize>,
}

struct QueueState {
    /// Pending command ids, highest priority first, FIFO within a band.
    pending: Vec<String>,
    /// The zero-or-one command being executed right now.
    current: Option<String>,
    /// Every command ever submitted, keyed by id.
    history: IndexMap<String, Command>,
}

pub struct CommandQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    config: QueueConfig,
}

impl CommandQueue {
    pub fn new(config: QueueConfig) -> Self {
        info!(max_queue_size = config.max_queue_size, "command queue up");
        Self {
            state: Mutex::new(QueueState {
                pending: Vec::new(),
                current: None,
                history: IndexMap::new(),
            }),
            notify: Notify::new(),
            config,
        }
    }

    /// Accepts a command for execution and returns its id.
    pub fn submit(&self, spec: CommandSpec) -> Result<String, CommandError> {
        let mut state = self.state.lock().unwrap();

        if state.pending.len() >= self.config.max_queue_size {
            warn!(
                max_queue_size = self.config.max_queue_size,
                "rejecting command, queue full"
            );
            return Err(CommandError::QueueFull(self.config.max_queue_size));
        }

        let id = spec
            .id
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let command = Command {
            id: id.clone(),
            kind: spec.kind,
            priority: spec.priority,
            timeout: spec.timeout.unwrap_or(self.config.default_timeout),
            max_attempts: spec.max_attempts.unwrap_or(self.config.default_max_attempts),
            attempts: 0,
            status: CommandStatus::Pending,
            created_at: Utc::now(),
            last_attempt: None,
            result: None,
            error: None,
            response_topic: spec.response_topic,
        };

        info!(%id, kind = command.kind.name(), priority = ?command.priority, "command queued");
        insert_by_priority(&mut state, command);
        drop(state);

        self.notify.notify_one();
        Ok(id)
    }

    /// Hands the dispatcher the next command, marking it in flight.  `None`
    /// while a command is already being processed: there is never more than
    /// one.
    pub(crate) fn take_next(&self) -> Option<Command> {
        let mut state = self.state.lock().unwrap();

        if state.current.is_some() || state.pending.is_empty() {
            return None;
        }

        let id = state.pending.remove(0);
        state.current = Some(id.clone());

        let entry = state.history.get_mut(&id)?;
        entry.status = CommandStatus::Processing;
        entry.attempts += 1;
        entry.last_attempt = Some(Utc::now());
        Some(entry.clone())
    }

    pub(crate) fn complete(&self, id: &str, result: Value) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.history.get_mut(id) {
            entry.status = CommandStatus::Completed;
            entry.result = Some(result);
        }
        state.current = None;
    }

    /// Records a failed execution.  Returns true if the failure was
    /// terminal; otherwise the command went back to its priority band for
    /// another attempt.
    pub(crate) fn fail(&self, id: &str, error: String) -> bool {
        let mut state = self.state.lock().unwrap();
        state.current = None;

        let Some(entry) = state.history.get_mut(id) else {
            return true;
        };
        entry.error = Some(error);

        if entry.attempts < entry.max_attempts {
            entry.status = CommandStatus::Pending;
            let requeued = entry.clone();
            insert_by_priority(&mut state, requeued);
            drop(state);
            self.notify.notify_one();
            false
        } else {
            entry.status = CommandStatus::Failed;
            true
        }
    }

    /// Records a timed-out execution.  Timed-out commands do not re-queue;
    /// resubmission is the caller's decision.
    pub(crate) fn mark_timeout(&self, id: &str, error: String) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.history.get_mut(id) {
            entry.status = CommandStatus::TimedOut;
            entry.error = Some(error);
        }
        state.current = None;
    }

    /// Cancels a pending command.  A command already in flight is left
    /// alone: interrupting it could leave the inverter half-configured.
    pub fn cancel(&self, id: &str) -> bool {
        let mut state = self.state.lock().unwrap();

        let Some(index) = state.pending.iter().position(|p| p == id) else {
            return false;
        };
        state.pending.remove(index);
        if let Some(entry) = state.history.get_mut(id) {
            entry.status = CommandStatus::Cancelled;
        }
        info!(%id, "command cancelled");
        true
    }

    /// Cancels every pending command.  Does not touch the in-flight one.
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        let ids = std::mem::take(&mut state.pending);
        for id in &ids {
            if let Some(entry) = state.history.get_mut(id) {
                entry.status = CommandStatus::Cancelled;
            }
        }
        info!(cleared = ids.len(), "queue cleared");
        ids.len()
    }

    pub fn status_of(&self, id: &str) -> Option<CommandSnapshot> {
        let state = self.state.lock().unwrap();
        state.history.get(id).map(CommandSnapshot::from)
    }

    pub fn queue_status(&self) -> QueueStatus {
        let state = self.state.lock().unwrap();
        let mut status_counts: BTreeMap<&'static str, usize> = BTreeMap::new();
        for command in state.history.values() {
            *status_counts.entry(command.status.name()).or_default() += 1;
        }
        QueueStatus {
            queue_size: state.pending.len(),
            processing: state.current.is_some(),
            current_command: state.current.clone(),
            total_commands: state.history.len(),
            status_counts,
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_processing(&self) -> bool {
        self.state.lock().unwrap().current.is_some()
    }

    /// Resolves when new work may be available.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

fn insert_by_priority(state: &mut QueueState, command: Command) {
    let QueueState {
        pending, history, ..
    } = state;

    let priority = command.priority;
    let position = pending
        .iter()
        .position(|id| {
            history
                .get(id)
                .map(|other| other.priority < priority)
                .unwrap_or(true)
        })
        .unwrap_or(pending.len());

    pending.insert(position, command.id.clone());
    history.insert(command.id.clone(), command);
}

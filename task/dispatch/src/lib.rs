// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Serialized command execution
//!
//! This is the part of the bridge that keeps the inverter alive: every
//! register access requested from outside is funneled through one priority
//! queue and executed by one dispatcher, one command at a time, with retry,
//! per-command deadlines, and cancellation.  See [`queue::CommandQueue`]
//! for the ordering rules and [`dispatcher::Dispatcher`] for the execution
//! race.

pub mod command;
pub mod dispatcher;
pub mod queue;

pub use command::{
    payload_command_id, Command, CommandError, CommandKind, CommandSnapshot, CommandSpec,
    CommandStatus, Priority, Schedule,
};
pub use dispatcher::Dispatcher;
pub use queue::{CommandQueue, QueueConfig, QueueStatus};

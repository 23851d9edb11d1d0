// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command model
//!
//! Commands arrive from outside as loosely-typed JSON; everything past
//! [`CommandSpec::from_payload`] works with the closed [`CommandKind`] set,
//! so an unknown command type can only exist at the parsing boundary.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CommandError {
    #[error("unknown command type: {0}")]
    UnknownCommand(String),
    #[error("missing or invalid argument '{argument}' for {command}")]
    BadArgument {
        command: String,
        argument: &'static str,
    },
    #[error("command queue full (max {0})")]
    QueueFull(usize),
    #[error("command timed out after {0} seconds")]
    Timeout(u64),
}

#[derive(Copy, Clone, Debug, Eq, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 1,
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl Priority {
    /// Lenient parse for externally-sourced payloads; anything
    /// unrecognized is `None` and callers degrade to `Normal`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Some(Priority::Low),
            "normal" => Some(Priority::Normal),
            "high" => Some(Priority::High),
            "critical" => Some(Priority::Critical),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    #[serde(rename = "timeout")]
    TimedOut,
    Cancelled,
}

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandStatus::Completed
                | CommandStatus::Failed
                | CommandStatus::TimedOut
                | CommandStatus::Cancelled
        )
    }

    /// Wire name, e.g. for keying status counts.
    pub fn name(self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Processing => "processing",
            CommandStatus::Completed => "completed",
            CommandStatus::Failed => "failed",
            CommandStatus::TimedOut => "timeout",
            CommandStatus::Cancelled => "cancelled",
        }
    }
}

/// A charge or discharge window, HHMM-encoded like the device registers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Schedule {
    pub start: u16,
    pub end: u16,
    pub slot: u8,
}

#[derive(Clone, Debug, PartialEq)]
pub enum CommandKind {
    ReadRegister { register: String },
    WriteRegister { register: String, value: f64 },
    ReadAll,
    SetChargeMode { enable: bool },
    SetDischargeMode { enable: bool },
    SetChargePower { power: f64 },
    SetDischargePower { power: f64 },
    SetChargeSchedule(Schedule),
    SetDischargeSchedule(Schedule),
}

impl CommandKind {
    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::ReadRegister { .. } => "read_register",
            CommandKind::WriteRegister { .. } => "write_register",
            CommandKind::ReadAll => "read_all",
            CommandKind::SetChargeMode { .. } => "set_charge_mode",
            CommandKind::SetDischargeMode { .. } => "set_discharge_mode",
            CommandKind::SetChargePower { .. } => "set_charge_power",
            CommandKind::SetDischargePower { .. } => "set_discharge_power",
            CommandKind::SetChargeSchedule(_) => "set_charge_schedule",
            CommandKind::SetDischargeSchedule(_) => "set_discharge_schedule",
        }
    }

    /// Parses the `command_type` / `data` pair of an inbound payload.
    pub fn parse(command_type: &str, data: &Value) -> Result<Self, CommandError> {
        let bad = |argument| CommandError::BadArgument {
            command: command_type.to_string(),
            argument,
        };

        match command_type {
            "read_register" => Ok(CommandKind::ReadRegister {
                register: str_arg(data, "register").ok_or_else(|| bad("register"))?,
            }),
            "write_register" => Ok(CommandKind::WriteRegister {
                register: str_arg(data, "register").ok_or_else(|| bad("register"))?,
                value: f64_arg(data, "value").ok_or_else(|| bad("value"))?,
            }),
            "read_all" => Ok(CommandKind::ReadAll),
            "set_charge_mode" => Ok(CommandKind::SetChargeMode {
                enable: bool_arg(data, "enable").unwrap_or(true),
            }),
            "set_discharge_mode" => Ok(CommandKind::SetDischargeMode {
                enable: bool_arg(data, "enable").unwrap_or(true),
            }),
            "set_charge_power" => Ok(CommandKind::SetChargePower {
                power: f64_arg(data, "power").ok_or_else(|| bad("power"))?,
            }),
            "set_discharge_power" => Ok(CommandKind::SetDischargePower {
                power: f64_arg(data, "power").ok_or_else(|| bad("power"))?,
            }),
            "set_charge_schedule" => Ok(CommandKind::SetChargeSchedule(parse_schedule(
                command_type,
                data,
            )?)),
            "set_discharge_schedule" => Ok(CommandKind::SetDischargeSchedule(parse_schedule(
                command_type,
                data,
            )?)),
            other => Err(CommandError::UnknownCommand(other.to_string())),
        }
    }
}

fn parse_schedule(command_type: &str, data: &Value) -> Result<Schedule, CommandError> {
    let bad = |argument| CommandError::BadArgument {
        command: command_type.to_string(),
        argument,
    };

    let start = u16_arg(data, "start_time").ok_or_else(|| bad("start_time"))?;
    let end = u16_arg(data, "end_time").ok_or_else(|| bad("end_time"))?;
    let slot = match data.get("slot") {
        None => 1,
        Some(v) => match v.as_u64() {
            Some(slot @ (1 | 2)) => slot as u8,
            _ => return Err(bad("slot")),
        },
    };

    Ok(Schedule { start, end, slot })
}

fn str_arg(data: &Value, key: &str) -> Option<String> {
    data.get(key)?.as_str().map(str::to_string)
}

fn f64_arg(data: &Value, key: &str) -> Option<f64> {
    data.get(key)?.as_f64()
}

fn u16_arg(data: &Value, key: &str) -> Option<u16> {
    u16::try_from(data.get(key)?.as_u64()?).ok()
}

fn bool_arg(data: &Value, key: &str) -> Option<bool> {
    data.get(key)?.as_bool()
}

///
/// A validated submission.  `None` fields fall back to queue defaults.
///
#[derive(Clone, Debug)]
pub struct CommandSpec {
    pub id: Option<String>,
    pub kind: CommandKind,
    pub priority: Priority,
    pub timeout: Option<Duration>,
    pub max_attempts: Option<u32>,
    pub response_topic: Option<String>,
}

impl CommandSpec {
    pub fn new(kind: CommandKind) -> Self {
        Self {
            id: None,
            kind,
            priority: Priority::Normal,
            timeout: None,
            max_attempts: None,
            response_topic: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    /// Parses an inbound command payload:
    ///
    /// ```json
    /// { "command_id": "...", "command_type": "...", "data": {},
    ///   "priority": "low|normal|high|critical", "timeout": 30,
    ///   "response_topic": "..." }
    /// ```
    ///
    /// A supplied `command_id` is echoed back in responses; an unknown
    /// priority string degrades to `normal`.
    pub fn from_payload(payload: &Value) -> Result<Self, CommandError> {
        let command_type = payload
            .get("command_type")
            .and_then(Value::as_str)
            .ok_or_else(|| CommandError::UnknownCommand("(missing)".to_string()))?;

        let empty = Value::Object(serde_json::Map::new());
        let data = payload.get("data").unwrap_or(&empty);
        let kind = CommandKind::parse(command_type, data)?;

        let priority = payload
            .get("priority")
            .and_then(Value::as_str)
            .and_then(Priority::parse)
            .unwrap_or(Priority::Normal);

        Ok(Self {
            id: payload
                .get("command_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            kind,
            priority,
            timeout: payload
                .get("timeout")
                .and_then(Value::as_u64)
                .map(Duration::from_secs),
            max_attempts: None,
            response_topic: payload
                .get("response_topic")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }
}

/// Pulls the caller-supplied id out of a payload, for error responses to
/// commands that failed to parse.
pub fn payload_command_id(payload: &Value) -> Option<String> {
    payload
        .get("command_id")
        .and_then(Value::as_str)
        .map(str::to_string)
}

///
/// One tracked command.  Owned by the queue's history; everything else
/// sees clones or [`CommandSnapshot`]s.
///
#[derive(Clone, Debug)]
pub struct Command {
    pub id: String,
    pub kind: CommandKind,
    pub priority: Priority,
    pub timeout: Duration,
    pub max_attempts: u32,
    pub attempts: u32,
    pub status: CommandStatus,
    pub created_at: DateTime<Utc>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub response_topic: Option<String>,
}

/// Externally-visible view of a command, for status queries.
#[derive(Clone, Debug, Serialize)]
pub struct CommandSnapshot {
    pub command_id: String,
    pub command_type: &'static str,
    pub status: CommandStatus,
    pub priority: Priority,
    pub created_at: String,
    pub attempts: u32,
    pub last_attempt: Option<String>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl From<&Command> for CommandSnapshot {
    fn from(cmd: &Command) -> Self {
        let stamp =
            |t: &DateTime<Utc>| t.to_rfc3339_opts(SecondsFormat::Millis, true);
        Self {
            command_id: cmd.id.clone(),
            command_type: cmd.kind.name(),
            status: cmd.status,
            priority: cmd.priority,
            created_at: stamp(&cmd.created_at),
            attempts: cmd.attempts,
            last_attempt: cmd.last_attempt.as_ref().map(stamp),
            result: cmd.result.clone(),
            error: cmd.error.clone(),
        }
    }
}

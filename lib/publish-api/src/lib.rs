// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Publish-side contract between the bridge and the message fabric
//!
//! Tasks publish through the [`PublishSink`] trait and never see the broker
//! client itself; the binary injects a concrete sink at construction time.
//! This crate also pins down the topic scheme and the payload shapes, which
//! are a wire contract with the back-end services:
//!
//! ```text
//! <prefix>/<device_id>/data               enriched samples
//! <prefix>/<device_id>/status             online/offline, retained
//! <prefix>/<device_id>/alerts             supervisor alerts
//! <prefix>/<device_id>/commands/response  command outcomes
//! <prefix>/<device_id>/commands           inbound commands (subscribed)
//! <prefix>/broadcast/commands             inbound commands, fleet-wide
//! ```
//!
//! Every outbound payload carries `device_id`, `device_type` and an
//! ISO-8601 UTC timestamp.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

#[cfg(feature = "mock")]
pub mod mock;

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PublishError {
    #[error("publish sink is not connected")]
    NotConnected,
    #[error("publish failed: {0}")]
    Failed(String),
}

/// Where outbound messages go.  `retain` marks messages the broker should
/// hand to late subscribers (the status channel uses it).
#[async_trait]
pub trait PublishSink: Send + Sync {
    async fn publish(&self, topic: &str, payload: Value, retain: bool)
        -> Result<(), PublishError>;

    fn is_connected(&self) -> bool;
}

/// The identity stamped into every outbound payload.
#[derive(Clone, Debug)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub device_type: String,
}

/// Topic builder for one device under one prefix.
#[derive(Clone, Debug)]
pub struct TopicScheme {
    prefix: String,
    device_id: String,
}

impl TopicScheme {
    pub fn new(prefix: &str, device_id: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            device_id: device_id.to_string(),
        }
    }

    fn channel(&self, channel: &str) -> String {
        format!("{}/{}/{}", self.prefix, self.device_id, channel)
    }

    pub fn data(&self) -> String {
        self.channel("data")
    }

    pub fn status(&self) -> String {
        self.channel("status")
    }

    pub fn alerts(&self) -> String {
        self.channel("alerts")
    }

    pub fn command_response(&self) -> String {
        self.channel("commands/response")
    }

    pub fn commands(&self) -> String {
        self.channel("commands")
    }

    pub fn broadcast_commands(&self) -> String {
        format!("{}/broadcast/commands", self.prefix)
    }
}

/// Current wall-clock time in the wire format.
pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Clone, Debug, Serialize)]
pub struct DataEnvelope {
    pub device_id: String,
    pub device_type: String,
    pub timestamp: String,
    pub data: Value,
}

impl DataEnvelope {
    pub fn new(identity: &DeviceIdentity, data: Value) -> Self {
        Self {
            device_id: identity.device_id.clone(),
            device_type: identity.device_type.clone(),
            timestamp: timestamp(),
            data,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct StatusPayload {
    pub device_id: String,
    pub device_type: String,
    pub timestamp: String,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

impl StatusPayload {
    pub fn online(identity: &DeviceIdentity) -> Self {
        Self::new(identity, "online", None)
    }

    /// Published on orderly shutdown.
    pub fn offline(identity: &DeviceIdentity) -> Self {
        Self::new(identity, "offline", Some("graceful_shutdown"))
    }

    /// Registered with the broker as the last will, delivered if the
    /// session dies without saying goodbye.
    pub fn last_will(identity: &DeviceIdentity) -> Self {
        Self::new(identity, "offline", Some("unexpected_disconnect"))
    }

    fn new(identity: &DeviceIdentity, status: &'static str, reason: Option<&'static str>) -> Self {
        Self {
            device_id: identity.device_id.clone(),
            device_type: identity.device_type.clone(),
            timestamp: timestamp(),
            status,
            reason,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct AlertPayload {
    pub device_id: String,
    pub device_type: String,
    pub timestamp: String,
    pub alert_type: String,
    pub message: String,
    pub severity: Severity,
}

impl AlertPayload {
    pub fn new(
        identity: &DeviceIdentity,
        alert_type: &str,
        message: &str,
        severity: Severity,
    ) -> Self {
        Self {
            device_id: identity.device_id.clone(),
            device_type: identity.device_type.clone(),
            timestamp: timestamp(),
            alert_type: alert_type.to_string(),
            message: message.to_string(),
            severity,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct CommandResponse {
    pub device_id: String,
    pub command_id: String,
    pub timestamp: String,
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl CommandResponse {
    pub fn new(
        identity: &DeviceIdentity,
        command_id: &str,
        result: Result<Value, String>,
    ) -> Self {
        let (success, result, error) = match result {
            Ok(value) => (true, Some(value), None),
            Err(message) => (false, None, Some(message)),
        };
        Self {
            device_id: identity.device_id.clone(),
            command_id: command_id.to_string(),
            timestamp: timestamp(),
            success,
            result,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn identity() -> DeviceIdentity {
        DeviceIdentity {
            device_id: "inverter-001".to_string(),
            device_type: "inverter".to_string(),
        }
    }

    #[test]
    fn topics_follow_the_scheme() {
        let topics = TopicScheme::new("edge", "inverter-001");
        assert_eq!(topics.data(), "edge/inverter-001/data");
        assert_eq!(topics.status(), "edge/inverter-001/status");
        assert_eq!(topics.alerts(), "edge/inverter-001/alerts");
        assert_eq!(
            topics.command_response(),
            "edge/inverter-001/commands/response"
        );
        assert_eq!(topics.commands(), "edge/inverter-001/commands");
        assert_eq!(topics.broadcast_commands(), "edge/broadcast/commands");
    }

    #[test]
    fn status_payloads_carry_reasons() {
        let online = serde_json::to_value(StatusPayload::online(&identity())).unwrap();
        assert_eq!(online["status"], "online");
        assert_eq!(online.get("reason"), None);
        assert_eq!(online["device_id"], "inverter-001");
        assert!(online["timestamp"].as_str().unwrap().ends_with('Z'));

        let will = serde_json::to_value(StatusPayload::last_will(&identity())).unwrap();
        assert_eq!(will["status"], "offline");
        assert_eq!(will["reason"], "unexpected_disconnect");

        let offline = serde_json::to_value(StatusPayload::offline(&identity())).unwrap();
        assert_eq!(offline["reason"], "graceful_shutdown");
    }

    #[test]
    fn command_responses_split_result_and_error() {
        let ok = CommandResponse::new(&identity(), "cmd-1", Ok(json!(76)));
        let ok = serde_json::to_value(ok).unwrap();
        assert_eq!(ok["success"], true);
        assert_eq!(ok["result"], 76);
        assert_eq!(ok["error"], Value::Null);

        let err = CommandResponse::new(&identity(), "cmd-2", Err("boom".to_string()));
        let err = serde_json::to_value(err).unwrap();
        assert_eq!(err["success"], false);
        assert_eq!(err["result"], Value::Null);
        assert_eq!(err["error"], "boom");
    }

    #[test]
    fn alert_severity_serializes_lowercase() {
        let alert = AlertPayload::new(&identity(), "system_health", "bad", Severity::Critical);
        let alert = serde_json::to_value(alert).unwrap();
        assert_eq!(alert["severity"], "critical");
        assert_eq!(alert["alert_type"], "system_health");
    }
}

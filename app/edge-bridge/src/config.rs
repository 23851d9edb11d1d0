// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bridge configuration
//!
//! One flat TOML file; every key is optional and falls back to the
//! defaults below.  The accessors at the bottom cut the flat file into the
//! narrow per-component configs the library crates take.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use drv_modbus_api::BusConfig;
use publish_api::{DeviceIdentity, TopicScheme};
use task_dispatch::QueueConfig;
use task_health::HealthConfig;
use task_sampler::SamplerConfig;

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    pub modbus_port: String,
    pub modbus_baudrate: u32,
    pub modbus_slave_id: u8,
    pub modbus_timeout_s: u64,
    pub modbus_retry_count: u32,
    pub modbus_retry_delay_s: f64,

    pub data_collection_interval_s: u64,
    pub health_check_interval_s: u64,
    pub max_consecutive_failures: u32,

    pub max_queue_size: usize,
    pub command_timeout_s: u64,

    pub device_id: String,
    pub device_type: String,

    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_client_id: String,
    pub mqtt_keepalive_s: u64,
    pub mqtt_qos: u8,
    pub topic_prefix: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            modbus_port: "/dev/ttyUSB0".to_string(),
            modbus_baudrate: 9600,
            modbus_slave_id: 1,
            modbus_timeout_s: 3,
            modbus_retry_count: 3,
            modbus_retry_delay_s: 1.0,

            data_collection_interval_s: 5,
            health_check_interval_s: 30,
            max_consecutive_failures: 5,

            max_queue_size: 100,
            command_timeout_s: 30,

            device_id: "inverter-001".to_string(),
            device_type: "inverter".to_string(),

            mqtt_host: "localhost".to_string(),
            mqtt_port: 1883,
            mqtt_username: None,
            mqtt_password: None,
            mqtt_client_id: "edge-bridge".to_string(),
            mqtt_keepalive_s: 60,
            mqtt_qos: 1,
            topic_prefix: "edge".to_string(),
        }
    }
}

impl BridgeConfig {
    /// Loads configuration; no file means all defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            None => Ok(Self::default()),
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("parsing {}", path.display()))
            }
        }
    }

    pub fn bus(&self) -> BusConfig {
        BusConfig {
            retry_count: self.modbus_retry_count,
            retry_delay: Duration::from_secs_f64(self.modbus_retry_delay_s),
            max_consecutive_failures: self.max_consecutive_failures,
        }
    }

    pub fn queue(&self) -> QueueConfig {
        QueueConfig {
            max_queue_size: self.max_queue_size,
            default_timeout: Duration::from_secs(self.command_timeout_s),
            ..QueueConfig::default()
        }
    }

    pub fn sampler(&self) -> SamplerConfig {
        SamplerConfig {
            interval: Duration::from_secs(self.data_collection_interval_s),
        }
    }

    pub fn health(&self) -> HealthConfig {
        HealthConfig {
            interval: Duration::from_secs(self.health_check_interval_s),
            max_consecutive_failures: self.max_consecutive_failures,
            ..HealthConfig::default()
        }
    }

    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            device_id: self.device_id.clone(),
            device_type: self.device_type.clone(),
        }
    }

    pub fn topics(&self) -> TopicScheme {
        TopicScheme::new(&self.topic_prefix, &self.device_id)
    }
}

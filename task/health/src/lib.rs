// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Health supervision
//!
//! Periodically probes the three things that can quietly die underneath
//! the bridge -- the Modbus bus, the publish connection, and the host
//! itself -- and aggregates them into an overall verdict.  A ring of
//! recent snapshots is kept for introspection.
//!
//! Alerts are edge-triggered: a condition raises its alert once when it
//! begins, and clearing re-arms it.  A flapping link therefore produces
//! one alert per flap, not one per check.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use drv_inverter_devices::Spf5000Es;
use drv_modbus_api::ModbusBus;
use publish_api::{
    timestamp, AlertPayload, DeviceIdentity, PublishSink, Severity, TopicScheme,
};

pub mod host;

pub use host::{HostStats, ProcHostStats};

/// Snapshots retained for inspection.
const HISTORY_LIMIT: usize = 100;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Unhealthy,
    Critical,
    /// A probe failed outright (as opposed to reporting a bad reading).
    Error,
    Unknown,
}

impl HealthState {
    /// Ordering for worst-of aggregation; `Unknown` and `Error` do not
    /// outrank a healthy reading when combining sub-checks.
    fn rank(self) -> u8 {
        match self {
            HealthState::Critical => 2,
            HealthState::Unhealthy => 1,
            _ => 0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct HealthConfig {
    pub interval: Duration,
    /// Bus failure streak at which the transport is declared critical.
    pub max_consecutive_failures: u32,
    /// Probe latency above which the transport is merely unhealthy.
    pub slow_response: Duration,
    /// Overall-unhealthy streak at which the performance alert raises.
    pub failure_alert_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            max_consecutive_failures: 5,
            slow_response: Duration::from_secs(5),
            failure_alert_threshold: 3,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ModbusHealth {
    pub status: HealthState,
    pub connected: bool,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue: Option<&'static str>,
}

#[derive(Clone, Debug, Serialize)]
pub struct MqttHealth {
    pub status: HealthState,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue: Option<&'static str>,
}

#[derive(Clone, Debug, Serialize)]
pub struct SystemHealth {
    pub status: HealthState,
    pub memory_percent: Option<f64>,
    pub disk_percent: Option<f64>,
    pub uptime_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue: Option<&'static str>,
}

#[derive(Clone, Debug, Serialize)]
pub struct HealthSnapshot {
    pub timestamp: String,
    pub overall: HealthState,
    pub modbus: ModbusHealth,
    pub mqtt: MqttHealth,
    pub system: SystemHealth,
}

#[derive(Clone, Debug, Serialize)]
pub struct HealthStatistics {
    pub uptime_secs: u64,
    pub total_checks: u64,
    pub failed_checks: u64,
    pub success_rate: f64,
    pub consecutive_failures: u32,
    pub active_alerts: usize,
    pub last_check: Option<String>,
}

pub struct HealthMonitor {
    device: Arc<Spf5000Es>,
    bus: Arc<ModbusBus>,
    sink: Arc<dyn PublishSink>,
    identity: DeviceIdentity,
    topics: TopicScheme,
    host: Arc<dyn HostStats>,
    config: HealthConfig,
    consecutive_failures: u32,
    history: VecDeque<HealthSnapshot>,
    active_alerts: HashSet<&'static str>,
    total_checks: u64,
    failed_checks: u64,
}

impl HealthMonitor {
    pub fn new(
        device: Arc<Spf5000Es>,
        bus: Arc<ModbusBus>,
        sink: Arc<dyn PublishSink>,
        identity: DeviceIdentity,
        topics: TopicScheme,
        host: Arc<dyn HostStats>,
        config: HealthConfig,
    ) -> Self {
        Self {
            device,
            bus,
            sink,
            identity,
            topics,
            host,
            config,
            consecutive_failures: 0,
            history: VecDeque::new(),
            active_alerts: HashSet::new(),
            total_checks: 0,
            failed_checks: 0,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.config.interval, "health monitor running");

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.perform_check().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("health monitor stopped");
    }

    /// One full check: probe, aggregate, alert, record.
    pub async fn perform_check(&mut self) -> HealthSnapshot {
        self.total_checks += 1;

        let modbus = self.check_modbus().await;
        let mqtt = self.check_mqtt();
        let system = self.check_system();

        let worst = modbus
            .status
            .rank()
            .max(mqtt.status.rank())
            .max(system.status.rank());
        let overall = match worst {
            2 => HealthState::Critical,
            1 => HealthState::Unhealthy,
            _ => HealthState::Healthy,
        };

        if overall == HealthState::Healthy {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
            warn!(
                ?overall,
                streak = self.consecutive_failures,
                "health check not healthy"
            );
        }

        let snapshot = HealthSnapshot {
            timestamp: timestamp(),
            overall,
            modbus,
            mqtt,
            system,
        };

        if self.process_alerts(&snapshot).await {
            self.failed_checks += 1;
        }

        self.history.push_back(snapshot.clone());
        if self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
        }

        snapshot
    }

    async fn check_modbus(&self) -> ModbusHealth {
        if !self.bus.is_connected() {
            return ModbusHealth {
                status: HealthState::Critical,
                connected: false,
                consecutive_failures: self.bus.consecutive_failures(),
                response_time: None,
                issue: Some("disconnected"),
            };
        }

        // A timed probe of a register every device revision has.
        let started = tokio::time::Instant::now();
        let probe = self.device.read_register("battery_voltage").await;
        let elapsed = started.elapsed();

        let (mut status, mut issue) = match probe {
            Ok(_) if elapsed > self.config.slow_response => {
                (HealthState::Unhealthy, Some("slow_response"))
            }
            Ok(_) => (HealthState::Healthy, None),
            Err(_) => (HealthState::Unhealthy, Some("read_failed")),
        };

        let consecutive_failures = self.bus.consecutive_failures();
        if consecutive_failures >= self.config.max_consecutive_failures {
            status = HealthState::Critical;
            issue = Some("too_many_failures");
        }

        ModbusHealth {
            status,
            connected: true,
            consecutive_failures,
            response_time: Some(elapsed.as_secs_f64()),
            issue,
        }
    }

    fn check_mqtt(&self) -> MqttHealth {
        let connected = self.sink.is_connected();
        MqttHealth {
            status: if connected {
                HealthState::Healthy
            } else {
                HealthState::Critical
            },
            connected,
            issue: (!connected).then_some("disconnected"),
        }
    }

    fn check_system(&self) -> SystemHealth {
        let memory_percent = self.host.memory_percent();
        let disk_percent = self.host.disk_percent();
        let uptime_secs = self.host.uptime().as_secs();

        if memory_percent.is_none() && disk_percent.is_none() {
            return SystemHealth {
                status: HealthState::Unknown,
                memory_percent,
                disk_percent,
                uptime_secs,
                issue: Some("monitoring_unavailable"),
            };
        }

        let (mut status, mut issue) = match memory_percent {
            Some(memory) if memory > 90.0 => (HealthState::Critical, Some("high_memory_usage")),
            Some(memory) if memory > 80.0 => {
                (HealthState::Unhealthy, Some("elevated_memory_usage"))
            }
            _ => (HealthState::Healthy, None),
        };

        let disk = match disk_percent {
            Some(disk) if disk > 95.0 => Some((HealthState::Critical, "disk_full")),
            Some(disk) if disk > 85.0 => Some((HealthState::Unhealthy, "disk_space_low")),
            _ => None,
        };
        if let Some((disk_status, disk_issue)) = disk {
            if disk_status.rank() >= status.rank() {
                status = disk_status;
                issue = Some(disk_issue);
            }
        }

        SystemHealth {
            status,
            memory_percent,
            disk_percent,
            uptime_secs,
            issue,
        }
    }

    /// Runs the four alert rules.  Returns true if any raised alert could
    /// not be delivered.
    async fn process_alerts(&mut self, snapshot: &HealthSnapshot) -> bool {
        let mut lost = false;

        lost |= self
            .edge(
                "system_critical",
                snapshot.overall == HealthState::Critical,
                "system_health",
                "System health is critical - immediate attention required".to_string(),
                Severity::Critical,
            )
            .await;

        lost |= self
            .edge(
                "modbus_disconnected",
                !snapshot.modbus.connected,
                "modbus_connection",
                "Modbus connection lost - hardware communication unavailable".to_string(),
                Severity::Critical,
            )
            .await;

        lost |= self
            .edge(
                "mqtt_disconnected",
                !snapshot.mqtt.connected,
                "mqtt_connection",
                "MQTT connection lost - communication with services unavailable".to_string(),
                Severity::Critical,
            )
            .await;

        lost |= self
            .edge(
                "consecutive_failures",
                self.consecutive_failures >= self.config.failure_alert_threshold,
                "performance",
                format!(
                    "Multiple consecutive health check failures ({})",
                    self.consecutive_failures
                ),
                Severity::Warning,
            )
            .await;

        lost
    }

    /// Raises an alert on the condition's rising edge, re-arms on its
    /// falling edge.  Returns true if a raised alert was lost.
    async fn edge(
        &mut self,
        key: &'static str,
        raised: bool,
        alert_type: &str,
        message: String,
        severity: Severity,
    ) -> bool {
        if raised {
            if self.active_alerts.insert(key) {
                warn!(alert = key, %message, "health alert raised");
                let payload = AlertPayload::new(&self.identity, alert_type, &message, severity);
                match serde_json::to_value(&payload) {
                    Ok(payload) => {
                        if let Err(err) =
                            self.sink.publish(&self.topics.alerts(), payload, false).await
                        {
                            error!(alert = key, %err, "failed to publish alert");
                            return true;
                        }
                    }
                    Err(err) => {
                        error!(alert = key, %err, "unserializable alert");
                        return true;
                    }
                }
            }
        } else if self.active_alerts.remove(key) {
            info!(alert = key, "health alert cleared");
        }
        false
    }

    pub fn latest(&self) -> Option<&HealthSnapshot> {
        self.history.back()
    }

    pub fn history(&self) -> impl Iterator<Item = &HealthSnapshot> {
        self.history.iter()
    }

    pub fn statistics(&self) -> HealthStatistics {
        let success = self.total_checks - self.failed_checks;
        let success_rate = if self.total_checks > 0 {
            let rate = success as f64 / self.total_checks as f64 * 100.0;
            (rate * 100.0).round() / 100.0
        } else {
            0.0
        };

        HealthStatistics {
            uptime_secs: self.host.uptime().as_secs(),
            total_checks: self.total_checks,
            failed_checks: self.failed_checks,
            success_rate,
            consecutive_failures: self.consecutive_failures,
            active_alerts: self.active_alerts.len(),
            last_check: self.history.back().map(|s| s.timestamp.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drv_modbus_api::mock::{MockLink, MockState};
    use drv_modbus_api::{BusConfig, SlaveId};
    use publish_api::mock::RecordingSink;
    use serde_json::json;
    use std::sync::Mutex;

    struct FakeHost {
        memory: Mutex<Option<f64>>,
        disk: Mutex<Option<f64>>,
    }

    impl FakeHost {
        fn new(memory: Option<f64>, disk: Option<f64>) -> Arc<Self> {
            Arc::new(Self {
                memory: Mutex::new(memory),
                disk: Mutex::new(disk),
            })
        }

        fn set_memory(&self, value: Option<f64>) {
            *self.memory.lock().unwrap() = value;
        }
    }

    impl HostStats for FakeHost {
        fn memory_percent(&self) -> Option<f64> {
            *self.memory.lock().unwrap()
        }

        fn disk_percent(&self) -> Option<f64> {
            *self.disk.lock().unwrap()
        }

        fn uptime(&self) -> Duration {
            Duration::from_secs(60)
        }
    }

    struct Rig {
        monitor: HealthMonitor,
        sink: Arc<RecordingSink>,
        state: Arc<Mutex<MockState>>,
        bus: Arc<ModbusBus>,
        host: Arc<FakeHost>,
    }

    const ALERTS: &str = "edge/inverter-001/alerts";

    async fn rig_with(config: HealthConfig, host: Arc<FakeHost>) -> Rig {
        let bus = Arc::new(ModbusBus::new(BusConfig::default()));
        let (link, state) = MockLink::new();
        bus.attach(Box::new(link)).await;
        // A live battery_voltage register so the probe succeeds.
        state.lock().unwrap().holding.insert(3027, 485);

        let device = Arc::new(Spf5000Es::new(Arc::clone(&bus), SlaveId(1)));
        let sink = Arc::new(RecordingSink::new());

        let monitor = HealthMonitor::new(
            device,
            Arc::clone(&bus),
            sink.clone(),
            DeviceIdentity {
                device_id: "inverter-001".to_string(),
                device_type: "inverter".to_string(),
            },
            TopicScheme::new("edge", "inverter-001"),
            host.clone(),
            config,
        );

        Rig {
            monitor,
            sink,
            state,
            bus,
            host,
        }
    }

    async fn rig() -> Rig {
        rig_with(HealthConfig::default(), FakeHost::new(Some(50.0), Some(50.0))).await
    }

    fn alert_types(sink: &RecordingSink) -> Vec<String> {
        sink.on_topic(ALERTS)
            .into_iter()
            .map(|a| a["alert_type"].as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn all_green_is_healthy() {
        let mut rig = rig().await;
        let snapshot = rig.monitor.perform_check().await;

        assert_eq!(snapshot.overall, HealthState::Healthy);
        assert_eq!(snapshot.modbus.status, HealthState::Healthy);
        assert!(snapshot.modbus.response_time.is_some());
        assert_eq!(snapshot.mqtt.status, HealthState::Healthy);
        assert_eq!(snapshot.system.status, HealthState::Healthy);
        assert!(rig.sink.on_topic(ALERTS).is_empty());

        let stats = rig.monitor.statistics();
        assert_eq!(stats.total_checks, 1);
        assert_eq!(stats.consecutive_failures, 0);
        assert_eq!(stats.active_alerts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnected_bus_alerts_once_per_edge() {
        let mut rig = rig().await;
        rig.bus.detach().await;

        let snapshot = rig.monitor.perform_check().await;
        assert_eq!(snapshot.overall, HealthState::Critical);
        assert_eq!(snapshot.modbus.issue, Some("disconnected"));
        assert_eq!(
            alert_types(&rig.sink),
            vec!["system_health", "modbus_connection"]
        );

        // Still down: no new alerts.
        rig.monitor.perform_check().await;
        rig.monitor.perform_check().await;
        assert_eq!(rig.sink.on_topic(ALERTS).len(), 2);

        // Recovery clears the edges...
        let (link, state) = MockLink::new();
        state.lock().unwrap().holding.insert(3027, 485);
        rig.bus.attach(Box::new(link)).await;
        let snapshot = rig.monitor.perform_check().await;
        assert_eq!(snapshot.overall, HealthState::Healthy);
        assert_eq!(rig.sink.on_topic(ALERTS).len(), 2);

        // ...so the next outage alerts again.
        rig.bus.detach().await;
        rig.monitor.perform_check().await;
        assert_eq!(rig.sink.on_topic(ALERTS).len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_is_unhealthy() {
        let mut rig = rig().await;
        rig.state.lock().unwrap().holding.remove(&3027);

        let snapshot = rig.monitor.perform_check().await;
        assert_eq!(snapshot.overall, HealthState::Unhealthy);
        assert_eq!(snapshot.modbus.status, HealthState::Unhealthy);
        assert_eq!(snapshot.modbus.issue, Some("read_failed"));
        assert!(snapshot.modbus.connected);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_probe_is_unhealthy() {
        let mut rig = rig().await;
        rig.state.lock().unwrap().delay = Duration::from_secs(6);

        let snapshot = rig.monitor.perform_check().await;
        assert_eq!(snapshot.modbus.status, HealthState::Unhealthy);
        assert_eq!(snapshot.modbus.issue, Some("slow_response"));
        assert!(snapshot.modbus.response_time.unwrap() > 5.0);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_streak_is_critical() {
        let config = HealthConfig {
            max_consecutive_failures: 1,
            ..HealthConfig::default()
        };
        let mut rig = rig_with(config, FakeHost::new(Some(50.0), Some(50.0))).await;
        rig.state.lock().unwrap().holding.remove(&3027);

        let snapshot = rig.monitor.perform_check().await;
        assert_eq!(snapshot.modbus.status, HealthState::Critical);
        assert_eq!(snapshot.modbus.issue, Some("too_many_failures"));
    }

    #[tokio::test(start_paused = true)]
    async fn dead_sink_is_critical_and_alert_is_counted_as_lost() {
        let mut rig = rig().await;
        rig.sink.set_connected(false);

        let snapshot = rig.monitor.perform_check().await;
        assert_eq!(snapshot.mqtt.status, HealthState::Critical);
        assert_eq!(snapshot.mqtt.issue, Some("disconnected"));

        // The alerts could not be delivered anywhere.
        assert!(rig.sink.on_topic(ALERTS).is_empty());
        assert_eq!(rig.monitor.statistics().failed_checks, 1);

        // Recovery clears the edge and re-arms it.
        rig.sink.set_connected(true);
        let snapshot = rig.monitor.perform_check().await;
        assert_eq!(snapshot.overall, HealthState::Healthy);
        assert_eq!(rig.monitor.statistics().active_alerts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn three_bad_checks_raise_the_performance_alert_once() {
        let mut rig = rig().await;
        rig.host.set_memory(Some(85.0));

        rig.monitor.perform_check().await;
        rig.monitor.perform_check().await;
        assert!(!alert_types(&rig.sink).contains(&"performance".to_string()));

        rig.monitor.perform_check().await;
        assert_eq!(alert_types(&rig.sink), vec!["performance"]);
        let alert = &rig.sink.on_topic(ALERTS)[0];
        assert_eq!(alert["severity"], json!("warning"));
        assert_eq!(
            alert["message"],
            json!("Multiple consecutive health check failures (3)")
        );

        // Holding at 4, 5, ... does not repeat the alert.
        rig.monitor.perform_check().await;
        assert_eq!(rig.sink.on_topic(ALERTS).len(), 1);

        // A healthy check resets the streak and clears the alert.
        rig.host.set_memory(Some(50.0));
        rig.monitor.perform_check().await;
        assert_eq!(rig.monitor.statistics().consecutive_failures, 0);
        assert_eq!(rig.monitor.statistics().active_alerts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_probes_read_as_unknown_not_unhealthy() {
        let mut rig = rig_with(HealthConfig::default(), FakeHost::new(None, None)).await;

        let snapshot = rig.monitor.perform_check().await;
        assert_eq!(snapshot.system.status, HealthState::Unknown);
        assert_eq!(snapshot.system.issue, Some("monitoring_unavailable"));
        // Unknown never drags the overall verdict down.
        assert_eq!(snapshot.overall, HealthState::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn disk_cannot_downgrade_a_memory_critical() {
        let mut rig = rig_with(
            HealthConfig::default(),
            FakeHost::new(Some(92.0), Some(86.0)),
        )
        .await;

        let snapshot = rig.monitor.perform_check().await;
        assert_eq!(snapshot.system.status, HealthState::Critical);
        assert_eq!(snapshot.system.issue, Some("high_memory_usage"));

        let mut rig = rig_with(
            HealthConfig::default(),
            FakeHost::new(Some(82.0), Some(96.0)),
        )
        .await;
        let snapshot = rig.monitor.perform_check().await;
        assert_eq!(snapshot.system.status, HealthState::Critical);
        assert_eq!(snapshot.system.issue, Some("disk_full"));
    }

    #[tokio::test(start_paused = true)]
    async fn history_is_bounded() {
        let mut rig = rig().await;
        for _ in 0..105 {
            rig.monitor.perform_check().await;
        }
        assert_eq!(rig.monitor.history().count(), 100);
        assert!(rig.monitor.latest().is_some());
        assert_eq!(rig.monitor.statistics().total_checks, 105);
    }
}

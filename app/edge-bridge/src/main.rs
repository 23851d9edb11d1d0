// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Edge bridge between a Modbus RTU battery inverter and an MQTT fabric
//!
//! The process owns every component and wires them together here, in
//! dependency order: bus, device, queue, publish sink, then the three
//! long-running tasks (dispatcher, sampler, health monitor).  Shutdown
//! runs the same order backwards: stop taking work, let the in-flight
//! command finish, say goodbye on the status topic, and close the serial
//! link last.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use drv_inverter_devices::Spf5000Es;
use drv_modbus_api::{rtu::RtuLink, ModbusBus, SlaveId};
use publish_api::{PublishSink, StatusPayload};
use task_dispatch::{CommandQueue, Dispatcher};
use task_health::{HealthMonitor, ProcHostStats};
use task_sampler::Sampler;

mod config;
mod mqtt;

use config::BridgeConfig;

#[derive(Parser)]
#[command(name = "edge-bridge", about = "Modbus RTU inverter to MQTT bridge")]
struct Args {
    /// TOML configuration file; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = BridgeConfig::load(args.config.as_deref())?;
    let identity = config.identity();
    let topics = config.topics();
    let slave = SlaveId(config.modbus_slave_id);

    info!(device = %identity.device_id, "starting edge bridge");

    // The bus comes up first; a missing serial device is not fatal, the
    // health monitor will shout about it until someone plugs it in.
    let bus = Arc::new(ModbusBus::new(config.bus()));
    match RtuLink::open(
        &config.modbus_port,
        config.modbus_baudrate,
        Duration::from_secs(config.modbus_timeout_s),
        slave,
    ) {
        Ok(link) => {
            bus.attach(Box::new(link)).await;
            info!(port = %config.modbus_port, "modbus link up");
        }
        Err(err) => warn!(%err, "modbus link unavailable at startup"),
    }

    let device = Arc::new(Spf5000Es::new(Arc::clone(&bus), slave));
    let queue = Arc::new(CommandQueue::new(config.queue()));

    let (sink, mqtt_worker) = mqtt::connect(&config, &identity, &topics, Arc::clone(&queue))?;
    let publish: Arc<dyn PublishSink> = sink.clone();

    let dispatcher = Dispatcher::new(
        Arc::clone(&queue),
        Arc::clone(&device),
        Arc::clone(&publish),
        identity.clone(),
        topics.clone(),
    );
    let sampler = Arc::new(Sampler::new(
        Arc::clone(&device),
        Arc::clone(&publish),
        identity.clone(),
        topics.clone(),
        config.sampler(),
    ));
    let monitor = HealthMonitor::new(
        Arc::clone(&device),
        Arc::clone(&bus),
        Arc::clone(&publish),
        identity.clone(),
        topics.clone(),
        Arc::new(ProcHostStats::new()),
        config.health(),
    );

    let (tasks_tx, tasks_rx) = watch::channel(false);
    let (mqtt_tx, mqtt_rx) = watch::channel(false);

    let mqtt_handle = tokio::spawn(mqtt_worker.run(mqtt_rx));
    let dispatcher_handle = tokio::spawn(dispatcher.run(tasks_rx.clone()));
    let sampler_handle = tokio::spawn(Arc::clone(&sampler).run(tasks_rx.clone()));
    let monitor_handle = tokio::spawn(monitor.run(tasks_rx.clone()));

    info!("edge bridge up");
    wait_for_signal().await?;
    info!("shutting down");

    // Stop the workers; the dispatcher finishes its in-flight command.
    tasks_tx.send(true).ok();
    dispatcher_handle.await.context("dispatcher task")?;
    sampler_handle.await.context("sampler task")?;
    monitor_handle.await.context("health monitor task")?;

    // Say goodbye while the session is still being polled.
    let offline = StatusPayload::offline(&identity);
    match serde_json::to_value(&offline) {
        Ok(payload) => {
            if let Err(err) = publish.publish(&topics.status(), payload, true).await {
                warn!(%err, "failed to publish offline status");
            }
        }
        Err(err) => warn!(%err, "unserializable offline status"),
    }
    sink.disconnect().await;
    mqtt_tx.send(true).ok();
    mqtt_handle.await.context("mqtt worker task")?;

    // The serial link goes last, after everything that could touch it.
    bus.detach().await;
    info!("shutdown complete");
    Ok(())
}

async fn wait_for_signal() -> anyhow::Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
    Ok(())
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MQTT wiring
//!
//! Two halves: [`MqttSink`], the [`PublishSink`] implementation handed to
//! the tasks, and [`MqttWorker`], which drives the `rumqttc` event loop,
//! tracks connection state, and feeds inbound command payloads into the
//! queue.  The worker holds the queue it was built with; nothing reaches
//! back into it later.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, Event, EventLoop, Incoming, LastWill, MqttOptions, Outgoing, QoS,
};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use publish_api::{
    CommandResponse, DeviceIdentity, PublishError, PublishSink, StatusPayload, TopicScheme,
};
use task_dispatch::{payload_command_id, CommandQueue, CommandSpec};

use crate::config::BridgeConfig;

pub struct MqttSink {
    client: AsyncClient,
    qos: QoS,
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl PublishSink for MqttSink {
    async fn publish(
        &self,
        topic: &str,
        payload: Value,
        retain: bool,
    ) -> Result<(), PublishError> {
        if !self.is_connected() {
            return Err(PublishError::NotConnected);
        }
        let bytes =
            serde_json::to_vec(&payload).map_err(|e| PublishError::Failed(e.to_string()))?;
        self.client
            .publish(topic, self.qos, retain, bytes)
            .await
            .map_err(|e| PublishError::Failed(e.to_string()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

impl MqttSink {
    pub async fn disconnect(&self) {
        if let Err(err) = self.client.disconnect().await {
            warn!(%err, "mqtt disconnect failed");
        }
    }
}

pub struct MqttWorker {
    eventloop: EventLoop,
    client: AsyncClient,
    qos: QoS,
    connected: Arc<AtomicBool>,
    queue: Arc<CommandQueue>,
    sink: Arc<MqttSink>,
    identity: DeviceIdentity,
    topics: TopicScheme,
}

/// Builds the broker session.  The returned sink is live immediately but
/// reports disconnected until the worker sees the broker's CONNACK.
pub fn connect(
    config: &BridgeConfig,
    identity: &DeviceIdentity,
    topics: &TopicScheme,
    queue: Arc<CommandQueue>,
) -> anyhow::Result<(Arc<MqttSink>, MqttWorker)> {
    let qos = match config.mqtt_qos {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    };

    let mut options = MqttOptions::new(
        config.mqtt_client_id.clone(),
        config.mqtt_host.clone(),
        config.mqtt_port,
    );
    options.set_keep_alive(Duration::from_secs(config.mqtt_keepalive_s));
    if let (Some(username), Some(password)) = (&config.mqtt_username, &config.mqtt_password) {
        options.set_credentials(username.clone(), password.clone());
    }

    let will = serde_json::to_vec(&StatusPayload::last_will(identity))?;
    options.set_last_will(LastWill::new(topics.status(), will, qos, true));

    let (client, eventloop) = AsyncClient::new(options, 64);
    let connected = Arc::new(AtomicBool::new(false));

    let sink = Arc::new(MqttSink {
        client: client.clone(),
        qos,
        connected: Arc::clone(&connected),
    });

    let worker = MqttWorker {
        eventloop,
        client,
        qos,
        connected,
        queue,
        sink: Arc::clone(&sink),
        identity: identity.clone(),
        topics: topics.clone(),
    };

    Ok((sink, worker))
}

impl MqttWorker {
    /// Drives the session until shutdown, then drains the outgoing queue
    /// so the goodbye actually leaves the machine.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("mqtt worker running");

        loop {
            tokio::select! {
                event = self.eventloop.poll() => self.handle_event(event).await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.drain().await;
        info!("mqtt worker stopped");
    }

    async fn handle_event(&mut self, event: Result<Event, rumqttc::ConnectionError>) {
        match event {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                info!("mqtt session established");
                self.connected.store(true, Ordering::Relaxed);
                Self::on_connected(
                    self.topics.clone(),
                    self.client.clone(),
                    self.qos,
                    Arc::clone(&self.sink),
                    self.identity.clone(),
                )
                .await;
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                Self::handle_command(
                    Arc::clone(&self.queue),
                    Arc::clone(&self.sink),
                    self.identity.clone(),
                    self.topics.clone(),
                    &publish.topic,
                    &publish.payload,
                )
                .await;
            }
            Ok(Event::Incoming(Incoming::Disconnect)) => {
                warn!("broker asked us to disconnect");
                self.connected.store(false, Ordering::Relaxed);
            }
            Ok(_) => {}
            Err(err) => {
                if self.connected.swap(false, Ordering::Relaxed) {
                    warn!(%err, "mqtt connection lost");
                }
                // The event loop reconnects by itself; don't spin while
                // it fails.
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }

    async fn on_connected(
        topics: TopicScheme,
        client: AsyncClient,
        qos: QoS,
        sink: Arc<MqttSink>,
        identity: DeviceIdentity,
    ) {
        for topic in [topics.commands(), topics.broadcast_commands()] {
            if let Err(err) = client.subscribe(topic.clone(), qos).await {
                error!(%topic, %err, "subscribe failed");
            }
        }

        let online = StatusPayload::online(&identity);
        match serde_json::to_value(&online) {
            Ok(payload) => {
                if let Err(err) = sink.publish(&topics.status(), payload, true).await {
                    warn!(%err, "failed to publish online status");
                }
            }
            Err(err) => error!(%err, "unserializable status payload"),
        }
    }

    /// Parses one inbound command payload and queues it.  Whatever goes
    /// wrong, the caller gets a response naming the reason.
    async fn handle_command(
        queue: Arc<CommandQueue>,
        sink: Arc<MqttSink>,
        identity: DeviceIdentity,
        topics: TopicScheme,
        topic: &str,
        payload: &[u8],
    ) {
        debug!(topic, "inbound command payload");

        let payload: Value = match serde_json::from_slice(payload) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(topic, %err, "undecodable command payload");
                return;
            }
        };

        let outcome = CommandSpec::from_payload(&payload).and_then(|spec| queue.submit(spec));
        match outcome {
            Ok(id) => debug!(%id, "command queued from mqtt"),
            Err(err) => {
                warn!(%err, "rejecting inbound command");
                let id = payload_command_id(&payload)
                    .unwrap_or_else(|| Uuid::new_v4().to_string());
                let response = CommandResponse::new(&identity, &id, Err(err.to_string()));
                let topic = payload
                    .get("response_topic")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| topics.command_response());

                match serde_json::to_value(&response) {
                    Ok(body) => {
                        if let Err(err) = sink.publish(&topic, body, false).await {
                            warn!(%err, "failed to publish rejection");
                        }
                    }
                    Err(err) => error!(%err, "unserializable rejection"),
                }
            }
        }
    }

    /// Polls briefly after shutdown so queued publishes (the offline
    /// status, any final responses) reach the broker.
    async fn drain(&mut self) {
        let deadline = Duration::from_secs(2);
        loop {
            match tokio::time::timeout(deadline, self.eventloop.poll()).await {
                Ok(Ok(Event::Outgoing(Outgoing::Disconnect))) => break,
                Ok(Ok(_)) => {}
                Ok(Err(_)) => break,
                Err(_) => break,
            }
        }
        self.connected.store(false, Ordering::Relaxed);
    }
}

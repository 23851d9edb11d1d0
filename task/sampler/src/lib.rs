// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Periodic sampling and publication
//!
//! Every collection interval the sampler walks the device's monitoring
//! register set, enriches the raw readings (see [`enrich`]), and hands the
//! record to the publish sink.  Collection failures are counted and logged
//! but never stop the loop.
//!
//! The sampler reads through the same bus lock as dispatched commands, so
//! its reads interleave with command execution but never overlap it on the
//! wire.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use drv_inverter_devices::Spf5000Es;
use publish_api::{DataEnvelope, DeviceIdentity, PublishSink, TopicScheme};

pub mod enrich;

pub use enrich::{assess_quality, enrich, DataQuality};

#[derive(Clone, Debug)]
pub struct SamplerConfig {
    pub interval: Duration,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SamplerStatistics {
    pub collection_count: u64,
    pub error_count: u64,
    pub success_rate: f64,
    pub last_collection: Option<String>,
    pub last_data_quality: Option<DataQuality>,
}

struct LastCollection {
    time: String,
    quality: DataQuality,
}

pub struct Sampler {
    device: Arc<Spf5000Es>,
    sink: Arc<dyn PublishSink>,
    identity: DeviceIdentity,
    topics: TopicScheme,
    config: SamplerConfig,
    collection_count: AtomicU64,
    error_count: AtomicU64,
    last: Mutex<Option<LastCollection>>,
}

impl Sampler {
    pub fn new(
        device: Arc<Spf5000Es>,
        sink: Arc<dyn PublishSink>,
        identity: DeviceIdentity,
        topics: TopicScheme,
        config: SamplerConfig,
    ) -> Self {
        Self {
            device,
            sink,
            identity,
            topics,
            config,
            collection_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            last: Mutex::new(None),
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.config.interval, "sampler running");

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.collect_and_publish().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("sampler stopped");
    }

    /// One collection pass: read, enrich, publish.
    pub async fn collect_and_publish(&self) {
        if !self.device.is_connected() {
            warn!("bus not connected, skipping collection");
            return;
        }

        let raw: Map<String, Value> = self
            .device
            .read_monitoring()
            .await
            .into_iter()
            .map(|(name, value)| (name.to_string(), value.into()))
            .collect();

        if raw.is_empty() {
            self.error_count.fetch_add(1, Ordering::Relaxed);
            warn!("no data collected");
            return;
        }

        let count = self.collection_count.load(Ordering::Relaxed);
        let quality = assess_quality(&raw);
        let enriched = enrich(&raw, count);

        let envelope = DataEnvelope::new(&self.identity, Value::Object(enriched));
        let time = envelope.timestamp.clone();
        let payload = match serde_json::to_value(&envelope) {
            Ok(payload) => payload,
            Err(err) => {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                error!(%err, "unserializable sample");
                return;
            }
        };

        match self.sink.publish(&self.topics.data(), payload, false).await {
            Ok(()) => {
                self.collection_count.fetch_add(1, Ordering::Relaxed);
                *self.last.lock().unwrap() = Some(LastCollection { time, quality });
                debug!(collection = count + 1, ?quality, "sample published");
            }
            Err(err) => {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                error!(%err, "failed to publish sample");
            }
        }
    }

    pub fn statistics(&self) -> SamplerStatistics {
        let collection_count = self.collection_count.load(Ordering::Relaxed);
        let error_count = self.error_count.load(Ordering::Relaxed);
        let attempts = collection_count + error_count;
        let success_rate = if attempts > 0 {
            let rate = collection_count as f64 / attempts as f64 * 100.0;
            (rate * 100.0).round() / 100.0
        } else {
            0.0
        };

        let last = self.last.lock().unwrap();
        SamplerStatistics {
            collection_count,
            error_count,
            success_rate,
            last_collection: last.as_ref().map(|l| l.time.clone()),
            last_data_quality: last.as_ref().map(|l| l.quality),
        }
    }
}

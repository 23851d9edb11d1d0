// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Recording sink for tests

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::{PublishError, PublishSink};

#[derive(Clone, Debug, PartialEq)]
pub struct Recorded {
    pub topic: String,
    pub payload: Value,
    pub retain: bool,
}

/// Records every message; can simulate a dead broker connection.
#[derive(Default)]
pub struct RecordingSink {
    messages: Mutex<Vec<Recorded>>,
    disconnected: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_connected(&self, connected: bool) {
        self.disconnected.store(!connected, Ordering::Relaxed);
    }

    pub fn take(&self) -> Vec<Recorded> {
        std::mem::take(&mut *self.messages.lock().unwrap())
    }

    pub fn messages(&self) -> Vec<Recorded> {
        self.messages.lock().unwrap().clone()
    }

    /// Messages published to a topic, in order.
    pub fn on_topic(&self, topic: &str) -> Vec<Value> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.topic == topic)
            .map(|m| m.payload.clone())
            .collect()
    }
}

#[async_trait]
impl PublishSink for RecordingSink {
    async fn publish(
        &self,
        topic: &str,
        payload: Value,
        retain: bool,
    ) -> Result<(), PublishError> {
        if self.disconnected.load(Ordering::Relaxed) {
            return Err(PublishError::NotConnected);
        }
        self.messages.lock().unwrap().push(Recorded {
            topic: topic.to_string(),
            payload,
            retain,
        });
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.disconnected.load(Ordering::Relaxed)
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory wire link for tests
//!
//! [`MockLink`] behaves like a well-mannered slave device: holding and input
//! words live in two maps, single-register writes land in the holding map,
//! and addressing a word that was never seeded draws an illegal-data-address
//! exception.  The shared [`MockState`] handle lets a test inject failures,
//! slow the device down, or inspect the write log while the link is owned by
//! a [`ModbusBus`](crate::ModbusBus).
//!
//! The link also asserts that exchanges never overlap in time.  Any test
//! that manages to drive two exchanges concurrently has broken the bus lock
//! and deserves the panic it gets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::{LinkError, ModbusLink, SlaveId};

#[derive(Default)]
pub struct MockState {
    pub holding: HashMap<u16, u16>,
    pub input: HashMap<u16, u16>,
    /// Log of `(address, value)` for every accepted write.
    pub writes: Vec<(u16, u16)>,
    /// Fail this many upcoming exchanges with a transport fault.
    pub fail_next: u32,
    /// Added latency per exchange.
    pub delay: Duration,
    /// When set, exchanges block (far beyond any sane deadline) instead of
    /// completing; used to exercise timeout races.
    pub hang: bool,
    /// Total exchanges attempted.
    pub exchanges: u64,
}

/// Clears the in-flight marker even when the exchange future is dropped
/// mid-way, which is exactly what a lost timeout race does.
struct InFlight(Arc<AtomicBool>);

impl InFlight {
    fn enter(flag: &Arc<AtomicBool>) -> Self {
        assert!(
            !flag.swap(true, Ordering::SeqCst),
            "overlapping exchanges on the mock wire"
        );
        Self(Arc::clone(flag))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct MockLink {
    state: Arc<Mutex<MockState>>,
    in_flight: Arc<AtomicBool>,
}

impl MockLink {
    pub fn new() -> (Self, Arc<Mutex<MockState>>) {
        let state = Arc::new(Mutex::new(MockState::default()));
        let link = Self {
            state: Arc::clone(&state),
            in_flight: Arc::new(AtomicBool::new(false)),
        };
        (link, state)
    }

    async fn exchange<T>(
        &mut self,
        op: impl FnOnce(&mut MockState) -> Result<T, LinkError>,
    ) -> Result<T, LinkError> {
        let _in_flight = InFlight::enter(&self.in_flight);

        let (delay, hang, fault) = {
            let mut state = self.state.lock().unwrap();
            state.exchanges += 1;
            let fault = if state.fail_next > 0 {
                state.fail_next -= 1;
                true
            } else {
                false
            };
            (state.delay, state.hang, fault)
        };

        if hang {
            tokio::time::sleep(Duration::from_secs(1_000_000)).await;
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if fault {
            return Err(LinkError::Transport("injected fault".to_string()));
        }

        op(&mut self.state.lock().unwrap())
    }
}

fn read_words(map: &HashMap<u16, u16>, address: u16, count: u16) -> Result<Vec<u16>, LinkError> {
    (0..count)
        .map(|i| {
            map.get(&(address + i))
                .copied()
                .ok_or_else(|| LinkError::Exception("illegal data address".to_string()))
        })
        .collect()
}

#[async_trait]
impl ModbusLink for MockLink {
    async fn read_holding(
        &mut self,
        _slave: SlaveId,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, LinkError> {
        self.exchange(|state| read_words(&state.holding, address, count))
            .await
    }

    async fn read_input(
        &mut self,
        _slave: SlaveId,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, LinkError> {
        self.exchange(|state| read_words(&state.input, address, count))
            .await
    }

    async fn write_single(
        &mut self,
        _slave: SlaveId,
        address: u16,
        value: u16,
    ) -> Result<(), LinkError> {
        self.exchange(|state| {
            state.holding.insert(address, value);
            state.writes.push((address, value));
            Ok(())
        })
        .await
    }
}

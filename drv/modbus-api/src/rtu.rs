// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! RTU wire link over a serial port
//!
//! Thin adapter from [`ModbusLink`] to `tokio-modbus`, which does the actual
//! framing and CRC work.  8N1 at the configured baud rate, which is what the
//! SPF5000ES speaks.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio_modbus::client::{rtu, Context};
use tokio_modbus::prelude::*;
use tokio_serial::SerialStream;

use crate::{BusError, LinkError, ModbusLink, SlaveId};

pub struct RtuLink {
    ctx: Context,
    /// Per-exchange response deadline; `tokio-modbus` itself waits forever.
    timeout: Duration,
}

impl RtuLink {
    /// Opens the serial device and attaches an RTU client to it.
    pub fn open(
        port: &str,
        baudrate: u32,
        timeout: Duration,
        slave: SlaveId,
    ) -> Result<Self, BusError> {
        let builder = tokio_serial::new(port, baudrate).timeout(timeout);
        let stream = SerialStream::open(&builder)
            .map_err(|e| BusError::Transport(format!("{}: {}", port, e)))?;
        let ctx = rtu::attach_slave(stream, Slave(slave.0));
        Ok(Self { ctx, timeout })
    }
}

/// Runs one exchange against the deadline and flattens the nested result
/// `tokio-modbus` hands back (outer transport error, inner exception reply).
async fn deadline<T>(
    timeout: Duration,
    fut: impl Future<Output = Result<Result<T, tokio_modbus::Exception>, tokio_modbus::Error>>,
) -> Result<T, LinkError> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(exception))) => Err(LinkError::Exception(exception.to_string())),
        Ok(Err(err)) => Err(LinkError::Transport(err.to_string())),
        Err(_) => Err(LinkError::Transport(format!(
            "no response within {:?}",
            timeout
        ))),
    }
}

#[async_trait]
impl ModbusLink for RtuLink {
    async fn read_holding(
        &mut self,
        slave: SlaveId,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, LinkError> {
        self.ctx.set_slave(Slave(slave.0));
        deadline(self.timeout, self.ctx.read_holding_registers(address, count)).await
    }

    async fn read_input(
        &mut self,
        slave: SlaveId,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, LinkError> {
        self.ctx.set_slave(Slave(slave.0));
        deadline(self.timeout, self.ctx.read_input_registers(address, count)).await
    }

    async fn write_single(
        &mut self,
        slave: SlaveId,
        address: u16,
        value: u16,
    ) -> Result<(), LinkError> {
        self.ctx.set_slave(Slave(slave.0));
        deadline(self.timeout, self.ctx.write_single_register(address, value)).await
    }
}

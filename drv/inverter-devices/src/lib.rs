// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Inverter device drivers
//!
//! Currently one device is supported, the Growatt SPF 5000 ES battery
//! inverter.  The driver composes the register catalog (names, addresses,
//! codecs, scale factors) with the bus from `drv-modbus-api` to expose
//! typed read and write by register name.

use drv_modbus_api::BusError;
use thiserror::Error;

pub mod codec;
pub mod spf5000es;

pub use codec::{DataType, EncodeError, Value};
pub use spf5000es::{RegisterCatalog, RegisterDef, RegisterSpace, Spf5000Es};

#[derive(Clone, Debug, Error, PartialEq)]
pub enum InverterError {
    #[error("unknown register: {0}")]
    UnknownRegister(String),
    #[error("register {0} is not writable")]
    NotWritable(String),
    #[error("{register}: {source}")]
    Encode {
        register: String,
        #[source]
        source: EncodeError,
    },
    /// The device replied, but with fewer words than the register needs.
    #[error("short response for {0}")]
    ShortResponse(String),
    #[error(transparent)]
    Bus(#[from] BusError),
}

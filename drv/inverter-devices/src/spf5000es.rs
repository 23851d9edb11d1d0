// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Driver for the Growatt SPF 5000 ES battery inverter
//!
//! The register table below is the device contract.  Addresses below 30000
//! are holding registers; anything at or above 30000 is an input register
//! whose on-wire address is the catalog address minus 30000.  The SPF5000ES
//! itself maps all of its telemetry into the holding space, but the split
//! is kept because sibling devices in the family use it.

use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use serde::Serialize;
use tracing::{debug, warn};

use drv_modbus_api::{ModbusBus, SlaveId};

use crate::codec::{self, DataType, Value};
use crate::InverterError;

/// Catalog addresses at or above this are input registers.
const INPUT_SPACE_BASE: u16 = 30000;

/// Pause between reads when walking the monitoring set, to give the
/// single-threaded inverter firmware room to breathe.
const INTER_READ_DELAY: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, Serialize)]
pub struct RegisterDef {
    pub name: &'static str,
    pub address: u16,
    pub data_type: DataType,
    pub scale: f64,
    pub unit: &'static str,
    pub description: &'static str,
    pub writable: bool,
}

/// Which register space an access lands in, with the on-wire address.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegisterSpace {
    Holding(u16),
    Input(u16),
}

impl RegisterDef {
    pub fn space(&self) -> RegisterSpace {
        if self.address < INPUT_SPACE_BASE {
            RegisterSpace::Holding(self.address)
        } else {
            RegisterSpace::Input(self.address - INPUT_SPACE_BASE)
        }
    }
}

const fn ro(
    name: &'static str,
    address: u16,
    data_type: DataType,
    scale: f64,
    unit: &'static str,
    description: &'static str,
) -> RegisterDef {
    RegisterDef {
        name,
        address,
        data_type,
        scale,
        unit,
        description,
        writable: false,
    }
}

const fn rw(
    name: &'static str,
    address: u16,
    data_type: DataType,
    scale: f64,
    unit: &'static str,
    description: &'static str,
) -> RegisterDef {
    RegisterDef {
        name,
        address,
        data_type,
        scale,
        unit,
        description,
        writable: true,
    }
}

#[rustfmt::skip]
static REGISTERS: &[RegisterDef] = &[
    // Battery status
    ro("battery_voltage", 3027, DataType::U16, 0.1, "V", "Battery voltage"),
    ro("battery_current", 3028, DataType::I16, 0.1, "A", "Battery current (+ charging, - discharging)"),
    ro("battery_power", 3029, DataType::I16, 1.0, "W", "Battery power (+ charging, - discharging)"),
    ro("battery_soc", 3030, DataType::U16, 1.0, "%", "Battery state of charge"),
    ro("battery_temperature", 3031, DataType::I16, 0.1, "°C", "Battery temperature"),
    // AC output
    ro("ac_voltage_output", 3033, DataType::U16, 0.1, "V", "AC output voltage"),
    ro("ac_current_output", 3034, DataType::U16, 0.1, "A", "AC output current"),
    ro("ac_power_output", 3035, DataType::U16, 1.0, "W", "AC output power"),
    ro("ac_frequency_output", 3036, DataType::U16, 0.01, "Hz", "AC output frequency"),
    // AC input (grid)
    ro("ac_voltage_input", 3037, DataType::U16, 0.1, "V", "AC input voltage"),
    ro("ac_current_input", 3038, DataType::U16, 0.1, "A", "AC input current"),
    ro("ac_power_input", 3039, DataType::U16, 1.0, "W", "AC input power"),
    ro("ac_frequency_input", 3040, DataType::U16, 0.01, "Hz", "AC input frequency"),
    // PV
    ro("pv_voltage", 3021, DataType::U16, 0.1, "V", "PV input voltage"),
    ro("pv_current", 3022, DataType::U16, 0.1, "A", "PV input current"),
    ro("pv_power", 3023, DataType::U16, 1.0, "W", "PV input power"),
    // Load
    ro("load_voltage", 3041, DataType::U16, 0.1, "V", "Load voltage"),
    ro("load_current", 3042, DataType::U16, 0.1, "A", "Load current"),
    ro("load_power", 3043, DataType::U16, 1.0, "W", "Load power"),
    ro("load_percentage", 3044, DataType::U16, 1.0, "%", "Load percentage"),
    // System status
    ro("working_mode", 3045, DataType::U16, 1.0, "", "Working mode"),
    ro("inverter_temperature", 3046, DataType::I16, 0.1, "°C", "Inverter temperature"),
    ro("fault_code", 3047, DataType::U16, 1.0, "", "Fault code"),
    ro("warning_code", 3048, DataType::U16, 1.0, "", "Warning code"),
    // Energy statistics (32-bit)
    ro("pv_energy_today", 3049, DataType::U32, 0.1, "kWh", "PV energy today"),
    ro("pv_energy_total", 3051, DataType::U32, 0.1, "kWh", "PV energy total"),
    ro("load_energy_today", 3053, DataType::U32, 0.1, "kWh", "Load energy today"),
    ro("load_energy_total", 3055, DataType::U32, 0.1, "kWh", "Load energy total"),
    ro("battery_charge_today", 3057, DataType::U32, 0.1, "kWh", "Battery charge today"),
    ro("battery_discharge_today", 3059, DataType::U32, 0.1, "kWh", "Battery discharge today"),
    // Control
    rw("output_source_priority", 1, DataType::U16, 1.0, "", "Output source priority"),
    rw("charger_source_priority", 2, DataType::U16, 1.0, "", "Charger source priority"),
    rw("battery_type", 3, DataType::U16, 1.0, "", "Battery type"),
    rw("battery_capacity", 4, DataType::U16, 1.0, "Ah", "Battery capacity"),
    rw("max_charge_current", 5, DataType::U16, 1.0, "A", "Maximum charge current"),
    rw("max_discharge_current", 6, DataType::U16, 1.0, "A", "Maximum discharge current"),
    rw("battery_low_voltage", 7, DataType::U16, 0.1, "V", "Battery low voltage cutoff"),
    rw("battery_high_voltage", 8, DataType::U16, 0.1, "V", "Battery high voltage cutoff"),
    rw("charge_time_1_start", 9, DataType::U16, 1.0, "", "Charge time 1 start (HHMM)"),
    rw("charge_time_1_end", 10, DataType::U16, 1.0, "", "Charge time 1 end (HHMM)"),
    rw("charge_time_2_start", 11, DataType::U16, 1.0, "", "Charge time 2 start (HHMM)"),
    rw("charge_time_2_end", 12, DataType::U16, 1.0, "", "Charge time 2 end (HHMM)"),
    rw("discharge_time_1_start", 13, DataType::U16, 1.0, "", "Discharge time 1 start (HHMM)"),
    rw("discharge_time_1_end", 14, DataType::U16, 1.0, "", "Discharge time 1 end (HHMM)"),
    rw("discharge_time_2_start", 15, DataType::U16, 1.0, "", "Discharge time 2 start (HHMM)"),
    rw("discharge_time_2_end", 16, DataType::U16, 1.0, "", "Discharge time 2 end (HHMM)"),
    rw("enable_charge", 17, DataType::U16, 1.0, "", "Enable battery charge (0=disable, 1=enable)"),
    rw("enable_discharge", 18, DataType::U16, 1.0, "", "Enable battery discharge (0=disable, 1=enable)"),
    rw("force_charge", 19, DataType::U16, 1.0, "", "Force charge from grid (0=disable, 1=enable)"),
    rw("charge_power_limit", 20, DataType::U16, 1.0, "W", "Charge power limit"),
    rw("discharge_power_limit", 21, DataType::U16, 1.0, "W", "Discharge power limit"),
    rw("grid_charge_enabled", 22, DataType::U16, 1.0, "", "Grid charge enabled"),
    rw("grid_discharge_enabled", 23, DataType::U16, 1.0, "", "Grid discharge enabled"),
];

/// The registers sampled for periodic monitoring, in read order.
pub const MONITORING_REGISTERS: &[&str] = &[
    "battery_voltage",
    "battery_current",
    "battery_power",
    "battery_soc",
    "battery_temperature",
    "ac_voltage_output",
    "ac_current_output",
    "ac_power_output",
    "pv_voltage",
    "pv_current",
    "pv_power",
    "inverter_temperature",
    "working_mode",
    "fault_code",
];

///
/// The register catalog: name to descriptor, fixed at construction.
///
#[derive(Clone, Debug)]
pub struct RegisterCatalog {
    registers: IndexMap<&'static str, RegisterDef>,
}

impl Default for RegisterCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterCatalog {
    pub fn new() -> Self {
        Self {
            registers: REGISTERS.iter().map(|def| (def.name, *def)).collect(),
        }
    }

    pub fn lookup(&self, name: &str) -> Option<&RegisterDef> {
        self.registers.get(name)
    }

    pub fn all(&self) -> impl Iterator<Item = &RegisterDef> {
        self.registers.values()
    }

    pub fn writable(&self) -> impl Iterator<Item = &RegisterDef> {
        self.registers.values().filter(|def| def.writable)
    }

    pub fn in_space(&self, space: &str) -> Vec<&RegisterDef> {
        match space {
            "holding" => self
                .registers
                .values()
                .filter(|def| def.address < INPUT_SPACE_BASE)
                .collect(),
            "input" => self
                .registers
                .values()
                .filter(|def| def.address >= INPUT_SPACE_BASE)
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Working mode label, e.g. for operator-facing telemetry.
pub fn working_mode_label(mode: i64) -> String {
    match mode {
        0 => "Power On".to_string(),
        1 => "Standby".to_string(),
        2 => "Line Mode".to_string(),
        3 => "Battery Mode".to_string(),
        4 => "Fault Mode".to_string(),
        5 => "Hybrid Mode".to_string(),
        6 => "Charge Mode".to_string(),
        7 => "Bypass Mode".to_string(),
        other => format!("Unknown Mode ({})", other),
    }
}

pub fn fault_label(code: i64) -> String {
    let label = match code {
        0 => "No Fault",
        1 => "Fan Error",
        2 => "Over Temperature",
        3 => "Battery Voltage High",
        4 => "Battery Voltage Low",
        5 => "Output Short Circuit",
        6 => "Output Voltage High",
        7 => "Over Load Timeout",
        8 => "Bus Voltage High",
        9 => "Bus Soft Start Failed",
        10 => "Main Relay Failed",
        11 => "Output Voltage Low",
        12 => "Inverter Soft Start Failed",
        13 => "Self Test Failed",
        14 => "OP DC Voltage Over",
        15 => "Bat Open",
        16 => "Current Sensor Failed",
        17 => "Battery Short",
        18 => "Power Limit",
        19 => "PV Voltage High",
        20 => "MPPT Overload Fault",
        21 => "MPPT Overload Warning",
        22 => "Battery Too Low to Charge",
        other => return format!("Unknown Fault ({})", other),
    };
    label.to_string()
}

pub fn battery_type_label(ty: i64) -> String {
    let label = match ty {
        0 => "AGM",
        1 => "Flooded",
        2 => "User Defined",
        3 => "Lithium",
        other => return format!("Unknown Type ({})", other),
    };
    label.to_string()
}

pub fn priority_label(priority: i64) -> String {
    let label = match priority {
        0 => "Utility First",
        1 => "Solar First",
        2 => "SBU (Solar-Battery-Utility)",
        other => return format!("Unknown Priority ({})", other),
    };
    label.to_string()
}

///
/// Typed access to one SPF5000ES on the bus, identified by its slave id.
///
pub struct Spf5000Es {
    bus: Arc<ModbusBus>,
    slave: SlaveId,
    catalog: RegisterCatalog,
}

impl core::fmt::Display for Spf5000Es {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "spf5000es: {}", self.slave)
    }
}

impl Spf5000Es {
    pub fn new(bus: Arc<ModbusBus>, slave: SlaveId) -> Self {
        Self {
            bus,
            slave,
            catalog: RegisterCatalog::new(),
        }
    }

    pub fn catalog(&self) -> &RegisterCatalog {
        &self.catalog
    }

    pub fn is_connected(&self) -> bool {
        self.bus.is_connected()
    }

    /// Reads a register by name, returning the decoded, scaled value.
    pub async fn read_register(&self, name: &str) -> Result<Value, InverterError> {
        let def = self
            .catalog
            .lookup(name)
            .ok_or_else(|| InverterError::UnknownRegister(name.to_string()))?;

        let count = def.data_type.word_count();
        let words = match def.space() {
            RegisterSpace::Holding(address) => {
                self.bus.read_holding(self.slave, address, count).await?
            }
            RegisterSpace::Input(address) => {
                self.bus.read_input(self.slave, address, count).await?
            }
        };

        codec::decode(&words, def.data_type, def.scale)
            .ok_or_else(|| InverterError::ShortResponse(name.to_string()))
    }

    /// Writes a register by name.  The value is in engineering units; the
    /// register's scale factor is applied before the word goes on the wire.
    pub async fn write_register(&self, name: &str, value: f64) -> Result<(), InverterError> {
        let def = self
            .catalog
            .lookup(name)
            .ok_or_else(|| InverterError::UnknownRegister(name.to_string()))?;

        if !def.writable {
            return Err(InverterError::NotWritable(name.to_string()));
        }

        let word = codec::encode(value, def.data_type, def.scale).map_err(|source| {
            InverterError::Encode {
                register: name.to_string(),
                source,
            }
        })?;

        self.bus.write_single(self.slave, def.address, word).await?;
        debug!(register = name, value, word, "register written");
        Ok(())
    }

    /// Walks the monitoring set, skipping registers that fail to read.
    /// Never fails as a whole: a dead device simply yields an empty map.
    pub async fn read_monitoring(&self) -> IndexMap<&'static str, Value> {
        let mut data = IndexMap::new();

        for (i, &name) in MONITORING_REGISTERS.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(INTER_READ_DELAY).await;
            }
            match self.read_register(name).await {
                Ok(value) => {
                    data.insert(name, value);
                }
                Err(err) => {
                    warn!(register = name, %err, "monitoring read failed");
                }
            }
        }

        data
    }
}

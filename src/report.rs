//! JSON projection of a full BMS read.
//!
//! Field names and order follow the document the vendor tooling emits,
//! including the historical `manfactureDate` spelling. On failure every
//! telemetry field is `null` and only `error_code`/`error_message` carry
//! information, so consumers can always parse the same shape.

use crate::client::BmsData;
use crate::status::StatusSummary;
use crate::Error;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Default, Clone, Serialize)]
pub struct BmsReport {
    #[serde(rename = "packVoltage")]
    pub pack_voltage: Option<u32>,
    pub voltage: Option<u32>,
    #[serde(rename = "batteryPack")]
    pub battery_pack: Option<BTreeMap<u8, f64>>,
    pub current: Option<f64>,
    pub watt: Option<f64>,
    #[serde(rename = "remainAh")]
    pub remain_ah: Option<f64>,
    #[serde(rename = "factoryAh")]
    pub factory_ah: Option<f64>,
    #[serde(rename = "cellTemperature")]
    pub cell_temperature: Option<i16>,
    #[serde(rename = "mosfetTemperature")]
    pub mosfet_temperature: Option<i16>,
    pub heat: Option<String>,
    #[serde(rename = "protectState")]
    pub protect_state: Option<String>,
    #[serde(rename = "failureState")]
    pub failure_state: Option<Vec<u8>>,
    #[serde(rename = "equilibriumState")]
    pub equilibrium_state: Option<u32>,
    #[serde(rename = "batteryState")]
    pub battery_state: Option<u16>,
    #[serde(rename = "SOC")]
    pub soc: Option<u16>,
    #[serde(rename = "SOH")]
    pub soh: Option<u32>,
    #[serde(rename = "dischargeSwitchState")]
    pub discharge_switch_state: Option<u8>,
    #[serde(rename = "dischargesCount")]
    pub discharges_count: Option<u32>,
    #[serde(rename = "dischargesAHCount")]
    pub discharges_ah_count: Option<u32>,
    #[serde(rename = "firmwareVersion")]
    pub firmware_version: Option<String>,
    #[serde(rename = "manfactureDate")]
    pub manfacture_date: Option<String>,
    #[serde(rename = "hardwareVersion")]
    pub hardware_version: Option<String>,
    pub battery_status: Option<String>,
    pub balance_status: Option<String>,
    pub cell_status: Option<String>,
    pub bms_status: Option<String>,
    pub heat_status: Option<String>,
    pub error_code: i32,
    pub error_message: Option<String>,
}

impl BmsReport {
    pub fn from_data(data: &BmsData) -> Self {
        let battery = &data.battery;
        let version = &data.version;
        let summary = StatusSummary::from(battery);
        Self {
            pack_voltage: Some(battery.pack_voltage_mv),
            voltage: Some(battery.voltage_mv),
            battery_pack: Some(battery.cells.clone()),
            current: Some(battery.current_a),
            watt: Some(battery.watt),
            remain_ah: Some(battery.remain_ah),
            factory_ah: Some(battery.factory_ah),
            cell_temperature: Some(battery.cell_temperature),
            mosfet_temperature: Some(battery.mosfet_temperature),
            heat: Some(battery.heat_hex()),
            protect_state: Some(battery.protect_state_hex()),
            failure_state: Some(battery.failure_state.to_vec()),
            equilibrium_state: Some(battery.equilibrium_state),
            battery_state: Some(battery.battery_state.raw()),
            soc: Some(battery.soc),
            soh: Some(battery.soh),
            discharge_switch_state: Some(battery.discharge_switch_state),
            discharges_count: Some(battery.discharges_count),
            discharges_ah_count: Some(battery.discharges_ah_count),
            firmware_version: Some(version.firmware_version()),
            manfacture_date: Some(version.manufacture_date()),
            hardware_version: Some(version.hardware_version.clone()),
            battery_status: Some(summary.battery_status.to_string()),
            balance_status: Some(summary.balance_status.to_string()),
            cell_status: Some(summary.cell_status.to_string()),
            bms_status: Some(summary.bms_status.to_string()),
            heat_status: Some(summary.heat_status.to_string()),
            error_code: 0,
            error_message: None,
        }
    }

    pub fn from_error(error: &Error) -> Self {
        Self {
            error_code: error.error_code(),
            error_message: Some(error.to_string()),
            ..Self::default()
        }
    }
}

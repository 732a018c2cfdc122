//! Human-readable status strings derived from decoded telemetry.
//!
//! Pure mappings to a fixed vocabulary; no I/O and no failure modes.

use crate::protocol::{BatteryInfo, BatteryState};

pub fn battery_status(state: BatteryState) -> &'static str {
    match state {
        BatteryState::Idle => "Standby",
        BatteryState::Charging => "Charging",
        BatteryState::Discharging => "Discharging",
        BatteryState::FullCharge => "Full Charge",
    }
}

pub fn balance_status(equilibrium_state: u32) -> &'static str {
    if equilibrium_state > 0 {
        "Battery cells are being balanced for better performance."
    } else {
        "Cell balancing is not active"
    }
}

/// Any nonzero failure byte means a fault; all four bytes are checked.
pub fn cell_status(failure_state: &[u8; 4]) -> &'static str {
    if failure_state.iter().any(|&b| b > 0) {
        "Fault alert! There may be a problem with cell."
    } else {
        "Battery is in optimal working condition."
    }
}

pub fn bms_status(protect_state: &[u8; 4]) -> &'static str {
    if protect_state.iter().any(|&b| b > 0) {
        "Protection alert! BMS protection is active."
    } else {
        "BMS is operating normally."
    }
}

/// Self-heating is signalled by the 8th hex digit of the heat flags.
pub fn heat_status(heat: &[u8; 4]) -> &'static str {
    let hex = hex::encode(heat);
    if hex.as_bytes()[7] == b'2' {
        "Self-heating is on"
    } else {
        "Self-heating is off"
    }
}

/// All five strings for one telemetry snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSummary {
    pub battery_status: &'static str,
    pub balance_status: &'static str,
    pub cell_status: &'static str,
    pub bms_status: &'static str,
    pub heat_status: &'static str,
}

impl From<&BatteryInfo> for StatusSummary {
    fn from(info: &BatteryInfo) -> Self {
        Self {
            battery_status: battery_status(info.battery_state),
            balance_status: balance_status(info.equilibrium_state),
            cell_status: cell_status(&info.failure_state),
            bms_status: bms_status(&info.protect_state),
            heat_status: heat_status(&info.heat),
        }
    }
}

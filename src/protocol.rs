//! Wire protocol for the PowerQueen LiFePO4 BMS.
//!
//! Commands are 8-byte frames written to the FFE1 characteristic; the BMS
//! answers with a notification that echoes the command inside an 8-byte
//! header, followed by the payload and a trailing additive checksum.
//!
//! Every multi-byte numeric field in a payload is stored byte-reversed:
//! read the span, reverse it, then interpret the result as big-endian.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// GATT characteristic used for BMS commands and notifications.
pub const BMS_CHARACTERISTIC_ID: &str = "0000FFE1-0000-1000-8000-00805F9B34FB";
/// GATT characteristic for the internal serial number. Documented, but no
/// known firmware actually serves it.
pub const SN_CHARACTERISTIC_ID: &str = "0000FFE2-0000-1000-8000-00805F9B34FB";

const FRAME_HEADER: [u8; 2] = [0x00, 0x00];
const FRAME_MAGIC: [u8; 2] = [0x55, 0xAA];
const REQUEST_TYPE: u8 = 0x01;
const RESPONSE_TYPE: u8 = 0x02;
const REQUEST_DATA_LENGTH: u8 = 0x04;
const TX_BUFFER_LENGTH: usize = 8;
// header + length + type + command + magic + reserved + checksum
const MIN_RESPONSE_LENGTH: usize = 9;
// offset of the payload inside a response, right after the reserved byte
const PAYLOAD_OFFSET: usize = 8;

const VERSION_PAYLOAD_LENGTH: usize = 10;
const BATTERY_INFO_PAYLOAD_LENGTH: usize = 96;

const MAX_CELLS: usize = 16;

/// Command identifiers understood by the BMS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Command {
    /// Internal serial number. May never be answered by the firmware.
    SerialNumber = 0x10,
    /// Full telemetry snapshot.
    GetBatteryInfo = 0x13,
    /// Firmware/hardware version and manufacture date.
    GetVersion = 0x16,
}

impl Command {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0x10 => Some(Command::SerialNumber),
            0x13 => Some(Command::GetBatteryInfo),
            0x16 => Some(Command::GetVersion),
            _ => None,
        }
    }

    /// Build the 8-byte request frame `00 00 04 01 <cmd> 55 AA <crc>`.
    pub fn request(self) -> [u8; TX_BUFFER_LENGTH] {
        let mut tx_buffer = [
            FRAME_HEADER[0],
            FRAME_HEADER[1],
            REQUEST_DATA_LENGTH,
            REQUEST_TYPE,
            self as u8,
            FRAME_MAGIC[0],
            FRAME_MAGIC[1],
            0,
        ];
        tx_buffer[TX_BUFFER_LENGTH - 1] = calc_crc(&tx_buffer);
        tx_buffer
    }
}

fn calc_crc(buffer: &[u8]) -> u8 {
    let mut checksum: u8 = 0;
    let slice = &buffer[0..buffer.len() - 1];
    for b in slice {
        checksum = checksum.wrapping_add(*b);
    }
    checksum
}

fn validate_len(buffer: &[u8], minimum: usize) -> std::result::Result<(), Error> {
    if buffer.len() < minimum {
        log::warn!(
            "Invalid buffer size - required={} received={}",
            minimum,
            buffer.len()
        );
        return Err(Error::FrameTooShort {
            len: buffer.len(),
            expected: minimum,
        });
    }
    Ok(())
}

fn validate_checksum(buffer: &[u8]) -> std::result::Result<(), Error> {
    let checksum = calc_crc(buffer);
    let received = buffer[buffer.len() - 1];
    if received != checksum {
        log::warn!(
            "Invalid checksum - calculated={:02X?} received={:02X?} buffer={:02X?}",
            checksum,
            received,
            buffer
        );
        return Err(Error::ChecksumMismatch {
            calculated: checksum,
            received,
        });
    }
    Ok(())
}

// The additive checksum cannot detect reordered bytes, so the envelope check
// is log-only; a corrupted header has almost certainly failed the sum already.
fn check_envelope(buffer: &[u8]) {
    if buffer[0..2] != FRAME_HEADER || buffer[3] != RESPONSE_TYPE || buffer[5..7] != FRAME_MAGIC {
        log::warn!("Unexpected response envelope: {:02X?}", &buffer[0..7]);
    }
}

/// A validated response, borrowed from the raw notification for the
/// duration of one decode.
#[derive(Debug)]
pub struct ResponseFrame<'a> {
    pub length: u8,
    pub command: u8,
    pub payload: &'a [u8],
}

impl<'a> ResponseFrame<'a> {
    /// Validate the checksum and split off the payload.
    ///
    /// Frames shorter than the 9-byte envelope and frames whose trailing
    /// byte does not match the 8-bit sum of the preceding bytes are
    /// rejected; such a frame must never reach the field decoders.
    pub fn decode(raw: &'a [u8]) -> std::result::Result<Self, Error> {
        validate_len(raw, MIN_RESPONSE_LENGTH)?;
        validate_checksum(raw)?;
        check_envelope(raw);
        Ok(Self {
            length: raw[2],
            command: raw[4],
            payload: &raw[PAYLOAD_OFFSET..raw.len() - 1],
        })
    }

    /// The echoed command, if it is one we know.
    pub fn command(&self) -> Option<Command> {
        Command::from_raw(self.command)
    }
}

// Reversed-byte readers. Reversing the span and reading big-endian is the
// protocol's convention for all numeric fields.

fn read_u16(payload: &[u8], offset: usize) -> u16 {
    let mut bytes = [payload[offset], payload[offset + 1]];
    bytes.reverse();
    u16::from_be_bytes(bytes)
}

fn read_i16(payload: &[u8], offset: usize) -> i16 {
    let mut bytes = [payload[offset], payload[offset + 1]];
    bytes.reverse();
    i16::from_be_bytes(bytes)
}

fn read_u32(payload: &[u8], offset: usize) -> u32 {
    let mut bytes = [
        payload[offset],
        payload[offset + 1],
        payload[offset + 2],
        payload[offset + 3],
    ];
    bytes.reverse();
    u32::from_be_bytes(bytes)
}

fn read_i32(payload: &[u8], offset: usize) -> i32 {
    let mut bytes = [
        payload[offset],
        payload[offset + 1],
        payload[offset + 2],
        payload[offset + 3],
    ];
    bytes.reverse();
    i32::from_be_bytes(bytes)
}

// Flag fields are exposed in reversed byte order, matching the order the
// vendor application renders them in.
fn read_flags(payload: &[u8], offset: usize) -> [u8; 4] {
    let mut bytes = [
        payload[offset],
        payload[offset + 1],
        payload[offset + 2],
        payload[offset + 3],
    ];
    bytes.reverse();
    bytes
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Operational state reported by the BMS.
///
/// Any raw value outside this set is a decode error, never silently mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatteryState {
    Idle,
    Charging,
    Discharging,
    FullCharge,
}

impl BatteryState {
    pub fn raw(self) -> u16 {
        match self {
            BatteryState::Idle => 0,
            BatteryState::Charging => 1,
            BatteryState::Discharging => 2,
            BatteryState::FullCharge => 4,
        }
    }
}

impl TryFrom<u16> for BatteryState {
    type Error = Error;

    fn try_from(raw: u16) -> std::result::Result<Self, Error> {
        match raw {
            0 => Ok(BatteryState::Idle),
            1 => Ok(BatteryState::Charging),
            2 => Ok(BatteryState::Discharging),
            4 => Ok(BatteryState::FullCharge),
            other => Err(Error::UnknownBatteryState(other)),
        }
    }
}

/// Firmware/hardware identification from `GetVersion`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub firmware_major: u16,
    pub firmware_minor: u16,
    pub firmware_patch: u16,
    pub manufacture_year: u16,
    pub manufacture_month: u8,
    pub manufacture_day: u8,
    pub hardware_version: String,
}

impl VersionInfo {
    pub fn decode(payload: &[u8]) -> std::result::Result<Self, Error> {
        validate_len(payload, VERSION_PAYLOAD_LENGTH)?;
        // The hardware identifier is interleaved: only even payload offsets
        // from 10 onward carry characters, and only printable ASCII counts.
        let hardware_version = payload
            .iter()
            .enumerate()
            .skip(VERSION_PAYLOAD_LENGTH)
            .filter(|(i, _)| i % 2 == 0)
            .filter_map(|(_, &b)| (32..=126).contains(&b).then_some(b as char))
            .collect();
        Ok(Self {
            firmware_major: read_u16(payload, 0),
            firmware_minor: read_u16(payload, 2),
            firmware_patch: read_u16(payload, 4),
            manufacture_year: read_u16(payload, 6),
            manufacture_month: payload[8],
            manufacture_day: payload[9],
            hardware_version,
        })
    }

    /// `major.minor.patch`, e.g. "1.4.0".
    pub fn firmware_version(&self) -> String {
        format!(
            "{}.{}.{}",
            self.firmware_major, self.firmware_minor, self.firmware_patch
        )
    }

    /// `YYYY-M-D` without zero padding, as the vendor application shows it.
    pub fn manufacture_date(&self) -> String {
        format!(
            "{}-{}-{}",
            self.manufacture_year, self.manufacture_month, self.manufacture_day
        )
    }
}

/// Full telemetry snapshot from `GetBatteryInfo`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatteryInfo {
    /// Total pack voltage in mV.
    pub pack_voltage_mv: u32,
    /// Battery voltage reading in mV.
    pub voltage_mv: u32,
    /// Cell number (1..=16) to voltage in V. Cells reporting zero are absent.
    pub cells: BTreeMap<u8, f64>,
    /// Current in A. Negative is discharging.
    pub current_a: f64,
    /// Power in W, sign follows the current.
    pub watt: f64,
    pub cell_temperature: i16,
    pub mosfet_temperature: i16,
    pub remain_ah: f64,
    pub factory_ah: f64,
    /// Heat status flags, byte-reversed.
    pub heat: [u8; 4],
    /// Protection state flags, byte-reversed.
    pub protect_state: [u8; 4],
    /// Failure state flags, byte-reversed.
    pub failure_state: [u8; 4],
    /// Nonzero while cell balancing is active.
    pub equilibrium_state: u32,
    pub battery_state: BatteryState,
    pub soc: u16,
    pub soh: u32,
    /// Bluetooth-controlled discharge switch: 1 = enabled, 0 = disabled.
    pub discharge_switch_state: u8,
    pub discharges_count: u32,
    pub discharges_ah_count: u32,
}

impl BatteryInfo {
    pub fn decode(payload: &[u8]) -> std::result::Result<Self, Error> {
        validate_len(payload, BATTERY_INFO_PAYLOAD_LENGTH)?;

        let mut cells = BTreeMap::new();
        for cell in 0..MAX_CELLS {
            let raw = read_u16(payload, 8 + cell * 2);
            if raw == 0 {
                continue;
            }
            cells.insert(cell as u8 + 1, raw as f64 / 1000.0);
        }

        let voltage_mv = read_u32(payload, 4);
        // Watt is derived from the raw mA reading; rounding the current
        // first would shift the result by a few hundredths.
        let current_ma = read_i32(payload, 40);
        let current_a = round2(current_ma as f64 / 1000.0);
        let heat = read_flags(payload, 60);

        Ok(Self {
            pack_voltage_mv: read_u32(payload, 0),
            voltage_mv,
            cells,
            current_a,
            watt: round2(voltage_mv as f64 * current_ma as f64 / 1_000_000.0),
            cell_temperature: read_i16(payload, 44),
            mosfet_temperature: read_i16(payload, 46),
            remain_ah: round2(read_u16(payload, 54) as f64 / 100.0),
            factory_ah: round2(read_u16(payload, 56) as f64 / 100.0),
            heat,
            protect_state: read_flags(payload, 68),
            failure_state: read_flags(payload, 72),
            equilibrium_state: read_u32(payload, 76),
            battery_state: BatteryState::try_from(read_u16(payload, 80))?,
            soc: read_u16(payload, 82),
            soh: read_u32(payload, 84),
            discharge_switch_state: discharge_switch_state(&heat),
            discharges_count: read_u32(payload, 88),
            discharges_ah_count: read_u32(payload, 92),
        })
    }

    /// Heat flags as a lowercase hex string.
    pub fn heat_hex(&self) -> String {
        hex::encode(self.heat)
    }

    /// Protection flags as a lowercase hex string.
    pub fn protect_state_hex(&self) -> String {
        hex::encode(self.protect_state)
    }
}

/// State of the Bluetooth-controlled discharge switch, derived from the 7th
/// hex digit of the heat flags. The firmware reports the switch as open when
/// that digit is >= 8; the bit-level meaning is undocumented upstream, so
/// the digit rule is reproduced as-is.
fn discharge_switch_state(heat: &[u8; 4]) -> u8 {
    let hex = hex::encode(heat);
    let digit = (hex.as_bytes()[6] as char).to_digit(16).unwrap_or(0);
    if digit >= 8 {
        0
    } else {
        1
    }
}

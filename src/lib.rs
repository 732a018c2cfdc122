#![cfg_attr(docsrs, feature(doc_cfg))]
//! # pqbms_lib
//!
//! This crate provides a library for reading PowerQueen LiFePO4 BMS (Battery
//! Management System) devices over Bluetooth Low Energy. The protocol is
//! read-only: battery settings cannot be modified through it.
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling
//!   the `pqbms` command-line tool.
//!
//! ### Transport Features
//! - `bluest-transport`: Enables the BLE transport using the `bluest` crate.
//!
//! ### Utility Features
//! - `bin-dependencies`: Enables all features required by the `pqbms` binary
//!   executable.

/// Contains error types for the library.
mod error;
/// Exchange orchestration: command sequencing, timeouts, connection lifetime.
pub mod client;
/// Defines the communication protocol for the PowerQueen BMS.
pub mod protocol;
/// JSON report projection of a full read.
pub mod report;
/// Human-readable status strings.
pub mod status;
/// Abstract transport seam.
pub mod transport;

pub use error::{Error, Result};

/// BLE transport implementation.
#[cfg_attr(docsrs, doc(cfg(feature = "bluest-transport")))]
#[cfg(feature = "bluest-transport")]
pub mod ble;

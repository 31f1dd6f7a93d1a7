//! Devlink MCU Library
//!
//! Traits for the platform pieces the device core drives but does not own.
//!
//! This crate provides:
//! - BLE provisioning link types (protocol constants live in `devlink_proto::ble`)
//! - Traits for WiFi, namespaced persistent storage and the firmware write path
//! - Length-checked credential strings
//!
//! # Note
//! This crate has no dependencies beyond `devlink-proto`. The async device core
//! (`devlink-device`) wraps these traits; MCU crates only implement them.

pub mod ble;
pub mod ota;
pub mod storage;
pub mod wifi;

pub use ble::*;
pub use ota::*;
pub use storage::*;
pub use wifi::*;

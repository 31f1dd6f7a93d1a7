//! BLE GATT Service types and traits for Devlink Device Provisioning
//!
//! Protocol constants (UUIDs, command names) are in devlink_proto::ble.
//! This module provides MCU-specific types and traits.

// Re-export protocol constants for convenience
pub use devlink_proto::ble::{DEVICE_NAME, MTU, RX_UUID, SERVICE_UUID, TX_UUID, commands};

/// Something that happened on the provisioning link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BleEvent {
    /// A companion app connected
    Connected,
    /// One complete write to the RX characteristic
    Data(Vec<u8>),
    /// The companion app went away
    Disconnected,
}

/// Trait for BLE GATT server implementations
///
/// MCU-specific crates implement this trait using their BLE stack.
pub trait BleServer {
    /// Error type for BLE operations
    type Error: core::fmt::Display;

    /// Start BLE advertising with the given device name
    fn start_advertising(&mut self, device_name: &str) -> Result<(), Self::Error>;

    /// Stop BLE advertising
    fn stop_advertising(&mut self) -> Result<(), Self::Error>;

    /// Next pending link event (non-blocking)
    fn poll_event(&mut self) -> Option<BleEvent>;

    /// Notify the companion on the TX characteristic
    fn notify(&mut self, data: &[u8]) -> Result<(), Self::Error>;
}

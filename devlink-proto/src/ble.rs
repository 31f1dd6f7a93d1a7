//! BLE GATT Service Protocol Constants for Devlink Device Provisioning
//!
//! The companion app writes provisioning requests to the RX characteristic and
//! receives responses as notifications on the TX characteristic.

/// Name the device advertises while waiting for a companion app
pub const DEVICE_NAME: &str = "ESP32_BLE";

/// Provisioning service UUID
pub const SERVICE_UUID: &str = "4fafc201-1fb5-459e-8fcc-c5c9c331914b";

/// Companion -> device characteristic (write)
pub const RX_UUID: &str = "beb5483e-36e1-4688-b7f5-ea07361b26a8";

/// Device -> companion characteristic (notify)
pub const TX_UUID: &str = "beb5483e-36e1-4688-b7f5-ea07361b26a9";

/// MTU requested when the link comes up
pub const MTU: u16 = 512;

/// Provisioning command names carried in the `command` field
pub mod commands {
    /// Endpoint configuration: auth, token, broker, cloud API and config URLs
    pub const SERVER_DATA: &str = "SERVER_DATA";

    /// Ask for the device identity plus the OAuth user code once it is known
    pub const GET_TOKEN: &str = "GET_TOKEN";

    /// Wait for the user to finish authorizing the device
    pub const CHECK_AUTH: &str = "CHECK_AUTH";

    /// Command name used in replies to the legacy `ssid:password` message
    pub const LEGACY_WIFI_REPLY: &str = SERVER_DATA;
}

//! Persistent Storage Abstraction Traits
//!
//! Namespaced string key/value storage that survives a reboot (NVS on ESP32).

/// Tokens and endpoint URLs
pub const NVS_NAMESPACE: &str = "nvs";
/// WiFi credentials
pub const WIFI_NAMESPACE: &str = "wifi-config";
/// Clock-restore snapshot
pub const TIME_NAMESPACE: &str = "time";

/// Every namespace the device core writes; cleared on factory reset
pub const ALL_NAMESPACES: [&str; 3] = [NVS_NAMESPACE, WIFI_NAMESPACE, TIME_NAMESPACE];

pub mod keys {
    pub const AUTH_URL: &str = "authUrl";
    pub const TOKEN_URL: &str = "tokenUrl";
    pub const MQTT_URL: &str = "mqttUrl";
    pub const CLOUD_API_URL: &str = "cloudApiUrl";
    pub const CONFIG_URL: &str = "configUrl";
    pub const ACCESS_TOKEN: &str = "accessToken";
    pub const REFRESH_TOKEN: &str = "refreshToken";
    pub const EXPIRES_IN: &str = "expiresIn";

    pub const SSID: &str = "ssid";
    pub const PASSWORD: &str = "password";

    pub const SAVED_TIME: &str = "saved_time";
    pub const RTC_OFFSET: &str = "rtc_offset";

    /// Hardware address, only used by hosts without a burned-in MAC
    pub const MAC: &str = "mac";
}

/// Trait for persistent storage operations
///
/// MCU-specific crates implement this trait using their storage backend
/// (NVS for ESP32, flash for Pico, a JSON file per namespace on a host).
pub trait Storage {
    /// Error type for storage operations
    type Error: core::fmt::Display;

    /// Read a string value
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>, Self::Error>;

    /// Write a string value
    fn set(&mut self, namespace: &str, key: &str, value: &str) -> Result<(), Self::Error>;

    /// Remove a single key
    fn remove(&mut self, namespace: &str, key: &str) -> Result<(), Self::Error>;

    /// Remove every key in a namespace
    fn clear_namespace(&mut self, namespace: &str) -> Result<(), Self::Error>;

    /// Write only when the stored value differs; returns whether a write happened
    fn set_if_changed(&mut self, namespace: &str, key: &str, value: &str) -> Result<bool, Self::Error> {
        if self.get(namespace, key)?.as_deref() == Some(value) {
            return Ok(false);
        }
        self.set(namespace, key, value)?;
        Ok(true)
    }
}

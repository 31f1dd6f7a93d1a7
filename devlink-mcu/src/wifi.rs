//! WiFi Abstraction Traits
//!
//! Traits for WiFi operations that MCU-specific crates implement.

use core::fmt;

/// Longest SSID or passphrase the radio accepts, in bytes
pub const MAX_CREDENTIAL_LEN: usize = 32;

/// A string of at most `N` bytes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoundedString<const N: usize>(String);

/// Returned when a value does not fit its bound
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TooLong {
    pub len: usize,
    pub max: usize,
}

impl fmt::Display for TooLong {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "value is {} bytes, limit is {}", self.len, self.max)
    }
}

impl<const N: usize> BoundedString<N> {
    /// Accept `value` only if it fits
    pub fn new(value: &str) -> Result<Self, TooLong> {
        if value.len() > N {
            return Err(TooLong { len: value.len(), max: N });
        }
        Ok(Self(value.to_string()))
    }

    /// Cut `value` at the last char boundary within the bound
    pub fn truncated(value: &str) -> Self {
        let mut end = value.len().min(N);
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        Self(value[..end].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<const N: usize> fmt::Display for BoundedString<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub type Ssid = BoundedString<MAX_CREDENTIAL_LEN>;
pub type Passphrase = BoundedString<MAX_CREDENTIAL_LEN>;

/// Station credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiCredentials {
    pub ssid: Ssid,
    pub password: Passphrase,
}

impl WifiCredentials {
    pub fn new(ssid: &str, password: &str) -> Result<Self, TooLong> {
        Ok(Self { ssid: Ssid::new(ssid)?, password: Passphrase::new(password)? })
    }

    /// Parse the legacy `ssid:password` provisioning message
    ///
    /// The first `:` separates the two; the password may itself contain colons.
    /// An empty password is accepted here (open network) even though stored
    /// credentials are only used at boot when both halves are set.
    pub fn parse_legacy(message: &str) -> Option<Result<Self, TooLong>> {
        let (ssid, password) = message.split_once(':')?;
        if ssid.is_empty() {
            return None;
        }
        Some(Self::new(ssid, password))
    }
}

/// WiFi connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiStatus {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// Trait for WiFi operations
///
/// MCU-specific crates implement this trait using their WiFi stack.
pub trait Wifi {
    /// Error type for WiFi operations
    type Error: core::fmt::Display;

    /// Start joining a network; completion is observed through [`Wifi::status`]
    fn connect(&mut self, credentials: &WifiCredentials) -> Result<(), Self::Error>;

    /// Disconnect from WiFi
    fn disconnect(&mut self) -> Result<(), Self::Error>;

    /// Get current connection status
    fn status(&self) -> WifiStatus;

    /// Signal strength of the current association, in dBm
    fn rssi(&self) -> Option<i8>;

    /// Check if connected
    fn is_connected(&self) -> bool {
        self.status() == WifiStatus::Connected
    }
}

//! Station stand-in for a desktop, whose network is managed by the OS

use devlink_mcu::{Wifi, WifiCredentials, WifiStatus};
use log::*;

/// Reports the host network as the station link
///
/// `connect` only records the SSID; the link counts as up unless
/// `disconnect` was called since.
#[derive(Debug)]
pub struct HostWifi {
    ssid: Option<String>,
    status: WifiStatus,
}

impl HostWifi {
    pub fn new() -> Self {
        Self { ssid: None, status: WifiStatus::Connected }
    }
}

impl Default for HostWifi {
    fn default() -> Self {
        Self::new()
    }
}

impl Wifi for HostWifi {
    type Error = std::convert::Infallible;

    fn connect(&mut self, credentials: &WifiCredentials) -> Result<(), Self::Error> {
        info!("Pretending to join {}", credentials.ssid);
        self.ssid = Some(credentials.ssid.to_string());
        self.status = WifiStatus::Connected;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), Self::Error> {
        self.status = WifiStatus::Disconnected;
        Ok(())
    }

    fn status(&self) -> WifiStatus {
        self.status
    }

    fn rssi(&self) -> Option<i8> {
        // wired or OS-managed: report a strong, steady signal
        (self.status == WifiStatus::Connected).then_some(-40)
    }
}

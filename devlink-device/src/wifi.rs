//! WiFi station handling on top of the platform [`Wifi`] driver

use std::sync::{Arc, Mutex};
use std::time::Duration;

use devlink_mcu::{Passphrase, Ssid, WIFI_NAMESPACE, Wifi, WifiCredentials, WifiStatus, keys};
use log::*;

use crate::error::{StorageError, TransportError};
use crate::store::Preferences;

trait DynWifi: Send {
    fn connect(&mut self, credentials: &WifiCredentials) -> Result<(), String>;
    fn disconnect(&mut self) -> Result<(), String>;
    fn status(&self) -> WifiStatus;
    fn rssi(&self) -> Option<i8>;
}

impl<W: Wifi + Send> DynWifi for W {
    fn connect(&mut self, credentials: &WifiCredentials) -> Result<(), String> {
        Wifi::connect(self, credentials).map_err(|e| e.to_string())
    }

    fn disconnect(&mut self) -> Result<(), String> {
        Wifi::disconnect(self).map_err(|e| e.to_string())
    }

    fn status(&self) -> WifiStatus {
        Wifi::status(self)
    }

    fn rssi(&self) -> Option<i8> {
        Wifi::rssi(self)
    }
}

/// Save credentials, skipping the write when nothing changed
pub fn save_credentials(prefs: &Preferences, credentials: &WifiCredentials) -> Result<bool, StorageError> {
    let ssid = prefs.set_if_changed(WIFI_NAMESPACE, keys::SSID, credentials.ssid.as_str())?;
    let password = prefs.set_if_changed(WIFI_NAMESPACE, keys::PASSWORD, credentials.password.as_str())?;
    if ssid || password {
        info!("WiFi credentials saved for {}", credentials.ssid);
    }
    Ok(ssid || password)
}

/// Stored credentials; both fields must be present
pub fn load_credentials(prefs: &Preferences) -> Result<Option<WifiCredentials>, StorageError> {
    let ssid = prefs.get_string(WIFI_NAMESPACE, keys::SSID)?;
    let password = prefs.get_string(WIFI_NAMESPACE, keys::PASSWORD)?;
    if ssid.is_empty() || password.is_empty() {
        return Ok(None);
    }
    Ok(Some(WifiCredentials {
        ssid: Ssid::truncated(&ssid),
        password: Passphrase::truncated(&password),
    }))
}

/// Shared handle to the station interface
#[derive(Clone)]
pub struct WifiLink {
    driver: Arc<Mutex<Box<dyn DynWifi>>>,
    retries: u32,
    backoff: Duration,
}

impl WifiLink {
    /// `retries` status checks, waiting `backoff` before the first and doubling after each
    pub fn new<W: Wifi + Send + 'static>(driver: W, retries: u32, backoff: Duration) -> Self {
        Self { driver: Arc::new(Mutex::new(Box::new(driver))), retries, backoff }
    }

    fn with<R>(&self, f: impl FnOnce(&mut dyn DynWifi) -> R) -> Option<R> {
        let mut guard = self.driver.lock().ok()?;
        Some(f(guard.as_mut()))
    }

    pub fn is_connected(&self) -> bool {
        self.with(|w| w.status() == WifiStatus::Connected).unwrap_or(false)
    }

    pub fn rssi(&self) -> Option<i8> {
        self.with(|w| w.rssi()).flatten()
    }

    pub fn disconnect(&self) {
        if let Some(Err(e)) = self.with(|w| w.disconnect()) {
            warn!("WiFi disconnect failed: {}", e);
        }
    }

    /// Join `credentials`, waiting with exponential backoff for the link to come up
    pub async fn connect(&self, credentials: &WifiCredentials) -> Result<(), TransportError> {
        info!("Connecting to WiFi {}...", credentials.ssid);
        match self.with(|w| w.connect(credentials)) {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                warn!("WiFi connect failed: {}", e);
                return Err(TransportError::WifiDown);
            }
            None => return Err(TransportError::WifiDown),
        }

        let mut delay = self.backoff;
        for attempt in 1..=self.retries {
            tokio::time::sleep(delay).await;
            if self.is_connected() {
                info!("WiFi connected after {} check(s)", attempt);
                return Ok(());
            }
            debug!("WiFi not up yet, retrying in {:?}", delay * 2);
            delay *= 2;
        }

        warn!("WiFi did not come up after {} checks", self.retries);
        Err(TransportError::WifiDown)
    }

    /// Drop the association and rejoin with whatever is stored
    pub async fn reinitialize(&self, prefs: &Preferences) -> Result<(), TransportError> {
        self.disconnect();
        let credentials = load_credentials(prefs)
            .map_err(|e| TransportError::Io(std::io::Error::other(e.to_string())))?;
        match credentials {
            Some(creds) => self.connect(&creds).await,
            None => {
                warn!("No stored WiFi credentials to reconnect with");
                Err(TransportError::WifiDown)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStorage;
    use crate::testing::FakeWifi;

    #[test]
    fn credentials_need_both_fields() {
        let prefs = Preferences::new(MemoryStorage::new());
        prefs.set(WIFI_NAMESPACE, keys::SSID, "home").unwrap();
        assert_eq!(load_credentials(&prefs).unwrap(), None);

        prefs.set(WIFI_NAMESPACE, keys::PASSWORD, "secret").unwrap();
        let creds = load_credentials(&prefs).unwrap().unwrap();
        assert_eq!(creds.ssid.as_str(), "home");
    }

    #[test]
    fn unchanged_credentials_are_not_rewritten() {
        let mem = MemoryStorage::new();
        let prefs = Preferences::new(mem.clone());
        let creds = WifiCredentials::new("home", "secret").unwrap();
        assert!(save_credentials(&prefs, &creds).unwrap());
        assert!(!save_credentials(&prefs, &creds).unwrap());
        assert_eq!(mem.writes(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn join_gives_up_after_retries() {
        let wifi = FakeWifi::new();
        wifi.set_joins(false);
        let link = WifiLink::new(wifi.clone(), 10, Duration::from_millis(100));

        let start = tokio::time::Instant::now();
        let creds = WifiCredentials::new("home", "secret").unwrap();
        assert!(link.connect(&creds).await.is_err());
        // 100 ms doubling ten times
        assert_eq!(start.elapsed(), Duration::from_millis(100 * 1023));
    }

    #[tokio::test(start_paused = true)]
    async fn join_succeeds_when_link_comes_up() {
        let wifi = FakeWifi::new();
        let link = WifiLink::new(wifi.clone(), 10, Duration::from_millis(100));
        let creds = WifiCredentials::new("home", "secret").unwrap();
        link.connect(&creds).await.unwrap();
        assert!(link.is_connected());
        assert_eq!(wifi.joined(), Some("home".to_string()));
    }
}

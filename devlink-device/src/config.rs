//! Device configuration, stored as `config.json` in DEVLINK_HOME

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::*;

use crate::error::DeviceError;

/// Tunables for the connectivity core
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// OAuth client id sent with every authorization request
    pub client_id: String,
    /// OAuth scope requested for the device code
    pub scope: String,
    /// Minimum spacing between any two authorization requests
    pub auth_request_interval_ms: u64,
    /// How long GET_TOKEN / CHECK_AUTH wait for the OAuth manager
    pub provisioning_wait_secs: u64,

    /// Management loop tick: auth scheduling, broker health check
    pub health_check_interval_secs: u64,
    pub telemetry_interval_secs: u64,
    /// Wi-Fi or broker down longer than this forces a full teardown
    pub watchdog_threshold_secs: u64,
    /// Management loop silent longer than this restarts the device
    pub stall_threshold_secs: u64,
    /// Consecutive failed connects before a token refresh is tried
    pub refresh_after_failures: u32,
    pub queue_capacity: usize,

    pub client_id_prefix: String,
    pub broker_username: String,
    pub keep_alive_secs: u64,
    /// PEM bundle for the broker TLS link; system roots when unset
    pub ca_bundle: Option<PathBuf>,

    pub ota_attempts: u32,
    pub ota_retry_delay_secs: u64,
    pub ota_timeout_secs: u64,
    pub ota_task_attempts: u32,
    pub ota_task_retry_delay_secs: u64,
    pub ota_progress_interval_secs: u64,
    pub ota_chunk_size: usize,

    pub reboot_grace_ms: u64,

    pub wifi_join_retries: u32,
    pub wifi_join_backoff_ms: u64,

    pub firmware_version: String,
    pub model_code: String,
    pub hw_code: String,
    pub vendor_code: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            client_id: "controller01".to_string(),
            scope: "mqtt-streaming".to_string(),
            auth_request_interval_ms: 3000,
            provisioning_wait_secs: 20,
            health_check_interval_secs: 5,
            telemetry_interval_secs: 10,
            watchdog_threshold_secs: 300,
            stall_threshold_secs: 300,
            refresh_after_failures: 2,
            queue_capacity: 10,
            client_id_prefix: "ESP32#".to_string(),
            broker_username: "device-token".to_string(),
            keep_alive_secs: 15,
            ca_bundle: None,
            ota_attempts: 20,
            ota_retry_delay_secs: 3,
            ota_timeout_secs: 30,
            ota_task_attempts: 5,
            ota_task_retry_delay_secs: 5,
            ota_progress_interval_secs: 3,
            ota_chunk_size: 1024,
            reboot_grace_ms: 1000,
            wifi_join_retries: 10,
            wifi_join_backoff_ms: 100,
            firmware_version: "0.01".to_string(),
            model_code: "mydevice".to_string(),
            hw_code: "1".to_string(),
            vendor_code: "vendor".to_string(),
        }
    }
}

impl DeviceConfig {
    pub fn auth_request_interval(&self) -> Duration {
        Duration::from_millis(self.auth_request_interval_ms)
    }

    pub fn provisioning_wait(&self) -> Duration {
        Duration::from_secs(self.provisioning_wait_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_secs(self.telemetry_interval_secs)
    }

    pub fn watchdog_threshold(&self) -> Duration {
        Duration::from_secs(self.watchdog_threshold_secs)
    }

    pub fn stall_threshold(&self) -> Duration {
        Duration::from_secs(self.stall_threshold_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn ota_retry_delay(&self) -> Duration {
        Duration::from_secs(self.ota_retry_delay_secs)
    }

    pub fn ota_timeout(&self) -> Duration {
        Duration::from_secs(self.ota_timeout_secs)
    }

    pub fn ota_task_retry_delay(&self) -> Duration {
        Duration::from_secs(self.ota_task_retry_delay_secs)
    }

    pub fn ota_progress_interval(&self) -> Duration {
        Duration::from_secs(self.ota_progress_interval_secs)
    }

    pub fn reboot_grace(&self) -> Duration {
        Duration::from_millis(self.reboot_grace_ms)
    }

    pub fn wifi_join_backoff(&self) -> Duration {
        Duration::from_millis(self.wifi_join_backoff_ms)
    }

    /// Load `config.json` from `home`, writing the defaults there when absent
    pub fn load_or_create(home: &Path) -> Result<Self, DeviceError> {
        let path = home.join("config.json");

        if path.exists() {
            let data = fs::read_to_string(&path)
                .map_err(|e| DeviceError::Config(format!("{}: {}", path.display(), e)))?;
            let config = serde_json::from_str(&data)
                .map_err(|e| DeviceError::Config(format!("{}: {}", path.display(), e)))?;
            info!("Loaded config from {}", path.display());
            Ok(config)
        } else {
            let config = Self::default();
            let data = serde_json::to_string_pretty(&config)
                .map_err(|e| DeviceError::Config(e.to_string()))?;
            fs::write(&path, data)
                .map_err(|e| DeviceError::Config(format!("{}: {}", path.display(), e)))?;
            info!("Wrote default config to {}", path.display());
            Ok(config)
        }
    }
}

/// Get DEVLINK_HOME directory, creating it if needed
pub fn devlink_home() -> Result<PathBuf, DeviceError> {
    let home = match std::env::var("DEVLINK_HOME") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => dirs::home_dir()
            .ok_or_else(|| DeviceError::Config("no home directory".to_string()))?
            .join(".devlink"),
    };

    if !home.exists() {
        fs::create_dir_all(&home)
            .map_err(|e| DeviceError::Config(format!("{}: {}", home.display(), e)))?;
    }

    Ok(home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let config: DeviceConfig = serde_json::from_str(r#"{"queue_capacity": 4}"#).unwrap();
        assert_eq!(config.queue_capacity, 4);
        assert_eq!(config.client_id, "controller01");
        assert_eq!(config.health_check_interval(), Duration::from_secs(5));
    }
}

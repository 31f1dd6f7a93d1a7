//! Device identity - chip id and version strings reported during pairing

use data_encoding::HEXUPPER;
use devlink_mcu::{NVS_NAMESPACE, keys};
use log::*;
use rand::RngCore;

use crate::config::DeviceConfig;
use crate::error::StorageError;
use crate::store::Preferences;

/// Immutable per-boot identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub mac: [u8; 6],
    pub model_code: String,
    pub hw_code: String,
    pub firmware_version: String,
    pub vendor_code: String,
}

impl DeviceIdentity {
    pub fn new(mac: [u8; 6], config: &DeviceConfig) -> Self {
        Self {
            mac,
            model_code: config.model_code.clone(),
            hw_code: config.hw_code.clone(),
            firmware_version: config.firmware_version.clone(),
            vendor_code: config.vendor_code.clone(),
        }
    }

    /// MAC as twelve upper-case hex digits; used in topics and the client id
    pub fn chip_id(&self) -> String {
        HEXUPPER.encode(&self.mac)
    }

    /// MAC in `AA:BB:CC:DD:EE:FF` form
    pub fn mac_address(&self) -> String {
        self.mac
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":")
    }
}

/// Load the stored MAC, or mint a locally administered one
///
/// Hosts have no burned-in MAC to use as a chip id, so one is generated on
/// first boot and kept in storage.
pub fn load_or_create_mac(prefs: &Preferences) -> Result<[u8; 6], StorageError> {
    if let Some(hex) = prefs.get(NVS_NAMESPACE, keys::MAC)? {
        if let Ok(bytes) = HEXUPPER.decode(hex.as_bytes()) {
            if let Ok(mac) = <[u8; 6]>::try_from(bytes.as_slice()) {
                return Ok(mac);
            }
        }
        warn!("Stored MAC {:?} is invalid, generating a new one", hex);
    }

    let mut mac = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut mac);
    // locally administered, unicast
    mac[0] = (mac[0] | 0x02) & 0xfe;

    prefs.set(NVS_NAMESPACE, keys::MAC, &HEXUPPER.encode(&mac))?;
    info!("Created new MAC: {}", HEXUPPER.encode(&mac));
    Ok(mac)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStorage;

    #[test]
    fn chip_id_is_upper_hex_mac() {
        let id = DeviceIdentity::new([0x24, 0x6f, 0x28, 0x0a, 0xb1, 0xc2], &DeviceConfig::default());
        assert_eq!(id.chip_id(), "246F280AB1C2");
        assert_eq!(id.mac_address(), "24:6F:28:0A:B1:C2");
    }

    #[test]
    fn generated_mac_is_stable() {
        let prefs = Preferences::new(MemoryStorage::new());
        let first = load_or_create_mac(&prefs).unwrap();
        assert_eq!(first[0] & 0x03, 0x02);
        assert_eq!(load_or_create_mac(&prefs).unwrap(), first);
    }
}

//! Wall-clock snapshot so time survives a reboot without network time

use std::time::Duration;

use devlink_mcu::{TIME_NAMESPACE, keys};
use log::*;

use crate::error::StorageError;
use crate::store::Preferences;

/// Remember that `unix_time` was current at `uptime`
pub fn save_snapshot(prefs: &Preferences, unix_time: u64, uptime: Duration) -> Result<(), StorageError> {
    prefs.set(TIME_NAMESPACE, keys::SAVED_TIME, &unix_time.to_string())?;
    prefs.set(TIME_NAMESPACE, keys::RTC_OFFSET, &uptime.as_secs().to_string())?;
    debug!("Saved time snapshot {} at uptime {}s", unix_time, uptime.as_secs());
    Ok(())
}

/// Estimate the current unix time from the snapshot and `uptime`
///
/// `None` when no usable snapshot exists, including one taken during an
/// earlier boot that ran longer than this one has so far.
pub fn restore_time(prefs: &Preferences, uptime: Duration) -> Result<Option<u64>, StorageError> {
    let read = |key: &str| -> Result<u64, StorageError> {
        Ok(prefs.get_string(TIME_NAMESPACE, key)?.parse().unwrap_or(0))
    };
    let saved_time = read(keys::SAVED_TIME)?;
    let offset = read(keys::RTC_OFFSET)?;

    if saved_time == 0 || offset == 0 {
        info!("No valid time snapshot");
        return Ok(None);
    }

    let Some(elapsed) = uptime.as_secs().checked_sub(offset) else {
        return Ok(None);
    };
    Ok(Some(saved_time + elapsed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStorage;

    #[test]
    fn snapshot_plus_uptime() {
        let prefs = Preferences::new(MemoryStorage::new());
        assert_eq!(restore_time(&prefs, Duration::from_secs(10)).unwrap(), None);

        save_snapshot(&prefs, 1_700_000_000, Duration::from_secs(20)).unwrap();
        assert_eq!(restore_time(&prefs, Duration::from_secs(80)).unwrap(), Some(1_700_000_060));
        assert_eq!(restore_time(&prefs, Duration::from_secs(5)).unwrap(), None);
    }

    #[test]
    fn zero_offset_is_unusable() {
        let prefs = Preferences::new(MemoryStorage::new());
        save_snapshot(&prefs, 1_700_000_000, Duration::ZERO).unwrap();
        assert_eq!(restore_time(&prefs, Duration::from_secs(30)).unwrap(), None);
    }
}

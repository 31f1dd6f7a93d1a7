//! Firmware write path
//!
//! The partition an update is streamed into. On ESP32 this wraps the
//! `esp_ota_*` calls; on a host it is a file.

/// Trait for the flash region receiving a firmware image
pub trait FirmwareTarget {
    /// Error type for flash operations
    type Error: core::fmt::Display;

    /// Reserve room for an image of `total_len` bytes
    ///
    /// Fails when the partition is too small.
    fn begin(&mut self, total_len: u64) -> Result<(), Self::Error>;

    /// Append a chunk, returning how many bytes were actually written
    fn write(&mut self, chunk: &[u8]) -> Result<usize, Self::Error>;

    /// Validate the written image and mark it bootable
    ///
    /// `sha256` is checked against the written bytes when given.
    fn finalize(&mut self, sha256: Option<&[u8; 32]>) -> Result<(), Self::Error>;

    /// Drop a partially written image
    fn abort(&mut self);
}

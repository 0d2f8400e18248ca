//! Block device interface.

use crate::param::SECTOR_SIZE;

/// A device addressed in 512-byte sectors. Two devices play named roles in
/// the system: the file-system device and the swap device.
///
/// Sector I/O is assumed infallible at this layer; a device that cannot
/// complete a transfer must panic rather than return.
pub trait BlockDevice: Send + Sync {
    /// Number of sectors on the device.
    fn nsectors(&self) -> u32;

    /// Reads `sector` into `buf`.
    fn read(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]);

    /// Writes `buf` to `sector`.
    fn write(&self, sector: u32, buf: &[u8; SECTOR_SIZE]);
}

//! Store configuration.
//!
//! All process-wide knobs (storage device candidates, slot offsets,
//! extension size, lockfile location) are explicit values passed into
//! [`BootStore::open`](crate::BootStore::open) rather than hidden globals.

use crate::error::{Result, StoreError};
use crate::layout::{self, SECTOR_SIZE};
use std::path::PathBuf;

/// Default storage device candidate: the eMMC boot-1 hardware partition.
pub const DEFAULT_STORAGE_DEVICE: &str = "/dev/mmcblk0boot1";

/// Default runtime directory holding the session lockfile.
pub const DEFAULT_LOCK_DIR: &str = "/run/bootvar";

/// Configuration for a boot variable store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Candidate storage device paths, tried in order; the first that
    /// exists is used.
    pub device_candidates: Vec<PathBuf>,
    /// Byte offset of slot A on the device. Must be sector-aligned.
    pub offset_a: u64,
    /// Byte offset of slot B. `None` places B directly after A; on storage
    /// where both would then share an erase block, set it explicitly.
    pub offset_b: Option<u64>,
    /// Extension sector count per slot (1..=1023).
    pub extension_sectors: u16,
    /// Runtime directory for the lockfile; created mode 02770 if missing.
    pub lock_dir: PathBuf,
    /// Group owner for the lock directory when it has to be created.
    pub lock_gid: Option<u32>,
    /// Also verify the header-sector CRC when validating slots on load.
    /// The extension CRC is always verified; stores written by older tools
    /// carry a header CRC but were never checked against it.
    pub verify_header_crc: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            device_candidates: vec![PathBuf::from(DEFAULT_STORAGE_DEVICE)],
            offset_a: 0,
            offset_b: None,
            extension_sectors: layout::DEFAULT_EXTENSION_SECTORS,
            lock_dir: PathBuf::from(DEFAULT_LOCK_DIR),
            lock_gid: None,
            verify_header_crc: false,
        }
    }
}

impl StoreConfig {
    /// Total slot length in bytes: header sector plus extension area.
    #[must_use]
    pub fn slot_len(&self) -> u64 {
        (1 + u64::from(self.extension_sectors)) * SECTOR_SIZE as u64
    }

    /// Effective byte offset of slot B.
    #[must_use]
    pub fn offset_b(&self) -> u64 {
        self.offset_b.unwrap_or(self.offset_a + self.slot_len())
    }

    /// Variable-area capacity in bytes for this geometry.
    #[must_use]
    pub fn varspace(&self) -> usize {
        layout::varspace(self.extension_sectors)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.extension_sectors == 0 || self.extension_sectors > layout::MAX_EXTENSION_SECTORS {
            return Err(StoreError::InvalidArgument(
                "extension sector count out of range",
            ));
        }
        if self.offset_a % SECTOR_SIZE as u64 != 0 || self.offset_b() % SECTOR_SIZE as u64 != 0 {
            return Err(StoreError::InvalidArgument(
                "slot offsets must be sector-aligned",
            ));
        }
        let (a, b) = (self.offset_a, self.offset_b());
        let len = self.slot_len();
        let disjoint = a + len <= b || b + len <= a;
        if !disjoint {
            return Err(StoreError::InvalidArgument("slot ranges overlap"));
        }
        Ok(())
    }
}

/// Flags controlling [`BootStore::open`](crate::BootStore::open).
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenOptions {
    /// Open for reading only; takes a shared session lock.
    pub read_only: bool,
    /// Re-initialize the on-device structures even if a valid store is
    /// present. Incompatible with `read_only`.
    pub force_init: bool,
}

impl OpenOptions {
    /// Read-only open.
    #[must_use]
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            force_init: false,
        }
    }
}

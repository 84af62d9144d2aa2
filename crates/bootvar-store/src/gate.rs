//! Write-enable gating for eMMC boot partitions.
//!
//! Boot hardware partitions power up soft read-only; the kernel exposes the
//! switch as `/sys/block/<dev>/force_ro` alongside the current state in
//! `/sys/block/<dev>/ro`. A write session flips the switch before opening
//! the device and restores it on close. Absence of the sysfs files (regular
//! file "devices" in tests, non-eMMC storage) makes the gate a no-op.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Soft read-only toggle for a storage device.
pub trait WriteGate {
    /// Request the device be writeable (`true`) or read-only (`false`).
    ///
    /// Returns `true` when the device state actually changed, so the caller
    /// knows whether it owes a reversal on close. Failure is reported but
    /// not fatal here; a write session surfaces it when the subsequent
    /// read-write open of the device fails.
    fn set_writeable(&mut self, writeable: bool) -> bool;
}

/// Gate over the kernel's per-device `ro`/`force_ro` attributes.
#[derive(Debug)]
pub struct SysfsWriteGate {
    ro_path: PathBuf,
    force_ro_path: PathBuf,
}

impl SysfsWriteGate {
    /// Gate for `device`, e.g. `/dev/mmcblk0boot1` maps to
    /// `/sys/block/mmcblk0boot1/{ro,force_ro}`.
    #[must_use]
    pub fn for_device(device: &Path) -> Self {
        Self::with_sysfs_root(device, Path::new("/sys/block"))
    }

    /// Gate with an alternate sysfs root, for tests.
    #[must_use]
    pub fn with_sysfs_root(device: &Path, sysfs_block: &Path) -> Self {
        let name = device.file_name().unwrap_or_default();
        let dir = sysfs_block.join(name);
        Self {
            ro_path: dir.join("ro"),
            force_ro_path: dir.join("force_ro"),
        }
    }
}

impl WriteGate for SysfsWriteGate {
    fn set_writeable(&mut self, writeable: bool) -> bool {
        let state = match fs::read(&self.ro_path) {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        let is_writeable = state.first() == Some(&b'0');
        if is_writeable == writeable {
            return false;
        }
        debug!(
            target: "bootvar::gate",
            event = "toggle",
            writeable = writeable,
            path = %self.force_ro_path.display()
        );
        if let Err(err) = fs::write(&self.force_ro_path, if writeable { "0" } else { "1" }) {
            warn!(
                target: "bootvar::gate",
                event = "toggle_failed",
                error = %err,
                "could not change boot device write status"
            );
        }
        true
    }
}

/// Gate that never touches anything; used for in-memory devices.
#[derive(Debug, Default)]
pub struct NoopWriteGate;

impl WriteGate for NoopWriteGate {
    fn set_writeable(&mut self, _writeable: bool) -> bool {
        false
    }
}

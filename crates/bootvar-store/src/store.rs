//! Store sessions: open, mutate, persist, close.
//!
//! A [`BootStore`] is a stateful session over the two on-device slots. It
//! reads both slots at open, selects the newer valid one, and keeps the
//! header and variable table in memory; mutations touch only that state
//! until [`BootStore::update`] persists them.
//!
//! # Invariants
//!
//! - `update` writes the slot that is *not* current, with the serial
//!   incremented mod 256, then adopts it as current. The previously
//!   current slot is never modified, so a crash at any point during an
//!   update leaves the store recoverable from the previous slot.
//! - Within an update, the header sector is written before the extension
//!   area, and both are flushed before success is reported.
//! - The session lock, write gate, and device are released in reverse
//!   acquisition order on every exit path, including failures during
//!   re-initialization. A write session never leaves the device's soft
//!   read-only switch in the opposite of its entry state.

use crate::config::{OpenOptions, StoreConfig};
use crate::device::{ByteDevice, FileByteDevice};
use crate::error::{Result, StoreError};
use crate::gate::{NoopWriteGate, SysfsWriteGate, WriteGate};
use crate::layout::{self, SlotHeader, FLAG_BOOT_IN_PROGRESS, HEADER_SIZE, SECTOR_SIZE};
use crate::lock::SessionLock;
use crate::vars::VarStore;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Open session against a boot variable store.
///
/// Dropping the session reverts the write gate (when this session changed
/// it), closes the device, then releases the session lock.
pub struct BootStore {
    config: StoreConfig,
    device: Box<dyn ByteDevice>,
    gate: Box<dyn WriteGate>,
    gate_changed: bool,
    read_only: bool,
    current: Option<usize>,
    header: SlotHeader,
    vars: VarStore,
    _lock: SessionLock,
}

impl BootStore {
    /// Open a session on the configured storage device.
    ///
    /// Read-only sessions take a shared lock and fail with
    /// [`StoreError::NoValidStore`] when neither slot validates. Write
    /// sessions take an exclusive lock, enable the write gate, and
    /// re-initialize the store when no slot validates or
    /// [`OpenOptions::force_init`] is set.
    pub fn open(config: &StoreConfig, opts: OpenOptions) -> Result<Self> {
        check_opts(opts)?;
        config.validate()?;
        let path = discover_device(config)?;

        let lock = SessionLock::acquire(&config.lock_dir, config.lock_gid, !opts.read_only)?;
        let mut gate: Box<dyn WriteGate> = Box::new(SysfsWriteGate::for_device(&path));
        let mut gate_changed = false;
        if !opts.read_only {
            gate_changed = gate.set_writeable(true);
        }

        let device: Box<dyn ByteDevice> = if opts.read_only {
            Box::new(FileByteDevice::open_read_only(&path)?)
        } else {
            match FileByteDevice::open_read_write(&path) {
                Ok(dev) => Box::new(dev),
                Err(err) => {
                    if gate_changed {
                        gate.set_writeable(false);
                    }
                    return Err(err);
                }
            }
        };

        Self::finish_open(config.clone(), opts, device, gate, gate_changed, lock)
    }

    /// Open a session over caller-supplied device and gate capabilities.
    ///
    /// This is the seam that lets tests run the full session lifecycle
    /// against an in-memory device; the lockfile still comes from
    /// `config.lock_dir`.
    pub fn open_with(
        config: &StoreConfig,
        opts: OpenOptions,
        device: Box<dyn ByteDevice>,
        mut gate: Box<dyn WriteGate>,
    ) -> Result<Self> {
        check_opts(opts)?;
        config.validate()?;
        let lock = SessionLock::acquire(&config.lock_dir, config.lock_gid, !opts.read_only)?;
        let gate_changed = if opts.read_only {
            false
        } else {
            gate.set_writeable(true)
        };
        Self::finish_open(config.clone(), opts, device, gate, gate_changed, lock)
    }

    fn finish_open(
        config: StoreConfig,
        opts: OpenOptions,
        device: Box<dyn ByteDevice>,
        gate: Box<dyn WriteGate>,
        gate_changed: bool,
        lock: SessionLock,
    ) -> Result<Self> {
        let ext = config.extension_sectors;
        let capacity = config.varspace();
        let mut store = Self {
            config,
            device,
            gate,
            gate_changed,
            read_only: opts.read_only,
            current: None,
            header: SlotHeader::new(0, 0, 0, ext),
            vars: VarStore::new(capacity),
            _lock: lock,
        };

        let parse_failed = store.load_and_select()?;

        if opts.read_only {
            if store.current.is_none() {
                return Err(StoreError::NoValidStore);
            }
            return Ok(store);
        }

        if store.current.is_none() || opts.force_init {
            // Re-initialization proceeds even when the variable area did
            // not parse; whatever parsed cleanly feeds the preserved set.
            store.reinitialize()?;
        } else if parse_failed {
            store.degrade_to_read_only();
        }
        Ok(store)
    }

    /// Read both slots, pick the current one, and parse its variables.
    ///
    /// Returns whether variable parsing failed; the caller decides what
    /// that means for the session.
    fn load_and_select(&mut self) -> Result<bool> {
        let ext = self.config.extension_sectors;
        let offsets = [self.config.offset_a, self.config.offset_b()];
        let mut valid = [false; 2];
        let mut sernum = [0_u8; 2];
        let mut images: [Option<Vec<u8>>; 2] = [None, None];

        for slot in 0..2 {
            let mut image = vec![0_u8; layout::slot_len(ext)];
            if self
                .device
                .read_exact_at(offsets[slot], &mut image[..SECTOR_SIZE])
                .is_err()
            {
                continue;
            }
            let Ok(header) = layout::decode_header(&image) else {
                continue;
            };
            if !header.matches_format(ext) {
                continue;
            }
            if self
                .device
                .read_exact_at(offsets[slot] + SECTOR_SIZE as u64, &mut image[SECTOR_SIZE..])
                .is_err()
            {
                continue;
            }
            if layout::validate_slot(&image, ext, self.config.verify_header_crc).is_none() {
                continue;
            }
            valid[slot] = true;
            sernum[slot] = header.sernum;
            images[slot] = Some(image);
        }

        self.current = layout::select_current(valid, sernum);
        debug!(
            target: "bootvar::store",
            event = "selected",
            valid_a = valid[0],
            valid_b = valid[1],
            sernum_a = sernum[0],
            sernum_b = sernum[1],
            current = ?self.current
        );

        let Some(current) = self.current else {
            return Ok(false);
        };
        let image = images[current]
            .take()
            .ok_or(StoreError::Internal("selected slot has no image"))?;
        self.header = layout::decode_header(&image)?;

        let area = &image[HEADER_SIZE..image.len() - layout::CRC_TRAILER_SIZE];
        match VarStore::parse(area, self.config.varspace()) {
            Ok(vars) => {
                self.vars = vars;
                Ok(false)
            }
            Err(err) => {
                // The slot stays valid; the session just loses write access.
                warn!(
                    target: "bootvar::store",
                    event = "parse_failed",
                    error = %err
                );
                Ok(true)
            }
        }
    }

    fn degrade_to_read_only(&mut self) {
        if self.gate_changed {
            self.gate.set_writeable(false);
            self.gate_changed = false;
        }
        self.read_only = true;
    }

    /// Zero both slots and persist a fresh store, carrying over
    /// underscore-prefixed variables from the previous contents.
    fn reinitialize(&mut self) -> Result<()> {
        debug!(target: "bootvar::store", event = "reinitialize");
        let preserved = self.vars.preserved();

        let ext = self.config.extension_sectors;
        let zeroes = vec![0_u8; layout::slot_len(ext)];
        for offset in [self.config.offset_a, self.config.offset_b()] {
            self.device.write_all_at(offset, &zeroes[..SECTOR_SIZE])?;
            self.device
                .write_all_at(offset + SECTOR_SIZE as u64, &zeroes[SECTOR_SIZE..])?;
        }
        self.device.sync()?;

        self.current = None;
        self.header = SlotHeader::new(0, 0, 0, ext);
        self.vars = preserved;
        self.update()
    }

    /// Persist the in-memory state to the non-current slot.
    ///
    /// On success the destination becomes the current slot. On failure the
    /// previously current slot is untouched and stays authoritative; the
    /// destination may be torn and will fail validation on the next open.
    pub fn update(&mut self) -> Result<()> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        let ext = self.config.extension_sectors;
        let dest = self.current.map_or(0, |cur| 1 - cur);
        let offset = [self.config.offset_a, self.config.offset_b()][dest];

        let mut image = vec![0_u8; layout::slot_len(ext)];
        self.vars
            .serialize_into(&mut image[HEADER_SIZE..layout::slot_len(ext) - layout::CRC_TRAILER_SIZE])?;
        let mut header = SlotHeader::new(
            self.header.flags,
            self.header.failed_boots,
            self.header.sernum.wrapping_add(1),
            ext,
        );
        layout::finalize_slot(&mut image, &mut header);

        self.device.write_all_at(offset, &image[..SECTOR_SIZE])?;
        self.device
            .write_all_at(offset + SECTOR_SIZE as u64, &image[SECTOR_SIZE..])?;
        self.device.sync()?;

        debug!(
            target: "bootvar::store",
            event = "updated",
            slot = dest,
            sernum = header.sernum,
            vars = self.vars.len()
        );
        self.current = Some(dest);
        self.header = header;
        Ok(())
    }

    /// Record that a boot has started.
    ///
    /// If a boot was already in progress (started but never confirmed),
    /// counts it as a failure, saturating at 255. Persists, and returns
    /// the failed-boot count as of this attempt.
    pub fn mark_in_progress(&mut self) -> Result<u8> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        let prev = self.header;
        if self.header.boot_in_progress() {
            self.header.failed_boots = self.header.failed_boots.saturating_add(1);
        } else {
            self.header.flags |= FLAG_BOOT_IN_PROGRESS;
        }
        let count = self.header.failed_boots;
        if let Err(err) = self.update() {
            self.header = prev;
            return Err(err);
        }
        Ok(count)
    }

    /// Record a confirmed successful boot: clears the in-progress flag and
    /// the failure counter. Persists, and returns the count of failures
    /// recorded before the reset.
    pub fn mark_successful(&mut self) -> Result<u8> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        let prev = self.header;
        let count = self.header.failed_boots;
        self.header.flags &= !FLAG_BOOT_IN_PROGRESS;
        self.header.failed_boots = 0;
        if let Err(err) = self.update() {
            self.header = prev;
            return Err(err);
        }
        Ok(count)
    }

    /// Whether a boot is currently marked in progress.
    #[must_use]
    pub fn is_in_progress(&self) -> bool {
        self.header.boot_in_progress()
    }

    /// Consecutive unconfirmed boot attempts recorded so far.
    #[must_use]
    pub fn failed_boot_count(&self) -> u8 {
        self.header.failed_boots
    }

    /// On-disk format version of the loaded store.
    #[must_use]
    pub fn devinfo_version(&self) -> u16 {
        self.header.version
    }

    /// Extension sector count advertised by the loaded store.
    #[must_use]
    pub fn extension_sectors(&self) -> u16 {
        self.header.ext_sectors
    }

    /// Whether this session can persist changes.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Look up a variable.
    pub fn get(&self, name: &str) -> Result<&str> {
        self.vars
            .get(name)
            .ok_or_else(|| StoreError::NotFound(name.to_owned()))
    }

    /// Iterate variables in store order.
    pub fn vars(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter()
    }

    /// Set, update, or delete (empty value) a variable in memory.
    ///
    /// Takes effect on disk at the next [`BootStore::update`].
    pub fn set(&mut self, name: &str, value: &str) -> Result<()> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        self.vars.set(name, value)
    }

    /// Close the session, releasing gate, device, and lock.
    pub fn close(self) {}
}

impl Drop for BootStore {
    fn drop(&mut self) {
        if self.gate_changed {
            self.gate.set_writeable(false);
            self.gate_changed = false;
        }
    }
}

impl std::fmt::Debug for BootStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootStore")
            .field("read_only", &self.read_only)
            .field("current", &self.current)
            .field("header", &self.header)
            .field("vars", &self.vars.len())
            .finish_non_exhaustive()
    }
}

fn check_opts(opts: OpenOptions) -> Result<()> {
    if opts.read_only && opts.force_init {
        return Err(StoreError::InvalidArgument(
            "read-only and force-init are mutually exclusive",
        ));
    }
    Ok(())
}

fn discover_device(config: &StoreConfig) -> Result<PathBuf> {
    config
        .device_candidates
        .iter()
        .find(|path| path.exists())
        .cloned()
        .ok_or(StoreError::NoDevice)
}

/// Open a session over an in-memory device with a no-op gate.
///
/// Convenience for tests and tooling that operate on an image rather than
/// real storage.
pub fn open_in_memory(
    config: &StoreConfig,
    opts: OpenOptions,
    device: crate::device::MemDevice,
) -> Result<BootStore> {
    BootStore::open_with(config, opts, Box::new(device), Box::new(NoopWriteGate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;

    fn test_config(lock_dir: &std::path::Path) -> StoreConfig {
        StoreConfig {
            extension_sectors: 1,
            lock_dir: lock_dir.to_path_buf(),
            ..StoreConfig::default()
        }
    }

    fn fresh_store(config: &StoreConfig) -> MemDevice {
        let dev = MemDevice::new(2 * layout::slot_len(config.extension_sectors));
        let store = open_in_memory(config, OpenOptions::default(), dev.clone()).unwrap();
        store.close();
        dev
    }

    #[test]
    fn conflicting_open_flags_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let dev = MemDevice::new(2 * layout::slot_len(1));
        let opts = OpenOptions {
            read_only: true,
            force_init: true,
        };
        assert!(matches!(
            open_in_memory(&config, opts, dev),
            Err(StoreError::InvalidArgument(_))
        ));
    }

    #[test]
    fn write_open_initializes_blank_device() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let dev = MemDevice::new(2 * layout::slot_len(1));

        let store = open_in_memory(&config, OpenOptions::default(), dev.clone()).unwrap();
        assert!(!store.is_in_progress());
        assert_eq!(store.failed_boot_count(), 0);
        assert_eq!(store.devinfo_version(), layout::VERSION_CURRENT);
        store.close();

        // First persist lands in slot 0 with serial 1.
        let image = dev.contents().unwrap();
        let header = layout::validate_slot(&image[..layout::slot_len(1)], 1, true).unwrap();
        assert_eq!(header.sernum, 1);
    }

    #[test]
    fn read_only_open_on_blank_device_reports_no_store() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let dev = MemDevice::new(2 * layout::slot_len(1));
        assert!(matches!(
            open_in_memory(&config, OpenOptions::read_only(), dev),
            Err(StoreError::NoValidStore)
        ));
    }

    #[test]
    fn set_persists_across_sessions() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let dev = fresh_store(&config);

        let mut store = open_in_memory(&config, OpenOptions::default(), dev.clone()).unwrap();
        store.set("foo", "bar").unwrap();
        store.update().unwrap();
        store.close();

        let store = open_in_memory(&config, OpenOptions::read_only(), dev).unwrap();
        assert_eq!(store.get("foo").unwrap(), "bar");
    }

    #[test]
    fn successive_updates_alternate_slots() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let dev = fresh_store(&config);
        let slot = layout::slot_len(1);

        let mut store = open_in_memory(&config, OpenOptions::default(), dev.clone()).unwrap();
        store.set("a", "1").unwrap();
        store.update().unwrap(); // slot 1, serial 2
        store.set("b", "2").unwrap();
        store.update().unwrap(); // slot 0, serial 3
        store.close();

        let image = dev.contents().unwrap();
        let h0 = layout::validate_slot(&image[..slot], 1, false).unwrap();
        let h1 = layout::validate_slot(&image[slot..], 1, false).unwrap();
        assert_eq!(h1.sernum, 2);
        assert_eq!(h0.sernum, 3);
    }

    #[test]
    fn failed_update_does_not_touch_current_slot() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let dev = fresh_store(&config);
        let slot = layout::slot_len(1);
        let before = dev.contents().unwrap();

        // Device truncated to one slot: writing the destination (slot 1)
        // fails, the current slot (slot 0) must be untouched.
        let short = MemDevice::new(slot);
        short.write_all_at(0, &before[..slot]).unwrap();
        let mut store = open_in_memory(&config, OpenOptions::default(), short.clone()).unwrap();
        store.set("x", "y").unwrap();
        assert!(store.update().is_err());
        drop(store);

        assert_eq!(short.contents().unwrap(), &before[..slot]);
    }

    #[test]
    fn boot_state_machine() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let dev = fresh_store(&config);

        let mut store = open_in_memory(&config, OpenOptions::default(), dev.clone()).unwrap();
        assert_eq!(store.mark_in_progress().unwrap(), 0);
        assert!(store.is_in_progress());
        assert_eq!(store.mark_in_progress().unwrap(), 1);
        assert_eq!(store.mark_in_progress().unwrap(), 2);

        assert_eq!(store.mark_successful().unwrap(), 2);
        assert!(!store.is_in_progress());
        assert_eq!(store.failed_boot_count(), 0);
    }

    #[test]
    fn failed_boots_saturate() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let dev = fresh_store(&config);

        let mut store = open_in_memory(&config, OpenOptions::default(), dev).unwrap();
        store.mark_in_progress().unwrap();
        for _ in 0..300 {
            store.mark_in_progress().unwrap();
        }
        assert_eq!(store.failed_boot_count(), 255);
    }

    #[test]
    fn force_init_preserves_underscore_variables() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let dev = fresh_store(&config);

        let mut store = open_in_memory(&config, OpenOptions::default(), dev.clone()).unwrap();
        store.set("_keep", "1").unwrap();
        store.set("drop", "2").unwrap();
        store.update().unwrap();
        store.close();

        let opts = OpenOptions {
            read_only: false,
            force_init: true,
        };
        let store = open_in_memory(&config, opts, dev.clone()).unwrap();
        store.close();

        let store = open_in_memory(&config, OpenOptions::read_only(), dev).unwrap();
        assert_eq!(store.get("_keep").unwrap(), "1");
        assert!(matches!(store.get("drop"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn corrupt_current_slot_recovers_from_other() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let dev = fresh_store(&config);
        let slot = layout::slot_len(1);

        let mut store = open_in_memory(&config, OpenOptions::default(), dev.clone()).unwrap();
        store.set("stable", "yes").unwrap();
        store.update().unwrap(); // slot 1 now current
        store.set("newer", "lost").unwrap();
        store.update().unwrap(); // slot 0 now current
        store.close();

        // Zero the current slot's header sector; the store falls back to
        // slot 1, which predates "newer".
        dev.fill(0, SECTOR_SIZE, 0).unwrap();
        let store = open_in_memory(&config, OpenOptions::read_only(), dev.clone()).unwrap();
        assert_eq!(store.get("stable").unwrap(), "yes");
        assert!(store.get("newer").is_err());
        store.close();

        // A write session then reuses the zeroed slot as its destination.
        let mut store = open_in_memory(&config, OpenOptions::default(), dev.clone()).unwrap();
        store.set("x", "y").unwrap();
        store.update().unwrap();
        store.close();
        let image = dev.contents().unwrap();
        let h0 = layout::validate_slot(&image[..slot], 1, false).unwrap();
        let h1 = layout::validate_slot(&image[slot..], 1, false).unwrap();
        assert_eq!(h0.sernum, h1.sernum.wrapping_add(1));
    }

    #[test]
    fn undecodable_variable_area_degrades_write_session() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let dev = MemDevice::new(2 * layout::slot_len(1));

        // Hand-build a slot whose CRCs check out but whose variable area
        // is not text: name bytes 0xFF 0xFE, then a terminated value.
        let mut image = vec![0_u8; layout::slot_len(1)];
        image[HEADER_SIZE..HEADER_SIZE + 6].copy_from_slice(&[0xFF, 0xFE, 0, b'x', 0, 0]);
        let mut header = SlotHeader::new(0, 0, 1, 1);
        layout::finalize_slot(&mut image, &mut header);
        dev.write_all_at(0, &image).unwrap();

        let mut store = open_in_memory(&config, OpenOptions::default(), dev.clone()).unwrap();
        assert!(store.is_read_only());
        assert!(matches!(store.set("a", "b"), Err(StoreError::ReadOnly)));
        store.close();

        // Force-init still works on the degraded store and clears it.
        let opts = OpenOptions {
            read_only: false,
            force_init: true,
        };
        let mut store = open_in_memory(&config, opts, dev).unwrap();
        assert!(!store.is_read_only());
        store.set("a", "b").unwrap();
        store.update().unwrap();
    }

    #[test]
    fn read_only_session_rejects_mutation() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let dev = fresh_store(&config);

        let mut store = open_in_memory(&config, OpenOptions::read_only(), dev).unwrap();
        assert!(matches!(store.set("a", "b"), Err(StoreError::ReadOnly)));
        assert!(matches!(store.update(), Err(StoreError::ReadOnly)));
        assert!(matches!(
            store.mark_in_progress(),
            Err(StoreError::ReadOnly)
        ));
        assert!(matches!(store.mark_successful(), Err(StoreError::ReadOnly)));
    }

    #[test]
    fn sernum_wraps_around() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let dev = fresh_store(&config);
        let slot = layout::slot_len(1);

        // Force the current slot's serial to 255 by rewriting it.
        let mut store = open_in_memory(&config, OpenOptions::default(), dev.clone()).unwrap();
        for _ in 0..254 {
            store.update().unwrap();
        }
        store.close();

        let image = dev.contents().unwrap();
        let h0 = layout::validate_slot(&image[..slot], 1, false);
        let h1 = layout::validate_slot(&image[slot..], 1, false);
        let serials: Vec<u8> = [h0, h1].iter().flatten().map(|h| h.sernum).collect();
        assert!(serials.contains(&255));

        // The next update wraps to 0, and selection prefers it.
        let mut store = open_in_memory(&config, OpenOptions::default(), dev.clone()).unwrap();
        store.set("wrapped", "yes").unwrap();
        store.update().unwrap();
        store.close();

        let store = open_in_memory(&config, OpenOptions::read_only(), dev).unwrap();
        assert_eq!(store.get("wrapped").unwrap(), "yes");
    }
}

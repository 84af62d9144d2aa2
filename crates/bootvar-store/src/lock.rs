//! Exclusive-access session locking.
//!
//! Sessions serialize through an advisory lock on a file under a
//! tmpfs-style runtime directory: shared for readers, exclusive for
//! writers. The lock is held for the whole session, including across
//! re-initialization, and released when the [`SessionLock`] drops.

use crate::error::{Result, StoreError};
use fs2::FileExt;
use std::fs::{self, OpenOptions};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;
use tracing::debug;

/// Name of the lockfile inside the runtime directory.
pub const LOCKFILE_NAME: &str = "lockfile";

const LOCK_DIR_MODE: u32 = 0o2770;
const LOCKFILE_MODE: u32 = 0o770;

/// Held advisory lock on the store's lockfile.
///
/// Dropping the value releases the lock.
#[derive(Debug)]
pub struct SessionLock {
    file: fs::File,
    exclusive: bool,
}

impl SessionLock {
    /// Acquire the session lock, creating the runtime directory and
    /// lockfile as needed. Blocks until the lock is granted.
    pub fn acquire(dir: &Path, gid: Option<u32>, exclusive: bool) -> Result<Self> {
        if !dir.exists() {
            fs::create_dir_all(dir).map_err(StoreError::Lock)?;
            fs::set_permissions(dir, fs::Permissions::from_mode(LOCK_DIR_MODE))
                .map_err(StoreError::Lock)?;
            if gid.is_some() {
                std::os::unix::fs::chown(dir, None, gid).map_err(StoreError::Lock)?;
            }
        }
        let path = dir.join(LOCKFILE_NAME);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(LOCKFILE_MODE)
            .open(&path)
            .map_err(StoreError::Lock)?;
        if exclusive {
            file.lock_exclusive().map_err(StoreError::Lock)?;
        } else {
            file.lock_shared().map_err(StoreError::Lock)?;
        }
        debug!(
            target: "bootvar::lock",
            event = "acquired",
            exclusive = exclusive,
            path = %path.display()
        );
        Ok(Self { file, exclusive })
    }

    /// Whether this is an exclusive (write-session) lock.
    #[must_use]
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        // Released on close anyway; unlock explicitly so the ordering is
        // deterministic relative to the gate reversal.
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

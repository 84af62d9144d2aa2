//! Raw block I/O.
//!
//! Positional reads and writes of fixed-size byte ranges at absolute
//! offsets, with no filesystem in between. The [`ByteDevice`] trait is the
//! seam that lets the slot machinery run against an in-memory device in
//! tests; production I/O goes through [`FileByteDevice`], which opens the
//! raw device with synchronous-write semantics.

use crate::error::{Result, StoreError};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::trace;

/// Byte-addressed device with pread/pwrite semantics.
pub trait ByteDevice {
    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all of `buf` at `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Durability barrier: block until previously written data is on media.
    fn sync(&self) -> Result<()>;
}

/// File-backed device over `pread`/`pwrite`.
///
/// Write-mode opens use `O_DSYNC` so every write carries its own durability
/// barrier, matching the store's crash-consistency contract; an explicit
/// [`ByteDevice::sync`] is still issued after each full-slot write.
#[derive(Debug)]
pub struct FileByteDevice {
    file: File,
    path: PathBuf,
}

impl FileByteDevice {
    /// Open read-only.
    pub fn open_read_only(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Open read-write with synchronous write semantics.
    pub fn open_read_write(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_DSYNC)
            .open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Device path this handle was opened from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ByteDevice for FileByteDevice {
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        trace!(
            target: "bootvar::io",
            event = "read",
            offset = offset,
            len = buf.len()
        );
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        trace!(
            target: "bootvar::io",
            event = "write",
            offset = offset,
            len = buf.len()
        );
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// In-memory device for tests and property checks.
///
/// Clones share the same backing bytes, so a test can hand one handle to a
/// store session and keep another for corrupting or inspecting the "media"
/// between sessions.
#[derive(Debug, Clone)]
pub struct MemDevice {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl MemDevice {
    /// Create a zero-filled device of `len` bytes.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(vec![0_u8; len])),
        }
    }

    /// Snapshot of the device contents.
    pub fn contents(&self) -> Result<Vec<u8>> {
        Ok(self.locked()?.clone())
    }

    /// Overwrite `len` bytes at `offset` with `byte`.
    pub fn fill(&self, offset: usize, len: usize, byte: u8) -> Result<()> {
        let mut bytes = self.locked()?;
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= bytes.len())
            .ok_or(StoreError::InvalidArgument("fill range out of bounds"))?;
        bytes[offset..end].fill(byte);
        Ok(())
    }

    /// Flip every bit of the byte at `offset`.
    pub fn corrupt_byte(&self, offset: usize) -> Result<()> {
        let mut bytes = self.locked()?;
        let byte = bytes
            .get_mut(offset)
            .ok_or(StoreError::InvalidArgument("corrupt offset out of bounds"))?;
        *byte = !*byte;
        Ok(())
    }

    fn locked(&self) -> Result<std::sync::MutexGuard<'_, Vec<u8>>> {
        self.bytes
            .lock()
            .map_err(|_| StoreError::Internal("memory device mutex poisoned"))
    }
}

impl ByteDevice for MemDevice {
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.locked()?;
        let start = usize::try_from(offset)
            .map_err(|_| StoreError::InvalidArgument("offset overflows usize"))?;
        let end = start
            .checked_add(buf.len())
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| {
                StoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "read past end of memory device",
                ))
            })?;
        buf.copy_from_slice(&bytes[start..end]);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut bytes = self.locked()?;
        let start = usize::try_from(offset)
            .map_err(|_| StoreError::InvalidArgument("offset overflows usize"))?;
        let end = start
            .checked_add(buf.len())
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| {
                StoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "write past end of memory device",
                ))
            })?;
        bytes[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

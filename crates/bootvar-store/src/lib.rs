#![forbid(unsafe_code)]
//! Persistent boot variable store on raw block storage.
//!
//! Named variables and boot-liveness state ("boot in progress", failed-boot
//! count) that survive reboots and filesystem corruption, because they live
//! at fixed byte offsets on a raw partition (typically an eMMC boot
//! hardware partition) rather than inside any filesystem. Two slots are
//! kept and written alternately, so a power cut during a write always
//! leaves one good copy; an 8-bit serial number picks the newer slot at
//! open.
//!
//! ```no_run
//! use bootvar_store::{BootStore, OpenOptions, StoreConfig};
//!
//! # fn main() -> bootvar_store::Result<()> {
//! let config = StoreConfig::default();
//! let mut store = BootStore::open(&config, OpenOptions::default())?;
//! store.set("boot_slot", "B")?;
//! store.update()?;
//! store.close();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod gate;
pub mod layout;
pub mod lock;
pub mod store;
pub mod vars;

pub use config::{OpenOptions, StoreConfig};
pub use device::{ByteDevice, FileByteDevice, MemDevice};
pub use error::{Result, StoreError};
pub use gate::{NoopWriteGate, SysfsWriteGate, WriteGate};
pub use store::{open_in_memory, BootStore};

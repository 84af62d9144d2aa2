//! Error types for the boot variable store.
//!
//! Defines `StoreError` and a `Result<T>` alias used throughout the crate.
//! Includes errno mappings for callers that shell the library out to
//! C-flavored consumers.

use thiserror::Error;

/// Unified error type for all store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("store is read-only")]
    ReadOnly,

    #[error("variable not found: {0}")]
    NotFound(String),

    #[error("variable name too long")]
    NameTooLong,

    #[error("variable data exceeds store capacity")]
    Oversize,

    #[error("no boot variable storage device present")]
    NoDevice,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("lockfile error: {0}")]
    Lock(std::io::Error),

    #[error("neither storage slot holds a valid store")]
    NoValidStore,

    #[error("internal error: {0}")]
    Internal(&'static str),
}

impl StoreError {
    /// Convert this error into a POSIX errno.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::InvalidArgument(_) => libc::EINVAL,
            Self::ReadOnly => libc::EROFS,
            Self::NotFound(_) => libc::ENOENT,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::Oversize => libc::EMSGSIZE,
            Self::NoDevice => libc::ENODEV,
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Lock(err) => err.raw_os_error().unwrap_or(libc::ENOLCK),
            Self::NoValidStore => libc::ENODATA,
            Self::Internal(_) => libc::EIO,
        }
    }
}

/// Result alias using `StoreError`.
pub type Result<T> = std::result::Result<T, StoreError>;

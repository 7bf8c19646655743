//! Error taxonomy for the storage and virtual-memory core.
//!
//! Non-fatal failures surface as `Err` values to the caller; short reads and
//! writes are not errors. Panics are reserved for impossible states such as
//! an inode magic mismatch or exceeding the sector-addressing schema.

use core::fmt;

/// Reasons an operation can fail without taking the kernel down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// Path resolution or directory lookup failed.
    NotFound,
    /// A directory entry with the given name already exists.
    Exists,
    /// Malformed name or path (empty, too long, trailing `/`, `.`/`..` leaf
    /// on create, misaligned mapping address).
    Invalid,
    /// The operation expected a file but found a directory.
    IsDir,
    /// The operation expected a directory but found a file.
    NotDir,
    /// Directory removal attempted on a non-empty directory.
    NotEmpty,
    /// The object is held open elsewhere.
    Busy,
    /// The free map, frame pool, or swap area has no room left.
    NoSpace,
    /// A write was attempted while writes to the inode are denied.
    Denied,
    /// The request exceeds the largest file the inode schema can address.
    FileTooLarge,
    /// A user-supplied address is unreadable or unwritable.
    BadUserPointer,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::NotFound => "not found",
            Error::Exists => "already exists",
            Error::Invalid => "invalid name or address",
            Error::IsDir => "is a directory",
            Error::NotDir => "not a directory",
            Error::NotEmpty => "directory not empty",
            Error::Busy => "busy",
            Error::NoSpace => "no space left",
            Error::Denied => "writes denied",
            Error::FileTooLarge => "file too large",
            Error::BadUserPointer => "bad user pointer",
        };
        write!(f, "{}", msg)
    }
}

pub type Result<T> = core::result::Result<T, Error>;

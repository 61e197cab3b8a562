#![forbid(unsafe_code)]
//! Error types for the e2fs engine.
//!
//! # Error Taxonomy
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `e2fs-types` | Bounds and field violations while decoding bytes |
//! | Runtime | `E2fsError` | `e2fs-error` (this crate) | Everything the engine and its callers see |
//!
//! `ParseError` converts into `E2fsError::Parse` through `?`. Mount-time
//! decoding failures are re-labelled as `InvalidFilesystem` by the engine;
//! failures while reading live metadata stay `Parse` or become `Corruption`
//! when the offending block is known.
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`E2fsError::to_errno`].
//! The match is exhaustive so a new variant is a compile error until its
//! errno is assigned.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error, else `EIO` |
//! | `Corruption` | `EIO` |
//! | `OutOfRange` | `EIO` |
//! | `InvalidFilesystem` / `Format` / `Parse` / `InvalidName` | `EINVAL` |
//! | `InvalidInode` | `ENOENT` |
//! | `NotFound` | `ENOENT` |
//! | `NoSpace` / `DirectoryFull` | `ENOSPC` |
//! | `AlreadyExists` | `EEXIST` |
//! | `NotDirectory` | `ENOTDIR` |
//! | `NotRegularFile` | `EINVAL` |
//! | `IsDirectory` | `EISDIR` |
//! | `NotEmpty` | `ENOTEMPTY` |
//! | `NameTooLong` | `ENAMETOOLONG` |
//! | `ReadOnly` | `EROFS` |

use e2fs_types::ParseError;
use thiserror::Error;

/// Unified error type for all e2fs operations.
#[derive(Debug, Error)]
pub enum E2fsError {
    /// Operating system I/O error against the backing image or a host file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The image is not an ext2 filesystem this engine can mount.
    #[error("invalid filesystem: {0}")]
    InvalidFilesystem(String),

    /// Geometry or argument the engine cannot address.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Byte-level decoding failure.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// On-disk metadata is inconsistent at a known block.
    ///
    /// Raised for broken directory record chains and block pointers that
    /// point outside the image.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u32, detail: String },

    /// Block read or write past the end of the image.
    ///
    /// Kept apart from `Io` so walkers can treat it as an unallocated block.
    #[error("block {block} out of range (image has {block_count} blocks)")]
    OutOfRange { block: u32, block_count: u32 },

    /// Inode number is zero or above `s_inodes_count`.
    #[error("invalid inode number {0}")]
    InvalidInode(u32),

    /// Path component or directory entry absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Inode or block allocator exhausted.
    #[error("no space left on device")]
    NoSpace,

    /// No directory block of the parent has slack for another entry.
    #[error("no room for '{0}' in directory")]
    DirectoryFull(String),

    #[error("'{0}' already exists")]
    AlreadyExists(String),

    #[error("'{0}' is not a directory")]
    NotDirectory(String),

    #[error("'{0}' is not a regular file")]
    NotRegularFile(String),

    #[error("'{0}' is a directory")]
    IsDirectory(String),

    #[error("directory '{0}' is not empty")]
    NotEmpty(String),

    /// Entry name longer than 255 bytes.
    #[error("name too long ({0} bytes)")]
    NameTooLong(usize),

    /// Entry name is empty, contains `/` or NUL, or is `.`/`..`.
    #[error("invalid name: {0:?}")]
    InvalidName(String),

    /// Image opened read-only and a mutation was attempted.
    #[error("read-only filesystem")]
    ReadOnly,
}

impl E2fsError {
    /// Convert this error into a POSIX errno.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } | Self::OutOfRange { .. } => libc::EIO,
            Self::InvalidFilesystem(_)
            | Self::Format(_)
            | Self::Parse(_)
            | Self::InvalidName(_)
            | Self::NotRegularFile(_) => libc::EINVAL,
            Self::InvalidInode(_) | Self::NotFound(_) => libc::ENOENT,
            Self::NoSpace | Self::DirectoryFull(_) => libc::ENOSPC,
            Self::AlreadyExists(_) => libc::EEXIST,
            Self::NotDirectory(_) => libc::ENOTDIR,
            Self::IsDirectory(_) => libc::EISDIR,
            Self::NotEmpty(_) => libc::ENOTEMPTY,
            Self::NameTooLong(_) => libc::ENAMETOOLONG,
            Self::ReadOnly => libc::EROFS,
        }
    }

    /// Whether this is a past-end-of-image block access.
    #[must_use]
    pub fn is_out_of_range(&self) -> bool {
        matches!(self, Self::OutOfRange { .. })
    }
}

/// Result alias using `E2fsError`.
pub type Result<T> = std::result::Result<T, E2fsError>;

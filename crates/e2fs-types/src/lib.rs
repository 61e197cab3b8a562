#![forbid(unsafe_code)]
//! Shared vocabulary for the ext2 engine.
//!
//! Unit-carrying newtypes for block, inode and group numbers, on-disk
//! constants, and the bounds-checked little-endian helpers every codec in
//! the workspace is built on.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const EXT2_SUPERBLOCK_OFFSET: usize = 1024;
pub const EXT2_SUPERBLOCK_SIZE: usize = 1024;
pub const EXT2_SUPER_MAGIC: u16 = 0xEF53;

/// Size of one on-disk group descriptor (`ext2_group_desc`).
pub const EXT2_GROUP_DESC_SIZE: usize = 32;

/// Size of the classic inode record. Revision-1 images may declare a larger
/// `s_inode_size`; only the first 128 bytes carry fields this engine uses.
pub const EXT2_GOOD_OLD_INODE_SIZE: usize = 128;

/// Number of block pointers in an inode: 12 direct, single, double, triple.
pub const EXT2_N_BLOCKS: usize = 15;
pub const EXT2_NDIR_BLOCKS: usize = 12;
pub const EXT2_IND_BLOCK: usize = 12;
pub const EXT2_DIND_BLOCK: usize = 13;
pub const EXT2_TIND_BLOCK: usize = 14;

/// Longest name a directory entry can hold (`name_len` is a `u8`).
pub const EXT2_NAME_LEN: usize = 255;

/// First inode number handed out by mkfs on revision-0 images.
pub const EXT2_GOOD_OLD_FIRST_INO: u32 = 11;

// ── Inode mode bits ─────────────────────────────────────────────────────────

pub const S_IFMT: u16 = 0o170_000;
pub const S_IFSOCK: u16 = 0o140_000;
pub const S_IFLNK: u16 = 0o120_000;
pub const S_IFREG: u16 = 0o100_000;
pub const S_IFBLK: u16 = 0o060_000;
pub const S_IFDIR: u16 = 0o040_000;
pub const S_IFCHR: u16 = 0o020_000;
pub const S_IFIFO: u16 = 0o010_000;

/// Permission bits (`rwxrwxrwx` plus setuid/setgid/sticky).
pub const S_IPERM: u16 = 0o7777;

// ── Directory entry file types ──────────────────────────────────────────────

pub const EXT2_FT_UNKNOWN: u8 = 0;
pub const EXT2_FT_REG_FILE: u8 = 1;
pub const EXT2_FT_DIR: u8 = 2;
pub const EXT2_FT_CHRDEV: u8 = 3;
pub const EXT2_FT_BLKDEV: u8 = 4;
pub const EXT2_FT_FIFO: u8 = 5;
pub const EXT2_FT_SOCK: u8 = 6;
pub const EXT2_FT_SYMLINK: u8 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u32);

/// Block group index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupNumber(pub u32);

/// Validated block size (power of two in 1024..=65536).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    /// Create a `BlockSize` if `value` is a power of two in [1024, 65536].
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(1024..=65536).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 1024..=65536",
            });
        }
        Ok(Self(value))
    }

    /// Decode `s_log_block_size` (block size = 1024 << log).
    pub fn from_log(log_block_size: u32) -> Result<Self, ParseError> {
        let value = ext2_block_size_from_log(log_block_size).ok_or(ParseError::InvalidField {
            field: "s_log_block_size",
            reason: "invalid shift",
        })?;
        Self::new(value)
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Block size as a buffer length.
    #[must_use]
    pub fn as_usize(self) -> usize {
        // Bounded by 65536, fits any usize this crate targets.
        self.0 as usize
    }

    /// Number of 32-bit block pointers one block can hold.
    #[must_use]
    pub fn pointers_per_block(self) -> u32 {
        self.0 / 4
    }

    /// Number of 512-byte sectors in one block (`i_blocks` unit).
    #[must_use]
    pub fn sectors_per_block(self) -> u32 {
        self.0 / 512
    }

    /// Byte offset of `block` on the backing image.
    #[must_use]
    pub fn block_to_byte(self, block: BlockNumber) -> u64 {
        u64::from(block.0) * u64::from(self.0)
    }

    /// Block that contains the superblock (0 for blocks larger than 1 KiB).
    #[must_use]
    pub fn superblock_block(self) -> BlockNumber {
        // EXT2_SUPERBLOCK_OFFSET is 1024, so this is 1 or 0.
        BlockNumber(1024 / self.0)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn ensure_slice_mut(data: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    let actual = data.len();
    if end > actual {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: actual.saturating_sub(offset),
        });
    }

    Ok(&mut data[offset..end])
}

#[inline]
pub fn read_u8(data: &[u8], offset: usize) -> Result<u8, ParseError> {
    Ok(ensure_slice(data, offset, 1)?[0])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[inline]
pub fn write_u8(data: &mut [u8], offset: usize, value: u8) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 1)?[0] = value;
    Ok(())
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 2)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_fixed(data: &mut [u8], offset: usize, bytes: &[u8]) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, bytes.len())?.copy_from_slice(bytes);
    Ok(())
}

#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_owned()
}

/// Copy `text` into a NUL-padded fixed field, truncating at `N` bytes.
#[must_use]
pub fn nul_padded<const N: usize>(text: &str) -> [u8; N] {
    let mut out = [0_u8; N];
    let len = text.len().min(N);
    out[..len].copy_from_slice(&text.as_bytes()[..len]);
    out
}

#[must_use]
pub fn ext2_block_size_from_log(log_block_size: u32) -> Option<u32> {
    let shift = 10_u32.checked_add(log_block_size)?;
    1_u32.checked_shl(shift)
}

/// Round `n` up to the next multiple of four.
#[must_use]
pub fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// Narrow a `usize` to `u32` with an explicit error path.
pub fn usize_to_u32(value: usize, field: &'static str) -> Result<u32, ParseError> {
    u32::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Narrow a `u32` to `u16` with an explicit error path.
pub fn u32_to_u16(value: u32, field: &'static str) -> Result<u16, ParseError> {
    u16::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for GroupNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl InodeNumber {
    pub const ROOT: Self = Self(2);

    /// Inode numbers are 1-based; zero is never a valid inode.
    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl BlockNumber {
    /// A zero pointer marks an unallocated slot in `i_block` and indirect blocks.
    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Add a block count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u32) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }
}

// ── Group arithmetic ────────────────────────────────────────────────────────

/// Compute the block group that contains a given block.
#[must_use]
pub fn block_to_group(block: BlockNumber, blocks_per_group: u32, first_data_block: u32) -> GroupNumber {
    let adjusted = block.0.saturating_sub(first_data_block);
    GroupNumber(adjusted / blocks_per_group)
}

/// Index of a block within its group's block bitmap.
#[must_use]
pub fn block_index_in_group(block: BlockNumber, blocks_per_group: u32, first_data_block: u32) -> u32 {
    block.0.saturating_sub(first_data_block) % blocks_per_group
}

/// Compute the inode's block group from its inode number.
///
/// Inode numbers are 1-indexed; group assignment uses `(ino - 1) / inodes_per_group`.
#[must_use]
pub fn inode_to_group(ino: InodeNumber, inodes_per_group: u32) -> GroupNumber {
    GroupNumber(ino.0.saturating_sub(1) / inodes_per_group)
}

/// Compute the index of an inode within its block group.
#[must_use]
pub fn inode_index_in_group(ino: InodeNumber, inodes_per_group: u32) -> u32 {
    ino.0.saturating_sub(1) % inodes_per_group
}

/// Inverse of [`inode_to_group`] / [`inode_index_in_group`].
#[must_use]
pub fn group_index_to_inode(group: GroupNumber, index: u32, inodes_per_group: u32) -> Option<InodeNumber> {
    group
        .0
        .checked_mul(inodes_per_group)?
        .checked_add(index)?
        .checked_add(1)
        .map(InodeNumber)
}

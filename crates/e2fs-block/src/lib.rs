#![forbid(unsafe_code)]
//! Block I/O layer.
//!
//! Provides the byte-addressed `ByteDevice` trait (pread/pwrite semantics),
//! the block-addressed `BlockDevice` trait the engine is generic over, and
//! the adapters between them: a file-backed device for real images and an
//! in-memory device for tests and image builders.

use e2fs_error::{E2fsError, Result};
use e2fs_types::{BlockNumber, EXT2_SUPERBLOCK_OFFSET, EXT2_SUPERBLOCK_SIZE};
use parking_lot::Mutex;
use std::fs::File;
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace};

/// Owned block buffer.
///
/// Invariant: length == device block size for the originating device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;

    /// Whether writes are accepted.
    fn is_writable(&self) -> bool {
        true
    }
}

fn checked_end(offset: u64, len: usize, what: &str) -> Result<u64> {
    let len = u64::try_from(len)
        .map_err(|_| E2fsError::Format(format!("{what} length overflows u64")))?;
    offset
        .checked_add(len)
        .ok_or_else(|| E2fsError::Format(format!("{what} range overflows u64")))
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
///
/// This uses `std::os::unix::fs::FileExt`, which does not need a shared
/// seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    /// Open read-write, falling back to read-only when the image is not
    /// writable by this process.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        Self::from_file(file, writable)
    }

    /// Open without requesting write access.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path.as_ref())?;
        Self::from_file(file, false)
    }

    fn from_file(file: File, writable: bool) -> Result<Self> {
        let len = file.metadata()?.len();
        debug!(len, writable, "opened image file");
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = checked_end(offset, buf.len(), "read")?;
        if end > self.len {
            return Err(E2fsError::Format(format!(
                "read out of bounds: offset={offset} len={} file_len={}",
                buf.len(),
                self.len
            )));
        }
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(E2fsError::ReadOnly);
        }
        let end = checked_end(offset, buf.len(), "write")?;
        if end > self.len {
            return Err(E2fsError::Format(format!(
                "write out of bounds: offset={offset} len={} file_len={}",
                buf.len(),
                self.len
            )));
        }
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        if self.writable {
            self.file.sync_all()?;
        }
        Ok(())
    }

    fn is_writable(&self) -> bool {
        self.writable
    }
}

/// In-memory byte device.
///
/// Clones share the same buffer, so a test can keep a handle, mount a
/// clone, and inspect the bytes afterwards.
#[derive(Debug, Clone, Default)]
pub struct MemoryByteDevice {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self::from_vec(vec![0_u8; len])
    }

    #[must_use]
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(bytes)),
        }
    }

    /// Copy of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(0)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let offset =
            usize::try_from(offset).map_err(|_| E2fsError::Format("offset overflow".into()))?;
        let end = offset
            .checked_add(buf.len())
            .ok_or_else(|| E2fsError::Format("range overflow".into()))?;
        let bytes = self.bytes.lock();
        if end > bytes.len() {
            return Err(E2fsError::Format(format!(
                "read out of bounds: offset={offset} len={} device_len={}",
                buf.len(),
                bytes.len()
            )));
        }
        buf.copy_from_slice(&bytes[offset..end]);
        drop(bytes);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let offset =
            usize::try_from(offset).map_err(|_| E2fsError::Format("offset overflow".into()))?;
        let end = offset
            .checked_add(buf.len())
            .ok_or_else(|| E2fsError::Format("range overflow".into()))?;
        let mut bytes = self.bytes.lock();
        if end > bytes.len() {
            return Err(E2fsError::Format(format!(
                "write out of bounds: offset={offset} len={} device_len={}",
                buf.len(),
                bytes.len()
            )));
        }
        bytes[offset..end].copy_from_slice(buf);
        drop(bytes);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// Block-addressed I/O interface.
pub trait BlockDevice: Send + Sync {
    /// Read a block by number.
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf>;

    /// Write a block by number. `data.len()` MUST equal `block_size()`.
    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()>;

    /// Device block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of whole blocks.
    fn block_count(&self) -> u32;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;

    /// Whether writes are accepted.
    fn is_writable(&self) -> bool {
        true
    }
}

#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_size: u32,
    block_count: u32,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    /// Wrap `inner` as an array of `block_size` blocks.
    ///
    /// A trailing partial block is not addressable.
    pub fn new(inner: D, block_size: u32) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(E2fsError::Format(format!(
                "invalid block_size={block_size} (must be power of two)"
            )));
        }

        let len = inner.len_bytes();
        let block_size_u64 = u64::from(block_size);
        let remainder = len % block_size_u64;
        if remainder != 0 {
            debug!(len, block_size, remainder, "image has a trailing partial block");
        }
        let block_count = u32::try_from(len / block_size_u64).map_err(|_| {
            E2fsError::Format(format!(
                "image too large for 32-bit block numbers: len_bytes={len} block_size={block_size}"
            ))
        })?;
        Ok(Self {
            inner,
            block_size,
            block_count,
        })
    }

    fn check_range(&self, block: BlockNumber) -> Result<u64> {
        if block.0 >= self.block_count {
            return Err(E2fsError::OutOfRange {
                block: block.0,
                block_count: self.block_count,
            });
        }
        Ok(u64::from(block.0) * u64::from(self.block_size))
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        let offset = self.check_range(block)?;
        let mut buf = vec![0_u8; self.block_size as usize];
        self.inner.read_exact_at(offset, &mut buf)?;
        trace!(block = block.0, "read block");
        Ok(BlockBuf::new(buf))
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        if data.len() != self.block_size as usize {
            return Err(E2fsError::Format(format!(
                "write_block data size mismatch: got={} expected={}",
                data.len(),
                self.block_size
            )));
        }
        let offset = self.check_range(block)?;
        if !self.inner.is_writable() {
            return Err(E2fsError::ReadOnly);
        }
        self.inner.write_all_at(offset, data)?;
        trace!(block = block.0, "wrote block");
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u32 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }

    fn is_writable(&self) -> bool {
        self.inner.is_writable()
    }
}

fn superblock_offset() -> u64 {
    // 1024 always fits.
    EXT2_SUPERBLOCK_OFFSET as u64
}

/// Read the ext2 superblock region (1024 bytes at offset 1024).
pub fn read_superblock_region(dev: &dyn ByteDevice) -> Result<[u8; EXT2_SUPERBLOCK_SIZE]> {
    let mut buf = [0_u8; EXT2_SUPERBLOCK_SIZE];
    dev.read_exact_at(superblock_offset(), &mut buf)?;
    Ok(buf)
}

/// Write the ext2 superblock region (1024 bytes at offset 1024).
pub fn write_superblock_region(dev: &dyn ByteDevice, region: &[u8]) -> Result<()> {
    if region.len() != EXT2_SUPERBLOCK_SIZE {
        return Err(E2fsError::Format(format!(
            "superblock region must be {EXT2_SUPERBLOCK_SIZE} bytes, got {}",
            region.len()
        )));
    }
    dev.write_all_at(superblock_offset(), region)
}

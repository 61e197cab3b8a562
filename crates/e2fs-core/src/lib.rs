#![forbid(unsafe_code)]
//! The ext2 engine.
//!
//! [`Ext2Fs`] is the engine context: it owns the block device, the
//! in-memory superblock and group descriptor table, and the geometry
//! derived from them. Every operation takes it explicitly; there is no
//! process-wide state.
//!
//! ```ignore
//! let mut fs = Ext2Fs::open("disk.img", &OpenOptions::default())?;
//! let dir = fs.mkdir(InodeNumber::ROOT, "docs")?;
//! assert_eq!(fs.resolve("/docs", InodeNumber::ROOT)?, Some(dir));
//! fs.close()?;
//! ```

mod ops;
mod path;
mod report;
mod walker;

pub use ops::{DirListEntry, FileAttr};
pub use path::split_parent;
pub use report::{FsInfo, human_size};
pub use walker::{BlockMap, max_mappable_blocks};

pub use e2fs_alloc::FsGeometry;
pub use e2fs_block::{BlockDevice, ByteBlockDevice, ByteDevice, FileByteDevice, MemoryByteDevice};
pub use e2fs_error::{E2fsError, Result};
pub use e2fs_ondisk::{Ext2DirEntry, Ext2FileType, Ext2GroupDesc, Ext2Inode, Ext2Superblock};
pub use e2fs_types::{BlockNumber, GroupNumber, InodeNumber};

use e2fs_alloc::AllocHint;
use e2fs_block::read_superblock_region;
use e2fs_types::{BlockSize, EXT2_SUPERBLOCK_OFFSET, EXT2_SUPERBLOCK_SIZE};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

/// Options controlling how an image is mounted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenOptions {
    /// Refuse every mutation with `E2fsError::ReadOnly`.
    pub read_only: bool,
    /// Never allocate inode numbers below `s_first_ino`.
    ///
    /// Off by default: the allocator is first-fit over the whole bitmap,
    /// which on a well-formed image already has the reserved bits set.
    pub skip_reserved_inodes: bool,
}

/// A mounted ext2 image.
pub struct Ext2Fs<D: BlockDevice> {
    dev: D,
    sb: Ext2Superblock,
    groups: Vec<Ext2GroupDesc>,
    geo: FsGeometry,
    options: OpenOptions,
    read_only: bool,
}

/// An image file mounted through `pread`/`pwrite`.
pub type ImageFs = Ext2Fs<ByteBlockDevice<FileByteDevice>>;

impl<D: BlockDevice> std::fmt::Debug for Ext2Fs<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ext2Fs")
            .field("geometry", &self.geo)
            .field("options", &self.options)
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

fn invalid_fs(detail: impl std::fmt::Display) -> E2fsError {
    E2fsError::InvalidFilesystem(detail.to_string())
}

impl ImageFs {
    /// Open and mount the image file at `path`.
    pub fn open(path: impl AsRef<Path>, options: &OpenOptions) -> Result<Self> {
        let file = if options.read_only {
            FileByteDevice::open_read_only(path.as_ref())?
        } else {
            FileByteDevice::open(path.as_ref())?
        };
        Self::open_device(file, options)
    }
}

impl<B: ByteDevice> Ext2Fs<ByteBlockDevice<B>> {
    /// Mount a byte-addressed device, learning the block size from its
    /// superblock.
    pub fn open_device(bytes: B, options: &OpenOptions) -> Result<Self> {
        let region = read_superblock_region(&bytes)
            .map_err(|err| invalid_fs(format!("cannot read superblock: {err}")))?;
        let sb = Ext2Superblock::parse_superblock_region(&region).map_err(invalid_fs)?;
        let block_size = sb.block_size().map_err(invalid_fs)?;
        let dev = ByteBlockDevice::new(bytes, block_size.get())?;
        Self::mount(dev, options)
    }
}

impl<D: BlockDevice> Ext2Fs<D> {
    /// Mount an already block-addressed device.
    ///
    /// Validates the magic number and geometry, then loads the group
    /// descriptor table from the block after the superblock.
    pub fn mount(dev: D, options: &OpenOptions) -> Result<Self> {
        let dev_bs = BlockSize::new(dev.block_size()).map_err(invalid_fs)?;
        let sb_block = dev_bs.superblock_block();
        let offset = EXT2_SUPERBLOCK_OFFSET - sb_block.0 as usize * dev_bs.as_usize();
        let buf = dev
            .read_block(sb_block)
            .map_err(|err| invalid_fs(format!("cannot read superblock: {err}")))?;
        let region = buf
            .as_slice()
            .get(offset..offset + EXT2_SUPERBLOCK_SIZE)
            .ok_or_else(|| invalid_fs("superblock straddles device blocks"))?;
        let sb = Ext2Superblock::parse_superblock_region(region).map_err(invalid_fs)?;
        let geo = FsGeometry::from_superblock(&sb).map_err(|err| invalid_fs(err.to_string()))?;

        if geo.block_size != dev_bs {
            return Err(invalid_fs(format!(
                "superblock block size {} does not match device block size {dev_bs}",
                geo.block_size
            )));
        }
        if sb.blocks_count > dev.block_count() {
            return Err(invalid_fs(format!(
                "image holds {} blocks but superblock declares {}",
                dev.block_count(),
                sb.blocks_count
            )));
        }

        let mut table = Vec::with_capacity(geo.gdt_blocks() as usize * dev_bs.as_usize());
        for i in 0..geo.gdt_blocks() {
            let block = geo
                .gdt_block
                .checked_add(i)
                .ok_or_else(|| invalid_fs("descriptor table block overflow"))?;
            table.extend_from_slice(dev.read_block(block)?.as_slice());
        }
        let groups = e2fs_ondisk::parse_group_desc_table(&table, geo.group_count)
            .map_err(invalid_fs)?;

        let read_only = options.read_only || !dev.is_writable();
        info!(
            block_size = geo.block_size.get(),
            blocks = sb.blocks_count,
            inodes = sb.inodes_count,
            groups = geo.group_count,
            read_only,
            volume = %sb.volume_name,
            "mounted ext2 image"
        );
        Ok(Self {
            dev,
            sb,
            groups,
            geo,
            options: options.clone(),
            read_only,
        })
    }

    /// Flush the backing device.
    pub fn sync(&self) -> Result<()> {
        self.dev.sync()
    }

    /// Flush and release the image.
    pub fn close(self) -> Result<()> {
        self.sync()?;
        debug!("closed ext2 image");
        Ok(())
    }

    // ── Accessors ─────────────────────────────────────────────────────

    #[must_use]
    pub fn superblock(&self) -> &Ext2Superblock {
        &self.sb
    }

    #[must_use]
    pub fn groups(&self) -> &[Ext2GroupDesc] {
        &self.groups
    }

    #[must_use]
    pub fn geometry(&self) -> &FsGeometry {
        &self.geo
    }

    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.geo.block_size
    }

    #[must_use]
    pub fn options(&self) -> &OpenOptions {
        &self.options
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    #[must_use]
    pub fn device(&self) -> &D {
        &self.dev
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(E2fsError::ReadOnly);
        }
        Ok(())
    }

    // ── Block and inode I/O ───────────────────────────────────────────

    pub fn read_block(&self, block: BlockNumber) -> Result<Vec<u8>> {
        Ok(self.dev.read_block(block)?.into_inner())
    }

    pub fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        self.dev.write_block(block, data)
    }

    /// Read inode `ino`; fails with `InvalidInode` for 0 or numbers past
    /// `s_inodes_count`.
    pub fn get_inode(&self, ino: InodeNumber) -> Result<Ext2Inode> {
        e2fs_inode::read_inode(&self.dev, &self.geo, &self.groups, ino)
    }

    pub fn write_inode(&self, ino: InodeNumber, inode: &Ext2Inode) -> Result<()> {
        self.ensure_writable()?;
        e2fs_inode::write_inode(&self.dev, &self.geo, &self.groups, ino, inode)
    }

    // ── Allocation ────────────────────────────────────────────────────

    /// Allocate an inode; `NoSpace` when every group is full.
    pub fn alloc_inode(&mut self) -> Result<InodeNumber> {
        self.ensure_writable()?;
        let hint = AllocHint {
            min_inode: self
                .options
                .skip_reserved_inodes
                .then_some(InodeNumber(self.geo.first_ino)),
        };
        e2fs_alloc::alloc_inode(&self.dev, &self.geo, &mut self.sb, &mut self.groups, hint)
    }

    /// Allocate a block; `NoSpace` when every group is full.
    pub fn alloc_block(&mut self) -> Result<BlockNumber> {
        self.ensure_writable()?;
        e2fs_alloc::alloc_block(&self.dev, &self.geo, &mut self.sb, &mut self.groups)
    }

    pub fn free_inode(&mut self, ino: InodeNumber) -> Result<()> {
        self.ensure_writable()?;
        e2fs_alloc::free_inode(&self.dev, &self.geo, &mut self.sb, &mut self.groups, ino)
    }

    pub fn free_block(&mut self, block: BlockNumber) -> Result<()> {
        self.ensure_writable()?;
        e2fs_alloc::free_block(&self.dev, &self.geo, &mut self.sb, &mut self.groups, block)
    }

    /// Adjust the directory counter of the group owning `ino`.
    fn adjust_used_dirs(&mut self, ino: InodeNumber, delta: i32) -> Result<()> {
        let group = e2fs_types::inode_to_group(ino, self.geo.inodes_per_group);
        let desc = self
            .groups
            .get_mut(group.0 as usize)
            .ok_or_else(|| E2fsError::Format(format!("group {group} outside the descriptor table")))?;
        desc.used_dirs_count = if delta >= 0 {
            desc.used_dirs_count.saturating_add(delta.unsigned_abs() as u16)
        } else {
            desc.used_dirs_count.saturating_sub(delta.unsigned_abs() as u16)
        };
        let desc = desc.clone();
        e2fs_alloc::persist_group_desc(&self.dev, &self.geo, group, &desc)
    }

    // ── Directory entries ─────────────────────────────────────────────

    fn dir_inode(&self, dir: InodeNumber) -> Result<Ext2Inode> {
        let inode = self.get_inode(dir)?;
        if !inode.is_dir() {
            return Err(E2fsError::NotDirectory(format!("inode {dir}")));
        }
        Ok(inode)
    }

    /// Look `name` up in directory `dir`, scanning its populated direct
    /// blocks. Names match by exact bytes.
    pub fn search(&self, dir: InodeNumber, name: &[u8]) -> Result<Option<InodeNumber>> {
        let inode = self.dir_inode(dir)?;
        for block in inode.direct_blocks() {
            let data = self.read_block(block)?;
            let slot = e2fs_dir::lookup_in_block(&data, name)
                .map_err(|err| e2fs_dir::at_block(err, block.0))?;
            if let Some(slot) = slot {
                return Ok(Some(slot.inode));
            }
        }
        Ok(None)
    }

    /// Insert `name -> ino` into directory `dir`.
    ///
    /// Tries each populated direct block in order; never allocates a new
    /// directory block. Fails with `DirectoryFull` when no block has room.
    pub fn add_entry(
        &self,
        dir: InodeNumber,
        ino: InodeNumber,
        name: &[u8],
        file_type: Ext2FileType,
    ) -> Result<()> {
        self.ensure_writable()?;
        let inode = self.dir_inode(dir)?;
        for block in inode.direct_blocks() {
            let mut data = self.read_block(block)?;
            let placed = e2fs_dir::add_entry(&mut data, ino, name, file_type)
                .map_err(|err| e2fs_dir::at_block(err, block.0))?;
            if let Some(offset) = placed {
                self.dev.write_block(block, &data)?;
                debug!(dir = dir.0, ino = ino.0, block = block.0, offset, "added directory entry");
                return Ok(());
            }
        }
        Err(E2fsError::DirectoryFull(
            String::from_utf8_lossy(name).into_owned(),
        ))
    }

    /// Remove the entry `name` from directory `dir`, returning the inode it
    /// referenced. Fails with `NotFound` if there is no such entry.
    pub fn remove_entry(&self, dir: InodeNumber, name: &[u8]) -> Result<InodeNumber> {
        self.ensure_writable()?;
        let inode = self.dir_inode(dir)?;
        for block in inode.direct_blocks() {
            let mut data = self.read_block(block)?;
            let removed = e2fs_dir::remove_entry(&mut data, name)
                .map_err(|err| e2fs_dir::at_block(err, block.0))?;
            if let Some(target) = removed {
                self.dev.write_block(block, &data)?;
                debug!(dir = dir.0, ino = target.0, block = block.0, "removed directory entry");
                return Ok(target);
            }
        }
        Err(E2fsError::NotFound(
            String::from_utf8_lossy(name).into_owned(),
        ))
    }

    /// Live entries of every populated direct block of `dir`.
    pub fn read_dir(&self, dir: InodeNumber) -> Result<Vec<Ext2DirEntry>> {
        let inode = self.dir_inode(dir)?;
        let mut entries = Vec::new();
        for block in inode.direct_blocks() {
            let data = self.read_block(block)?;
            let parsed = e2fs_ondisk::parse_dir_block(&data).map_err(|err| E2fsError::Corruption {
                block: block.0,
                detail: err.to_string(),
            })?;
            entries.extend(parsed);
        }
        Ok(entries)
    }
}

/// Current wall-clock time as an ext2 timestamp.
pub(crate) fn now_secs() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
}

#[cfg(test)]
pub(crate) mod test_image {
    //! A tiny hand-laid image for unit tests: 1 KiB blocks, 128 blocks,
    //! 32 inodes, one group.
    //!
    //! Layout: 1 superblock, 2 descriptor table, 3 block bitmap, 4 inode
    //! bitmap, 5..=8 inode table, 9 root directory block. Blocks 1..=9 and
    //! inodes 1..=11 are in use.

    use super::*;
    use e2fs_alloc::bitmap_set;
    use e2fs_types::{EXT2_SUPER_MAGIC, S_IFDIR};

    pub const BLOCKS: u32 = 128;
    pub const INODES: u32 = 32;

    pub fn build() -> Vec<u8> {
        let bs = 1024_usize;
        let mut image = vec![0_u8; BLOCKS as usize * bs];

        let mut region = vec![0_u8; EXT2_SUPERBLOCK_SIZE];
        region[0x38..0x3A].copy_from_slice(&EXT2_SUPER_MAGIC.to_le_bytes());
        let mut sb = Ext2Superblock::parse_superblock_region(&region).unwrap();
        sb.inodes_count = INODES;
        sb.blocks_count = BLOCKS;
        sb.first_data_block = 1;
        sb.blocks_per_group = 8192;
        sb.frags_per_group = 8192;
        sb.inodes_per_group = INODES;
        sb.free_blocks_count = BLOCKS - 1 - 9;
        sb.free_inodes_count = INODES - 11;
        sb.rev_level = 1;
        sb.first_ino = 11;
        sb.inode_size = 128;
        sb.volume_name = "unit".to_owned();
        sb.write_to_region(&mut image[1024..2048]).unwrap();

        let gd = Ext2GroupDesc {
            block_bitmap: 3,
            inode_bitmap: 4,
            inode_table: 5,
            free_blocks_count: u16::try_from(BLOCKS - 1 - 9).unwrap(),
            free_inodes_count: u16::try_from(INODES - 11).unwrap(),
            used_dirs_count: 1,
        };
        gd.write_to_bytes(&mut image[2 * bs..3 * bs]).unwrap();

        let block_bitmap = &mut image[3 * bs..4 * bs];
        for idx in 0..9 {
            bitmap_set(block_bitmap, idx);
        }
        // Bits past the last block are padding and stay set.
        for idx in (BLOCKS - 1)..(8 * 1024) {
            bitmap_set(block_bitmap, idx);
        }
        let inode_bitmap = &mut image[4 * bs..5 * bs];
        for idx in 0..11 {
            bitmap_set(inode_bitmap, idx);
        }

        let root = Ext2Inode {
            mode: S_IFDIR | 0o755,
            links_count: 2,
            size: 1024,
            blocks: 2,
            block: {
                let mut ptrs = [0_u32; 15];
                ptrs[0] = 9;
                ptrs
            },
            ..Ext2Inode::default()
        };
        let root_off = 5 * bs + 128;
        root.write_to_bytes(&mut image[root_off..root_off + 128]).unwrap();

        e2fs_dir::init_dir_block(&mut image[9 * bs..10 * bs], InodeNumber::ROOT, InodeNumber::ROOT)
            .unwrap();
        image
    }

    pub fn mount() -> (MemoryByteDevice, Ext2Fs<ByteBlockDevice<MemoryByteDevice>>) {
        let mem = MemoryByteDevice::from_vec(build());
        let fs = Ext2Fs::open_device(mem.clone(), &OpenOptions::default()).unwrap();
        (mem, fs)
    }
}

#![forbid(unsafe_code)]
//! Block and inode allocation.
//!
//! First-fit, group-major allocator over the on-disk bitmaps.
//!
//! ## Design
//!
//! The allocator is layered:
//!
//! 1. **Bitmap**: raw bit manipulation on block/inode bitmaps.
//! 2. **FsGeometry**: group arithmetic derived once from the superblock.
//! 3. **Allocators**: `alloc_inode`, `alloc_block`, `free_inode`,
//!    `free_block`. Every mutation is persisted before it returns, in a
//!    fixed order: bitmap block, group descriptor, superblock.
//! 4. **GroupStats**: bitmap popcounts, for reports and consistency checks.
//!
//! The in-memory superblock and group table are the ones the engine holds;
//! they are passed in by `&mut` and only touched once the bitmap write has
//! succeeded.

use e2fs_block::BlockDevice;
use e2fs_error::{E2fsError, Result};
use e2fs_ondisk::{Ext2GroupDesc, Ext2Superblock};
use e2fs_types::{
    BlockNumber, BlockSize, EXT2_GROUP_DESC_SIZE, EXT2_SUPERBLOCK_OFFSET, EXT2_SUPERBLOCK_SIZE,
    GroupNumber, InodeNumber, block_index_in_group, block_to_group, group_index_to_inode,
    inode_index_in_group, inode_to_group,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

// ── Bitmap operations ───────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << bit_idx);
    }
}

/// Count free (zero) bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8], count: u32) -> u32 {
    let full_bytes = (count / 8) as usize;
    let remainder = count % 8;
    let mut free = 0_u32;

    for &byte in bitmap.iter().take(full_bytes) {
        free += byte.count_zeros();
    }

    if remainder > 0 && full_bytes < bitmap.len() {
        let byte = bitmap[full_bytes];
        free += (0..remainder).filter(|&bit| (byte >> bit) & 1 == 0).count() as u32;
    }

    free
}

/// Find the first free (zero) bit in `start..count`.
#[must_use]
pub fn bitmap_find_free(bitmap: &[u8], count: u32, start: u32) -> Option<u32> {
    (start..count).find(|&idx| !bitmap_get(bitmap, idx))
}

// ── Filesystem geometry ─────────────────────────────────────────────────────

/// Cached filesystem geometry needed by the allocator and inode table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsGeometry {
    pub block_size: BlockSize,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub blocks_count: u32,
    pub inodes_count: u32,
    pub first_data_block: u32,
    pub group_count: u32,
    pub inode_size: u32,
    pub first_ino: u32,
    /// First block of the group descriptor table.
    pub gdt_block: BlockNumber,
}

impl FsGeometry {
    /// Derive geometry from a parsed superblock.
    pub fn from_superblock(sb: &Ext2Superblock) -> Result<Self> {
        sb.validate_geometry()?;
        Ok(Self {
            block_size: sb.block_size()?,
            blocks_per_group: sb.blocks_per_group,
            inodes_per_group: sb.inodes_per_group,
            blocks_count: sb.blocks_count,
            inodes_count: sb.inodes_count,
            first_data_block: sb.first_data_block,
            group_count: sb.groups_count(),
            inode_size: sb.inode_record_size(),
            first_ino: sb.first_usable_inode(),
            gdt_block: sb.group_desc_table_block()?,
        })
    }

    /// Number of blocks in a specific group (last group may be shorter).
    #[must_use]
    pub fn blocks_in_group(&self, group: GroupNumber) -> u32 {
        let group_start = u64::from(self.first_data_block)
            + u64::from(group.0) * u64::from(self.blocks_per_group);
        let remaining = u64::from(self.blocks_count).saturating_sub(group_start);
        u32::try_from(remaining.min(u64::from(self.blocks_per_group))).unwrap_or(0)
    }

    /// Number of inodes in a specific group (last group may be shorter).
    #[must_use]
    pub fn inodes_in_group(&self, group: GroupNumber) -> u32 {
        let inode_start = u64::from(group.0) * u64::from(self.inodes_per_group);
        let remaining = u64::from(self.inodes_count).saturating_sub(inode_start);
        u32::try_from(remaining.min(u64::from(self.inodes_per_group))).unwrap_or(0)
    }

    /// Absolute block number for a relative block within a group.
    #[must_use]
    pub fn group_block_to_absolute(&self, group: GroupNumber, rel_block: u32) -> BlockNumber {
        let abs = u64::from(self.first_data_block)
            + u64::from(group.0) * u64::from(self.blocks_per_group)
            + u64::from(rel_block);
        BlockNumber(u32::try_from(abs).unwrap_or(u32::MAX))
    }

    /// Convert absolute block to (group, relative_block).
    #[must_use]
    pub fn absolute_to_group_block(&self, block: BlockNumber) -> (GroupNumber, u32) {
        (
            block_to_group(block, self.blocks_per_group, self.first_data_block),
            block_index_in_group(block, self.blocks_per_group, self.first_data_block),
        )
    }

    /// Inode records per block.
    #[must_use]
    pub fn inodes_per_block(&self) -> u32 {
        self.block_size.get() / self.inode_size
    }

    /// Blocks occupied by one group's inode table.
    #[must_use]
    pub fn inode_table_blocks(&self) -> u32 {
        self.inodes_per_group.div_ceil(self.inodes_per_block())
    }

    /// Blocks occupied by the group descriptor table.
    #[must_use]
    pub fn gdt_blocks(&self) -> u32 {
        (self.group_count * EXT2_GROUP_DESC_SIZE as u32).div_ceil(self.block_size.get())
    }

    /// Whether `block` lies in the allocatable range of the image.
    #[must_use]
    pub fn is_data_block(&self, block: BlockNumber) -> bool {
        block.0 >= self.first_data_block && block.0 < self.blocks_count
    }

    /// Whether `ino` is a valid inode number for this filesystem.
    #[must_use]
    pub fn is_valid_inode(&self, ino: InodeNumber) -> bool {
        ino.0 >= 1 && ino.0 <= self.inodes_count
    }
}

// ── Allocation policy ───────────────────────────────────────────────────────

/// Knobs for the inode allocator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocHint {
    /// Never hand out an inode numbered below this (e.g. `s_first_ino`).
    pub min_inode: Option<InodeNumber>,
}

// ── On-disk persistence ─────────────────────────────────────────────────────

fn group_slot<'a>(groups: &'a mut [Ext2GroupDesc], group: GroupNumber) -> Result<&'a mut Ext2GroupDesc> {
    groups.get_mut(group.0 as usize).ok_or_else(|| {
        E2fsError::Format(format!("group {group} outside the descriptor table"))
    })
}

/// Write one group descriptor back into the descriptor table
/// (read-modify-write of the table block that holds it).
pub fn persist_group_desc(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    group: GroupNumber,
    desc: &Ext2GroupDesc,
) -> Result<()> {
    let bs = geo.block_size.as_usize();
    let byte_offset = group.0 as usize * EXT2_GROUP_DESC_SIZE;
    let table_block_idx = u32::try_from(byte_offset / bs)
        .map_err(|_| E2fsError::Format("descriptor table offset overflow".to_owned()))?;
    let offset_in_block = byte_offset % bs;

    let block = geo
        .gdt_block
        .checked_add(table_block_idx)
        .ok_or_else(|| E2fsError::Format("descriptor table block overflow".to_owned()))?;
    let mut buf = dev.read_block(block)?.into_inner();
    desc.write_to_bytes(&mut buf[offset_in_block..])?;
    dev.write_block(block, &buf)?;
    Ok(())
}

/// Write the superblock back to byte 1024 of the image (read-modify-write
/// of the block that holds it, so unmodelled bytes are preserved).
pub fn persist_superblock(dev: &dyn BlockDevice, sb: &Ext2Superblock) -> Result<()> {
    let bs = sb.block_size()?;
    let block = bs.superblock_block();
    let offset_in_block = EXT2_SUPERBLOCK_OFFSET - block.0 as usize * bs.as_usize();
    let mut buf = dev.read_block(block)?.into_inner();
    let end = offset_in_block + EXT2_SUPERBLOCK_SIZE;
    let region = buf.get_mut(offset_in_block..end).ok_or_else(|| {
        E2fsError::Format(format!("superblock does not fit in block {block}"))
    })?;
    sb.write_to_region(region)?;
    dev.write_block(block, &buf)?;
    Ok(())
}

fn persist_counters(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    sb: &Ext2Superblock,
    group: GroupNumber,
    desc: &Ext2GroupDesc,
) -> Result<()> {
    persist_group_desc(dev, geo, group, desc)?;
    persist_superblock(dev, sb)
}

// ── Inode allocator ─────────────────────────────────────────────────────────

/// First bitmap index of `group` whose inode number is `>= min`.
fn first_index_at_or_above(min: InodeNumber, group: GroupNumber, inodes_per_group: u32) -> u32 {
    let min_group = inode_to_group(min, inodes_per_group);
    if min_group == group {
        inode_index_in_group(min, inodes_per_group)
    } else if min_group > group {
        inodes_per_group
    } else {
        0
    }
}

/// Allocate the first free inode, scanning groups in order.
///
/// Groups whose descriptor reports zero free inodes are skipped without
/// reading their bitmap. Returns `NoSpace` (with nothing mutated) when no
/// group has a free bit.
pub fn alloc_inode(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    sb: &mut Ext2Superblock,
    groups: &mut [Ext2GroupDesc],
    hint: AllocHint,
) -> Result<InodeNumber> {
    for g in 0..geo.group_count {
        let group = GroupNumber(g);
        let desc = group_slot(groups, group)?;
        if desc.free_inodes_count == 0 {
            continue;
        }

        let slots = geo.inodes_in_group(group);
        let start = hint
            .min_inode
            .map_or(0, |min| first_index_at_or_above(min, group, geo.inodes_per_group));
        if start >= slots {
            continue;
        }

        let bitmap_block = BlockNumber(desc.inode_bitmap);
        let mut bitmap = dev.read_block(bitmap_block)?.into_inner();
        let Some(idx) = bitmap_find_free(&bitmap, slots, start) else {
            warn!(group = g, "inode bitmap full but descriptor reports free inodes");
            continue;
        };

        bitmap_set(&mut bitmap, idx);
        dev.write_block(bitmap_block, &bitmap)?;

        desc.free_inodes_count = desc.free_inodes_count.saturating_sub(1);
        sb.free_inodes_count = sb.free_inodes_count.saturating_sub(1);
        let desc = desc.clone();
        persist_counters(dev, geo, sb, group, &desc)?;

        let ino = group_index_to_inode(group, idx, geo.inodes_per_group)
            .ok_or_else(|| E2fsError::Format("inode number overflow".to_owned()))?;
        debug!(ino = ino.0, group = g, "allocated inode");
        return Ok(ino);
    }
    Err(E2fsError::NoSpace)
}

/// Release an inode: clear its bitmap bit and bump the free counters.
///
/// Freeing an inode whose bit is already clear only logs a warning; the
/// counters are left alone so they keep matching the bitmap.
pub fn free_inode(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    sb: &mut Ext2Superblock,
    groups: &mut [Ext2GroupDesc],
    ino: InodeNumber,
) -> Result<()> {
    if !geo.is_valid_inode(ino) {
        return Err(E2fsError::InvalidInode(ino.0));
    }
    let group = inode_to_group(ino, geo.inodes_per_group);
    let idx = inode_index_in_group(ino, geo.inodes_per_group);
    let desc = group_slot(groups, group)?;

    let bitmap_block = BlockNumber(desc.inode_bitmap);
    let mut bitmap = dev.read_block(bitmap_block)?.into_inner();
    if !bitmap_get(&bitmap, idx) {
        warn!(ino = ino.0, "freeing an inode that is not allocated");
        return Ok(());
    }
    bitmap_clear(&mut bitmap, idx);
    dev.write_block(bitmap_block, &bitmap)?;

    desc.free_inodes_count = desc.free_inodes_count.saturating_add(1);
    sb.free_inodes_count = sb.free_inodes_count.saturating_add(1);
    let desc = desc.clone();
    persist_counters(dev, geo, sb, group, &desc)?;
    debug!(ino = ino.0, group = group.0, "freed inode");
    Ok(())
}

// ── Block allocator ─────────────────────────────────────────────────────────

/// Allocate the first free block, scanning groups in order.
///
/// Only the bits that map to real blocks are considered, so the tail of a
/// short last group is never handed out.
pub fn alloc_block(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    sb: &mut Ext2Superblock,
    groups: &mut [Ext2GroupDesc],
) -> Result<BlockNumber> {
    for g in 0..geo.group_count {
        let group = GroupNumber(g);
        let desc = group_slot(groups, group)?;
        if desc.free_blocks_count == 0 {
            continue;
        }

        let bitmap_block = BlockNumber(desc.block_bitmap);
        let mut bitmap = dev.read_block(bitmap_block)?.into_inner();
        let Some(idx) = bitmap_find_free(&bitmap, geo.blocks_in_group(group), 0) else {
            warn!(group = g, "block bitmap full but descriptor reports free blocks");
            continue;
        };

        bitmap_set(&mut bitmap, idx);
        dev.write_block(bitmap_block, &bitmap)?;

        desc.free_blocks_count = desc.free_blocks_count.saturating_sub(1);
        sb.free_blocks_count = sb.free_blocks_count.saturating_sub(1);
        let desc = desc.clone();
        persist_counters(dev, geo, sb, group, &desc)?;

        let block = geo.group_block_to_absolute(group, idx);
        debug!(block = block.0, group = g, "allocated block");
        return Ok(block);
    }
    Err(E2fsError::NoSpace)
}

/// Release a block: clear its bitmap bit and bump the free counters.
pub fn free_block(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    sb: &mut Ext2Superblock,
    groups: &mut [Ext2GroupDesc],
    block: BlockNumber,
) -> Result<()> {
    if !geo.is_data_block(block) {
        return Err(E2fsError::OutOfRange {
            block: block.0,
            block_count: geo.blocks_count,
        });
    }
    let (group, idx) = geo.absolute_to_group_block(block);
    let desc = group_slot(groups, group)?;

    let bitmap_block = BlockNumber(desc.block_bitmap);
    let mut bitmap = dev.read_block(bitmap_block)?.into_inner();
    if !bitmap_get(&bitmap, idx) {
        warn!(block = block.0, "freeing a block that is not allocated");
        return Ok(());
    }
    bitmap_clear(&mut bitmap, idx);
    dev.write_block(bitmap_block, &bitmap)?;

    desc.free_blocks_count = desc.free_blocks_count.saturating_add(1);
    sb.free_blocks_count = sb.free_blocks_count.saturating_add(1);
    let desc = desc.clone();
    persist_counters(dev, geo, sb, group, &desc)?;
    debug!(block = block.0, group = group.0, "freed block");
    Ok(())
}

// ── Group stats ─────────────────────────────────────────────────────────────

/// Free counts of one group, measured from its bitmaps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupStats {
    pub group: GroupNumber,
    pub block_slots: u32,
    pub inode_slots: u32,
    pub free_blocks: u32,
    pub free_inodes: u32,
}

impl GroupStats {
    /// Whether the descriptor counters agree with the bitmaps.
    #[must_use]
    pub fn matches_desc(&self, desc: &Ext2GroupDesc) -> bool {
        u32::from(desc.free_blocks_count) == self.free_blocks
            && u32::from(desc.free_inodes_count) == self.free_inodes
    }
}

/// Popcount the bitmaps of one group.
pub fn scan_group(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    group: GroupNumber,
    desc: &Ext2GroupDesc,
) -> Result<GroupStats> {
    let block_slots = geo.blocks_in_group(group);
    let inode_slots = geo.inodes_in_group(group);
    let block_bitmap = dev.read_block(BlockNumber(desc.block_bitmap))?;
    let inode_bitmap = dev.read_block(BlockNumber(desc.inode_bitmap))?;
    Ok(GroupStats {
        group,
        block_slots,
        inode_slots,
        free_blocks: bitmap_count_free(block_bitmap.as_slice(), block_slots),
        free_inodes: bitmap_count_free(inode_bitmap.as_slice(), inode_slots),
    })
}

// ── Tests ───────────────────────────────────────────────────────────────────

#![forbid(unsafe_code)]
//! Inode table access.
//!
//! Maps inode numbers to their slot in a group's inode table and reads or
//! writes the 128-byte record there. Writes are read-modify-write of the
//! containing table block, so neighbouring inodes and any extended record
//! bytes (revision-1 images with `s_inode_size > 128`) are preserved.

use e2fs_alloc::FsGeometry;
use e2fs_block::BlockDevice;
use e2fs_error::{E2fsError, Result};
use e2fs_ondisk::{Ext2GroupDesc, Ext2Inode};
use e2fs_types::{BlockNumber, GroupNumber, InodeNumber, inode_index_in_group, inode_to_group};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Where an inode record lives on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeLocation {
    pub group: GroupNumber,
    pub index: u32,
    /// Inode table block holding the record.
    pub block: BlockNumber,
    /// Byte offset of the record inside `block`.
    pub offset: usize,
}

/// Compute the block and offset of inode `ino`.
///
/// Rejects `0` and numbers above `s_inodes_count` with `InvalidInode`.
pub fn locate_inode(
    geo: &FsGeometry,
    groups: &[Ext2GroupDesc],
    ino: InodeNumber,
) -> Result<InodeLocation> {
    if !geo.is_valid_inode(ino) {
        return Err(E2fsError::InvalidInode(ino.0));
    }
    let group = inode_to_group(ino, geo.inodes_per_group);
    let index = inode_index_in_group(ino, geo.inodes_per_group);
    let desc = groups
        .get(group.0 as usize)
        .ok_or_else(|| E2fsError::Format(format!("inode {ino} maps to missing group {group}")))?;

    let byte_offset = u64::from(index) * u64::from(geo.inode_size);
    let bs = u64::from(geo.block_size.get());
    let block_delta = u32::try_from(byte_offset / bs)
        .map_err(|_| E2fsError::Format("inode table offset overflow".to_owned()))?;
    let block = BlockNumber(desc.inode_table)
        .checked_add(block_delta)
        .ok_or_else(|| E2fsError::Format("inode table block overflow".to_owned()))?;

    Ok(InodeLocation {
        group,
        index,
        block,
        offset: (byte_offset % bs) as usize,
    })
}

/// Read and decode inode `ino`.
pub fn read_inode(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    groups: &[Ext2GroupDesc],
    ino: InodeNumber,
) -> Result<Ext2Inode> {
    let loc = locate_inode(geo, groups, ino)?;
    let buf = dev.read_block(loc.block)?;
    let inode = Ext2Inode::parse_from_bytes(&buf.as_slice()[loc.offset..])?;
    trace!(ino = ino.0, block = loc.block.0, offset = loc.offset, "read inode");
    Ok(inode)
}

/// Encode `inode` into the slot of `ino`.
pub fn write_inode(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    groups: &[Ext2GroupDesc],
    ino: InodeNumber,
    inode: &Ext2Inode,
) -> Result<()> {
    let loc = locate_inode(geo, groups, ino)?;
    let mut buf = dev.read_block(loc.block)?.into_inner();
    inode.write_to_bytes(&mut buf[loc.offset..])?;
    dev.write_block(loc.block, &buf)?;
    trace!(ino = ino.0, block = loc.block.0, offset = loc.offset, "wrote inode");
    Ok(())
}

/// A zeroed inode of the given mode with all three timestamps set to `now`.
#[must_use]
pub fn new_inode(mode: u16, links_count: u16, now: u32) -> Ext2Inode {
    Ext2Inode {
        mode,
        links_count,
        atime: now,
        ctime: now,
        mtime: now,
        ..Ext2Inode::default()
    }
}

/// Stamp an inode as deleted.
pub fn mark_deleted(inode: &mut Ext2Inode, now: u32) {
    inode.links_count = 0;
    inode.dtime = now;
}

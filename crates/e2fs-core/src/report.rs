//! Filesystem summary reports.

use crate::Ext2Fs;
use e2fs_block::BlockDevice;
use serde::{Deserialize, Serialize};

/// Summary printed by `info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsInfo {
    pub volume_name: String,
    /// `block_size * blocks_count`.
    pub image_size: u64,
    pub free_space_kib: u64,
    pub free_inodes: u32,
    pub free_blocks: u32,
    pub block_size: u32,
    pub inode_size: u32,
    pub groups_count: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    /// Inode table length of one group, in blocks.
    pub inode_table_blocks: u32,
}

impl<D: BlockDevice> Ext2Fs<D> {
    #[must_use]
    pub fn info(&self) -> FsInfo {
        let sb = self.superblock();
        let geo = self.geometry();
        let bs = u64::from(geo.block_size.get());
        FsInfo {
            volume_name: sb.volume_name.clone(),
            image_size: bs * u64::from(sb.blocks_count),
            free_space_kib: bs * u64::from(sb.free_blocks_count) / 1024,
            free_inodes: sb.free_inodes_count,
            free_blocks: sb.free_blocks_count,
            block_size: geo.block_size.get(),
            inode_size: geo.inode_size,
            groups_count: geo.group_count,
            blocks_per_group: geo.blocks_per_group,
            inodes_per_group: geo.inodes_per_group,
            inode_table_blocks: geo.inode_table_blocks(),
        }
    }
}

/// `N bytes` below 1 KiB, `N.N KiB` below 1 MiB, else `N.N MiB`.
#[must_use]
pub fn human_size(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * 1024;
    // Integer tenths keep the rounding exact.
    let tenths = |unit: u64| (bytes * 10 + unit / 2) / unit;
    if bytes < KIB {
        format!("{bytes} bytes")
    } else if bytes < MIB {
        let t = tenths(KIB);
        format!("{}.{} KiB", t / 10, t % 10)
    } else {
        let t = tenths(MIB);
        format!("{}.{} MiB", t / 10, t % 10)
    }
}

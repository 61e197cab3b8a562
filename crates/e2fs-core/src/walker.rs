//! Indirect block walker.
//!
//! Maps an inode's pointer tree (12 direct pointers, one singly-indirect
//! and one doubly-indirect block) to an ordered block list. A zero pointer
//! at any level ends the walk. The triple-indirect pointer is not followed.

use crate::Ext2Fs;
use e2fs_block::BlockDevice;
use e2fs_error::Result;
use e2fs_ondisk::Ext2Inode;
use e2fs_types::{
    BlockNumber, BlockSize, EXT2_DIND_BLOCK, EXT2_IND_BLOCK, EXT2_NDIR_BLOCKS, EXT2_TIND_BLOCK,
    read_le_u32,
};
use serde::{Deserialize, Serialize};
use std::io::Write;
use tracing::{debug, warn};

/// Largest number of data blocks reachable without triple indirection.
#[must_use]
pub fn max_mappable_blocks(block_size: BlockSize) -> u64 {
    let p = u64::from(block_size.pointers_per_block());
    EXT2_NDIR_BLOCKS as u64 + p + p * p
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum BlockRole {
    Data,
    Pointer,
}

/// Blocks reachable from one inode, in release order: every data block
/// precedes the pointer block that references it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMap {
    blocks: Vec<(BlockNumber, BlockRole)>,
    data_len: u64,
    /// The walk stopped at a pointer outside the image.
    pub truncated: bool,
}

impl BlockMap {
    /// Data blocks in file order.
    pub fn data_blocks(&self) -> impl Iterator<Item = BlockNumber> + '_ {
        self.blocks
            .iter()
            .filter(|(_, role)| *role == BlockRole::Data)
            .map(|(block, _)| *block)
    }

    /// Pointer (indirect) blocks, each after its children.
    pub fn pointer_blocks(&self) -> impl Iterator<Item = BlockNumber> + '_ {
        self.blocks
            .iter()
            .filter(|(_, role)| *role == BlockRole::Pointer)
            .map(|(block, _)| *block)
    }

    /// Every mapped block, children before parents.
    pub fn release_order(&self) -> impl Iterator<Item = BlockNumber> + '_ {
        self.blocks.iter().map(|(block, _)| *block)
    }

    #[must_use]
    pub fn data_len(&self) -> u64 {
        self.data_len
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    fn push_data(&mut self, block: BlockNumber) {
        self.blocks.push((block, BlockRole::Data));
        self.data_len += 1;
    }
}

impl<D: BlockDevice> Ext2Fs<D> {
    /// Walk the pointer tree of `inode`, collecting at most `limit` data
    /// blocks plus every pointer block visited on the way.
    pub fn map_blocks(&self, inode: &Ext2Inode, limit: u64) -> Result<BlockMap> {
        let mut map = BlockMap::default();
        for idx in 0..EXT2_NDIR_BLOCKS {
            if map.data_len >= limit {
                return Ok(map);
            }
            let block = inode.block_ptr(idx);
            if block.is_null() {
                return Ok(map);
            }
            if !self.pointer_in_range(block, &mut map) {
                return Ok(map);
            }
            map.push_data(block);
        }

        for (idx, depth) in [(EXT2_IND_BLOCK, 1_u8), (EXT2_DIND_BLOCK, 2)] {
            if map.data_len >= limit {
                return Ok(map);
            }
            let block = inode.block_ptr(idx);
            if block.is_null() || !self.walk_pointer_block(block, depth, limit, &mut map)? {
                return Ok(map);
            }
        }

        if map.data_len < limit && !inode.block_ptr(EXT2_TIND_BLOCK).is_null() {
            warn!(
                tind = inode.block_ptr(EXT2_TIND_BLOCK).0,
                mapped = map.data_len,
                "triple-indirect block not followed"
            );
        }
        Ok(map)
    }

    /// Visit one pointer block and its subtree. Returns `false` once the
    /// walk must stop.
    fn walk_pointer_block(
        &self,
        block: BlockNumber,
        depth: u8,
        limit: u64,
        map: &mut BlockMap,
    ) -> Result<bool> {
        if !self.pointer_in_range(block, map) {
            return Ok(false);
        }
        let data = match self.read_block(block) {
            Ok(data) => data,
            Err(err) if err.is_out_of_range() => {
                map.truncated = true;
                return Ok(false);
            }
            Err(err) => return Err(err),
        };

        let mut keep_going = true;
        for offset in (0..data.len()).step_by(4) {
            if map.data_len >= limit {
                keep_going = false;
                break;
            }
            let child = BlockNumber(read_le_u32(&data, offset)?);
            if child.is_null() {
                keep_going = false;
                break;
            }
            if depth == 1 {
                if !self.pointer_in_range(child, map) {
                    keep_going = false;
                    break;
                }
                map.push_data(child);
            } else if !self.walk_pointer_block(child, depth - 1, limit, map)? {
                keep_going = false;
                break;
            }
        }
        map.blocks.push((block, BlockRole::Pointer));
        Ok(keep_going)
    }

    fn pointer_in_range(&self, block: BlockNumber, map: &mut BlockMap) -> bool {
        if self.geometry().is_data_block(block) {
            return true;
        }
        warn!(block = block.0, "block pointer outside the image, walk truncated");
        map.truncated = true;
        false
    }

    /// Data blocks holding the first `i_size` bytes of `inode`.
    pub fn data_blocks(&self, inode: &Ext2Inode) -> Result<Vec<BlockNumber>> {
        let limit = u64::from(inode.size).div_ceil(u64::from(self.block_size().get()));
        Ok(self.map_blocks(inode, limit)?.data_blocks().collect())
    }

    /// Stream the contents of `inode` into `out`, capped at `i_size`.
    /// Returns the number of bytes written.
    pub fn stream_file<W: Write>(&self, inode: &Ext2Inode, out: &mut W) -> Result<u64> {
        let mut remaining = u64::from(inode.size);
        let mut written = 0_u64;
        for block in self.data_blocks(inode)? {
            if remaining == 0 {
                break;
            }
            let data = self.read_block(block)?;
            let take = usize::try_from(remaining.min(data.len() as u64)).unwrap_or(data.len());
            out.write_all(&data[..take])?;
            remaining -= take as u64;
            written += take as u64;
        }
        if remaining > 0 {
            debug!(size = inode.size, written, "file content ends before i_size");
        }
        Ok(written)
    }

    /// Whole contents of `inode`.
    pub fn read_file(&self, inode: &Ext2Inode) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(usize::try_from(inode.size).unwrap_or(0));
        self.stream_file(inode, &mut buf)?;
        Ok(buf)
    }

    /// Return every block of `inode` to the allocator, data blocks before
    /// the pointer blocks that reference them, and clear its pointers.
    ///
    /// The whole tree is mapped before the first block is freed, so a
    /// corrupt pointer block fails the call without releasing anything.
    pub fn release_blocks(&mut self, inode: &mut Ext2Inode) -> Result<usize> {
        self.ensure_writable()?;
        let map = self.map_blocks(inode, u64::MAX)?;
        if map.truncated {
            warn!("releasing a truncated block map, unreachable blocks stay allocated");
        }
        for block in map.release_order() {
            self.free_block(block)?;
        }
        inode.block = [0; e2fs_types::EXT2_N_BLOCKS];
        inode.blocks = 0;
        debug!(freed = map.len(), "released inode blocks");
        Ok(map.len())
    }
}

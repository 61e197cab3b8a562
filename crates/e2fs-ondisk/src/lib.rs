#![forbid(unsafe_code)]
//! On-disk format codecs for ext2 structures.
//!
//! Pure parsing crate with no I/O. Decodes byte slices into typed views of
//! the superblock, group descriptors, inode records and directory entries,
//! and encodes them back at the same offsets so unmodelled bytes survive a
//! read-modify-write cycle.

pub mod ext2;

pub use ext2::{
    DirBlockIter, EXT2_DIR_ENTRY_HEADER_LEN, EXT2_DYNAMIC_REV, Ext2DirEntry, Ext2FileType,
    Ext2GroupDesc, Ext2Inode, Ext2Superblock, ideal_rec_len,
    iter_dir_block, parse_dir_block, parse_group_desc_table, write_group_desc_table,
};

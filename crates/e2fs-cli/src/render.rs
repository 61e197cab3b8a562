//! Text rendering of engine reports.

use chrono::{DateTime, Local};
use e2fs::{DirListEntry, Ext2GroupDesc, Ext2Inode, Ext2Superblock, FileAttr, FsInfo, InodeNumber, human_size};
use std::io::{self, Write};

/// `dd/mm/YYYY HH:MM` in local time, or `never modified` for zero.
pub fn format_mtime(secs: u32) -> String {
    if secs == 0 {
        return "never modified".to_owned();
    }
    DateTime::from_timestamp(i64::from(secs), 0).map_or_else(
        || format!("@{secs}"),
        |utc| utc.with_timezone(&Local).format("%d/%m/%Y %H:%M").to_string(),
    )
}

fn uuid_string(bytes: &[u8; 16]) -> String {
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

pub fn info(out: &mut impl Write, info: &FsInfo) -> io::Result<()> {
    writeln!(out, "Volume name.....: {}", info.volume_name)?;
    writeln!(out, "Image size......: {} bytes", info.image_size)?;
    writeln!(out, "Free space......: {} KiB", info.free_space_kib)?;
    writeln!(out, "Free inodes.....: {}", info.free_inodes)?;
    writeln!(out, "Free blocks.....: {}", info.free_blocks)?;
    writeln!(out, "Block size......: {} bytes", info.block_size)?;
    writeln!(out, "Inode size......: {} bytes", info.inode_size)?;
    writeln!(out, "Groups count....: {}", info.groups_count)?;
    writeln!(out, "Groups size.....: {} blocks", info.blocks_per_group)?;
    writeln!(out, "Groups inodes...: {} inodes", info.inodes_per_group)?;
    writeln!(out, "Inodetable size.: {} blocks", info.inode_table_blocks)
}

pub fn ls(out: &mut impl Write, entries: &[DirListEntry]) -> io::Result<()> {
    for entry in entries {
        writeln!(out, "{}", entry.name)?;
        writeln!(out, "inode: {}", entry.inode)?;
        writeln!(out, "record length: {}", entry.rec_len)?;
        writeln!(out, "name length: {}", entry.name_len)?;
        writeln!(out, "file type: {}", entry.file_type.as_raw())?;
        writeln!(out)?;
    }
    Ok(())
}

pub fn attr(out: &mut impl Write, attr: &FileAttr) -> io::Result<()> {
    writeln!(out, "permissions  uid  gid      size      modified on")?;
    writeln!(
        out,
        "{:<12} {:<4} {:<4} {:>12}  {}",
        attr.permissions,
        attr.uid,
        attr.gid,
        human_size(u64::from(attr.size)),
        format_mtime(attr.mtime)
    )
}

pub fn superblock(out: &mut impl Write, sb: &Ext2Superblock) -> io::Result<()> {
    let rows: Vec<(&str, String)> = vec![
        ("inodes count", sb.inodes_count.to_string()),
        ("blocks count", sb.blocks_count.to_string()),
        ("reserved blocks count", sb.reserved_blocks_count.to_string()),
        ("free blocks count", sb.free_blocks_count.to_string()),
        ("free inodes count", sb.free_inodes_count.to_string()),
        ("first data block", sb.first_data_block.to_string()),
        ("block size", (1024_u64 << sb.log_block_size.min(16)).to_string()),
        ("fragment size", (1024_u64 << sb.log_frag_size.min(16)).to_string()),
        ("blocks per group", sb.blocks_per_group.to_string()),
        ("fragments per group", sb.frags_per_group.to_string()),
        ("inodes per group", sb.inodes_per_group.to_string()),
        ("mount time", sb.mtime.to_string()),
        ("write time", sb.wtime.to_string()),
        ("mount count", sb.mnt_count.to_string()),
        ("max mount count", sb.max_mnt_count.to_string()),
        ("magic signature", format!("{:#06x}", sb.magic)),
        ("file system state", sb.state.to_string()),
        ("errors", sb.errors.to_string()),
        ("minor revision level", sb.minor_rev_level.to_string()),
        ("time of last check", sb.lastcheck.to_string()),
        ("max check interval", sb.checkinterval.to_string()),
        ("creator OS", sb.creator_os.to_string()),
        ("revision level", sb.rev_level.to_string()),
        ("default uid reserved blocks", sb.def_resuid.to_string()),
        ("default gid reserved blocks", sb.def_resgid.to_string()),
        ("first non-reserved inode", sb.first_ino.to_string()),
        ("inode size", sb.inode_size.to_string()),
        ("block group number", sb.block_group_nr.to_string()),
        ("compatible feature set", format!("{:#x}", sb.feature_compat)),
        ("incompatible feature set", format!("{:#x}", sb.feature_incompat)),
        ("read only comp feature set", format!("{:#x}", sb.feature_ro_compat)),
        ("volume UUID", uuid_string(&sb.uuid)),
        ("volume name", sb.volume_name.clone()),
        ("volume last mounted", sb.last_mounted.clone()),
        ("algorithm usage bitmap", sb.algorithm_usage_bitmap.to_string()),
        ("blocks to try to preallocate", sb.prealloc_blocks.to_string()),
        ("blocks preallocate dir", sb.prealloc_dir_blocks.to_string()),
        ("journal superblock UUID", uuid_string(&sb.journal_uuid)),
        ("journal file inode number", sb.journal_inum.to_string()),
        ("journal file device number", sb.journal_dev.to_string()),
        ("last orphan", sb.last_orphan.to_string()),
        (
            "hash seed",
            sb.hash_seed
                .iter()
                .map(|w| format!("{w:08x}"))
                .collect::<Vec<_>>()
                .join(" "),
        ),
        ("default hash version", sb.def_hash_version.to_string()),
        ("default mount options", format!("{:#x}", sb.default_mount_opts)),
        ("first meta", sb.first_meta_bg.to_string()),
    ];
    for (label, value) in rows {
        writeln!(out, "{label}: {value}")?;
    }
    Ok(())
}

pub fn groups(out: &mut impl Write, groups: &[Ext2GroupDesc]) -> io::Result<()> {
    for (g, desc) in groups.iter().enumerate() {
        writeln!(out, "Block Group Descriptor: {g}")?;
        writeln!(out, "block bitmap: {}", desc.block_bitmap)?;
        writeln!(out, "inode bitmap: {}", desc.inode_bitmap)?;
        writeln!(out, "inode table: {}", desc.inode_table)?;
        writeln!(out, "free blocks count: {}", desc.free_blocks_count)?;
        writeln!(out, "free inodes count: {}", desc.free_inodes_count)?;
        writeln!(out, "used dirs count: {}", desc.used_dirs_count)?;
        writeln!(out)?;
    }
    Ok(())
}

pub fn inode(out: &mut impl Write, ino: InodeNumber, inode: &Ext2Inode) -> io::Result<()> {
    writeln!(out, "inode: {ino}")?;
    writeln!(out, "file format and access rights: {:#x}", inode.mode)?;
    writeln!(out, "user id: {}", inode.uid)?;
    writeln!(out, "lower 32-bit file size: {}", inode.size)?;
    writeln!(out, "access time: {}", inode.atime)?;
    writeln!(out, "creation time: {}", inode.ctime)?;
    writeln!(out, "modification time: {}", inode.mtime)?;
    writeln!(out, "deletion time: {}", inode.dtime)?;
    writeln!(out, "group id: {}", inode.gid)?;
    writeln!(out, "link count inode: {}", inode.links_count)?;
    writeln!(out, "512-bytes blocks: {}", inode.blocks)?;
    writeln!(out, "ext2 flags: {}", inode.flags)?;
    writeln!(out, "reserved (Linux): {}", inode.osd1)?;
    for (i, ptr) in inode.block.iter().enumerate() {
        writeln!(out, "pointer[{i}]: {ptr}")?;
    }
    writeln!(out, "file version (nfs): {}", inode.generation)?;
    writeln!(out, "block number extended attributes: {}", inode.file_acl)?;
    writeln!(out, "higher 32-bit file size: {}", inode.dir_acl)?;
    writeln!(out, "location file fragment: {}", inode.faddr)
}

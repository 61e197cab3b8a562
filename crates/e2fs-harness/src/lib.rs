#![forbid(unsafe_code)]
//! Test tooling for e2fs.
//!
//! - [`build_image`] lays out a minimal ext2 image in memory: root
//!   directory only, one data block, bitmaps and counters coherent.
//! - [`install_file`] seeds a file of arbitrary size through the engine's
//!   own allocators, building singly and doubly indirect blocks as needed.
//! - [`check_consistency`] measures every group's bitmaps against its
//!   counters and walks the directory tree validating each entry chain.

use anyhow::{Context, Result, bail, ensure};
use e2fs_alloc::{GroupStats, bitmap_set, scan_group};
use e2fs_block::{BlockDevice, ByteBlockDevice, MemoryByteDevice};
use e2fs_core::{Ext2Fs, OpenOptions};
use e2fs_ondisk::{Ext2GroupDesc, Ext2Inode, Ext2Superblock};
use e2fs_types::{
    BlockNumber, EXT2_DIND_BLOCK, EXT2_GOOD_OLD_FIRST_INO, EXT2_GOOD_OLD_INODE_SIZE,
    EXT2_GROUP_DESC_SIZE, EXT2_IND_BLOCK, EXT2_NDIR_BLOCKS, EXT2_SUPER_MAGIC,
    EXT2_SUPERBLOCK_OFFSET, EXT2_SUPERBLOCK_SIZE, GroupNumber, InodeNumber, S_IFDIR,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::path::Path;

/// Timestamp stamped on the root inode and superblock of built images.
pub const IMAGE_EPOCH: u32 = 1_700_000_000;

/// Geometry of an image produced by [`build_image`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageSpec {
    pub block_size: u32,
    pub blocks_count: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub volume_name: String,
}

impl Default for ImageSpec {
    fn default() -> Self {
        Self {
            block_size: 1024,
            blocks_count: 512,
            blocks_per_group: 8192,
            inodes_per_group: 64,
            volume_name: "e2fs-test".to_owned(),
        }
    }
}

impl ImageSpec {
    /// Load a spec from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read image spec {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("invalid image spec json {}", path.display()))
    }

    fn first_data_block(&self) -> u32 {
        u32::from(self.block_size == 1024)
    }

    #[must_use]
    pub fn group_count(&self) -> u32 {
        (self.blocks_count - self.first_data_block()).div_ceil(self.blocks_per_group)
    }

    #[must_use]
    pub fn inodes_count(&self) -> u32 {
        self.group_count() * self.inodes_per_group
    }
}

/// Metadata placement of one group.
#[derive(Debug, Clone, Copy)]
struct GroupLayout {
    start: u32,
    len: u32,
    block_bitmap: u32,
    inode_bitmap: u32,
    inode_table: u32,
    /// First block after the group's metadata.
    data_start: u32,
}

fn layout_groups(spec: &ImageSpec) -> Result<Vec<GroupLayout>> {
    let bs = spec.block_size;
    let fdb = spec.first_data_block();
    let gdt_block = EXT2_SUPERBLOCK_OFFSET as u32 / bs + 1;
    let gdt_blocks = (spec.group_count() * EXT2_GROUP_DESC_SIZE as u32).div_ceil(bs);
    let table_blocks = (spec.inodes_per_group * EXT2_GOOD_OLD_INODE_SIZE as u32).div_ceil(bs);

    let mut groups = Vec::new();
    for g in 0..spec.group_count() {
        let start = fdb + g * spec.blocks_per_group;
        let len = (spec.blocks_count - start).min(spec.blocks_per_group);
        // Only group 0 carries the superblock and descriptor table.
        let meta = if g == 0 { gdt_block + gdt_blocks } else { start };
        let data_start = meta + 2 + table_blocks;
        ensure!(
            data_start < start + len,
            "group {g} too small for its metadata ({len} blocks)"
        );
        groups.push(GroupLayout {
            start,
            len,
            block_bitmap: meta,
            inode_bitmap: meta + 1,
            inode_table: meta + 2,
            data_start,
        });
    }
    Ok(groups)
}

/// Lay out a minimal ext2 image: superblock, one descriptor table, per
/// group bitmaps and inode table, and a root directory holding only `.`
/// and `..` in one block.
pub fn build_image(spec: &ImageSpec) -> Result<Vec<u8>> {
    let bs = spec.block_size;
    ensure!(
        matches!(bs, 1024 | 2048 | 4096),
        "unsupported block size {bs}"
    );
    ensure!(
        spec.blocks_per_group > 0 && spec.blocks_per_group <= bs * 8,
        "blocks_per_group must be in 1..={}",
        bs * 8
    );
    ensure!(
        spec.inodes_per_group >= EXT2_GOOD_OLD_FIRST_INO && spec.inodes_per_group <= bs * 8,
        "inodes_per_group must be in {EXT2_GOOD_OLD_FIRST_INO}..={}",
        bs * 8
    );
    ensure!(spec.blocks_count > spec.first_data_block(), "image has no blocks");

    let bsz = bs as usize;
    let layout = layout_groups(spec)?;
    let mut image = vec![0_u8; spec.blocks_count as usize * bsz];
    let block_range = |block: u32| {
        let start = block as usize * bsz;
        start..start + bsz
    };

    let root_block = layout[0].data_start;
    let reserved_inodes = EXT2_GOOD_OLD_FIRST_INO - 1;
    let mut descs = Vec::with_capacity(layout.len());
    let mut free_blocks_total = 0;
    let mut free_inodes_total = 0;

    for (g, group) in layout.iter().enumerate() {
        let mut used_blocks = group.data_start - group.start;
        if g == 0 {
            used_blocks += 1;
        }
        let used_inodes = if g == 0 { reserved_inodes } else { 0 };

        let range = block_range(group.block_bitmap);
        let bitmap = &mut image[range];
        for idx in (0..used_blocks).chain(group.len..bs * 8) {
            bitmap_set(bitmap, idx);
        }
        let range = block_range(group.inode_bitmap);
        let bitmap = &mut image[range];
        for idx in (0..used_inodes).chain(spec.inodes_per_group..bs * 8) {
            bitmap_set(bitmap, idx);
        }

        let free_blocks = group.len - used_blocks;
        let free_inodes = spec.inodes_per_group - used_inodes;
        free_blocks_total += free_blocks;
        free_inodes_total += free_inodes;
        descs.push(Ext2GroupDesc {
            block_bitmap: group.block_bitmap,
            inode_bitmap: group.inode_bitmap,
            inode_table: group.inode_table,
            free_blocks_count: u16::try_from(free_blocks).context("free block count")?,
            free_inodes_count: u16::try_from(free_inodes).context("free inode count")?,
            used_dirs_count: u16::from(g == 0),
        });
    }

    let gdt_block = EXT2_SUPERBLOCK_OFFSET / bsz + 1;
    let gdt_len = descs.len() * EXT2_GROUP_DESC_SIZE;
    let gdt_start = gdt_block * bsz;
    e2fs_ondisk::write_group_desc_table(&mut image[gdt_start..gdt_start + gdt_len], &descs)?;

    let mut region = vec![0_u8; EXT2_SUPERBLOCK_SIZE];
    region[0x38..0x3A].copy_from_slice(&EXT2_SUPER_MAGIC.to_le_bytes());
    let mut sb = Ext2Superblock::parse_superblock_region(&region)?;
    sb.inodes_count = spec.inodes_count();
    sb.blocks_count = spec.blocks_count;
    sb.free_blocks_count = free_blocks_total;
    sb.free_inodes_count = free_inodes_total;
    sb.first_data_block = spec.first_data_block();
    sb.log_block_size = bs.trailing_zeros() - 10;
    sb.log_frag_size = sb.log_block_size;
    sb.blocks_per_group = spec.blocks_per_group;
    sb.frags_per_group = spec.blocks_per_group;
    sb.inodes_per_group = spec.inodes_per_group;
    sb.wtime = IMAGE_EPOCH;
    sb.max_mnt_count = u16::MAX;
    sb.state = 1;
    sb.errors = 1;
    sb.rev_level = e2fs_ondisk::EXT2_DYNAMIC_REV;
    sb.lastcheck = IMAGE_EPOCH;
    sb.first_ino = EXT2_GOOD_OLD_FIRST_INO;
    sb.inode_size = EXT2_GOOD_OLD_INODE_SIZE as u16;
    sb.uuid = *b"e2fs-harness-img";
    sb.volume_name.clone_from(&spec.volume_name);
    sb.write_to_region(&mut image[EXT2_SUPERBLOCK_OFFSET..EXT2_SUPERBLOCK_OFFSET + EXT2_SUPERBLOCK_SIZE])?;

    let mut root = Ext2Inode {
        mode: S_IFDIR | 0o755,
        links_count: 2,
        size: bs,
        blocks: bs / 512,
        atime: IMAGE_EPOCH,
        ctime: IMAGE_EPOCH,
        mtime: IMAGE_EPOCH,
        ..Ext2Inode::default()
    };
    root.block[0] = root_block;
    let root_off = layout[0].inode_table as usize * bsz + EXT2_GOOD_OLD_INODE_SIZE;
    root.write_to_bytes(&mut image[root_off..root_off + EXT2_GOOD_OLD_INODE_SIZE])?;

    let range = block_range(root_block);
    e2fs_dir::init_dir_block(&mut image[range], InodeNumber::ROOT, InodeNumber::ROOT)?;
    Ok(image)
}

/// An engine mounted over a fresh in-memory image. The returned device
/// shares its bytes with the engine's.
pub fn mount_image(
    spec: &ImageSpec,
) -> Result<(MemoryByteDevice, Ext2Fs<ByteBlockDevice<MemoryByteDevice>>)> {
    let mem = MemoryByteDevice::from_vec(build_image(spec)?);
    let fs = Ext2Fs::open_device(mem.clone(), &OpenOptions::default())?;
    Ok((mem, fs))
}

/// Create `name` in directory `parent` holding `data`, allocating data
/// blocks first and then the indirect blocks that index them.
pub fn install_file<D: BlockDevice>(
    fs: &mut Ext2Fs<D>,
    parent: InodeNumber,
    name: &str,
    data: &[u8],
) -> Result<InodeNumber> {
    let ino = fs.touch(parent, name)?;
    let bs = fs.block_size().as_usize();
    let per_block = bs / 4;

    let mut data_blocks = Vec::new();
    for chunk in data.chunks(bs) {
        let block = fs.alloc_block()?;
        let mut buf = vec![0_u8; bs];
        buf[..chunk.len()].copy_from_slice(chunk);
        fs.write_block(block, &buf)?;
        data_blocks.push(block);
    }
    ensure!(
        data_blocks.len() <= EXT2_NDIR_BLOCKS + per_block + per_block * per_block,
        "file needs triple indirection"
    );

    let mut inode = fs.get_inode(ino)?;
    let mut used = data_blocks.len();
    let (direct, rest) = data_blocks.split_at(data_blocks.len().min(EXT2_NDIR_BLOCKS));
    for (slot, block) in inode.block.iter_mut().zip(direct) {
        *slot = block.0;
    }

    let (single, double) = rest.split_at(rest.len().min(per_block));
    if !single.is_empty() {
        inode.block[EXT2_IND_BLOCK] = write_pointer_block(fs, single)?.0;
        used += 1;
    }
    if !double.is_empty() {
        let mut children = Vec::new();
        for group in double.chunks(per_block) {
            children.push(write_pointer_block(fs, group)?);
        }
        used += children.len() + 1;
        inode.block[EXT2_DIND_BLOCK] = write_pointer_block(fs, &children)?.0;
    }

    inode.size = u32::try_from(data.len()).context("file too large")?;
    inode.blocks = u32::try_from(used * bs / 512).context("block count overflow")?;
    fs.write_inode(ino, &inode)?;
    Ok(ino)
}

fn write_pointer_block<D: BlockDevice>(fs: &mut Ext2Fs<D>, ptrs: &[BlockNumber]) -> Result<BlockNumber> {
    let block = fs.alloc_block()?;
    let mut buf = vec![0_u8; fs.block_size().as_usize()];
    for (slot, ptr) in buf.chunks_exact_mut(4).zip(ptrs) {
        slot.copy_from_slice(&ptr.0.to_le_bytes());
    }
    fs.write_block(block, &buf)?;
    Ok(block)
}

/// Deterministic file content: byte `i` is `(i * 31 + seed) % 251`.
#[must_use]
pub fn patterned_bytes(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| ((i * 31 + usize::from(seed)) % 251) as u8)
        .collect()
}

// ── Consistency checking ────────────────────────────────────────────────────

/// Outcome of [`check_consistency`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub groups: Vec<GroupStats>,
    pub directories: usize,
    pub dir_blocks: usize,
    pub problems: Vec<String>,
}

impl ConsistencyReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Measure the image behind `fs` against its own metadata.
///
/// Checks, per group and globally, that bitmap occupancy plus the free
/// counter equals the slot count, and that every directory block reached
/// from the root has a `rec_len` chain summing to the block size.
pub fn check_consistency<D: BlockDevice>(fs: &Ext2Fs<D>) -> Result<ConsistencyReport> {
    let mut report = ConsistencyReport::default();
    let geo = fs.geometry();
    let sb = fs.superblock();

    let (mut free_blocks, mut free_inodes) = (0_u32, 0_u32);
    for (g, desc) in fs.groups().iter().enumerate() {
        let group = GroupNumber(u32::try_from(g)?);
        let stats = scan_group(fs.device(), geo, group, desc)?;
        if !stats.matches_desc(desc) {
            report.problems.push(format!(
                "group {g}: bitmaps show {} free blocks / {} free inodes, descriptor says {} / {}",
                stats.free_blocks, stats.free_inodes, desc.free_blocks_count, desc.free_inodes_count
            ));
        }
        free_blocks += stats.free_blocks;
        free_inodes += stats.free_inodes;
        report.groups.push(stats);
    }
    if free_blocks != sb.free_blocks_count {
        report.problems.push(format!(
            "superblock free blocks {} but bitmaps show {free_blocks}",
            sb.free_blocks_count
        ));
    }
    if free_inodes != sb.free_inodes_count {
        report.problems.push(format!(
            "superblock free inodes {} but bitmaps show {free_inodes}",
            sb.free_inodes_count
        ));
    }

    let mut seen = BTreeSet::new();
    let mut queue = VecDeque::from([InodeNumber::ROOT]);
    while let Some(dir) = queue.pop_front() {
        if !seen.insert(dir) {
            continue;
        }
        report.directories += 1;
        let inode = fs.get_inode(dir)?;
        for block in inode.direct_blocks() {
            report.dir_blocks += 1;
            let data = fs.read_block(block)?;
            if let Err(err) = e2fs_dir::validate_chain(&data) {
                report
                    .problems
                    .push(format!("directory {dir} block {block}: {err}"));
            }
        }
        for entry in fs.read_dir(dir)? {
            if entry.is_dot() || entry.is_dotdot() {
                continue;
            }
            let child = entry.inode_number();
            if fs.get_inode(child)?.is_dir() {
                queue.push_back(child);
            }
        }
    }
    Ok(report)
}

/// Fail with every recorded problem if the image is inconsistent.
pub fn assert_consistent<D: BlockDevice>(fs: &Ext2Fs<D>) -> Result<ConsistencyReport> {
    let report = check_consistency(fs)?;
    if !report.is_clean() {
        bail!("image inconsistent:\n  {}", report.problems.join("\n  "));
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_image_mounts_clean() {
        let (_, fs) = mount_image(&ImageSpec::default()).unwrap();
        let report = assert_consistent(&fs).unwrap();
        assert_eq!(report.groups.len(), 1);
        assert_eq!(report.directories, 1);
        assert_eq!(report.dir_blocks, 1);
        assert_eq!(fs.superblock().volume_name, "e2fs-test");
        assert_eq!(fs.superblock().inodes_count, 64);
        assert_eq!(fs.superblock().free_inodes_count, 54);
    }

    #[test]
    fn multi_group_image_layout() {
        let spec = ImageSpec {
            blocks_count: 1000,
            blocks_per_group: 256,
            inodes_per_group: 32,
            ..ImageSpec::default()
        };
        assert_eq!(spec.group_count(), 4);
        let (_, fs) = mount_image(&spec).unwrap();
        assert_eq!(fs.groups().len(), 4);
        // Group 3 is short: blocks 769..1000.
        assert_eq!(fs.geometry().blocks_in_group(GroupNumber(3)), 231);
        assert_consistent(&fs).unwrap();
    }

    #[test]
    fn four_k_blocks() {
        let spec = ImageSpec {
            block_size: 4096,
            blocks_count: 128,
            ..ImageSpec::default()
        };
        let (_, fs) = mount_image(&spec).unwrap();
        assert_eq!(fs.superblock().first_data_block, 0);
        assert_eq!(fs.block_size().get(), 4096);
        assert_consistent(&fs).unwrap();
    }

    #[test]
    fn rejects_bad_spec() {
        let spec = ImageSpec {
            block_size: 3000,
            ..ImageSpec::default()
        };
        assert!(build_image(&spec).is_err());
        let spec = ImageSpec {
            blocks_count: 8,
            ..ImageSpec::default()
        };
        assert!(build_image(&spec).is_err());
    }

    #[test]
    fn spec_json_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spec.json");
        std::fs::write(&path, r#"{"blocks_count": 2048, "volume_name": "fixture"}"#).unwrap();
        let spec = ImageSpec::from_json_file(&path).unwrap();
        assert_eq!(spec.blocks_count, 2048);
        assert_eq!(spec.block_size, 1024);
        assert_eq!(spec.volume_name, "fixture");
    }

    #[test]
    fn install_file_with_double_indirect() {
        let spec = ImageSpec {
            blocks_count: 2048,
            ..ImageSpec::default()
        };
        let (_, mut fs) = mount_image(&spec).unwrap();
        // 12 direct + 256 single + 2 via double indirection.
        let data = patterned_bytes((12 + 256 + 2) * 1024 - 17, 3);
        let ino = install_file(&mut fs, InodeNumber::ROOT, "big", &data).unwrap();
        let inode = fs.get_inode(ino).unwrap();
        assert_ne!(inode.block[EXT2_IND_BLOCK], 0);
        assert_ne!(inode.block[EXT2_DIND_BLOCK], 0);
        assert_eq!(fs.read_file(&inode).unwrap(), data);
        assert_consistent(&fs).unwrap();
    }

    #[test]
    fn corruption_is_reported() {
        let (mem, _) = mount_image(&ImageSpec::default()).unwrap();
        let mut bytes = mem.snapshot();
        // Clear the root directory block bit without touching counters.
        let spec = ImageSpec::default();
        let layout = layout_groups(&spec).unwrap();
        let bitmap = layout[0].block_bitmap as usize * 1024;
        let idx = layout[0].data_start - layout[0].start;
        bytes[bitmap + (idx / 8) as usize] &= !(1 << (idx % 8));
        let fs = Ext2Fs::open_device(MemoryByteDevice::from_vec(bytes), &OpenOptions::default())
            .unwrap();
        let report = check_consistency(&fs).unwrap();
        assert!(!report.is_clean());
        assert_eq!(report.problems.len(), 2, "{:?}", report.problems);
    }
}

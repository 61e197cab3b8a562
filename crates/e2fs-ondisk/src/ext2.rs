use e2fs_types::{
    BlockNumber, BlockSize, EXT2_FT_BLKDEV, EXT2_FT_CHRDEV, EXT2_FT_DIR, EXT2_FT_FIFO,
    EXT2_FT_REG_FILE, EXT2_FT_SOCK, EXT2_FT_SYMLINK, EXT2_FT_UNKNOWN, EXT2_GOOD_OLD_FIRST_INO,
    EXT2_GOOD_OLD_INODE_SIZE, EXT2_GROUP_DESC_SIZE, EXT2_N_BLOCKS, EXT2_SUPER_MAGIC,
    EXT2_SUPERBLOCK_OFFSET, EXT2_SUPERBLOCK_SIZE, InodeNumber, ParseError, S_IFBLK,
    S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT, S_IFREG, S_IFSOCK, S_IPERM, align4, ensure_slice,
    read_fixed, read_le_u16, read_le_u32, read_u8, trim_nul_padded, write_fixed, write_le_u16,
    write_le_u32, write_u8,
};
use serde::{Deserialize, Serialize};

/// Revision level that introduced `s_first_ino` / `s_inode_size`.
pub const EXT2_DYNAMIC_REV: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2Superblock {
    // ── Core geometry ────────────────────────────────────────────────────
    pub inodes_count: u32,
    pub blocks_count: u32,
    pub reserved_blocks_count: u32,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    pub log_block_size: u32,
    pub log_frag_size: u32,
    pub blocks_per_group: u32,
    pub frags_per_group: u32,
    pub inodes_per_group: u32,

    // ── Mount bookkeeping ────────────────────────────────────────────────
    pub mtime: u32,
    pub wtime: u32,
    pub mnt_count: u16,
    pub max_mnt_count: u16,
    pub magic: u16,
    pub state: u16,
    pub errors: u16,
    pub minor_rev_level: u16,
    pub lastcheck: u32,
    pub checkinterval: u32,
    pub creator_os: u32,
    pub rev_level: u32,
    pub def_resuid: u16,
    pub def_resgid: u16,

    // ── Dynamic revision ─────────────────────────────────────────────────
    pub first_ino: u32,
    pub inode_size: u16,
    pub block_group_nr: u16,
    pub feature_compat: u32,
    pub feature_incompat: u32,
    pub feature_ro_compat: u32,
    pub uuid: [u8; 16],
    pub volume_name: String,
    pub last_mounted: String,
    pub algorithm_usage_bitmap: u32,

    // ── Performance hints ────────────────────────────────────────────────
    pub prealloc_blocks: u8,
    pub prealloc_dir_blocks: u8,

    // ── Journaling ───────────────────────────────────────────────────────
    pub journal_uuid: [u8; 16],
    pub journal_inum: u32,
    pub journal_dev: u32,
    pub last_orphan: u32,

    // ── Directory indexing ───────────────────────────────────────────────
    pub hash_seed: [u32; 4],
    pub def_hash_version: u8,
    pub default_mount_opts: u32,
    pub first_meta_bg: u32,
}

impl Ext2Superblock {
    /// Parse an ext2 superblock from a 1024-byte superblock region.
    pub fn parse_superblock_region(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < EXT2_SUPERBLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: EXT2_SUPERBLOCK_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let magic = read_le_u16(region, 0x38)?;
        if magic != EXT2_SUPER_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(EXT2_SUPER_MAGIC),
                actual: u64::from(magic),
            });
        }

        Ok(Self {
            inodes_count: read_le_u32(region, 0x00)?,
            blocks_count: read_le_u32(region, 0x04)?,
            reserved_blocks_count: read_le_u32(region, 0x08)?,
            free_blocks_count: read_le_u32(region, 0x0C)?,
            free_inodes_count: read_le_u32(region, 0x10)?,
            first_data_block: read_le_u32(region, 0x14)?,
            log_block_size: read_le_u32(region, 0x18)?,
            log_frag_size: read_le_u32(region, 0x1C)?,
            blocks_per_group: read_le_u32(region, 0x20)?,
            frags_per_group: read_le_u32(region, 0x24)?,
            inodes_per_group: read_le_u32(region, 0x28)?,

            mtime: read_le_u32(region, 0x2C)?,
            wtime: read_le_u32(region, 0x30)?,
            mnt_count: read_le_u16(region, 0x34)?,
            max_mnt_count: read_le_u16(region, 0x36)?,
            magic,
            state: read_le_u16(region, 0x3A)?,
            errors: read_le_u16(region, 0x3C)?,
            minor_rev_level: read_le_u16(region, 0x3E)?,
            lastcheck: read_le_u32(region, 0x40)?,
            checkinterval: read_le_u32(region, 0x44)?,
            creator_os: read_le_u32(region, 0x48)?,
            rev_level: read_le_u32(region, 0x4C)?,
            def_resuid: read_le_u16(region, 0x50)?,
            def_resgid: read_le_u16(region, 0x52)?,

            first_ino: read_le_u32(region, 0x54)?,
            inode_size: read_le_u16(region, 0x58)?,
            block_group_nr: read_le_u16(region, 0x5A)?,
            feature_compat: read_le_u32(region, 0x5C)?,
            feature_incompat: read_le_u32(region, 0x60)?,
            feature_ro_compat: read_le_u32(region, 0x64)?,
            uuid: read_fixed::<16>(region, 0x68)?,
            volume_name: trim_nul_padded(&read_fixed::<16>(region, 0x78)?),
            last_mounted: trim_nul_padded(&read_fixed::<64>(region, 0x88)?),
            algorithm_usage_bitmap: read_le_u32(region, 0xC8)?,

            prealloc_blocks: read_u8(region, 0xCC)?,
            prealloc_dir_blocks: read_u8(region, 0xCD)?,

            journal_uuid: read_fixed::<16>(region, 0xD0)?,
            journal_inum: read_le_u32(region, 0xE0)?,
            journal_dev: read_le_u32(region, 0xE4)?,
            last_orphan: read_le_u32(region, 0xE8)?,

            hash_seed: [
                read_le_u32(region, 0xEC)?,
                read_le_u32(region, 0xF0)?,
                read_le_u32(region, 0xF4)?,
                read_le_u32(region, 0xF8)?,
            ],
            def_hash_version: read_u8(region, 0xFC)?,
            default_mount_opts: read_le_u32(region, 0x100)?,
            first_meta_bg: read_le_u32(region, 0x104)?,
        })
    }

    /// Parse an ext2 superblock from a full disk image.
    pub fn parse_from_image(image: &[u8]) -> Result<Self, ParseError> {
        let region = ensure_slice(image, EXT2_SUPERBLOCK_OFFSET, EXT2_SUPERBLOCK_SIZE)?;
        Self::parse_superblock_region(region)
    }

    /// Write every field back into a 1024-byte superblock region.
    ///
    /// Bytes this struct does not model (reserved tail, padding) are left
    /// untouched, as are the name fields when their decoded text is
    /// unchanged, so encoding over the region a superblock was parsed from
    /// reproduces it exactly.
    pub fn write_to_region(&self, region: &mut [u8]) -> Result<(), ParseError> {
        if region.len() < EXT2_SUPERBLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: EXT2_SUPERBLOCK_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        write_le_u32(region, 0x00, self.inodes_count)?;
        write_le_u32(region, 0x04, self.blocks_count)?;
        write_le_u32(region, 0x08, self.reserved_blocks_count)?;
        write_le_u32(region, 0x0C, self.free_blocks_count)?;
        write_le_u32(region, 0x10, self.free_inodes_count)?;
        write_le_u32(region, 0x14, self.first_data_block)?;
        write_le_u32(region, 0x18, self.log_block_size)?;
        write_le_u32(region, 0x1C, self.log_frag_size)?;
        write_le_u32(region, 0x20, self.blocks_per_group)?;
        write_le_u32(region, 0x24, self.frags_per_group)?;
        write_le_u32(region, 0x28, self.inodes_per_group)?;

        write_le_u32(region, 0x2C, self.mtime)?;
        write_le_u32(region, 0x30, self.wtime)?;
        write_le_u16(region, 0x34, self.mnt_count)?;
        write_le_u16(region, 0x36, self.max_mnt_count)?;
        write_le_u16(region, 0x38, self.magic)?;
        write_le_u16(region, 0x3A, self.state)?;
        write_le_u16(region, 0x3C, self.errors)?;
        write_le_u16(region, 0x3E, self.minor_rev_level)?;
        write_le_u32(region, 0x40, self.lastcheck)?;
        write_le_u32(region, 0x44, self.checkinterval)?;
        write_le_u32(region, 0x48, self.creator_os)?;
        write_le_u32(region, 0x4C, self.rev_level)?;
        write_le_u16(region, 0x50, self.def_resuid)?;
        write_le_u16(region, 0x52, self.def_resgid)?;

        write_le_u32(region, 0x54, self.first_ino)?;
        write_le_u16(region, 0x58, self.inode_size)?;
        write_le_u16(region, 0x5A, self.block_group_nr)?;
        write_le_u32(region, 0x5C, self.feature_compat)?;
        write_le_u32(region, 0x60, self.feature_incompat)?;
        write_le_u32(region, 0x64, self.feature_ro_compat)?;
        write_fixed(region, 0x68, &self.uuid)?;
        write_name_field::<16>(region, 0x78, &self.volume_name)?;
        write_name_field::<64>(region, 0x88, &self.last_mounted)?;
        write_le_u32(region, 0xC8, self.algorithm_usage_bitmap)?;

        write_u8(region, 0xCC, self.prealloc_blocks)?;
        write_u8(region, 0xCD, self.prealloc_dir_blocks)?;

        write_fixed(region, 0xD0, &self.journal_uuid)?;
        write_le_u32(region, 0xE0, self.journal_inum)?;
        write_le_u32(region, 0xE4, self.journal_dev)?;
        write_le_u32(region, 0xE8, self.last_orphan)?;

        for (i, seed) in self.hash_seed.iter().enumerate() {
            write_le_u32(region, 0xEC + i * 4, *seed)?;
        }
        write_u8(region, 0xFC, self.def_hash_version)?;
        write_le_u32(region, 0x100, self.default_mount_opts)?;
        write_le_u32(region, 0x104, self.first_meta_bg)?;
        Ok(())
    }

    /// Decoded block size.
    pub fn block_size(&self) -> Result<BlockSize, ParseError> {
        BlockSize::from_log(self.log_block_size)
    }

    /// Size of one on-disk inode record.
    #[must_use]
    pub fn inode_record_size(&self) -> u32 {
        if self.rev_level >= EXT2_DYNAMIC_REV {
            u32::from(self.inode_size)
        } else {
            EXT2_GOOD_OLD_INODE_SIZE as u32
        }
    }

    /// First inode number not reserved by the filesystem.
    #[must_use]
    pub fn first_usable_inode(&self) -> u32 {
        if self.rev_level >= EXT2_DYNAMIC_REV {
            self.first_ino
        } else {
            EXT2_GOOD_OLD_FIRST_INO
        }
    }

    /// Number of block groups, `ceil((blocks_count - first_data_block) / blocks_per_group)`.
    #[must_use]
    pub fn groups_count(&self) -> u32 {
        if self.blocks_per_group == 0 {
            return 0;
        }
        self.blocks_count
            .saturating_sub(self.first_data_block)
            .div_ceil(self.blocks_per_group)
    }

    /// Block holding the first group descriptor: the one right after the
    /// superblock's own block.
    pub fn group_desc_table_block(&self) -> Result<BlockNumber, ParseError> {
        let bs = self.block_size()?;
        bs.superblock_block()
            .checked_add(1)
            .ok_or(ParseError::InvalidField {
                field: "group_desc_table",
                reason: "overflow",
            })
    }

    /// Check the geometry fields the engine relies on for addressing.
    pub fn validate_geometry(&self) -> Result<(), ParseError> {
        let bs = self.block_size()?;
        let bits_per_bitmap = bs.get().saturating_mul(8);

        if self.blocks_per_group == 0 || self.blocks_per_group > bits_per_bitmap {
            return Err(ParseError::InvalidField {
                field: "s_blocks_per_group",
                reason: "must be in 1..=8*block_size",
            });
        }
        if self.inodes_per_group == 0 || self.inodes_per_group > bits_per_bitmap {
            return Err(ParseError::InvalidField {
                field: "s_inodes_per_group",
                reason: "must be in 1..=8*block_size",
            });
        }
        let inode_size = self.inode_record_size();
        if inode_size < EXT2_GOOD_OLD_INODE_SIZE as u32
            || !inode_size.is_power_of_two()
            || inode_size > bs.get()
        {
            return Err(ParseError::InvalidField {
                field: "s_inode_size",
                reason: "must be a power of two in 128..=block_size",
            });
        }
        if self.first_data_block >= self.blocks_count {
            return Err(ParseError::InvalidField {
                field: "s_first_data_block",
                reason: "beyond s_blocks_count",
            });
        }
        let groups = u64::from(self.groups_count());
        if u64::from(self.inodes_count) > groups * u64::from(self.inodes_per_group) {
            return Err(ParseError::InvalidField {
                field: "s_inodes_count",
                reason: "exceeds groups * inodes_per_group",
            });
        }
        let gdt_bytes = groups * EXT2_GROUP_DESC_SIZE as u64;
        if gdt_bytes > u64::from(bs.get()) * u64::from(self.blocks_per_group) {
            return Err(ParseError::InvalidField {
                field: "group_desc_table",
                reason: "descriptor table does not fit in the first group",
            });
        }
        Ok(())
    }
}

fn write_name_field<const N: usize>(
    region: &mut [u8],
    offset: usize,
    text: &str,
) -> Result<(), ParseError> {
    let current = read_fixed::<N>(region, offset)?;
    if trim_nul_padded(&current) == text {
        return Ok(());
    }
    write_fixed(region, offset, &e2fs_types::nul_padded::<N>(text))
}

/// One entry of the block group descriptor table (`ext2_group_desc`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2GroupDesc {
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub inode_table: u32,
    pub free_blocks_count: u16,
    pub free_inodes_count: u16,
    pub used_dirs_count: u16,
}

impl Ext2GroupDesc {
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, EXT2_GROUP_DESC_SIZE)?;
        Ok(Self {
            block_bitmap: read_le_u32(bytes, 0x00)?,
            inode_bitmap: read_le_u32(bytes, 0x04)?,
            inode_table: read_le_u32(bytes, 0x08)?,
            free_blocks_count: read_le_u16(bytes, 0x0C)?,
            free_inodes_count: read_le_u16(bytes, 0x0E)?,
            used_dirs_count: read_le_u16(bytes, 0x10)?,
        })
    }

    /// Encode into a 32-byte slot, preserving the padding and reserved words.
    pub fn write_to_bytes(&self, bytes: &mut [u8]) -> Result<(), ParseError> {
        ensure_slice(bytes, 0, EXT2_GROUP_DESC_SIZE)?;
        write_le_u32(bytes, 0x00, self.block_bitmap)?;
        write_le_u32(bytes, 0x04, self.inode_bitmap)?;
        write_le_u32(bytes, 0x08, self.inode_table)?;
        write_le_u16(bytes, 0x0C, self.free_blocks_count)?;
        write_le_u16(bytes, 0x0E, self.free_inodes_count)?;
        write_le_u16(bytes, 0x10, self.used_dirs_count)?;
        Ok(())
    }
}

/// Parse `count` group descriptors from the raw descriptor table bytes.
pub fn parse_group_desc_table(table: &[u8], count: u32) -> Result<Vec<Ext2GroupDesc>, ParseError> {
    (0..count as usize)
        .map(|group| {
            let slot = ensure_slice(table, group * EXT2_GROUP_DESC_SIZE, EXT2_GROUP_DESC_SIZE)?;
            Ext2GroupDesc::parse_from_bytes(slot)
        })
        .collect()
}

/// Encode a descriptor table into `table`, slot by slot.
pub fn write_group_desc_table(table: &mut [u8], groups: &[Ext2GroupDesc]) -> Result<(), ParseError> {
    for (group, desc) in groups.iter().enumerate() {
        let offset = group * EXT2_GROUP_DESC_SIZE;
        let slot = e2fs_types::ensure_slice_mut(table, offset, EXT2_GROUP_DESC_SIZE)?;
        desc.write_to_bytes(slot)?;
    }
    Ok(())
}

/// The 128-byte classic inode record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2Inode {
    pub mode: u16,
    pub uid: u16,
    pub size: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,
    pub gid: u16,
    pub links_count: u16,
    /// Allocated storage in 512-byte sectors.
    pub blocks: u32,
    pub flags: u32,
    pub osd1: u32,
    pub block: [u32; EXT2_N_BLOCKS],
    pub generation: u32,
    pub file_acl: u32,
    pub dir_acl: u32,
    pub faddr: u32,
    pub osd2: [u8; 12],
}

impl Ext2Inode {
    /// Parse an inode from the first 128 bytes of `bytes`.
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, EXT2_GOOD_OLD_INODE_SIZE)?;

        let mut block = [0_u32; EXT2_N_BLOCKS];
        for (i, ptr) in block.iter_mut().enumerate() {
            *ptr = read_le_u32(bytes, 0x28 + i * 4)?;
        }

        Ok(Self {
            mode: read_le_u16(bytes, 0x00)?,
            uid: read_le_u16(bytes, 0x02)?,
            size: read_le_u32(bytes, 0x04)?,
            atime: read_le_u32(bytes, 0x08)?,
            ctime: read_le_u32(bytes, 0x0C)?,
            mtime: read_le_u32(bytes, 0x10)?,
            dtime: read_le_u32(bytes, 0x14)?,
            gid: read_le_u16(bytes, 0x18)?,
            links_count: read_le_u16(bytes, 0x1A)?,
            blocks: read_le_u32(bytes, 0x1C)?,
            flags: read_le_u32(bytes, 0x20)?,
            osd1: read_le_u32(bytes, 0x24)?,
            block,
            generation: read_le_u32(bytes, 0x64)?,
            file_acl: read_le_u32(bytes, 0x68)?,
            dir_acl: read_le_u32(bytes, 0x6C)?,
            faddr: read_le_u32(bytes, 0x70)?,
            osd2: read_fixed::<12>(bytes, 0x74)?,
        })
    }

    /// Encode into the first 128 bytes of `bytes`.
    pub fn write_to_bytes(&self, bytes: &mut [u8]) -> Result<(), ParseError> {
        ensure_slice(bytes, 0, EXT2_GOOD_OLD_INODE_SIZE)?;
        write_le_u16(bytes, 0x00, self.mode)?;
        write_le_u16(bytes, 0x02, self.uid)?;
        write_le_u32(bytes, 0x04, self.size)?;
        write_le_u32(bytes, 0x08, self.atime)?;
        write_le_u32(bytes, 0x0C, self.ctime)?;
        write_le_u32(bytes, 0x10, self.mtime)?;
        write_le_u32(bytes, 0x14, self.dtime)?;
        write_le_u16(bytes, 0x18, self.gid)?;
        write_le_u16(bytes, 0x1A, self.links_count)?;
        write_le_u32(bytes, 0x1C, self.blocks)?;
        write_le_u32(bytes, 0x20, self.flags)?;
        write_le_u32(bytes, 0x24, self.osd1)?;
        for (i, ptr) in self.block.iter().enumerate() {
            write_le_u32(bytes, 0x28 + i * 4, *ptr)?;
        }
        write_le_u32(bytes, 0x64, self.generation)?;
        write_le_u32(bytes, 0x68, self.file_acl)?;
        write_le_u32(bytes, 0x6C, self.dir_acl)?;
        write_le_u32(bytes, 0x70, self.faddr)?;
        write_fixed(bytes, 0x74, &self.osd2)?;
        Ok(())
    }

    /// Extract the file type bits from the mode field.
    #[must_use]
    pub fn file_type_mode(&self) -> u16 {
        self.mode & S_IFMT
    }

    #[must_use]
    pub fn is_regular(&self) -> bool {
        self.file_type_mode() == S_IFREG
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.file_type_mode() == S_IFDIR
    }

    #[must_use]
    pub fn permission_bits(&self) -> u16 {
        self.mode & S_IPERM
    }

    /// Block pointer `index` as a typed block number.
    #[must_use]
    pub fn block_ptr(&self, index: usize) -> BlockNumber {
        BlockNumber(self.block.get(index).copied().unwrap_or(0))
    }

    /// Populated prefix of the direct pointer array (stops at the first zero).
    pub fn direct_blocks(&self) -> impl Iterator<Item = BlockNumber> + '_ {
        self.block[..e2fs_types::EXT2_NDIR_BLOCKS]
            .iter()
            .take_while(|ptr| **ptr != 0)
            .map(|ptr| BlockNumber(*ptr))
    }

    /// `ls -l` style permission string, e.g. `drwxr-xr-x`.
    #[must_use]
    pub fn permission_string(&self) -> String {
        let kind = match self.file_type_mode() {
            S_IFDIR => 'd',
            S_IFLNK => 'l',
            S_IFCHR => 'c',
            S_IFBLK => 'b',
            S_IFIFO => 'p',
            S_IFSOCK => 's',
            _ => '-',
        };
        let mut out = String::with_capacity(10);
        out.push(kind);
        for shift in [6_u16, 3, 0] {
            let bits = (self.mode >> shift) & 0o7;
            out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
            out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
            out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
        }
        out
    }
}

// ── Directory entry parsing ─────────────────────────────────────────────────

/// Directory entry header length (`inode`, `rec_len`, `name_len`, `file_type`).
pub const EXT2_DIR_ENTRY_HEADER_LEN: usize = 8;

/// Smallest record able to hold a `name_len`-byte name, 4-byte aligned.
#[must_use]
pub fn ideal_rec_len(name_len: usize) -> usize {
    align4(EXT2_DIR_ENTRY_HEADER_LEN + name_len)
}

/// ext2 file type tags stored in directory entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Ext2FileType {
    Unknown = EXT2_FT_UNKNOWN,
    RegFile = EXT2_FT_REG_FILE,
    Dir = EXT2_FT_DIR,
    Chrdev = EXT2_FT_CHRDEV,
    Blkdev = EXT2_FT_BLKDEV,
    Fifo = EXT2_FT_FIFO,
    Sock = EXT2_FT_SOCK,
    Symlink = EXT2_FT_SYMLINK,
}

impl Ext2FileType {
    #[must_use]
    pub fn from_raw(val: u8) -> Self {
        match val {
            EXT2_FT_REG_FILE => Self::RegFile,
            EXT2_FT_DIR => Self::Dir,
            EXT2_FT_CHRDEV => Self::Chrdev,
            EXT2_FT_BLKDEV => Self::Blkdev,
            EXT2_FT_FIFO => Self::Fifo,
            EXT2_FT_SOCK => Self::Sock,
            EXT2_FT_SYMLINK => Self::Symlink,
            _ => Self::Unknown,
        }
    }

    /// Directory entry tag matching an inode's mode bits.
    #[must_use]
    pub fn from_mode(mode: u16) -> Self {
        match mode & S_IFMT {
            S_IFREG => Self::RegFile,
            S_IFDIR => Self::Dir,
            S_IFCHR => Self::Chrdev,
            S_IFBLK => Self::Blkdev,
            S_IFIFO => Self::Fifo,
            S_IFSOCK => Self::Sock,
            S_IFLNK => Self::Symlink,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub fn as_raw(self) -> u8 {
        self as u8
    }
}

/// A parsed directory entry (`ext2_dir_entry_2`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2DirEntry {
    pub inode: u32,
    pub rec_len: u16,
    pub name_len: u8,
    pub file_type: Ext2FileType,
    pub name: Vec<u8>,
}

impl Ext2DirEntry {
    /// The smallest record this entry's name needs.
    #[must_use]
    pub fn ideal_size(&self) -> usize {
        ideal_rec_len(usize::from(self.name_len))
    }

    /// Return the name as a UTF-8 string (lossy).
    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }

    #[must_use]
    pub fn is_dot(&self) -> bool {
        self.name == b"."
    }

    #[must_use]
    pub fn is_dotdot(&self) -> bool {
        self.name == b".."
    }

    /// Whether the slot is tombstoned (`inode == 0`).
    #[must_use]
    pub fn is_unused(&self) -> bool {
        self.inode == 0
    }

    #[must_use]
    pub fn inode_number(&self) -> InodeNumber {
        InodeNumber(self.inode)
    }
}

/// Walk every record of a directory block, tombstones included.
///
/// Yields `(offset, entry)` pairs. Errors if a record has `rec_len < 8` or
/// not a multiple of 4, runs past the block end, or its name overflows its
/// own record. Trailing bytes too short for a header are an error too.
pub fn iter_dir_block(block: &[u8]) -> DirBlockIter<'_> {
    DirBlockIter {
        block,
        offset: 0,
        failed: false,
    }
}

#[derive(Debug)]
pub struct DirBlockIter<'a> {
    block: &'a [u8],
    offset: usize,
    failed: bool,
}

impl DirBlockIter<'_> {
    fn next_record(&mut self) -> Result<(usize, Ext2DirEntry), ParseError> {
        let offset = self.offset;
        let inode = read_le_u32(self.block, offset)?;
        let rec_len = read_le_u16(self.block, offset + 4)?;
        let name_len = read_u8(self.block, offset + 6)?;
        let file_type = Ext2FileType::from_raw(read_u8(self.block, offset + 7)?);

        let rec_len_usize = usize::from(rec_len);
        if rec_len_usize < EXT2_DIR_ENTRY_HEADER_LEN {
            return Err(ParseError::InvalidField {
                field: "rec_len",
                reason: "directory entry rec_len < 8",
            });
        }
        if rec_len_usize % 4 != 0 {
            return Err(ParseError::InvalidField {
                field: "rec_len",
                reason: "directory entry rec_len not 4-byte aligned",
            });
        }
        let entry_end = offset + rec_len_usize;
        if entry_end > self.block.len() {
            return Err(ParseError::InvalidField {
                field: "rec_len",
                reason: "directory entry extends past block boundary",
            });
        }
        let name_end = offset + EXT2_DIR_ENTRY_HEADER_LEN + usize::from(name_len);
        if inode != 0 && name_end > entry_end {
            return Err(ParseError::InvalidField {
                field: "name_len",
                reason: "name extends past rec_len",
            });
        }
        let name = if name_end <= entry_end {
            self.block[offset + EXT2_DIR_ENTRY_HEADER_LEN..name_end].to_vec()
        } else {
            Vec::new()
        };

        self.offset = entry_end;
        Ok((
            offset,
            Ext2DirEntry {
                inode,
                rec_len,
                name_len,
                file_type,
                name,
            },
        ))
    }
}

impl Iterator for DirBlockIter<'_> {
    type Item = Result<(usize, Ext2DirEntry), ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.block.len() {
            return None;
        }
        let item = self.next_record();
        if item.is_err() {
            self.failed = true;
        }
        Some(item)
    }
}

/// Parse the live (non-tombstoned) entries of a directory block.
pub fn parse_dir_block(block: &[u8]) -> Result<Vec<Ext2DirEntry>, ParseError> {
    let mut entries = Vec::new();
    for record in iter_dir_block(block) {
        let (_, entry) = record?;
        if !entry.is_unused() {
            entries.push(entry);
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_region() -> Vec<u8> {
        let mut region = vec![0_u8; EXT2_SUPERBLOCK_SIZE];
        region[0x00..0x04].copy_from_slice(&64_u32.to_le_bytes());
        region[0x04..0x08].copy_from_slice(&512_u32.to_le_bytes());
        region[0x0C..0x10].copy_from_slice(&480_u32.to_le_bytes());
        region[0x10..0x14].copy_from_slice(&53_u32.to_le_bytes());
        region[0x14..0x18].copy_from_slice(&1_u32.to_le_bytes());
        region[0x20..0x24].copy_from_slice(&8192_u32.to_le_bytes());
        region[0x28..0x2C].copy_from_slice(&64_u32.to_le_bytes());
        region[0x38..0x3A].copy_from_slice(&EXT2_SUPER_MAGIC.to_le_bytes());
        region[0x4C..0x50].copy_from_slice(&1_u32.to_le_bytes());
        region[0x54..0x58].copy_from_slice(&11_u32.to_le_bytes());
        region[0x58..0x5A].copy_from_slice(&128_u16.to_le_bytes());
        region[0x78..0x7D].copy_from_slice(b"e2vol");
        region[0x3F0] = 0xAA;
        region
    }

    #[test]
    fn superblock_parses_core_fields() {
        let sb = Ext2Superblock::parse_superblock_region(&sample_region()).expect("superblock");
        assert_eq!(sb.inodes_count, 64);
        assert_eq!(sb.blocks_count, 512);
        assert_eq!(sb.free_blocks_count, 480);
        assert_eq!(sb.first_data_block, 1);
        assert_eq!(sb.block_size().unwrap().get(), 1024);
        assert_eq!(sb.volume_name, "e2vol");
        assert_eq!(sb.inode_record_size(), 128);
        assert_eq!(sb.first_usable_inode(), 11);
        assert_eq!(sb.groups_count(), 1);
        assert_eq!(sb.group_desc_table_block().unwrap(), BlockNumber(2));
        sb.validate_geometry().expect("geometry");
    }

    #[test]
    fn superblock_rejects_bad_magic() {
        let mut region = sample_region();
        region[0x38] = 0;
        let err = Ext2Superblock::parse_superblock_region(&region).unwrap_err();
        assert!(matches!(err, ParseError::InvalidMagic { .. }));
    }

    #[test]
    fn superblock_rejects_short_region() {
        let err = Ext2Superblock::parse_superblock_region(&[0_u8; 100]).unwrap_err();
        assert!(matches!(err, ParseError::InsufficientData { .. }));
    }

    #[test]
    fn superblock_encode_over_source_is_identity() {
        let region = sample_region();
        let sb = Ext2Superblock::parse_superblock_region(&region).unwrap();
        let mut out = region.clone();
        sb.write_to_region(&mut out).unwrap();
        assert_eq!(out, region);
    }

    #[test]
    fn superblock_counter_update_persists() {
        let region = sample_region();
        let mut sb = Ext2Superblock::parse_superblock_region(&region).unwrap();
        sb.free_inodes_count -= 1;
        sb.volume_name = "renamed".to_owned();
        let mut out = region.clone();
        sb.write_to_region(&mut out).unwrap();
        let again = Ext2Superblock::parse_superblock_region(&out).unwrap();
        assert_eq!(again.free_inodes_count, 52);
        assert_eq!(again.volume_name, "renamed");
        // Unmodelled tail bytes survive.
        assert_eq!(out[0x3F0], 0xAA);
    }

    #[test]
    fn geometry_validation_catches_bad_groups() {
        let mut sb = Ext2Superblock::parse_superblock_region(&sample_region()).unwrap();
        sb.blocks_per_group = 0;
        assert!(sb.validate_geometry().is_err());

        let mut sb = Ext2Superblock::parse_superblock_region(&sample_region()).unwrap();
        sb.inode_size = 100;
        assert!(sb.validate_geometry().is_err());

        let mut sb = Ext2Superblock::parse_superblock_region(&sample_region()).unwrap();
        sb.inodes_count = 10_000;
        assert!(sb.validate_geometry().is_err());
    }

    #[test]
    fn groups_count_rounds_up() {
        let mut sb = Ext2Superblock::parse_superblock_region(&sample_region()).unwrap();
        sb.blocks_count = 8193;
        assert_eq!(sb.groups_count(), 1);
        sb.blocks_count = 8194;
        assert_eq!(sb.groups_count(), 2);
    }

    #[test]
    fn group_desc_round_trip_keeps_reserved_bytes() {
        let mut raw = [0_u8; 32];
        raw[0x14] = 0x5A;
        let gd = Ext2GroupDesc {
            block_bitmap: 3,
            inode_bitmap: 4,
            inode_table: 5,
            free_blocks_count: 400,
            free_inodes_count: 50,
            used_dirs_count: 2,
        };
        gd.write_to_bytes(&mut raw).unwrap();
        assert_eq!(Ext2GroupDesc::parse_from_bytes(&raw).unwrap(), gd);
        assert_eq!(raw[0x14], 0x5A);
    }

    #[test]
    fn group_desc_table_helpers() {
        let groups = vec![
            Ext2GroupDesc {
                block_bitmap: 3,
                inode_bitmap: 4,
                inode_table: 5,
                free_blocks_count: 1,
                free_inodes_count: 2,
                used_dirs_count: 3,
            },
            Ext2GroupDesc {
                block_bitmap: 8195,
                inode_bitmap: 8196,
                inode_table: 8197,
                free_blocks_count: 4,
                free_inodes_count: 5,
                used_dirs_count: 0,
            },
        ];
        let mut table = vec![0_u8; 1024];
        write_group_desc_table(&mut table, &groups).unwrap();
        assert_eq!(parse_group_desc_table(&table, 2).unwrap(), groups);
        assert!(parse_group_desc_table(&table[..40], 2).is_err());
    }

    #[test]
    fn inode_round_trip_is_byte_identical() {
        let mut raw = [0_u8; 128];
        for (i, b) in raw.iter_mut().enumerate() {
            *b = u8::try_from(i).unwrap().wrapping_mul(7);
        }
        let inode = Ext2Inode::parse_from_bytes(&raw).unwrap();
        let mut out = [0_u8; 128];
        inode.write_to_bytes(&mut out).unwrap();
        assert_eq!(out, raw);
    }

    #[test]
    fn inode_type_helpers() {
        let inode = Ext2Inode {
            mode: S_IFDIR | 0o755,
            ..Ext2Inode::default()
        };
        assert!(inode.is_dir());
        assert!(!inode.is_regular());
        assert_eq!(inode.permission_bits(), 0o755);
        assert_eq!(inode.permission_string(), "drwxr-xr-x");

        let file = Ext2Inode {
            mode: S_IFREG | 0o644,
            ..Ext2Inode::default()
        };
        assert_eq!(file.permission_string(), "-rw-r--r--");
        assert_eq!(Ext2FileType::from_mode(file.mode), Ext2FileType::RegFile);
    }

    #[test]
    fn direct_blocks_stop_at_first_zero() {
        let mut inode = Ext2Inode::default();
        inode.block[0] = 10;
        inode.block[1] = 11;
        inode.block[3] = 13;
        let direct: Vec<_> = inode.direct_blocks().collect();
        assert_eq!(direct, vec![BlockNumber(10), BlockNumber(11)]);
    }

    fn put_entry(block: &mut [u8], off: usize, ino: u32, rec_len: u16, ft: u8, name: &[u8]) {
        block[off..off + 4].copy_from_slice(&ino.to_le_bytes());
        block[off + 4..off + 6].copy_from_slice(&rec_len.to_le_bytes());
        block[off + 6] = u8::try_from(name.len()).unwrap();
        block[off + 7] = ft;
        block[off + 8..off + 8 + name.len()].copy_from_slice(name);
    }

    #[test]
    fn dir_block_parse_skips_tombstones() {
        let mut block = vec![0_u8; 1024];
        put_entry(&mut block, 0, 0, 12, 0, b"x");
        put_entry(&mut block, 12, 2, 12, EXT2_FT_DIR, b"..");
        put_entry(&mut block, 24, 12, 1000, EXT2_FT_REG_FILE, b"a.txt");

        let entries = parse_dir_block(&block).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_dotdot());
        assert_eq!(entries[1].name_str(), "a.txt");
        assert_eq!(entries[1].file_type, Ext2FileType::RegFile);
        assert_eq!(entries[1].ideal_size(), 16);

        let all: Vec<_> = iter_dir_block(&block).collect::<Result<_, _>>().unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[2].0, 24);
        let span: usize = all.iter().map(|(_, e)| usize::from(e.rec_len)).sum();
        assert_eq!(span, 1024);
    }

    #[test]
    fn dir_block_parse_rejects_broken_chain() {
        let mut block = vec![0_u8; 64];
        put_entry(&mut block, 0, 2, 4, EXT2_FT_DIR, b".");
        assert!(parse_dir_block(&block).is_err());

        let mut block = vec![0_u8; 64];
        put_entry(&mut block, 0, 2, 128, EXT2_FT_DIR, b".");
        assert!(parse_dir_block(&block).is_err());

        let mut block = vec![0_u8; 64];
        put_entry(&mut block, 0, 2, 12, EXT2_FT_DIR, b"long-name");
        assert!(parse_dir_block(&block).is_err());

        // Misaligned rec_len.
        let mut block = vec![0_u8; 64];
        put_entry(&mut block, 0, 2, 14, EXT2_FT_DIR, b".");
        put_entry(&mut block, 14, 2, 50, EXT2_FT_DIR, b"..");
        assert!(parse_dir_block(&block).is_err());

        // A 4-byte tail cannot hold a header.
        let mut block = vec![0_u8; 64];
        put_entry(&mut block, 0, 2, 60, EXT2_FT_DIR, b".");
        assert!(matches!(
            parse_dir_block(&block),
            Err(ParseError::InsufficientData { .. })
        ));
    }

    #[test]
    fn ideal_rec_len_is_aligned() {
        assert_eq!(ideal_rec_len(1), 12);
        assert_eq!(ideal_rec_len(2), 12);
        assert_eq!(ideal_rec_len(4), 12);
        assert_eq!(ideal_rec_len(5), 16);
        assert_eq!(ideal_rec_len(255), 264);
    }
}

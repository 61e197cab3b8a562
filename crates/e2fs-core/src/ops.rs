//! File and directory commands.
//!
//! Paths are resolved relative to a caller-supplied working directory.
//! Every composite command either completes or rolls back the allocations
//! it made, so a failed command never leaves a reachable half-built entry.

use crate::{Ext2Fs, now_secs};
use e2fs_block::BlockDevice;
use e2fs_dir::validate_name;
use e2fs_error::{E2fsError, Result};
use e2fs_inode::{mark_deleted, new_inode};
use e2fs_ondisk::{Ext2FileType, Ext2Inode};
use e2fs_types::{BlockNumber, InodeNumber, S_IFDIR, S_IFREG};
use serde::{Deserialize, Serialize};
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{info, warn};

const FILE_MODE: u16 = S_IFREG | 0o644;
const DIR_MODE: u16 = S_IFDIR | 0o755;

/// One live entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirListEntry {
    pub name: String,
    pub inode: u32,
    pub rec_len: u16,
    pub name_len: u8,
    pub file_type: Ext2FileType,
}

/// Attributes reported by `attr`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttr {
    pub inode: u32,
    pub mode: u16,
    pub permissions: String,
    pub uid: u16,
    pub gid: u16,
    pub size: u32,
    pub links: u16,
    /// 512-byte sectors.
    pub blocks: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
}

impl FileAttr {
    fn from_inode(ino: InodeNumber, inode: &Ext2Inode) -> Self {
        Self {
            inode: ino.0,
            mode: inode.mode,
            permissions: inode.permission_string(),
            uid: inode.uid,
            gid: inode.gid,
            size: inode.size,
            links: inode.links_count,
            blocks: inode.blocks,
            atime: inode.atime,
            ctime: inode.ctime,
            mtime: inode.mtime,
        }
    }
}

impl<D: BlockDevice> Ext2Fs<D> {
    // ── Read-side commands ────────────────────────────────────────────

    /// Live entries of the directory at `path` (`""` lists `cwd`).
    pub fn list_dir(&self, cwd: InodeNumber, path: &str) -> Result<Vec<DirListEntry>> {
        let dir = if path.is_empty() {
            cwd
        } else {
            self.lookup(path, cwd)?
        };
        if !self.get_inode(dir)?.is_dir() {
            return Err(E2fsError::NotDirectory(path.to_owned()));
        }
        Ok(self
            .read_dir(dir)?
            .into_iter()
            .map(|entry| DirListEntry {
                name: entry.name_str(),
                inode: entry.inode,
                rec_len: entry.rec_len,
                name_len: entry.name_len,
                file_type: entry.file_type,
            })
            .collect())
    }

    pub fn attr(&self, cwd: InodeNumber, path: &str) -> Result<FileAttr> {
        let ino = self.lookup(path, cwd)?;
        Ok(FileAttr::from_inode(ino, &self.get_inode(ino)?))
    }

    fn regular_file(&self, cwd: InodeNumber, path: &str) -> Result<Ext2Inode> {
        let inode = self.get_inode(self.lookup(path, cwd)?)?;
        if !inode.is_regular() {
            return Err(E2fsError::NotRegularFile(path.to_owned()));
        }
        Ok(inode)
    }

    /// Write the contents of the regular file at `path` to `out`.
    pub fn cat<W: Write>(&self, cwd: InodeNumber, path: &str, out: &mut W) -> Result<u64> {
        let inode = self.regular_file(cwd, path)?;
        self.stream_file(&inode, out)
    }

    /// Copy the regular file at `path` to a host file, creating or
    /// truncating it.
    pub fn copy_out(&self, cwd: InodeNumber, path: &str, host: &Path) -> Result<u64> {
        let inode = self.regular_file(cwd, path)?;
        let mut out = BufWriter::new(std::fs::File::create(host)?);
        let written = self.stream_file(&inode, &mut out)?;
        out.flush()?;
        info!(path, host = %host.display(), bytes = written, "copied file out of image");
        Ok(written)
    }

    // ── Creation ──────────────────────────────────────────────────────

    fn prepare_create<'p>(&self, cwd: InodeNumber, path: &'p str) -> Result<(InodeNumber, &'p str)> {
        self.ensure_writable()?;
        let (parent, name) = self.resolve_parent(path, cwd)?;
        validate_name(name.as_bytes())?;
        if self.search(parent, name.as_bytes())?.is_some() {
            return Err(E2fsError::AlreadyExists(path.to_owned()));
        }
        Ok((parent, name))
    }

    fn undo_alloc(&mut self, ino: InodeNumber, block: Option<BlockNumber>) {
        if let Some(block) = block {
            if let Err(err) = self.free_block(block) {
                warn!(block = block.0, error = %err, "rollback could not free block");
            }
        }
        if let Err(err) = self.free_inode(ino) {
            warn!(ino = ino.0, error = %err, "rollback could not free inode");
        }
    }

    /// Create an empty regular file.
    pub fn touch(&mut self, cwd: InodeNumber, path: &str) -> Result<InodeNumber> {
        let (parent, name) = self.prepare_create(cwd, path)?;
        let ino = self.alloc_inode()?;
        let inode = new_inode(FILE_MODE, 1, now_secs());
        let placed = self
            .write_inode(ino, &inode)
            .and_then(|()| self.add_entry(parent, ino, name.as_bytes(), Ext2FileType::RegFile));
        if let Err(err) = placed {
            warn!(path, ino = ino.0, error = %err, "touch failed, releasing inode");
            self.undo_alloc(ino, None);
            return Err(err);
        }
        info!(path, ino = ino.0, "created file");
        Ok(ino)
    }

    /// Create a directory holding `.` and `..` in one data block.
    pub fn mkdir(&mut self, cwd: InodeNumber, path: &str) -> Result<InodeNumber> {
        let (parent, name) = self.prepare_create(cwd, path)?;
        let ino = self.alloc_inode()?;
        let block = match self.alloc_block() {
            Ok(block) => block,
            Err(err) => {
                warn!(path, ino = ino.0, error = %err, "mkdir failed, releasing inode");
                self.undo_alloc(ino, None);
                return Err(err);
            }
        };
        if let Err(err) = self.populate_dir(parent, ino, block, name) {
            warn!(path, ino = ino.0, block = block.0, error = %err, "mkdir failed, releasing inode and block");
            self.undo_alloc(ino, Some(block));
            return Err(err);
        }

        let mut parent_inode = self.get_inode(parent)?;
        parent_inode.links_count = parent_inode.links_count.saturating_add(1);
        self.write_inode(parent, &parent_inode)?;
        self.adjust_used_dirs(ino, 1)?;
        info!(path, ino = ino.0, block = block.0, "created directory");
        Ok(ino)
    }

    fn populate_dir(
        &self,
        parent: InodeNumber,
        ino: InodeNumber,
        block: BlockNumber,
        name: &str,
    ) -> Result<()> {
        let bs = self.block_size();
        let mut data = vec![0_u8; bs.as_usize()];
        e2fs_dir::init_dir_block(&mut data, ino, parent)?;
        self.write_block(block, &data)?;

        let mut inode = new_inode(DIR_MODE, 2, now_secs());
        inode.size = bs.get();
        inode.blocks = bs.sectors_per_block();
        inode.block[0] = block.0;
        self.write_inode(ino, &inode)?;
        self.add_entry(parent, ino, name.as_bytes(), Ext2FileType::Dir)
    }

    // ── Removal ───────────────────────────────────────────────────────

    fn prepare_remove(&self, cwd: InodeNumber, path: &str) -> Result<(InodeNumber, InodeNumber, Ext2Inode)> {
        self.ensure_writable()?;
        let (parent, name) = self.resolve_parent(path, cwd)?;
        validate_name(name.as_bytes())?;
        let ino = self
            .search(parent, name.as_bytes())?
            .ok_or_else(|| E2fsError::NotFound(path.to_owned()))?;
        Ok((parent, ino, self.get_inode(ino)?))
    }

    /// Release all blocks of `ino`, stamp it deleted and free it.
    fn destroy_inode(&mut self, ino: InodeNumber, inode: &mut Ext2Inode) -> Result<()> {
        self.release_blocks(inode)?;
        inode.size = 0;
        mark_deleted(inode, now_secs());
        self.write_inode(ino, inode)?;
        self.free_inode(ino)
    }

    /// Unlink a non-directory. The inode and its blocks are released when
    /// the last link goes.
    pub fn rm(&mut self, cwd: InodeNumber, path: &str) -> Result<()> {
        let (parent, ino, mut inode) = self.prepare_remove(cwd, path)?;
        if inode.is_dir() {
            return Err(E2fsError::IsDirectory(path.to_owned()));
        }
        let (_, name) = crate::split_parent(path);
        self.remove_entry(parent, name.as_bytes())?;

        inode.links_count = inode.links_count.saturating_sub(1);
        if inode.links_count == 0 {
            self.destroy_inode(ino, &mut inode)?;
            info!(path, ino = ino.0, "removed file");
        } else {
            inode.ctime = now_secs();
            self.write_inode(ino, &inode)?;
            info!(path, ino = ino.0, links = inode.links_count, "unlinked file");
        }
        Ok(())
    }

    /// Remove an empty directory.
    pub fn rmdir(&mut self, cwd: InodeNumber, path: &str) -> Result<()> {
        let (parent, ino, mut inode) = self.prepare_remove(cwd, path)?;
        if !inode.is_dir() {
            return Err(E2fsError::NotDirectory(path.to_owned()));
        }
        for block in inode.direct_blocks() {
            let data = self.read_block(block)?;
            let empty = e2fs_dir::is_empty_dir_block(&data)
                .map_err(|err| e2fs_dir::at_block(err, block.0))?;
            if !empty {
                return Err(E2fsError::NotEmpty(path.to_owned()));
            }
        }
        let (_, name) = crate::split_parent(path);
        self.remove_entry(parent, name.as_bytes())?;
        self.destroy_inode(ino, &mut inode)?;

        let mut parent_inode = self.get_inode(parent)?;
        parent_inode.links_count = parent_inode.links_count.saturating_sub(1);
        self.write_inode(parent, &parent_inode)?;
        self.adjust_used_dirs(ino, -1)?;
        info!(path, ino = ino.0, "removed directory");
        Ok(())
    }

    // ── Rename ────────────────────────────────────────────────────────

    /// Rename an entry within its own directory. `new_name` is a bare name.
    pub fn rename(&mut self, cwd: InodeNumber, path: &str, new_name: &str) -> Result<()> {
        let (parent, ino, inode) = self.prepare_remove(cwd, path)?;
        validate_name(new_name.as_bytes())?;
        if self.search(parent, new_name.as_bytes())?.is_some() {
            return Err(E2fsError::AlreadyExists(new_name.to_owned()));
        }
        let (_, old_name) = crate::split_parent(path);
        let file_type = Ext2FileType::from_mode(inode.mode);

        self.add_entry(parent, ino, new_name.as_bytes(), file_type)?;
        if let Err(err) = self.remove_entry(parent, old_name.as_bytes()) {
            warn!(path, new_name, error = %err, "rename failed, removing new entry");
            if let Err(undo) = self.remove_entry(parent, new_name.as_bytes()) {
                warn!(error = %undo, "rename rollback failed");
            }
            return Err(err);
        }
        info!(path, new_name, ino = ino.0, "renamed entry");
        Ok(())
    }
}

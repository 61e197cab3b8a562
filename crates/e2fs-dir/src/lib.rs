#![forbid(unsafe_code)]
//! Directory block editing.
//!
//! Pure functions over one directory block: name lookup, entry insertion
//! (tombstone reuse, else splitting the trailing entry's slack), entry
//! removal (merge into the preceding record, or tombstone when first),
//! `.`/`..` initialisation and chain validation.
//!
//! Every edit keeps the invariant that `rec_len` values sum to the block
//! length. Corruption errors carry block 0; callers that know the block
//! number relabel them with [`at_block`].

use e2fs_error::{E2fsError, Result};
use e2fs_ondisk::{EXT2_DIR_ENTRY_HEADER_LEN, Ext2FileType, ideal_rec_len, iter_dir_block};
use e2fs_types::{EXT2_NAME_LEN, InodeNumber, ParseError, write_le_u16, write_le_u32};
use tracing::debug;

fn corrupt(detail: &str) -> E2fsError {
    E2fsError::Corruption {
        block: 0,
        detail: detail.to_owned(),
    }
}

/// Attach a block number to a corruption error raised by this crate.
#[must_use]
pub fn at_block(err: E2fsError, block: u32) -> E2fsError {
    match err {
        E2fsError::Corruption { block: 0, detail } => E2fsError::Corruption { block, detail },
        other => other,
    }
}

/// Check that `name` can be stored as a directory entry.
///
/// Rejects empty names, names over 255 bytes, `/` and NUL bytes, and the
/// reserved `.` and `..`.
pub fn validate_name(name: &[u8]) -> Result<()> {
    if name.len() > EXT2_NAME_LEN {
        return Err(E2fsError::NameTooLong(name.len()));
    }
    if name.is_empty() || name == b"." || name == b".." || name.iter().any(|b| *b == b'/' || *b == 0)
    {
        return Err(E2fsError::InvalidName(String::from_utf8_lossy(name).into_owned()));
    }
    Ok(())
}

/// Header of one record in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RawRecord {
    offset: usize,
    inode: u32,
    rec_len: usize,
    name_len: usize,
}

impl RawRecord {
    fn end(self) -> usize {
        self.offset + self.rec_len
    }

    fn name(self, block: &[u8]) -> &[u8] {
        let start = self.offset + EXT2_DIR_ENTRY_HEADER_LEN;
        &block[start..start + self.name_len]
    }
}

fn chain_error(err: &ParseError) -> E2fsError {
    match err {
        ParseError::InvalidField { reason, .. } => corrupt(reason),
        _ => corrupt("truncated directory entry"),
    }
}

/// Collect the whole record chain of a block.
///
/// Record rules are those of [`iter_dir_block`], so block edits and
/// listings agree on what a well-formed chain is.
fn records(block: &[u8]) -> Result<Vec<RawRecord>> {
    iter_dir_block(block)
        .map(|record| {
            let (offset, entry) = record.map_err(|err| chain_error(&err))?;
            let rec_len = usize::from(entry.rec_len);
            Ok(RawRecord {
                offset,
                inode: entry.inode,
                rec_len,
                // A tombstone's name bytes are meaningless; never slice past its span.
                name_len: usize::from(entry.name_len).min(rec_len - EXT2_DIR_ENTRY_HEADER_LEN),
            })
        })
        .collect()
}

fn write_entry(
    block: &mut [u8],
    offset: usize,
    ino: u32,
    rec_len: usize,
    file_type: Ext2FileType,
    name: &[u8],
) -> Result<()> {
    let name_len_u8 = u8::try_from(name.len()).map_err(|_| E2fsError::NameTooLong(name.len()))?;
    let rec_len_u16 = u16::try_from(rec_len)
        .map_err(|_| E2fsError::Format("directory entry rec_len exceeds u16".to_owned()))?;
    let end = offset
        .checked_add(rec_len)
        .ok_or_else(|| E2fsError::Format("directory entry offset overflow".to_owned()))?;
    if end > block.len() {
        return Err(corrupt("directory entry exceeds block boundary"));
    }
    if rec_len < ideal_rec_len(name.len()) {
        return Err(E2fsError::Format(
            "directory entry rec_len smaller than minimum".to_owned(),
        ));
    }

    write_le_u32(block, offset, ino)?;
    write_le_u16(block, offset + 4, rec_len_u16)?;
    block[offset + 6] = name_len_u8;
    block[offset + 7] = file_type.as_raw();
    let name_start = offset + EXT2_DIR_ENTRY_HEADER_LEN;
    block[name_start..name_start + name.len()].copy_from_slice(name);
    block[name_start + name.len()..end].fill(0);
    Ok(())
}

/// A live entry found by [`lookup_in_block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirSlot {
    pub offset: usize,
    pub inode: InodeNumber,
    pub file_type: Ext2FileType,
}

/// Find the live entry named exactly `name` (byte comparison).
pub fn lookup_in_block(block: &[u8], name: &[u8]) -> Result<Option<DirSlot>> {
    for rec in records(block)? {
        if rec.inode != 0 && rec.name(block) == name {
            return Ok(Some(DirSlot {
                offset: rec.offset,
                inode: InodeNumber(rec.inode),
                file_type: Ext2FileType::from_raw(block[rec.offset + 7]),
            }));
        }
    }
    Ok(None)
}

/// Insert an entry into a single directory block.
///
/// - A tombstoned record (`inode == 0`) whose span fits the new name is
///   reused in place, keeping its `rec_len`.
/// - Otherwise the trailing record is shrunk to its ideal length when its
///   slack covers the new entry, and the new entry takes the remainder.
///
/// Returns the offset of the new entry, or `None` when the block has no
/// room. The block is untouched in the `None` and error cases.
pub fn add_entry(
    block: &mut [u8],
    ino: InodeNumber,
    name: &[u8],
    file_type: Ext2FileType,
) -> Result<Option<usize>> {
    if ino.is_null() {
        return Err(E2fsError::Format(
            "directory entry inode cannot be zero".to_owned(),
        ));
    }
    if name.len() > EXT2_NAME_LEN {
        return Err(E2fsError::NameTooLong(name.len()));
    }
    if name.is_empty() {
        return Err(E2fsError::InvalidName(String::new()));
    }

    let need = ideal_rec_len(name.len());
    let chain = records(block)?;

    if let Some(slot) = chain.iter().find(|rec| rec.inode == 0 && rec.rec_len >= need) {
        write_entry(block, slot.offset, ino.0, slot.rec_len, file_type, name)?;
        debug!(ino = ino.0, offset = slot.offset, "reused tombstoned entry");
        return Ok(Some(slot.offset));
    }

    let Some(last) = chain.last().copied() else {
        return Ok(None);
    };
    let actual = ideal_rec_len(last.name_len);
    if last.inode == 0 || last.rec_len < actual + need {
        return Ok(None);
    }

    let actual_u16 = u16::try_from(actual)
        .map_err(|_| E2fsError::Format("actual rec_len exceeds u16".to_owned()))?;
    let new_off = last.offset + actual;
    write_entry(block, new_off, ino.0, last.rec_len - actual, file_type, name)?;
    write_le_u16(block, last.offset + 4, actual_u16)?;
    debug!(ino = ino.0, offset = new_off, "split trailing entry");
    Ok(Some(new_off))
}

/// Remove the live entry named `name` from a single directory block.
///
/// - If the entry has a predecessor in the block, the predecessor's
///   `rec_len` grows to absorb the removed span.
/// - If it is the first entry, only its inode field is zeroed; its span
///   remains as a reusable tombstone.
///
/// Returns the removed entry's inode number, or `None` if no live entry
/// has that name.
pub fn remove_entry(block: &mut [u8], name: &[u8]) -> Result<Option<InodeNumber>> {
    let chain = records(block)?;
    let Some(pos) = chain
        .iter()
        .position(|rec| rec.inode != 0 && rec.name(block) == name)
    else {
        return Ok(None);
    };
    let target = chain[pos];

    if let Some(prev) = pos.checked_sub(1).map(|p| chain[p]) {
        let merged = u16::try_from(prev.rec_len + target.rec_len)
            .map_err(|_| E2fsError::Format("merged rec_len exceeds u16".to_owned()))?;
        write_le_u16(block, prev.offset + 4, merged)?;
        debug!(offset = target.offset, into = prev.offset, "merged entry into predecessor");
    } else {
        write_le_u32(block, target.offset, 0)?;
        debug!(offset = target.offset, "tombstoned first entry");
    }
    Ok(Some(InodeNumber(target.inode)))
}

/// Initialize an empty directory block with `.` and `..` entries.
///
/// `.` gets the minimal 12-byte record and `..` spans the rest.
pub fn init_dir_block(block: &mut [u8], self_ino: InodeNumber, parent_ino: InodeNumber) -> Result<()> {
    let dot_len = ideal_rec_len(1);
    if block.len() < dot_len + ideal_rec_len(2) {
        return Err(E2fsError::Format(
            "directory block too small for . and .. entries".to_owned(),
        ));
    }
    block.fill(0);
    write_entry(block, 0, self_ino.0, dot_len, Ext2FileType::Dir, b".")?;
    write_entry(
        block,
        dot_len,
        parent_ino.0,
        block.len() - dot_len,
        Ext2FileType::Dir,
        b"..",
    )?;
    Ok(())
}

/// Whether the block holds no live entries besides `.` and `..`.
pub fn is_empty_dir_block(block: &[u8]) -> Result<bool> {
    Ok(records(block)?
        .iter()
        .filter(|rec| rec.inode != 0)
        .all(|rec| matches!(rec.name(block), b"." | b"..")))
}

/// Check the record chain: every `rec_len` is aligned, at least a header,
/// stays inside the block, and the chain covers the block exactly.
pub fn validate_chain(block: &[u8]) -> Result<()> {
    let span: usize = records(block)?.iter().map(|rec| rec.rec_len).sum();
    if span != block.len() {
        return Err(corrupt("rec_len chain does not cover the block"));
    }
    Ok(())
}

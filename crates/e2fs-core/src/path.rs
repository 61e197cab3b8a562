//! Path resolution.

use crate::Ext2Fs;
use e2fs_block::BlockDevice;
use e2fs_error::{E2fsError, Result};
use e2fs_types::InodeNumber;

/// Split `path` into its parent part and final component.
///
/// `"a"` gives `("", "a")`, `"/a"` gives `("/", "a")`, `"x/y/z"` gives
/// `("x/y", "z")`. Trailing separators are ignored.
#[must_use]
pub fn split_parent(path: &str) -> (&str, &str) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => ("/", &trimmed[1..]),
        Some(idx) => (&trimmed[..idx], &trimmed[idx + 1..]),
        None => ("", trimmed),
    }
}

impl<D: BlockDevice> Ext2Fs<D> {
    /// Resolve `path` starting at directory `start`.
    ///
    /// A leading `/` restarts at the root inode. Each component is looked
    /// up with [`Ext2Fs::search`]; `.` and `..` are ordinary entries. Returns
    /// `None` for an empty path, a missing component, or an intermediate
    /// component that is not a directory.
    pub fn resolve(&self, path: &str, start: InodeNumber) -> Result<Option<InodeNumber>> {
        if path.is_empty() {
            return Ok(None);
        }
        let mut current = if path.starts_with('/') {
            InodeNumber::ROOT
        } else {
            start
        };
        for component in path.split('/').filter(|c| !c.is_empty()) {
            if !self.get_inode(current)?.is_dir() {
                return Ok(None);
            }
            match self.search(current, component.as_bytes())? {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    /// Resolve `path`, turning a miss into `NotFound(path)`.
    pub fn lookup(&self, path: &str, start: InodeNumber) -> Result<InodeNumber> {
        self.resolve(path, start)?
            .ok_or_else(|| E2fsError::NotFound(path.to_owned()))
    }

    /// Resolve the parent directory of `path` and return it with the final
    /// component.
    pub(crate) fn resolve_parent<'p>(
        &self,
        path: &'p str,
        start: InodeNumber,
    ) -> Result<(InodeNumber, &'p str)> {
        let (parent, name) = split_parent(path);
        let dir = if parent.is_empty() {
            start
        } else {
            self.lookup(parent, start)?
        };
        if !self.get_inode(dir)?.is_dir() {
            return Err(E2fsError::NotDirectory(parent.to_owned()));
        }
        Ok((dir, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_image;
    use e2fs_ondisk::{Ext2FileType, Ext2Inode};
    use e2fs_types::{S_IFDIR, S_IFREG};

    #[test]
    fn split_parent_cases() {
        assert_eq!(split_parent("a"), ("", "a"));
        assert_eq!(split_parent("/a"), ("/", "a"));
        assert_eq!(split_parent("x/y/z"), ("x/y", "z"));
        assert_eq!(split_parent("/x/y/"), ("/x", "y"));
        assert_eq!(split_parent(""), ("", ""));
    }

    #[test]
    fn resolve_root_and_dots() {
        let (_, fs) = test_image::mount();
        let root = InodeNumber::ROOT;
        assert_eq!(fs.resolve("/", root).unwrap(), Some(root));
        assert_eq!(fs.resolve(".", root).unwrap(), Some(root));
        assert_eq!(fs.resolve("/../.", root).unwrap(), Some(root));
        assert_eq!(fs.resolve("", root).unwrap(), None);
        assert_eq!(fs.resolve("missing", root).unwrap(), None);
    }

    #[test]
    fn resolve_through_file_is_none() {
        let (_, fs) = test_image::mount();
        let file = Ext2Inode {
            mode: S_IFREG | 0o644,
            links_count: 1,
            ..Ext2Inode::default()
        };
        fs.write_inode(InodeNumber(12), &file).unwrap();
        fs.add_entry(InodeNumber::ROOT, InodeNumber(12), b"f", Ext2FileType::RegFile)
            .unwrap();
        assert_eq!(fs.resolve("/f", InodeNumber::ROOT).unwrap(), Some(InodeNumber(12)));
        assert_eq!(fs.resolve("/f/x", InodeNumber::ROOT).unwrap(), None);
        assert!(matches!(
            fs.resolve_parent("f/x", InodeNumber::ROOT),
            Err(E2fsError::NotDirectory(_))
        ));
    }

    #[test]
    fn relative_resolution_uses_start() {
        let (_, fs) = test_image::mount();
        let sub = Ext2Inode {
            mode: S_IFDIR | 0o755,
            links_count: 2,
            size: 1024,
            blocks: 2,
            block: {
                let mut b = [0; 15];
                b[0] = 40;
                b
            },
            ..Ext2Inode::default()
        };
        let mut block = vec![0_u8; 1024];
        e2fs_dir::init_dir_block(&mut block, InodeNumber(12), InodeNumber::ROOT).unwrap();
        fs.write_block(e2fs_types::BlockNumber(40), &block).unwrap();
        fs.write_inode(InodeNumber(12), &sub).unwrap();
        fs.add_entry(InodeNumber::ROOT, InodeNumber(12), b"sub", Ext2FileType::Dir)
            .unwrap();

        let sub_ino = InodeNumber(12);
        assert_eq!(fs.resolve("..", sub_ino).unwrap(), Some(InodeNumber::ROOT));
        assert_eq!(fs.resolve("/sub/..", sub_ino).unwrap(), Some(InodeNumber::ROOT));
        assert_eq!(fs.resolve("sub", InodeNumber::ROOT).unwrap(), Some(sub_ino));
        assert_eq!(fs.resolve("sub", sub_ino).unwrap(), None);
        assert_eq!(
            fs.resolve_parent("/sub/new", InodeNumber::ROOT).unwrap(),
            (sub_ino, "new")
        );
        assert!(matches!(
            fs.lookup("/nope", sub_ino),
            Err(E2fsError::NotFound(p)) if p == "/nope"
        ));
    }
}

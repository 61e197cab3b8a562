#![forbid(unsafe_code)]
//! Invariants that must hold across arbitrary command sequences.

use e2fs_core::{BlockNumber, E2fsError, Ext2Inode, InodeNumber};
use e2fs_harness::{ImageSpec, assert_consistent, check_consistency, install_file, mount_image, patterned_bytes};
use proptest::prelude::*;

const ROOT: InodeNumber = InodeNumber::ROOT;

fn pick(len: usize, arg: u16) -> usize {
    usize::from(arg) % len
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn counters_and_chains_stay_coherent_under_random_ops(
        ops in proptest::collection::vec((0_u8..5_u8, any::<u16>()), 1..200),
    ) {
        let spec = ImageSpec {
            blocks_count: 1200,
            blocks_per_group: 400,
            inodes_per_group: 24,
            ..ImageSpec::default()
        };
        let (_, mut fs) = mount_image(&spec).expect("image");
        let mut files: Vec<String> = Vec::new();
        let mut dirs: Vec<String> = Vec::new();

        for (step, (op, arg)) in ops.into_iter().enumerate() {
            let result = match op {
                0 => {
                    let name = format!("/f{step}");
                    fs.touch(ROOT, &name).map(|_| files.push(name))
                }
                1 => {
                    let name = format!("/d{step}");
                    fs.mkdir(ROOT, &name).map(|_| dirs.push(name))
                }
                2 if !files.is_empty() => {
                    let name = files.swap_remove(pick(files.len(), arg));
                    fs.rm(ROOT, &name)
                }
                3 if !dirs.is_empty() => {
                    let name = dirs.swap_remove(pick(dirs.len(), arg));
                    fs.rmdir(ROOT, &name)
                }
                4 if !dirs.is_empty() => {
                    let dir = dirs[pick(dirs.len(), arg)].clone();
                    let data = patterned_bytes(usize::from(arg) % 6000, (step % 200) as u8);
                    let parent = fs.lookup(&dir, ROOT).expect("dir exists");
                    install_file(&mut fs, parent, &format!("s{step}"), &data)
                        .map(|_| ())
                        .or_else(|err| match err.downcast::<E2fsError>() {
                            Ok(e) => Err(e),
                            Err(other) => panic!("harness failure: {other:#}"),
                        })
                        .map(|()| files.push(format!("{dir}/s{step}")))
                }
                _ => Ok(()),
            };
            match result {
                Ok(()) | Err(E2fsError::NoSpace | E2fsError::DirectoryFull(_) | E2fsError::NotEmpty(_)) => {}
                Err(other) => panic!("step {step}: unexpected {other:?}"),
            }
            let report = check_consistency(&fs).expect("check");
            prop_assert!(report.is_clean(), "step {} op {}: {:?}", step, op, report.problems);
        }
    }
}

#[test]
fn inode_exhaustion_fails_without_mutation() {
    let spec = ImageSpec {
        inodes_per_group: 16,
        ..ImageSpec::default()
    };
    let (mem, mut fs) = mount_image(&spec).expect("image");
    while fs.superblock().free_inodes_count > 0 {
        fs.alloc_inode().expect("alloc");
    }
    let before = mem.snapshot();
    assert!(matches!(fs.alloc_inode(), Err(E2fsError::NoSpace)));
    assert!(matches!(fs.touch(ROOT, "late"), Err(E2fsError::NoSpace)));
    assert_eq!(mem.snapshot(), before);
    assert_consistent(&fs).expect("consistent");
}

#[test]
fn block_exhaustion_fails_without_mutation() {
    let (mem, mut fs) = mount_image(&ImageSpec::default()).expect("image");
    let mut count = 0;
    while fs.alloc_block().is_ok() {
        count += 1;
    }
    assert!(count > 400);
    assert_eq!(fs.superblock().free_blocks_count, 0);
    let before = mem.snapshot();
    assert!(matches!(fs.alloc_block(), Err(E2fsError::NoSpace)));
    let free_inodes = fs.superblock().free_inodes_count;
    assert!(matches!(fs.mkdir(ROOT, "late"), Err(E2fsError::NoSpace)));
    assert_eq!(fs.superblock().free_inodes_count, free_inodes);
    assert_eq!(mem.snapshot(), before);
}

#[test]
fn inode_write_read_round_trip() {
    let (_, fs) = mount_image(&ImageSpec::default()).expect("image");
    let mut inode = Ext2Inode {
        mode: 0o100_600,
        uid: 1000,
        gid: 100,
        size: 12345,
        atime: 1,
        ctime: 2,
        mtime: 3,
        links_count: 4,
        blocks: 26,
        flags: 0x10,
        generation: 77,
        ..Ext2Inode::default()
    };
    for (i, slot) in inode.block.iter_mut().enumerate() {
        *slot = 100 + i as u32;
    }
    inode.osd2 = [9; 12];
    for n in [11_u32, 12, 40, 64] {
        fs.write_inode(InodeNumber(n), &inode).expect("write");
        assert_eq!(fs.get_inode(InodeNumber(n)).expect("read"), inode);
    }
    // Neighbours sharing the table block are untouched.
    assert!(fs.get_inode(ROOT).expect("root").is_dir());
}

#[test]
fn block_write_read_round_trip() {
    let (_, fs) = mount_image(&ImageSpec::default()).expect("image");
    let data = patterned_bytes(1024, 42);
    fs.write_block(BlockNumber(300), &data).expect("write");
    assert_eq!(fs.read_block(BlockNumber(300)).expect("read"), data);
    assert!(matches!(
        fs.read_block(BlockNumber(512)),
        Err(E2fsError::OutOfRange { block: 512, .. })
    ));
}

#[test]
fn path_resolution_is_deterministic() {
    let (_, mut fs) = mount_image(&ImageSpec::default()).expect("image");
    let a = fs.mkdir(ROOT, "a").expect("mkdir");
    fs.mkdir(a, "b").expect("mkdir");
    fs.touch(ROOT, "/a/b/c").expect("touch");

    let first = fs.resolve("/a/b/c", ROOT).expect("resolve");
    assert!(first.is_some());
    for _ in 0..5 {
        assert_eq!(fs.resolve("/a/b/c", ROOT).expect("resolve"), first);
        assert_eq!(fs.resolve("/a/./b/../b/c", ROOT).expect("resolve"), first);
    }
    assert_eq!(fs.resolve("/a/x/c", ROOT).expect("resolve"), None);
    assert_eq!(fs.resolve("/a/b/c/d", ROOT).expect("resolve"), None);
}

#[test]
fn directory_full_is_reported_and_rolled_back() {
    let (_, mut fs) = mount_image(&ImageSpec::default()).expect("image");
    let before = (
        fs.superblock().free_blocks_count,
        fs.superblock().free_inodes_count,
    );
    let mut made = 0;
    let err = loop {
        match fs.mkdir(ROOT, &format!("{made:0>120}")) {
            Ok(_) => made += 1,
            Err(err) => break err,
        }
    };
    assert!(matches!(err, E2fsError::DirectoryFull(_)), "{err:?}");
    assert!(made > 0);
    assert_eq!(fs.superblock().free_inodes_count, before.1 - made);
    assert_eq!(fs.superblock().free_blocks_count, before.0 - made);
    assert_consistent(&fs).expect("consistent");
}

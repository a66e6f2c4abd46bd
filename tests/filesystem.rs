//! End-to-end scenarios on a 20-block disk: 1 superblock, 2 inode blocks,
//! 256 inodes, data region 3..=19 (17 blocks).

use minnowfs::layout::MAX_FILE_SIZE;
use minnowfs::{Disk, FileSystem, FsError, BLOCK_SIZE};

fn fresh(nblocks: usize) -> FileSystem {
    let mut fs = FileSystem::new(Disk::new(nblocks));
    fs.format().unwrap();
    fs.mount().unwrap();
    fs
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

#[test]
fn format_then_mount_fresh() {
    let fs = fresh(20);
    let report = fs.debug().unwrap();
    assert!(report.magic_valid);
    assert_eq!(report.superblock.nblocks, 20);
    assert_eq!(report.superblock.ninodeblocks, 2);
    assert_eq!(report.superblock.ninodes, 256);
    assert!(report.inodes.is_empty());
    // only the superblock and the two inode blocks are in use
    assert_eq!(fs.free_blocks().unwrap(), 17);
}

#[test]
fn small_write_and_read_back() {
    let mut fs = fresh(20);
    let inumber = fs.create().unwrap();
    assert_eq!(inumber, 1);
    assert_eq!(fs.write(inumber, 0, b"hello").unwrap(), 5);
    assert_eq!(fs.getsize(inumber).unwrap(), 5);

    let mut buf = [0u8; 5];
    assert_eq!(fs.read(inumber, 0, &mut buf).unwrap(), 5);
    assert_eq!(&buf, b"hello");

    // the first free data block is 3
    let report = fs.debug().unwrap();
    assert_eq!(report.inodes.len(), 1);
    assert_eq!(report.inodes[0].inumber, 1);
    assert_eq!(report.inodes[0].direct, vec![3]);
    assert_eq!(report.inodes[0].indirect, None);
    assert_eq!(fs.free_blocks().unwrap(), 16);
}

#[test]
fn write_crossing_the_indirect_boundary() {
    let mut fs = fresh(20);
    let first = fs.create().unwrap();
    fs.write(first, 0, b"hello").unwrap();

    let second = fs.create().unwrap();
    assert_eq!(second, 2);
    let len = 5 * BLOCK_SIZE + 100;
    assert_eq!(fs.write(second, 0, &vec![0u8; len]).unwrap(), len);
    assert_eq!(fs.getsize(second).unwrap(), len);

    // 5 direct blocks, the indirect pointer block and one indirect data block
    let report = fs.debug().unwrap();
    let inode = report.inodes.iter().find(|i| i.inumber == 2).unwrap();
    assert_eq!(inode.direct, vec![4, 5, 6, 7, 8]);
    assert_eq!(inode.indirect, Some(9));
    assert_eq!(inode.indirect_data, vec![10]);
    assert_eq!(fs.free_blocks().unwrap(), 17 - 1 - 7);

    let mut buf = vec![0xffu8; len];
    assert_eq!(fs.read(second, 0, &mut buf).unwrap(), len);
    assert!(buf.iter().all(|&b| b == 0));
}

#[test]
fn exhaustion_mid_write_returns_partial_count() {
    let mut fs = fresh(20);
    let inumber = fs.create().unwrap();

    // 17 data blocks exist; one goes to the indirect pointer block, so at
    // most 16 blocks of file data fit.
    let written = fs.write(inumber, 0, &vec![0u8; MAX_FILE_SIZE]).unwrap();
    assert_eq!(written, 16 * BLOCK_SIZE);
    assert_eq!(fs.getsize(inumber).unwrap(), written);
    assert_eq!(fs.free_blocks().unwrap(), 0);

    // inode slots remain, but the very first write finds no free block
    let starved = fs.create().unwrap();
    assert_eq!(fs.write(starved, 0, b"x").unwrap(), 0);
    assert_eq!(fs.getsize(starved).unwrap(), 0);
}

#[test]
fn partial_overwrite_preserves_the_rest_of_the_block() {
    let mut fs = fresh(20);
    let inumber = fs.create().unwrap();
    fs.write(inumber, 0, b"hello").unwrap();

    assert_eq!(fs.write(inumber, 3, b"WORLD").unwrap(), 5);
    assert_eq!(fs.getsize(inumber).unwrap(), 8);

    let mut buf = [0u8; 8];
    assert_eq!(fs.read(inumber, 0, &mut buf).unwrap(), 8);
    assert_eq!(&buf, b"helWORLD");
}

#[test]
fn delete_reclaims_every_block() {
    let mut fs = fresh(20);
    let first = fs.create().unwrap();
    fs.write(first, 0, b"hello").unwrap();

    let second = fs.create().unwrap();
    let len = 5 * BLOCK_SIZE + 100;
    fs.write(second, 0, &vec![0u8; len]).unwrap();
    assert_eq!(fs.free_blocks().unwrap(), 9);

    fs.delete(second).unwrap();
    assert_eq!(fs.free_blocks().unwrap(), 16);
    assert!(fs.debug().unwrap().inodes.iter().all(|i| i.inumber != 2));

    // deleting again is an error and leaves the bitmap alone
    assert!(matches!(fs.delete(second), Err(FsError::InvalidInode(2))));
    assert_eq!(fs.free_blocks().unwrap(), 16);

    // the reclaimed blocks are enough for another 7-block file
    let third = fs.create().unwrap();
    assert_eq!(fs.write(third, 0, &vec![1u8; len]).unwrap(), len);
}

#[test]
fn round_trip_across_the_boundary() {
    let mut fs = fresh(20);
    let inumber = fs.create().unwrap();
    let data = pattern(6 * BLOCK_SIZE + 123);

    assert_eq!(fs.write(inumber, 0, &data).unwrap(), data.len());
    let mut buf = vec![0u8; data.len()];
    assert_eq!(fs.read(inumber, 0, &mut buf).unwrap(), data.len());
    assert_eq!(buf, data);
}

#[test]
fn reads_are_clamped_to_end_of_file() {
    let mut fs = fresh(20);
    let inumber = fs.create().unwrap();
    fs.write(inumber, 0, b"hello").unwrap();

    let mut buf = [0xffu8; 64];
    assert_eq!(fs.read(inumber, 0, &mut buf).unwrap(), 5);
    assert_eq!(&buf[..5], b"hello");
    assert_eq!(fs.read(inumber, 2, &mut buf).unwrap(), 3);
    assert_eq!(&buf[..3], b"llo");
    assert_eq!(fs.read(inumber, 5, &mut buf).unwrap(), 0);
    assert_eq!(fs.read(inumber, 5000, &mut buf).unwrap(), 0);
}

#[test]
fn offsets_past_the_last_block_are_pulled_back() {
    let mut fs = fresh(20);
    let inumber = fs.create().unwrap();
    fs.write(inumber, 0, b"hello").unwrap();

    // a hole cannot be created: the write lands at the end of block 0
    assert_eq!(fs.write(inumber, 3 * BLOCK_SIZE, b"x").unwrap(), 1);
    assert_eq!(fs.getsize(inumber).unwrap(), BLOCK_SIZE + 1);

    let mut buf = [0u8; 2];
    assert_eq!(fs.read(inumber, BLOCK_SIZE, &mut buf).unwrap(), 1);
    assert_eq!(buf[0], b'x');

    // the unwritten remainder of the first block reads back as zeros
    let mut tail = [0xffu8; 16];
    assert_eq!(fs.read(inumber, 5, &mut tail).unwrap(), 16);
    assert!(tail.iter().all(|&b| b == 0));
}

#[test]
fn append_at_the_exact_direct_boundary() {
    let mut fs = fresh(20);
    let inumber = fs.create().unwrap();
    let head = pattern(5 * BLOCK_SIZE);
    assert_eq!(fs.write(inumber, 0, &head).unwrap(), head.len());
    assert_eq!(fs.debug().unwrap().inodes[0].indirect, None);

    // first byte past the direct region allocates the indirect block
    assert_eq!(fs.write(inumber, 5 * BLOCK_SIZE, b"!").unwrap(), 1);
    assert_eq!(fs.getsize(inumber).unwrap(), 5 * BLOCK_SIZE + 1);
    assert!(fs.debug().unwrap().inodes[0].indirect.is_some());

    let mut buf = [0u8; 1];
    assert_eq!(fs.read(inumber, 5 * BLOCK_SIZE, &mut buf).unwrap(), 1);
    assert_eq!(&buf, b"!");
}

#[test]
fn files_never_share_blocks() {
    let mut fs = fresh(20);
    let first = fs.create().unwrap();
    fs.write(first, 0, &pattern(2 * BLOCK_SIZE)).unwrap();
    let second = fs.create().unwrap();
    fs.write(second, 0, &pattern(6 * BLOCK_SIZE)).unwrap();

    let report = fs.debug().unwrap();
    let mut seen = std::collections::HashSet::new();
    for inode in &report.inodes {
        for &block in inode
            .direct
            .iter()
            .chain(inode.indirect.iter())
            .chain(inode.indirect_data.iter())
        {
            assert!((3..20).contains(&block));
            assert!(seen.insert(block), "block {block} is referenced twice");
        }
    }
}

#[test]
fn remount_observes_the_same_contents() {
    let mut fs = fresh(20);
    let first = fs.create().unwrap();
    let second = fs.create().unwrap();
    let small = pattern(100);
    let large = pattern(5 * BLOCK_SIZE + 77);
    fs.write(first, 0, &small).unwrap();
    fs.write(second, 0, &large).unwrap();
    let free = fs.free_blocks().unwrap();

    fs.unmount();
    let mut fs = FileSystem::new(fs.into_inner());
    fs.mount().unwrap();

    assert_eq!(fs.free_blocks().unwrap(), free);
    assert_eq!(fs.getsize(first).unwrap(), small.len());
    assert_eq!(fs.getsize(second).unwrap(), large.len());
    let mut buf = vec![0u8; large.len()];
    assert_eq!(fs.read(second, 0, &mut buf).unwrap(), large.len());
    assert_eq!(buf, large);
    buf.truncate(small.len());
    assert_eq!(fs.read(first, 0, &mut buf).unwrap(), small.len());
    assert_eq!(buf, small);

    // new allocations after the rebuild do not clobber existing files
    let third = fs.create().unwrap();
    fs.write(third, 0, &pattern(3 * BLOCK_SIZE)).unwrap();
    let mut again = vec![0u8; small.len()];
    fs.read(first, 0, &mut again).unwrap();
    assert_eq!(again, small);
}

#[test]
fn mount_rejects_out_of_range_pointers() {
    let mut fs = fresh(20);
    let inumber = fs.create().unwrap();
    fs.write(inumber, 0, b"hello").unwrap();
    fs.unmount();

    // inode 1 lives in block 1 at byte 32; direct[0] is at byte 40
    let mut image = fs.into_inner().into_vec();
    let slot = BLOCK_SIZE + 32;
    image[slot + 8..slot + 12].copy_from_slice(&1u32.to_le_bytes());

    let mut fs = FileSystem::new(Disk::from_vec(image).unwrap());
    assert!(matches!(fs.mount(), Err(FsError::BadBlockPointer(1))));
    assert!(!fs.is_mounted());
}

#[test]
fn mount_rejects_oversize_files() {
    let mut fs = fresh(20);
    let inumber = fs.create().unwrap();
    fs.write(inumber, 0, b"hello").unwrap();
    fs.unmount();

    let mut image = fs.into_inner().into_vec();
    let slot = BLOCK_SIZE + 32;
    image[slot + 4..slot + 8].copy_from_slice(&u32::MAX.to_le_bytes());

    let mut fs = FileSystem::new(Disk::from_vec(image).unwrap());
    assert!(matches!(fs.mount(), Err(FsError::OversizeFile(_))));
}

#[test]
fn delete_recovers_a_corrupt_inode() {
    let mut fs = fresh(20);
    let inumber = fs.create().unwrap();
    fs.write(inumber, 0, &pattern(2 * BLOCK_SIZE)).unwrap();
    fs.unmount();

    // corrupt direct[1] only; direct[0] stays valid and must be reclaimed
    let mut image = fs.into_inner().into_vec();
    let slot = BLOCK_SIZE + 32;
    image[slot + 12..slot + 16].copy_from_slice(&500u32.to_le_bytes());

    let mut fs = FileSystem::new(Disk::from_vec(image).unwrap());
    assert!(matches!(fs.mount(), Err(FsError::BadBlockPointer(500))));

    // repair by hand: shrink the file to the uncorrupted prefix
    let mut image = fs.into_inner().into_vec();
    image[slot + 4..slot + 8].copy_from_slice(&(BLOCK_SIZE as u32).to_le_bytes());
    let mut fs = FileSystem::new(Disk::from_vec(image).unwrap());
    fs.mount().unwrap();
    fs.delete(inumber).unwrap();
    assert_eq!(fs.free_blocks().unwrap(), 17);
}

#[test]
fn smallest_possible_device() {
    let mut fs = fresh(3);
    let report = fs.debug().unwrap();
    assert_eq!(report.superblock.ninodeblocks, 1);
    assert_eq!(fs.free_blocks().unwrap(), 1);

    let inumber = fs.create().unwrap();
    let written = fs.write(inumber, 0, &pattern(2 * BLOCK_SIZE)).unwrap();
    assert_eq!(written, BLOCK_SIZE);
    let mut buf = vec![0u8; BLOCK_SIZE];
    assert_eq!(fs.read(inumber, 0, &mut buf).unwrap(), BLOCK_SIZE);
    assert_eq!(buf, &pattern(2 * BLOCK_SIZE)[..BLOCK_SIZE]);
}

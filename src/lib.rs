//! A Unix-style inode filesystem over a fixed-size block device.
//!
//! Files are flat byte ranges addressed by integer inode numbers; there are
//! no directories, names or permissions. Each inode maps its bytes through
//! five direct block pointers plus one indirect pointer block, giving a
//! maximum file size of [`layout::MAX_FILE_SIZE`] bytes. Free space is
//! tracked by an in-memory bitmap that [`FileSystem::mount`] rebuilds by
//! scanning the inode table; nothing but the superblock, the inodes and the
//! data blocks themselves ever hits the disk.
//!
//! ```
//! use minnowfs::{Disk, FileSystem};
//!
//! let mut fs = FileSystem::new(Disk::new(20));
//! fs.format()?;
//! fs.mount()?;
//!
//! let inumber = fs.create()?;
//! fs.write(inumber, 0, b"hello")?;
//! let mut buf = [0u8; 5];
//! fs.read(inumber, 0, &mut buf)?;
//! assert_eq!(&buf, b"hello");
//! # Ok::<(), minnowfs::FsError>(())
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod bitmap;
pub mod disk;
pub mod fs;
pub mod layout;

pub use disk::{BlockDevice, Disk, DiskError, BLOCK_SIZE};
pub use fs::{DebugReport, FileSystem, FsError, InodeReport, Inumber};

//! The filesystem proper: a handle owning the block device and, while
//! mounted, the superblock and free-block bitmap. The bitmap is never
//! stored on disk; mount rebuilds it by walking every valid inode.

use alloc::vec::Vec;
use core::fmt;

use log::warn;
use thiserror_no_std::Error;

use crate::bitmap::Bitmap;
use crate::disk::{BlockDevice, Disk, DiskError, BLOCK_SIZE};
use crate::layout::{
    inode_location, BlockPtr, Inode, PointerBlock, Superblock, INODES_PER_BLOCK, INODE_SIZE,
    INODE_TABLE_START, MAGIC, MAX_FILE_BLOCKS, MAX_FILE_SIZE, POINTERS_PER_INODE,
};

/// Identifier of an inode, `1..ninodes`. Inode 0 is reserved and never
/// handed out by [`FileSystem::create`].
pub type Inumber = u32;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("no filesystem is mounted")]
    NotMounted,
    #[error("cannot format while a filesystem is mounted")]
    AlreadyMounted,
    #[error("bad magic number {0:#010x} in superblock")]
    BadMagic(u32),
    #[error("device has {0} blocks, at least 3 are required")]
    DeviceTooSmall(usize),
    #[error("superblock does not match the device geometry")]
    BadSuperblock,
    #[error("inode number {0} is out of range")]
    BadInumber(Inumber),
    #[error("inode {0} is not valid")]
    InvalidInode(Inumber),
    #[error("no free inode slot is available")]
    NoFreeInode,
    #[error("block pointer {0} is outside the data region")]
    BadBlockPointer(u32),
    #[error("file size {0} exceeds the representable maximum")]
    OversizeFile(u32),
    #[error("{0}")]
    Disk(#[from] DiskError),
}

struct MountState {
    superblock: Superblock,
    bitmap: Bitmap,
}

/// A (possibly mounted) filesystem over a block device.
///
/// The handle owns the device; the mounted-flag and free-block bitmap live
/// in the `Option<MountState>` field, so their lifetime is exactly the
/// mount. [`FileSystem::into_inner`] gives the device back, letting a later
/// handle remount the same image.
pub struct FileSystem<D = Disk> {
    disk: D,
    mount: Option<MountState>,
}

impl<D: BlockDevice> FileSystem<D> {
    /// Wraps a device in an unmounted handle.
    pub fn new(disk: D) -> Self {
        Self { disk, mount: None }
    }

    pub fn is_mounted(&self) -> bool {
        self.mount.is_some()
    }

    /// Releases the mount state, if any. On-disk contents are unaffected;
    /// all data and inode writes have already been issued.
    pub fn unmount(&mut self) {
        self.mount = None;
    }

    /// Consumes the handle and returns the device.
    pub fn into_inner(self) -> D {
        self.disk
    }

    /// Writes an empty filesystem: a fresh superblock and an inode table
    /// with every slot invalid. Roughly a tenth of the device, rounded up,
    /// is reserved for the inode table. The data region is left untouched;
    /// mount recomputes reachability from the inodes alone.
    pub fn format(&mut self) -> Result<(), FsError> {
        if self.mount.is_some() {
            return Err(FsError::AlreadyMounted);
        }
        let nblocks = self.disk.size();
        if nblocks < 3 {
            return Err(FsError::DeviceTooSmall(nblocks));
        }
        let ninodeblocks = nblocks.div_ceil(10);

        let superblock = Superblock {
            magic: MAGIC,
            nblocks: nblocks as u32,
            ninodeblocks: ninodeblocks as u32,
            ninodes: (ninodeblocks * INODES_PER_BLOCK) as u32,
        };
        self.disk.write(0, &superblock.encode())?;

        // An all-zero block is a full block of invalid inodes.
        let zeroes = [0; BLOCK_SIZE];
        for block in INODE_TABLE_START..INODE_TABLE_START + ninodeblocks {
            self.disk.write(block, &zeroes)?;
        }
        Ok(())
    }

    /// Reads the superblock and rebuilds the free-block bitmap by scanning
    /// every valid inode. Any prior mount state is released first, so
    /// remounting never leaks. An out-of-range reachable pointer or an
    /// oversize file aborts the mount.
    pub fn mount(&mut self) -> Result<(), FsError> {
        self.mount = None;

        let mut buf = [0; BLOCK_SIZE];
        self.disk.read(0, &mut buf)?;
        let superblock = Superblock::decode(&buf);
        if superblock.magic != MAGIC {
            return Err(FsError::BadMagic(superblock.magic));
        }
        let nblocks = superblock.nblocks as usize;
        let ninodeblocks = superblock.ninodeblocks as usize;
        if nblocks != self.disk.size()
            || ninodeblocks == 0
            || ninodeblocks + 1 >= nblocks
            || superblock.ninodes as usize != ninodeblocks * INODES_PER_BLOCK
        {
            return Err(FsError::BadSuperblock);
        }

        let mut bitmap = Bitmap::new(nblocks);
        bitmap.set(0);
        for block in INODE_TABLE_START..=ninodeblocks {
            bitmap.set(block);
        }

        for block in INODE_TABLE_START..=ninodeblocks {
            self.disk.read(block, &mut buf)?;
            for slot in 0..INODES_PER_BLOCK {
                let inode = Inode::decode(&buf[slot * INODE_SIZE..]);
                if !inode.valid {
                    continue;
                }
                let used = inode.block_count();
                if used > MAX_FILE_BLOCKS {
                    return Err(FsError::OversizeFile(inode.size));
                }
                for k in 0..used.min(POINTERS_PER_INODE) {
                    bitmap.set(checked_index(&superblock, inode.direct[k])?);
                }
                if used > POINTERS_PER_INODE {
                    let indirect = checked_index(&superblock, inode.indirect)?;
                    bitmap.set(indirect);
                    let mut pointer_buf = [0; BLOCK_SIZE];
                    self.disk.read(indirect, &mut pointer_buf)?;
                    let pointers = PointerBlock::decode(&pointer_buf);
                    for k in 0..used - POINTERS_PER_INODE {
                        bitmap.set(checked_index(&superblock, pointers.get(k))?);
                    }
                }
            }
        }

        self.mount = Some(MountState { superblock, bitmap });
        Ok(())
    }

    /// Claims the first invalid inode slot, in table order, skipping the
    /// reserved inode 0. The new inode is valid with size 0 and no blocks.
    pub fn create(&mut self) -> Result<Inumber, FsError> {
        let superblock = self.state()?.superblock;
        let mut buf = [0; BLOCK_SIZE];
        for block_ix in 0..superblock.ninodeblocks as usize {
            self.disk.read(INODE_TABLE_START + block_ix, &mut buf)?;
            for slot in 0..INODES_PER_BLOCK {
                if block_ix == 0 && slot == 0 {
                    continue;
                }
                let offset = slot * INODE_SIZE;
                if Inode::decode(&buf[offset..]).valid {
                    continue;
                }
                let mut inode = Inode::empty();
                inode.valid = true;
                inode.encode(&mut buf[offset..offset + INODE_SIZE]);
                self.disk.write(INODE_TABLE_START + block_ix, &buf)?;
                return Ok((block_ix * INODES_PER_BLOCK + slot) as Inumber);
            }
        }
        Err(FsError::NoFreeInode)
    }

    /// Frees every block reachable from the inode, then invalidates it.
    ///
    /// Corrupt metadata is recovered best-effort: out-of-range pointers are
    /// skipped with a warning and an oversize block count is clamped, but
    /// the inode is still reclaimed and `Ok` returned. Only a bad inode
    /// number or an already-invalid inode is an error.
    pub fn delete(&mut self, inumber: Inumber) -> Result<(), FsError> {
        let Self { disk, mount } = self;
        let state = mount.as_mut().ok_or(FsError::NotMounted)?;
        checked_inumber(&state.superblock, inumber)?;
        let inode = load_inode(disk, inumber)?;
        if !inode.valid {
            return Err(FsError::InvalidInode(inumber));
        }

        let mut used = inode.block_count();
        if used > MAX_FILE_BLOCKS {
            warn!(
                "inode {inumber}: size {} exceeds the representable maximum, reclaiming what is reachable",
                inode.size
            );
            used = MAX_FILE_BLOCKS;
        }
        for k in 0..used.min(POINTERS_PER_INODE) {
            match checked_index(&state.superblock, inode.direct[k]) {
                Ok(index) => state.bitmap.clear(index),
                Err(err) => warn!("inode {inumber}: direct block {k} not freed: {err}"),
            }
        }
        if used > POINTERS_PER_INODE {
            match checked_index(&state.superblock, inode.indirect) {
                Ok(indirect) => {
                    let mut buf = [0; BLOCK_SIZE];
                    disk.read(indirect, &mut buf)?;
                    let pointers = PointerBlock::decode(&buf);
                    for k in 0..used - POINTERS_PER_INODE {
                        match checked_index(&state.superblock, pointers.get(k)) {
                            Ok(index) => state.bitmap.clear(index),
                            Err(err) => {
                                warn!("inode {inumber}: indirect block {k} not freed: {err}")
                            }
                        }
                    }
                    state.bitmap.clear(indirect);
                }
                Err(err) => warn!("inode {inumber}: indirect pointer block not freed: {err}"),
            }
        }

        store_inode(disk, inumber, &Inode::empty())?;
        Ok(())
    }

    /// Size of the file in bytes.
    pub fn getsize(&self, inumber: Inumber) -> Result<usize, FsError> {
        let state = self.state()?;
        checked_inumber(&state.superblock, inumber)?;
        let inode = load_inode(&self.disk, inumber)?;
        if !inode.valid {
            return Err(FsError::InvalidInode(inumber));
        }
        Ok(inode.size as usize)
    }

    /// Reads up to `buf.len()` bytes starting at `offset` into `buf`,
    /// returning how many were read. The count is clamped at end-of-file;
    /// reading at or past it returns `Ok(0)`.
    ///
    /// On an out-of-range block pointer the read stops and reports the
    /// bytes already delivered.
    pub fn read(&self, inumber: Inumber, offset: usize, buf: &mut [u8]) -> Result<usize, FsError> {
        let state = self.state()?;
        checked_inumber(&state.superblock, inumber)?;
        let inode = load_inode(&self.disk, inumber)?;
        if !inode.valid {
            return Err(FsError::InvalidInode(inumber));
        }

        let size = inode.size as usize;
        if offset >= size {
            return Ok(0);
        }
        let length = buf.len().min(size - offset);

        let mut pointers = None;
        let mut done = 0;
        let mut block = [0; BLOCK_SIZE];
        while done < length {
            let position = offset + done;
            let index = match self.locate_block(
                &state.superblock,
                &inode,
                position / BLOCK_SIZE,
                &mut pointers,
            ) {
                Ok(index) => index,
                Err(err) => {
                    warn!("inode {inumber}: read stopped after {done} bytes: {err}");
                    return Ok(done);
                }
            };
            self.disk.read(index, &mut block)?;
            let byte = position % BLOCK_SIZE;
            let n = (length - done).min(BLOCK_SIZE - byte);
            buf[done..done + n].copy_from_slice(&block[byte..byte + n]);
            done += n;
        }
        Ok(done)
    }

    /// Writes `data` starting at `offset`, allocating data blocks (and the
    /// indirect block, at the boundary crossing) on demand, and returns how
    /// many bytes were written. The file size grows to cover the write,
    /// capped at [`MAX_FILE_SIZE`].
    ///
    /// Holes are not supported: an offset past the end of the last
    /// allocated block is pulled back to it, so appends land densely. When
    /// the device fills up mid-write the call stops, persists what was
    /// written and returns the partial count.
    pub fn write(&mut self, inumber: Inumber, offset: usize, data: &[u8]) -> Result<usize, FsError> {
        let Self { disk, mount } = self;
        let state = mount.as_mut().ok_or(FsError::NotMounted)?;
        checked_inumber(&state.superblock, inumber)?;
        let mut inode = load_inode(disk, inumber)?;
        if !inode.valid {
            return Err(FsError::InvalidInode(inumber));
        }

        let old_size = inode.size as usize;
        let mut old_nblocks = inode.block_count();
        if old_nblocks > MAX_FILE_BLOCKS {
            warn!(
                "inode {inumber}: size {} exceeds the representable maximum",
                inode.size
            );
            old_nblocks = MAX_FILE_BLOCKS;
        }
        let offset = offset.min(old_nblocks * BLOCK_SIZE);
        let length = data.len().min(MAX_FILE_SIZE - offset);

        let mut pointers: Option<PointerBlock> = None;
        let mut indirect_index = None;
        let mut pointers_dirty = false;
        let mut inode_dirty = false;
        let mut written = 0;
        let mut block = [0; BLOCK_SIZE];

        while written < length {
            let position = offset + written;
            let logical = position / BLOCK_SIZE;

            // Crossing into the indirect region: persist a grown direct
            // array, then bring in the pointer block, allocating it if the
            // file never needed one before.
            if logical >= POINTERS_PER_INODE && pointers.is_none() {
                if inode_dirty {
                    store_inode(disk, inumber, &inode)?;
                    inode_dirty = false;
                }
                if old_nblocks > POINTERS_PER_INODE {
                    let index = match checked_index(&state.superblock, inode.indirect) {
                        Ok(index) => index,
                        Err(err) => {
                            warn!("inode {inumber}: write stopped after {written} bytes: {err}");
                            break;
                        }
                    };
                    disk.read(index, &mut block)?;
                    pointers = Some(PointerBlock::decode(&block));
                    indirect_index = Some(index);
                } else {
                    match allocate_block(&mut state.bitmap) {
                        Some(pointer) => {
                            indirect_index = Some(pointer.get() as usize);
                            inode.indirect = Some(pointer);
                            inode_dirty = true;
                            pointers = Some(PointerBlock::zeroed());
                            pointers_dirty = true;
                        }
                        None => {
                            warn!(
                                "inode {inumber}: device is full, wrote {written} of {length} bytes"
                            );
                            break;
                        }
                    }
                }
            }

            let fresh = logical >= old_nblocks;
            let pointer = if fresh {
                match allocate_block(&mut state.bitmap) {
                    Some(pointer) => {
                        if logical < POINTERS_PER_INODE {
                            inode.direct[logical] = Some(pointer);
                            inode_dirty = true;
                        } else if let Some(pointers) = &mut pointers {
                            pointers.set(logical - POINTERS_PER_INODE, pointer);
                            pointers_dirty = true;
                        }
                        Some(pointer)
                    }
                    None => {
                        warn!("inode {inumber}: device is full, wrote {written} of {length} bytes");
                        break;
                    }
                }
            } else if logical < POINTERS_PER_INODE {
                inode.direct[logical]
            } else {
                pointers
                    .as_ref()
                    .and_then(|pointers| pointers.get(logical - POINTERS_PER_INODE))
            };

            let index = match checked_index(&state.superblock, pointer) {
                Ok(index) => index,
                Err(err) => {
                    warn!("inode {inumber}: write stopped after {written} bytes: {err}");
                    break;
                }
            };

            let byte = position % BLOCK_SIZE;
            let n = (length - written).min(BLOCK_SIZE - byte);
            if n < BLOCK_SIZE {
                if fresh {
                    // unwritten bytes of a fresh block read back as zeros
                    block = [0; BLOCK_SIZE];
                } else {
                    disk.read(index, &mut block)?;
                }
            }
            block[byte..byte + n].copy_from_slice(&data[written..written + n]);
            disk.write(index, &block)?;
            written += n;
        }

        // The pointer block lands before the inode so a durable inode never
        // names an unwritten pointer block.
        if pointers_dirty {
            if let (Some(index), Some(pointers)) = (indirect_index, &pointers) {
                disk.write(index, &pointers.encode())?;
            }
        }
        let new_size = old_size.max(offset + written).min(MAX_FILE_SIZE);
        if new_size != old_size {
            inode.size = new_size as u32;
            inode_dirty = true;
        }
        if inode_dirty {
            store_inode(disk, inumber, &inode)?;
        }
        Ok(written)
    }

    /// Number of blocks currently free for allocation.
    pub fn free_blocks(&self) -> Result<usize, FsError> {
        let state = self.state()?;
        Ok(state.bitmap.len() - state.bitmap.count_ones())
    }

    /// Dumps the superblock and every valid inode. Works on an unmounted
    /// handle; only the raw disk is consulted.
    pub fn debug(&self) -> Result<DebugReport, FsError> {
        let mut buf = [0; BLOCK_SIZE];
        self.disk.read(0, &mut buf)?;
        let superblock = Superblock::decode(&buf);
        let magic_valid = superblock.magic == MAGIC;

        let mut inodes = Vec::new();
        if magic_valid {
            for block_ix in 0..superblock.ninodeblocks as usize {
                self.disk.read(INODE_TABLE_START + block_ix, &mut buf)?;
                for slot in 0..INODES_PER_BLOCK {
                    let inode = Inode::decode(&buf[slot * INODE_SIZE..]);
                    if !inode.valid {
                        continue;
                    }
                    let used = inode.block_count().min(MAX_FILE_BLOCKS);
                    let direct = inode.direct[..used.min(POINTERS_PER_INODE)]
                        .iter()
                        .map(|pointer| pointer.map_or(0, BlockPtr::get))
                        .collect();
                    let mut indirect = None;
                    let mut indirect_data = Vec::new();
                    if used > POINTERS_PER_INODE {
                        let raw = inode.indirect.map_or(0, BlockPtr::get);
                        indirect = Some(raw);
                        if checked_index(&superblock, inode.indirect).is_ok() {
                            let mut pointer_buf = [0; BLOCK_SIZE];
                            self.disk.read(raw as usize, &mut pointer_buf)?;
                            let pointers = PointerBlock::decode(&pointer_buf);
                            for k in 0..used - POINTERS_PER_INODE {
                                indirect_data.push(pointers.get(k).map_or(0, BlockPtr::get));
                            }
                        }
                    }
                    inodes.push(InodeReport {
                        inumber: (block_ix * INODES_PER_BLOCK + slot) as Inumber,
                        size: inode.size,
                        direct,
                        indirect,
                        indirect_data,
                    });
                }
            }
        }
        Ok(DebugReport {
            superblock,
            magic_valid,
            inodes,
        })
    }

    fn state(&self) -> Result<&MountState, FsError> {
        self.mount.as_ref().ok_or(FsError::NotMounted)
    }

    // Resolves a logical block number to its on-disk index, pulling the
    // pointer block in on first use past the direct region.
    fn locate_block(
        &self,
        superblock: &Superblock,
        inode: &Inode,
        logical: usize,
        pointers: &mut Option<PointerBlock>,
    ) -> Result<usize, FsError> {
        if logical < POINTERS_PER_INODE {
            return checked_index(superblock, inode.direct[logical]);
        }
        if logical >= MAX_FILE_BLOCKS {
            return Err(FsError::OversizeFile(inode.size));
        }
        let pointers = match pointers {
            Some(pointers) => pointers,
            None => {
                let index = checked_index(superblock, inode.indirect)?;
                let mut buf = [0; BLOCK_SIZE];
                self.disk.read(index, &mut buf)?;
                pointers.insert(PointerBlock::decode(&buf))
            }
        };
        checked_index(superblock, pointers.get(logical - POINTERS_PER_INODE))
    }
}

/// Superblock summary plus one entry per valid inode, in the format of the
/// interactive `debug` command.
pub struct DebugReport {
    pub superblock: Superblock,
    pub magic_valid: bool,
    pub inodes: Vec<InodeReport>,
}

pub struct InodeReport {
    pub inumber: Inumber,
    pub size: u32,
    pub direct: Vec<u32>,
    pub indirect: Option<u32>,
    pub indirect_data: Vec<u32>,
}

impl fmt::Display for DebugReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "superblock:")?;
        if self.magic_valid {
            writeln!(f, "    magic number is valid")?;
        } else {
            writeln!(f, "    magic number is not valid")?;
        }
        writeln!(f, "    {} blocks", self.superblock.nblocks)?;
        writeln!(f, "    {} inode blocks", self.superblock.ninodeblocks)?;
        writeln!(f, "    {} inodes", self.superblock.ninodes)?;
        for inode in &self.inodes {
            writeln!(f, "inode {}:", inode.inumber)?;
            writeln!(f, "    size: {} bytes", inode.size)?;
            write!(f, "    direct blocks:")?;
            for block in &inode.direct {
                write!(f, " {block}")?;
            }
            writeln!(f)?;
            if let Some(indirect) = inode.indirect {
                writeln!(f, "    indirect block: {indirect}")?;
                write!(f, "    indirect data blocks:")?;
                for block in &inode.indirect_data {
                    write!(f, " {block}")?;
                }
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

fn checked_inumber(superblock: &Superblock, inumber: Inumber) -> Result<(), FsError> {
    if inumber == 0 || inumber >= superblock.ninodes {
        return Err(FsError::BadInumber(inumber));
    }
    Ok(())
}

// A reachable pointer must land strictly inside the data region; an empty
// slot decodes to `None` and fails the same check.
fn checked_index(superblock: &Superblock, pointer: Option<BlockPtr>) -> Result<usize, FsError> {
    let raw = pointer.map_or(0, BlockPtr::get);
    if raw <= superblock.ninodeblocks || raw >= superblock.nblocks {
        return Err(FsError::BadBlockPointer(raw));
    }
    Ok(raw as usize)
}

// The allocator never hands out block 0; it is marked used for the whole
// mount, so the index always fits a `BlockPtr`.
fn allocate_block(bitmap: &mut Bitmap) -> Option<BlockPtr> {
    bitmap.allocate().and_then(|index| BlockPtr::new(index as u32))
}

fn load_inode<D: BlockDevice>(disk: &D, inumber: Inumber) -> Result<Inode, FsError> {
    let (block, offset) = inode_location(inumber);
    let mut buf = [0; BLOCK_SIZE];
    disk.read(block, &mut buf)?;
    Ok(Inode::decode(&buf[offset..offset + INODE_SIZE]))
}

fn store_inode<D: BlockDevice>(disk: &mut D, inumber: Inumber, inode: &Inode) -> Result<(), FsError> {
    let (block, offset) = inode_location(inumber);
    let mut buf = [0; BLOCK_SIZE];
    disk.read(block, &mut buf)?;
    inode.encode(&mut buf[offset..offset + INODE_SIZE]);
    disk.write(block, &buf)?;
    Ok(())
}

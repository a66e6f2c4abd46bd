use alloc::vec::Vec;
use thiserror_no_std::Error;

pub const BLOCK_SIZE: usize = 0x1000;

/// Whole-block I/O over a fixed number of equally sized blocks.
///
/// Block 0 exists on every device; an implementation never resizes.
pub trait BlockDevice {
    /// Returns the size of the device in blocks.
    fn size(&self) -> usize;

    /// Read one block from the device into a buffer.
    fn read(&self, block: usize, buf: &mut [u8; BLOCK_SIZE]) -> Result<(), DiskError>;

    /// Write a buffer to one block on the device.
    fn write(&mut self, block: usize, buf: &[u8; BLOCK_SIZE]) -> Result<(), DiskError>;
}

#[derive(Error, Debug)]
pub enum DiskError {
    #[error("block {0} out of bounds")]
    BlockOutOfBounds(usize),
    #[error("image of {0} bytes is not a whole number of {BLOCK_SIZE}-byte blocks")]
    BadImageSize(usize),
}

struct DiskBlock {
    data: [u8; BLOCK_SIZE],
}

/// An in-memory disk. Each block is 4 KiB.
pub struct Disk {
    blocks: Vec<DiskBlock>,
}

impl Disk {
    /// Creates a zero-filled disk with the given number of blocks.
    pub fn new(blocks: usize) -> Self {
        Self {
            blocks: (0..blocks)
                .map(|_| DiskBlock {
                    data: [0; BLOCK_SIZE],
                })
                .collect(),
        }
    }

    /// Rebuilds a disk from a flat image, e.g. one produced by
    /// [`Disk::into_vec`]. The image must be a whole number of blocks.
    pub fn from_vec(image: Vec<u8>) -> Result<Self, DiskError> {
        if image.len() % BLOCK_SIZE != 0 {
            return Err(DiskError::BadImageSize(image.len()));
        }
        Ok(Self {
            blocks: image
                .chunks_exact(BLOCK_SIZE)
                .map(|chunk| {
                    let mut data = [0; BLOCK_SIZE];
                    data.copy_from_slice(chunk);
                    DiskBlock { data }
                })
                .collect(),
        })
    }

    /// Flattens the disk into one contiguous image.
    pub fn into_vec(self) -> Vec<u8> {
        let mut image = Vec::with_capacity(self.blocks.len() * BLOCK_SIZE);
        for block in &self.blocks {
            image.extend_from_slice(&block.data);
        }
        image
    }
}

impl BlockDevice for Disk {
    fn size(&self) -> usize {
        self.blocks.len()
    }

    fn read(&self, block: usize, buf: &mut [u8; BLOCK_SIZE]) -> Result<(), DiskError> {
        let block = self
            .blocks
            .get(block)
            .ok_or(DiskError::BlockOutOfBounds(block))?;
        buf.copy_from_slice(&block.data);
        Ok(())
    }

    fn write(&mut self, block: usize, buf: &[u8; BLOCK_SIZE]) -> Result<(), DiskError> {
        let block = self
            .blocks
            .get_mut(block)
            .ok_or(DiskError::BlockOutOfBounds(block))?;
        block.data.copy_from_slice(buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_back_what_was_written() {
        let mut disk = Disk::new(4);
        let mut block = [0u8; BLOCK_SIZE];
        block[0] = 0xab;
        block[BLOCK_SIZE - 1] = 0xcd;
        disk.write(2, &block).unwrap();

        let mut out = [0u8; BLOCK_SIZE];
        disk.read(2, &mut out).unwrap();
        assert_eq!(out[0], 0xab);
        assert_eq!(out[BLOCK_SIZE - 1], 0xcd);
    }

    #[test]
    fn out_of_bounds_is_an_error() {
        let mut disk = Disk::new(4);
        let mut buf = [0u8; BLOCK_SIZE];
        assert!(matches!(
            disk.read(4, &mut buf),
            Err(DiskError::BlockOutOfBounds(4))
        ));
        assert!(matches!(
            disk.write(7, &buf),
            Err(DiskError::BlockOutOfBounds(_))
        ));
    }

    #[test]
    fn image_round_trip() {
        let mut disk = Disk::new(3);
        let block = [0x5a; BLOCK_SIZE];
        disk.write(1, &block).unwrap();

        let image = disk.into_vec();
        assert_eq!(image.len(), 3 * BLOCK_SIZE);
        let disk = Disk::from_vec(image).unwrap();
        let mut out = [0u8; BLOCK_SIZE];
        disk.read(1, &mut out).unwrap();
        assert_eq!(out, block);

        assert!(matches!(
            Disk::from_vec(alloc::vec![0; BLOCK_SIZE + 1]),
            Err(DiskError::BadImageSize(_))
        ));
    }
}

//! embedded-sdfat - Block Device support
//!
//! Generic code for handling block devices.

#[cfg(feature = "refcell-blockdevice")]
mod refcell;

mod block;
pub use block::*;

/// Represents a block device - a device which can read and write blocks (or
/// sectors). Only supports devices which are <= 2 TiB in size.
pub trait BlockDevice {
    /// The errors that the `BlockDevice` can return. Must be debug formattable.
    type Error: core::fmt::Debug;
    /// Read one or more blocks, starting at the given block index.
    fn read(
        &mut self,
        blocks: &mut [Block],
        start_block_idx: BlockIdx,
        reason: &str,
    ) -> Result<(), Self::Error>;
    /// Write one or more blocks, starting at the given block index.
    fn write(&mut self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error>;
    /// Determine how many blocks this device can hold.
    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error>;

    /// Read exactly one block.
    fn read_block(&mut self, block_idx: BlockIdx) -> Result<Block, Self::Error> {
        let mut blocks = [Block::new()];
        self.read(&mut blocks, block_idx, "read_block")?;
        let [block] = blocks;
        Ok(block)
    }

    /// Write exactly one block.
    fn write_block(&mut self, block_idx: BlockIdx, block: &Block) -> Result<(), Self::Error> {
        self.write(core::slice::from_ref(block), block_idx)
    }
}

impl<T> BlockDevice for &mut T
where
    T: BlockDevice,
{
    type Error = T::Error;

    fn read(
        &mut self,
        blocks: &mut [Block],
        start_block_idx: BlockIdx,
        reason: &str,
    ) -> Result<(), Self::Error> {
        (*self).read(blocks, start_block_idx, reason)
    }

    fn write(&mut self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        (*self).write(blocks, start_block_idx)
    }

    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error> {
        (*self).num_blocks()
    }
}

/// The error from a [`MemoryBlockDevice`].
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// The request ran past the end of the backing memory.
    OutOfRange {
        /// The first block that does not exist.
        block: u32,
    },
}

/// A `BlockDevice` over a byte slice, used for disk images and tests.
#[derive(Debug)]
pub struct MemoryBlockDevice<'a> {
    memory: &'a mut [u8],
}

impl<'a> MemoryBlockDevice<'a> {
    /// Wrap a slice. Any trailing partial block is ignored.
    pub fn new(memory: &'a mut [u8]) -> Self {
        Self { memory }
    }

    /// Give the backing memory back.
    pub fn into_inner(self) -> &'a mut [u8] {
        self.memory
    }

    fn block_range(&self, block_idx: usize) -> Result<core::ops::Range<usize>, MemoryError> {
        let start = block_idx * Block::LEN;
        let end = start + Block::LEN;
        if end > self.memory.len() {
            Err(MemoryError::OutOfRange {
                block: block_idx as u32,
            })
        } else {
            Ok(start..end)
        }
    }
}

impl<'a> BlockDevice for MemoryBlockDevice<'a> {
    type Error = MemoryError;

    fn read(
        &mut self,
        blocks: &mut [Block],
        start_block_idx: BlockIdx,
        _reason: &str,
    ) -> Result<(), Self::Error> {
        for (idx, block) in blocks.iter_mut().enumerate() {
            let range = self.block_range(start_block_idx.0 as usize + idx)?;
            block.contents.copy_from_slice(&self.memory[range]);
        }
        Ok(())
    }

    fn write(&mut self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        for (idx, block) in blocks.iter().enumerate() {
            let range = self.block_range(start_block_idx.0 as usize + idx)?;
            self.memory[range].copy_from_slice(&block.contents);
        }
        Ok(())
    }

    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error> {
        Ok(BlockCount((self.memory.len() / Block::LEN) as u32))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn memory_device_reads_back_what_it_wrote() {
        let mut memory = vec![0u8; 4 * Block::LEN];
        let mut bd = MemoryBlockDevice::new(&mut memory);
        let mut block = Block::new();
        block[0] = 0xAB;
        block[511] = 0xCD;
        bd.write_block(BlockIdx(2), &block).unwrap();

        let read = bd.read_block(BlockIdx(2)).unwrap();
        assert_eq!(read, block);
        assert_eq!(bd.num_blocks().unwrap(), BlockCount(4));
        assert_eq!(bd.into_inner()[2 * Block::LEN], 0xAB);
    }

    #[test]
    fn memory_device_rejects_blocks_past_the_end() {
        let mut memory = vec![0u8; 2 * Block::LEN];
        let mut bd = MemoryBlockDevice::new(&mut memory);
        assert_eq!(
            bd.read_block(BlockIdx(2)),
            Err(MemoryError::OutOfRange { block: 2 })
        );
        let blocks = [Block::new(), Block::new()];
        assert_eq!(
            bd.write(&blocks, BlockIdx(1)),
            Err(MemoryError::OutOfRange { block: 2 })
        );
    }
}

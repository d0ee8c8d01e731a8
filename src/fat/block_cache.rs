use crate::{Block, BlockCount, BlockDevice, BlockIdx};

/// Holds one FAT sector in memory. Writes stay in the cache until another
/// sector is needed or [`BlockCache::flush`] is called, and then go to
/// every copy of the FAT.
#[derive(Debug)]
pub struct BlockCache {
    block: Block,
    idx: Option<BlockIdx>,
    dirty: bool,
    copies: u8,
    stride: BlockCount,
}

impl BlockCache {
    /// `copies` mirrors of the cached region, `stride` blocks apart.
    pub fn new(copies: u8, stride: BlockCount) -> Self {
        Self {
            block: Block::new(),
            idx: None,
            dirty: false,
            copies,
            stride,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn read<BD>(&mut self, block_device: &mut BD, idx: BlockIdx) -> Result<&Block, BD::Error>
    where
        BD: BlockDevice,
    {
        self.load(block_device, idx)?;
        Ok(&self.block)
    }

    /// Get the sector for modification. It will be written back later.
    pub fn write<BD>(
        &mut self,
        block_device: &mut BD,
        idx: BlockIdx,
    ) -> Result<&mut Block, BD::Error>
    where
        BD: BlockDevice,
    {
        self.load(block_device, idx)?;
        self.dirty = true;
        Ok(&mut self.block)
    }

    fn load<BD>(&mut self, block_device: &mut BD, idx: BlockIdx) -> Result<(), BD::Error>
    where
        BD: BlockDevice,
    {
        if self.idx == Some(idx) {
            return Ok(());
        }
        self.flush(block_device)?;
        // The buffer is garbage until the read succeeds.
        self.idx = None;
        block_device.read(core::slice::from_mut(&mut self.block), idx, "fat")?;
        self.idx = Some(idx);
        Ok(())
    }

    /// Write the cached sector to all copies, if it changed.
    pub fn flush<BD>(&mut self, block_device: &mut BD) -> Result<(), BD::Error>
    where
        BD: BlockDevice,
    {
        if let (true, Some(idx)) = (self.dirty, self.idx) {
            trace!("flushing FAT sector {} to {} copies", idx.0, self.copies);
            for copy in 0..u32::from(self.copies) {
                let mirror = idx + BlockCount(copy * self.stride.0);
                block_device.write_block(mirror, &self.block)?;
            }
            self.dirty = false;
        }
        Ok(())
    }
}

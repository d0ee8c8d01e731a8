use crate::{Block, BlockCount, BlockDevice, BlockIdx};

use super::{Cluster, Corruption, DirEntry, FatError, FatVolume, TimeSource};

/// How a file is opened.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Read from the start. Writes are refused.
    Read,
    /// Start from an empty file, creating it if needed.
    WriteTruncate,
    /// Write after the existing contents.
    Append,
}

/// An open file in the root directory of a [`FatVolume`].
///
/// Reads and writes are sequential. The directory entry and the FAT are
/// written back by [`File::flush`] and [`File::close`], or when the file is
/// dropped.
pub struct File<'v, BD, T>
where
    BD: BlockDevice,
    T: TimeSource,
{
    volume: &'v mut FatVolume<BD, T>,
    entry: DirEntry,
    mode: Mode,
    position: u32,
    /// The cluster holding `position`, or the last one used
    cluster: Option<Cluster>,
    /// File offset of the first byte of `cluster`
    cluster_start: u32,
    dirty: bool,
    closed: bool,
}

impl<'v, BD, T> core::fmt::Debug for File<'v, BD, T>
where
    BD: BlockDevice,
    T: TimeSource,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("File")
            .field("entry", &self.entry)
            .field("mode", &self.mode)
            .field("position", &self.position)
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl<'v, BD, T> File<'v, BD, T>
where
    BD: BlockDevice,
    T: TimeSource,
{
    pub(crate) fn new(
        volume: &'v mut FatVolume<BD, T>,
        entry: DirEntry,
        mode: Mode,
        dirty: bool,
    ) -> Self {
        File {
            volume,
            cluster: entry.cluster,
            entry,
            mode,
            position: 0,
            cluster_start: 0,
            dirty,
            closed: false,
        }
    }

    /// Open for append: the cursor goes to the cluster holding the last byte.
    pub(crate) fn at_end(
        volume: &'v mut FatVolume<BD, T>,
        entry: DirEntry,
    ) -> Result<Self, FatError<BD::Error>> {
        let size = entry.size;
        let cluster_bytes = volume.bpb.bytes_per_cluster();
        let mut cluster = entry.cluster;
        let mut cluster_start = 0;
        if size > 0 {
            let mut current = entry.cluster.ok_or(Corruption::ChainTooShort { size })?;
            for _ in 0..(size - 1) / cluster_bytes {
                current = volume
                    .next_cluster(current)?
                    .ok_or(Corruption::ChainTooShort { size })?;
                cluster_start += cluster_bytes;
            }
            cluster = Some(current);
        }
        trace!("Appending to {} at {}", entry.name, size);
        Ok(File {
            volume,
            entry,
            mode: Mode::Append,
            position: size,
            cluster,
            cluster_start,
            dirty: false,
            closed: false,
        })
    }

    /// Has the cursor moved past the current cluster?
    fn beyond_cluster(&self, cluster_bytes: u32) -> bool {
        u64::from(self.position) >= u64::from(self.cluster_start) + u64::from(cluster_bytes)
    }

    fn block_at_cursor(&self, cluster: Cluster) -> (BlockIdx, usize) {
        let offset = self.position - self.cluster_start;
        let block = self.volume.bpb.cluster_start(cluster) + BlockCount(offset / Block::LEN_U32);
        (block, (offset % Block::LEN_U32) as usize)
    }

    /// Append `buffer` at the cursor, allocating clusters as the file grows.
    ///
    /// Each new cluster gets its data before the FAT links it into the
    /// chain, so a failed write never leaves a linked cluster of garbage.
    pub fn write(&mut self, buffer: &[u8]) -> Result<(), FatError<BD::Error>> {
        if self.mode == Mode::Read {
            return Err(FatError::ReadOnly);
        }
        u32::try_from(buffer.len())
            .ok()
            .and_then(|len| self.position.checked_add(len))
            .ok_or(FatError::FileTooLarge)?;

        let cluster_bytes = self.volume.bpb.bytes_per_cluster();
        let mut buffer = buffer;
        while !buffer.is_empty() {
            let (cluster, cluster_start, allocated) = match self.cluster {
                Some(current) if !self.beyond_cluster(cluster_bytes) => {
                    (current, self.cluster_start, false)
                }
                Some(current) => match self.volume.next_cluster(current)? {
                    Some(next) => (next, self.cluster_start + cluster_bytes, false),
                    None => (
                        self.volume.find_free_cluster()?,
                        self.cluster_start + cluster_bytes,
                        true,
                    ),
                },
                None => (self.volume.find_free_cluster()?, 0, true),
            };

            let offset = self.position - cluster_start;
            let block_idx =
                self.volume.bpb.cluster_start(cluster) + BlockCount(offset / Block::LEN_U32);
            let block_offset = (offset % Block::LEN_U32) as usize;
            let to_copy = core::cmp::min(Block::LEN - block_offset, buffer.len());

            // Only the bytes before the cursor are part of the file.
            let mut block = if block_offset != 0 {
                self.volume.block_device.read_block(block_idx)?
            } else {
                Block::new()
            };
            block[block_offset..block_offset + to_copy].copy_from_slice(&buffer[..to_copy]);
            self.volume.block_device.write_block(block_idx, &block)?;

            if allocated {
                trace!("Extending {} with cluster {}", self.entry.name, cluster.0);
                self.volume.link_cluster(self.cluster, cluster)?;
                if self.entry.cluster.is_none() {
                    self.entry.cluster = Some(cluster);
                }
            }
            self.cluster = Some(cluster);
            self.cluster_start = cluster_start;
            self.position += to_copy as u32;
            if self.position > self.entry.size {
                self.entry.size = self.position;
            }
            self.dirty = true;
            buffer = &buffer[to_copy..];
        }
        Ok(())
    }

    /// Read from the cursor into `buffer`. Returns how many bytes were read,
    /// which is 0 at the end of the file.
    pub fn read(&mut self, buffer: &mut [u8]) -> Result<usize, FatError<BD::Error>> {
        let size = self.entry.size;
        let cluster_bytes = self.volume.bpb.bytes_per_cluster();
        let mut read = 0;
        while read < buffer.len() && self.position < size {
            let mut cluster = self.cluster.ok_or(Corruption::ChainTooShort { size })?;
            if self.beyond_cluster(cluster_bytes) {
                cluster = self
                    .volume
                    .next_cluster(cluster)?
                    .ok_or(Corruption::ChainTooShort { size })?;
                self.cluster = Some(cluster);
                self.cluster_start += cluster_bytes;
            }

            let (block_idx, block_offset) = self.block_at_cursor(cluster);
            let block = self.volume.block_device.read_block(block_idx)?;
            let to_copy = (Block::LEN - block_offset)
                .min(buffer.len() - read)
                .min((size - self.position) as usize);
            buffer[read..read + to_copy]
                .copy_from_slice(&block[block_offset..block_offset + to_copy]);
            read += to_copy;
            self.position += to_copy as u32;
        }
        Ok(read)
    }

    /// Write back the FAT, then the directory entry with a fresh
    /// modification time. Does nothing if the file is unchanged.
    pub fn flush(&mut self) -> Result<(), FatError<BD::Error>> {
        if !self.dirty {
            return Ok(());
        }
        self.volume.sync()?;
        self.entry.mtime = self.volume.timestamp();
        self.volume.write_entry(&self.entry)?;
        self.dirty = false;
        debug!("Flushed {}, {} bytes", self.entry.name, self.entry.size);
        Ok(())
    }

    /// Flush and release the volume.
    pub fn close(mut self) -> Result<(), FatError<BD::Error>> {
        let result = self.flush();
        self.closed = true;
        result
    }

    /// Size of the file in bytes, including anything not yet flushed.
    pub fn len(&self) -> u32 {
        self.entry.size
    }

    pub fn is_empty(&self) -> bool {
        self.entry.size == 0
    }

    pub fn position(&self) -> u32 {
        self.position
    }

    pub fn is_eof(&self) -> bool {
        self.position >= self.entry.size
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn dir_entry(&self) -> &DirEntry {
        &self.entry
    }
}

impl<'v, BD, T> Drop for File<'v, BD, T>
where
    BD: BlockDevice,
    T: TimeSource,
{
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.flush() {
                warn!("Failed to flush {} on drop: {:?}", self.entry.name, e.kind());
            }
        }
    }
}

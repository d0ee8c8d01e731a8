//! Reading and writing the File Allocation Table, and cluster allocation.

use crate::{Block, BlockDevice, BlockIdx};

use super::{Cluster, Corruption, Entry, FatError, FatType, FatVolume, TimeSource};

impl<BD, T> FatVolume<BD, T>
where
    BD: BlockDevice,
    T: TimeSource,
{
    fn fat_byte_offset(&self, cluster: Cluster) -> u32 {
        let n = cluster.0;
        match self.bpb.fat_type() {
            FatType::Fat12 => n + (n / 2),
            FatType::Fat16 => n * 2,
            FatType::Fat32 => n * 4,
        }
    }

    /// FAT12 entries can straddle two sectors, so go byte by byte through
    /// the cache.
    fn read_fat_bytes<const N: usize>(
        &mut self,
        byte_offset: u32,
    ) -> Result<[u8; N], FatError<BD::Error>> {
        let fat_start = self.bpb.fat_start();
        let mut bytes = [0u8; N];
        for (i, byte) in bytes.iter_mut().enumerate() {
            let offset = byte_offset + i as u32;
            let sector = BlockIdx(fat_start.0 + offset / Block::LEN_U32);
            let block = self.fat_cache.read(&mut self.block_device, sector)?;
            *byte = block[(offset % Block::LEN_U32) as usize];
        }
        Ok(bytes)
    }

    fn write_fat_bytes<const N: usize>(
        &mut self,
        byte_offset: u32,
        bytes: [u8; N],
    ) -> Result<(), FatError<BD::Error>> {
        let fat_start = self.bpb.fat_start();
        for (i, byte) in bytes.iter().enumerate() {
            let offset = byte_offset + i as u32;
            let sector = BlockIdx(fat_start.0 + offset / Block::LEN_U32);
            let block = self.fat_cache.write(&mut self.block_device, sector)?;
            block[(offset % Block::LEN_U32) as usize] = *byte;
        }
        Ok(())
    }

    /// Read the FAT slot of a data cluster.
    pub fn fat_entry(&mut self, cluster: Cluster) -> Result<Entry, FatError<BD::Error>> {
        let fat_type = self.bpb.fat_type();
        let offset = self.fat_byte_offset(cluster);
        let value = match fat_type {
            FatType::Fat12 => {
                let pair = u16::from_le_bytes(self.read_fat_bytes(offset)?);
                if cluster.0 & 1 == 1 {
                    u32::from(pair >> 4)
                } else {
                    u32::from(pair & 0x0FFF)
                }
            }
            FatType::Fat16 => u32::from(u16::from_le_bytes(self.read_fat_bytes(offset)?)),
            FatType::Fat32 => u32::from_le_bytes(self.read_fat_bytes(offset)?) & Entry::FAT32_MASK,
        };
        Ok(Entry::from_raw(fat_type, value))
    }

    pub(crate) fn set_fat_entry(
        &mut self,
        cluster: Cluster,
        entry: Entry,
    ) -> Result<(), FatError<BD::Error>> {
        let fat_type = self.bpb.fat_type();
        let offset = self.fat_byte_offset(cluster);
        let value = entry.to_raw(fat_type);
        match fat_type {
            FatType::Fat12 => {
                let pair = u16::from_le_bytes(self.read_fat_bytes(offset)?);
                let value = value as u16 & 0x0FFF;
                // Odd entries own the top 12 bits of the pair, even ones the bottom 12.
                let pair = if cluster.0 & 1 == 1 {
                    (pair & 0x000F) | (value << 4)
                } else {
                    (pair & 0xF000) | value
                };
                self.write_fat_bytes(offset, pair.to_le_bytes())
            }
            FatType::Fat16 => self.write_fat_bytes(offset, (value as u16).to_le_bytes()),
            FatType::Fat32 => {
                // The top four bits are reserved and must survive.
                let old = u32::from_le_bytes(self.read_fat_bytes(offset)?);
                let new = (old & !Entry::FAT32_MASK) | (value & Entry::FAT32_MASK);
                self.write_fat_bytes(offset, new.to_le_bytes())
            }
        }
    }

    /// The cluster after `cluster` in its chain, or `None` at the end.
    pub fn next_cluster(
        &mut self,
        cluster: Cluster,
    ) -> Result<Option<Cluster>, FatError<BD::Error>> {
        match self.fat_entry(cluster)? {
            Entry::EndOfChain => Ok(None),
            Entry::Next(next) if self.bpb.is_valid_cluster(next) => Ok(Some(next)),
            entry => Err(Corruption::BrokenChain { cluster, entry }.into()),
        }
    }

    /// Follow a chain to its end. At most one step per cluster on the volume.
    pub(crate) fn last_cluster(
        &mut self,
        first: Cluster,
    ) -> Result<Cluster, FatError<BD::Error>> {
        let mut cluster = first;
        for _ in 0..self.bpb.cluster_count() {
            match self.next_cluster(cluster)? {
                Some(next) => cluster = next,
                None => return Ok(cluster),
            }
        }
        Err(Corruption::ChainLoop { first }.into())
    }

    /// Find a free cluster, scanning from the hint and wrapping once. The
    /// FAT is not changed; see [`FatVolume::link_cluster`].
    pub(crate) fn find_free_cluster(&mut self) -> Result<Cluster, FatError<BD::Error>> {
        let first = Cluster::FIRST_DATA.0;
        let last = self.bpb.maximum_valid_cluster();
        let start = if (first..=last).contains(&self.next_free) {
            self.next_free
        } else {
            first
        };

        let mut candidate = start;
        loop {
            if self.fat_entry(Cluster(candidate))? == Entry::Free {
                trace!("Found free cluster {}", candidate);
                return Ok(Cluster(candidate));
            }
            candidate = if candidate == last { first } else { candidate + 1 };
            if candidate == start {
                warn!("No free clusters left");
                return Err(FatError::DiskFull);
            }
        }
    }

    /// Put a cluster found by [`FatVolume::find_free_cluster`] on the end of
    /// a chain: it is marked end-of-chain first, then the old tail points at
    /// it.
    pub(crate) fn link_cluster(
        &mut self,
        tail: Option<Cluster>,
        new: Cluster,
    ) -> Result<(), FatError<BD::Error>> {
        self.set_fat_entry(new, Entry::EndOfChain)?;
        if let Some(tail) = tail {
            self.set_fat_entry(tail, Entry::Next(new))?;
        }
        self.next_free = new.0 + 1;
        if let Some(count) = self.free_count.as_mut() {
            *count = count.saturating_sub(1);
        }
        self.info_dirty = true;
        Ok(())
    }

    /// Release every cluster of a chain.
    pub(crate) fn free_chain(&mut self, first: Cluster) -> Result<(), FatError<BD::Error>> {
        let mut cluster = first;
        let mut freed = 0u32;
        loop {
            // A loop runs into a slot freed on the way round, which
            // next_cluster refuses.
            let next = self.next_cluster(cluster)?;
            self.set_fat_entry(cluster, Entry::Free)?;
            freed += 1;
            if cluster.0 < self.next_free {
                self.next_free = cluster.0;
            }
            match next {
                Some(n) => cluster = n,
                None => break,
            }
        }
        trace!("Freed {} clusters from {}", freed, first.0);
        if let Some(count) = self.free_count.as_mut() {
            *count += freed;
        }
        self.info_dirty = true;
        Ok(())
    }
}

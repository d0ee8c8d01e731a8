use crate::{Block, BlockCount, BlockDevice, BlockIdx};

use super::{
    Cluster, Corruption, DirEntry, DirEntryRaw, FatError, FatVolume, ShortFileName, TimeSource,
};

/// Where the root directory lives: a fixed region after the FATs on FAT12/16,
/// an ordinary cluster chain on FAT32.
#[derive(Debug, Clone, Copy)]
pub enum RootDirectorySectors {
    Cluster(Cluster),
    Region {
        start_block: BlockIdx,
        len: BlockCount,
    },
}

/// Walks the sectors of the root directory.
#[derive(Debug)]
pub struct RootDirIter {
    current: RootDirectorySectors,
    iterated_cluster_sectors: u32,
    clusters_left: u32,
}

impl RootDirIter {
    pub fn new(start: RootDirectorySectors, max_clusters: u32) -> Self {
        Self {
            current: start,
            iterated_cluster_sectors: 0,
            clusters_left: max_clusters,
        }
    }

    pub fn next<BD, T>(
        &mut self,
        volume: &mut FatVolume<BD, T>,
    ) -> Result<Option<BlockIdx>, FatError<BD::Error>>
    where
        BD: BlockDevice,
        T: TimeSource,
    {
        let Self {
            current,
            iterated_cluster_sectors,
            clusters_left,
        } = self;

        match current {
            RootDirectorySectors::Cluster(cluster) => {
                if *iterated_cluster_sectors == volume.bpb.sectors_per_cluster().0 {
                    let next = match volume.next_cluster(*cluster)? {
                        Some(next) => next,
                        None => return Ok(None),
                    };
                    if *clusters_left == 0 {
                        return Err(Corruption::ChainLoop { first: *cluster }.into());
                    }
                    *clusters_left -= 1;
                    *cluster = next;
                    *iterated_cluster_sectors = 0;
                }
                let sector =
                    volume.bpb.cluster_start(*cluster) + BlockCount(*iterated_cluster_sectors);
                *iterated_cluster_sectors += 1;
                Ok(Some(sector))
            }
            RootDirectorySectors::Region { start_block, len } => {
                let res = *start_block;
                if *len != BlockCount(0) {
                    *len -= BlockCount(1);
                    *start_block += BlockCount(1);
                    Ok(Some(res))
                } else {
                    Ok(None)
                }
            }
        }
    }
}

impl<BD, T> FatVolume<BD, T>
where
    BD: BlockDevice,
    T: TimeSource,
{
    pub(crate) fn root_dir_sectors(&self) -> RootDirectorySectors {
        match self.bpb.root_cluster() {
            Some(cluster) => RootDirectorySectors::Cluster(cluster),
            None => RootDirectorySectors::Region {
                start_block: self.bpb.root_dir_start(),
                len: self.bpb.root_dir_sectors(),
            },
        }
    }

    /// Visit each 32 byte slot of the root directory, up to and including
    /// the end-of-directory marker. Stops early when `f` returns something.
    fn walk_root_dir<R, F>(&mut self, mut f: F) -> Result<Option<R>, FatError<BD::Error>>
    where
        F: FnMut(&DirEntryRaw, BlockIdx, usize) -> Option<R>,
    {
        let mut sectors = RootDirIter::new(self.root_dir_sectors(), self.bpb.cluster_count());
        while let Some(block_idx) = sectors.next(self)? {
            let block = self.block_device.read_block(block_idx)?;
            for (idx, slot) in block.chunks_exact(DirEntryRaw::LEN).enumerate() {
                let raw = DirEntryRaw::new(slot);
                if let Some(result) = f(&raw, block_idx, idx * DirEntryRaw::LEN) {
                    return Ok(Some(result));
                }
                if raw.is_end() {
                    return Ok(None);
                }
            }
        }
        Ok(None)
    }

    pub(crate) fn find_entry(
        &mut self,
        name: &ShortFileName,
    ) -> Result<Option<DirEntry>, FatError<BD::Error>> {
        let fat_type = self.bpb.fat_type();
        let entry = self.walk_root_dir(|raw, block, offset| {
            if raw.is_short_entry() && &raw.name() == name.as_raw() {
                Some(raw.to_dir_entry(fat_type, block, offset))
            } else {
                None
            }
        })?;
        // Everything that opens, truncates or deletes starts from here, so a
        // bad first cluster never reaches the FAT or `cluster_start`.
        match entry.as_ref().and_then(|e| e.cluster) {
            Some(cluster) if !self.bpb.is_valid_cluster(cluster) => {
                warn!("Entry points at cluster {} outside the volume", cluster.0);
                Err(Corruption::BadFirstCluster { cluster }.into())
            }
            _ => Ok(entry),
        }
    }

    /// Call `func` for every file and directory in the root directory.
    /// Long file name fragments and the volume label are skipped.
    pub fn iterate_root_dir<F>(&mut self, mut func: F) -> Result<(), FatError<BD::Error>>
    where
        F: FnMut(&DirEntry),
    {
        let fat_type = self.bpb.fat_type();
        self.walk_root_dir(|raw, block, offset| {
            if raw.is_short_entry() {
                func(&raw.to_dir_entry(fat_type, block, offset));
            }
            None::<()>
        })?;
        Ok(())
    }

    /// Find a slot for a new entry. A full FAT32 root directory grows by one
    /// zeroed cluster; a full fixed root directory is [`FatError::DiskFull`].
    pub(crate) fn find_free_slot(&mut self) -> Result<(BlockIdx, usize), FatError<BD::Error>> {
        let found = self.walk_root_dir(|raw, block, offset| {
            if raw.is_free() {
                Some((block, offset))
            } else {
                None
            }
        })?;
        if let Some(slot) = found {
            return Ok(slot);
        }

        match self.root_dir_sectors() {
            RootDirectorySectors::Region { .. } => {
                warn!("Root directory is full");
                Err(FatError::DiskFull)
            }
            RootDirectorySectors::Cluster(first) => {
                let tail = self.last_cluster(first)?;
                let new = self.find_free_cluster()?;
                debug!("Growing root directory into cluster {}", new.0);
                let start = self.bpb.cluster_start(new);
                let blank = Block::new();
                for block_idx in start.range(self.bpb.sectors_per_cluster()) {
                    self.block_device.write_block(block_idx, &blank)?;
                }
                self.link_cluster(Some(tail), new)?;
                Ok((start, 0))
            }
        }
    }

    /// Store an entry in the slot it came from.
    pub(crate) fn write_entry(&mut self, entry: &DirEntry) -> Result<(), FatError<BD::Error>> {
        self.store_entry(entry, false)
    }

    /// Store a new entry in a free slot, dropping whatever a deleted entry
    /// left behind there.
    pub(crate) fn create_entry(&mut self, entry: &DirEntry) -> Result<(), FatError<BD::Error>> {
        self.store_entry(entry, true)
    }

    fn store_entry(&mut self, entry: &DirEntry, blank: bool) -> Result<(), FatError<BD::Error>> {
        let fat_type = self.bpb.fat_type();
        let (block_idx, offset) = entry.location();
        let mut block = self.block_device.read_block(block_idx)?;
        let slot = &mut block[offset..offset + DirEntryRaw::LEN];
        if blank {
            slot.fill(0);
        }
        let mut raw = DirEntryRaw::new(slot);
        raw.update(entry, fat_type);
        slot.copy_from_slice(raw.as_bytes());
        self.block_device.write_block(block_idx, &block)?;
        Ok(())
    }

    pub(crate) fn mark_entry_deleted(
        &mut self,
        entry: &DirEntry,
    ) -> Result<(), FatError<BD::Error>> {
        let (block_idx, offset) = entry.location();
        let mut block = self.block_device.read_block(block_idx)?;
        let slot = &mut block[offset..offset + DirEntryRaw::LEN];
        let mut raw = DirEntryRaw::new(slot);
        raw.mark_deleted();
        slot.copy_from_slice(raw.as_bytes());
        self.block_device.write_block(block_idx, &block)?;
        Ok(())
    }
}

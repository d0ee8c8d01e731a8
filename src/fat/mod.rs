//! embedded-sdfat - FAT volumes
//!
//! Mounts a FAT12, FAT16 or FAT32 volume from a [`BlockDevice`] and opens
//! files in its root directory.
//!
//! FAT writes go through a one-sector write-back cache. The cache, and the
//! directory entry of an open [`File`], reach the disk when the file is
//! closed or the volume is synced, FAT first. A crash in between can leave a
//! cluster chain that no entry points at, but never an entry pointing at
//! clusters the FAT thinks are free.

use core::fmt::Debug;

use crate::mbr::{Mbr, MbrError, Partition, PartitionBlockDevice, PartitionError};
use crate::{BlockCount, BlockDevice, BlockIdx, ErrorKind};

use self::{
    bios_param_block::{BiosParameterBlock, BiosParameterBlockRaw, BpbError},
    block_cache::BlockCache,
};

pub mod bios_param_block;
mod block_cache;
mod cluster;
mod directory;
mod file;
mod filename;
mod fs_info;
mod root_directory;
mod table;
mod timestamp;

pub use self::cluster::{Cluster, Entry};
pub use self::directory::{Attributes, DirEntry, DirEntryRaw};
pub use self::file::{File, Mode};
pub use self::filename::{FilenameError, ShortFileName, ToShortFileName};
pub use self::fs_info::FsInfo;
pub use self::timestamp::{TimeSource, Timestamp};

#[cfg(test)]
mod test;

#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatType {
    Fat12,
    Fat16,
    Fat32,
}

/// Ways in which the on-disk structures can be wrong.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Corruption {
    /// Block 0 is neither a boot sector nor a usable partition table
    Mbr(MbrError),
    /// The boot sector is invalid or self-contradictory
    Bpb(BpbError),
    /// The boot sector claims more sectors than the partition holds
    VolumeTooLarge { volume: BlockCount, available: BlockCount },
    /// A sector outside the partition was requested
    OutOfRange { partition_block_count: BlockCount },
    /// A chain runs into a slot that cannot be part of a chain
    BrokenChain { cluster: Cluster, entry: Entry },
    /// A directory entry's first cluster lies outside the data region
    BadFirstCluster { cluster: Cluster },
    /// A chain is longer than the volume, so it must loop
    ChainLoop { first: Cluster },
    /// The chain ends before the directory entry's size does
    ChainTooShort { size: u32 },
}

/// Errors from a volume or a file.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FatError<E> {
    /// The underlying block device failed
    DeviceError(E),
    CorruptFilesystem(Corruption),
    /// No entry with that name in the root directory
    NotFound,
    /// No free cluster, or no free slot in a fixed-size root directory
    DiskFull,
    FilenameError(FilenameError),
    /// Writing through a read-only session, or to a read-only file
    ReadOnly,
    /// The name belongs to a directory
    IsDirectory,
    /// The file would grow past 4 GiB - 1
    FileTooLarge,
}

impl<E> FatError<E> {
    /// Which class of failure this is.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FatError::DeviceError(_) => ErrorKind::Io,
            FatError::CorruptFilesystem(_) => ErrorKind::CorruptFilesystem,
            FatError::NotFound => ErrorKind::NotFound,
            FatError::DiskFull => ErrorKind::DiskFull,
            FatError::FilenameError(_)
            | FatError::ReadOnly
            | FatError::IsDirectory
            | FatError::FileTooLarge => ErrorKind::InvalidInput,
        }
    }
}

impl<E> From<PartitionError<E>> for FatError<E>
where
    E: Debug,
{
    fn from(e: PartitionError<E>) -> Self {
        match e {
            PartitionError::DeviceError(e) => FatError::DeviceError(e),
            PartitionError::OutOfRange {
                partition_block_count,
            } => FatError::CorruptFilesystem(Corruption::OutOfRange {
                partition_block_count,
            }),
        }
    }
}

impl<E> From<Corruption> for FatError<E> {
    fn from(e: Corruption) -> Self {
        Self::CorruptFilesystem(e)
    }
}

impl<E> From<BpbError> for FatError<E> {
    fn from(e: BpbError) -> Self {
        Self::CorruptFilesystem(Corruption::Bpb(e))
    }
}

impl<E> From<MbrError> for FatError<E> {
    fn from(e: MbrError) -> Self {
        Self::CorruptFilesystem(Corruption::Mbr(e))
    }
}

impl<E> From<FilenameError> for FatError<E> {
    fn from(e: FilenameError) -> Self {
        Self::FilenameError(e)
    }
}

/// A mounted FAT volume. Owns the block device until [`FatVolume::unmount`].
pub struct FatVolume<BD, T>
where
    BD: BlockDevice,
    T: TimeSource,
{
    block_device: PartitionBlockDevice<BD>,
    bpb: BiosParameterBlock,
    fat_cache: BlockCache,
    /// Where the next free cluster search starts
    next_free: u32,
    free_count: Option<u32>,
    info_dirty: bool,
    time_source: T,
}

impl<BD, T> core::fmt::Debug for FatVolume<BD, T>
where
    BD: BlockDevice,
    T: TimeSource,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FatVolume")
            .field("bpb", &self.bpb)
            .field("partition", self.block_device.partition())
            .finish()
    }
}

impl<BD, T> FatVolume<BD, T>
where
    BD: BlockDevice,
    T: TimeSource,
{
    /// Mount the volume on `block_device`.
    ///
    /// If block 0 is a boot sector the whole device is the volume. Otherwise
    /// block 0 must be a partition table, and the active FAT partition (or
    /// the first FAT partition) is mounted.
    pub fn mount(mut block_device: BD, time_source: T) -> Result<Self, FatError<BD::Error>> {
        let num_blocks = block_device.num_blocks().map_err(FatError::DeviceError)?;
        let block_zero = block_device
            .read_block(BlockIdx(0))
            .map_err(FatError::DeviceError)?;

        let partition =
            if BiosParameterBlockRaw::from_block(block_zero.clone()).looks_like_boot_sector() {
                debug!("No partition table, using all {} blocks", num_blocks.0);
                Partition::whole_device(num_blocks)
            } else {
                let (number, partition) = Mbr::parse(&block_zero)?.fat_partition()?;
                debug!("Using partition {:?}: {:?}", number, partition);
                if partition.end() > u64::from(num_blocks.0) {
                    return Err(MbrError::PartitionTooLarge.into());
                }
                partition
            };

        let mut block_device = PartitionBlockDevice::new(block_device, partition);
        let bpb = BiosParameterBlock::new(block_device.read_block(BlockIdx(0))?)?;
        if bpb.total_sector_count() > partition.block_count {
            return Err(Corruption::VolumeTooLarge {
                volume: bpb.total_sector_count(),
                available: partition.block_count,
            }
            .into());
        }

        debug!(
            "Mounted {:?}: {} clusters of {} bytes, {} FATs of {} sectors",
            bpb.fat_type(),
            bpb.cluster_count(),
            bpb.bytes_per_cluster(),
            bpb.num_fats(),
            bpb.fat_size().0
        );

        let mut volume = FatVolume {
            fat_cache: BlockCache::new(bpb.num_fats(), bpb.fat_size()),
            next_free: Cluster::FIRST_DATA.0,
            free_count: None,
            info_dirty: false,
            block_device,
            bpb,
            time_source,
        };
        volume.load_fs_info()?;
        Ok(volume)
    }

    fn load_fs_info(&mut self) -> Result<(), FatError<BD::Error>> {
        if let Some(sector) = self.bpb.fs_info_sector() {
            let block = self.block_device.read_block(sector)?;
            match FsInfo::parse(&block) {
                Some(info) => {
                    trace!("FSInfo: {:?}", info);
                    self.free_count = info.free_count.filter(|&n| n <= self.bpb.cluster_count());
                    if let Some(next) = info.next_free {
                        if self.bpb.is_valid_cluster(Cluster(next)) {
                            self.next_free = next;
                        }
                    }
                }
                None => warn!("FSInfo sector {} has bad signatures, ignoring it", sector.0),
            }
        }
        Ok(())
    }

    /// Write back the FAT cache and, on FAT32, the FSInfo hints.
    pub fn sync(&mut self) -> Result<(), FatError<BD::Error>> {
        self.fat_cache.flush(&mut self.block_device)?;
        if self.info_dirty {
            if let Some(sector) = self.bpb.fs_info_sector() {
                let mut block = self.block_device.read_block(sector)?;
                FsInfo {
                    free_count: self.free_count,
                    next_free: Some(self.next_free),
                }
                .update(&mut block);
                self.block_device.write_block(sector, &block)?;
            }
            self.info_dirty = false;
        }
        Ok(())
    }

    /// Sync and hand the block device back. If the sync fails the volume is
    /// returned along with the error.
    pub fn unmount(mut self) -> Result<BD, (FatError<BD::Error>, Self)> {
        match self.sync() {
            Ok(()) => Ok(self.block_device.into_inner()),
            Err(e) => Err((e, self)),
        }
    }

    /// The block device underneath, e.g. to change the SPI clock of an SD
    /// card. Blocks written through this bypass the FAT cache.
    pub fn device(&mut self) -> &mut BD {
        self.block_device.inner_mut()
    }

    pub fn bpb(&self) -> &BiosParameterBlock {
        &self.bpb
    }

    pub fn fat_type(&self) -> FatType {
        self.bpb.fat_type()
    }

    /// The partition (or whole device) the volume lives on.
    pub fn partition(&self) -> &Partition {
        self.block_device.partition()
    }

    /// Number of free clusters. Taken from FSInfo when it had one, counted
    /// from the FAT otherwise.
    pub fn free_cluster_count(&mut self) -> Result<u32, FatError<BD::Error>> {
        if let Some(count) = self.free_count {
            return Ok(count);
        }
        let mut count = 0;
        for number in Cluster::FIRST_DATA.0..=self.bpb.maximum_valid_cluster() {
            if self.fat_entry(Cluster(number))? == Entry::Free {
                count += 1;
            }
        }
        self.free_count = Some(count);
        self.info_dirty = true;
        Ok(count)
    }

    /// Open a file in the root directory.
    ///
    /// * [`Mode::Read`] and [`Mode::Append`] need the file to exist.
    /// * [`Mode::WriteTruncate`] creates the file if it is missing, and
    ///   otherwise empties it, releasing its clusters.
    ///
    /// The volume stays borrowed until the file is closed or dropped.
    pub fn open<N>(
        &mut self,
        name: N,
        mode: Mode,
    ) -> Result<File<'_, BD, T>, FatError<BD::Error>>
    where
        N: ToShortFileName,
    {
        let name = name.to_short_filename()?;
        let existing = self.find_entry(&name)?;
        if let Some(entry) = &existing {
            if entry.is_dir() {
                return Err(FatError::IsDirectory);
            }
            if mode != Mode::Read && entry.attributes().is_read_only() {
                return Err(FatError::ReadOnly);
            }
        }

        match (mode, existing) {
            (Mode::Read, None) | (Mode::Append, None) => Err(FatError::NotFound),
            (Mode::Read, Some(entry)) => Ok(File::new(self, entry, mode, false)),
            (Mode::Append, Some(entry)) => File::at_end(self, entry),
            (Mode::WriteTruncate, Some(mut entry)) => {
                debug!("Truncating {}", name);
                let chain = entry.cluster.take();
                entry.size = 0;
                entry.mtime = self.time_source.get_timestamp();
                // The entry lets go of the chain before the chain is freed.
                self.write_entry(&entry)?;
                if let Some(first) = chain {
                    self.free_chain(first)?;
                }
                Ok(File::new(self, entry, mode, chain.is_some()))
            }
            (Mode::WriteTruncate, None) => {
                debug!("Creating {}", name);
                let (block, offset) = self.find_free_slot()?;
                // The root directory may have grown.
                self.sync()?;
                let now = self.time_source.get_timestamp();
                let entry = DirEntry::new(name, now, block, offset);
                self.create_entry(&entry)?;
                Ok(File::new(self, entry, mode, false))
            }
        }
    }

    /// Look up a file or directory in the root directory.
    pub fn find<N>(&mut self, name: N) -> Result<DirEntry, FatError<BD::Error>>
    where
        N: ToShortFileName,
    {
        let name = name.to_short_filename()?;
        self.find_entry(&name)?.ok_or(FatError::NotFound)
    }

    /// Remove a file from the root directory and release its clusters.
    pub fn delete<N>(&mut self, name: N) -> Result<(), FatError<BD::Error>>
    where
        N: ToShortFileName,
    {
        let name = name.to_short_filename()?;
        let entry = self.find_entry(&name)?.ok_or(FatError::NotFound)?;
        if entry.is_dir() {
            return Err(FatError::IsDirectory);
        }
        if entry.attributes().is_read_only() {
            return Err(FatError::ReadOnly);
        }
        debug!("Deleting {}", name);
        self.mark_entry_deleted(&entry)?;
        if let Some(first) = entry.cluster {
            self.free_chain(first)?;
        }
        self.sync()
    }

    pub(crate) fn timestamp(&self) -> Timestamp {
        self.time_source.get_timestamp()
    }
}

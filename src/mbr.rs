//! embedded-sdfat - Master Boot Record
//!
//! Reads the classic four-entry partition table from block 0 and exposes a
//! single partition as its own [`BlockDevice`], with block 0 being the first
//! block of the partition.

use crate::{Block, BlockCount, BlockDevice, BlockIdx};
use core::fmt::Debug;

/// Why a partition table could not be used.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MbrError {
    /// Block 0 does not end in 0x55AA
    InvalidMbrSignature,
    /// A partition entry with a status byte other than 0x00 or 0x80
    InvalidPartitionStatus(u8),
    /// None of the four entries is a FAT partition
    NoFatPartition,
    /// The partition runs past the end of the device
    PartitionTooLarge,
}

/// One of the four primary partitions.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PartitionNumber {
    One,
    Two,
    Three,
    Four,
}

impl PartitionNumber {
    /// All partitions, in table order.
    pub const ALL: [PartitionNumber; 4] = [Self::One, Self::Two, Self::Three, Self::Four];

    /// Map a 1-based partition number.
    pub fn from_number(number: usize) -> Option<Self> {
        let partition = match number {
            1 => Self::One,
            2 => Self::Two,
            3 => Self::Three,
            4 => Self::Four,
            _ => return None,
        };
        Some(partition)
    }

    fn index(self) -> usize {
        match self {
            Self::One => 0,
            Self::Two => 1,
            Self::Three => 2,
            Self::Four => 3,
        }
    }
}

/// The system ID byte of a partition entry.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PartitionType {
    Empty,
    Fat12,
    Fat16Small,
    Fat16,
    Fat32ChsLba,
    Fat32Lba,
    Fat16Lba,
    Unknown(u8),
}

impl PartitionType {
    const EMPTY: u8 = 0x00;
    /// FAT12, CHS addressed. Floppy-sized images.
    const FAT12: u8 = 0x01;
    /// FAT16 with fewer than 65536 sectors.
    const FAT16_SMALL: u8 = 0x04;
    /// Marker for a FAT16 partition. Seen on a card formatted with the official
    /// SD-Card formatter.
    const FAT16: u8 = 0x06;
    /// Marker for a FAT32 partition. What Macosx disk utility (and also SD-Card formatter?)
    /// use.
    const FAT32_CHS_LBA: u8 = 0x0B;
    /// Marker for a FAT32 partition. Sometimes also use for FAT16 formatted
    /// partitions.
    const FAT32_LBA: u8 = 0x0C;
    /// Marker for a FAT16 partition with LBA. Seen on a Raspberry Pi SD card.
    const FAT16_LBA: u8 = 0x0E;

    pub fn from_u8(value: u8) -> Self {
        match value {
            Self::EMPTY => Self::Empty,
            Self::FAT12 => Self::Fat12,
            Self::FAT16_SMALL => Self::Fat16Small,
            Self::FAT16 => Self::Fat16,
            Self::FAT32_CHS_LBA => Self::Fat32ChsLba,
            Self::FAT32_LBA => Self::Fat32Lba,
            Self::FAT16_LBA => Self::Fat16Lba,
            _ => Self::Unknown(value),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::Empty => Self::EMPTY,
            Self::Fat12 => Self::FAT12,
            Self::Fat16Small => Self::FAT16_SMALL,
            Self::Fat16 => Self::FAT16,
            Self::Fat32ChsLba => Self::FAT32_CHS_LBA,
            Self::Fat32Lba => Self::FAT32_LBA,
            Self::Fat16Lba => Self::FAT16_LBA,
            Self::Unknown(value) => value,
        }
    }

    /// Does this ID announce some flavour of FAT?
    pub fn is_fat(self) -> bool {
        !matches!(self, Self::Empty | Self::Unknown(_))
    }
}

/// A single partition table entry.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Partition {
    pub active: bool,
    pub ty: PartitionType,
    pub lba_start: BlockCount,
    pub block_count: BlockCount,
}

impl Partition {
    const STATUS_IDX: usize = 0;
    const TYPE_IDX: usize = 4;
    const LBA_START_IDX: usize = 8;
    const NUM_BLOCKS_IDX: usize = 12;
    pub(crate) const PARTITION_INFO_LENGTH: usize = 16;

    const STATUS_ACTIVE: u8 = 0x80;
    const STATUS_INACTIVE: u8 = 0x00;

    /// A pseudo-partition covering a whole unpartitioned device.
    pub fn whole_device(block_count: BlockCount) -> Self {
        Partition {
            active: true,
            ty: PartitionType::Unknown(0xFF),
            lba_start: BlockCount(0),
            block_count,
        }
    }

    /// Parse one 16 byte partition entry.
    pub fn from_info(info: &[u8; Self::PARTITION_INFO_LENGTH]) -> Result<Self, MbrError> {
        let ty = PartitionType::from_u8(info[Self::TYPE_IDX]);
        let status = info[Self::STATUS_IDX];
        if ty != PartitionType::Empty
            && status != Self::STATUS_ACTIVE
            && status != Self::STATUS_INACTIVE
        {
            return Err(MbrError::InvalidPartitionStatus(status));
        }

        let lba_start = read_u32(info, Self::LBA_START_IDX);
        let num_blocks = read_u32(info, Self::NUM_BLOCKS_IDX);

        Ok(Partition {
            active: status == Self::STATUS_ACTIVE,
            ty,
            lba_start: BlockCount(lba_start),
            block_count: BlockCount(num_blocks),
        })
    }

    /// Serialise into a 16 byte partition entry. CHS fields are left zero.
    pub fn to_info(&self) -> [u8; Self::PARTITION_INFO_LENGTH] {
        let mut info = [0u8; Self::PARTITION_INFO_LENGTH];
        info[Self::STATUS_IDX] = if self.active {
            Self::STATUS_ACTIVE
        } else {
            Self::STATUS_INACTIVE
        };
        info[Self::TYPE_IDX] = self.ty.to_u8();
        info[Self::LBA_START_IDX..Self::LBA_START_IDX + 4]
            .copy_from_slice(&self.lba_start.0.to_le_bytes());
        info[Self::NUM_BLOCKS_IDX..Self::NUM_BLOCKS_IDX + 4]
            .copy_from_slice(&self.block_count.0.to_le_bytes());
        info
    }

    /// One past the last block of this partition, on the underlying device.
    pub fn end(&self) -> u64 {
        u64::from(self.lba_start.0) + u64::from(self.block_count.0)
    }
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// The partition table held in block 0.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mbr {
    partitions: [Partition; 4],
}

impl Mbr {
    const FOOTER_START: usize = 510;
    const FOOTER_VALUE: u16 = 0xAA55;
    const PARTITION1_START: usize = 446;

    /// Parse block 0 of a device.
    pub fn parse(block: &Block) -> Result<Self, MbrError> {
        let footer =
            u16::from_le_bytes([block[Self::FOOTER_START], block[Self::FOOTER_START + 1]]);
        if footer != Self::FOOTER_VALUE {
            return Err(MbrError::InvalidMbrSignature);
        }

        let mut partitions = [Partition::whole_device(BlockCount(0)); 4];
        for (idx, partition) in partitions.iter_mut().enumerate() {
            let start = Self::PARTITION1_START + idx * Partition::PARTITION_INFO_LENGTH;
            let mut info = [0u8; Partition::PARTITION_INFO_LENGTH];
            info.copy_from_slice(&block[start..start + Partition::PARTITION_INFO_LENGTH]);
            *partition = Partition::from_info(&info)?;
        }
        Ok(Mbr { partitions })
    }

    /// Build block 0 from four partition entries.
    pub fn to_block(&self) -> Block {
        let mut block = Block::new();
        for (idx, partition) in self.partitions.iter().enumerate() {
            let start = Self::PARTITION1_START + idx * Partition::PARTITION_INFO_LENGTH;
            block[start..start + Partition::PARTITION_INFO_LENGTH]
                .copy_from_slice(&partition.to_info());
        }
        block[Self::FOOTER_START..].copy_from_slice(&Self::FOOTER_VALUE.to_le_bytes());
        block
    }

    /// Make a table from its entries.
    pub fn new(partitions: [Partition; 4]) -> Self {
        Mbr { partitions }
    }

    pub fn partition(&self, number: PartitionNumber) -> &Partition {
        &self.partitions[number.index()]
    }

    /// The partition a volume should be mounted from: the active FAT
    /// partition, or failing that the first FAT partition in the table.
    pub fn fat_partition(&self) -> Result<(PartitionNumber, Partition), MbrError> {
        let fat = || {
            PartitionNumber::ALL
                .iter()
                .map(|&n| (n, *self.partition(n)))
                .filter(|(_, p)| p.ty.is_fat() && p.block_count.0 != 0)
        };
        fat()
            .find(|(_, p)| p.active)
            .or_else(|| fat().next())
            .ok_or(MbrError::NoFatPartition)
    }
}

/// Errors from a [`PartitionBlockDevice`].
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionError<E>
where
    E: Debug,
{
    DeviceError(E),
    OutOfRange { partition_block_count: BlockCount },
}

/// A block device restricted to one partition of another one.
pub struct PartitionBlockDevice<BD>
where
    BD: BlockDevice,
{
    block_device: BD,
    partition: Partition,
}

impl<BD> PartitionBlockDevice<BD>
where
    BD: BlockDevice,
{
    pub fn new(block_device: BD, partition: Partition) -> Self {
        PartitionBlockDevice {
            block_device,
            partition,
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// Borrow the device underneath the partition.
    pub fn inner_mut(&mut self) -> &mut BD {
        &mut self.block_device
    }

    pub fn into_inner(self) -> BD {
        self.block_device
    }

    fn range_check<E>(&self, start: u32, len: u32) -> Result<(), PartitionError<E>>
    where
        E: Debug,
    {
        let last_block = u64::from(start) + u64::from(len);

        if last_block > u64::from(self.partition.block_count.0) {
            Err(PartitionError::OutOfRange {
                partition_block_count: self.partition.block_count,
            })
        } else {
            Ok(())
        }
    }
}

impl<BD> BlockDevice for PartitionBlockDevice<BD>
where
    BD: BlockDevice,
{
    type Error = PartitionError<BD::Error>;

    fn read(
        &mut self,
        blocks: &mut [Block],
        start_block_idx: BlockIdx,
        reason: &str,
    ) -> Result<(), Self::Error> {
        let blocks_to_read = blocks.len() as u32;
        self.range_check(start_block_idx.0, blocks_to_read)?;

        let part_start_block_idx = start_block_idx + self.partition.lba_start;

        self.block_device
            .read(blocks, part_start_block_idx, reason)
            .map_err(PartitionError::DeviceError)
    }

    fn write(&mut self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        let blocks_to_write = blocks.len() as u32;
        self.range_check(start_block_idx.0, blocks_to_write)?;

        let part_start_block_idx = start_block_idx + self.partition.lba_start;

        self.block_device
            .write(blocks, part_start_block_idx)
            .map_err(PartitionError::DeviceError)
    }

    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error> {
        Ok(self.partition.block_count)
    }
}

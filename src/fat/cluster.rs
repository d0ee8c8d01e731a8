use super::FatType;

/// The number of a data cluster. Clusters 0 and 1 do not exist; their FAT
/// slots hold the media byte and the clean-shutdown flags.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Cluster(pub(crate) u32);

impl Cluster {
    /// The first cluster in the data region.
    pub const FIRST_DATA: Cluster = Cluster(2);

    pub fn new(cluster_number: u32) -> Self {
        Self(cluster_number)
    }

    pub fn number(&self) -> u32 {
        self.0
    }
}

/// What one FAT slot says about its cluster.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    Free,
    /// The chain continues here.
    Next(Cluster),
    Bad,
    /// Last cluster of its chain.
    EndOfChain,
    /// Value 1, which no allocated cluster may carry.
    Reserved,
}

impl Entry {
    const FREE: u32 = 0;
    const RESERVED: u32 = 1;

    const FAT12_BAD: u32 = 0xFF7;
    const FAT12_FINAL: u32 = 0xFFF;
    const FAT12_EOC_MIN: u32 = 0xFF8;

    const FAT16_BAD: u32 = 0xFFF7;
    const FAT16_FINAL: u32 = 0xFFFF;
    const FAT16_EOC_MIN: u32 = 0xFFF8;

    const FAT32_BAD: u32 = 0x0FFF_FFF7;
    const FAT32_FINAL: u32 = 0x0FFF_FFFF;
    const FAT32_EOC_MIN: u32 = 0x0FFF_FFF8;

    /// The bits of a FAT32 slot that belong to the entry.
    pub const FAT32_MASK: u32 = 0x0FFF_FFFF;

    fn markers(fat_type: FatType) -> (u32, u32, u32) {
        match fat_type {
            FatType::Fat12 => (Self::FAT12_BAD, Self::FAT12_EOC_MIN, Self::FAT12_FINAL),
            FatType::Fat16 => (Self::FAT16_BAD, Self::FAT16_EOC_MIN, Self::FAT16_FINAL),
            FatType::Fat32 => (Self::FAT32_BAD, Self::FAT32_EOC_MIN, Self::FAT32_FINAL),
        }
    }

    /// Classify a slot value. FAT32 values must already be masked.
    pub fn from_raw(fat_type: FatType, value: u32) -> Self {
        let (bad, eoc_min, _) = Self::markers(fat_type);
        match value {
            Self::FREE => Entry::Free,
            Self::RESERVED => Entry::Reserved,
            v if v == bad => Entry::Bad,
            v if v >= eoc_min => Entry::EndOfChain,
            v => Entry::Next(Cluster(v)),
        }
    }

    /// The value to store in the slot.
    pub fn to_raw(self, fat_type: FatType) -> u32 {
        let (bad, _, eoc) = Self::markers(fat_type);
        match self {
            Entry::Free => Self::FREE,
            Entry::Reserved => Self::RESERVED,
            Entry::Bad => bad,
            Entry::EndOfChain => eoc,
            Entry::Next(cluster) => cluster.0,
        }
    }
}

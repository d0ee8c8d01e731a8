use crate::{Block, BlockCount, BlockIdx};

use super::{Cluster, FatType};

/// The validated geometry of a FAT volume, read from its boot sector.
#[derive(Debug, Clone)]
pub struct BiosParameterBlock {
    fat_type: FatType,
    fat_size: u32,
    reserved_sector_count: u16,
    sectors_per_cluster: u8,
    num_fats: u8,
    media: u8,
    root_entry_count: u16,
    total_sector_count: u32,
    cluster_count: u32,
    root_cluster: u32,
    fs_info: u16,
}

#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BpbError {
    InvalidMedia(u8),
    BothSectorCountsZero,
    BothSectorCountsNotZero,
    RootEntryCountSize,
    RootEntryCountZero,
    Fat32(Fat32BpbError),
    InvalidBytesPerSector(u16),
    InvalidSectorsPerCluster(u8),
    ReservedSectorCountZero,
    NumFatsZero,
    FatSizeZero,
    NoDataRegion,
    FatTooSmall { needed: u32, actual: u32 },
    InvalidSignature([u8; 2]),
}

#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fat32BpbError {
    Count16NotZero,
    FatSize16NotZero,
    RootEntryCountNotZero,
    FsVerNotZero,
    RootClusterOutOfRange(u32),
    InvalidBackupBootSector(u16),
}

/// The BPB_Reserved and BS_* fields are not verified.
impl BiosParameterBlock {
    pub const SIGNATURE: [u8; 2] = [0x55, 0xAA];

    const FAT12_MAX_CLUSTERS: u32 = 4085;
    const FAT16_MAX_CLUSTERS: u32 = 65525;
    const DIR_ENTRY_LEN: u32 = 32;

    pub fn new(block: Block) -> Result<Self, BpbError> {
        let raw = BiosParameterBlockRaw { block };

        if raw.signature_word() != Self::SIGNATURE {
            return Err(BpbError::InvalidSignature(raw.signature_word()));
        }

        // Everything below the block layer assumes one sector is one block.
        let bytes_per_sector = raw.bytes_per_sec();
        if bytes_per_sector != Block::LEN as u16 {
            return Err(BpbError::InvalidBytesPerSector(bytes_per_sector));
        }

        let sectors_per_cluster = raw.sec_per_clu();
        if !sectors_per_cluster.is_power_of_two() {
            return Err(BpbError::InvalidSectorsPerCluster(sectors_per_cluster));
        }

        let reserved_sector_count = raw.rsvd_sec_cnt();
        if reserved_sector_count == 0 {
            return Err(BpbError::ReservedSectorCountZero);
        }

        let num_fats = raw.num_fats();
        if num_fats == 0 {
            return Err(BpbError::NumFatsZero);
        }

        let media = Self::media_checked(raw.media())?;

        let fat_size = if raw.fat_sz_16() == 0 {
            raw.fat_sz_32()
        } else {
            u32::from(raw.fat_sz_16())
        };
        if fat_size == 0 {
            return Err(BpbError::FatSizeZero);
        }

        let root_entry_count = raw.root_entr_cnt();
        let total_sector_count = Self::total_sector_count_checked(&raw)?;

        let root_dir_sectors = Self::compute_root_dir_sectors(u32::from(root_entry_count));
        let overhead = u64::from(reserved_sector_count)
            + u64::from(num_fats) * u64::from(fat_size)
            + u64::from(root_dir_sectors);
        if overhead >= u64::from(total_sector_count) {
            return Err(BpbError::NoDataRegion);
        }
        let data_sectors = total_sector_count - overhead as u32;
        let cluster_count = data_sectors / u32::from(sectors_per_cluster);

        let fat_type = Self::compute_fat_type(cluster_count);

        let me = Self {
            fat_type,
            fat_size,
            reserved_sector_count,
            sectors_per_cluster,
            num_fats,
            media,
            root_entry_count,
            total_sector_count,
            cluster_count,
            root_cluster: 0,
            fs_info: 0,
        };

        me.verify_fat_size()?;

        match fat_type {
            FatType::Fat12 | FatType::Fat16 => {
                me.verify_root_entry_count()?;
                Ok(me)
            }
            FatType::Fat32 => me.with_fat32_fields(&raw),
        }
    }

    pub fn fat_type(&self) -> FatType {
        self.fat_type
    }

    pub fn reserved_sector_count(&self) -> BlockCount {
        BlockCount(u32::from(self.reserved_sector_count))
    }

    /// Sectors per FAT copy.
    pub fn fat_size(&self) -> BlockCount {
        BlockCount(self.fat_size)
    }

    pub fn num_fats(&self) -> u8 {
        self.num_fats
    }

    pub fn media(&self) -> u8 {
        self.media
    }

    pub fn sectors_per_cluster(&self) -> BlockCount {
        BlockCount(u32::from(self.sectors_per_cluster))
    }

    pub fn bytes_per_cluster(&self) -> u32 {
        u32::from(self.sectors_per_cluster) * Block::LEN_U32
    }

    pub fn total_sector_count(&self) -> BlockCount {
        BlockCount(self.total_sector_count)
    }

    pub fn root_entry_count(&self) -> u16 {
        self.root_entry_count
    }

    /// Number of data clusters. Valid cluster numbers are `2..cluster_count + 2`.
    pub fn cluster_count(&self) -> u32 {
        self.cluster_count
    }

    pub fn maximum_valid_cluster(&self) -> u32 {
        self.cluster_count + 1
    }

    pub fn is_valid_cluster(&self, cluster: Cluster) -> bool {
        cluster.0 >= Cluster::FIRST_DATA.0 && cluster.0 <= self.maximum_valid_cluster()
    }

    /// First sector of the first FAT.
    pub fn fat_start(&self) -> BlockIdx {
        BlockIdx(u32::from(self.reserved_sector_count))
    }

    /// First sector of the fixed root directory (FAT12/16 only).
    pub fn root_dir_start(&self) -> BlockIdx {
        self.fat_start() + BlockCount(u32::from(self.num_fats) * self.fat_size)
    }

    pub fn root_dir_sectors(&self) -> BlockCount {
        BlockCount(Self::compute_root_dir_sectors(u32::from(
            self.root_entry_count,
        )))
    }

    pub fn data_start(&self) -> BlockIdx {
        self.root_dir_start() + self.root_dir_sectors()
    }

    /// The sector a data cluster starts at.
    pub fn cluster_start(&self, cluster: Cluster) -> BlockIdx {
        let offset = (cluster.0 - Cluster::FIRST_DATA.0) * u32::from(self.sectors_per_cluster);
        self.data_start() + BlockCount(offset)
    }

    /// First cluster of the root directory (FAT32 only).
    pub fn root_cluster(&self) -> Option<Cluster> {
        match self.fat_type {
            FatType::Fat32 => Some(Cluster(self.root_cluster)),
            _ => None,
        }
    }

    /// Sector of the FSInfo structure (FAT32 only).
    pub fn fs_info_sector(&self) -> Option<BlockIdx> {
        match self.fat_type {
            FatType::Fat32 if self.fs_info != 0 && self.fs_info != 0xFFFF => {
                Some(BlockIdx(u32::from(self.fs_info)))
            }
            _ => None,
        }
    }

    fn compute_root_dir_sectors(root_entry_count: u32) -> u32 {
        let bytes = root_entry_count * Self::DIR_ENTRY_LEN;
        (bytes + (Block::LEN_U32 - 1)) / Block::LEN_U32
    }

    fn compute_fat_type(cluster_count: u32) -> FatType {
        if cluster_count < Self::FAT12_MAX_CLUSTERS {
            FatType::Fat12
        } else if cluster_count < Self::FAT16_MAX_CLUSTERS {
            FatType::Fat16
        } else {
            FatType::Fat32
        }
    }

    fn media_checked(media: u8) -> Result<u8, BpbError> {
        match media {
            0xF0 | 0xF8 | 0xF9 | 0xFA | 0xFB | 0xFC | 0xFD | 0xFE | 0xFF => Ok(media),
            _ => Err(BpbError::InvalidMedia(media)),
        }
    }

    fn total_sector_count_checked(raw: &BiosParameterBlockRaw) -> Result<u32, BpbError> {
        let sec_16 = raw.tot_sec_16();
        let sec_32 = raw.tot_sec_32();
        if sec_16 == 0 && sec_32 != 0 {
            Ok(sec_32)
        } else if sec_32 == 0 && sec_16 != 0 {
            Ok(u32::from(sec_16))
        } else if sec_32 != 0 && sec_16 != 0 {
            Err(BpbError::BothSectorCountsNotZero)
        } else {
            Err(BpbError::BothSectorCountsZero)
        }
    }

    fn verify_root_entry_count(&self) -> Result<(), BpbError> {
        let value = u32::from(self.root_entry_count);
        if value == 0 {
            Err(BpbError::RootEntryCountZero)
        } else if (value * Self::DIR_ENTRY_LEN) % Block::LEN_U32 != 0 {
            Err(BpbError::RootEntryCountSize)
        } else {
            Ok(())
        }
    }

    // Every cluster, plus the two reserved entries, must have a slot.
    fn verify_fat_size(&self) -> Result<(), BpbError> {
        let entries = u64::from(self.cluster_count) + 2;
        let bytes = match self.fat_type {
            FatType::Fat12 => (entries * 3 + 1) / 2,
            FatType::Fat16 => entries * 2,
            FatType::Fat32 => entries * 4,
        };
        let needed = ((bytes + u64::from(Block::LEN_U32) - 1) / u64::from(Block::LEN_U32)) as u32;
        if needed > self.fat_size {
            Err(BpbError::FatTooSmall {
                needed,
                actual: self.fat_size,
            })
        } else {
            Ok(())
        }
    }

    fn with_fat32_fields(mut self, raw: &BiosParameterBlockRaw) -> Result<Self, BpbError> {
        let fat32 = |e| -> Result<Self, BpbError> { Err(BpbError::Fat32(e)) };
        if raw.tot_sec_16() != 0 {
            return fat32(Fat32BpbError::Count16NotZero);
        }
        if raw.fat_sz_16() != 0 {
            return fat32(Fat32BpbError::FatSize16NotZero);
        }
        if self.root_entry_count != 0 {
            return fat32(Fat32BpbError::RootEntryCountNotZero);
        }
        if raw.fs_ver() != 0 {
            return fat32(Fat32BpbError::FsVerNotZero);
        }
        let root_cluster = raw.root_clus();
        if !self.is_valid_cluster(Cluster(root_cluster)) {
            return fat32(Fat32BpbError::RootClusterOutOfRange(root_cluster));
        }
        let backup = raw.bk_boot_sec();
        if backup != 0 && backup != 6 {
            return fat32(Fat32BpbError::InvalidBackupBootSector(backup));
        }
        self.root_cluster = root_cluster;
        self.fs_info = raw.fs_info();
        Ok(self)
    }
}

/// Raw access to the fields of a boot sector, used to parse one and to lay
/// one down when formatting.
#[derive(Debug, Clone)]
pub struct BiosParameterBlockRaw {
    block: Block,
}

impl Default for BiosParameterBlockRaw {
    fn default() -> Self {
        Self::new()
    }
}

impl BiosParameterBlockRaw {
    /// A zeroed boot sector with the jump instruction and signature in place.
    pub fn new() -> Self {
        let mut block = Block::new();
        block[0..3].copy_from_slice(&[0xEB, 0x3C, 0x90]);
        block[510..512].copy_from_slice(&BiosParameterBlock::SIGNATURE);
        BiosParameterBlockRaw { block }
    }

    pub fn from_block(block: Block) -> Self {
        BiosParameterBlockRaw { block }
    }

    pub fn into_block(self) -> Block {
        self.block
    }

    fn data(&self) -> &[u8] {
        &self.block.contents
    }

    fn data_mut(&mut self) -> &mut [u8] {
        &mut self.block.contents
    }

    /// Does this look like a boot sector rather than a partition table?
    pub fn looks_like_boot_sector(&self) -> bool {
        let jump = self.data()[0];
        (jump == 0xEB || jump == 0xE9)
            && self.bytes_per_sec() == Block::LEN as u16
            && self.sec_per_clu().is_power_of_two()
    }

    define_field!(bytes_per_sec, set_bytes_per_sec, u16, 11);
    define_field!(sec_per_clu, set_sec_per_clu, u8, 13);
    define_field!(rsvd_sec_cnt, set_rsvd_sec_cnt, u16, 14);
    define_field!(num_fats, set_num_fats, u8, 16);
    define_field!(root_entr_cnt, set_root_entr_cnt, u16, 17);
    define_field!(tot_sec_16, set_tot_sec_16, u16, 19);
    define_field!(media, set_media, u8, 21);
    define_field!(fat_sz_16, set_fat_sz_16, u16, 22);
    define_field!(sectors_per_track, set_sectors_per_track, u16, 24);
    define_field!(number_of_heads, set_number_of_heads, u16, 26);
    define_field!(hidden_sectors, set_hidden_sectors, u32, 28);
    define_field!(tot_sec_32, set_tot_sec_32, u32, 32);

    // FAT32 specific structure
    define_field!(fat_sz_32, set_fat_sz_32, u32, 36);
    define_field!(ext_flags, set_ext_flags, u16, 40);
    define_field!(fs_ver, set_fs_ver, u16, 42);
    define_field!(root_clus, set_root_clus, u32, 44);
    define_field!(fs_info, set_fs_info, u16, 48);
    define_field!(bk_boot_sec, set_bk_boot_sec, u16, 50);

    pub fn signature_word(&self) -> [u8; 2] {
        let d = self.data();
        [d[510], d[511]]
    }

    pub fn set_signature_word(&mut self, signature: [u8; 2]) {
        self.data_mut()[510..512].copy_from_slice(&signature);
    }
}

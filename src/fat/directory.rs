use crate::BlockIdx;

use super::{Cluster, FatType, ShortFileName, Timestamp};

bitflags::bitflags! {
    /// Directory entry attribute bits.
    pub struct Attributes: u8 {
        const READ_ONLY = (1 << 0);
        const HIDDEN = (1 << 1);
        const SYSTEM = (1 << 2);
        const VOLUME_ID = (1 << 3);
        const DIRECTORY = (1 << 4);
        const ARCHIVE = (1 << 5);
    }
}

impl Attributes {
    const LONG_NAME: u8 = 0x0F;

    /// A long-file-name fragment rather than a real entry.
    pub fn is_long_name(&self) -> bool {
        self.bits() & Self::LONG_NAME == Self::LONG_NAME
    }

    pub fn is_dir(&self) -> bool {
        self.contains(Self::DIRECTORY)
    }

    pub fn is_volume(&self) -> bool {
        !self.is_long_name() && self.contains(Self::VOLUME_ID)
    }

    pub fn is_read_only(&self) -> bool {
        self.contains(Self::READ_ONLY)
    }
}

#[cfg(feature = "defmt-log")]
impl defmt::Format for Attributes {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "Attributes({=u8:#04x})", self.bits())
    }
}

/// A file (or directory) as recorded in its directory, plus where that record
/// lives on disk so it can be written back.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub(crate) name: ShortFileName,
    pub(crate) attributes: Attributes,
    pub(crate) size: u32,
    pub(crate) cluster: Option<Cluster>,
    pub(crate) ctime: Timestamp,
    pub(crate) mtime: Timestamp,
    pub(crate) entry_block: BlockIdx,
    pub(crate) entry_offset: usize,
}

impl DirEntry {
    /// An empty archive file, to be stored in the given slot.
    pub(crate) fn new(
        name: ShortFileName,
        timestamp: Timestamp,
        entry_block: BlockIdx,
        entry_offset: usize,
    ) -> Self {
        DirEntry {
            name,
            attributes: Attributes::ARCHIVE,
            size: 0,
            cluster: None,
            ctime: timestamp,
            mtime: timestamp,
            entry_block,
            entry_offset,
        }
    }

    pub fn name(&self) -> &ShortFileName {
        &self.name
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn is_dir(&self) -> bool {
        self.attributes.is_dir()
    }

    pub fn file_size(&self) -> u32 {
        self.size
    }

    /// `None` for an empty file.
    pub fn first_cluster(&self) -> Option<Cluster> {
        self.cluster
    }

    pub fn created(&self) -> Timestamp {
        self.ctime
    }

    pub fn modified(&self) -> Timestamp {
        self.mtime
    }

    /// Block and byte offset of the 32 byte record.
    pub fn location(&self) -> (BlockIdx, usize) {
        (self.entry_block, self.entry_offset)
    }
}

/// One 32 byte directory record.
#[derive(Debug, Clone)]
pub struct DirEntryRaw {
    data: [u8; DirEntryRaw::LEN],
}

impl DirEntryRaw {
    pub const LEN: usize = 32;

    const END_OF_DIRECTORY: u8 = 0x00;
    const DELETED: u8 = 0xE5;

    pub fn new(data: &[u8]) -> Self {
        let mut raw = DirEntryRaw {
            data: [0u8; Self::LEN],
        };
        raw.data.copy_from_slice(&data[..Self::LEN]);
        raw
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.data
    }

    pub fn name(&self) -> [u8; 11] {
        let mut name = [0u8; 11];
        name.copy_from_slice(&self.data()[0..11]);
        name
    }

    pub fn set_name(&mut self, name: &[u8; 11]) {
        self.data_mut()[0..11].copy_from_slice(name);
    }

    define_field!(attr, set_attr, u8, 11);
    define_field!(crt_time_tenth, set_crt_time_tenth, u8, 13);
    define_field!(crt_time, set_crt_time, u16, 14);
    define_field!(crt_date, set_crt_date, u16, 16);
    define_field!(lst_acc_date, set_lst_acc_date, u16, 18);
    define_field!(fst_clus_hi, set_fst_clus_hi, u16, 20);
    define_field!(wrt_time, set_wrt_time, u16, 22);
    define_field!(wrt_date, set_wrt_date, u16, 24);
    define_field!(fst_clus_lo, set_fst_clus_lo, u16, 26);
    define_field!(file_size, set_file_size, u32, 28);

    /// This slot, and every one after it, has never been used.
    pub fn is_end(&self) -> bool {
        self.data[0] == Self::END_OF_DIRECTORY
    }

    pub fn is_deleted(&self) -> bool {
        self.data[0] == Self::DELETED
    }

    /// The slot can take a new entry.
    pub fn is_free(&self) -> bool {
        self.is_end() || self.is_deleted()
    }

    pub fn mark_deleted(&mut self) {
        self.data[0] = Self::DELETED;
    }

    /// A live 8.3 file or directory entry (not a long name fragment, not the
    /// volume label).
    pub fn is_short_entry(&self) -> bool {
        let attributes = Attributes::from_bits_truncate(self.attr());
        !self.is_free() && !attributes.is_long_name() && !attributes.is_volume()
    }

    pub fn to_dir_entry(
        &self,
        fat_type: FatType,
        entry_block: BlockIdx,
        entry_offset: usize,
    ) -> DirEntry {
        let hi = match fat_type {
            FatType::Fat32 => u32::from(self.fst_clus_hi()),
            // Holds access rights on some FAT12/16 implementations
            FatType::Fat12 | FatType::Fat16 => 0,
        };
        let cluster = (hi << 16) | u32::from(self.fst_clus_lo());
        DirEntry {
            name: ShortFileName::from_raw(self.name()),
            attributes: Attributes::from_bits_truncate(self.attr()),
            size: self.file_size(),
            cluster: if cluster == 0 {
                None
            } else {
                Some(Cluster(cluster))
            },
            ctime: Timestamp::from_fat(self.crt_date(), self.crt_time()),
            mtime: Timestamp::from_fat(self.wrt_date(), self.wrt_time()),
            entry_block,
            entry_offset,
        }
    }

    /// Copy `entry` into this record, keeping the bytes we do not model.
    pub fn update(&mut self, entry: &DirEntry, fat_type: FatType) {
        let cluster = entry.cluster.map(|c| c.0).unwrap_or(0);
        let (crt_date, crt_time) = entry.ctime.serialize_to_fat();
        let (wrt_date, wrt_time) = entry.mtime.serialize_to_fat();
        self.set_name(entry.name.as_raw());
        self.set_attr(entry.attributes.bits());
        self.set_crt_time_tenth(0);
        self.set_crt_time(crt_time);
        self.set_crt_date(crt_date);
        self.set_lst_acc_date(wrt_date);
        match fat_type {
            FatType::Fat32 => self.set_fst_clus_hi((cluster >> 16) as u16),
            FatType::Fat12 | FatType::Fat16 => self.set_fst_clus_hi(0),
        }
        self.set_wrt_time(wrt_time);
        self.set_wrt_date(wrt_date);
        self.set_fst_clus_lo(cluster as u16);
        self.set_file_size(entry.size);
    }
}

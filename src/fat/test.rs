use crate::{Block, BlockCount, BlockDevice, BlockIdx, MemoryBlockDevice};

use super::bios_param_block::{
    BiosParameterBlock, BiosParameterBlockRaw, BpbError, Fat32BpbError,
};
use super::{Cluster, Entry, FatType, FatVolume, TimeSource, Timestamp};

extern crate std;

struct Clock;

impl TimeSource for Clock {
    fn get_timestamp(&self) -> Timestamp {
        Timestamp::from_calendar(2023, 3, 14, 15, 9, 26).unwrap()
    }
}

// A 1.44 MB floppy: 2847 clusters, FAT12.
fn fat12_bpb() -> BiosParameterBlockRaw {
    let mut raw = BiosParameterBlockRaw::new();
    raw.set_bytes_per_sec(512);
    raw.set_sec_per_clu(1);
    raw.set_rsvd_sec_cnt(1);
    raw.set_num_fats(2);
    raw.set_root_entr_cnt(224);
    raw.set_tot_sec_16(2880);
    raw.set_media(0xF0);
    raw.set_fat_sz_16(9);
    raw
}

// 66904 clusters, FAT32, root directory in cluster 2.
fn fat32_bpb() -> BiosParameterBlockRaw {
    let mut raw = BiosParameterBlockRaw::new();
    raw.set_bytes_per_sec(512);
    raw.set_sec_per_clu(1);
    raw.set_rsvd_sec_cnt(32);
    raw.set_num_fats(2);
    raw.set_tot_sec_32(68000);
    raw.set_media(0xF8);
    raw.set_fat_sz_32(532);
    raw.set_root_clus(2);
    raw.set_fs_info(1);
    raw.set_bk_boot_sec(6);
    raw
}

// Lay down a boot sector and the two reserved FAT entries in every FAT.
fn format(bd: &mut MemoryBlockDevice<'_>, raw: BiosParameterBlockRaw) {
    let block = raw.into_block();
    let bpb = BiosParameterBlock::new(block.clone()).unwrap();
    bd.write_block(BlockIdx(0), &block).unwrap();

    let mut fat = Block::new();
    let reserved: &[u8] = match bpb.fat_type() {
        FatType::Fat12 => &[bpb.media(), 0xFF, 0xFF],
        FatType::Fat16 => &[bpb.media(), 0xFF, 0xFF, 0xFF],
        // Cluster 2 holds the empty root directory.
        FatType::Fat32 => &[
            bpb.media(),
            0xFF,
            0xFF,
            0x0F,
            0xFF,
            0xFF,
            0xFF,
            0x0F,
            0xFF,
            0xFF,
            0xFF,
            0x0F,
        ],
    };
    fat[..reserved.len()].copy_from_slice(reserved);
    for copy in 0..u32::from(bpb.num_fats()) {
        let start = bpb.fat_start() + BlockCount(copy * bpb.fat_size().0);
        bd.write_block(start, &fat).unwrap();
    }
}

#[test]
fn fat12_geometry() {
    let bpb = BiosParameterBlock::new(fat12_bpb().into_block()).unwrap();
    assert_eq!(bpb.fat_type(), FatType::Fat12);
    assert_eq!(bpb.cluster_count(), 2847);
    assert_eq!(bpb.fat_start(), BlockIdx(1));
    assert_eq!(bpb.root_dir_start(), BlockIdx(19));
    assert_eq!(bpb.root_dir_sectors(), BlockCount(14));
    assert_eq!(bpb.data_start(), BlockIdx(33));
    assert_eq!(bpb.cluster_start(Cluster(2)), BlockIdx(33));
    assert_eq!(bpb.cluster_start(Cluster(10)), BlockIdx(41));
    assert_eq!(bpb.root_cluster(), None);
    assert_eq!(bpb.fs_info_sector(), None);
}

#[test]
fn fat16_by_cluster_count() {
    let mut raw = fat12_bpb();
    raw.set_tot_sec_16(8192);
    raw.set_root_entr_cnt(512);
    raw.set_fat_sz_16(32);
    raw.set_media(0xF8);
    let bpb = BiosParameterBlock::new(raw.into_block()).unwrap();
    assert_eq!(bpb.fat_type(), FatType::Fat16);
    assert_eq!(bpb.cluster_count(), 8095);
    assert_eq!(bpb.data_start(), BlockIdx(97));
}

#[test]
fn fat32_geometry() {
    let bpb = BiosParameterBlock::new(fat32_bpb().into_block()).unwrap();
    assert_eq!(bpb.fat_type(), FatType::Fat32);
    assert_eq!(bpb.cluster_count(), 66904);
    assert_eq!(bpb.data_start(), BlockIdx(1096));
    assert_eq!(bpb.root_cluster(), Some(Cluster(2)));
    assert_eq!(bpb.fs_info_sector(), Some(BlockIdx(1)));
}

#[test]
fn invalid_boot_sectors() {
    let check = |f: fn(&mut BiosParameterBlockRaw), expected: BpbError| {
        let mut raw = fat12_bpb();
        f(&mut raw);
        assert_eq!(
            BiosParameterBlock::new(raw.into_block()).unwrap_err(),
            expected
        );
    };
    check(
        |r| r.set_signature_word([0, 0]),
        BpbError::InvalidSignature([0, 0]),
    );
    check(
        |r| r.set_bytes_per_sec(1024),
        BpbError::InvalidBytesPerSector(1024),
    );
    check(
        |r| r.set_sec_per_clu(3),
        BpbError::InvalidSectorsPerCluster(3),
    );
    check(
        |r| r.set_sec_per_clu(0),
        BpbError::InvalidSectorsPerCluster(0),
    );
    check(|r| r.set_rsvd_sec_cnt(0), BpbError::ReservedSectorCountZero);
    check(|r| r.set_num_fats(0), BpbError::NumFatsZero);
    check(|r| r.set_media(0x12), BpbError::InvalidMedia(0x12));
    check(|r| r.set_fat_sz_16(0), BpbError::FatSizeZero);
    check(|r| r.set_tot_sec_32(2880), BpbError::BothSectorCountsNotZero);
    check(|r| r.set_tot_sec_16(0), BpbError::BothSectorCountsZero);
    check(|r| r.set_tot_sec_16(30), BpbError::NoDataRegion);
    check(|r| r.set_root_entr_cnt(0), BpbError::RootEntryCountZero);
    check(|r| r.set_root_entr_cnt(200), BpbError::RootEntryCountSize);
    check(
        |r| r.set_fat_sz_16(2),
        BpbError::FatTooSmall {
            needed: 9,
            actual: 2,
        },
    );
}

#[test]
fn invalid_fat32_fields() {
    let mut raw = fat32_bpb();
    raw.set_root_clus(1);
    assert_eq!(
        BiosParameterBlock::new(raw.into_block()).unwrap_err(),
        BpbError::Fat32(Fat32BpbError::RootClusterOutOfRange(1))
    );

    let mut raw = fat32_bpb();
    raw.set_fs_ver(1);
    assert_eq!(
        BiosParameterBlock::new(raw.into_block()).unwrap_err(),
        BpbError::Fat32(Fat32BpbError::FsVerNotZero)
    );

    let mut raw = fat32_bpb();
    raw.set_bk_boot_sec(3);
    assert_eq!(
        BiosParameterBlock::new(raw.into_block()).unwrap_err(),
        BpbError::Fat32(Fat32BpbError::InvalidBackupBootSector(3))
    );
}

#[test]
fn entry_values() {
    assert_eq!(Entry::from_raw(FatType::Fat12, 0xFF7), Entry::Bad);
    assert_eq!(Entry::from_raw(FatType::Fat12, 0xFF8), Entry::EndOfChain);
    assert_eq!(Entry::from_raw(FatType::Fat16, 0xFF8), Entry::Next(Cluster(0xFF8)));
    assert_eq!(Entry::from_raw(FatType::Fat16, 0xFFFE), Entry::EndOfChain);
    assert_eq!(Entry::from_raw(FatType::Fat32, 0x0FFF_FFF7), Entry::Bad);
    assert_eq!(Entry::from_raw(FatType::Fat32, 1), Entry::Reserved);
    assert_eq!(Entry::from_raw(FatType::Fat32, 0), Entry::Free);
    assert_eq!(Entry::EndOfChain.to_raw(FatType::Fat12), 0xFFF);
    assert_eq!(Entry::EndOfChain.to_raw(FatType::Fat16), 0xFFFF);
    assert_eq!(Entry::EndOfChain.to_raw(FatType::Fat32), 0x0FFF_FFFF);
    assert_eq!(Entry::Next(Cluster(77)).to_raw(FatType::Fat16), 77);
}

#[test]
fn fat12_entry_across_sectors() {
    let mut memory = std::vec![0u8; 2880 * 512];
    let mut bd = MemoryBlockDevice::new(&mut memory);
    format(&mut bd, fat12_bpb());

    // Cluster 341's slot starts at byte 511 of the first FAT sector.
    let mut volume = FatVolume::mount(&mut bd, Clock).unwrap();
    volume.set_fat_entry(Cluster(340), Entry::Next(Cluster(341))).unwrap();
    volume.set_fat_entry(Cluster(341), Entry::Next(Cluster(0xABC))).unwrap();
    volume.set_fat_entry(Cluster(342), Entry::EndOfChain).unwrap();
    assert_eq!(volume.fat_entry(Cluster(340)).unwrap(), Entry::Next(Cluster(341)));
    assert_eq!(volume.fat_entry(Cluster(341)).unwrap(), Entry::Next(Cluster(0xABC)));
    assert_eq!(volume.fat_entry(Cluster(342)).unwrap(), Entry::EndOfChain);
    volume.unmount().unwrap();

    // 0x155 and 0xABC pack as 55 C1 AB, then 0xFFF.
    for fat_start in [1usize, 10] {
        let first = (fat_start + 1) * 512;
        assert_eq!(&memory[first - 2..first], &[0x55, 0xC1]);
        assert_eq!(&memory[first..first + 2], &[0xAB, 0xFF]);
        assert_eq!(memory[first + 2] & 0x0F, 0x0F);
    }
}

#[test]
fn fat32_keeps_reserved_bits() {
    let mut memory = std::vec![0u8; 68000 * 512];
    let mut bd = MemoryBlockDevice::new(&mut memory);
    format(&mut bd, fat32_bpb());
    let mut block = bd.read_block(BlockIdx(32)).unwrap();
    block[20..24].copy_from_slice(&[0x00, 0x00, 0x00, 0xF0]);
    bd.write_block(BlockIdx(32), &block).unwrap();

    let mut volume = FatVolume::mount(&mut bd, Clock).unwrap();
    assert_eq!(volume.fat_entry(Cluster(5)).unwrap(), Entry::Free);
    volume.set_fat_entry(Cluster(5), Entry::Next(Cluster(0x1234))).unwrap();
    volume.unmount().unwrap();

    let offset = 32 * 512 + 20;
    assert_eq!(&memory[offset..offset + 4], &[0x34, 0x12, 0x00, 0xF0]);
}

#[test]
fn chain_loop_is_corruption() {
    let mut memory = std::vec![0u8; 2880 * 512];
    let mut bd = MemoryBlockDevice::new(&mut memory);
    format(&mut bd, fat12_bpb());

    let mut volume = FatVolume::mount(&mut bd, Clock).unwrap();
    volume.set_fat_entry(Cluster(2), Entry::Next(Cluster(3))).unwrap();
    volume.set_fat_entry(Cluster(3), Entry::Next(Cluster(2))).unwrap();
    volume.set_fat_entry(Cluster(4), Entry::Free).unwrap();
    assert_eq!(
        volume.last_cluster(Cluster(2)).unwrap_err().kind(),
        crate::ErrorKind::CorruptFilesystem
    );
    assert!(matches!(
        volume.next_cluster(Cluster(4)),
        Err(super::FatError::CorruptFilesystem(
            super::Corruption::BrokenChain { .. }
        ))
    ));
}

#[test]
fn allocation_scans_from_hint_and_wraps() {
    let mut memory = std::vec![0u8; 2880 * 512];
    let mut bd = MemoryBlockDevice::new(&mut memory);
    format(&mut bd, fat12_bpb());

    let mut volume = FatVolume::mount(&mut bd, Clock).unwrap();
    let first = volume.find_free_cluster().unwrap();
    assert_eq!(first, Cluster(2));
    volume.link_cluster(None, first).unwrap();
    let second = volume.find_free_cluster().unwrap();
    assert_eq!(second, Cluster(3));
    volume.link_cluster(Some(first), second).unwrap();
    assert_eq!(volume.next_cluster(first).unwrap(), Some(second));
    assert_eq!(volume.next_cluster(second).unwrap(), None);

    // Past the end of the volume the search starts again at cluster 2.
    volume.next_free = volume.bpb.maximum_valid_cluster();
    volume
        .set_fat_entry(Cluster(volume.next_free), Entry::Bad)
        .unwrap();
    assert_eq!(volume.find_free_cluster().unwrap(), Cluster(4));

    volume.free_chain(first).unwrap();
    assert_eq!(volume.next_free, 2);
    assert_eq!(volume.find_free_cluster().unwrap(), Cluster(2));
}

use crate::{
    mbr::{
        Mbr, MbrError, Partition, PartitionBlockDevice, PartitionError, PartitionNumber,
        PartitionType,
    },
    Block, BlockCount, BlockDevice, BlockIdx, MemoryBlockDevice,
};

use hex_literal::hex;

// The partition table of a 512 MB card: a FAT16 LBA partition at 2048 and a
// FAT32 LBA partition after it, neither active.
const TWO_PARTITIONS: [u8; 64] = hex!(
    "00 20 21 00 0E 5A 1F 10 00 08 00 00 00 00 04 00 00 5A 20 10 0C 9B 3F 30 00 08 04 00 00 F8 0B 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00"
);

fn table_block(entries: &[u8; 64]) -> Block {
    let mut block = Block::new();
    block[446..510].copy_from_slice(entries);
    block[510] = 0x55;
    block[511] = 0xAA;
    block
}

#[test]
fn parse_partition_table() {
    let mbr = Mbr::parse(&table_block(&TWO_PARTITIONS)).unwrap();
    assert_eq!(
        mbr.partition(PartitionNumber::One),
        &Partition {
            active: false,
            ty: PartitionType::Fat16Lba,
            lba_start: BlockCount(2048),
            block_count: BlockCount(262144),
        }
    );
    assert_eq!(
        mbr.partition(PartitionNumber::Two),
        &Partition {
            active: false,
            ty: PartitionType::Fat32Lba,
            lba_start: BlockCount(264192),
            block_count: BlockCount(784384),
        }
    );
    assert_eq!(mbr.partition(PartitionNumber::Three).ty, PartitionType::Empty);
    assert_eq!(mbr.partition(PartitionNumber::Four).ty, PartitionType::Empty);

    // With nothing active, the first FAT partition wins.
    let (number, partition) = mbr.fat_partition().unwrap();
    assert_eq!(number, PartitionNumber::One);
    assert_eq!(partition.end(), 2048 + 262144);

    // CHS fields are dropped, everything else survives.
    assert_eq!(Mbr::parse(&mbr.to_block()).unwrap(), mbr);
}

#[test]
fn active_partition_preferred() {
    let mut entries = TWO_PARTITIONS;
    entries[16] = 0x80;
    let mbr = Mbr::parse(&table_block(&entries)).unwrap();
    let (number, partition) = mbr.fat_partition().unwrap();
    assert_eq!(number, PartitionNumber::Two);
    assert!(partition.active);
}

#[test]
fn unusable_partition_tables() {
    let mut block = table_block(&TWO_PARTITIONS);
    block[511] = 0x00;
    assert_eq!(Mbr::parse(&block), Err(MbrError::InvalidMbrSignature));

    let mut entries = TWO_PARTITIONS;
    entries[0] = 0x7F;
    assert_eq!(
        Mbr::parse(&table_block(&entries)),
        Err(MbrError::InvalidPartitionStatus(0x7F))
    );

    // A Linux partition only.
    let mut entries = [0u8; 64];
    entries[4] = 0x83;
    entries[12] = 0x10;
    let mbr = Mbr::parse(&table_block(&entries)).unwrap();
    assert_eq!(mbr.fat_partition(), Err(MbrError::NoFatPartition));
}

#[test]
fn partition_numbers() {
    assert_eq!(PartitionNumber::from_number(1), Some(PartitionNumber::One));
    assert_eq!(PartitionNumber::from_number(4), Some(PartitionNumber::Four));
    assert_eq!(PartitionNumber::from_number(0), None);
    assert_eq!(PartitionNumber::from_number(5), None);
    assert_eq!(PartitionType::from_u8(0x0B), PartitionType::Fat32ChsLba);
    assert_eq!(PartitionType::from_u8(0x83), PartitionType::Unknown(0x83));
    assert!(!PartitionType::Unknown(0x83).is_fat());
    assert!(PartitionType::Fat12.is_fat());
}

#[test]
fn partition_device_is_offset_and_bounded() {
    let mut memory = vec![0u8; 16 * 512];
    let bd = MemoryBlockDevice::new(&mut memory);
    let partition = Partition {
        active: true,
        ty: PartitionType::Fat16,
        lba_start: BlockCount(4),
        block_count: BlockCount(8),
    };
    let mut part = PartitionBlockDevice::new(bd, partition);
    assert_eq!(part.num_blocks().unwrap(), BlockCount(8));

    let mut block = Block::new();
    block[0] = 0xA5;
    part.write_block(BlockIdx(1), &block).unwrap();
    assert_eq!(part.read_block(BlockIdx(1)).unwrap(), block);

    assert_eq!(
        part.write_block(BlockIdx(8), &block),
        Err(PartitionError::OutOfRange {
            partition_block_count: BlockCount(8)
        })
    );
    let mut two = [Block::new(), Block::new()];
    assert!(part.read(&mut two, BlockIdx(7), "test").is_err());

    drop(part);
    assert_eq!(memory[5 * 512], 0xA5);
}

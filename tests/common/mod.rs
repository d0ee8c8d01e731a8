//! Test helpers shared by the integration tests: an image formatter, a RAM
//! disk that can be told to fail, a clock, and a simulated SD card.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::rc::Rc;

use embedded_hal::{blocking::spi::Transfer, digital::v2::OutputPin};
use embedded_sdfat::{
    fat::{
        bios_param_block::{BiosParameterBlock, BiosParameterBlockRaw},
        FsInfo,
    },
    mbr::{Mbr, Partition, PartitionType},
    sdmmc_proto::{self, crc16},
    Block, BlockCount, BlockDevice, BlockIdx, TimeSource, Timestamp,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ****************************************************************************
//
// Disk images
//
// ****************************************************************************

/// Geometry of a freshly formatted volume.
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    pub total_sectors: u32,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub fat_size: u32,
    pub root_entries: u16,
    pub media: u8,
    pub fat32: bool,
}

impl Layout {
    /// A 1.44 MB floppy.
    pub fn fat12() -> Layout {
        Layout {
            total_sectors: 2880,
            sectors_per_cluster: 1,
            reserved_sectors: 1,
            fat_size: 9,
            root_entries: 224,
            media: 0xF0,
            fat32: false,
        }
    }

    /// Sixty data clusters, for running out of space.
    pub fn tiny() -> Layout {
        Layout {
            total_sectors: 64,
            sectors_per_cluster: 1,
            reserved_sectors: 1,
            fat_size: 1,
            root_entries: 16,
            media: 0xF8,
            fat32: false,
        }
    }

    /// 4 MiB, 8095 clusters of one sector.
    pub fn fat16() -> Layout {
        Layout {
            total_sectors: 8192,
            sectors_per_cluster: 1,
            reserved_sectors: 1,
            fat_size: 32,
            root_entries: 512,
            media: 0xF8,
            fat32: false,
        }
    }

    /// 16 MiB in clusters of four sectors.
    pub fn fat16_large_clusters() -> Layout {
        Layout {
            total_sectors: 32768,
            sectors_per_cluster: 4,
            ..Layout::fat16()
        }
    }

    /// The smallest FAT32 volume with one-sector clusters.
    pub fn fat32() -> Layout {
        Layout {
            total_sectors: 68000,
            sectors_per_cluster: 1,
            reserved_sectors: 32,
            fat_size: 532,
            root_entries: 0,
            media: 0xF8,
            fat32: true,
        }
    }

    fn boot_sector(&self, hidden_sectors: u32) -> Block {
        let mut raw = BiosParameterBlockRaw::new();
        raw.set_bytes_per_sec(512);
        raw.set_sec_per_clu(self.sectors_per_cluster);
        raw.set_rsvd_sec_cnt(self.reserved_sectors);
        raw.set_num_fats(2);
        raw.set_root_entr_cnt(self.root_entries);
        raw.set_media(self.media);
        raw.set_hidden_sectors(hidden_sectors);
        if self.fat32 {
            raw.set_tot_sec_32(self.total_sectors);
            raw.set_fat_sz_32(self.fat_size);
            raw.set_root_clus(2);
            raw.set_fs_info(1);
            raw.set_bk_boot_sec(6);
        } else if self.total_sectors < 0x10000 {
            raw.set_tot_sec_16(self.total_sectors as u16);
            raw.set_fat_sz_16(self.fat_size as u16);
        } else {
            raw.set_tot_sec_32(self.total_sectors);
            raw.set_fat_sz_16(self.fat_size as u16);
        }
        raw.into_block()
    }

    /// Format an image, optionally behind a partition table with the
    /// volume starting at block 64.
    pub fn format(&self, with_mbr: bool) -> Vec<u8> {
        let base = if with_mbr { 64 } else { 0 };
        let mut image = vec![0u8; (base + self.total_sectors) as usize * Block::LEN];

        let boot = self.boot_sector(base);
        let bpb = BiosParameterBlock::new(boot.clone()).expect("test layout is valid");
        put_block(&mut image, base, &boot);

        let mut fat = Block::new();
        let eoc: &[u8] = match (self.fat32, bpb.cluster_count() < 4085) {
            // Cluster 2 is the root directory.
            (true, _) => &[
                0xFF, 0xFF, 0xFF, 0x0F, 0xFF, 0xFF, 0xFF, 0x0F, 0xFF, 0xFF, 0xFF, 0x0F,
            ],
            (false, true) => &[0xFF, 0xFF, 0xFF],
            (false, false) => &[0xFF, 0xFF, 0xFF, 0xFF],
        };
        fat[..eoc.len()].copy_from_slice(eoc);
        fat[0] = self.media;
        for copy in 0..2 {
            let sector = base + u32::from(self.reserved_sectors) + copy * self.fat_size;
            put_block(&mut image, sector, &fat);
        }

        if self.fat32 {
            let mut info = Block::new();
            FsInfo {
                free_count: Some(bpb.cluster_count() - 1),
                next_free: Some(3),
            }
            .update(&mut info);
            put_block(&mut image, base + 1, &info);
            put_block(&mut image, base + 6, &boot);
        }

        if with_mbr {
            let ty = match (self.fat32, bpb.cluster_count() < 4085) {
                (true, _) => PartitionType::Fat32Lba,
                (false, true) => PartitionType::Fat12,
                (false, false) => PartitionType::Fat16,
            };
            let empty = Partition {
                active: false,
                ty: PartitionType::Empty,
                lba_start: BlockCount(0),
                block_count: BlockCount(0),
            };
            let volume = Partition {
                active: true,
                ty,
                lba_start: BlockCount(base),
                block_count: BlockCount(self.total_sectors),
            };
            put_block(&mut image, 0, &Mbr::new([volume, empty, empty, empty]).to_block());
        }
        image
    }
}

pub fn put_block(image: &mut [u8], idx: u32, block: &Block) {
    let start = idx as usize * Block::LEN;
    image[start..start + Block::LEN].copy_from_slice(&block.contents);
}

pub fn get_block(image: &[u8], idx: u32) -> &[u8] {
    let start = idx as usize * Block::LEN;
    &image[start..start + Block::LEN]
}

/// Bytes that are easy to tell apart at any offset.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(u32::from(seed)) as u8)
        .collect()
}

// ****************************************************************************
//
// RAM disk
//
// ****************************************************************************

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RamError {
    OutOfRange,
    WriteFailed,
}

/// A block device in a `Vec`, which refuses writes while `fail_writes` is set.
#[derive(Debug)]
pub struct RamDisk {
    pub data: Vec<u8>,
    pub fail_writes: bool,
    pub writes: usize,
}

impl RamDisk {
    pub fn new(data: Vec<u8>) -> RamDisk {
        RamDisk {
            data,
            fail_writes: false,
            writes: 0,
        }
    }

    fn range(&self, idx: u32) -> Result<std::ops::Range<usize>, RamError> {
        let start = idx as usize * Block::LEN;
        if start + Block::LEN > self.data.len() {
            Err(RamError::OutOfRange)
        } else {
            Ok(start..start + Block::LEN)
        }
    }
}

impl BlockDevice for RamDisk {
    type Error = RamError;

    fn read(
        &mut self,
        blocks: &mut [Block],
        start_block_idx: BlockIdx,
        _reason: &str,
    ) -> Result<(), Self::Error> {
        for (i, block) in blocks.iter_mut().enumerate() {
            let range = self.range(start_block_idx.0 + i as u32)?;
            block.contents.copy_from_slice(&self.data[range]);
        }
        Ok(())
    }

    fn write(&mut self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        if self.fail_writes {
            return Err(RamError::WriteFailed);
        }
        for (i, block) in blocks.iter().enumerate() {
            let range = self.range(start_block_idx.0 + i as u32)?;
            self.data[range].copy_from_slice(&block.contents);
            self.writes += 1;
        }
        Ok(())
    }

    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error> {
        Ok(BlockCount((self.data.len() / Block::LEN) as u32))
    }
}

// ****************************************************************************
//
// Clock
//
// ****************************************************************************

#[derive(Debug, Clone, Copy)]
pub struct Clock(pub Timestamp);

impl Clock {
    pub fn at(year: u16, month: u8, day: u8, hours: u8, minutes: u8, seconds: u8) -> Clock {
        Clock(Timestamp::from_calendar(year, month, day, hours, minutes, seconds).unwrap())
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock::at(2024, 5, 1, 12, 30, 44)
    }
}

impl TimeSource for Clock {
    fn get_timestamp(&self) -> Timestamp {
        self.0
    }
}

// ****************************************************************************
//
// Simulated SD card
//
// ****************************************************************************

/// What the card is doing with the bytes it receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Command,
    /// Waiting for a data block (or a stop token) to write at this block
    ReceiveWrite { block: u32, multi: bool },
    /// Streaming blocks out until CMD12
    ReadMulti { next: u32 },
}

/// Everything the simulated card knows, shared between its SPI bus and its
/// chip select pin.
#[derive(Debug)]
pub struct CardState {
    pub storage: Vec<u8>,
    /// SDHC (block addressed) rather than SDSC
    pub sdhc: bool,
    /// A version 1 card, which does not know CMD8
    pub v1: bool,
    /// Never answer anything
    pub silent: bool,
    /// The CMD8 check pattern to echo
    pub check_pattern: u8,
    pub refuse_crc: bool,
    /// How many times ACMD41 reports "still idle"
    pub acmd41_busy_polls: u32,
    /// Data response token for writes, 0x05 is accepted
    pub write_response: u8,
    pub corrupt_read_crc: bool,
    pub transport_fault: bool,
    pub baudrate: u32,
    /// Every command received: (index, argument)
    pub commands: Vec<(u8, u32)>,
    pub cs_low: bool,
    crc_enabled: bool,
    app_command: bool,
    ready: bool,
    phase: Phase,
    frame: Vec<u8>,
    incoming: Vec<u8>,
    out: VecDeque<u8>,
}

impl CardState {
    fn block_of(&self, arg: u32) -> u32 {
        if self.sdhc {
            arg
        } else {
            arg / Block::LEN as u32
        }
    }

    fn block_range(&self, block: u32) -> std::ops::Range<usize> {
        let start = block as usize * Block::LEN;
        start..start + Block::LEN
    }

    fn queue_data(&mut self, data: &[u8]) {
        let mut crc = crc16(data);
        if self.corrupt_read_crc {
            crc ^= 0x0101;
        }
        self.out.push_back(0xFF);
        self.out.push_back(sdmmc_proto::DATA_START_BLOCK);
        self.out.extend(data.iter().copied());
        self.out.push_back((crc >> 8) as u8);
        self.out.push_back(crc as u8);
    }

    fn r1(&mut self, r1: u8) {
        self.out.push_back(0xFF);
        self.out.push_back(r1);
    }

    fn idle_bit(&self) -> u8 {
        if self.ready {
            sdmmc_proto::R1_READY_STATE
        } else {
            sdmmc_proto::R1_IDLE_STATE
        }
    }

    fn csd(&self) -> [u8; 16] {
        let blocks = (self.storage.len() / Block::LEN) as u32;
        let mut csd = [0u8; 16];
        if self.sdhc {
            let c_size = blocks / 1024 - 1;
            csd[0] = 0x40;
            csd[5] = 0x59;
            csd[7] = ((c_size >> 16) & 0x3F) as u8;
            csd[8] = (c_size >> 8) as u8;
            csd[9] = c_size as u8;
        } else {
            // READ_BL_LEN 9 and C_SIZE_MULT 7: C_SIZE counts units of 512 blocks.
            let c_size = blocks / 512 - 1;
            csd[5] = 0x59;
            csd[6] = ((c_size >> 10) & 0x03) as u8;
            csd[7] = (c_size >> 2) as u8;
            csd[8] = ((c_size & 0x03) << 6) as u8;
            csd[9] = 0x03;
            csd[10] = 0x80 | 0x40;
        }
        csd
    }

    fn command(&mut self, index: u8, arg: u32) {
        self.commands.push((index, arg));
        let app = std::mem::replace(&mut self.app_command, false);
        match (app, index) {
            (_, sdmmc_proto::CMD0) => {
                self.ready = false;
                self.crc_enabled = false;
                self.r1(sdmmc_proto::R1_IDLE_STATE);
            }
            (_, sdmmc_proto::CMD59) => {
                if self.refuse_crc {
                    self.r1(sdmmc_proto::R1_ILLEGAL_COMMAND | sdmmc_proto::R1_IDLE_STATE);
                } else {
                    self.crc_enabled = arg & 1 == 1;
                    self.r1(self.idle_bit());
                }
            }
            (_, sdmmc_proto::CMD8) => {
                if self.v1 {
                    self.r1(sdmmc_proto::R1_ILLEGAL_COMMAND | sdmmc_proto::R1_IDLE_STATE);
                } else {
                    self.r1(sdmmc_proto::R1_IDLE_STATE);
                    let pattern = self.check_pattern;
                    self.out.extend([0x00, 0x00, (arg >> 8) as u8 & 0x0F, pattern]);
                }
            }
            (_, sdmmc_proto::CMD55) => {
                self.app_command = true;
                self.r1(self.idle_bit());
            }
            (true, sdmmc_proto::ACMD41) => {
                if self.acmd41_busy_polls > 0 {
                    self.acmd41_busy_polls -= 1;
                } else {
                    self.ready = true;
                }
                self.r1(self.idle_bit());
            }
            (_, sdmmc_proto::CMD58) => {
                self.r1(sdmmc_proto::R1_READY_STATE);
                let ccs = if self.sdhc { sdmmc_proto::OCR_CCS } else { 0 };
                let ocr = sdmmc_proto::OCR_POWER_UP | ccs;
                self.out.extend([ocr, 0xFF, 0x80, 0x00]);
            }
            (_, sdmmc_proto::CMD9) => {
                self.r1(sdmmc_proto::R1_READY_STATE);
                let csd = self.csd();
                self.queue_data(&csd);
            }
            (_, sdmmc_proto::CMD13) => {
                self.r1(sdmmc_proto::R1_READY_STATE);
                self.out.push_back(0x00);
            }
            (_, sdmmc_proto::CMD17) => {
                let block = self.block_of(arg);
                self.r1(sdmmc_proto::R1_READY_STATE);
                let data = self.storage[self.block_range(block)].to_vec();
                self.queue_data(&data);
            }
            (_, sdmmc_proto::CMD18) => {
                self.r1(sdmmc_proto::R1_READY_STATE);
                self.phase = Phase::ReadMulti {
                    next: self.block_of(arg),
                };
            }
            (_, sdmmc_proto::CMD12) => {
                self.out.clear();
                self.phase = Phase::Command;
                // Stuff byte, then R1.
                self.out.extend([0xFF, sdmmc_proto::R1_READY_STATE]);
            }
            (_, sdmmc_proto::CMD24) | (_, sdmmc_proto::CMD25) => {
                self.r1(sdmmc_proto::R1_READY_STATE);
                self.phase = Phase::ReceiveWrite {
                    block: self.block_of(arg),
                    multi: index == sdmmc_proto::CMD25,
                };
            }
            _ => self.r1(sdmmc_proto::R1_ILLEGAL_COMMAND | self.idle_bit()),
        }
    }

    fn receive_frame_byte(&mut self, byte: u8) {
        if self.frame.is_empty() && byte & 0xC0 != 0x40 {
            return;
        }
        self.frame.push(byte);
        if self.frame.len() == 6 {
            let f = std::mem::take(&mut self.frame);
            let arg = u32::from_be_bytes([f[1], f[2], f[3], f[4]]);
            self.command(f[0] & 0x3F, arg);
        }
    }

    fn receive_write_byte(&mut self, byte: u8, block: u32, multi: bool) {
        if self.incoming.is_empty() {
            match byte {
                sdmmc_proto::DATA_START_BLOCK | sdmmc_proto::WRITE_MULTIPLE_TOKEN => {
                    self.incoming.push(byte);
                }
                sdmmc_proto::STOP_TRAN_TOKEN if multi => {
                    self.phase = Phase::Command;
                    self.out.extend([0x00, 0x00]);
                }
                _ => {}
            }
            return;
        }
        self.incoming.push(byte);
        if self.incoming.len() < 1 + Block::LEN + 2 {
            return;
        }
        let incoming = std::mem::take(&mut self.incoming);
        let data = &incoming[1..=Block::LEN];
        let crc = u16::from_be_bytes([incoming[Block::LEN + 1], incoming[Block::LEN + 2]]);
        let response = if self.crc_enabled && crc != crc16(data) {
            0x0B
        } else {
            self.write_response
        };
        if response == sdmmc_proto::DATA_RES_ACCEPTED {
            let range = self.block_range(block);
            self.storage[range].copy_from_slice(data);
        }
        // Data response, then a little busy time.
        self.out.extend([response, 0x00, 0x00, 0x00]);
        self.phase = if multi {
            Phase::ReceiveWrite {
                block: block + 1,
                multi,
            }
        } else {
            Phase::Command
        };
    }

    fn exchange(&mut self, mosi: u8) -> u8 {
        if !self.cs_low || self.silent {
            return 0xFF;
        }
        if self.out.is_empty() {
            // A real card streams until CMD12 arrives.
            match self.phase {
                Phase::ReadMulti { next } if self.block_range(next).end <= self.storage.len() => {
                    let data = self.storage[self.block_range(next)].to_vec();
                    self.queue_data(&data);
                    self.phase = Phase::ReadMulti { next: next + 1 };
                }
                _ => {}
            }
        }
        let miso = self.out.pop_front().unwrap_or(0xFF);
        match self.phase {
            Phase::Command | Phase::ReadMulti { .. } => self.receive_frame_byte(mosi),
            Phase::ReceiveWrite { block, multi } => self.receive_write_byte(mosi, block, multi),
        }
        miso
    }
}

/// A simulated card. Clone the handle to poke at the card while the driver
/// owns the bus.
#[derive(Debug, Clone)]
pub struct FakeCard(pub Rc<RefCell<CardState>>);

impl FakeCard {
    pub fn new(storage: Vec<u8>, sdhc: bool) -> FakeCard {
        FakeCard(Rc::new(RefCell::new(CardState {
            storage,
            sdhc,
            v1: false,
            silent: false,
            check_pattern: sdmmc_proto::CMD8_CHECK_PATTERN,
            refuse_crc: false,
            acmd41_busy_polls: 3,
            write_response: sdmmc_proto::DATA_RES_ACCEPTED,
            corrupt_read_crc: false,
            transport_fault: false,
            baudrate: 400_000,
            commands: Vec::new(),
            cs_low: false,
            crc_enabled: false,
            app_command: false,
            ready: false,
            phase: Phase::Command,
            frame: Vec::new(),
            incoming: Vec::new(),
            out: VecDeque::new(),
        })))
    }

    pub fn bus(&self) -> (FakeSpi, FakeCs) {
        (FakeSpi(self.0.clone()), FakeCs(self.0.clone()))
    }

    pub fn state(&self) -> std::cell::RefMut<'_, CardState> {
        self.0.borrow_mut()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiFault;

#[derive(Debug)]
pub struct FakeSpi(Rc<RefCell<CardState>>);

impl FakeSpi {
    pub fn set_baudrate(&mut self, hz: u32) {
        self.0.borrow_mut().baudrate = hz;
    }
}

impl Transfer<u8> for FakeSpi {
    type Error = SpiFault;

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], Self::Error> {
        let mut card = self.0.borrow_mut();
        if card.transport_fault {
            return Err(SpiFault);
        }
        for word in words.iter_mut() {
            *word = card.exchange(*word);
        }
        Ok(words)
    }
}

#[derive(Debug)]
pub struct FakeCs(Rc<RefCell<CardState>>);

impl OutputPin for FakeCs {
    type Error = Infallible;

    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.0.borrow_mut().cs_low = true;
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.0.borrow_mut().cs_low = false;
        Ok(())
    }
}

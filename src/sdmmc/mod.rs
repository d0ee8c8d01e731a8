//! embedded-sdfat - SDMMC Protocol
//!
//! Implements the SD/MMC protocol on some generic SPI interface.
//!
//! This is currently optimised for readability and debugability, not
//! performance.
//!
//! Start the SPI bus in mode 0, MSB first, 8-bit words, at no more than
//! 400 kHz. Once [`SdMmcSpi::acquire`] has succeeded, the clock can be raised
//! through [`SdMmcSpi::spi`].

mod busy;
use busy::SdMmcSpiBusy;

use crate::sdmmc_proto::*;
use crate::{Block, BlockCount, BlockDevice, BlockIdx, ErrorKind};

use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;

const DEFAULT_DELAY_COUNT: u32 = 32_000;
const DEFAULT_CMD0_ATTEMPTS: u32 = 32;

/// Represents an SD Card interface, either not yet initialised (`NotInit`)
/// or ready for block I/O (`Initialized`).
/// Built from an SPI peripheral and a Chip
/// Select pin. We need Chip Select to be separate so we can clock out some
/// bytes without Chip Select asserted (which puts the card into SPI mode).
pub struct SdMmcSpi<SPI, CS, State>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    card_type: CardType,
    spi: SPI,
    cs: CS,
    delay_count: u32,
    check_crc: bool,
    #[allow(dead_code)]
    state: State,
}

impl<SPI, CS, State> core::fmt::Debug for SdMmcSpi<SPI, CS, State>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    State: core::fmt::Debug,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SdMmcSpi")
            .field("card_type", &self.card_type)
            .field("check_crc", &self.check_crc)
            .field("state", &self.state)
            .finish()
    }
}

/// The possible errors `SdMmcSpi` can generate.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// We got an error from the SPI peripheral
    Transport,
    /// Couldn't set a GPIO pin
    GpioError,
    /// The card never answered CMD0
    CardNotFound,
    /// We failed to enable CRC checking on the SD card
    CantEnableCRC,
    /// We didn't get a response when reading data from the card
    TimeoutReadBuffer,
    /// We didn't get a response when waiting for the card to not be busy
    TimeoutWaitNotBusy,
    /// We didn't get a response when executing this command
    TimeoutCommand(u8),
    /// We didn't get a response when executing this application-specific command
    TimeoutACommand(u8),
    /// The card answered a command with an R1 the protocol does not allow here
    UnexpectedResponse {
        /// The command we sent
        command: u8,
        /// The R1 byte we got back
        response: u8,
    },
    /// The card does not accept our 2.7-3.6V supply
    VoltageNotSupported,
    /// The card did not echo the CMD8 check pattern
    BadCheckPattern(u8),
    /// We got a bad response from Command 58
    Cmd58Error,
    /// We failed to read the Card Specific Data register
    RegisterReadError,
    /// We got a CRC mismatch (card gave us, we calculated)
    CrcError(u16, u16),
    /// Error reading from the card
    ReadError,
    /// Error writing to the card
    WriteError,
    /// The card rejected a data block with this data response token
    WriteRejected(u8),
    /// The block lies beyond what a byte-addressed card can address
    AddressOutOfRange(BlockIdx),
}

impl Error {
    /// Which class of failure this is.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transport | Error::GpioError => ErrorKind::Transport,
            Error::CardNotFound | Error::TimeoutCommand(_) | Error::TimeoutACommand(_) => {
                ErrorKind::Timeout
            }
            Error::UnexpectedResponse { .. }
            | Error::CantEnableCRC
            | Error::VoltageNotSupported
            | Error::BadCheckPattern(_)
            | Error::Cmd58Error
            | Error::RegisterReadError => ErrorKind::Protocol,
            Error::TimeoutReadBuffer
            | Error::TimeoutWaitNotBusy
            | Error::CrcError(..)
            | Error::ReadError
            | Error::WriteError
            | Error::WriteRejected(_) => ErrorKind::Io,
            Error::AddressOutOfRange(_) => ErrorKind::InvalidInput,
        }
    }
}

/// The state of an SdMmcSpi if it is not initialized
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug)]
pub struct NotInit;

/// The state of an SdMmcSpi if it is initialized
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug)]
pub struct Initialized;

/// The different types of card we support.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CardType {
    /// Version 1 standard capacity card
    SD1,
    /// Version 2 standard capacity card
    SD2,
    /// High (or extended) capacity card
    SDHC,
}

/// How the card expects block numbers on the wire.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Addressing {
    /// Arguments are byte offsets (SDSC)
    Byte,
    /// Arguments are block numbers (SDHC/SDXC)
    Block,
}

impl CardType {
    /// How this type of card is addressed.
    pub fn addressing(self) -> Addressing {
        match self {
            CardType::SD1 | CardType::SD2 => Addressing::Byte,
            CardType::SDHC => Addressing::Block,
        }
    }
}

/// A terrible hack for busy-waiting the CPU while we wait for the card to
/// sort itself out.
struct Delay(u32);

impl Delay {
    fn new(count: u32) -> Delay {
        Delay(count)
    }

    fn delay(&mut self, err: Error) -> Result<(), Error> {
        if self.0 == 0 {
            Err(err)
        } else {
            for _ in 0..100 {
                core::hint::spin_loop();
            }
            self.0 -= 1;
            Ok(())
        }
    }
}

/// Options for acquiring the card.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone)]
pub struct AcquireOpts {
    /// Some cards don't support CRC mode. At least a 512MiB Transcend one.
    pub require_crc: bool,
    /// How many times CMD0 may go unanswered before we give up
    pub cmd0_attempts: u32,
    /// How many times ACMD41 may report "still idle" before we give up
    pub acmd41_attempts: u32,
    /// Polls allowed while waiting for a data token or for busy to clear
    pub delay_count: u32,
}

impl Default for AcquireOpts {
    fn default() -> Self {
        AcquireOpts {
            require_crc: true,
            cmd0_attempts: DEFAULT_CMD0_ATTEMPTS,
            acmd41_attempts: DEFAULT_DELAY_COUNT,
            delay_count: DEFAULT_DELAY_COUNT,
        }
    }
}

impl<SPI, CS, State> SdMmcSpi<SPI, CS, State>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    /// Get temporary access to the underlying SPI peripheral, e.g. to change
    /// the clock rate once the card is initialised.
    pub fn spi<T, F>(&mut self, func: F) -> T
    where
        F: FnOnce(&mut SPI) -> T,
    {
        func(&mut self.spi)
    }

    /// Give back the SPI peripheral and the chip select pin.
    pub fn free(self) -> (SPI, CS) {
        (self.spi, self.cs)
    }
}

impl<SPI, CS> SdMmcSpi<SPI, CS, NotInit>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    /// Create a new SD/MMC controller using a raw SPI interface.
    pub fn new(spi: SPI, cs: CS) -> Self {
        SdMmcSpi {
            card_type: CardType::SD1,
            spi,
            cs,
            delay_count: DEFAULT_DELAY_COUNT,
            check_crc: true,
            state: NotInit,
        }
    }

    /// Initializes the card into a known state
    pub fn acquire(self) -> Result<SdMmcSpi<SPI, CS, Initialized>, (Error, Self)> {
        self.acquire_with_opts(Default::default())
    }

    fn discard_byte(&mut self) -> Result<u8, Error> {
        self.spi
            .transfer(&mut [0xFF])
            .map(|b| b[0])
            .map_err(|_e| Error::Transport)
    }

    /// Initializes the card into a known state
    ///
    /// On failure the card is handed back uninitialised, together with the
    /// reason, so the caller can try again.
    pub fn acquire_with_opts(
        mut self,
        options: AcquireOpts,
    ) -> Result<SdMmcSpi<SPI, CS, Initialized>, (Error, Self)> {
        debug!("acquiring card with opts: {:?}", options);
        let result = self.init_sequence(&options);
        let _ = self.discard_byte();

        match result {
            Ok(()) => {
                debug!("Card ready: {:?}", self.card_type);
                Ok(SdMmcSpi {
                    card_type: self.card_type,
                    spi: self.spi,
                    cs: self.cs,
                    delay_count: options.delay_count,
                    check_crc: self.check_crc,
                    state: Initialized,
                })
            }
            Err(e) => {
                warn!("Card init failed: {:?}", e);
                Err((e, self))
            }
        }
    }

    fn init_sequence(&mut self, options: &AcquireOpts) -> Result<(), Error> {
        trace!("Reset card..");

        // Supply minimum of 74 clock cycles without CS asserted.
        self.cs.set_high().map_err(|_| Error::GpioError)?;
        for _ in 0..10 {
            self.discard_byte()?;
        }

        let mut busy = SdMmcSpiBusy::new(&mut self.spi, &mut self.cs, options.delay_count, true)?;

        // Enter SPI mode. Only silence is retried.
        let mut attempts = options.cmd0_attempts;
        loop {
            if attempts == 0 {
                return Err(Error::CardNotFound);
            }
            trace!("Enter SPI mode, attempts left: {}", attempts);
            match busy.card_command(CMD0, 0) {
                Ok(R1_IDLE_STATE) => break,
                Ok(r) => {
                    return Err(Error::UnexpectedResponse {
                        command: CMD0,
                        response: r,
                    })
                }
                Err(Error::TimeoutCommand(CMD0)) => {
                    warn!("Timed out, trying again..");
                    attempts -= 1;
                }
                Err(e) => return Err(e),
            }
        }

        // Enable CRC
        debug!("Enable CRC: {}", options.require_crc);
        self.check_crc = if busy.card_command(CMD59, 1)? == R1_IDLE_STATE {
            true
        } else if options.require_crc {
            return Err(Error::CantEnableCRC);
        } else {
            warn!("Card refused CRC mode, carrying on without");
            false
        };

        // Check card version
        let mut card_type = match busy.card_command(CMD8, CMD8_ARG)? {
            r if r == (R1_ILLEGAL_COMMAND | R1_IDLE_STATE) => CardType::SD1,
            R1_IDLE_STATE => {
                // R7: command version, reserved, voltage accepted, check pattern
                busy.receive()?;
                busy.receive()?;
                let voltage = busy.receive()? & 0x0F;
                let pattern = busy.receive()?;
                if voltage != CMD8_VOLTAGE_ACCEPTED {
                    return Err(Error::VoltageNotSupported);
                }
                if pattern != CMD8_CHECK_PATTERN {
                    return Err(Error::BadCheckPattern(pattern));
                }
                CardType::SD2
            }
            r => {
                return Err(Error::UnexpectedResponse {
                    command: CMD8,
                    response: r,
                })
            }
        };
        debug!("Card version: {:?}", card_type);

        let arg = match card_type {
            CardType::SD1 => 0,
            CardType::SD2 | CardType::SDHC => ACMD41_HCS,
        };

        let mut delay = Delay::new(options.acmd41_attempts);
        loop {
            match busy.card_acmd(ACMD41, arg)? {
                R1_READY_STATE => break,
                R1_IDLE_STATE => delay.delay(Error::TimeoutACommand(ACMD41))?,
                r => {
                    return Err(Error::UnexpectedResponse {
                        command: ACMD41,
                        response: r,
                    })
                }
            }
        }

        if card_type == CardType::SD2 {
            if busy.card_command(CMD58, 0)? != R1_READY_STATE {
                return Err(Error::Cmd58Error);
            }
            let ocr = busy.receive()?;
            if (ocr & (OCR_POWER_UP | OCR_CCS)) == (OCR_POWER_UP | OCR_CCS) {
                card_type = CardType::SDHC;
            }
            // Discard other three bytes
            busy.receive()?;
            busy.receive()?;
            busy.receive()?;
        }

        self.card_type = card_type;
        Ok(())
    }
}

impl<SPI, CS> SdMmcSpi<SPI, CS, Initialized>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    /// Mark the card as unused.
    /// This should be kept infallible, because Drop is unable to fail.
    /// See https://github.com/rust-lang/rfcs/issues/814
    // If there is any need to flush data, it should be implemented here.
    pub fn deinit(self) -> SdMmcSpi<SPI, CS, NotInit> {
        SdMmcSpi {
            card_type: self.card_type,
            spi: self.spi,
            cs: self.cs,
            delay_count: self.delay_count,
            check_crc: self.check_crc,
            state: NotInit,
        }
    }

    /// What kind of card we found during `acquire`.
    pub fn card_type(&self) -> CardType {
        self.card_type
    }

    /// Whether block numbers go out as byte or block addresses.
    pub fn addressing(&self) -> Addressing {
        self.card_type.addressing()
    }

    /// Run a command with chip select asserted.
    ///
    /// Chip select is always deasserted, even if an error occured in `f`
    fn with_chip_select<F, R>(&mut self, f: F) -> Result<R, Error>
    where
        F: FnOnce(&mut SdMmcSpiBusy<SPI, CS>) -> Result<R, Error>,
    {
        let mut busy =
            SdMmcSpiBusy::new(&mut self.spi, &mut self.cs, self.delay_count, self.check_crc)?;
        f(&mut busy)
    }

    fn wire_address(&self, block_idx: BlockIdx) -> Result<u32, Error> {
        match self.addressing() {
            Addressing::Byte => u32::try_from(block_idx.into_bytes())
                .map_err(|_| Error::AddressOutOfRange(block_idx)),
            Addressing::Block => Ok(block_idx.0),
        }
    }

    /// Read the 'card specific data' block.
    pub fn read_csd(&mut self) -> Result<Csd, Error> {
        self.with_chip_select(|spi| {
            if spi.card_command(CMD9, 0)? != R1_READY_STATE {
                return Err(Error::RegisterReadError);
            }
            let mut data = [0u8; 16];
            spi.read_data(&mut data)?;
            Csd::from_bytes(data).ok_or(Error::RegisterReadError)
        })
    }

    /// Return the usable size of this SD card in bytes.
    pub fn card_size_bytes(&mut self) -> Result<u64, Error> {
        Ok(self.read_csd()?.card_capacity_bytes())
    }

    /// Can this card erase single blocks?
    pub fn erase_single_block_enabled(&mut self) -> Result<bool, Error> {
        Ok(self.read_csd()?.erase_single_block_enabled())
    }
}

impl<SPI, CS> BlockDevice for SdMmcSpi<SPI, CS, Initialized>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    type Error = Error;

    /// Read one or more blocks, starting at the given block index.
    fn read(
        &mut self,
        blocks: &mut [Block],
        start_block_idx: BlockIdx,
        reason: &str,
    ) -> Result<(), Self::Error> {
        trace!("read {} block(s) @ {} for {}", blocks.len(), start_block_idx.0, reason);
        let start_idx = self.wire_address(start_block_idx)?;
        self.with_chip_select(|s| {
            if blocks.len() == 1 {
                // Start a single-block read
                if s.card_command(CMD17, start_idx)? != R1_READY_STATE {
                    return Err(Error::ReadError);
                }
                s.read_data(&mut blocks[0].contents)?;
            } else {
                // Start a multi-block read
                if s.card_command(CMD18, start_idx)? != R1_READY_STATE {
                    return Err(Error::ReadError);
                }
                for block in blocks.iter_mut() {
                    s.read_data(&mut block.contents)?;
                }
                // Stop the read
                s.card_command(CMD12, 0)?;
            }
            Ok(())
        })
    }

    /// Write one or more blocks, starting at the given block index.
    fn write(&mut self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        trace!("write {} block(s) @ {}", blocks.len(), start_block_idx.0);
        let start_idx = self.wire_address(start_block_idx)?;
        self.with_chip_select(|s| {
            if blocks.len() == 1 {
                // Start a single-block write
                if s.card_command(CMD24, start_idx)? != R1_READY_STATE {
                    return Err(Error::WriteError);
                }
                s.write_data(DATA_START_BLOCK, &blocks[0].contents)?;
                s.wait_not_busy()?;
                if s.card_command(CMD13, 0)? != 0x00 {
                    return Err(Error::WriteError);
                }
                if s.receive()? != 0x00 {
                    return Err(Error::WriteError);
                }
            } else {
                // Start a multi-block write
                if s.card_command(CMD25, start_idx)? != R1_READY_STATE {
                    return Err(Error::WriteError);
                }
                for block in blocks.iter() {
                    s.wait_not_busy()?;
                    s.write_data(WRITE_MULTIPLE_TOKEN, &block.contents)?;
                }
                // Stop the write
                s.wait_not_busy()?;
                s.send(STOP_TRAN_TOKEN)?;
                s.wait_not_busy()?;
            }
            Ok(())
        })
    }

    /// Determine how many blocks this device can hold.
    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error> {
        Ok(blocks_in(self.card_size_bytes()?))
    }
}

/// A full-size SDXC card holds 2^32 blocks, one more than `BlockCount` can.
fn blocks_in(num_bytes: u64) -> BlockCount {
    BlockCount(u32::try_from(num_bytes / Block::LEN as u64).unwrap_or(u32::MAX))
}

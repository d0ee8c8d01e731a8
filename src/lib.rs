//! # embedded-sdfat
//!
//! > An SD-over-SPI driver and minimal FAT file layer written in Embedded Rust
//!
//! This crate lets you write and read files on a FAT formatted SD card that is
//! attached to your Rust Embedded device over SPI. It is `#![no_std]` and does
//! not use `alloc`. It is designed for readability and simplicity over
//! performance: every operation is synchronous and blocks until the card is
//! done with it.
//!
//! The layers, leaves first:
//!
//! * [`SdMmcSpi`] talks to the card over an `embedded-hal` SPI bus and a chip
//!   select pin, and implements [`BlockDevice`].
//! * [`fat::FatVolume`] mounts a FAT12/16/32 volume from any [`BlockDevice`].
//! * [`fat::File`] is a sequential read/write session over one file in the
//!   root directory. Metadata is flushed when the session is closed or dropped.
//!
//! ```rust,ignore
//! let sdcard = embedded_sdfat::SdMmcSpi::new(spi, cs);
//! // Initialise at <= 400 kHz, then the bus may go faster.
//! let mut sdcard = sdcard.acquire().map_err(|(e, _)| e)?;
//! sdcard.spi(|spi| spi.set_baudrate(16.MHz()));
//!
//! // Any clock will do, e.g. one backed by an RTC.
//! struct Clock;
//!
//! impl TimeSource for Clock {
//!     fn get_timestamp(&self) -> Timestamp {
//!         Timestamp::from_calendar(2024, 5, 1, 12, 0, 0).unwrap()
//!     }
//! }
//!
//! let mut volume = FatVolume::mount(sdcard, Clock)?;
//! let mut file = volume.open("PICO.TXT", Mode::WriteTruncate)?;
//! file.write(b"opened pico.txt to write\r\n")?;
//! file.close()?;
//! ```
//!
//! ## Features
//!
//! * `log` (default): log through the `log` facade.
//! * `defmt-log`: log over defmt instead. Turn off the default features when
//!   you enable this one.
//! * `refcell-blockdevice` (default): implement `BlockDevice` for `RefCell<T>`.

#![cfg_attr(not(test), no_std)]

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

#[cfg(feature = "defmt-log")]
macro_rules! trace {
    ($($arg:tt)+) => { defmt::trace!($($arg)+) };
}

#[cfg(feature = "defmt-log")]
macro_rules! debug {
    ($($arg:tt)+) => { defmt::debug!($($arg)+) };
}

#[cfg(feature = "defmt-log")]
macro_rules! warn {
    ($($arg:tt)+) => { defmt::warn!($($arg)+) };
}

#[cfg(all(feature = "log", not(feature = "defmt-log")))]
macro_rules! trace {
    ($($arg:tt)+) => { log::trace!($($arg)+) };
}

#[cfg(all(feature = "log", not(feature = "defmt-log")))]
macro_rules! debug {
    ($($arg:tt)+) => { log::debug!($($arg)+) };
}

#[cfg(all(feature = "log", not(feature = "defmt-log")))]
macro_rules! warn {
    ($($arg:tt)+) => { log::warn!($($arg)+) };
}

#[cfg(not(any(feature = "log", feature = "defmt-log")))]
macro_rules! trace {
    ($($arg:tt)+) => {};
}

#[cfg(not(any(feature = "log", feature = "defmt-log")))]
macro_rules! debug {
    ($($arg:tt)+) => {};
}

#[cfg(not(any(feature = "log", feature = "defmt-log")))]
macro_rules! warn {
    ($($arg:tt)+) => {};
}

#[macro_use]
mod structure;

pub mod block_device;
pub mod fat;
pub mod mbr;
pub mod sdmmc;
pub mod sdmmc_proto;

#[cfg(test)]
mod test;

pub use crate::block_device::{Block, BlockCount, BlockDevice, BlockIdx, MemoryBlockDevice};
pub use crate::fat::{FatError, FatVolume, File, Mode, TimeSource, Timestamp};
pub use crate::sdmmc::Error as SdMmcError;
pub use crate::sdmmc::{AcquireOpts, SdMmcSpi};

/// Broad classes of failure, shared by every layer of the crate.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The SPI bus or chip select pin reported a fault
    Transport,
    /// A bounded retry ran out
    Timeout,
    /// The card answered with something the protocol does not allow
    Protocol,
    /// A block read or write failed after the card was initialised
    Io,
    /// The partition table or boot sector is invalid, or a chain is broken
    CorruptFilesystem,
    /// No directory entry with that name
    NotFound,
    /// No free cluster or directory slot left
    DiskFull,
    /// The caller asked for something the volume cannot do
    InvalidInput,
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************

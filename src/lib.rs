//! NXP LPC UART ISP programmer.
//!
//! Based on the ISP chapters of UM10601 (LPC800) and UM10800 (LPC82x).
//!
//! A [`Session`] owns the serial link and speaks the bootloader's line
//! protocol, a [`Programmer`] borrows a session and a [`ChipGeometry`] to run
//! whole-chip operations. Images are written so that the vector table
//! checksum only becomes valid once every other sector has been programmed
//! and verified, an interrupted write always leaves the part in ISP mode.

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::serial::{Read, Write};

#[cfg(feature = "structopt")]
extern crate structopt;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

pub mod crc32;
pub mod error;
pub mod geometry;
pub mod image;
pub mod programmer;
pub mod protocol;
mod retry;
pub mod session;
pub mod transport;

pub use error::{AbortReason, Error, GeometryError, ImageError};
pub use geometry::{ChipGeometry, Registry};
pub use image::{FlashImage, SectorPlan};
pub use programmer::{
    query_chip, ChipInfo, Monitor, Programmer, SectorStatus, WriteReport, WriteState,
};
pub use protocol::{GoMode, ReturnCode};
pub use session::{BlankCheck, BootVersion, Comparison, Session, State, Uid};

/// Serial port with the line control used to reset into ISP mode
pub trait SerialPort<E>: Write<u8, Error = E> + Read<u8, Error = E> {
    fn set_rts(&mut self, level: bool) -> Result<(), E>;
    fn set_dtr(&mut self, level: bool) -> Result<(), E>;
    fn set_baud_rate(&mut self, baud: u32) -> Result<(), E>;
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Do not reset the device into ISP mode (DTR drives reset, RTS the ISP pin)
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub no_reset: bool,

    /// Assume the bootloader is already synchronized
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub no_sync: bool,

    /// Leave bootloader echo enabled
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub echo: bool,

    /// Skip the CRC check of staged RAM before each flash copy
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub no_crc: bool,

    /// Timeout to wait for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1000"))]
    pub response_timeout_ms: u32,

    /// Timeout for prepare, erase, copy and blank check responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "5000"))]
    pub flash_timeout_ms: u32,

    /// Period to poll for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,

    /// Period to wait for bootloader init after reset
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "100"))]
    pub init_delay_ms: u32,

    /// Crystal frequency reported during synchronization (kHz)
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "12000"))]
    pub crystal_khz: u32,

    /// Autobaud attempts before giving up
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "20"))]
    pub sync_retries: u32,

    /// Attempts per command while the bootloader reports busy
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "5"))]
    pub busy_retries: u32,

    /// Initial backoff between busy retries, doubled each attempt
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "10"))]
    pub busy_backoff_ms: u32,

    /// Attempts to stage a block in RAM with a matching CRC
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "3"))]
    pub crc_retries: u32,

    /// Attempts to program and verify a sector
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "3"))]
    pub sector_retries: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            no_reset: false,
            no_sync: false,
            echo: false,
            no_crc: false,
            response_timeout_ms: 1000,
            flash_timeout_ms: 5000,
            poll_delay_ms: 1,
            init_delay_ms: 100,
            crystal_khz: 12000,
            sync_retries: 20,
            busy_retries: 5,
            busy_backoff_ms: 10,
            crc_retries: 3,
            sector_retries: 3,
        }
    }
}

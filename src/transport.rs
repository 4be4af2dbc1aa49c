//! SPI transport: byte exchange over any embedded-hal blocking SPI bus.

use core::str::FromStr;

use embedded_hal::blocking::spi::{Transfer, Write};

use crate::protocol::SPI_DUMMY;

/// SPI clock used when none is configured
pub const DEFAULT_FREQUENCY_HZ: u32 = 8_000_000;

/// SPI bus able to talk to the bootloader.
///
/// Implemented for everything providing blocking `Transfer` and `Write`,
/// each call is one chip-select framed transaction.
pub trait SpiTransport<E>: Transfer<u8, Error = E> + Write<u8, Error = E> {
    /// Clock out one byte, returning the byte clocked in
    fn exchange(&mut self, byte: u8) -> Result<u8, E> {
        let mut b = [byte];
        let r = self.transfer(&mut b)?;
        Ok(r[0])
    }

    /// Clock out `data`, discarding whatever the device returns
    fn send(&mut self, data: &[u8]) -> Result<(), E> {
        self.write(data)
    }

    /// Clock in `len` bytes
    fn receive(&mut self, len: usize) -> Result<Vec<u8>, E> {
        let mut buff = vec![SPI_DUMMY; len];
        let r = self.transfer(&mut buff)?;
        Ok(r.to_vec())
    }
}

impl<T, E> SpiTransport<E> for T where T: Transfer<u8, Error = E> + Write<u8, Error = E> {}

/// SPI clock polarity and phase
///
/// | Mode | CPOL | CPHA |
/// |------|------|------|
/// | 0    | 0    | 0    |
/// | 1    | 0    | 1    |
/// | 2    | 1    | 0    |
/// | 3    | 1    | 1    |
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SpiMode {
    Mode0 = 0,
    Mode1 = 1,
    Mode2 = 2,
    Mode3 = 3,
}

impl SpiMode {
    pub fn cpol(self) -> bool {
        (self as u8) & 0b10 != 0
    }

    pub fn cpha(self) -> bool {
        (self as u8) & 0b01 != 0
    }
}

impl core::convert::TryFrom<u8> for SpiMode {
    type Error = InvalidSpiMode;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(SpiMode::Mode0),
            1 => Ok(SpiMode::Mode1),
            2 => Ok(SpiMode::Mode2),
            3 => Ok(SpiMode::Mode3),
            _ => Err(InvalidSpiMode(v.to_string())),
        }
    }
}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
#[error("invalid SPI mode '{0}', expected 0..=3")]
pub struct InvalidSpiMode(String);

impl FromStr for SpiMode {
    type Err = InvalidSpiMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use core::convert::TryFrom;

        let v = s.trim().parse::<u8>().map_err(|_| InvalidSpiMode(s.to_string()))?;
        SpiMode::try_from(v)
    }
}

impl Default for SpiMode {
    fn default() -> Self {
        SpiMode::Mode0
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct SpiConfig {
    /// SPI clock frequency
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "8000000"))]
    pub frequency_hz: u32,

    /// SPI mode (0-3, CPOL << 1 | CPHA)
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "0"))]
    pub mode: SpiMode,
}

impl Default for SpiConfig {
    fn default() -> Self {
        Self {
            frequency_hz: DEFAULT_FREQUENCY_HZ,
            mode: SpiMode::Mode0,
        }
    }
}

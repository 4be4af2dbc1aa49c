use std::io::Error as IoError;
use std::path::Path;

use linux_embedded_hal::spidev::{SpiModeFlags, SpidevOptions};
use linux_embedded_hal::{Delay, Spidev};

use crate::{Options, Programmer, SpiConfig, SpiMode};

impl SpiMode {
    fn flags(self) -> SpiModeFlags {
        match self {
            SpiMode::Mode0 => SpiModeFlags::SPI_MODE_0,
            SpiMode::Mode1 => SpiModeFlags::SPI_MODE_1,
            SpiMode::Mode2 => SpiModeFlags::SPI_MODE_2,
            SpiMode::Mode3 => SpiModeFlags::SPI_MODE_3,
        }
    }
}

impl Programmer<Spidev, Delay, IoError> {
    /// Create a new linux spidev programmer instance
    pub fn linux<P: AsRef<Path>>(
        device: P,
        spi: &SpiConfig,
        options: Options,
    ) -> Result<Self, IoError> {
        // Open device
        let mut port = Spidev::open(device.as_ref())?;

        // Apply settings
        let settings = SpidevOptions::new()
            .bits_per_word(8)
            .max_speed_hz(spi.frequency_hz)
            .mode(spi.mode.flags())
            .build();

        port.0.configure(&settings)?;

        debug!(
            "Opened {:?} at {} Hz, mode {:?}",
            device.as_ref(),
            spi.frequency_hz,
            spi.mode
        );

        // Return instance
        Ok(Self::new(port, Delay {}, options))
    }
}

//! Protection commands and leaving the bootloader.
//!
//! Protection changes reset the device on most parts (STM32F4/F7, some
//! STM32L4), after them the session is re-synchronised and anything
//! negotiated earlier is forgotten.

use core::fmt::Debug;

use embedded_hal::blocking::delay::DelayMs;

use crate::protocol::{self, Command, PROTECT_PAGE_SPACE};
use crate::{Error, Programmer, SpiTransport, State};

impl<P, D, E> Programmer<P, D, E>
where
    P: SpiTransport<E>,
    D: DelayMs<u32>,
    E: Debug,
{
    /// Enable write protection for `page_count` pages starting at `start_page`
    pub fn write_protect(&mut self, start_page: u32, page_count: u32) -> Result<(), Error<E>> {
        if start_page >= PROTECT_PAGE_SPACE
            || page_count == 0
            || page_count > PROTECT_PAGE_SPACE
            || start_page + page_count > PROTECT_PAGE_SPACE
        {
            return Err(Error::InvalidPages {
                start: start_page,
                count: page_count,
            });
        }

        info!("Write protecting {} pages from page {}", page_count, start_page);

        self.dispatch(Command::WriteProtect, |p| {
            p.send_command(Command::WriteProtect)?;
            p.send_frame(
                Command::WriteProtect,
                &protocol::protect_count_frame(page_count as u16),
            )?;
            p.send_frame(
                Command::WriteProtect,
                &protocol::protect_pages_frame(start_page as u8, page_count as u16),
            )
        })?;

        self.reset_session();
        Ok(())
    }

    /// Disable write protection for the whole flash
    pub fn write_unprotect(&mut self) -> Result<(), Error<E>> {
        info!("Removing write protection");
        self.protection_cmd(Command::WriteUnprotect)
    }

    /// Enable readout protection
    pub fn readout_protect(&mut self) -> Result<(), Error<E>> {
        info!("Enabling readout protection");
        self.protection_cmd(Command::ReadoutProtect)
    }

    /// Disable readout protection.
    ///
    /// The device mass erases its flash while doing so.
    pub fn readout_unprotect(&mut self) -> Result<(), Error<E>> {
        info!("Removing readout protection, flash will be erased");
        self.protection_cmd(Command::ReadoutUnprotect)
    }

    /// Jump to the application at `address`, leaving the bootloader
    pub fn go(&mut self, address: u32) -> Result<(), Error<E>> {
        info!("Jumping to 0x{:08x}", address);

        self.dispatch(Command::Go, |p| {
            p.send_command(Command::Go)?;
            p.send_frame(Command::Go, &protocol::address_frame(address))
        })?;

        self.state = State::Uninitialized;
        self.version = None;
        self.chip_id = None;

        Ok(())
    }

    // Command ACK, processing, then a second ACK once applied
    fn protection_cmd(&mut self, command: Command) -> Result<(), Error<E>> {
        let timeout = match command {
            Command::ReadoutUnprotect => self.options.erase_timeout_ms,
            _ => self.options.response_timeout_ms,
        };

        self.dispatch(command, |p| {
            p.send_command(command)?;
            p.delay.delay_ms(p.options.processing_delay_ms);
            p.expect_ack_within(command, timeout)
        })?;

        self.reset_session();
        Ok(())
    }
}

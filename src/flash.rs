//! Flash memory operations.

use core::fmt::Debug;

use embedded_hal::blocking::delay::DelayMs;

use crate::protocol::{self, Command, ERASE_PAGE_SPACE, MASS_ERASE, MAX_CHUNK, MAX_ERASE_PAGES};
use crate::{Error, Programmer, SpiTransport};

/// Progress of a chunked transfer
#[derive(Clone, PartialEq, Debug)]
pub struct Progress {
    pub bytes_complete: usize,
    pub bytes_total: usize,
}

/// Reject regions running past the end of the 32-bit address space
fn check_region<E: Debug>(address: u32, len: usize) -> Result<(), Error<E>> {
    if u64::from(address) + len as u64 > 1 << 32 {
        return Err(Error::AddressOverflow { address, len });
    }
    Ok(())
}

/// Single frame transfers carry 1 to 256 bytes
fn check_chunk<E: Debug>(len: usize) -> Result<(), Error<E>> {
    if len == 0 || len > MAX_CHUNK {
        return Err(Error::InvalidLength(len));
    }
    Ok(())
}

fn source_region<E: Debug>(source: &[u8], address: u32, offset: usize) -> Result<&[u8], Error<E>> {
    if offset > source.len() {
        return Err(Error::OffsetOutOfRange {
            offset,
            len: source.len(),
        });
    }

    let data = &source[offset..];
    check_region(address, data.len())?;

    Ok(data)
}

fn first_difference(expected: &[u8], actual: &[u8]) -> Option<usize> {
    expected
        .iter()
        .zip(actual.iter())
        .position(|(e, a)| e != a)
        .or_else(|| {
            if expected.len() != actual.len() {
                Some(expected.len().min(actual.len()))
            } else {
                None
            }
        })
}

impl<P, D, E> Programmer<P, D, E>
where
    P: SpiTransport<E>,
    D: DelayMs<u32>,
    E: Debug,
{
    /// Erase the whole flash.
    ///
    /// Completion is awaited with `erase_timeout_ms`, on large parts this can
    /// take seconds.
    pub fn mass_erase(&mut self) -> Result<(), Error<E>> {
        info!("Mass erasing flash");

        self.dispatch(Command::ExtendedErase, |p| {
            p.send_command(Command::ExtendedErase)?;
            p.port.send(&protocol::erase_count_frame(MASS_ERASE))?;
            p.expect_ack_within(Command::ExtendedErase, p.options.erase_timeout_ms)
        })
    }

    /// Erase `page_count` pages starting at `start_page`
    pub fn erase_pages(&mut self, start_page: u16, page_count: u32) -> Result<(), Error<E>> {
        if page_count == 0
            || page_count > MAX_ERASE_PAGES
            || u32::from(start_page) + page_count > ERASE_PAGE_SPACE
        {
            return Err(Error::InvalidPages {
                start: start_page.into(),
                count: page_count,
            });
        }

        info!("Erasing {} pages from page {}", page_count, start_page);

        self.dispatch(Command::ExtendedErase, |p| {
            p.send_command(Command::ExtendedErase)?;
            p.send_frame(
                Command::ExtendedErase,
                &protocol::erase_count_frame((page_count - 1) as u16),
            )?;

            let pages = protocol::erase_pages_frame(start_page, page_count);
            for c in pages.chunks(MAX_CHUNK) {
                p.port.send(c)?;
            }
            p.expect_ack_within(Command::ExtendedErase, p.options.erase_timeout_ms)
        })
    }

    /// Erase the 4 KiB block made of pages `page` and `page + 1`
    pub fn erase4k(&mut self, page: u16) -> Result<(), Error<E>> {
        self.erase_pages(page, 2)
    }

    /// Read `len` bytes (at most `MAX_CHUNK`) in a single command
    pub fn read(&mut self, address: u32, len: usize) -> Result<Vec<u8>, Error<E>> {
        check_chunk(len)?;
        check_region(address, len)?;

        self.dispatch(Command::ReadMemory, |p| p.read_memory_cmd(address, len))
    }

    /// Write `data` (at most `MAX_CHUNK` bytes) in a single command
    pub fn write(&mut self, address: u32, data: &[u8]) -> Result<(), Error<E>> {
        check_chunk(data.len())?;
        check_region(address, data.len())?;

        self.dispatch(Command::WriteMemory, |p| p.write_memory_cmd(address, data))
    }

    /// Program `source[offset..]` at `address`.
    ///
    /// The image content is not validated here, check its digest before
    /// calling. Each chunk is read back and rewritten when the bootloader
    /// dropped part of it (see `Options::write_verify_retries`).
    pub fn program(&mut self, source: &[u8], address: u32, offset: usize) -> Result<(), Error<E>> {
        self.program_with(source, address, offset, |_| ())
    }

    pub fn program_with<F>(
        &mut self,
        source: &[u8],
        address: u32,
        offset: usize,
        mut progress: F,
    ) -> Result<(), Error<E>>
    where
        F: FnMut(Progress),
    {
        let data = source_region(source, address, offset)?;

        info!("Programming {} bytes at 0x{:08x}", data.len(), address);

        self.dispatch(Command::WriteMemory, |p| {
            let mut complete = 0;

            for chunk in data.chunks(MAX_CHUNK) {
                let a = address + complete as u32;

                p.retry_nack(|p| p.write_memory_cmd(a, chunk))?;
                p.read_back(a, chunk, complete)?;

                complete += chunk.len();
                debug!("Wrote 0x{:08x} ({}/{})", a, complete, data.len());

                progress(Progress {
                    bytes_complete: complete,
                    bytes_total: data.len(),
                });
            }

            Ok(())
        })
    }

    /// Compare memory at `address` against `source[offset..]`
    pub fn verify(&mut self, source: &[u8], address: u32, offset: usize) -> Result<(), Error<E>> {
        self.verify_with(source, address, offset, |_| ())
    }

    pub fn verify_with<F>(
        &mut self,
        source: &[u8],
        address: u32,
        offset: usize,
        mut progress: F,
    ) -> Result<(), Error<E>>
    where
        F: FnMut(Progress),
    {
        let data = source_region(source, address, offset)?;

        info!("Verifying {} bytes at 0x{:08x}", data.len(), address);

        self.dispatch(Command::ReadMemory, |p| {
            let mut complete = 0;

            for chunk in data.chunks(MAX_CHUNK) {
                let a = address + complete as u32;
                let actual = p.retry_nack(|p| p.read_memory_cmd(a, chunk.len()))?;

                if let Some(o) = first_difference(chunk, &actual) {
                    error!("Verify failed at 0x{:08x}", a + o as u32);
                    return Err(Error::Mismatch {
                        address: a + o as u32,
                        offset: complete + o,
                    });
                }

                complete += chunk.len();
                progress(Progress {
                    bytes_complete: complete,
                    bytes_total: data.len(),
                });
            }

            Ok(())
        })
    }

    /// Read `len` bytes starting at `address`
    pub fn dump(&mut self, address: u32, len: usize) -> Result<Vec<u8>, Error<E>> {
        self.dump_with(address, len, |_| ())
    }

    pub fn dump_with<F>(&mut self, address: u32, len: usize, mut progress: F) -> Result<Vec<u8>, Error<E>>
    where
        F: FnMut(Progress),
    {
        check_region(address, len)?;

        info!("Dumping {} bytes from 0x{:08x}", len, address);

        self.dispatch(Command::ReadMemory, |p| {
            let mut data = Vec::with_capacity(len);

            while data.len() < len {
                let a = address + data.len() as u32;
                let n = (len - data.len()).min(MAX_CHUNK);

                let chunk = p.retry_nack(|p| p.read_memory_cmd(a, n))?;
                data.extend_from_slice(&chunk);

                progress(Progress {
                    bytes_complete: data.len(),
                    bytes_total: len,
                });
            }

            Ok(data)
        })
    }

    fn read_memory_cmd(&mut self, address: u32, len: usize) -> Result<Vec<u8>, Error<E>> {
        self.send_command(Command::ReadMemory)?;
        self.send_frame(Command::ReadMemory, &protocol::address_frame(address))?;
        self.send_frame(Command::ReadMemory, &protocol::size_frame(len))?;

        // Data follows a dummy byte
        let data = self.port.receive(len + 1)?;
        Ok(data[1..].to_vec())
    }

    fn write_memory_cmd(&mut self, address: u32, data: &[u8]) -> Result<(), Error<E>> {
        self.send_command(Command::WriteMemory)?;
        self.send_frame(Command::WriteMemory, &protocol::address_frame(address))?;
        self.send_frame(Command::WriteMemory, &protocol::write_frame(data))
    }

    /// Re-run `f` while the bootloader rejects it, up to `nack_retries` times
    fn retry_nack<T, F>(&mut self, mut f: F) -> Result<T, Error<E>>
    where
        F: FnMut(&mut Self) -> Result<T, Error<E>>,
    {
        let mut attempt = 0;

        loop {
            match f(self) {
                Err(Error::Nack(c)) if attempt < self.options.nack_retries => {
                    attempt += 1;
                    warn!("{:?} rejected, retrying ({}/{})", c, attempt, self.options.nack_retries);
                }
                r => return r,
            }
        }
    }

    // Some bootloaders (STM32L45x/46x v9.2, AN2606) occasionally leave
    // double-words blank while writing over SPI, read back and rewrite.
    fn read_back(&mut self, address: u32, chunk: &[u8], offset: usize) -> Result<(), Error<E>> {
        let retries = self.options.write_verify_retries;
        if retries == 0 {
            return Ok(());
        }

        let mut attempt = 0;
        loop {
            let actual = self.retry_nack(|p| p.read_memory_cmd(address, chunk.len()))?;

            let o = match first_difference(chunk, &actual) {
                None => return Ok(()),
                Some(o) => o,
            };

            attempt += 1;
            if attempt >= retries {
                error!("Read-back of 0x{:08x} still differs, giving up", address);
                return Err(Error::Mismatch {
                    address: address + o as u32,
                    offset: offset + o,
                });
            }

            warn!(
                "Read-back of 0x{:08x} differs at +{}, rewriting ({}/{})",
                address, o, attempt, retries
            );
            self.retry_nack(|p| p.write_memory_cmd(address, chunk))?;
        }
    }
}

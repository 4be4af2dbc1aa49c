//! STM32 SPI Bootloader.
//!
//! Based on AN4286 (SPI protocol used in the STM32 bootloader) and AN2606.

use core::fmt::Debug;
use core::marker::PhantomData;

#[macro_use]
extern crate log;

extern crate embedded_hal;
use embedded_hal::blocking::delay::DelayMs;

#[cfg(feature = "structopt")]
extern crate structopt;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

pub mod error;
pub mod flash;
pub mod image;
pub mod protect;
pub mod protocol;
pub mod status;
pub mod transport;

#[cfg(test)]
mod sim;

pub use error::{Error, ErrorKind};
pub use flash::Progress;
pub use protocol::{Command, MAX_CHUNK};
pub use status::{describe, describe_into, Status};
pub use transport::{SpiConfig, SpiMode, SpiTransport};

use protocol::{SPI_ACK, SPI_DUMMY, SPI_IDLE, SPI_NACK, SPI_SOF};

/// Session state
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    /// Not synchronised with the bootloader
    Uninitialized,
    /// Activation pattern sent, awaiting acknowledgement
    Handshaking,
    /// Synchronised and waiting for a command
    Ready,
    /// A command is in flight
    Executing(Command),
    /// The link failed mid-command, the session must be released
    Closed,
}

/// Successful handshake outcome
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Synced {
    /// The bootloader acknowledged the activation pattern
    Fresh,
    /// The bootloader was already synchronised and rejected the activation
    /// pattern, this is not an error
    AlreadySynced,
}

/// Response to the Get command
#[derive(Clone, PartialEq, Debug)]
pub struct BootloaderInfo {
    /// Protocol version, 0x11 = v1.1
    pub version: u8,
    /// Opcodes of the supported commands
    pub commands: Vec<u8>,
}

impl BootloaderInfo {
    pub fn supports(&self, command: Command) -> bool {
        self.commands.contains(&command.opcode())
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Timeout to wait for bootloader acknowledgements
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "500"))]
    pub response_timeout_ms: u32,

    /// Period to poll for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,

    /// Timeout for erase operations (erase, readout unprotect)
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "10000"))]
    pub erase_timeout_ms: u32,

    /// Period to wait for protection changes to be applied before polling
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "100"))]
    pub processing_delay_ms: u32,

    /// Period to wait for the device to reset after protection changes
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "300"))]
    pub reset_delay_ms: u32,

    /// Number of times a rejected read or write chunk is re-sent
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "3"))]
    pub nack_retries: u32,

    /// Read-back attempts per written chunk, rewriting on mismatch (0 disables)
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "10"))]
    pub write_verify_retries: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            response_timeout_ms: 500,
            poll_delay_ms: 1,
            erase_timeout_ms: 10_000,
            processing_delay_ms: 100,
            reset_delay_ms: 300,
            nack_retries: 3,
            write_verify_retries: 10,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Debug)]
enum Reply {
    Ack,
    Nack,
}

pub struct Programmer<P, D, E> {
    state: State,
    options: Options,
    port: P,
    delay: D,
    version: Option<u8>,
    chip_id: Option<Vec<u8>>,
    _err: PhantomData<E>,
}

impl<P, D, E> Programmer<P, D, E>
where
    P: SpiTransport<E>,
    D: DelayMs<u32>,
    E: Debug,
{
    /// Create a new programmer instance
    pub fn new(port: P, delay: D, options: Options) -> Self {
        Self {
            state: State::Uninitialized,
            options,
            port,
            delay,
            version: None,
            chip_id: None,
            _err: PhantomData,
        }
    }

    /// Fetch the programmer state
    pub fn state(&self) -> State {
        self.state
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Protocol version, once negotiated with `get_version` or `get_commands`
    pub fn version(&self) -> Option<u8> {
        self.version
    }

    /// Chip identifier, once read with `get_id`
    pub fn chip_id(&self) -> Option<&[u8]> {
        self.chip_id.as_deref()
    }

    /// Access the underlying transport
    pub fn inner_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Release the session, returning the transport
    pub fn close(self) -> P {
        debug!("Closing session in state {:?}", self.state);
        self.port
    }

    /// Synchronise with the bootloader.
    ///
    /// BOOT pins must select the system memory and the device must have been
    /// powered up before calling this.
    pub fn init(&mut self) -> Result<Synced, Error<E>> {
        match self.state {
            State::Uninitialized | State::Ready => (),
            s => return Err(Error::InvalidState(s)),
        }

        self.state = State::Handshaking;
        self.version = None;
        self.chip_id = None;

        match self.handshake() {
            Ok(s) => {
                self.state = State::Ready;
                Ok(s)
            }
            Err(e) => {
                self.state = State::Uninitialized;
                Err(e)
            }
        }
    }

    fn handshake(&mut self) -> Result<Synced, Error<E>> {
        debug!("Sending activation pattern");

        let resp = self.port.exchange(SPI_SOF)?;
        if resp != SPI_DUMMY {
            error!(
                "Activation pattern answered with 0x{:02x}, check BOOT pins then power cycle",
                resp
            );
            return Err(Error::NotStarted(resp));
        }

        debug!("Awaiting bootloader response");
        match self.await_ack(self.options.response_timeout_ms) {
            Ok(Reply::Ack) => Ok(Synced::Fresh),
            Ok(Reply::Nack) => {
                debug!("Bootloader already synchronised");
                Ok(Synced::AlreadySynced)
            }
            Err(Error::ResponseTimeout(_)) => Err(Error::NotStarted(resp)),
            Err(e) => Err(e),
        }
    }

    /// Fetch the protocol version and the supported commands
    pub fn get_commands(&mut self) -> Result<BootloaderInfo, Error<E>> {
        let data = self.dispatch(Command::Get, |p| {
            p.send_command(Command::Get)?;
            let data = p.receive_response()?;
            p.expect_ack(Command::Get)?;
            Ok(data)
        })?;

        let info = BootloaderInfo {
            version: data[0],
            commands: data[1..].to_vec(),
        };
        self.version = Some(info.version);

        Ok(info)
    }

    /// Fetch the protocol version
    pub fn get_version(&mut self) -> Result<u8, Error<E>> {
        let version = self.dispatch(Command::GetVersion, |p| {
            p.send_command(Command::GetVersion)?;
            let data = p.port.receive(2)?;
            p.expect_ack(Command::GetVersion)?;
            if data[0] != SPI_DUMMY {
                return Err(Error::InvalidResponse(data[0]));
            }
            Ok(data[1])
        })?;

        debug!("Protocol version: 0x{:02x}", version);
        self.version = Some(version);

        Ok(version)
    }

    /// Fetch the chip identifier (product ID)
    pub fn get_id(&mut self) -> Result<Vec<u8>, Error<E>> {
        let id = self.dispatch(Command::GetId, |p| {
            p.send_command(Command::GetId)?;
            let id = p.receive_response()?;
            p.expect_ack(Command::GetId)?;
            Ok(id)
        })?;

        debug!("Chip ID: {:02x?}", id);
        self.chip_id = Some(id.clone());

        Ok(id)
    }

    /// Run a command from the `Ready` state.
    ///
    /// Link failures close the session, anything else returns it to `Ready`.
    pub(crate) fn dispatch<T, F>(&mut self, command: Command, f: F) -> Result<T, Error<E>>
    where
        F: FnOnce(&mut Self) -> Result<T, Error<E>>,
    {
        if self.state != State::Ready {
            error!("{:?} issued in state {:?}", command, self.state);
            return Err(Error::InvalidState(self.state));
        }

        self.state = State::Executing(command);
        let r = f(self);

        self.state = match &r {
            Err(e) if e.is_fatal() => {
                error!("{:?} failed, closing session: {}", command, e);
                State::Closed
            }
            _ => State::Ready,
        };

        r
    }

    /// Send a command frame and await its acknowledgement
    pub(crate) fn send_command(&mut self, command: Command) -> Result<(), Error<E>> {
        debug!("Sending command {:?}", command);
        self.port.send(&protocol::command_frame(command))?;
        self.expect_ack(command)
    }

    /// Send a data frame belonging to `command` and await its acknowledgement
    pub(crate) fn send_frame(&mut self, command: Command, data: &[u8]) -> Result<(), Error<E>> {
        self.port.send(data)?;
        self.expect_ack(command)
    }

    /// Read a `dummy, N, data[N + 1]` response
    fn receive_response(&mut self) -> Result<Vec<u8>, Error<E>> {
        let head = self.port.receive(2)?;
        if head[0] != SPI_DUMMY {
            error!("Unexpected response header 0x{:02x}", head[0]);
            return Err(Error::InvalidResponse(head[0]));
        }

        let n = head[1];
        if n >= SPI_DUMMY {
            error!("Implausible response length 0x{:02x}", n);
            return Err(Error::InvalidResponse(n));
        }

        let data = self.port.receive(n as usize + 1)?;
        Ok(data)
    }

    pub(crate) fn expect_ack(&mut self, command: Command) -> Result<(), Error<E>> {
        self.expect_ack_within(command, self.options.response_timeout_ms)
    }

    pub(crate) fn expect_ack_within(
        &mut self,
        command: Command,
        timeout_ms: u32,
    ) -> Result<(), Error<E>> {
        match self.await_ack(timeout_ms)? {
            Reply::Ack => Ok(()),
            Reply::Nack => {
                warn!("{:?} rejected by bootloader", command);
                Err(Error::Nack(command))
            }
        }
    }

    fn await_ack(&mut self, timeout_ms: u32) -> Result<Reply, Error<E>> {
        let step = self.options.poll_delay_ms.max(1);
        let mut t = 0;

        // The reply is loaded while the first byte is clocked
        self.port.exchange(SPI_IDLE)?;

        loop {
            match self.port.exchange(SPI_IDLE)? {
                SPI_ACK => {
                    debug!("Received bootloader ack");
                    self.port.send(&[SPI_ACK])?;
                    return Ok(Reply::Ack);
                }
                SPI_NACK => {
                    debug!("Received bootloader nack");
                    self.port.send(&[SPI_ACK])?;
                    return Ok(Reply::Nack);
                }
                _ => (),
            }

            // Wait for delay period
            self.delay.delay_ms(self.options.poll_delay_ms);
            t += step;

            if t > timeout_ms {
                error!("Receive timeout ({} ms)", timeout_ms);
                return Err(Error::ResponseTimeout(timeout_ms));
            }
        }
    }

    /// Wait out a device reset and re-synchronise.
    ///
    /// Negotiated details are discarded, if the handshake fails the session
    /// is left uninitialised.
    pub(crate) fn reset_session(&mut self) {
        debug!("Waiting {} ms for device reset", self.options.reset_delay_ms);
        self.delay.delay_ms(self.options.reset_delay_ms);

        self.state = State::Uninitialized;
        if let Err(e) = self.init() {
            warn!("Re-synchronising after reset failed: {}", e);
        }
    }
}

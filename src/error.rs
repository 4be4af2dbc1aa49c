use core::fmt::Debug;

use crate::protocol::Command;
use crate::status::Status;
use crate::State;

#[derive(Debug, thiserror::Error)]
pub enum Error<E: Debug> {
    #[error("transport error: {0:?}")]
    Transport(E),

    /// The device did not answer the activation pattern, it is not running
    /// the bootloader (check BOOT pins and power cycle)
    #[error("bootloader not started (activation pattern answered with 0x{0:02x})")]
    NotStarted(u8),

    #[error("no response within {0} ms")]
    ResponseTimeout(u32),

    #[error("unexpected response 0x{0:02x}")]
    InvalidResponse(u8),

    /// The device rejected a command or one of its frames
    #[error("{0:?} rejected by device")]
    Nack(Command),

    #[error("verify mismatch at 0x{address:08x} (offset {offset})")]
    Mismatch { address: u32, offset: usize },

    #[error("invalid transfer length {0}")]
    InvalidLength(usize),

    #[error("region 0x{address:08x}+{len} exceeds the 32-bit address space")]
    AddressOverflow { address: u32, len: usize },

    #[error("invalid page range {start}+{count}")]
    InvalidPages { start: u32, count: u32 },

    #[error("offset {offset} beyond source length {len}")]
    OffsetOutOfRange { offset: usize, len: usize },

    #[error("operation not permitted in state {0:?}")]
    InvalidState(State),
}

impl<E: Debug> From<E> for Error<E> {
    fn from(e: E) -> Self {
        Self::Transport(e)
    }
}

/// Error classes as seen by callers
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Device unreachable or the bus failed
    Transport,
    /// Framing, checksum or handshake failure mid-session
    ProtocolDesync,
    /// No answer to the activation pattern, needs a power cycle
    DeviceNotStarted,
    /// The device rejected a valid command
    Command,
    /// Read-back did not match
    Mismatch,
    /// Invalid arguments or call order, nothing was sent
    Precondition,
}

impl<E: Debug> Error<E> {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transport(_) => ErrorKind::Transport,
            Error::ResponseTimeout(_) | Error::InvalidResponse(_) => ErrorKind::ProtocolDesync,
            Error::NotStarted(_) => ErrorKind::DeviceNotStarted,
            Error::Nack(_) => ErrorKind::Command,
            Error::Mismatch { .. } => ErrorKind::Mismatch,
            Error::InvalidLength(_)
            | Error::AddressOverflow { .. }
            | Error::InvalidPages { .. }
            | Error::OffsetOutOfRange { .. }
            | Error::InvalidState(_) => ErrorKind::Precondition,
        }
    }

    /// Whether the session can no longer be trusted after this error
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transport | ErrorKind::ProtocolDesync | ErrorKind::DeviceNotStarted
        )
    }

    /// Numeric status code for integer-only callers
    pub fn status(&self) -> Status {
        match self {
            Error::Transport(_) => Status::DriverFault,
            Error::NotStarted(_) => Status::DutIllegalOperation,
            Error::ResponseTimeout(_) => Status::DutOperationTimeout,
            Error::InvalidResponse(_) => Status::ProtocolFault,
            Error::Nack(_) => Status::HardwareFault,
            Error::Mismatch { .. } => Status::ProgrammingCheckoutError,
            Error::InvalidLength(_)
            | Error::AddressOverflow { .. }
            | Error::InvalidPages { .. }
            | Error::OffsetOutOfRange { .. } => Status::ParamFault,
            Error::InvalidState(_) => Status::SoftError,
        }
    }
}

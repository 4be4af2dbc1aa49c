//! Numeric status codes and their diagnostic text.
//!
//! These are the codes reported to callers that only deal in integers
//! (scripts, foreign bindings). Negative values are failures.

/// Size of the fixed diagnostic buffer used by integer-only callers,
/// including the terminating NUL
pub const DESCRIPTION_LEN: usize = 128;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum Status {
    Normal = 1,
    DriverFault = -1,
    DriverBusy = -2,
    ProtocolBusy = -3,
    ProtocolFault = -4,
    HardwareFault = -5,
    HardwareBusy = -6,
    DutOperationTimeout = -7,
    DutIllegalOperation = -8,
    SoftParamFault = -9,
    FirmwareNotMatch = -16,
    FileOperationError = -17,
    FirmwareFileNotSuitable = -18,
    ConfigureFileNotSuitable = -19,
    ParamFault = -30,
    SoftTimeout = -31,
    SoftError = -32,
    ProgrammingCheckoutError = -100,
    ProgrammingEraseError = -101,
    FunctionInexistentError = -110,
    RpcServerError = -111,
    WaitingTimeout = -112,
    UndefinedFault = -127,
    NullPointerParamFault = -1000,
}

const ALL: &[Status] = &[
    Status::Normal,
    Status::DriverFault,
    Status::DriverBusy,
    Status::ProtocolBusy,
    Status::ProtocolFault,
    Status::HardwareFault,
    Status::HardwareBusy,
    Status::DutOperationTimeout,
    Status::DutIllegalOperation,
    Status::SoftParamFault,
    Status::FirmwareNotMatch,
    Status::FileOperationError,
    Status::FirmwareFileNotSuitable,
    Status::ConfigureFileNotSuitable,
    Status::ParamFault,
    Status::SoftTimeout,
    Status::SoftError,
    Status::ProgrammingCheckoutError,
    Status::ProgrammingEraseError,
    Status::FunctionInexistentError,
    Status::RpcServerError,
    Status::WaitingTimeout,
    Status::UndefinedFault,
    Status::NullPointerParamFault,
];

impl Status {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        ALL.iter().copied().find(|s| s.code() == code)
    }

    pub fn is_success(self) -> bool {
        self.code() >= 0
    }

    pub fn description(self) -> &'static str {
        use Status::*;

        match self {
            Normal => "executing normal",
            DriverFault => "fault in driver response",
            DriverBusy => "driver busy",
            ProtocolBusy => "protocol busy",
            ProtocolFault => "fault in protocol response",
            HardwareFault => "fault in hardware response",
            HardwareBusy => "hardware busy",
            DutOperationTimeout => "timeout waiting for the device",
            DutIllegalOperation => {
                "bootloader not started, check the activation pattern and power cycle the device"
            }
            SoftParamFault => "function parameter error",
            FirmwareNotMatch => "firmware does not match or exceeds the allowed length",
            FileOperationError => "firmware file operation error",
            FirmwareFileNotSuitable => "file does not exist or is not suitable",
            ConfigureFileNotSuitable => "configuration file does not exist or is not suitable",
            ParamFault => "operation parameter error",
            SoftTimeout => "internal software timeout",
            SoftError => "internal software error",
            ProgrammingCheckoutError => "firmware verification failed",
            ProgrammingEraseError => "firmware erase verification failed",
            FunctionInexistentError => "function not supported",
            RpcServerError => "rpc response error",
            WaitingTimeout => "timeout waiting for remote server",
            UndefinedFault => "undefined error",
            NullPointerParamFault => "null pointer parameter",
        }
    }
}

impl core::fmt::Display for Status {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} ({})", self.description(), self.code())
    }
}

/// Diagnostic text for a raw status code, unknown codes are reported as undefined
pub fn describe(code: i32) -> &'static str {
    Status::from_code(code)
        .unwrap_or(Status::UndefinedFault)
        .description()
}

/// Write the NUL terminated description of `code` into `out`.
///
/// Text that does not fit is truncated on a character boundary.
/// Returns the number of text bytes written, excluding the terminator.
pub fn describe_into(code: i32, out: &mut [u8]) -> usize {
    if out.is_empty() {
        return 0;
    }

    let text = describe(code);
    let mut n = text.len().min(out.len() - 1);
    while !text.is_char_boundary(n) {
        n -= 1;
    }

    out[..n].copy_from_slice(&text.as_bytes()[..n]);
    for b in out[n..].iter_mut() {
        *b = 0;
    }

    n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_is_stable() {
        for s in ALL {
            assert_eq!(describe(s.code()), describe(s.code()));
            assert!(describe(s.code()).len() < DESCRIPTION_LEN);
        }
    }

    #[test]
    fn unknown_codes_are_undefined() {
        assert_eq!(describe(-4242), Status::UndefinedFault.description());
        assert_eq!(describe(0), "undefined error");
    }

    #[test]
    fn codes_round_trip() {
        for s in ALL {
            assert_eq!(Status::from_code(s.code()), Some(*s));
        }
        assert!(Status::Normal.is_success());
        assert!(!Status::HardwareFault.is_success());
    }

    #[test]
    fn describe_into_terminates() {
        let mut buf = [0xAAu8; DESCRIPTION_LEN];
        let n = describe_into(Status::ProgrammingCheckoutError.code(), &mut buf);
        assert_eq!(&buf[..n], b"firmware verification failed");
        assert_eq!(buf[n], 0);
    }

    #[test]
    fn describe_into_truncates() {
        let mut buf = [0xAAu8; 9];
        let n = describe_into(Status::ProgrammingCheckoutError.code(), &mut buf);
        assert_eq!(n, 8);
        assert_eq!(&buf[..8], b"firmware");
        assert_eq!(buf[8], 0);

        let mut empty = [];
        assert_eq!(describe_into(1, &mut empty), 0);
    }
}

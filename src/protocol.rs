//! SPI bootloader wire format.
//!
//! Based on AN4286 (SPI protocol used in the STM32 bootloader).

/// Start of frame, also the activation pattern
pub const SPI_SOF: u8 = 0x5A;

/// Byte returned by the device while clocking out the start of frame,
/// and the leading byte of every data response
pub const SPI_DUMMY: u8 = 0xA5;

/// Byte clocked out by the host while polling
pub const SPI_IDLE: u8 = 0x00;

pub const SPI_ACK: u8 = 0x79;
pub const SPI_NACK: u8 = 0x1F;

/// Maximum payload of a single read or write frame
pub const MAX_CHUNK: usize = 256;

/// Erase page count (minus one) requesting a global mass erase
pub const MASS_ERASE: u16 = 0xFFFF;

/// Highest page count a non-special erase may request
pub const MAX_ERASE_PAGES: u32 = 0xFFF0;

/// Total number of erase page codes addressable by the extended erase command
pub const ERASE_PAGE_SPACE: u32 = 0x1_0000;

/// Total number of write protection page codes
pub const PROTECT_PAGE_SPACE: u32 = 256;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Fetch bootloader version and allowed commands
    Get = 0x00,

    /// Gets the bootloader version
    GetVersion = 0x01,

    /// Gets the chip ID
    GetId = 0x02,

    /// Reads up to 256 bytes of memory starting from an address specified by the application.
    ReadMemory = 0x11,

    /// Jumps to user application code located in the internal Flash memory or in the SRAM.
    Go = 0x21,

    /// Writes up to 256 bytes to the RAM or Flash memory starting from an address specified by the application.
    WriteMemory = 0x31,

    /// Erases from one to all the Flash memory pages using two byte addressing mode.
    ExtendedErase = 0x44,

    /// Enables the write protection for some sectors.
    WriteProtect = 0x63,

    /// Disables the write protection for all Flash memory sectors
    WriteUnprotect = 0x73,

    /// Enables the read protection
    ReadoutProtect = 0x82,

    /// Disables the read protection.
    ReadoutUnprotect = 0x92,
}

impl Command {
    pub fn opcode(self) -> u8 {
        self as u8
    }

    /// Look up a command from its opcode
    pub fn from_opcode(opcode: u8) -> Option<Self> {
        let c = match opcode {
            0x00 => Command::Get,
            0x01 => Command::GetVersion,
            0x02 => Command::GetId,
            0x11 => Command::ReadMemory,
            0x21 => Command::Go,
            0x31 => Command::WriteMemory,
            0x44 => Command::ExtendedErase,
            0x63 => Command::WriteProtect,
            0x73 => Command::WriteUnprotect,
            0x82 => Command::ReadoutProtect,
            0x92 => Command::ReadoutUnprotect,
            _ => return None,
        };
        Some(c)
    }
}

/// XOR of all bytes
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |c, v| c ^ v)
}

/// `SOF, opcode, ~opcode`
pub fn command_frame(command: Command) -> [u8; 3] {
    let c = command.opcode();
    [SPI_SOF, c, c ^ 0xFF]
}

/// Big-endian address followed by its checksum
pub fn address_frame(address: u32) -> [u8; 5] {
    let a = address.to_be_bytes();
    [a[0], a[1], a[2], a[3], checksum(&a)]
}

/// Length of a read request, `len` must be in `1..=MAX_CHUNK`
pub fn size_frame(len: usize) -> [u8; 2] {
    let n = (len - 1) as u8;
    [n, n ^ 0xFF]
}

/// Count, payload and checksum for a write memory request.
///
/// Flash is programmed in half-words, odd payloads are padded with `0xFF`.
pub fn write_frame(data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(data.len() + 3);
    frame.push(0);
    frame.extend_from_slice(data);
    if data.len() % 2 != 0 {
        frame.push(0xFF);
    }
    frame[0] = (frame.len() - 2) as u8;
    frame.push(checksum(&frame));
    frame
}

/// Page count (minus one) for an extended erase request
pub fn erase_count_frame(count_minus_one: u16) -> [u8; 3] {
    let n = count_minus_one.to_be_bytes();
    [n[0], n[1], checksum(&n)]
}

/// Big-endian page codes followed by their checksum
pub fn erase_pages_frame(start_page: u16, page_count: u32) -> Vec<u8> {
    let mut frame = Vec::with_capacity(page_count as usize * 2 + 1);
    for p in u32::from(start_page)..u32::from(start_page) + page_count {
        frame.extend_from_slice(&(p as u16).to_be_bytes());
    }
    frame.push(checksum(&frame));
    frame
}

/// Page count (minus one) for a write protect request
pub fn protect_count_frame(page_count: u16) -> [u8; 2] {
    let n = (page_count - 1) as u8;
    [n, n ^ 0xFF]
}

/// Page codes followed by their checksum for a write protect request
pub fn protect_pages_frame(start_page: u8, page_count: u16) -> Vec<u8> {
    let mut frame: Vec<u8> = (0..page_count)
        .map(|i| (u16::from(start_page) + i) as u8)
        .collect();
    frame.push(checksum(&frame));
    frame
}

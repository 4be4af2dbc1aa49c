//! Simulated STM32 SPI bootloader.
//!
//! Each `transfer`/`write` call is one chip-select framed transaction. The
//! device answers byte by byte, acknowledgements only appear on the second
//! poll after a frame completes (the first clocks the reply in).

use std::collections::VecDeque;
use std::mem;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::blocking::spi::{Transfer, Write};

use crate::protocol::{checksum, Command, SPI_ACK, SPI_DUMMY, SPI_NACK, SPI_SOF};

pub const FLASH_BASE: u32 = 0x0800_0000;
pub const FLASH_SIZE: usize = 64 * 1024;
pub const PAGE_SIZE: usize = 2048;
pub const BL_VERSION: u8 = 0x11;
pub const PRODUCT_ID: [u8; 2] = [0x04, 0x62];

const COMMANDS: [u8; 11] = [0x00, 0x01, 0x02, 0x11, 0x21, 0x31, 0x44, 0x63, 0x73, 0x82, 0x92];

/// Polls a protection change takes to apply
const PROCESSING_BUSY: u32 = 5;

#[derive(Copy, Clone, PartialEq, Debug)]
pub struct BusFault;

pub struct NoDelay;

impl DelayMs<u32> for NoDelay {
    fn delay_ms(&mut self, _ms: u32) {}
}

enum Phase {
    /// Not running the bootloader, MISO stays low
    Off,
    /// Waiting for the activation pattern
    Unsynced,
    /// Waiting for a command frame
    Idle,
    /// ACK or NACK, clocked out once `busy` polls have passed
    Reply { byte: u8, busy: u32, then: Box<Phase> },
    /// Waiting for the host to acknowledge the reply
    Confirm(Box<Phase>),
    /// Clocking out response data
    Respond { data: VecDeque<u8>, then: Box<Phase> },
    /// Collecting a data frame
    Collect { len: usize, step: Step },
}

#[derive(Copy, Clone)]
enum Step {
    ReadAddress,
    ReadSize(u32),
    WriteAddress,
    WriteCount(u32),
    WriteData(u32),
    EraseCount,
    ErasePages,
    GoAddress,
    ProtectCount,
    ProtectPages,
}

pub struct Device {
    pub memory: Vec<u8>,
    pub read_protected: bool,
    pub protected_pages: Vec<u8>,
    pub jumped_to: Option<u32>,
    /// Commands received
    pub log: Vec<Command>,
    /// Device resets caused by protection changes
    pub resets: u32,

    /// Polls before an erase completes
    pub erase_busy: u32,
    /// Never acknowledge anything
    pub stalled: bool,
    /// Fail every bus transaction
    pub unplugged: bool,
    /// Leave the bootloader instead of restarting it after a reset
    pub off_after_reset: bool,
    /// Upcoming writes that leave their first double-word blank
    pub dropped_writes: u32,
    /// Upcoming writes rejected at the data frame
    pub nack_writes: u32,

    phase: Phase,
    frame: Vec<u8>,
}

impl Device {
    pub fn new() -> Self {
        Self {
            memory: (0..FLASH_SIZE).map(|i| (i % 251) as u8).collect(),
            read_protected: false,
            protected_pages: vec![],
            jumped_to: None,
            log: vec![],
            resets: 0,
            erase_busy: 20,
            stalled: false,
            unplugged: false,
            off_after_reset: false,
            dropped_writes: 0,
            nack_writes: 0,
            phase: Phase::Unsynced,
            frame: vec![],
        }
    }

    /// A device that is not running the bootloader
    pub fn off() -> Self {
        Self {
            phase: Phase::Off,
            ..Self::new()
        }
    }

    fn clock(&mut self, mosi: u8) -> u8 {
        let phase = mem::replace(&mut self.phase, Phase::Off);
        let (miso, next) = self.step(phase, mosi);
        self.phase = next;
        miso
    }

    fn end_transaction(&mut self) {
        // A lone activation pattern while synchronised
        if let Phase::Idle = self.phase {
            if self.frame == [SPI_SOF] {
                self.frame.clear();
                self.phase = reply(SPI_NACK, 0, Phase::Idle);
            }
        }
    }

    fn step(&mut self, phase: Phase, mosi: u8) -> (u8, Phase) {
        match phase {
            Phase::Off => (0x00, Phase::Off),
            Phase::Unsynced if mosi == SPI_SOF => (SPI_DUMMY, reply(SPI_ACK, 0, Phase::Idle)),
            Phase::Unsynced => (0x00, Phase::Unsynced),
            Phase::Idle => {
                let miso = if self.frame.is_empty() && mosi == SPI_SOF {
                    SPI_DUMMY
                } else {
                    0x00
                };

                self.frame.push(mosi);
                if self.frame.len() < 3 {
                    return (miso, Phase::Idle);
                }

                let frame = mem::take(&mut self.frame);
                (miso, self.command(&frame))
            }
            Phase::Reply { byte, busy, then } => {
                if self.stalled {
                    (0x00, Phase::Reply { byte, busy, then })
                } else if busy > 0 {
                    (
                        0x00,
                        Phase::Reply {
                            byte,
                            busy: busy - 1,
                            then,
                        },
                    )
                } else {
                    (byte, Phase::Confirm(then))
                }
            }
            Phase::Confirm(then) => (0x00, *then),
            Phase::Respond { mut data, then } => {
                let b = data.pop_front().unwrap_or(0x00);
                if data.is_empty() {
                    (b, *then)
                } else {
                    (b, Phase::Respond { data, then })
                }
            }
            Phase::Collect { len, step } => {
                self.frame.push(mosi);
                if self.frame.len() < len {
                    return (0x00, Phase::Collect { len, step });
                }

                let frame = mem::take(&mut self.frame);
                (0x00, self.frame_done(step, &frame))
            }
        }
    }

    fn command(&mut self, frame: &[u8]) -> Phase {
        if frame[0] != SPI_SOF || frame[1] ^ frame[2] != 0xFF {
            return nack();
        }

        let command = match Command::from_opcode(frame[1]) {
            Some(c) => c,
            None => return nack(),
        };
        self.log.push(command);

        match command {
            Command::Get => {
                let mut data = vec![SPI_DUMMY, COMMANDS.len() as u8, BL_VERSION];
                data.extend_from_slice(&COMMANDS);
                ack(respond(data, ack(Phase::Idle)))
            }
            Command::GetVersion => ack(respond(vec![SPI_DUMMY, BL_VERSION], ack(Phase::Idle))),
            Command::GetId => {
                let mut data = vec![SPI_DUMMY, PRODUCT_ID.len() as u8 - 1];
                data.extend_from_slice(&PRODUCT_ID);
                ack(respond(data, ack(Phase::Idle)))
            }
            Command::ReadMemory | Command::WriteMemory | Command::ExtendedErase
                if self.read_protected =>
            {
                nack()
            }
            Command::ReadMemory => ack(collect(5, Step::ReadAddress)),
            Command::WriteMemory => ack(collect(5, Step::WriteAddress)),
            Command::ExtendedErase => ack(collect(3, Step::EraseCount)),
            Command::Go => ack(collect(5, Step::GoAddress)),
            Command::WriteProtect => ack(collect(2, Step::ProtectCount)),
            Command::WriteUnprotect => {
                self.protected_pages.clear();
                ack(reply(SPI_ACK, PROCESSING_BUSY, self.reset()))
            }
            Command::ReadoutProtect => {
                self.read_protected = true;
                ack(reply(SPI_ACK, PROCESSING_BUSY, self.reset()))
            }
            Command::ReadoutUnprotect => {
                self.read_protected = false;
                self.erase_all();
                ack(reply(SPI_ACK, self.erase_busy, self.reset()))
            }
        }
    }

    fn frame_done(&mut self, step: Step, frame: &[u8]) -> Phase {
        match step {
            Step::ReadAddress => match self.address(frame) {
                Some(a) => ack(collect(2, Step::ReadSize(a))),
                None => nack(),
            },
            Step::ReadSize(a) => {
                let n = frame[0] as usize + 1;
                match self.offset(a, n) {
                    Some(o) if frame[0] ^ frame[1] == 0xFF => {
                        let mut data = vec![SPI_DUMMY];
                        data.extend_from_slice(&self.memory[o..o + n]);
                        ack(respond(data, Phase::Idle))
                    }
                    _ => nack(),
                }
            }
            Step::WriteAddress => match self.address(frame) {
                Some(a) => ack(collect(1, Step::WriteCount(a))),
                None => nack(),
            },
            Step::WriteCount(a) => {
                // Keep the count in the frame, it is covered by the checksum
                self.frame.push(frame[0]);
                collect(frame[0] as usize + 3, Step::WriteData(a))
            }
            Step::WriteData(a) => {
                let n = frame[0] as usize + 1;
                let data = &frame[1..=n];

                if checksum(&frame[..=n]) != frame[n + 1] {
                    return nack();
                }
                if self.nack_writes > 0 {
                    self.nack_writes -= 1;
                    return nack();
                }

                let o = match self.offset(a, n) {
                    Some(o) => o,
                    None => return nack(),
                };
                self.memory[o..o + n].copy_from_slice(data);

                if self.dropped_writes > 0 {
                    self.dropped_writes -= 1;
                    let blank = n.min(8);
                    self.memory[o..o + blank].iter_mut().for_each(|b| *b = 0xFF);
                }

                ack(Phase::Idle)
            }
            Step::EraseCount => {
                if checksum(&frame[..2]) != frame[2] {
                    return nack();
                }

                match u16::from_be_bytes([frame[0], frame[1]]) {
                    0xFFFF => {
                        self.erase_all();
                        reply(SPI_ACK, self.erase_busy, Phase::Idle)
                    }
                    n if n & 0xFFF0 == 0xFFF0 => nack(),
                    n => ack(collect((n as usize + 1) * 2 + 1, Step::ErasePages)),
                }
            }
            Step::ErasePages => {
                let (pages, chk) = frame.split_at(frame.len() - 1);
                if checksum(pages) != chk[0] {
                    return nack();
                }

                for p in pages.chunks(2) {
                    let start = u16::from_be_bytes([p[0], p[1]]) as usize * PAGE_SIZE;
                    if start + PAGE_SIZE > FLASH_SIZE {
                        return nack();
                    }
                    self.memory[start..start + PAGE_SIZE]
                        .iter_mut()
                        .for_each(|b| *b = 0xFF);
                }

                reply(SPI_ACK, self.erase_busy, Phase::Idle)
            }
            Step::GoAddress => match self.address(frame) {
                Some(a) => {
                    self.jumped_to = Some(a);
                    ack(Phase::Off)
                }
                None => nack(),
            },
            Step::ProtectCount => {
                if frame[0] ^ frame[1] != 0xFF {
                    return nack();
                }
                ack(collect(frame[0] as usize + 2, Step::ProtectPages))
            }
            Step::ProtectPages => {
                let (pages, chk) = frame.split_at(frame.len() - 1);
                if checksum(pages) != chk[0] {
                    return nack();
                }

                self.protected_pages = pages.to_vec();
                let next = self.reset();
                ack(next)
            }
        }
    }

    fn address(&self, frame: &[u8]) -> Option<u32> {
        if checksum(&frame[..4]) != frame[4] {
            return None;
        }

        let a = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
        self.offset(a, 1).map(|_| a)
    }

    fn offset(&self, address: u32, len: usize) -> Option<usize> {
        let o = address.checked_sub(FLASH_BASE)? as usize;
        if o + len <= FLASH_SIZE {
            Some(o)
        } else {
            None
        }
    }

    fn erase_all(&mut self) {
        self.memory.iter_mut().for_each(|b| *b = 0xFF);
    }

    /// Phase the device restarts in after a reset
    fn reset(&mut self) -> Phase {
        self.resets += 1;
        if self.off_after_reset {
            Phase::Off
        } else {
            Phase::Unsynced
        }
    }
}

fn reply(byte: u8, busy: u32, then: Phase) -> Phase {
    // The first poll only loads the reply
    Phase::Reply {
        byte,
        busy: busy + 1,
        then: Box::new(then),
    }
}

fn ack(then: Phase) -> Phase {
    reply(SPI_ACK, 0, then)
}

fn nack() -> Phase {
    reply(SPI_NACK, 0, Phase::Idle)
}

fn respond(data: Vec<u8>, then: Phase) -> Phase {
    Phase::Respond {
        data: data.into(),
        then: Box::new(then),
    }
}

fn collect(len: usize, step: Step) -> Phase {
    Phase::Collect { len, step }
}

impl Transfer<u8> for Device {
    type Error = BusFault;

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], BusFault> {
        if self.unplugged {
            return Err(BusFault);
        }

        for w in words.iter_mut() {
            *w = self.clock(*w);
        }
        self.end_transaction();

        Ok(words)
    }
}

impl Write<u8> for Device {
    type Error = BusFault;

    fn write(&mut self, words: &[u8]) -> Result<(), BusFault> {
        if self.unplugged {
            return Err(BusFault);
        }

        for w in words {
            self.clock(*w);
        }
        self.end_transaction();

        Ok(())
    }
}

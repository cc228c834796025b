//! NXP LPC ISP command set.
//!
//! Based on the "UART ISP commands" chapter of the LPC8xx / LPC11xx / LPC17xx
//! user manuals. Only the binary transfer variant of the protocol is
//! covered, parts using UU-encoded data transfers are not supported.

use core::fmt;

/// Autobaud character sent to start synchronization
pub const SYNC_CHAR: u8 = b'?';

/// Reply to the autobaud character, echoed back by the host
pub const SYNC_STRING: &str = "Synchronized";

/// Acknowledgement of the synchronization and crystal frequency lines
pub const SYNC_OK: &str = "OK";

/// Key for the unlock command
pub const UNLOCK_CODE: u32 = 23130;

/// Line terminator for both directions
pub const NEWLINE: &str = "\r\n";

/// Flash and RAM transfers must be a multiple of the word size
pub const WORD_SIZE: u32 = 4;

/// Byte counts accepted by `CopyRAMToFlash`, largest first
pub const COPY_SIZES: [u32; 6] = [4096, 1024, 512, 256, 128, 64];

/// ISP command opcodes
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Opcode {
    /// Unlocks the flash write, erase and go commands.
    Unlock,

    /// Changes the UART baud rate. The new rate applies after the response.
    SetBaudRate,

    /// Enables or disables echo of received characters.
    Echo,

    /// Downloads data to RAM.
    WriteToRam,

    /// Reads data from RAM or flash memory.
    ReadMemory,

    /// Must be executed before erase or copy for the same sector range.
    PrepareSectors,

    /// Programs flash from the RAM staging buffer.
    CopyRamToFlash,

    /// Executes a program residing in RAM or flash.
    Go,

    /// Erases one or more sectors of on-chip flash.
    EraseSectors,

    /// Checks whether one or more sectors are blank.
    BlankCheckSectors,

    /// Reads the part identification number.
    ReadPartId,

    /// Reads the boot code version.
    ReadBootVersion,

    /// Compares two memory regions of the same size.
    Compare,

    /// Reads the 128-bit device serial number.
    ReadUid,

    /// Computes a CRC-32 over a block of RAM or flash.
    ReadCrc,
}

impl Opcode {
    /// Command character on the wire
    pub fn code(&self) -> char {
        match self {
            Opcode::Unlock => 'U',
            Opcode::SetBaudRate => 'B',
            Opcode::Echo => 'A',
            Opcode::WriteToRam => 'W',
            Opcode::ReadMemory => 'R',
            Opcode::PrepareSectors => 'P',
            Opcode::CopyRamToFlash => 'C',
            Opcode::Go => 'G',
            Opcode::EraseSectors => 'E',
            Opcode::BlankCheckSectors => 'I',
            Opcode::ReadPartId => 'J',
            Opcode::ReadBootVersion => 'K',
            Opcode::Compare => 'M',
            Opcode::ReadUid => 'N',
            Opcode::ReadCrc => 'S',
        }
    }

    /// Commands refused by the bootloader until `Unlock` has succeeded
    pub fn requires_unlock(&self) -> bool {
        match self {
            Opcode::CopyRamToFlash | Opcode::EraseSectors | Opcode::Go => true,
            _ => false,
        }
    }

    /// Commands touching flash, these get the longer flash timeout
    pub fn is_slow(&self) -> bool {
        match self {
            Opcode::PrepareSectors
            | Opcode::CopyRamToFlash
            | Opcode::EraseSectors
            | Opcode::BlankCheckSectors
            | Opcode::ReadCrc => true,
            _ => false,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}

/// Execution mode for the `Go` command
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum GoMode {
    Thumb,
    Arm,
}

/// A single ISP command with its decimal arguments
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    Unlock,
    SetBaudRate { baud: u32, stop_bits: u8 },
    Echo(bool),
    WriteToRam { address: u32, count: u32 },
    ReadMemory { address: u32, count: u32 },
    PrepareSectors { start: usize, end: usize },
    CopyRamToFlash { flash: u32, ram: u32, count: u32 },
    Go { address: u32, mode: GoMode },
    EraseSectors { start: usize, end: usize },
    BlankCheckSectors { start: usize, end: usize },
    ReadPartId,
    ReadBootVersion,
    Compare { first: u32, second: u32, count: u32 },
    ReadUid,
    ReadCrc { address: u32, count: u32 },
}

impl Command {
    pub fn opcode(&self) -> Opcode {
        match self {
            Command::Unlock => Opcode::Unlock,
            Command::SetBaudRate { .. } => Opcode::SetBaudRate,
            Command::Echo(_) => Opcode::Echo,
            Command::WriteToRam { .. } => Opcode::WriteToRam,
            Command::ReadMemory { .. } => Opcode::ReadMemory,
            Command::PrepareSectors { .. } => Opcode::PrepareSectors,
            Command::CopyRamToFlash { .. } => Opcode::CopyRamToFlash,
            Command::Go { .. } => Opcode::Go,
            Command::EraseSectors { .. } => Opcode::EraseSectors,
            Command::BlankCheckSectors { .. } => Opcode::BlankCheckSectors,
            Command::ReadPartId => Opcode::ReadPartId,
            Command::ReadBootVersion => Opcode::ReadBootVersion,
            Command::Compare { .. } => Opcode::Compare,
            Command::ReadUid => Opcode::ReadUid,
            Command::ReadCrc { .. } => Opcode::ReadCrc,
        }
    }

    /// Render the command line, without terminator
    pub fn line(&self) -> String {
        let c = self.opcode().code();

        match self {
            Command::Unlock => format!("{} {}", c, UNLOCK_CODE),
            Command::SetBaudRate { baud, stop_bits } => format!("{} {} {}", c, baud, stop_bits),
            Command::Echo(on) => format!("{} {}", c, *on as u8),
            Command::WriteToRam { address, count }
            | Command::ReadMemory { address, count }
            | Command::ReadCrc { address, count } => format!("{} {} {}", c, address, count),
            Command::PrepareSectors { start, end }
            | Command::EraseSectors { start, end }
            | Command::BlankCheckSectors { start, end } => format!("{} {} {}", c, start, end),
            Command::CopyRamToFlash { flash, ram, count } => {
                format!("{} {} {} {}", c, flash, ram, count)
            }
            Command::Go { address, mode } => {
                let m = match mode {
                    GoMode::Thumb => 'T',
                    GoMode::Arm => 'A',
                };
                format!("{} {} {}", c, address, m)
            }
            Command::Compare {
                first,
                second,
                count,
            } => format!("{} {} {} {}", c, first, second, count),
            Command::ReadPartId | Command::ReadBootVersion | Command::ReadUid => c.to_string(),
        }
    }
}

/// Status returned by the bootloader for each command
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ReturnCode {
    Success,
    InvalidCommand,
    SrcAddrError,
    DstAddrError,
    SrcAddrNotMapped,
    DstAddrNotMapped,
    CountError,
    InvalidSector,
    SectorNotBlank,
    SectorNotPrepared,
    CompareError,
    Busy,
    ParamError,
    AddrError,
    AddrNotMapped,
    Locked,
    InvalidCode,
    InvalidBaudRate,
    InvalidStopBit,
    CodeReadProtectionEnabled,
    UserCodeChecksum,
    EfroNoPower,
    FlashNoPower,
    FlashNoClock,
    ReinvokeIspConfig,
    NoValidImage,
    FaimNoPower,
    FaimNoClock,
    Unknown(u32),
}

impl From<u32> for ReturnCode {
    fn from(code: u32) -> Self {
        use ReturnCode::*;

        match code {
            0x00 => Success,
            0x01 => InvalidCommand,
            0x02 => SrcAddrError,
            0x03 => DstAddrError,
            0x04 => SrcAddrNotMapped,
            0x05 => DstAddrNotMapped,
            0x06 => CountError,
            0x07 => InvalidSector,
            0x08 => SectorNotBlank,
            0x09 => SectorNotPrepared,
            0x0A => CompareError,
            0x0B => Busy,
            0x0C => ParamError,
            0x0D => AddrError,
            0x0E => AddrNotMapped,
            0x0F => Locked,
            0x10 => InvalidCode,
            0x11 => InvalidBaudRate,
            0x12 => InvalidStopBit,
            0x13 => CodeReadProtectionEnabled,
            0x15 => UserCodeChecksum,
            0x17 => EfroNoPower,
            0x18 => FlashNoPower,
            0x1B => FlashNoClock,
            0x1C => ReinvokeIspConfig,
            0x1D => NoValidImage,
            0x1E => FaimNoPower,
            0x1F => FaimNoClock,
            other => Unknown(other),
        }
    }
}

impl ReturnCode {
    /// Parse a return code line
    pub fn parse(line: &str) -> Option<Self> {
        line.trim().parse::<u32>().ok().map(ReturnCode::from)
    }

    pub fn is_success(&self) -> bool {
        *self == ReturnCode::Success
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReturnCode::Unknown(code) => write!(f, "unknown return code {}", code),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Parse a decimal payload line
pub(crate) fn parse_u32(line: &str) -> Option<u32> {
    line.trim().parse::<u32>().ok()
}

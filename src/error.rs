use thiserror::Error;

use crate::protocol::{Opcode, ReturnCode};
use crate::session::State;

/// Errors validating or looking up a chip definition
#[derive(Clone, Debug, PartialEq, Error)]
pub enum GeometryError {
    #[error("unknown part id 0x{0:08x}")]
    UnknownPart(u32),

    #[error("unknown part name {0}")]
    UnknownName(String),

    #[error("part {name}: {reason}")]
    Invalid { name: String, reason: String },

    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: String },
}

/// Errors building an image or a sector plan
#[derive(Clone, Debug, PartialEq, Error)]
pub enum ImageError {
    #[error("data at 0x{address:08x} overlaps an existing segment")]
    Overlap { address: u32 },

    #[error("{len} bytes at 0x{address:08x} fall outside flash")]
    OutOfRange { address: u32, len: usize },
}

/// Why a write was abandoned
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum AbortReason {
    /// The caller asked to stop at a sector boundary
    Cancelled,
    /// A sector failed verification on every attempt
    SectorWriteFailed,
    /// The RAM staging buffer never matched the local CRC
    ChecksumMismatch,
    /// The link timed out or returned garbage
    Transport,
    /// The bootloader rejected a command
    Command(ReturnCode),
    Other,
}

impl core::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            AbortReason::Command(code) => write!(f, "command failed ({})", code),
            other => write!(f, "{:?}", other),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error<SerialError> {
    #[error("serial port error: {0:?}")]
    Serial(SerialError),

    #[error("timeout waiting for bootloader response")]
    TransportTimeout,

    #[error("framing error: {0}")]
    Framing(String),

    #[error("synchronization failed after {0} attempts")]
    SyncFailed(u32),

    #[error("command {command} failed: {cause}")]
    CommandFailure { command: Opcode, cause: ReturnCode },

    #[error("session is {0:?}")]
    NotReady(State),

    #[error("command {0} requires unlock")]
    NotUnlocked(Opcode),

    #[error("CRC mismatch staging data for sector {sector}")]
    ChecksumMismatch { sector: usize },

    #[error("writing sector {sector} failed")]
    SectorWriteFailed { sector: usize },

    #[error("sector {sector} failed verification")]
    VerifyFailed { sector: usize },

    #[error("erasing sector {sector} failed: {cause}")]
    EraseFailed { sector: usize, cause: ReturnCode },

    #[error("operation aborted: {reason}")]
    Aborted { reason: AbortReason },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Geometry(#[from] GeometryError),

    #[error(transparent)]
    Image(#[from] ImageError),
}

impl<SerialError> Error<SerialError> {
    /// Link level failures, these leave the session unusable
    pub fn is_transport(&self) -> bool {
        match self {
            Error::Serial(_) | Error::TransportTimeout | Error::Framing(_) => true,
            _ => false,
        }
    }

    /// Device reported cause, if any
    pub fn cause(&self) -> Option<ReturnCode> {
        match self {
            Error::CommandFailure { cause, .. } | Error::EraseFailed { cause, .. } => Some(*cause),
            _ => None,
        }
    }

    pub(crate) fn abort_reason(&self) -> AbortReason {
        match self {
            e if e.is_transport() => AbortReason::Transport,
            Error::SectorWriteFailed { .. } | Error::VerifyFailed { .. } => {
                AbortReason::SectorWriteFailed
            }
            Error::ChecksumMismatch { .. } => AbortReason::ChecksumMismatch,
            Error::Aborted { reason } => *reason,
            e => match e.cause() {
                Some(code) => AbortReason::Command(code),
                None => AbortReason::Other,
            },
        }
    }
}

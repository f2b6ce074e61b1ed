//! Error taxonomy for the checkpoint core.
//!
//! Every variant here is recoverable: failures are absorbed at the boundary
//! where they occur, logged, and counted. None of them crosses a transit
//! boundary or stops the process.

use std::io;

/// Serial channel failures. The cycle yields no sample.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Port was never opened, or was closed after a disconnect
    #[error("serial port not open")]
    NotOpen,

    /// Request could not be written
    #[error("serial write failed: {0}")]
    Write(#[source] io::Error),

    /// Link failed while waiting for the response
    #[error("serial read failed: {0}")]
    Read(#[source] io::Error),

    /// No byte arrived within the total timeout
    #[error("no response within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Port could not be opened
    #[error("failed to open {device}: {message}")]
    Open { device: String, message: String },
}

impl ChannelError {
    /// Stable label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ChannelError::NotOpen => "not_open",
            ChannelError::Write(_) => "write",
            ChannelError::Read(_) => "read",
            ChannelError::Timeout { .. } => "timeout",
            ChannelError::Open { .. } => "open",
        }
    }
}

/// Frames that arrived but cannot be used. The frame is ignored.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame too short: {len} bytes, need {min}")]
    ShortFrame { len: usize, min: usize },

    #[error("unexpected address 0x{found:02X}, expected 0x{expected:02X}")]
    UnexpectedAddress { expected: u8, found: u8 },

    #[error("unexpected command 0x{found:02X}, expected 0x{expected:02X}")]
    UnexpectedCommand { expected: u8, found: u8 },

    #[error("device exception 0x{code:02X} for command 0x{command:02X}")]
    DeviceException { command: u8, code: u8 },

    #[error("crc mismatch: frame 0x{found:04X}, computed 0x{computed:04X}")]
    CrcMismatch { found: u16, computed: u16 },

    #[error("xor checksum mismatch: frame 0x{found:02X}, computed 0x{computed:02X}")]
    XorMismatch { found: u8, computed: u8 },

    #[error("bad frame header")]
    BadHeader,

    #[error("bad frame trailer")]
    BadTrailer,

    #[error("declared length {len} out of range")]
    BadLength { len: usize },

    #[error("unknown reader command 0x{command:02X}")]
    UnknownCommand { command: u8 },
}

/// Malformed tag frame. The record is excluded from the batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("tag frame too short: {len} bytes")]
    Truncated { len: usize },

    #[error("not a tag frame (command 0x{command:02X})")]
    NotTagFrame { command: u8 },

    #[error("checksum mismatch: frame 0x{found:02X}, computed 0x{computed:02X}")]
    Checksum { found: u8, computed: u8 },

    #[error("{field} length {len} overruns frame")]
    FieldOverrun { field: &'static str, len: usize },

    #[error("tag has empty TID")]
    EmptyTid,

    #[error(transparent)]
    Frame(#[from] ProtocolError),
}

/// Messaging hand-off failures. The batch is cleared without counting.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("messaging client not connected")]
    NotConnected,

    #[error("publish queue full")]
    QueueFull,

    #[error("publisher stopped")]
    Closed,

    #[error("report serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Reader control command could not be queued
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReaderError {
    #[error("reader command queue full")]
    QueueFull,

    #[error("reader client stopped")]
    Closed,

    #[error("reader not connected")]
    NotConnected,
}

/// Configuration rejected by validation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config field `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid { field, reason: reason.into() }
    }
}

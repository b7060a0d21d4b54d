//! Protocol error types

use thiserror::Error;

/// Decode-side protocol errors. All of these are fatal to a session.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// I/O error while reading a frame (includes EOF mid-frame)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Op-phase header carried a version other than 0x0111
    #[error("unsupported protocol version {0:#06x}")]
    UnsupportedVersion(u16),

    /// Op-phase header carried an unrecognized code
    #[error("unknown op code {0:#06x}")]
    UnknownOpCode(u16),

    /// URB-phase header carried an unrecognized command
    #[error("unknown URB command {0:#010x}")]
    UnknownUrbCommand(u32),

    /// Direction field was neither 0 (OUT) nor 1 (IN)
    #[error("invalid transfer direction {0}")]
    InvalidDirection(u32),

    /// Buffer length beyond what any real URB uses
    #[error("transfer buffer length {0} exceeds limit")]
    OversizedTransfer(u32),

    /// Isochronous packet count beyond what any real URB uses
    #[error("isochronous packet count {0} exceeds limit")]
    TooManyIsoPackets(u32),

    /// Bus id string does not fit the fixed 32-byte field
    #[error("bus id of {0} bytes does not fit the 32-byte field")]
    BusIdTooLong(usize),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

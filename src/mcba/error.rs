//! Error types for the Microchip CAN BUS Analyzer protocol.

use thiserror::Error;

#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
pub enum Error {
    /// Record is not exactly one protocol message long
    #[error("Invalid Message Length: {0}")]
    MessageLength(usize),
    /// DLC field larger than 8 after masking
    #[error("Invalid DLC: {0}")]
    InvalidDlc(u8),
    #[error("Unknown Command: 0x{0:02X}")]
    UnknownCommand(u8),
    /// Known command id, but not the one the decoder was asked for
    #[error("Unexpected Command: 0x{0:02X}")]
    UnexpectedCommand(u8),
    #[error("Invalid Controller: {0}")]
    InvalidController(u8),
    #[error("Unsupported Bitrate: {0}")]
    UnsupportedBitrate(u32),
    #[error("No Receive Transfers Submitted")]
    NoReceiveTransfers,
}

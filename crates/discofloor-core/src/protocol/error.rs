//! Bus protocol errors.

use thiserror::Error;

/// Errors that can occur while driving the floor bus.
#[derive(Error, Debug)]
pub enum BusError {
    #[error("Serial port error: {0}")]
    SerialError(String),

    #[error("Not connected to the floor")]
    NotConnected,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("No nodes responded to addressing")]
    NoNodesFound,

    #[error("Addressing aborted after {corrections} corrections")]
    TooManyCorrections { corrections: u32 },

    #[error("CRC mismatch: expected {expected:#06x}, got {actual:#06x}")]
    CrcMismatch { expected: u16, actual: u16 },

    #[error("A message is already in flight")]
    MessageInFlight,

    #[error("No message is open")]
    NoMessageStarted,

    #[error("Message body exceeds the declared length ({declared} bytes)")]
    BodyOverrun { declared: usize },

    #[error("Body length mismatch: expected {expected} bytes, got {actual}")]
    BodyLength { expected: usize, actual: usize },

    #[error("Message body too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

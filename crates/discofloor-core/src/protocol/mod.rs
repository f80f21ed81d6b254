//! Multi-drop bus protocol.
//!
//! Implements the master side of the floor's half-duplex serial bus:
//! frame codec with CRC-16, dynamic node addressing over the daisy-chain
//! enable line, and the cyclic color-update / sensor-poll protocol.

pub mod crc;
mod error;
mod master;
pub mod message;
pub mod parser;
pub mod response;
pub mod transport;

pub use error::BusError;
pub use master::{BusConfig, BusEvent, BusHandle, BusMaster, MessageOptions, Stage};
pub use message::{Command, Message, MessageFlags, BROADCAST_ADDRESS};
pub use parser::{MessageParser, ParseState};
pub use response::ResponseCollector;
pub use transport::{list_ports, BusTransport, DaisyLine, LineState, PortInfo, SerialTransport};

/// Baud rate the floor nodes run at.
pub const DEFAULT_BAUD_RATE: u32 = 250_000;

/// Quiet time before a missing response byte is default-filled, in
/// milliseconds. Short: the turnaround happens many times per second.
pub const RESPONSE_TIMEOUT_MS: u64 = 50;

/// Quiet time that ends an addressing pass, in milliseconds.
pub const ADDRESSING_TIMEOUT_MS: u64 = 1_500;

/// Settle delay after reset and between addressing passes, in
/// milliseconds.
pub const ADDRESSING_SETTLE_MS: u64 = 500;

/// Address corrections tolerated before addressing aborts.
pub const MAX_ADDRESS_CORRECTIONS: u32 = 10;

/// Highest assignable node address. 255 would collide with the start
/// marker during the address exchange.
pub const MAX_NODES: u8 = 254;

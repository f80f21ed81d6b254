//! Bus message model and wire encoding.
//!
//! Every transmission on the floor bus is a `Message`. On the wire a
//! message is the two-byte start marker followed by the escaped header,
//! body and CRC trailer:
//!
//! ```text
//! 0xFF 0xFF <flags> <dest> <command> [<nodeCount>] <len> <body...> <crcHi> <crcLo>
//! ```
//!
//! The `nodeCount` byte is only present in batch mode, where the body
//! carries `len` bytes for each node in address order. The CRC covers the
//! logical header and body bytes (everything after the start marker,
//! before escaping).
//!
//! Because the start marker is a repeated `0xFF`, a literal `0xFF` (or the
//! escape byte itself) inside the frame is escaped as `ESC` followed by
//! the byte XOR `0x20`. Escaping is purely a wire-level transform: it is
//! applied after the CRC is computed and removed before the parser's CRC
//! check.

use serde::{Deserialize, Serialize};

use super::crc::Crc16;
use super::error::BusError;

/// Start-of-message marker byte; two in a row open a frame.
pub const SOM: u8 = 0xFF;

/// Escape byte for literal `0xFF`/`0xFE` inside a frame.
pub const ESC: u8 = 0xFE;

/// XOR applied to an escaped byte.
pub const ESC_XOR: u8 = 0x20;

/// Destination address that targets every node on the bus.
pub const BROADCAST_ADDRESS: u8 = 0;

/// Command codes understood by the floor nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Command {
    /// Drop assigned address and return to the unaddressed state.
    Reset = 0xFA,
    /// Dynamic address assignment exchange.
    Address = 0xFB,
    /// No-op, used to flush the bus back to a known state.
    Null = 0xFF,
    /// Set a node's RGB color (3-byte body per node).
    SetColor = 0xA1,
    /// Ask nodes to sample their touch sensor (1-byte body per node).
    RunSensor = 0xA2,
    /// Collect the sampled touch values (1-byte response per node).
    GetSensorValue = 0xA3,
}

impl Command {
    /// Convert from the wire code.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0xFA => Some(Self::Reset),
            0xFB => Some(Self::Address),
            0xFF => Some(Self::Null),
            0xA1 => Some(Self::SetColor),
            0xA2 => Some(Self::RunSensor),
            0xA3 => Some(Self::GetSensorValue),
            _ => None,
        }
    }

    /// The wire code for this command.
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// The two header flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MessageFlags {
    /// The body carries one slot of data per node, in address order.
    pub batch_mode: bool,
    /// Nodes append a reply stream after the frame.
    pub response_expected: bool,
}

impl MessageFlags {
    const BATCH_MODE: u8 = 0b0000_0001;
    const RESPONSE_EXPECTED: u8 = 0b0000_0010;

    /// Pack into the header flags byte.
    pub fn bits(self) -> u8 {
        let mut bits = 0;
        if self.batch_mode {
            bits |= Self::BATCH_MODE;
        }
        if self.response_expected {
            bits |= Self::RESPONSE_EXPECTED;
        }
        bits
    }

    /// Unpack from the header flags byte. Unknown bits are rejected.
    pub fn from_bits(bits: u8) -> Option<Self> {
        if bits & !(Self::BATCH_MODE | Self::RESPONSE_EXPECTED) != 0 {
            return None;
        }
        Some(Self {
            batch_mode: bits & Self::BATCH_MODE != 0,
            response_expected: bits & Self::RESPONSE_EXPECTED != 0,
        })
    }
}

/// A single bus transmission.
///
/// Constructed fresh per exchange and never mutated after its CRC is
/// finalized by [`Message::to_wire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Header flags.
    pub flags: MessageFlags,
    /// Destination node address, or [`BROADCAST_ADDRESS`].
    pub destination: u8,
    /// Command code.
    pub command: Command,
    /// Node slot count; only meaningful in batch mode.
    pub node_count: u8,
    /// Declared body length: bytes per node in batch mode, total otherwise.
    /// For response-expected messages this is the expected reply length and
    /// the master-side body is empty.
    pub per_node_len: u8,
    /// Message body (empty for response-expected messages).
    pub body: Vec<u8>,
}

impl Message {
    /// A message addressed to a single node.
    pub fn unicast(destination: u8, command: Command, body: Vec<u8>) -> Result<Self, BusError> {
        if body.len() > u8::MAX as usize {
            return Err(BusError::MessageTooLarge(body.len()));
        }
        Ok(Self {
            flags: MessageFlags::default(),
            destination,
            command,
            node_count: 0,
            per_node_len: body.len() as u8,
            body,
        })
    }

    /// A message broadcast to every node, with one shared body.
    pub fn broadcast(command: Command, body: Vec<u8>) -> Result<Self, BusError> {
        Self::unicast(BROADCAST_ADDRESS, command, body)
    }

    /// A batch message carrying `per_node_len` bytes for each of
    /// `node_count` nodes, concatenated in address order.
    pub fn batch(command: Command, node_count: u8, per_node_len: u8, body: Vec<u8>) -> Result<Self, BusError> {
        let expected = usize::from(node_count) * usize::from(per_node_len);
        if body.len() != expected {
            return Err(BusError::BodyLength {
                expected,
                actual: body.len(),
            });
        }
        Ok(Self {
            flags: MessageFlags {
                batch_mode: true,
                response_expected: false,
            },
            destination: BROADCAST_ADDRESS,
            command,
            node_count,
            per_node_len,
            body,
        })
    }

    /// A batch message asking every node for a `per_node_len`-byte reply.
    /// The master sends no body; nodes append the reply stream.
    pub fn batch_response(command: Command, node_count: u8, per_node_len: u8) -> Self {
        Self {
            flags: MessageFlags {
                batch_mode: true,
                response_expected: true,
            },
            destination: BROADCAST_ADDRESS,
            command,
            node_count,
            per_node_len,
            body: Vec::new(),
        }
    }

    /// The logical header bytes (after the start marker, before escaping).
    pub fn header_bytes(&self) -> Vec<u8> {
        let mut header = vec![self.flags.bits(), self.destination, self.command.code()];
        if self.flags.batch_mode {
            header.push(self.node_count);
        }
        header.push(self.per_node_len);
        header
    }

    /// The body slice for one node of a batch message.
    pub fn node_body(&self, index: u8) -> Option<&[u8]> {
        if !self.flags.batch_mode || index >= self.node_count {
            return None;
        }
        let per = usize::from(self.per_node_len);
        let start = usize::from(index) * per;
        self.body.get(start..start + per)
    }

    /// Serialize to the complete wire frame: start marker, escaped header
    /// and body, escaped CRC trailer. The returned buffer is written to
    /// the transport in a single call.
    pub fn to_wire(&self) -> Vec<u8> {
        let header = self.header_bytes();
        let mut crc = Crc16::new();
        crc.update_slice(&header);
        crc.update_slice(&self.body);
        let crc = crc.value();

        let mut wire = Vec::with_capacity(4 + header.len() + self.body.len() + 2);
        wire.push(SOM);
        wire.push(SOM);
        for &b in header.iter().chain(self.body.iter()) {
            push_escaped(&mut wire, b);
        }
        push_escaped(&mut wire, (crc >> 8) as u8);
        push_escaped(&mut wire, (crc & 0xFF) as u8);
        wire
    }
}

/// Append one logical byte to a wire buffer, escaping if needed.
pub(crate) fn push_escaped(wire: &mut Vec<u8>, byte: u8) {
    if byte == SOM || byte == ESC {
        wire.push(ESC);
        wire.push(byte ^ ESC_XOR);
    } else {
        wire.push(byte);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn unicast_wire_layout() {
        let msg = Message::unicast(0x02, Command::SetColor, vec![0x12, 0x34, 0x56]).unwrap();
        assert_eq!(
            msg.to_wire(),
            vec![0xFF, 0xFF, 0x00, 0x02, 0xA1, 0x03, 0x12, 0x34, 0x56, 0x84, 0x91]
        );
    }

    #[test]
    fn broadcast_destination_is_zero() {
        let msg = Message::broadcast(Command::Reset, vec![]).unwrap();
        assert_eq!(msg.destination, BROADCAST_ADDRESS);
        let wire = msg.to_wire();
        assert_eq!(&wire[..2], &[SOM, SOM]);
        assert_eq!(wire[3], 0x00);
    }

    #[test]
    fn batch_header_carries_node_count() {
        let msg = Message::batch(Command::SetColor, 2, 3, vec![1, 2, 3, 4, 5, 6]).unwrap();
        let header = msg.header_bytes();
        assert_eq!(header, vec![0x01, 0x00, 0xA1, 2, 3]);
        assert_eq!(msg.node_body(1), Some(&[4u8, 5, 6][..]));
        assert_eq!(msg.node_body(2), None);
    }

    #[test]
    fn batch_body_length_is_checked() {
        let err = Message::batch(Command::SetColor, 2, 3, vec![1, 2, 3]).unwrap_err();
        assert!(matches!(err, BusError::BodyLength { expected: 6, actual: 3 }));
    }

    #[test]
    fn command_round_trips_through_code() {
        for cmd in [
            Command::Reset,
            Command::Address,
            Command::Null,
            Command::SetColor,
            Command::RunSensor,
            Command::GetSensorValue,
        ] {
            assert_eq!(Command::from_u8(cmd.code()), Some(cmd));
        }
        assert_eq!(Command::from_u8(0x42), None);
    }

    #[test]
    fn flags_round_trip() {
        for (batch, resp) in [(false, false), (true, false), (false, true), (true, true)] {
            let flags = MessageFlags {
                batch_mode: batch,
                response_expected: resp,
            };
            assert_eq!(MessageFlags::from_bits(flags.bits()), Some(flags));
        }
        assert_eq!(MessageFlags::from_bits(0b100), None);
    }

    #[test]
    fn body_marker_bytes_are_escaped() {
        let msg = Message::unicast(0x01, Command::SetColor, vec![0xFF, 0xFE, 0x10]).unwrap();
        let wire = msg.to_wire();
        // No unescaped 0xFF may appear after the start marker.
        assert!(!wire[2..].contains(&SOM));
        let expected_body = [ESC, SOM ^ ESC_XOR, ESC, ESC ^ ESC_XOR, 0x10];
        let body_start = 6; // marker (2) + flags, dest, cmd, len
        assert_eq!(&wire[body_start..body_start + expected_body.len()], &expected_body);
    }

    #[test]
    fn null_command_in_header_is_escaped() {
        let msg = Message::broadcast(Command::Null, vec![]).unwrap();
        let wire = msg.to_wire();
        // 0xFF command byte must not look like a start marker.
        assert_eq!(&wire[..2], &[SOM, SOM]);
        assert!(!wire[2..].contains(&SOM));
    }
}

//! Byte-at-a-time frame parser.
//!
//! Turns the raw incoming byte stream into validated [`Message`]s. The
//! parser is a small state machine fed one byte at a time; it unescapes
//! the wire stream, runs the CRC engine over every header and body byte
//! as it arrives, and only emits a message once the trailer CRC matches.
//!
//! A raw `0xFF` inside a frame is impossible on a well-formed wire (the
//! serializer escapes it), so seeing one mid-frame means the parser is
//! desynchronized; it re-arms on the marker instead of swallowing it.
//! A receive timeout resets any message stuck before completion.

use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder};
use tracing::{trace, warn};

use super::crc::Crc16;
use super::message::{Command, Message, MessageFlags, ESC, ESC_XOR, SOM};

/// Default timeout before an incomplete frame is abandoned.
pub const RECEIVE_TIMEOUT: Duration = Duration::from_millis(500);

/// Parser states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    /// Hunting for the first marker byte.
    WaitSom1,
    /// One marker byte seen, waiting for the second.
    WaitSom2,
    /// Collecting header bytes.
    Header,
    /// Collecting body bytes.
    Body,
    /// Collecting the two CRC trailer bytes.
    Crc,
    /// A complete, CRC-valid message was just emitted.
    Ready,
    /// The frame was discarded (CRC mismatch or malformed header).
    Aborted,
}

/// Incremental frame parser.
pub struct MessageParser {
    state: ParseState,
    receive_timeout: Duration,
    last_byte_at: Option<Instant>,
    escaped: bool,

    header_pos: usize,
    flags: MessageFlags,
    destination: u8,
    command: Option<Command>,
    node_count: u8,
    per_node_len: u8,

    body_expected: usize,
    body: Vec<u8>,
    crc: Crc16,
    crc_hi: u8,
    crc_pos: usize,
}

impl MessageParser {
    /// Create a parser with the default receive timeout.
    pub fn new() -> Self {
        Self::with_timeout(RECEIVE_TIMEOUT)
    }

    /// Create a parser with a custom receive timeout.
    pub fn with_timeout(receive_timeout: Duration) -> Self {
        Self {
            state: ParseState::WaitSom1,
            receive_timeout,
            last_byte_at: None,
            escaped: false,
            header_pos: 0,
            flags: MessageFlags::default(),
            destination: 0,
            command: None,
            node_count: 0,
            per_node_len: 0,
            body_expected: 0,
            body: Vec::new(),
            crc: Crc16::new(),
            crc_hi: 0,
            crc_pos: 0,
        }
    }

    /// Current parser state.
    pub fn state(&self) -> ParseState {
        self.state
    }

    /// Abandon any partial frame and return to marker hunting.
    pub fn reset(&mut self) {
        self.state = ParseState::WaitSom1;
        self.escaped = false;
        self.header_pos = 0;
        self.flags = MessageFlags::default();
        self.destination = 0;
        self.command = None;
        self.node_count = 0;
        self.per_node_len = 0;
        self.body.clear();
        self.body_expected = 0;
        self.crc = Crc16::new();
        self.crc_pos = 0;
    }

    /// Feed one wire byte. Returns a message when the trailer CRC of a
    /// complete frame checks out.
    pub fn feed(&mut self, byte: u8) -> Option<Message> {
        let now = Instant::now();
        if self.mid_frame() {
            if let Some(last) = self.last_byte_at {
                if now.duration_since(last) > self.receive_timeout {
                    trace!("receive timeout, dropping partial frame");
                    self.reset();
                }
            }
        }
        self.last_byte_at = Some(now);

        match self.state {
            ParseState::WaitSom1 | ParseState::Ready | ParseState::Aborted => {
                self.state = if byte == SOM {
                    ParseState::WaitSom2
                } else {
                    ParseState::WaitSom1
                };
                None
            }
            ParseState::WaitSom2 => {
                if byte == SOM {
                    self.begin_frame();
                } else {
                    self.state = ParseState::WaitSom1;
                }
                None
            }
            ParseState::Header | ParseState::Body | ParseState::Crc => {
                // Unescape before the logical state machine sees the byte.
                if self.escaped {
                    self.escaped = false;
                    self.accept(byte ^ ESC_XOR)
                } else if byte == ESC {
                    self.escaped = true;
                    None
                } else if byte == SOM {
                    // Raw marker mid-frame: we are desynchronized. Re-arm
                    // on it rather than corrupting the frame.
                    warn!("start marker inside frame, re-arming");
                    self.reset();
                    self.state = ParseState::WaitSom2;
                    None
                } else {
                    self.accept(byte)
                }
            }
        }
    }

    /// Feed a slice of wire bytes, collecting any completed messages.
    pub fn feed_slice(&mut self, bytes: &[u8]) -> Vec<Message> {
        bytes.iter().filter_map(|&b| self.feed(b)).collect()
    }

    fn mid_frame(&self) -> bool {
        matches!(
            self.state,
            ParseState::WaitSom2 | ParseState::Header | ParseState::Body | ParseState::Crc
        )
    }

    fn begin_frame(&mut self) {
        self.reset();
        self.state = ParseState::Header;
    }

    /// Process one logical (unescaped) byte.
    fn accept(&mut self, byte: u8) -> Option<Message> {
        match self.state {
            ParseState::Header => {
                self.accept_header(byte);
                None
            }
            ParseState::Body => {
                self.crc.update(byte);
                self.body.push(byte);
                if self.body.len() == self.body_expected {
                    self.state = ParseState::Crc;
                }
                None
            }
            ParseState::Crc => self.accept_crc(byte),
            _ => None,
        }
    }

    fn accept_header(&mut self, byte: u8) {
        self.crc.update(byte);
        let batch = self.flags.batch_mode;
        match (self.header_pos, batch) {
            (0, _) => match MessageFlags::from_bits(byte) {
                Some(flags) => self.flags = flags,
                None => {
                    warn!(flags = byte, "unknown flag bits, dropping frame");
                    self.abort();
                    return;
                }
            },
            // Destination 0 is the master/broadcast address and is valid.
            (1, _) => self.destination = byte,
            (2, _) => match Command::from_u8(byte) {
                Some(cmd) => self.command = Some(cmd),
                None => {
                    warn!(command = byte, "unknown command, dropping frame");
                    self.abort();
                    return;
                }
            },
            (3, true) => self.node_count = byte,
            (3, false) | (4, true) => {
                self.per_node_len = byte;
                self.finish_header();
                return;
            }
            _ => unreachable!("header position out of range"),
        }
        self.header_pos += 1;
    }

    fn finish_header(&mut self) {
        // Response-expected frames declare the reply length; the master
        // side of the frame carries no body.
        self.body_expected = if self.flags.response_expected {
            0
        } else if self.flags.batch_mode {
            usize::from(self.node_count) * usize::from(self.per_node_len)
        } else {
            usize::from(self.per_node_len)
        };
        self.state = if self.body_expected == 0 {
            ParseState::Crc
        } else {
            ParseState::Body
        };
    }

    fn accept_crc(&mut self, byte: u8) -> Option<Message> {
        if self.crc_pos == 0 {
            self.crc_hi = byte;
            self.crc_pos = 1;
            return None;
        }

        let received = BigEndian::read_u16(&[self.crc_hi, byte]);
        let computed = self.crc.value();
        if received != computed {
            warn!("CRC mismatch: expected {computed:#06x}, got {received:#06x}, dropping frame");
            self.abort();
            return None;
        }

        let Some(command) = self.command else {
            self.abort();
            return None;
        };
        let message = Message {
            flags: self.flags,
            destination: self.destination,
            command,
            node_count: self.node_count,
            per_node_len: self.per_node_len,
            body: std::mem::take(&mut self.body),
        };
        self.reset();
        self.state = ParseState::Ready;
        trace!(command = ?message.command, dest = message.destination, "frame complete");
        Some(message)
    }

    fn abort(&mut self) {
        self.reset();
        self.state = ParseState::Aborted;
    }
}

impl Default for MessageParser {
    fn default() -> Self {
        Self::new()
    }
}

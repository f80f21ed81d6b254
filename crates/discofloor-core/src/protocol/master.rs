//! Bus master session and client facade.
//!
//! `BusMaster` owns the serial transport for one floor connection and
//! drives the whole protocol: dynamic addressing over the daisy-chain
//! enable line, the per-frame update cycle (`SET_COLOR` → `RUN_SENSOR` →
//! `GET_SENSOR_VALUE`), and the low-level `start_message` / `send_data` /
//! `end_message` surface the rest of the application builds on.
//!
//! Exactly one message can be open at a time: `start_message` refuses to
//! open a second one, and response-expected messages stay "in flight"
//! until their reply stream has completed or been default-filled. All
//! writes funnel through the single transport the session owns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::floor::{CellSignature, FloorCellList};

use super::crc::Crc16;
use super::error::BusError;
use super::message::{push_escaped, Command, Message, MessageFlags, BROADCAST_ADDRESS, SOM};
use super::response::ResponseCollector;
use super::transport::{BusTransport, DaisyLine, SerialTransport};
use super::{
    ADDRESSING_SETTLE_MS, ADDRESSING_TIMEOUT_MS, DEFAULT_BAUD_RATE, MAX_ADDRESS_CORRECTIONS,
    MAX_NODES, RESPONSE_TIMEOUT_MS,
};

/// Session stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    /// Connected (or not), no bus activity.
    Idle,
    /// Dynamic address assignment in progress.
    Addressing,
    /// The continuous update cycle is running.
    Running,
}

/// Events emitted by the session.
///
/// Subscribe with [`BusMaster::subscribe`]; each subscriber gets every
/// event from the moment it subscribes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusEvent {
    /// The transport is open and configured.
    Connected,
    /// A node was confirmed at this address during discovery.
    NewNode {
        /// The newly assigned address.
        address: u8,
    },
    /// Discovery finished with this many nodes.
    DoneAddressing {
        /// Total confirmed node count.
        node_count: u8,
    },
    /// The session moved between stages.
    StageChange {
        /// Previous stage.
        from: Stage,
        /// New stage.
        to: Stage,
    },
    /// One full update cycle completed (frame-rate accounting hook).
    FloorUpdated,
}

/// Connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Serial device path.
    pub port_name: String,
    /// Baud rate; fixed per protocol revision.
    pub baud_rate: u32,
    /// Quiet time before a missing response byte is default-filled (ms).
    pub response_timeout_ms: u64,
    /// Quiet time that ends an addressing pass (ms).
    pub addressing_timeout_ms: u64,
    /// Settle delay after reset and between addressing passes (ms).
    pub addressing_settle_ms: u64,
    /// Correction pairs tolerated before addressing is aborted.
    pub max_address_corrections: u32,
    /// Delay between update-cycle messages (ms).
    pub inter_message_delay_ms: u64,
    /// Delay after `RUN_SENSOR` so sensors can sample (ms).
    pub sensor_settle_delay_ms: u64,
    /// Run discovery on connect. When false and `node_count` is cached,
    /// discovery is skipped on reconnect.
    pub re_address: bool,
    /// Cached node count used when `re_address` is false.
    pub node_count: Option<u8>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            response_timeout_ms: RESPONSE_TIMEOUT_MS,
            addressing_timeout_ms: ADDRESSING_TIMEOUT_MS,
            addressing_settle_ms: ADDRESSING_SETTLE_MS,
            max_address_corrections: MAX_ADDRESS_CORRECTIONS,
            inter_message_delay_ms: 1,
            sensor_settle_delay_ms: 20,
            re_address: true,
            node_count: None,
        }
    }
}

/// Options for [`BusMaster::start_message`].
#[derive(Debug, Clone, Default)]
pub struct MessageOptions {
    /// Destination node, or broadcast when unset.
    pub destination: Option<u8>,
    /// Send one body slot per node, in address order.
    pub batch_mode: bool,
    /// Collect a reply stream after the frame.
    pub response_expected: bool,
    /// Per-node default reply used to fill silent nodes' slots.
    pub response_default: Vec<u8>,
}

impl MessageOptions {
    /// Address a single node.
    pub fn to(destination: u8) -> Self {
        Self {
            destination: Some(destination),
            ..Self::default()
        }
    }

    /// Batch message, one slot per node.
    pub fn batch() -> Self {
        Self {
            batch_mode: true,
            ..Self::default()
        }
    }

    /// Batch message expecting a reply stream, with the given per-node
    /// default.
    pub fn batch_response(default: &[u8]) -> Self {
        Self {
            batch_mode: true,
            response_expected: true,
            response_default: default.to_vec(),
            ..Self::default()
        }
    }
}

/// The single in-flight outgoing message.
struct TxMessage {
    command: Command,
    flags: MessageFlags,
    per_node_len: u8,
    /// Body bytes the master must supply before `end_message`.
    declared_len: usize,
    sent_len: usize,
    /// Accumulated wire bytes (marker, escaped header and body).
    wire: Vec<u8>,
    crc: Crc16,
    response_default: Vec<u8>,
}

/// Handle for stopping a running update loop from another thread.
#[derive(Clone)]
pub struct BusHandle {
    running: Arc<AtomicBool>,
}

impl BusHandle {
    /// Ask the update loop to stop after the current cycle.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Whether the update loop is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// The master side of one floor bus connection.
pub struct BusMaster {
    config: BusConfig,
    transport: Option<Box<dyn BusTransport>>,
    daisy: DaisyLine,
    stage: Stage,
    node_num: u8,
    tx: Option<TxMessage>,
    last_response: Vec<Vec<u8>>,
    last_sent_signatures: Option<Vec<CellSignature>>,
    sensor_phase: bool,
    sensors_enabled: bool,
    running: Arc<AtomicBool>,
    subscribers: Vec<Sender<BusEvent>>,
    frames: u32,
    fps_window: [u32; 4],
    fps_last_tick: Instant,
}

impl BusMaster {
    /// Create a master for the given configuration (not yet connected).
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            transport: None,
            daisy: DaisyLine::new(),
            stage: Stage::Idle,
            node_num: 0,
            tx: None,
            last_response: Vec::new(),
            last_sent_signatures: None,
            sensor_phase: true,
            sensors_enabled: true,
            running: Arc::new(AtomicBool::new(false)),
            subscribers: Vec::new(),
            frames: 0,
            fps_window: [0; 4],
            fps_last_tick: Instant::now(),
        }
    }

    /// Open the configured serial port and attach it to the session.
    pub fn connect(&mut self) -> Result<(), BusError> {
        if self.transport.is_some() {
            return Err(BusError::AlreadyConnected);
        }
        let transport = SerialTransport::open(&self.config.port_name, Some(self.config.baud_rate))?;
        self.connect_with(Box::new(transport))
    }

    /// Attach an already-open transport (the emulated floor, a test
    /// double) instead of a physical serial port.
    pub fn connect_with(&mut self, mut transport: Box<dyn BusTransport>) -> Result<(), BusError> {
        if self.transport.is_some() {
            return Err(BusError::AlreadyConnected);
        }
        transport.clear_input()?;
        // The daisy line must be low before any traffic.
        transport.set_daisy(false)?;
        transport.drain()?;
        self.daisy = DaisyLine::new();
        self.transport = Some(transport);

        if !self.config.re_address {
            if let Some(count) = self.config.node_count {
                info!(count, "reusing cached node count, skipping discovery");
                self.node_num = count;
            }
        }
        self.emit(BusEvent::Connected);
        Ok(())
    }

    /// Close the connection. Pending messages and timers are dropped and
    /// the session returns to [`Stage::Idle`].
    pub fn disconnect(&mut self) {
        self.transport = None;
        self.tx = None;
        self.node_num = 0;
        self.last_response.clear();
        self.last_sent_signatures = None;
        self.running.store(false, Ordering::SeqCst);
        self.set_stage(Stage::Idle);
        debug!("disconnected");
    }

    /// Whether a transport is attached.
    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    /// Current session stage.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Number of confirmed nodes.
    pub fn node_count(&self) -> u8 {
        self.node_num
    }

    /// Enable or disable the sensor half of the update cycle.
    pub fn set_sensors_enabled(&mut self, enabled: bool) {
        self.sensors_enabled = enabled;
    }

    /// The per-node reply slots collected by the last response-expected
    /// message.
    pub fn message_response(&self) -> &[Vec<u8>] {
        &self.last_response
    }

    /// Subscribe to session events.
    pub fn subscribe(&mut self) -> Receiver<BusEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.push(tx);
        rx
    }

    /// A handle that can stop [`BusMaster::run`] from another thread.
    pub fn handle(&self) -> BusHandle {
        BusHandle {
            running: Arc::clone(&self.running),
        }
    }

    /// Rolling frames-per-second average over the last four seconds.
    pub fn frames_per_second(&self) -> u32 {
        let sum: u32 = self.fps_window.iter().sum();
        sum / self.fps_window.len() as u32
    }

    // ------------------------------------------------------------------
    // Low-level message construction
    // ------------------------------------------------------------------

    /// Open a new outgoing message. Fails if another message is still in
    /// flight.
    ///
    /// `per_node_len` is the body length per node for batch messages, the
    /// total body length otherwise, and the expected per-node reply
    /// length for response-expected messages.
    pub fn start_message(
        &mut self,
        command: Command,
        per_node_len: u8,
        options: MessageOptions,
    ) -> Result<(), BusError> {
        if self.transport.is_none() {
            return Err(BusError::NotConnected);
        }
        if self.tx.is_some() {
            return Err(BusError::MessageInFlight);
        }

        let flags = MessageFlags {
            batch_mode: options.batch_mode,
            response_expected: options.response_expected,
        };
        let destination = options.destination.unwrap_or(BROADCAST_ADDRESS);

        let mut header = vec![flags.bits(), destination, command.code()];
        if flags.batch_mode {
            header.push(self.node_num);
        }
        header.push(per_node_len);

        let mut crc = Crc16::new();
        let mut wire = vec![SOM, SOM];
        for &b in &header {
            crc.update(b);
            push_escaped(&mut wire, b);
        }

        let declared_len = if flags.response_expected {
            0
        } else if flags.batch_mode {
            usize::from(self.node_num) * usize::from(per_node_len)
        } else {
            usize::from(per_node_len)
        };

        self.tx = Some(TxMessage {
            command,
            flags,
            per_node_len,
            declared_len,
            sent_len: 0,
            wire,
            crc,
            response_default: options.response_default,
        });
        Ok(())
    }

    /// Append body bytes to the open message.
    pub fn send_data(&mut self, data: &[u8]) -> Result<(), BusError> {
        let tx = self.tx.as_mut().ok_or(BusError::NoMessageStarted)?;
        if tx.sent_len + data.len() > tx.declared_len {
            return Err(BusError::BodyOverrun {
                declared: tx.declared_len,
            });
        }
        tx.sent_len += data.len();
        for &b in data {
            tx.crc.update(b);
            push_escaped(&mut tx.wire, b);
        }
        Ok(())
    }

    /// Finalize the CRC, write the whole frame to the transport in one
    /// call and wait for it to drain. For response-expected messages this
    /// then runs the response phase (collecting the reply stream,
    /// default-filling silent nodes) before returning; the collected
    /// slots are available from [`BusMaster::message_response`].
    pub fn end_message(&mut self) -> Result<(), BusError> {
        let tx = self.tx.take().ok_or(BusError::NoMessageStarted)?;
        if tx.sent_len != tx.declared_len {
            return Err(BusError::BodyLength {
                expected: tx.declared_len,
                actual: tx.sent_len,
            });
        }

        let mut wire = tx.wire;
        let crc = tx.crc.value();
        push_escaped(&mut wire, (crc >> 8) as u8);
        push_escaped(&mut wire, (crc & 0xFF) as u8);

        let response_timeout = Duration::from_millis(self.config.response_timeout_ms);
        let node_num = self.node_num;
        let transport = self.transport.as_deref_mut().ok_or(BusError::NotConnected)?;

        if tx.flags.response_expected {
            // Stale bytes would shift every reply slot.
            transport.clear_input()?;
        }
        transport.write_all(&wire)?;
        transport.drain()?;
        trace!(command = ?tx.command, bytes = wire.len(), "message sent");

        if tx.flags.response_expected {
            let slots = if tx.flags.batch_mode { node_num } else { 1 };
            let mut collector = ResponseCollector::new(slots, tx.per_node_len, &tx.response_default);
            collect_responses(transport, &mut collector, response_timeout)?;
            self.last_response = collector.into_slots();
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Addressing
    // ------------------------------------------------------------------

    /// Reset and dynamically address every node on the floor.
    ///
    /// Runs a `NULL` flush, a broadcast `RESET`, then two addressing
    /// passes (the second catches nodes that were slow to boot). Each
    /// confirmed node is reported through the event stream as
    /// [`BusEvent::NewNode`]; the final count is returned and also
    /// emitted as [`BusEvent::DoneAddressing`].
    ///
    /// On failure the transport stays open so the caller may retry.
    pub fn assign_addresses(&mut self) -> Result<u8, BusError> {
        if self.transport.is_none() {
            return Err(BusError::NotConnected);
        }
        if self.tx.is_some() {
            return Err(BusError::MessageInFlight);
        }
        self.set_stage(Stage::Addressing);
        let result = self.run_addressing();
        self.set_stage(Stage::Idle);
        result
    }

    fn run_addressing(&mut self) -> Result<u8, BusError> {
        let settle = Duration::from_millis(self.config.addressing_settle_ms);

        // Flush the bus back to a known state, then drop all addresses.
        self.start_message(Command::Null, 0, MessageOptions::default())?;
        self.end_message()?;
        self.start_message(Command::Reset, 0, MessageOptions::default())?;
        self.end_message()?;
        std::thread::sleep(settle);

        self.node_num = 0;
        self.last_sent_signatures = None;

        let first = match self.addressing_pass(0) {
            Ok(count) => count,
            // A correction overflow on the first pass is retried once;
            // the floor sometimes needs a second sweep to settle. Nodes
            // confirmed before the abort keep their addresses, so the
            // retry continues from the partial count.
            Err(BusError::TooManyCorrections { corrections }) => {
                warn!(corrections, "first addressing pass aborted, retrying");
                self.node_num
            }
            Err(e) => return Err(e),
        };
        std::thread::sleep(settle);

        // Second pass continues from the confirmed count and catches
        // stragglers.
        let total = self.addressing_pass(first)?;
        self.node_num = total;

        if total == 0 {
            return Err(BusError::NoNodesFound);
        }
        info!(nodes = total, "addressing complete");
        self.emit(BusEvent::DoneAddressing { node_count: total });
        Ok(total)
    }

    /// One addressing sweep starting from the last confirmed address.
    /// Returns the new confirmed count.
    fn addressing_pass(&mut self, start_from: u8) -> Result<u8, BusError> {
        let timeout = Duration::from_millis(self.config.addressing_timeout_ms);
        let max_corrections = self.config.max_address_corrections;

        let Self {
            transport,
            subscribers,
            daisy,
            node_num,
            ..
        } = self;
        let transport = transport.as_deref_mut().ok_or(BusError::NotConnected)?;

        // Announce the exchange: a response-expected ADDRESS frame whose
        // node-count field carries the address we are continuing from.
        let announce = Message {
            flags: MessageFlags {
                batch_mode: true,
                response_expected: true,
            },
            destination: BROADCAST_ADDRESS,
            command: Command::Address,
            node_count: start_from,
            per_node_len: 2,
            body: Vec::new(),
        };
        transport.clear_input()?;
        transport.write_all(&announce.to_wire())?;
        transport.drain()?;

        // Only the first unaddressed node may speak: raise the enable
        // line, then offer the last confirmed address.
        daisy.set(transport, true)?;
        transport.write_all(&[start_from])?;
        transport.drain()?;

        let mut last_confirmed = start_from;
        let mut corrections: u32 = 0;
        let mut last_activity = Instant::now();
        let mut buf = [0u8; 64];

        let outcome = loop {
            let available = transport.bytes_to_read()?;
            if available > 0 {
                let n = transport.read(&mut buf)?;
                if n == 0 {
                    continue;
                }
                last_activity = Instant::now();
                // The receiver hears our own transmissions too; the reply
                // is the final byte of the chunk.
                let reply = buf[n - 1];

                if reply == last_confirmed.wrapping_add(1) && reply != 0 {
                    last_confirmed = reply;
                    *node_num = reply;
                    corrections = 0;
                    // Confirm by echoing the address; the node passes the
                    // enable signal downstream on hearing it.
                    transport.write_all(&[reply])?;
                    transport.drain()?;
                    trace!(address = reply, "node confirmed");
                    Self::emit_to(subscribers, BusEvent::NewNode { address: reply });
                    if last_confirmed >= MAX_NODES {
                        debug!("address space exhausted, ending discovery");
                        break Ok(last_confirmed);
                    }
                } else {
                    corrections += 1;
                    if corrections > max_corrections {
                        break Err(BusError::TooManyCorrections { corrections });
                    }
                    debug!(
                        reply,
                        expected = last_confirmed.wrapping_add(1),
                        "address correction"
                    );
                    transport.write_all(&[0x00, last_confirmed])?;
                    transport.drain()?;
                }
            } else if last_activity.elapsed() > timeout {
                // Quiet bus: no more unaddressed nodes.
                break Ok(last_confirmed);
            } else {
                std::thread::sleep(Duration::from_millis(1));
            }
        };

        // Terminate the exchange whether it succeeded or not: a marker
        // pair so no node mistakes the tail for an address, then a NULL
        // frame to re-sync every parser, then release the enable line.
        transport.write_all(&[SOM, SOM])?;
        let null = Message::broadcast(Command::Null, Vec::new())?;
        transport.write_all(&null.to_wire())?;
        transport.drain()?;
        daisy.set(transport, false)?;

        outcome
    }

    // ------------------------------------------------------------------
    // Update cycle
    // ------------------------------------------------------------------

    /// Run the continuous update cycle until stopped via [`BusHandle`]
    /// or disconnected.
    ///
    /// A no-op when already running or when no nodes are known.
    pub fn run(&mut self, cells: &mut FloorCellList) -> Result<(), BusError> {
        if self.running.load(Ordering::SeqCst) || self.node_num == 0 {
            return Ok(());
        }
        if self.transport.is_none() {
            return Err(BusError::NotConnected);
        }

        self.running.store(true, Ordering::SeqCst);
        self.set_stage(Stage::Running);

        let mut result = Ok(());
        while self.running.load(Ordering::SeqCst) && self.transport.is_some() {
            if let Err(e) = self.update_cycle(cells) {
                result = Err(e);
                break;
            }
        }

        self.running.store(false, Ordering::SeqCst);
        self.set_stage(Stage::Idle);

        if let Err(BusError::IoError(_) | BusError::SerialError(_)) = &result {
            warn!("transport failure, closing connection");
            self.disconnect();
        }
        result
    }

    /// One full update cycle: colors out, sensors sampled, sensor values
    /// read back into the cells.
    pub fn update_cycle(&mut self, cells: &mut FloorCellList) -> Result<(), BusError> {
        if self.transport.is_none() {
            return Err(BusError::NotConnected);
        }

        cells.update_fades();
        self.send_colors(cells)?;
        self.pause(self.config.inter_message_delay_ms);

        if self.sensors_enabled && self.node_num > 0 {
            self.run_sensors()?;
            self.pause(self.config.sensor_settle_delay_ms);
            self.read_sensors(cells)?;
        }

        self.frame_tick();
        self.emit(BusEvent::FloorUpdated);
        Ok(())
    }

    /// Send the cells' colors. One batch message normally; a single
    /// broadcast when every node wants the identical color; nothing at
    /// all when the floor hasn't changed since the last send.
    fn send_colors(&mut self, cells: &FloorCellList) -> Result<(), BusError> {
        let count = usize::from(self.node_num);
        if count == 0 {
            return Ok(());
        }

        let black = CellSignature {
            color: [0, 0, 0],
            fade: None,
        };
        let signatures: Vec<CellSignature> = (0..count)
            .map(|i| cells.at_index(i).map_or(black.clone(), |c| c.signature()))
            .collect();

        if self.last_sent_signatures.as_ref() == Some(&signatures) {
            trace!("floor unchanged, skipping color update");
            return Ok(());
        }

        let uniform = signatures.iter().all(|s| *s == signatures[0]);
        if uniform {
            // Every node wants the same thing: one broadcast beats a
            // batch body of N identical slots.
            let color = signatures[0].color;
            self.start_message(Command::SetColor, 3, MessageOptions::default())?;
            self.send_data(&color)?;
            self.end_message()?;
        } else {
            self.start_message(Command::SetColor, 3, MessageOptions::batch())?;
            for i in 0..count {
                let color = cells.at_index(i).map_or([0, 0, 0], |c| c.color());
                self.send_data(&color)?;
            }
            self.end_message()?;
        }

        self.last_sent_signatures = Some(signatures);
        Ok(())
    }

    /// Ask half the nodes to sample their touch sensor. Halves alternate
    /// between frames to limit cross-talk between adjacent sensors.
    fn run_sensors(&mut self) -> Result<(), BusError> {
        let count = usize::from(self.node_num);
        self.start_message(Command::RunSensor, 1, MessageOptions::batch())?;
        for i in 0..count {
            let sample = (i % 2 == 0) == self.sensor_phase;
            self.send_data(&[u8::from(sample)])?;
        }
        self.end_message()?;
        self.sensor_phase = !self.sensor_phase;
        Ok(())
    }

    /// Collect the sampled sensor values and fold them into the cells.
    fn read_sensors(&mut self, cells: &mut FloorCellList) -> Result<(), BusError> {
        self.start_message(
            Command::GetSensorValue,
            1,
            MessageOptions::batch_response(&[0xFF]),
        )?;
        self.end_message()?;

        for (i, slot) in self.last_response.iter().enumerate() {
            let Some(&value) = slot.first() else { continue };
            // 0xFF marks a default-filled slot; keep the previous value.
            if value <= 1 {
                if let Some(cell) = cells.at_index_mut(i) {
                    cell.set_sensor_value(value == 1);
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn pause(&self, ms: u64) {
        if ms > 0 {
            std::thread::sleep(Duration::from_millis(ms));
        }
    }

    fn frame_tick(&mut self) {
        self.frames += 1;
        if self.fps_last_tick.elapsed() >= Duration::from_secs(1) {
            self.fps_window.rotate_left(1);
            self.fps_window[3] = self.frames;
            self.frames = 0;
            self.fps_last_tick = Instant::now();
        }
    }

    fn set_stage(&mut self, to: Stage) {
        if self.stage != to {
            let from = self.stage;
            self.stage = to;
            debug!(?from, ?to, "stage change");
            self.emit(BusEvent::StageChange { from, to });
        }
    }

    fn emit(&mut self, event: BusEvent) {
        Self::emit_to(&mut self.subscribers, event);
    }

    fn emit_to(subscribers: &mut Vec<Sender<BusEvent>>, event: BusEvent) {
        subscribers.retain(|s| s.send(event.clone()).is_ok());
    }
}

impl Drop for BusMaster {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Drive one response phase: demultiplex the reply stream into the
/// collector, restarting the quiet timer on every received byte and
/// default-filling the current node's slot when it expires. The fill
/// bytes are echoed onto the bus so downstream nodes keep their slot
/// positions.
fn collect_responses(
    transport: &mut dyn BusTransport,
    collector: &mut ResponseCollector,
    timeout: Duration,
) -> Result<(), BusError> {
    let mut buf = [0u8; 256];
    let mut last_activity = Instant::now();

    while !collector.is_complete() {
        let available = transport.bytes_to_read()?;
        if available > 0 {
            let n = transport.read(&mut buf)?;
            if n > 0 {
                collector.push_slice(&buf[..n]);
                last_activity = Instant::now();
                continue;
            }
        }

        if last_activity.elapsed() > timeout {
            match collector.fill_current_node() {
                Some((slot, fill)) => {
                    trace!(node = slot.node, "response timeout, default fill");
                    transport.write_all(&fill)?;
                    transport.drain()?;
                    last_activity = Instant::now();
                }
                None => break,
            }
        } else {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
    Ok(())
}

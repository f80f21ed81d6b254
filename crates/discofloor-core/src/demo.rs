//! Emulated floor — a simulated node chain for testing and preview mode.
//!
//! Implements [`BusTransport`] so a [`BusMaster`] can drive a full
//! addressing pass and update cycle without any hardware: every byte the
//! master writes is run through the same frame parser the protocol
//! defines, the daisy-chain address exchange is simulated node by node,
//! and sensor replies honor the slot scheme (a node only transmits once
//! every earlier slot has been filled, by a real node or by the master's
//! gap-fill bytes).
//!
//! [`BusMaster`]: crate::protocol::BusMaster

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

use crate::protocol::message::{Command, Message, SOM};
use crate::protocol::parser::MessageParser;
use crate::protocol::transport::BusTransport;

/// How a simulated node (mis)behaves.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeBehavior {
    /// Never replies during addressing, but still passes the enable
    /// signal downstream (a node with dead firmware but live wiring).
    pub mute_addressing: bool,
    /// Never transmits its sensor slot, forcing the master to gap-fill.
    pub silent_sensor: bool,
    /// Number of addressing replies that carry a wrong address before
    /// the node starts behaving (exercises the correction sub-protocol).
    pub wrong_claims: u8,
}

#[derive(Debug)]
struct EmulatedNode {
    behavior: NodeBehavior,
    address: Option<u8>,
    color: [u8; 3],
    /// The "physical" touch state, set from the outside.
    touched: bool,
    /// The value latched by the last RUN_SENSOR it was armed for.
    sensed: bool,
}

impl EmulatedNode {
    fn new(behavior: NodeBehavior) -> Self {
        Self {
            behavior,
            address: None,
            color: [0, 0, 0],
            touched: false,
            sensed: false,
        }
    }
}

/// Streamed-response bookkeeping for one GET_SENSOR_VALUE exchange.
struct ResponsePhase {
    node_count: u8,
    per_node: usize,
    next_slot: u8,
    /// Master fill bytes received toward the current silent slot.
    fill_count: usize,
}

struct FloorSim {
    nodes: Vec<EmulatedNode>,
    parser: MessageParser,
    reply_queue: VecDeque<u8>,
    daisy: bool,
    /// Raw address exchange in progress.
    exchange: bool,
    pending_claim: Option<u8>,
    claiming_node: Option<usize>,
    /// Chain position of the first node not yet done participating.
    chain_pos: usize,
    response: Option<ResponsePhase>,
    rng: StdRng,
    touch_probability: f64,
}

impl FloorSim {
    fn feed(&mut self, byte: u8) {
        if self.exchange {
            if byte == SOM {
                // Terminator: the exchange is over, back to framing.
                self.exchange = false;
                self.pending_claim = None;
                self.claiming_node = None;
                if let Some(msg) = self.parser.feed(byte) {
                    self.handle_frame(msg);
                }
            } else {
                self.exchange_byte(byte);
            }
        } else if self.response.is_some() {
            self.fill_byte(byte);
        } else if let Some(msg) = self.parser.feed(byte) {
            self.handle_frame(msg);
        }
    }

    /// The first enabled node still waiting for an address. Mute nodes
    /// pass the enable signal through without participating.
    fn claimant(&mut self) -> Option<usize> {
        if !self.daisy {
            return None;
        }
        self.nodes
            .iter()
            .enumerate()
            .skip(self.chain_pos)
            .find(|(_, n)| n.address.is_none() && !n.behavior.mute_addressing)
            .map(|(i, _)| i)
    }

    /// One raw byte of the address exchange.
    fn exchange_byte(&mut self, byte: u8) {
        if let Some(claim) = self.pending_claim {
            if byte == claim {
                // Confirmation: the claimant takes the address and passes
                // the enable signal on.
                if let Some(i) = self.claiming_node {
                    self.nodes[i].address = Some(claim);
                    self.chain_pos = i + 1;
                    trace!(node = i, address = claim, "emulated node addressed");
                }
                self.pending_claim = None;
                self.claiming_node = None;
                // The confirmation doubles as the next offer.
                self.offer(byte);
                return;
            }
            // Correction marker or a different offer; either way the
            // claim is dead.
            self.pending_claim = None;
            self.claiming_node = None;
            if byte == 0x00 {
                return; // correction marker, next byte is a fresh offer
            }
        }
        self.offer(byte);
    }

    /// Offer the next address: the enabled unaddressed node claims
    /// `offer + 1` (or something wrong, if so configured).
    fn offer(&mut self, offered: u8) {
        let Some(i) = self.claimant() else { return };
        let node = &mut self.nodes[i];
        let claim = if node.behavior.wrong_claims > 0 {
            node.behavior.wrong_claims -= 1;
            offered.wrapping_add(2)
        } else {
            offered.wrapping_add(1)
        };
        self.pending_claim = Some(claim);
        self.claiming_node = Some(i);
        self.reply_queue.push_back(claim);
    }

    fn handle_frame(&mut self, msg: Message) {
        trace!(command = ?msg.command, "emulated floor got frame");
        match msg.command {
            Command::Reset => {
                for node in &mut self.nodes {
                    node.address = None;
                    node.sensed = false;
                }
                self.chain_pos = 0;
            }
            Command::Address if msg.flags.response_expected => {
                self.exchange = true;
                self.pending_claim = None;
                self.claiming_node = None;
            }
            Command::SetColor => self.apply_colors(&msg),
            Command::RunSensor => self.arm_sensors(&msg),
            Command::GetSensorValue if msg.flags.response_expected => {
                self.response = Some(ResponsePhase {
                    node_count: msg.node_count,
                    per_node: usize::from(msg.per_node_len).max(1),
                    next_slot: 0,
                    fill_count: 0,
                });
                self.pump_responses();
            }
            _ => {}
        }
    }

    fn node_by_address(&mut self, address: u8) -> Option<&mut EmulatedNode> {
        self.nodes
            .iter_mut()
            .find(|n| n.address == Some(address))
    }

    fn apply_colors(&mut self, msg: &Message) {
        if msg.flags.batch_mode {
            for slot in 0..msg.node_count {
                let Some(body) = msg.node_body(slot) else { continue };
                let color = [body[0], body[1], body[2]];
                if let Some(node) = self.node_by_address(slot + 1) {
                    node.color = color;
                }
            }
        } else if msg.body.len() >= 3 {
            let color = [msg.body[0], msg.body[1], msg.body[2]];
            if msg.destination == 0 {
                for node in self.nodes.iter_mut().filter(|n| n.address.is_some()) {
                    node.color = color;
                }
            } else if let Some(node) = self.node_by_address(msg.destination) {
                node.color = color;
            }
        }
    }

    fn arm_sensors(&mut self, msg: &Message) {
        if !msg.flags.batch_mode {
            return;
        }
        for slot in 0..msg.node_count {
            let armed = msg.node_body(slot).is_some_and(|b| b.first() == Some(&1));
            if !armed {
                continue;
            }
            let random_touch = self.touch_probability > 0.0
                && self.rng.gen_bool(self.touch_probability.clamp(0.0, 1.0));
            if let Some(node) = self.node_by_address(slot + 1) {
                node.sensed = node.touched || random_touch;
            }
        }
    }

    /// Let every node whose turn has come transmit its sensor slot.
    /// Stops at the first silent node; the master's gap-fill bytes move
    /// the slot cursor past it (see [`FloorSim::fill_byte`]).
    fn pump_responses(&mut self) {
        let Some(phase) = &mut self.response else { return };
        while phase.next_slot < phase.node_count {
            let address = phase.next_slot + 1;
            let Some(node) = self
                .nodes
                .iter()
                .find(|n| n.address == Some(address))
            else {
                break;
            };
            if node.behavior.silent_sensor {
                break;
            }
            let mut reply = vec![u8::from(node.sensed)];
            reply.resize(phase.per_node, 0);
            self.reply_queue.extend(reply);
            phase.next_slot += 1;
        }
        if phase.next_slot >= phase.node_count {
            self.response = None;
        }
    }

    /// A master byte during a response phase is gap-fill clocking for the
    /// current silent slot.
    fn fill_byte(&mut self, _byte: u8) {
        let Some(phase) = &mut self.response else { return };
        phase.fill_count += 1;
        if phase.fill_count >= phase.per_node {
            phase.fill_count = 0;
            phase.next_slot += 1;
            self.pump_responses();
        }
    }
}

/// A simulated floor of N daisy-chained nodes behind a [`BusTransport`].
pub struct EmulatedFloor {
    state: Arc<Mutex<FloorSim>>,
}

/// Shared view into an [`EmulatedFloor`] after it has been handed to a
/// master, for scripting touches and inspecting node state from tests.
#[derive(Clone)]
pub struct EmulatedFloorHandle {
    state: Arc<Mutex<FloorSim>>,
}

impl EmulatedFloor {
    /// A floor of `node_count` well-behaved nodes.
    pub fn new(node_count: usize) -> Self {
        Self::with_behaviors(vec![NodeBehavior::default(); node_count])
    }

    /// A floor with per-node behaviors, chain order.
    pub fn with_behaviors(behaviors: Vec<NodeBehavior>) -> Self {
        let nodes = behaviors.into_iter().map(EmulatedNode::new).collect();
        Self {
            state: Arc::new(Mutex::new(FloorSim {
                nodes,
                parser: MessageParser::new(),
                reply_queue: VecDeque::new(),
                daisy: false,
                exchange: false,
                pending_claim: None,
                claiming_node: None,
                chain_pos: 0,
                response: None,
                rng: StdRng::from_entropy(),
                touch_probability: 0.0,
            })),
        }
    }

    /// Make armed sensors report random touches with this probability,
    /// for a lively preview floor.
    pub fn with_random_touches(self, probability: f64) -> Self {
        self.state.lock().unwrap().touch_probability = probability;
        self
    }

    /// A handle usable after the floor is boxed into a master.
    pub fn handle(&self) -> EmulatedFloorHandle {
        EmulatedFloorHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl EmulatedFloorHandle {
    /// Press or release a node's touch surface (chain order index).
    pub fn touch(&self, node: usize, touched: bool) {
        if let Some(n) = self.state.lock().unwrap().nodes.get_mut(node) {
            n.touched = touched;
        }
    }

    /// The node's current LED color (chain order index).
    pub fn node_color(&self, node: usize) -> Option<[u8; 3]> {
        self.state.lock().unwrap().nodes.get(node).map(|n| n.color)
    }

    /// The node's assigned bus address, if any (chain order index).
    pub fn node_address(&self, node: usize) -> Option<u8> {
        self.state.lock().unwrap().nodes.get(node).and_then(|n| n.address)
    }

    /// How many nodes hold an address.
    pub fn addressed_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .nodes
            .iter()
            .filter(|n| n.address.is_some())
            .count()
    }
}

impl BusTransport for EmulatedFloor {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let mut sim = self.state.lock().unwrap();
        for &b in data {
            sim.feed(b);
        }
        Ok(())
    }

    fn drain(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn bytes_to_read(&mut self) -> io::Result<u32> {
        Ok(self.state.lock().unwrap().reply_queue.len() as u32)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut sim = self.state.lock().unwrap();
        let mut n = 0;
        while n < buf.len() {
            match sim.reply_queue.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.state.lock().unwrap().reply_queue.clear();
        Ok(())
    }

    fn set_daisy(&mut self, enabled: bool) -> io::Result<()> {
        self.state.lock().unwrap().daisy = enabled;
        Ok(())
    }
}

//! # DiscoFloor Core Library
//!
//! Core functionality for the DiscoFloor dance floor controller.

#![warn(missing_docs)]

//!
//! This library provides:
//! - The multi-drop bus protocol engine (frame codec, CRC-16, dynamic
//!   node addressing, cyclic color/sensor updates)
//! - The floor cell abstraction consumed by light show programs
//! - An emulated floor for hardware-free testing and preview mode
//!
//! ## Example
//!
//! ```rust,ignore
//! use discofloor_core::prelude::*;
//!
//! let mut master = BusMaster::new(BusConfig {
//!     port_name: "/dev/ttyUSB0".into(),
//!     ..BusConfig::default()
//! });
//! master.connect()?;
//!
//! // Discover the floor
//! let node_count = master.assign_addresses()?;
//! let mut cells = FloorCellList::new(node_count as usize, 8);
//!
//! // Drive it
//! cells.set_all_colors([0, 64, 128]);
//! master.run(&mut cells)?;
//! ```

pub mod demo;
pub mod floor;
pub mod protocol;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::demo::{EmulatedFloor, EmulatedFloorHandle, NodeBehavior};
    pub use crate::floor::{CellSignature, FadeController, FloorCell, FloorCellList};
    pub use crate::protocol::{
        BusConfig, BusError, BusEvent, BusHandle, BusMaster, Command, Message, MessageFlags,
        MessageOptions, Stage,
    };
}

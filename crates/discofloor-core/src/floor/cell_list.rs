//! The dense, address-ordered collection of floor cells.

use std::time::Duration;

use super::cell::{CellSignature, FloorCell};

/// All cells of the floor, indexed by node address order.
///
/// The bus session reads colors from here to build `SET_COLOR` payloads
/// and writes touch-sensor values back after each sensor cycle; the light
/// show programs read and write colors through the same list.
#[derive(Debug, Clone, Default)]
pub struct FloorCellList {
    cells: Vec<FloorCell>,
}

impl FloorCellList {
    /// Build a list of `count` cells laid out in a grid `width` cells
    /// wide, row-major.
    pub fn new(count: usize, width: usize) -> Self {
        let width = width.max(1);
        let cells = (0..count)
            .map(|i| FloorCell::new(i, i % width, i / width))
            .collect();
        Self { cells }
    }

    /// Number of cells.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether the floor has no cells.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// The cell at a node index.
    pub fn at_index(&self, index: usize) -> Option<&FloorCell> {
        self.cells.get(index)
    }

    /// Mutable access to the cell at a node index.
    pub fn at_index_mut(&mut self, index: usize) -> Option<&mut FloorCell> {
        self.cells.get_mut(index)
    }

    /// Iterate over the cells in address order.
    pub fn iter(&self) -> impl Iterator<Item = &FloorCell> {
        self.cells.iter()
    }

    /// Iterate mutably over the cells in address order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut FloorCell> {
        self.cells.iter_mut()
    }

    /// Set every cell to the same color, stopping any fades.
    pub fn set_all_colors(&mut self, color: [u8; 3]) {
        for cell in &mut self.cells {
            cell.set_color(color);
        }
    }

    /// Start the same fade on every cell.
    pub fn fade_all_to_color(&mut self, color: [u8; 3], duration: Duration) {
        for cell in &mut self.cells {
            cell.fade_to_color(color, duration);
        }
    }

    /// Advance all running fades to the current time.
    pub fn update_fades(&mut self) {
        for cell in &mut self.cells {
            cell.update_color();
        }
    }

    /// The per-cell signatures, address order.
    pub fn signatures(&self) -> Vec<CellSignature> {
        self.cells.iter().map(FloorCell::signature).collect()
    }

    /// The shared signature when every cell currently has the same one.
    pub fn uniform_signature(&self) -> Option<CellSignature> {
        let first = self.cells.first()?.signature();
        self.cells
            .iter()
            .skip(1)
            .all(|c| c.signature() == first)
            .then_some(first)
    }
}

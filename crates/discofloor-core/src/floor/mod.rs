//! Floor cell abstraction.
//!
//! The light show programs and the UI only ever see cells: a color, a
//! fade handle, and a touch-sensor boolean per square. The bus session
//! translates between this view and the wire protocol.

mod cell;
mod cell_list;
mod fade;

pub use cell::{CellSignature, FloorCell};
pub use cell_list::FloorCellList;
pub use fade::FadeController;

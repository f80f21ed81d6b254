//! A single floor square.

use std::time::Duration;

use super::fade::FadeController;

/// The derived key used to decide whether a node's desired state changed
/// since the last message sent to it: current color plus, when fading,
/// the fade target and duration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CellSignature {
    /// Current RGB color.
    pub color: [u8; 3],
    /// Fade target and total duration in milliseconds, when mid-fade.
    pub fade: Option<([u8; 3], u64)>,
}

/// Represents a single square on the floor.
#[derive(Debug, Clone)]
pub struct FloorCell {
    index: usize,
    x: usize,
    y: usize,
    color: [u8; 3],
    sensor: bool,
    fade: FadeController,
}

impl FloorCell {
    /// A new cell at the given index and grid position.
    pub fn new(index: usize, x: usize, y: usize) -> Self {
        Self {
            index,
            x,
            y,
            color: [0, 0, 0],
            sensor: false,
            fade: FadeController::new(),
        }
    }

    /// The cell's node index (0-based, address order).
    pub fn index(&self) -> usize {
        self.index
    }

    /// Grid position.
    pub fn position(&self) -> (usize, usize) {
        (self.x, self.y)
    }

    /// Current RGB color.
    pub fn color(&self) -> [u8; 3] {
        self.color
    }

    /// Set the cell to a specific color, stopping any running fade.
    pub fn set_color(&mut self, color: [u8; 3]) {
        if self.fade.is_fading() {
            self.fade.stop_fade();
        }
        self.color = color;
    }

    /// Start fading from the current color to `to` over `duration`.
    pub fn fade_to_color(&mut self, to: [u8; 3], duration: Duration) {
        self.fade.start_fade(self.color, to, duration);
    }

    /// Whether the cell is mid-fade.
    pub fn is_fading(&self) -> bool {
        self.fade.is_fading()
    }

    /// If the cell is fading, advance the color for the current time.
    pub fn update_color(&mut self) {
        if self.fade.is_fading() {
            self.color = self.fade.current_color();
        }
    }

    /// The cell's touch sensor state, as last reported by the node.
    pub fn sensor_value(&self) -> bool {
        self.sensor
    }

    /// Record a touch sensor reading collected from the bus.
    pub fn set_sensor_value(&mut self, touched: bool) {
        self.sensor = touched;
    }

    /// The cell's current signature (see [`CellSignature`]).
    pub fn signature(&self) -> CellSignature {
        CellSignature {
            color: self.color,
            fade: self
                .fade
                .target_color()
                .map(|target| (target, self.fade.duration().as_millis() as u64)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_color_stops_fade() {
        let mut cell = FloorCell::new(0, 0, 0);
        cell.fade_to_color([255, 0, 0], Duration::from_secs(10));
        assert!(cell.is_fading());
        cell.set_color([0, 255, 0]);
        assert!(!cell.is_fading());
        assert_eq!(cell.color(), [0, 255, 0]);
    }

    #[test]
    fn signature_tracks_color_and_fade() {
        let mut cell = FloorCell::new(0, 0, 0);
        cell.set_color([1, 2, 3]);
        assert_eq!(
            cell.signature(),
            CellSignature {
                color: [1, 2, 3],
                fade: None
            }
        );

        cell.fade_to_color([9, 9, 9], Duration::from_millis(250));
        assert_eq!(cell.signature().fade, Some(([9, 9, 9], 250)));
    }

    #[test]
    fn sensor_value_round_trips() {
        let mut cell = FloorCell::new(3, 1, 1);
        assert!(!cell.sensor_value());
        cell.set_sensor_value(true);
        assert!(cell.sensor_value());
    }
}

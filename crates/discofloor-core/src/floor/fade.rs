//! Timed RGB fades.
//!
//! Fading happens on the master: the fade controller interpolates a
//! cell's color toward a target over a duration, and the bus session
//! streams the interpolated colors to the node every frame.

use std::time::{Duration, Instant};

/// Manages the fading of one cell's three color channels.
#[derive(Debug, Clone)]
pub struct FadeController {
    fading: bool,
    /// Remaining fade time in milliseconds.
    remaining_ms: f64,
    /// Original fade duration, kept for signature computation.
    duration: Duration,
    target: [u8; 3],
    current: [f64; 3],
    /// Per-channel change per millisecond.
    increments: [f64; 3],
    last_update: Instant,
}

impl FadeController {
    /// A controller with no fade in progress.
    pub fn new() -> Self {
        Self {
            fading: false,
            remaining_ms: 0.0,
            duration: Duration::ZERO,
            target: [0, 0, 0],
            current: [0.0, 0.0, 0.0],
            increments: [0.0, 0.0, 0.0],
            last_update: Instant::now(),
        }
    }

    /// Whether a fade is currently running.
    pub fn is_fading(&self) -> bool {
        self.fading
    }

    /// The color being faded to, if a fade is running.
    pub fn target_color(&self) -> Option<[u8; 3]> {
        self.fading.then_some(self.target)
    }

    /// The total duration of the running fade.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Begin a new fade from `from` to `to` over `duration`.
    pub fn start_fade(&mut self, from: [u8; 3], to: [u8; 3], duration: Duration) {
        self.fading = true;
        self.duration = duration;
        self.remaining_ms = duration.as_secs_f64() * 1000.0;
        self.current = [f64::from(from[0]), f64::from(from[1]), f64::from(from[2])];
        self.target = to;
        self.last_update = Instant::now();
        self.recompute_increments();
    }

    /// Change the target mid-fade; the remaining time is kept.
    pub fn retarget(&mut self, to: [u8; 3]) {
        if self.fading {
            self.target = to;
            self.recompute_increments();
        }
    }

    /// Stop the fade, jumping to the target color.
    pub fn stop_fade(&mut self) -> [u8; 3] {
        self.fading = false;
        self.current = [
            f64::from(self.target[0]),
            f64::from(self.target[1]),
            f64::from(self.target[2]),
        ];
        self.target
    }

    /// Advance the fade by the wall-clock time since the last call and
    /// return the color at the current increment.
    pub fn current_color(&mut self) -> [u8; 3] {
        if !self.fading {
            return self.target;
        }

        let now = Instant::now();
        let elapsed_ms = now.duration_since(self.last_update).as_secs_f64() * 1000.0;
        if elapsed_ms >= 1.0 {
            self.remaining_ms -= elapsed_ms;
            for i in 0..3 {
                self.current[i] += self.increments[i] * elapsed_ms;
                let target = f64::from(self.target[i]);
                // Clamp each channel once it reaches its target.
                if (self.increments[i] > 0.0 && self.current[i] >= target)
                    || (self.increments[i] < 0.0 && self.current[i] <= target)
                {
                    self.current[i] = target;
                    self.increments[i] = 0.0;
                }
            }
            if self.remaining_ms <= 0.0 {
                return self.stop_fade();
            }
            self.last_update = now;
        }

        [
            self.current[0].round().clamp(0.0, 255.0) as u8,
            self.current[1].round().clamp(0.0, 255.0) as u8,
            self.current[2].round().clamp(0.0, 255.0) as u8,
        ]
    }

    fn recompute_increments(&mut self) {
        self.increments = [0.0, 0.0, 0.0];
        if self.remaining_ms > 0.0 {
            for i in 0..3 {
                let diff = f64::from(self.target[i]) - self.current[i];
                if diff != 0.0 {
                    self.increments[i] = diff / self.remaining_ms;
                }
            }
        }
    }
}

impl Default for FadeController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_fading_by_default() {
        let fade = FadeController::new();
        assert!(!fade.is_fading());
        assert_eq!(fade.target_color(), None);
    }

    #[test]
    fn zero_duration_fade_completes_immediately() {
        let mut fade = FadeController::new();
        fade.start_fade([0, 0, 0], [255, 128, 0], Duration::ZERO);
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(fade.current_color(), [255, 128, 0]);
        assert!(!fade.is_fading());
    }

    #[test]
    fn fade_reaches_target() {
        let mut fade = FadeController::new();
        fade.start_fade([0, 0, 0], [100, 200, 50], Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(fade.current_color(), [100, 200, 50]);
        assert!(!fade.is_fading());
    }

    #[test]
    fn fade_moves_toward_target() {
        let mut fade = FadeController::new();
        fade.start_fade([0, 0, 0], [200, 200, 200], Duration::from_millis(500));
        std::thread::sleep(Duration::from_millis(20));
        let color = fade.current_color();
        assert!(fade.is_fading());
        assert!(color[0] > 0 && color[0] < 200, "mid-fade color: {color:?}");
    }

    #[test]
    fn stop_fade_jumps_to_target() {
        let mut fade = FadeController::new();
        fade.start_fade([0, 0, 0], [9, 9, 9], Duration::from_secs(60));
        assert_eq!(fade.stop_fade(), [9, 9, 9]);
        assert!(!fade.is_fading());
    }
}

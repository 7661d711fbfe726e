//! Movement gate
//!
//! Classifies a stream of linear-acceleration samples as "moving" or "still"
//! using the mean magnitude over a short rolling window, so a single spike
//! (a notification buzz, a bumped table) does not count as movement.

use std::collections::VecDeque;

use crate::config::MovementConfig;

/// Rolling motion-magnitude classifier
#[derive(Debug, Clone)]
pub struct MovementGate {
    config: MovementConfig,
    magnitudes: VecDeque<f64>,
    moving: bool,
}

impl Default for MovementGate {
    fn default() -> Self {
        Self::new(MovementConfig::default())
    }
}

impl MovementGate {
    pub fn new(config: MovementConfig) -> Self {
        Self {
            magnitudes: VecDeque::with_capacity(config.window_size),
            config,
            moving: false,
        }
    }

    /// Feed one acceleration sample (m/s², gravity removed) and return the
    /// current classification
    pub fn push(&mut self, x: f64, y: f64, z: f64) -> bool {
        let magnitude = (x * x + y * y + z * z).sqrt();
        if !magnitude.is_finite() {
            return self.moving;
        }

        if self.magnitudes.len() >= self.config.window_size {
            self.magnitudes.pop_front();
        }
        self.magnitudes.push_back(magnitude);

        let mean = self.magnitudes.iter().sum::<f64>() / self.magnitudes.len() as f64;
        self.moving =
            self.magnitudes.len() >= self.config.min_samples && mean > self.config.threshold;
        self.moving
    }

    pub fn is_moving(&self) -> bool {
        self.moving
    }

    /// Drop all samples, e.g. when the sensor stops
    pub fn reset(&mut self) {
        self.magnitudes.clear();
        self.moving = false;
    }
}

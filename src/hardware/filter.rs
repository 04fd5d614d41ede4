//! Moving-average smoothing of sensor readings.

use super::telemetry::{Channel, DeviceSnapshot};
use std::collections::VecDeque;

/// Largest accepted window.
pub const MAX_FILTER_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub struct SensorFilter {
    size: usize,
    history: [VecDeque<f64>; 4],
}

impl SensorFilter {
    /// `size` is clamped to `1..=MAX_FILTER_SIZE`.
    pub fn new(size: usize) -> Self {
        let size = size.clamp(1, MAX_FILTER_SIZE);
        Self {
            size,
            history: std::array::from_fn(|_| VecDeque::with_capacity(size)),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn reset(&mut self) {
        for window in &mut self.history {
            window.clear();
        }
    }

    /// Replace each sensor reading with the mean of the last `size` readings.
    pub fn apply(&mut self, snapshot: &mut DeviceSnapshot) {
        for channel in Channel::ALL {
            let window = &mut self.history[channel.index()];
            let state = &mut snapshot.channels[channel.index()];
            if window.len() == self.size {
                window.pop_front();
            }
            window.push_back(state.sensor_reading);
            state.sensor_reading = window.iter().sum::<f64>() / window.len() as f64;
        }
    }
}

//! Well volume bookkeeping.
//!
//! Solution wells (1-4) drain and waste wells (5-8) fill at the rates of a
//! [`FlowStatus`]. Volumes are in µL, rates in nL/s.

use super::flow::FlowStatus;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const UL_PER_NL: f64 = 0.001;

/// Well capacities.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WellConfig {
    /// Volume of a full solution well and capacity of a waste well (µL).
    pub capacity_ul: f64,
    /// Waste volume that raises the warning (µL).
    pub waste_warning_ul: f64,
}

impl Default for WellConfig {
    fn default() -> Self {
        Self {
            capacity_ul: 16_000.0,
            waste_warning_ul: 15_000.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WellTracker {
    config: WellConfig,
    solution_ul: [f64; 4],
    waste_ul: [f64; 4],
}

impl WellTracker {
    /// Full solution wells, empty waste wells.
    pub fn new(config: WellConfig) -> Self {
        Self {
            config,
            solution_ul: [config.capacity_ul; 4],
            waste_ul: [0.0; 4],
        }
    }

    /// Integrate `flows` over `elapsed`.
    pub fn tick(&mut self, flows: &FlowStatus, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        for (remaining, rate) in self.solution_ul.iter_mut().zip(&flows.wells[..4]) {
            *remaining = (*remaining - UL_PER_NL * rate.abs() * secs).max(0.0);
        }
        for (filled, rate) in self.waste_ul.iter_mut().zip(&flows.wells[4..]) {
            *filled += UL_PER_NL * rate.abs() * secs;
        }
    }

    pub fn solution_remaining(&self) -> [f64; 4] {
        self.solution_ul
    }

    pub fn waste_volume(&self) -> [f64; 4] {
        self.waste_ul
    }

    /// Solution wells (zero-based) that ran dry.
    pub fn depleted(&self) -> Vec<usize> {
        self.solution_ul
            .iter()
            .enumerate()
            .filter(|(_, v)| **v <= 0.0)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn waste_warning(&self) -> bool {
        self.waste_ul
            .iter()
            .any(|v| *v > self.config.waste_warning_ul)
    }

    /// Time until the fullest waste well reaches capacity at `flows`.
    ///
    /// `None` when that well is not filling.
    pub fn time_to_waste_full(&self, flows: &FlowStatus) -> Option<Duration> {
        let (index, filled) = self
            .waste_ul
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))?;
        let rate = flows.wells[4 + index].abs();
        if rate <= 0.0 {
            return None;
        }
        let secs = ((self.config.capacity_ul - filled) / (UL_PER_NL * rate)).max(0.0);
        Some(Duration::from_secs_f64(secs))
    }

    pub fn refill_solution(&mut self, well: usize) {
        if let Some(v) = self.solution_ul.get_mut(well) {
            *v = self.config.capacity_ul;
        }
    }

    pub fn empty_waste(&mut self) {
        self.waste_ul = [0.0; 4];
    }
}

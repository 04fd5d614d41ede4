//! Poiseuille flow estimates for the pipette.
//!
//! `Q = π (s·D)^4 ΔP / (128 μ Δx)` in m³/s, reported in nL/s. Pressure
//! differentials are given as `100 * mbar`.

use super::percent::Setpoints;
use crate::hardware::telemetry::{Channel, Valve};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Squareness modifier of the pipette channels.
pub const SQUARE_CHANNEL_MOD: f64 = 1.128;
/// Pipe diameter (m).
pub const PIPE_DIAMETER: f64 = 0.00003;
/// Dynamic viscosity of water (Pa·s).
pub const DYNAMIC_VISCOSITY: f64 = 0.00089;
/// Reference pressure differential (100 * mbar).
pub const DEFAULT_DELTA_PRESSURE: f64 = -14600.0;
/// Pipe length from the wells to the tip (m).
pub const LENGTH_TO_TIP: f64 = 0.065;
/// Pipe length from the wells to the confinement zone (m).
pub const LENGTH_TO_ZONE: f64 = 0.124;

const MBAR_SCALE: f64 = 100.0;
const NL_PER_M3: f64 = 1e12;

/// Laminar flow through one pipe, in nL/s.
pub fn get_flow(
    square_channel_mod: f64,
    pipe_diameter: f64,
    delta_pressure: f64,
    dynamic_viscosity: f64,
    pipe_length: f64,
) -> f64 {
    let effective_diameter = square_channel_mod * pipe_diameter;
    let flow_m3_per_s = PI * effective_diameter.powi(4) * delta_pressure
        / (128.0 * dynamic_viscosity * pipe_length);
    flow_m3_per_s * NL_PER_M3
}

/// [`get_flow`] with the PPC1 pipette constants.
pub fn get_flow_simple(delta_pressure: f64, pipe_length: f64) -> f64 {
    get_flow(
        SQUARE_CHANNEL_MOD,
        PIPE_DIAMETER,
        delta_pressure,
        DYNAMIC_VISCOSITY,
        pipe_length,
    )
}

/// [`get_flow`] with every default argument.
pub fn default_flow() -> f64 {
    get_flow_simple(DEFAULT_DELTA_PRESSURE, LENGTH_TO_ZONE)
}

/// Pipe lengths used by the well model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipeGeometry {
    pub length_to_tip: f64,
    pub length_to_zone: f64,
}

impl Default for PipeGeometry {
    fn default() -> Self {
        Self {
            length_to_tip: LENGTH_TO_TIP,
            length_to_zone: LENGTH_TO_ZONE,
        }
    }
}

impl PipeGeometry {
    pub fn validate(&self) -> Result<(), String> {
        if self.length_to_tip <= 0.0 || self.length_to_zone <= 0.0 {
            return Err("Pipe lengths must be positive".into());
        }
        Ok(())
    }
}

/// Solution well selected for delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Solution {
    S1,
    S2,
    S3,
    S4,
}

impl Solution {
    pub const ALL: [Solution; 4] = [Solution::S1, Solution::S2, Solution::S3, Solution::S4];

    /// Zero-based well index.
    pub fn index(self) -> usize {
        match self {
            Solution::S1 => 0,
            Solution::S2 => 1,
            Solution::S3 => 2,
            Solution::S4 => 3,
        }
    }

    /// Valve that releases this solution.
    pub fn valve(self) -> Valve {
        match self {
            Solution::S1 => Valve::L,
            Solution::S2 => Valve::K,
            Solution::S3 => Valve::J,
            Solution::S4 => Valve::I,
        }
    }

    /// Slot number 1..=4.
    pub fn from_slot(slot: u8) -> Option<Self> {
        match slot {
            1 => Some(Solution::S1),
            2 => Some(Solution::S2),
            3 => Some(Solution::S3),
            4 => Some(Solution::S4),
            _ => None,
        }
    }
}

/// Estimated flows (nL/s) for one set of channel set points.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct FlowStatus {
    pub inflow_recirculation: f64,
    pub inflow_switch: f64,
    pub solution_usage_off: f64,
    pub solution_usage_on: f64,
    pub outflow_on: f64,
    pub outflow_off: f64,
    pub in_out_ratio_on: f64,
    pub in_out_ratio_off: f64,
    /// Outflow for the current delivery state.
    pub outflow_total: f64,
    pub in_out_ratio_total: f64,
    /// Wells 1-4 are solutions, 5-6 switch waste, 7-8 recirculation waste.
    pub wells: [f64; 8],
}

/// Evaluate the well model for `setpoints` with `active` solution (if any).
pub fn estimate_flows(
    setpoints: &Setpoints,
    geometry: &PipeGeometry,
    active: Option<Solution>,
) -> FlowStatus {
    let v_recirc = -setpoints.get(Channel::A);
    let v_switch = -setpoints.get(Channel::B);
    let p_off = setpoints.get(Channel::C);
    let p_on = setpoints.get(Channel::D);
    let tip = geometry.length_to_tip;
    let zone = geometry.length_to_zone;

    let inflow_recirculation = 2.0 * get_flow_simple(MBAR_SCALE * v_recirc, tip);
    let inflow_switch = 2.0
        * get_flow_simple(
            MBAR_SCALE * (v_recirc + 2.0 * p_off * (1.0 - zone / tip)),
            tip,
        );
    let solution_usage_off = get_flow_simple(MBAR_SCALE * 2.0 * p_off, 2.0 * zone);
    let solution_usage_on = get_flow_simple(MBAR_SCALE * p_on, tip);
    let outflow_on = get_flow_simple(
        MBAR_SCALE * (p_on + 3.0 * p_off - 2.0 * v_switch),
        tip,
    );
    let outflow_off = 2.0
        * get_flow_simple(MBAR_SCALE * (4.0 * p_off - 2.0 * v_switch), 2.0 * zone);

    let ratio = |outflow: f64| {
        if inflow_recirculation == 0.0 {
            0.0
        } else {
            outflow / inflow_recirculation
        }
    };
    let in_out_ratio_on = ratio(outflow_on);
    let in_out_ratio_off = ratio(outflow_off);

    let mut wells = [0.0; 8];
    for solution in Solution::ALL {
        wells[solution.index()] = if active == Some(solution) {
            solution_usage_on
        } else {
            solution_usage_off
        };
    }
    wells[4] = inflow_switch / 2.0;
    wells[5] = inflow_switch / 2.0;
    wells[6] = inflow_recirculation / 2.0;
    wells[7] = inflow_recirculation / 2.0;

    let (outflow_total, in_out_ratio_total) = if active.is_some() {
        (outflow_on, in_out_ratio_on)
    } else {
        (outflow_off, in_out_ratio_off)
    };

    FlowStatus {
        inflow_recirculation,
        inflow_switch,
        solution_usage_off,
        solution_usage_on,
        outflow_on,
        outflow_off,
        in_out_ratio_on,
        in_out_ratio_off,
        outflow_total,
        in_out_ratio_total,
        wells,
    }
}

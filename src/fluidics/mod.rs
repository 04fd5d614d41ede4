//! Physical model of the pipette: percentage views, flow estimates and well volumes.

pub mod flow;
pub mod percent;
pub mod wells;

pub use flow::{estimate_flows, get_flow, get_flow_simple, FlowStatus, PipeGeometry, Solution};
pub use percent::{DefaultOperatingPoint, PercentLimits, Setpoints};
pub use wells::{WellConfig, WellTracker};

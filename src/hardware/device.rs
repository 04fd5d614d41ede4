//! The operations a PPC1 exposes to the protocol runner.
//!
//! [`Ppc1Controller`](super::ppc1::Ppc1Controller) implements this trait over
//! the serial link and [`SimulatedPpc1`](super::simulated::SimulatedPpc1)
//! implements it in memory, so a protocol can be dry-run with the same code
//! path as a physical run.
//!
//! # Contract
//! - Setters validate first. A rejected request sends nothing and leaves the
//!   commanded state unchanged.
//! - Getters report the live sensor readings while telemetry is flowing and
//!   the last commanded values otherwise.
//! - All methods take `&self`; implementations use interior mutability.

use crate::error::{AppResult, DeviceFault};
use crate::fluidics::flow::Solution;
use crate::fluidics::percent::{
    droplet_size_from, droplet_size_targets, flow_speed_from, flow_speed_targets, vacuum_from,
    vacuum_target, DefaultOperatingPoint, PercentLimits, Setpoints,
};
use crate::hardware::telemetry::{Channel, Valve, ValveBits};
use async_trait::async_trait;

/// Packed valve mask with every supported valve closed.
pub const ALL_VALVES_CLOSED: u8 = 0x0F;

#[async_trait]
pub trait Ppc1Device: Send + Sync {
    /// Set one channel (mbar). Out-of-range values are rejected.
    async fn set_channel(&self, channel: Channel, value: f64) -> AppResult<()>;

    async fn set_valve(&self, valve: Valve, open: bool) -> AppResult<()>;

    /// Set valves i..l at once. Bit set = closed, high bits are ignored.
    async fn set_valves_state(&self, closed_mask: u8) -> AppResult<()>;

    async fn set_ttl_state(&self, high: bool) -> AppResult<()>;

    /// Emit a TTL pulse of `period_ms` (at least 20 ms).
    async fn pulse(&self, period_ms: u32) -> AppResult<()>;

    /// Current level of the sync input.
    async fn sync_input(&self) -> bool;

    /// Sticky fault, if the device was lost.
    fn fault(&self) -> Option<DeviceFault>;

    /// Effective set points.
    async fn setpoints(&self) -> Setpoints;

    /// Effective valve states.
    async fn valves(&self) -> ValveBits;

    /// Reference point for the percentage views.
    async fn operating_point(&self) -> DefaultOperatingPoint;

    fn limits(&self) -> PercentLimits;

    async fn open_all_valves(&self) -> AppResult<()> {
        self.set_valves_state(0x00).await
    }

    async fn close_all_valves(&self) -> AppResult<()> {
        self.set_valves_state(ALL_VALVES_CLOSED).await
    }

    /// Zero every set point and close every valve.
    ///
    /// Every step is attempted even if an earlier one fails; the first error
    /// is returned.
    async fn pumping_off(&self) -> AppResult<()> {
        let mut first_error = None;
        for channel in Channel::ALL {
            if let Err(e) = self.set_channel(channel, 0.0).await {
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = self.close_all_valves().await {
            first_error.get_or_insert(e);
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Open or close the valve feeding `solution`.
    async fn set_solution(&self, solution: Solution, open: bool) -> AppResult<()> {
        self.set_valve(solution.valve(), open).await
    }

    async fn set_droplet_size(&self, percentage: f64) -> AppResult<()> {
        let defaults = self.operating_point().await;
        let targets = droplet_size_targets(percentage, &defaults, &self.limits())?;
        for (channel, value) in targets {
            self.set_channel(channel, value).await?;
        }
        Ok(())
    }

    async fn droplet_size(&self) -> f64 {
        let defaults = self.operating_point().await;
        droplet_size_from(&self.setpoints().await, &defaults)
    }

    async fn change_droplet_size_by(&self, delta: f64) -> AppResult<()> {
        let current = self.droplet_size().await;
        self.set_droplet_size(current + delta).await
    }

    async fn set_flow_speed(&self, percentage: f64) -> AppResult<()> {
        let defaults = self.operating_point().await;
        let targets = flow_speed_targets(percentage, &defaults, &self.limits())?;
        for (channel, value) in targets.iter() {
            self.set_channel(channel, value).await?;
        }
        Ok(())
    }

    async fn flow_speed(&self) -> f64 {
        let defaults = self.operating_point().await;
        flow_speed_from(&self.setpoints().await, &defaults)
    }

    async fn change_flow_speed_by(&self, delta: f64) -> AppResult<()> {
        let current = self.flow_speed().await;
        self.set_flow_speed(current + delta).await
    }

    async fn set_vacuum_percentage(&self, percentage: f64) -> AppResult<()> {
        let defaults = self.operating_point().await;
        let value = vacuum_target(percentage, &defaults, &self.limits())?;
        self.set_channel(Channel::A, value).await
    }

    async fn vacuum_percentage(&self) -> f64 {
        let defaults = self.operating_point().await;
        vacuum_from(&self.setpoints().await, &defaults)
    }

    async fn change_vacuum_percentage_by(&self, delta: f64) -> AppResult<()> {
        let current = self.vacuum_percentage().await;
        self.set_vacuum_percentage(current + delta).await
    }
}

//! In-memory PPC1.
//!
//! Keeps set points, valves and TTL state, applies the same validation as the
//! serial controller and journals the command lines a real device would have
//! received. Used for dry runs of protocols and as a bench device in tests.

use super::device::Ppc1Device;
use super::telemetry::{
    Channel, ChannelState, DeviceSnapshot, SyncState, Valve, ValveBits,
};
use super::wire::{DeviceCommand, MIN_PULSE_PERIOD_MS};
use crate::error::{AppResult, DeviceFault, Ppc1Error};
use crate::fluidics::percent::{check_channel, DefaultOperatingPoint, PercentLimits, Setpoints};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct SimState {
    setpoints: Setpoints,
    valves: ValveBits,
    ttl: bool,
    sync_input: bool,
    journal: Vec<String>,
}

impl SimState {
    fn record(&mut self, command: DeviceCommand) {
        let line = command.to_string();
        debug!(command = %line, "-> simulated PPC1");
        self.journal.push(line);
    }
}

pub struct SimulatedPpc1 {
    defaults: RwLock<DefaultOperatingPoint>,
    limits: PercentLimits,
    state: RwLock<SimState>,
    fault: std::sync::Mutex<Option<DeviceFault>>,
}

impl Default for SimulatedPpc1 {
    fn default() -> Self {
        Self::new(DefaultOperatingPoint::default(), PercentLimits::default())
    }
}

impl SimulatedPpc1 {
    /// All set points zero, all valves closed.
    pub fn new(defaults: DefaultOperatingPoint, limits: PercentLimits) -> Self {
        Self {
            defaults: RwLock::new(defaults),
            limits,
            state: RwLock::new(SimState::default()),
            fault: std::sync::Mutex::new(None),
        }
    }

    pub async fn set_default_operating_point(
        &self,
        defaults: DefaultOperatingPoint,
    ) -> AppResult<()> {
        defaults.validate()?;
        *self.defaults.write().await = defaults;
        Ok(())
    }

    /// Telemetry frame matching the current state, sensors equal to set points.
    pub async fn snapshot(&self) -> DeviceSnapshot {
        let state = self.state.read().await;
        DeviceSnapshot {
            channels: Channel::ALL.map(|channel| ChannelState {
                set_point: state.setpoints.get(channel),
                sensor_reading: state.setpoints.get(channel),
                duty_cycle: 0.0,
                valve_state: false,
            }),
            valves: state.valves,
            sync: SyncState {
                input: state.sync_input,
                output: state.ttl,
            },
            temperature: None,
            received_at: Utc::now(),
        }
    }

    /// Command lines received so far, oldest first.
    pub async fn journal(&self) -> Vec<String> {
        self.state.read().await.journal.clone()
    }

    pub async fn clear_journal(&self) {
        self.state.write().await.journal.clear();
    }

    /// Drive the simulated sync input line.
    pub async fn set_sync_input(&self, high: bool) {
        self.state.write().await.sync_input = high;
    }

    /// Report a device fault from now on, as a lost serial link would.
    pub fn inject_fault(&self, message: impl Into<String>) {
        let fault = DeviceFault::new(message);
        warn!(fault = %fault, "Simulated PPC1 fault injected");
        if let Ok(mut guard) = self.fault.lock() {
            *guard = Some(fault);
        }
    }

    pub fn clear_fault(&self) {
        if let Ok(mut guard) = self.fault.lock() {
            *guard = None;
        }
    }
}

#[async_trait]
impl Ppc1Device for SimulatedPpc1 {
    async fn set_channel(&self, channel: Channel, value: f64) -> AppResult<()> {
        check_channel(channel, value)?;
        let mut state = self.state.write().await;
        state.setpoints.set(channel, value);
        state.record(DeviceCommand::SetChannel(channel, value));
        Ok(())
    }

    async fn set_valve(&self, valve: Valve, open: bool) -> AppResult<()> {
        let mut state = self.state.write().await;
        state.valves.set(valve, open);
        state.record(DeviceCommand::SetValve { valve, open });
        Ok(())
    }

    async fn set_valves_state(&self, closed_mask: u8) -> AppResult<()> {
        let mut state = self.state.write().await;
        state.valves = ValveBits::from_closed_mask(closed_mask);
        state.record(DeviceCommand::ValvesState(closed_mask));
        Ok(())
    }

    async fn set_ttl_state(&self, high: bool) -> AppResult<()> {
        let mut state = self.state.write().await;
        state.ttl = high;
        state.record(DeviceCommand::TtlState(high));
        Ok(())
    }

    async fn pulse(&self, period_ms: u32) -> AppResult<()> {
        if period_ms < MIN_PULSE_PERIOD_MS {
            return Err(Ppc1Error::out_of_range(
                "pulse period (ms)",
                f64::from(period_ms),
                f64::from(MIN_PULSE_PERIOD_MS),
                f64::from(u32::MAX),
            ));
        }
        self.state.write().await.record(DeviceCommand::Pulse(period_ms));
        Ok(())
    }

    async fn sync_input(&self) -> bool {
        self.state.read().await.sync_input
    }

    fn fault(&self) -> Option<DeviceFault> {
        self.fault.lock().ok().and_then(|guard| guard.clone())
    }

    async fn setpoints(&self) -> Setpoints {
        self.state.read().await.setpoints
    }

    async fn valves(&self) -> ValveBits {
        self.state.read().await.valves
    }

    async fn operating_point(&self) -> DefaultOperatingPoint {
        *self.defaults.read().await
    }

    fn limits(&self) -> PercentLimits {
        self.limits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn journals_wire_commands() {
        let device = SimulatedPpc1::default();
        device.set_channel(Channel::D, 100.0).await.unwrap();
        device.set_valve(Valve::L, true).await.unwrap();
        device.close_all_valves().await.unwrap();

        assert_eq!(device.journal().await, vec!["D100.000000", "l0", "vF"]);
        assert_eq!(device.valves().await, ValveBits::default());
    }

    #[tokio::test]
    async fn rejected_setpoint_changes_nothing() {
        let device = SimulatedPpc1::default();
        device.set_channel(Channel::A, -50.0).await.unwrap();

        let err = device.set_channel(Channel::A, 10.0).await.unwrap_err();
        assert!(err.is_validation());
        assert_eq!(device.setpoints().await.get(Channel::A), -50.0);
        assert_eq!(device.journal().await.len(), 1);
    }

    #[tokio::test]
    async fn droplet_size_uses_shared_formulas() {
        let device = SimulatedPpc1::default();
        device.set_flow_speed(100.0).await.unwrap();
        device.set_droplet_size(60.0).await.unwrap();
        assert!((device.droplet_size().await - 60.0).abs() < 1e-9);

        device.change_droplet_size_by(20.0).await.unwrap();
        assert!((device.droplet_size().await - 80.0).abs() < 1e-9);

        assert!(device.set_droplet_size(500.0).await.is_err());
        assert!((device.droplet_size().await - 80.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn vacuum_percentage_relative_change() {
        let device = SimulatedPpc1::default();
        device.set_vacuum_percentage(100.0).await.unwrap();
        device.change_vacuum_percentage_by(-50.0).await.unwrap();
        assert_eq!(device.setpoints().await.get(Channel::A), -57.5);
        assert!((device.vacuum_percentage().await - 50.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn pumping_off_zeroes_and_closes() {
        let device = SimulatedPpc1::default();
        device.set_flow_speed(100.0).await.unwrap();
        device.open_all_valves().await.unwrap();

        device.pumping_off().await.unwrap();
        assert_eq!(device.setpoints().await, Setpoints::default());
        assert_eq!(device.valves().await, ValveBits::default());
    }

    #[tokio::test]
    async fn short_pulse_is_rejected() {
        let device = SimulatedPpc1::default();
        assert!(device.pulse(10).await.is_err());
        device.pulse(20).await.unwrap();
        assert_eq!(device.journal().await, vec!["p20"]);
    }

    #[test]
    fn injected_fault_is_sticky_until_cleared() {
        let device = SimulatedPpc1::default();
        assert!(device.fault().is_none());
        device.inject_fault("link lost");
        assert_eq!(device.fault().map(|f| f.message), Some("link lost".to_string()));
        device.clear_fault();
        assert!(device.fault().is_none());
    }
}

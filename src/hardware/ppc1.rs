//! PPC1 controller over a serial link.
//!
//! Owns the [`SerialTransport`], the telemetry polling task and the
//! connection state machine:
//!
//! ```text
//! Disconnected ──connect──> Connected ──run──> Running
//!      ▲                      ▲   │              │  │
//!      │                      │   └─disconnect   │  │ read failure
//!      │                      └──────stop────────┘  ▼
//!      └────────────check_fault / connect──────── Faulted
//! ```
//!
//! While Running, the polling task is the only reader of the port. Setters
//! share the write half. The latest snapshot, the connection state and the
//! sticky fault are published through `watch` cells so readers never see a
//! torn value.
//!
//! A read failure while Running (timeout, EOF, I/O error) makes the polling
//! task send a best-effort pump-off, record a [`DeviceFault`] and exit.
//! Nothing reconnects on its own; callers poll [`Ppc1Controller::fault`] or
//! call [`Ppc1Controller::check_fault`] each cycle.

use super::device::{Ppc1Device, ALL_VALVES_CLOSED};
use super::filter::SensorFilter;
use super::serial::{DynSerial, SerialTransport};
use super::telemetry::{Channel, DeviceSnapshot, FrameAssembler, FrameEvent, Valve, ValveBits};
use super::wire::{
    zero_setpoints, DeviceCommand, MAX_STREAM_PERIOD_MS, MIN_PULSE_PERIOD_MS,
    MIN_STREAM_PERIOD_MS,
};
use crate::config::{Ppc1Config, SerialConfig};
use crate::error::{
    AppResult, ConnectionError, ConnectionErrorKind, DeviceFault, Ppc1Error, TransportError,
};
use crate::fluidics::flow::{estimate_flows, FlowStatus, PipeGeometry, Solution};
use crate::fluidics::percent::{check_channel, DefaultOperatingPoint, PercentLimits, Setpoints};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Lifecycle of the serial link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Connected with the polling task streaming telemetry.
    Running,
    /// The link was lost while Running.
    Faulted,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Running => write!(f, "Running"),
            ConnectionState::Faulted => write!(f, "Faulted"),
        }
    }
}

/// Last values successfully written to the device.
#[derive(Debug, Clone, Copy, Default)]
struct Commanded {
    setpoints: Setpoints,
    valves: ValveBits,
    ttl: bool,
}

/// State shared with the polling task.
struct Shared {
    transport: SerialTransport,
    state: watch::Sender<ConnectionState>,
    snapshot: watch::Sender<Option<DeviceSnapshot>>,
    fault: watch::Sender<Option<DeviceFault>>,
    commanded: RwLock<Commanded>,
    temperature: std::sync::Mutex<Option<f64>>,
    filter: std::sync::Mutex<Option<SensorFilter>>,
    decode_failures: AtomicU64,
}

impl Shared {
    fn handle_line(&self, assembler: &mut FrameAssembler, line: String) {
        match assembler.push(line) {
            FrameEvent::Pending => {}
            FrameEvent::Frame(mut snapshot) => {
                if let Ok(mut guard) = self.filter.lock() {
                    if let Some(filter) = guard.as_mut() {
                        filter.apply(&mut snapshot);
                    }
                }
                snapshot.temperature = self.temperature.lock().ok().and_then(|t| *t);
                self.snapshot.send_replace(Some(snapshot));
            }
            FrameEvent::Rejected(err) => {
                let failures = self.decode_failures.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(error = %err, failures, "Dropped malformed telemetry frame");
            }
            FrameEvent::Stray(line) => match line.parse::<f64>() {
                Ok(celsius) if celsius.is_finite() => {
                    debug!(celsius, "Temperature reply");
                    if let Ok(mut guard) = self.temperature.lock() {
                        *guard = Some(celsius);
                    }
                    self.snapshot.send_modify(|snapshot| {
                        if let Some(snapshot) = snapshot {
                            snapshot.temperature = Some(celsius);
                        }
                    });
                }
                _ => debug!(line = %line, "Ignoring line outside a telemetry frame"),
            },
        }
    }

    /// Best-effort pump-off, then record the fault.
    async fn fail(&self, cause: TransportError) {
        error!(error = %cause, "Lost PPC1 telemetry, entering Faulted");

        let mut commands = zero_setpoints().to_vec();
        commands.push(DeviceCommand::ValvesState(ALL_VALVES_CLOSED));
        let mut delivered = true;
        for command in commands {
            delivered &= self.transport.write_line(&command.to_string()).await;
        }
        if delivered {
            let mut commanded = self.commanded.write().await;
            commanded.setpoints = Setpoints::default();
            commanded.valves = ValveBits::default();
        } else {
            warn!("Safety pump-off could not be delivered");
        }

        self.fault
            .send_replace(Some(DeviceFault::new(format!("Telemetry read failed: {cause}"))));
        self.state.send_replace(ConnectionState::Faulted);
    }
}

async fn poll_telemetry(
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
    read_timeout: Duration,
) {
    let mut assembler = FrameAssembler::new();
    debug!(?read_timeout, "Telemetry polling started");
    loop {
        let received = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            line = shared.transport.receive(read_timeout) => line,
        };
        match received {
            Ok(line) => shared.handle_line(&mut assembler, line),
            Err(cause) => {
                shared.fail(cause).await;
                break;
            }
        }
    }
    debug!("Telemetry polling stopped");
}

struct Poller {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Serial PPC1 controller.
///
/// # Example
///
/// ```no_run
/// use ppc1_control::config::Ppc1Config;
/// use ppc1_control::hardware::{Ppc1Controller, Ppc1Device};
///
/// # async fn demo() -> ppc1_control::error::AppResult<()> {
/// let config = Ppc1Config::load()?;
/// let ppc1 = Ppc1Controller::new(&config);
/// ppc1.connect(&config.serial.port).await?;
/// ppc1.run().await?;
/// ppc1.set_droplet_size(80.0).await?;
/// ppc1.stop().await?;
/// ppc1.disconnect().await?;
/// # Ok(())
/// # }
/// ```
pub struct Ppc1Controller {
    shared: Arc<Shared>,
    serial: SerialConfig,
    limits: PercentLimits,
    geometry: PipeGeometry,
    defaults: RwLock<DefaultOperatingPoint>,
    active_solution: RwLock<Option<Solution>>,
    poller: Mutex<Option<Poller>>,
}

impl Ppc1Controller {
    pub fn new(config: &Ppc1Config) -> Self {
        let filter = config
            .filter
            .enabled
            .then(|| SensorFilter::new(config.filter.size));

        Self {
            shared: Arc::new(Shared {
                transport: SerialTransport::new(),
                state: watch::Sender::new(ConnectionState::Disconnected),
                snapshot: watch::Sender::new(None),
                fault: watch::Sender::new(None),
                commanded: RwLock::new(Commanded::default()),
                temperature: std::sync::Mutex::new(None),
                filter: std::sync::Mutex::new(filter),
                decode_failures: AtomicU64::new(0),
            }),
            serial: config.serial.clone(),
            limits: config.limits,
            geometry: config.geometry,
            defaults: RwLock::new(config.defaults),
            active_solution: RwLock::new(None),
            poller: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Open `port` (identity-checked unless disabled in the configuration).
    #[instrument(skip(self), err)]
    pub async fn connect(&self, port: &str) -> AppResult<()> {
        self.begin_connect().await?;
        match self
            .shared
            .transport
            .open(port, self.serial.baud_rate, self.serial.verify_identity)
            .await
        {
            Ok(()) => {
                self.finish_connect();
                Ok(())
            }
            Err(e) => {
                self.shared.state.send_replace(ConnectionState::Disconnected);
                Err(e.into())
            }
        }
    }

    /// Connect over an already open byte stream.
    pub async fn attach(&self, stream: DynSerial) -> AppResult<()> {
        self.begin_connect().await?;
        self.shared.transport.attach(stream).await;
        self.finish_connect();
        Ok(())
    }

    async fn begin_connect(&self) -> AppResult<()> {
        match self.state() {
            ConnectionState::Disconnected => {}
            ConnectionState::Faulted => self.release().await,
            other => {
                return Err(Ppc1Error::InvalidState(format!(
                    "cannot connect while {other}"
                )))
            }
        }
        self.shared.state.send_replace(ConnectionState::Connecting);
        Ok(())
    }

    fn finish_connect(&self) {
        self.shared.fault.send_replace(None);
        self.shared.snapshot.send_replace(None);
        self.shared.decode_failures.store(0, Ordering::Relaxed);
        if let Ok(mut guard) = self.shared.filter.lock() {
            if let Some(filter) = guard.as_mut() {
                filter.reset();
            }
        }
        self.shared.state.send_replace(ConnectionState::Connected);
        info!(port = ?self.shared.transport.port_name(), "PPC1 connected");
    }

    /// Request the configured stream period and start polling telemetry.
    #[instrument(skip(self), err)]
    pub async fn run(&self) -> AppResult<()> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(Ppc1Error::InvalidState(format!(
                "cannot start streaming while {state}"
            )));
        }
        self.send(DeviceCommand::StreamPeriod(self.serial.stream_period_ms))
            .await?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        self.shared.state.send_replace(ConnectionState::Running);
        let handle = tokio::spawn(poll_telemetry(
            Arc::clone(&self.shared),
            shutdown_rx,
            self.serial.read_timeout(),
        ));
        *self.poller.lock().await = Some(Poller { shutdown, handle });
        info!(period_ms = self.serial.stream_period_ms, "Telemetry streaming");
        Ok(())
    }

    /// Pump off, then stop the polling task. The port stays open.
    #[instrument(skip(self), err)]
    pub async fn stop(&self) -> AppResult<()> {
        let state = self.state();
        if state != ConnectionState::Running {
            return Err(Ppc1Error::InvalidState(format!("cannot stop while {state}")));
        }
        let pumped_off = self.pumping_off().await;
        if let Err(e) = &pumped_off {
            warn!(error = %e, "Pump-off before stop failed");
        }
        self.halt_poller().await;
        if self.state() == ConnectionState::Running {
            self.shared.state.send_replace(ConnectionState::Connected);
        }
        pumped_off
    }

    /// Stop if needed and close the port.
    #[instrument(skip(self), err)]
    pub async fn disconnect(&self) -> AppResult<()> {
        match self.state() {
            ConnectionState::Disconnected => {
                return Err(ConnectionError::new(
                    ConnectionErrorKind::PortNotOpen,
                    "no PPC1 connected",
                )
                .into())
            }
            ConnectionState::Running => {
                if let Err(e) = self.stop().await {
                    warn!(error = %e, "Stop during disconnect failed");
                }
            }
            _ => {}
        }
        self.release().await;
        info!("PPC1 disconnected");
        Ok(())
    }

    /// When Faulted, join the polling task, close the port and return the fault.
    ///
    /// The fault stays readable through [`fault`](Self::fault) until the next
    /// successful connect.
    pub async fn check_fault(&self) -> Option<DeviceFault> {
        if self.state() != ConnectionState::Faulted {
            return None;
        }
        self.release().await;
        self.fault()
    }

    async fn release(&self) {
        self.halt_poller().await;
        self.shared.transport.close().await;
        self.shared.state.send_replace(ConnectionState::Disconnected);
    }

    async fn halt_poller(&self) {
        let poller = self.poller.lock().await.take();
        if let Some(poller) = poller {
            // The task may already have exited after a fault.
            let _ = poller.shutdown.send(true);
            if let Err(e) = poller.handle.await {
                warn!(error = %e, "Telemetry task ended abnormally");
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Running
        )
    }

    pub fn is_running(&self) -> bool {
        self.state() == ConnectionState::Running
    }

    pub fn is_exception_happened(&self) -> bool {
        self.shared.fault.borrow().is_some()
    }

    /// Latest decoded telemetry frame.
    pub fn snapshot(&self) -> Option<DeviceSnapshot> {
        self.shared.snapshot.borrow().clone()
    }

    pub fn subscribe_snapshots(&self) -> watch::Receiver<Option<DeviceSnapshot>> {
        self.shared.snapshot.subscribe()
    }

    /// Frames rejected since the last connect.
    pub fn decode_failures(&self) -> u64 {
        self.shared.decode_failures.load(Ordering::Relaxed)
    }

    /// Last reply to [`request_temperature`](Self::request_temperature).
    pub fn temperature(&self) -> Option<f64> {
        self.shared.temperature.lock().ok().and_then(|t| *t)
    }

    async fn send(&self, command: DeviceCommand) -> AppResult<()> {
        self.shared.transport.send(&command.to_string()).await?;
        Ok(())
    }

    pub async fn set_vacuum_recirc(&self, mbar: f64) -> AppResult<()> {
        self.set_channel(Channel::A, mbar).await
    }

    pub async fn set_vacuum_switch(&self, mbar: f64) -> AppResult<()> {
        self.set_channel(Channel::B, mbar).await
    }

    pub async fn set_pressure_off(&self, mbar: f64) -> AppResult<()> {
        self.set_channel(Channel::C, mbar).await
    }

    pub async fn set_pressure_on(&self, mbar: f64) -> AppResult<()> {
        self.set_channel(Channel::D, mbar).await
    }

    /// Telemetry period in ms. Zero stops the stream and is refused while Running.
    pub async fn set_data_stream_period(&self, period_ms: u32) -> AppResult<()> {
        if period_ms == 0 {
            if self.is_running() {
                return Err(Ppc1Error::InvalidState(
                    "cannot stop the telemetry stream while polling".into(),
                ));
            }
        } else if !(MIN_STREAM_PERIOD_MS..=MAX_STREAM_PERIOD_MS).contains(&period_ms) {
            return Err(Ppc1Error::out_of_range(
                "stream period (ms)",
                f64::from(period_ms),
                f64::from(MIN_STREAM_PERIOD_MS),
                f64::from(MAX_STREAM_PERIOD_MS),
            ));
        }
        self.send(DeviceCommand::StreamPeriod(period_ms)).await
    }

    /// Pressure threshold (mbar) for the firmware runtime timeout.
    pub async fn set_runtime_timeout(&self, mbar: u32) -> AppResult<()> {
        self.send(DeviceCommand::RuntimeTimeout(mbar)).await
    }

    pub async fn reboot(&self) -> AppResult<()> {
        warn!("Rebooting PPC1");
        self.send(DeviceCommand::Reboot).await
    }

    /// Ask for a temperature reading. The reply is picked up by the polling task.
    pub async fn request_temperature(&self) -> AppResult<()> {
        self.send(DeviceCommand::ReadTemperature).await
    }

    /// Replace the 100 % reference point after range checks.
    pub async fn set_default_operating_point(
        &self,
        defaults: DefaultOperatingPoint,
    ) -> AppResult<()> {
        defaults.validate()?;
        *self.defaults.write().await = defaults;
        info!(?defaults, "Default operating point updated");
        Ok(())
    }

    /// Solution currently delivered, as selected by the operator.
    pub async fn set_active_solution(&self, solution: Option<Solution>) {
        *self.active_solution.write().await = solution;
    }

    pub async fn active_solution(&self) -> Option<Solution> {
        *self.active_solution.read().await
    }

    /// Well flow estimate for the effective set points.
    pub async fn flow_status(&self) -> FlowStatus {
        let setpoints = self.setpoints().await;
        let active = self.active_solution().await;
        estimate_flows(&setpoints, &self.geometry, active)
    }

    /// Enable the moving-average sensor filter with `size` samples, or disable it.
    pub fn set_filter(&self, size: Option<usize>) {
        if let Ok(mut guard) = self.shared.filter.lock() {
            *guard = size.map(SensorFilter::new);
        }
    }
}

#[async_trait]
impl Ppc1Device for Ppc1Controller {
    async fn set_channel(&self, channel: Channel, value: f64) -> AppResult<()> {
        check_channel(channel, value)?;
        self.send(DeviceCommand::SetChannel(channel, value)).await?;
        self.shared
            .commanded
            .write()
            .await
            .setpoints
            .set(channel, value);
        Ok(())
    }

    async fn set_valve(&self, valve: Valve, open: bool) -> AppResult<()> {
        self.send(DeviceCommand::SetValve { valve, open }).await?;
        self.shared.commanded.write().await.valves.set(valve, open);
        Ok(())
    }

    async fn set_valves_state(&self, closed_mask: u8) -> AppResult<()> {
        self.send(DeviceCommand::ValvesState(closed_mask)).await?;
        self.shared.commanded.write().await.valves = ValveBits::from_closed_mask(closed_mask);
        Ok(())
    }

    async fn set_ttl_state(&self, high: bool) -> AppResult<()> {
        self.send(DeviceCommand::TtlState(high)).await?;
        self.shared.commanded.write().await.ttl = high;
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
        self.send(DeviceCommand::Pulse(period_ms)).await
    }

    async fn sync_input(&self) -> bool {
        self.shared
            .snapshot
            .borrow()
            .as_ref()
            .is_some_and(|snapshot| snapshot.sync.input)
    }

    fn fault(&self) -> Option<DeviceFault> {
        self.shared.fault.borrow().clone()
    }

    async fn setpoints(&self) -> Setpoints {
        if self.is_running() {
            if let Some(snapshot) = self.snapshot() {
                return Setpoints::from_fn(|channel| snapshot.channel(channel).sensor_reading);
            }
        }
        self.shared.commanded.read().await.setpoints
    }

    async fn valves(&self) -> ValveBits {
        if self.is_running() {
            if let Some(snapshot) = self.snapshot() {
                return snapshot.valves;
            }
        }
        self.shared.commanded.read().await.valves
    }

    async fn operating_point(&self) -> DefaultOperatingPoint {
        *self.defaults.read().await
    }

    fn limits(&self) -> PercentLimits {
        self.limits
    }
}

impl Drop for Ppc1Controller {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.poller.try_lock() {
            if let Some(poller) = guard.take() {
                poller.handle.abort();
            }
        }
    }
}

//! Outbound PPC1 command encoding.
//!
//! Every command is a single ASCII line. The newline is appended by the
//! transport, `Display` renders the bare command.

use super::telemetry::{Channel, Valve};

/// Shortest TTL pulse the firmware accepts (ms).
pub const MIN_PULSE_PERIOD_MS: u32 = 20;
/// Shortest non-zero telemetry period (ms).
pub const MIN_STREAM_PERIOD_MS: u32 = 25;
/// Longest telemetry period (ms).
pub const MAX_STREAM_PERIOD_MS: u32 = 500;
/// Firmware default telemetry period (ms).
pub const DEFAULT_STREAM_PERIOD_MS: u32 = 100;

/// A command understood by the PPC1 firmware.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeviceCommand {
    /// `A%f` .. `D%f`
    SetChannel(Channel, f64),
    /// `l0` opens valve l, `l1` closes it.
    SetValve { valve: Valve, open: bool },
    /// `v%X`, bit set = closed.
    ValvesState(u8),
    /// `o0` / `o1`
    TtlState(bool),
    /// `p%u`
    Pulse(u32),
    /// `u%u`, zero stops streaming.
    StreamPeriod(u32),
    /// `z%u`
    RuntimeTimeout(u32),
    /// `!`
    Reboot,
    /// `*`
    ReadTemperature,
}

impl std::fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceCommand::SetChannel(channel, value) => {
                write!(f, "{}{:.6}", channel.letter(), value)
            }
            DeviceCommand::SetValve { valve, open } => {
                write!(f, "{}{}", valve.letter(), if *open { 0 } else { 1 })
            }
            DeviceCommand::ValvesState(mask) => write!(f, "v{:X}", mask & 0x0F),
            DeviceCommand::TtlState(high) => write!(f, "o{}", u8::from(*high)),
            DeviceCommand::Pulse(ms) => write!(f, "p{ms}"),
            DeviceCommand::StreamPeriod(ms) => write!(f, "u{ms}"),
            DeviceCommand::RuntimeTimeout(mbar) => write!(f, "z{mbar}"),
            DeviceCommand::Reboot => write!(f, "!"),
            DeviceCommand::ReadTemperature => write!(f, "*"),
        }
    }
}

/// The zero set points sent by a pump-off, in channel order.
pub fn zero_setpoints() -> [DeviceCommand; 4] {
    Channel::ALL.map(|channel| DeviceCommand::SetChannel(channel, 0.0))
}

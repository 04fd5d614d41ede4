//! Protocol model and file loading.
//!
//! A protocol is an ordered list of [`Command`]s. Files are TOML or JSON,
//! picked by extension:
//!
//! ```toml
//! name = "switch solution 1"
//!
//! [[commands]]
//! type = "set_channel"
//! channel = "D"
//! value = 100.0
//!
//! [[commands]]
//! type = "wait"
//! seconds = 5.0
//! message = "equilibrate"
//! ```
//!
//! Loop targets are positions in the list and must point backwards.

use crate::error::{AppResult, Ppc1Error};
use crate::hardware::telemetry::{Channel, Valve};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Upper bound on executed steps when expanding loops for an estimate.
const MAX_EXPANDED_STEPS: usize = 1_000_000;

/// One protocol step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Instruction {
    SetChannel { channel: Channel, value: f64 },
    SetValve { valve: Valve, open: bool },
    /// Packed valve mask, bit set = closed.
    SetValvesState { mask: u8 },
    Wait { seconds: f64 },
    /// Block until the operator acknowledges.
    AskMessage { text: String },
    StatusMessage { text: String },
    Pulse { ms: u32 },
    /// Jump back to `start` `count` more times.
    Loop { start: usize, count: u32 },
    /// TTL pulse on the sync output.
    SyncOut { ms: u32 },
    /// Block until the sync input goes high.
    WaitSync,
    DropletSize { percent: f64 },
    FlowSpeed { percent: f64 },
    VacuumPercentage { percent: f64 },
    /// Open or close the valve of solution `slot` (1-4).
    Solution { slot: u8, open: bool },
    AllValvesClosed,
    PumpsOff,
    TtlState { high: bool },
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Instruction::SetChannel { channel, value } => write!(f, "set {channel} = {value} mbar"),
            Instruction::SetValve { valve, open } => {
                write!(f, "{} valve {valve}", if *open { "open" } else { "close" })
            }
            Instruction::SetValvesState { mask } => write!(f, "valves 0x{mask:X}"),
            Instruction::Wait { seconds } => write!(f, "wait {seconds} s"),
            Instruction::AskMessage { text } => write!(f, "ask \"{text}\""),
            Instruction::StatusMessage { text } => write!(f, "status \"{text}\""),
            Instruction::Pulse { ms } => write!(f, "pulse {ms} ms"),
            Instruction::Loop { start, count } => write!(f, "loop to {start} x{count}"),
            Instruction::SyncOut { ms } => write!(f, "sync out {ms} ms"),
            Instruction::WaitSync => write!(f, "wait sync"),
            Instruction::DropletSize { percent } => write!(f, "droplet size {percent} %"),
            Instruction::FlowSpeed { percent } => write!(f, "flow speed {percent} %"),
            Instruction::VacuumPercentage { percent } => write!(f, "vacuum {percent} %"),
            Instruction::Solution { slot, open } => {
                write!(f, "{} solution {slot}", if *open { "open" } else { "close" })
            }
            Instruction::AllValvesClosed => write!(f, "close all valves"),
            Instruction::PumpsOff => write!(f, "pumps off"),
            Instruction::TtlState { high } => write!(f, "ttl {}", u8::from(*high)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Position in the protocol, assigned on construction.
    #[serde(default)]
    pub index: usize,
    #[serde(flatten)]
    pub instruction: Instruction,
    /// Shown to the operator when the step starts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Command {
    pub fn new(instruction: Instruction) -> Self {
        Self {
            index: 0,
            instruction,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

impl From<Instruction> for Command {
    fn from(instruction: Instruction) -> Self {
        Command::new(instruction)
    }
}

/// Executed-step and wait totals with loops unrolled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expansion {
    pub steps: usize,
    pub wait: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawProtocol")]
pub struct Protocol {
    pub name: String,
    commands: Vec<Command>,
}

/// Deserialized form, renumbered into a [`Protocol`].
#[derive(Deserialize)]
struct RawProtocol {
    #[serde(default)]
    name: String,
    #[serde(default)]
    commands: Vec<Command>,
}

impl From<RawProtocol> for Protocol {
    fn from(raw: RawProtocol) -> Self {
        Protocol::new(raw.name, raw.commands)
    }
}

impl Protocol {
    pub fn new(name: impl Into<String>, commands: impl IntoIterator<Item = Command>) -> Self {
        let mut protocol = Self {
            name: name.into(),
            commands: commands.into_iter().collect(),
        };
        protocol.renumber();
        protocol
    }

    pub fn from_instructions(
        name: impl Into<String>,
        instructions: impl IntoIterator<Item = Instruction>,
    ) -> Self {
        Self::new(name, instructions.into_iter().map(Command::new))
    }

    fn renumber(&mut self) {
        for (index, command) in self.commands.iter_mut().enumerate() {
            command.index = index;
        }
    }

    /// Load a `.json` or `.toml` protocol file.
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let protocol = if is_json {
            Self::from_json_str(&text)
        } else {
            Self::from_toml_str(&text)
        }
        .map_err(|e| Ppc1Error::Protocol(format!("{}: {e}", path.display())))?;

        let protocol = if protocol.name.is_empty() {
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            Self::new(stem, protocol.commands)
        } else {
            protocol
        };
        protocol.validate()?;
        Ok(protocol)
    }

    pub fn from_toml_str(text: &str) -> AppResult<Self> {
        toml::from_str(text).map_err(|e| Ppc1Error::Protocol(e.to_string()))
    }

    pub fn from_json_str(text: &str) -> AppResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_toml_string(&self) -> AppResult<String> {
        toml::to_string_pretty(self).map_err(|e| Ppc1Error::Protocol(e.to_string()))
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Structural checks: loops point backwards, waits are finite and non-negative,
    /// solution slots exist.
    pub fn validate(&self) -> AppResult<()> {
        for (index, command) in self.commands.iter().enumerate() {
            match &command.instruction {
                Instruction::Loop { start, .. } if *start >= index => {
                    return Err(Ppc1Error::Protocol(format!(
                        "loop at {index} targets {start}, which is not before it"
                    )));
                }
                Instruction::Wait { seconds } if !(seconds.is_finite() && *seconds >= 0.0) => {
                    return Err(Ppc1Error::Protocol(format!(
                        "wait at {index} has invalid duration {seconds}"
                    )));
                }
                Instruction::Solution { slot, .. } if !(1..=4).contains(slot) => {
                    return Err(Ppc1Error::Protocol(format!(
                        "solution at {index} names slot {slot}, expected 1-4"
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Sum of the wait durations, each counted once.
    pub fn total_wait(&self) -> Duration {
        self.commands
            .iter()
            .filter_map(|c| wait_of(&c.instruction))
            .sum()
    }

    /// Walk the protocol the way the runner does and total the executed steps
    /// and waits.
    pub fn expand(&self) -> AppResult<Expansion> {
        let mut counters: HashMap<usize, u32> = HashMap::new();
        let mut expansion = Expansion {
            steps: 0,
            wait: Duration::ZERO,
        };
        let mut pc = 0;

        while let Some(command) = self.commands.get(pc) {
            expansion.steps += 1;
            if expansion.steps > MAX_EXPANDED_STEPS {
                return Err(Ppc1Error::Protocol(format!(
                    "protocol executes more than {MAX_EXPANDED_STEPS} steps"
                )));
            }
            if let Some(wait) = wait_of(&command.instruction) {
                expansion.wait += wait;
            }
            pc = match command.instruction {
                Instruction::Loop { start, count } => {
                    next_after_loop(&mut counters, pc, start, count)
                }
                _ => pc + 1,
            };
        }
        Ok(expansion)
    }
}

fn wait_of(instruction: &Instruction) -> Option<Duration> {
    match instruction {
        Instruction::Wait { seconds } => Duration::try_from_secs_f64(*seconds).ok(),
        _ => None,
    }
}

/// Next position after the loop at `index`.
///
/// Jumps to `start` while the counter for `index` is below `count`, then
/// clears the counter and falls through.
pub(crate) fn next_after_loop(
    counters: &mut HashMap<usize, u32>,
    index: usize,
    start: usize,
    count: u32,
) -> usize {
    let counter = counters.entry(index).or_insert(0);
    if *counter < count {
        *counter += 1;
        start
    } else {
        counters.remove(&index);
        index + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
name = "sample"

[[commands]]
type = "set_channel"
channel = "D"
value = 100.0

[[commands]]
type = "wait"
seconds = 5
message = "settle"

[[commands]]
type = "set_valve"
valve = "l"
open = true

[[commands]]
type = "loop"
start = 1
count = 2

[[commands]]
type = "wait_sync"
"#;

    #[test]
    fn parses_toml_and_numbers_commands() {
        let protocol = Protocol::from_toml_str(SAMPLE).unwrap();
        assert_eq!(protocol.name, "sample");
        assert_eq!(protocol.len(), 5);
        assert_eq!(
            protocol.commands()[0].instruction,
            Instruction::SetChannel {
                channel: Channel::D,
                value: 100.0
            }
        );
        assert_eq!(protocol.commands()[1].message.as_deref(), Some("settle"));
        assert_eq!(protocol.commands()[4].index, 4);
        assert_eq!(protocol.commands()[4].instruction, Instruction::WaitSync);
        assert!(protocol.validate().is_ok());
    }

    #[test]
    fn parses_json() {
        let text = r#"{"commands": [
            {"type": "droplet_size", "percent": 80},
            {"type": "ask_message", "text": "ready?"},
            {"type": "pumps_off"}
        ]}"#;
        let protocol = Protocol::from_json_str(text).unwrap();
        assert_eq!(
            protocol.commands()[0].instruction,
            Instruction::DropletSize { percent: 80.0 }
        );
        assert_eq!(protocol.commands()[2].instruction, Instruction::PumpsOff);
    }

    #[test]
    fn plain_serde_renumbers_commands() {
        let text = r#"{"name": "direct", "commands": [
            {"type": "set_channel", "channel": "D", "value": 100},
            {"type": "loop", "start": 0, "count": 1},
            {"type": "pumps_off"}
        ]}"#;
        let protocol: Protocol = serde_json::from_str(text).unwrap();
        let indices: Vec<usize> = protocol.commands().iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert!(protocol.validate().is_ok());
        assert_eq!(protocol.expand().unwrap().steps, 5);
    }

    #[test]
    fn rejects_forward_loops() {
        let protocol = Protocol::from_instructions(
            "bad",
            [
                Instruction::Loop { start: 1, count: 1 },
                Instruction::PumpsOff,
            ],
        );
        assert!(matches!(protocol.validate(), Err(Ppc1Error::Protocol(_))));
    }

    #[test]
    fn total_wait_ignores_loops_expand_does_not() {
        let protocol = Protocol::from_toml_str(SAMPLE).unwrap();
        assert_eq!(protocol.total_wait(), Duration::from_secs(5));

        let expansion = protocol.expand().unwrap();
        assert_eq!(expansion.wait, Duration::from_secs(15));
        // 1 + (wait, valve, loop) x 3 + wait_sync
        assert_eq!(expansion.steps, 11);
    }

    #[test]
    fn loop_counter_repeats_then_falls_through() {
        let mut counters = HashMap::new();
        assert_eq!(next_after_loop(&mut counters, 1, 0, 2), 0);
        assert_eq!(next_after_loop(&mut counters, 1, 0, 2), 0);
        assert_eq!(next_after_loop(&mut counters, 1, 0, 2), 2);
        assert!(counters.is_empty());
    }

    #[test]
    fn toml_round_trip_keeps_instructions() {
        let protocol = Protocol::from_toml_str(SAMPLE).unwrap();
        let text = protocol.to_toml_string().unwrap();
        assert_eq!(Protocol::from_toml_str(&text).unwrap(), protocol);
    }
}

//! PPC1 telemetry model and frame decoder.
//!
//! While streaming, the device emits one frame per stream period:
//!
//! ```text
//! A|-115.000000|-114.871|0.31|0
//! B|-115.000000|-115.022|0.29|0
//! C|21.000000|20.954|0.12|0
//! D|190.000000|189.730|0.55|0
//! i0|j0|k0|l1
//! IN1|OUT0
//! ```
//!
//! Decoding is strict. A single bad line rejects the whole frame so
//! consumers never see channel states from two different cycles.

use crate::error::DecodeError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Number of lines in one telemetry frame.
pub const FRAME_LINES: usize = 6;

/// Admitted set-point range of the vacuum channels (mbar).
pub const VACUUM_RANGE: (f64, f64) = (-300.0, 0.0);

/// Admitted set-point range of the pressure channels (mbar).
pub const PRESSURE_RANGE: (f64, f64) = (0.0, 450.0);

/// One of the four pneumatic channels.
///
/// A drives the recirculation vacuum, B the switch vacuum, C the off
/// pressure and D the on pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    A,
    B,
    C,
    D,
}

impl Channel {
    /// All channels in frame order.
    pub const ALL: [Channel; 4] = [Channel::A, Channel::B, Channel::C, Channel::D];

    pub fn letter(self) -> char {
        match self {
            Channel::A => 'A',
            Channel::B => 'B',
            Channel::C => 'C',
            Channel::D => 'D',
        }
    }

    pub fn index(self) -> usize {
        match self {
            Channel::A => 0,
            Channel::B => 1,
            Channel::C => 2,
            Channel::D => 3,
        }
    }

    pub fn is_vacuum(self) -> bool {
        matches!(self, Channel::A | Channel::B)
    }

    /// Inclusive set-point range in mbar.
    pub fn range(self) -> (f64, f64) {
        if self.is_vacuum() {
            VACUUM_RANGE
        } else {
            PRESSURE_RANGE
        }
    }

    pub fn contains(self, value: f64) -> bool {
        let (min, max) = self.range();
        value.is_finite() && value >= min && value <= max
    }

    /// Physical role of the channel.
    pub fn role(self) -> &'static str {
        match self {
            Channel::A => "recirculation vacuum",
            Channel::B => "switch vacuum",
            Channel::C => "off pressure",
            Channel::D => "on pressure",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.letter())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "a" | "v_recirc" | "recirc" => Ok(Channel::A),
            "b" | "v_switch" | "switch" => Ok(Channel::B),
            "c" | "p_off" | "poff" => Ok(Channel::C),
            "d" | "p_on" | "pon" => Ok(Channel::D),
            other => Err(format!("unknown channel '{other}'")),
        }
    }
}

/// One of the four supported solution valves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Valve {
    I,
    J,
    K,
    L,
}

impl Valve {
    /// Valves in telemetry order.
    pub const ALL: [Valve; 4] = [Valve::I, Valve::J, Valve::K, Valve::L];

    pub fn letter(self) -> char {
        match self {
            Valve::I => 'i',
            Valve::J => 'j',
            Valve::K => 'k',
            Valve::L => 'l',
        }
    }

    /// Bit of this valve in the packed `v` command (i is the MSB of the low nibble).
    pub fn mask_bit(self) -> u8 {
        match self {
            Valve::I => 0b1000,
            Valve::J => 0b0100,
            Valve::K => 0b0010,
            Valve::L => 0b0001,
        }
    }
}

impl std::fmt::Display for Valve {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.letter())
    }
}

impl FromStr for Valve {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "i" => Ok(Valve::I),
            "j" => Ok(Valve::J),
            "k" => Ok(Valve::K),
            "l" => Ok(Valve::L),
            other => Err(format!("unknown valve '{other}'")),
        }
    }
}

/// State of a single channel as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ChannelState {
    /// Commanded target (mbar).
    pub set_point: f64,
    /// Measured value (mbar).
    pub sensor_reading: f64,
    pub duty_cycle: f64,
    pub valve_state: bool,
}

/// Open/closed state of valves i..l. `true` means open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValveBits {
    pub i: bool,
    pub j: bool,
    pub k: bool,
    pub l: bool,
}

impl ValveBits {
    pub const ALL_OPEN: ValveBits = ValveBits {
        i: true,
        j: true,
        k: true,
        l: true,
    };

    pub fn is_open(&self, valve: Valve) -> bool {
        match valve {
            Valve::I => self.i,
            Valve::J => self.j,
            Valve::K => self.k,
            Valve::L => self.l,
        }
    }

    pub fn set(&mut self, valve: Valve, open: bool) {
        match valve {
            Valve::I => self.i = open,
            Valve::J => self.j = open,
            Valve::K => self.k = open,
            Valve::L => self.l = open,
        }
    }

    /// Packed wire mask, bit set = closed.
    pub fn closed_mask(&self) -> u8 {
        Valve::ALL
            .iter()
            .filter(|v| !self.is_open(**v))
            .fold(0u8, |mask, v| mask | v.mask_bit())
    }

    /// Inverse of [`closed_mask`](Self::closed_mask). Bits above the low nibble are ignored.
    pub fn from_closed_mask(mask: u8) -> Self {
        let mut bits = ValveBits::default();
        for valve in Valve::ALL {
            bits.set(valve, mask & valve.mask_bit() == 0);
        }
        bits
    }
}

/// TTL synchronisation lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SyncState {
    pub input: bool,
    pub output: bool,
}

/// One decoded telemetry frame.
///
/// Snapshots are replaced wholesale. Equality ignores the receive timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub channels: [ChannelState; 4],
    pub valves: ValveBits,
    pub sync: SyncState,
    pub temperature: Option<f64>,
    pub received_at: DateTime<Utc>,
}

impl DeviceSnapshot {
    pub fn channel(&self, channel: Channel) -> &ChannelState {
        &self.channels[channel.index()]
    }
}

impl PartialEq for DeviceSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.channels == other.channels
            && self.valves == other.valves
            && self.sync == other.sync
            && self.temperature == other.temperature
    }
}

fn split_fields<'a>(line: &'a str, expected: usize) -> Result<Vec<&'a str>, DecodeError> {
    let fields: Vec<&str> = line.split('|').map(str::trim).collect();
    if fields.len() != expected {
        return Err(DecodeError::FieldCount {
            expected,
            found: fields.len(),
            line: line.to_string(),
        });
    }
    Ok(fields)
}

fn parse_float(field: &str, line: &str) -> Result<f64, DecodeError> {
    field
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| DecodeError::InvalidNumber {
            field: field.to_string(),
            line: line.to_string(),
        })
}

/// Decode `<Channel>|<setPoint>|<sensor>|<duty>|<state>`.
pub fn decode_channel_line(expected: Channel, line: &str) -> Result<ChannelState, DecodeError> {
    let line = line.trim();
    let fields = split_fields(line, 5)?;

    let mut letter = fields[0].chars();
    if letter.next() != Some(expected.letter()) || letter.next().is_some() {
        return Err(DecodeError::UnexpectedChannel {
            expected: expected.letter(),
            found: fields[0].to_string(),
        });
    }

    let set_point = parse_float(fields[1], line)?;
    let sensor_reading = parse_float(fields[2], line)?;
    let duty_cycle = parse_float(fields[3], line)?;
    let state = fields[4]
        .parse::<i64>()
        .map_err(|_| DecodeError::InvalidNumber {
            field: fields[4].to_string(),
            line: line.to_string(),
        })?;

    Ok(ChannelState {
        set_point,
        sensor_reading,
        duty_cycle,
        valve_state: state != 0,
    })
}

/// Decode `i<b>|j<b>|k<b>|l<b>`.
pub fn decode_valve_line(line: &str) -> Result<ValveBits, DecodeError> {
    let line = line.trim();
    let fields = split_fields(line, 4)?;
    let mut bits = ValveBits::default();

    for (valve, field) in Valve::ALL.iter().zip(fields) {
        let mut chars = field.chars();
        if chars.next() != Some(valve.letter()) {
            return Err(DecodeError::Valve(field.to_string()));
        }
        let open = match chars.as_str() {
            "0" => false,
            "1" => true,
            _ => return Err(DecodeError::Valve(field.to_string())),
        };
        bits.set(*valve, open);
    }

    Ok(bits)
}

fn parse_sync_field(field: &str, prefix: &str) -> Result<bool, DecodeError> {
    field
        .strip_prefix(prefix)
        .and_then(|digits| digits.parse::<u8>().ok())
        .map(|value| value != 0)
        .ok_or_else(|| DecodeError::Sync(field.to_string()))
}

/// Decode `IN<d>|OUT<d>`.
pub fn decode_sync_line(line: &str) -> Result<SyncState, DecodeError> {
    let line = line.trim();
    let fields = split_fields(line, 2)?;
    Ok(SyncState {
        input: parse_sync_field(fields[0], "IN")?,
        output: parse_sync_field(fields[1], "OUT")?,
    })
}

/// Decode a complete six-line frame. Any bad line rejects the frame.
pub fn decode_frame<S: AsRef<str>>(lines: &[S]) -> Result<DeviceSnapshot, DecodeError> {
    if lines.len() != FRAME_LINES {
        return Err(DecodeError::IncompleteFrame { found: lines.len() });
    }

    let mut channels = [ChannelState::default(); 4];
    for channel in Channel::ALL {
        channels[channel.index()] = decode_channel_line(channel, lines[channel.index()].as_ref())?;
    }

    Ok(DeviceSnapshot {
        channels,
        valves: decode_valve_line(lines[4].as_ref())?,
        sync: decode_sync_line(lines[5].as_ref())?,
        temperature: None,
        received_at: Utc::now(),
    })
}

/// Result of feeding one line to a [`FrameAssembler`].
#[derive(Debug)]
pub enum FrameEvent {
    /// Line buffered, frame not complete yet.
    Pending,
    /// A full frame decoded.
    Frame(DeviceSnapshot),
    /// A full or interrupted frame failed to decode.
    Rejected(DecodeError),
    /// Line received outside of any frame (e.g. a `*` reply).
    Stray(String),
}

/// Groups streamed lines into frames, aligning on lines starting with `A|`.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    lines: Vec<String>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, line: String) -> FrameEvent {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return FrameEvent::Pending;
        }

        if trimmed.starts_with("A|") {
            let stale = std::mem::replace(&mut self.lines, vec![trimmed.to_string()]);
            if !stale.is_empty() {
                return FrameEvent::Rejected(DecodeError::IncompleteFrame { found: stale.len() });
            }
            return FrameEvent::Pending;
        }

        if self.lines.is_empty() {
            return FrameEvent::Stray(trimmed.to_string());
        }

        self.lines.push(trimmed.to_string());
        if self.lines.len() < FRAME_LINES {
            return FrameEvent::Pending;
        }

        let frame = std::mem::take(&mut self.lines);
        match decode_frame(&frame) {
            Ok(snapshot) => FrameEvent::Frame(snapshot),
            Err(err) => FrameEvent::Rejected(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame() -> Vec<String> {
        [
            "A|-115.000000|-114.871|0.31|0",
            "B|-115.000000|-115.022|0.29|0",
            "C|21.000000|20.954|0.12|0",
            "D|190.000000|189.730|0.55|1",
            "i0|j0|k0|l1",
            "IN1|OUT0",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    #[test]
    fn decodes_well_formed_frame() {
        let snapshot = decode_frame(&sample_frame()).unwrap();
        assert_eq!(snapshot.channel(Channel::A).set_point, -115.0);
        assert_eq!(snapshot.channel(Channel::D).sensor_reading, 189.730);
        assert!(snapshot.channel(Channel::D).valve_state);
        assert!(snapshot.valves.l);
        assert!(!snapshot.valves.i);
        assert_eq!(
            snapshot.sync,
            SyncState {
                input: true,
                output: false
            }
        );
    }

    #[test]
    fn decoding_is_idempotent() {
        let first = decode_frame(&sample_frame()).unwrap();
        let second = decode_frame(&sample_frame()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn rejects_wrong_channel_letter() {
        let mut frame = sample_frame();
        frame[1] = "C|-115.0|-115.0|0.2|0".into();
        assert!(matches!(
            decode_frame(&frame),
            Err(DecodeError::UnexpectedChannel { expected: 'B', .. })
        ));
    }

    #[test]
    fn rejects_wrong_field_count() {
        let mut frame = sample_frame();
        frame[2] = "C|21.0|20.9|0.1".into();
        assert!(matches!(
            decode_frame(&frame),
            Err(DecodeError::FieldCount { expected: 5, found: 4, .. })
        ));
    }

    #[test]
    fn rejects_non_numeric_field() {
        let mut frame = sample_frame();
        frame[3] = "D|190.0|abc|0.5|0".into();
        assert!(matches!(
            decode_frame(&frame),
            Err(DecodeError::InvalidNumber { .. })
        ));
    }

    #[test]
    fn rejects_bad_valve_and_sync_lines() {
        assert!(decode_valve_line("i0|j2|k0|l0").is_err());
        assert!(decode_valve_line("i0|k0|j0|l0").is_err());
        assert!(decode_sync_line("IN1").is_err());
        assert!(decode_sync_line("INx|OUT1").is_err());
    }

    #[test]
    fn closed_mask_round_trips_low_nibble() {
        let mut bits = ValveBits::default();
        bits.set(Valve::L, true);
        assert_eq!(bits.closed_mask(), 0b1110);
        assert_eq!(ValveBits::from_closed_mask(0xFE), bits);
        assert_eq!(ValveBits::ALL_OPEN.closed_mask(), 0x00);
        assert_eq!(ValveBits::default().closed_mask(), 0x0F);
    }

    #[test]
    fn assembler_aligns_on_channel_a() {
        let mut assembler = FrameAssembler::new();
        assert!(matches!(
            assembler.push("k0|l0".into()),
            FrameEvent::Stray(_)
        ));

        let frame = sample_frame();
        for line in &frame[..5] {
            assert!(matches!(assembler.push(line.clone()), FrameEvent::Pending));
        }
        assert!(matches!(
            assembler.push(frame[5].clone()),
            FrameEvent::Frame(_)
        ));
    }

    #[test]
    fn assembler_rejects_interrupted_frame() {
        let mut assembler = FrameAssembler::new();
        let frame = sample_frame();
        assembler.push(frame[0].clone());
        assembler.push(frame[1].clone());
        assert!(matches!(
            assembler.push(frame[0].clone()),
            FrameEvent::Rejected(DecodeError::IncompleteFrame { found: 2 })
        ));
    }

    #[test]
    fn parses_channel_names() {
        assert_eq!("recirc".parse::<Channel>().unwrap(), Channel::A);
        assert_eq!("d".parse::<Channel>().unwrap(), Channel::D);
        assert!("E".parse::<Channel>().is_err());
    }
}

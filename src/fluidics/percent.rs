//! Percentage views over the four channel set points.
//!
//! Three scalar views are defined relative to the [`DefaultOperatingPoint`]:
//!
//! - **Droplet size**: scales with volume, so the on pressure and the
//!   recirculation vacuum move with the cube root of the percentage.
//! - **Flow speed**: every channel scales linearly.
//! - **Vacuum**: only the recirculation vacuum scales linearly.
//!
//! The forward transforms validate everything before returning, so callers
//! either get a complete set of targets or an error and nothing changes.

use crate::error::{AppResult, Ppc1Error};
use crate::hardware::telemetry::Channel;
use serde::{Deserialize, Serialize};

/// Set points that define 100 % droplet size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DefaultOperatingPoint {
    /// On pressure, channel D (mbar).
    #[serde(default = "default_pon")]
    pub pon: f64,
    /// Off pressure, channel C (mbar).
    #[serde(default = "default_poff")]
    pub poff: f64,
    /// Recirculation vacuum, channel A (mbar, negative).
    #[serde(default = "default_v_recirc")]
    pub v_recirc: f64,
    /// Switch vacuum, channel B (mbar, negative).
    #[serde(default = "default_v_switch")]
    pub v_switch: f64,
}

fn default_pon() -> f64 {
    190.0
}

fn default_poff() -> f64 {
    21.0
}

fn default_v_recirc() -> f64 {
    -115.0
}

fn default_v_switch() -> f64 {
    -115.0
}

impl Default for DefaultOperatingPoint {
    fn default() -> Self {
        Self {
            pon: default_pon(),
            poff: default_poff(),
            v_recirc: default_v_recirc(),
            v_switch: default_v_switch(),
        }
    }
}

impl DefaultOperatingPoint {
    pub fn for_channel(&self, channel: Channel) -> f64 {
        match channel {
            Channel::A => self.v_recirc,
            Channel::B => self.v_switch,
            Channel::C => self.poff,
            Channel::D => self.pon,
        }
    }

    pub fn as_setpoints(&self) -> Setpoints {
        Setpoints::from_fn(|channel| self.for_channel(channel))
    }

    /// Every value must be inside its channel range, and the values used as
    /// denominators must be non-zero.
    pub fn validate(&self) -> AppResult<()> {
        for channel in Channel::ALL {
            check_channel(channel, self.for_channel(channel))?;
        }
        if self.pon == 0.0 || self.v_recirc == 0.0 {
            return Err(Ppc1Error::Validation(
                "default pon and v_recirc must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Admitted percentage windows.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PercentLimits {
    pub droplet_min: f64,
    pub droplet_max: f64,
    pub flow_min: f64,
    pub flow_max: f64,
    pub vacuum_min: f64,
    pub vacuum_max: f64,
}

impl Default for PercentLimits {
    fn default() -> Self {
        Self {
            droplet_min: 20.0,
            droplet_max: 180.0,
            flow_min: 10.0,
            flow_max: 220.0,
            vacuum_min: 10.0,
            vacuum_max: 250.0,
        }
    }
}

impl PercentLimits {
    pub fn validate(&self) -> Result<(), String> {
        let windows = [
            ("droplet", self.droplet_min, self.droplet_max),
            ("flow", self.flow_min, self.flow_max),
            ("vacuum", self.vacuum_min, self.vacuum_max),
        ];
        for (name, min, max) in windows {
            if !(min > 0.0 && min < max) {
                return Err(format!(
                    "Invalid {name} window [{min}, {max}]. Need 0 < min < max"
                ));
            }
        }
        Ok(())
    }
}

/// The four channel set points, indexed by [`Channel`].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Setpoints([f64; 4]);

impl Setpoints {
    pub fn new(a: f64, b: f64, c: f64, d: f64) -> Self {
        Self([a, b, c, d])
    }

    pub fn from_fn(f: impl Fn(Channel) -> f64) -> Self {
        Self(Channel::ALL.map(f))
    }

    pub fn get(&self, channel: Channel) -> f64 {
        self.0[channel.index()]
    }

    pub fn set(&mut self, channel: Channel, value: f64) {
        self.0[channel.index()] = value;
    }

    pub fn iter(&self) -> impl Iterator<Item = (Channel, f64)> + '_ {
        Channel::ALL.iter().map(|c| (*c, self.get(*c)))
    }
}

/// Reject `value` unless it lies in the channel's static range.
pub fn check_channel(channel: Channel, value: f64) -> AppResult<()> {
    if channel.contains(value) {
        Ok(())
    } else {
        let (min, max) = channel.range();
        Err(Ppc1Error::out_of_range(
            format!("channel {channel} ({})", channel.role()),
            value,
            min,
            max,
        ))
    }
}

fn check_window(what: &str, value: f64, min: f64, max: f64) -> AppResult<()> {
    if value.is_finite() && value >= min && value <= max {
        Ok(())
    } else {
        Err(Ppc1Error::out_of_range(what, value, min, max))
    }
}

/// On pressure (D) and recirculation vacuum (A) for a droplet size.
///
/// With `c = (p/100)^(1/3)`: `pon = pon_def * c` and
/// `v_recirc = v_recirc_def * (2 - c)`.
pub fn droplet_size_targets(
    percentage: f64,
    defaults: &DefaultOperatingPoint,
    limits: &PercentLimits,
) -> AppResult<[(Channel, f64); 2]> {
    check_window(
        "droplet size %",
        percentage,
        limits.droplet_min,
        limits.droplet_max,
    )?;

    let c = (percentage / 100.0).cbrt();
    let delta = 1.0 - c;
    let pon = defaults.pon * c;
    let v_recirc = defaults.v_recirc * (1.0 + delta);

    check_channel(Channel::D, pon)?;
    check_channel(Channel::A, v_recirc)?;
    Ok([(Channel::D, pon), (Channel::A, v_recirc)])
}

/// Inverse of [`droplet_size_targets`].
///
/// Each channel yields a linear factor, their mean is cubed.
pub fn droplet_size_from(setpoints: &Setpoints, defaults: &DefaultOperatingPoint) -> f64 {
    let c_on = setpoints.get(Channel::D) / defaults.pon;
    let c_vacuum = 2.0 - setpoints.get(Channel::A) / defaults.v_recirc;
    let c = ((c_on + c_vacuum) / 2.0).max(0.0);
    100.0 * c.powi(3)
}

/// All four set points scaled by `percentage / 100`.
pub fn flow_speed_targets(
    percentage: f64,
    defaults: &DefaultOperatingPoint,
    limits: &PercentLimits,
) -> AppResult<Setpoints> {
    check_window("flow speed %", percentage, limits.flow_min, limits.flow_max)?;

    let targets = Setpoints::from_fn(|channel| defaults.for_channel(channel) * percentage / 100.0);
    for (channel, value) in targets.iter() {
        check_channel(channel, value)?;
    }
    Ok(targets)
}

/// Mean channel ratio to the defaults, as a percentage.
pub fn flow_speed_from(setpoints: &Setpoints, defaults: &DefaultOperatingPoint) -> f64 {
    let ratios: Vec<f64> = Channel::ALL
        .iter()
        .filter(|c| defaults.for_channel(**c) != 0.0)
        .map(|c| setpoints.get(*c) / defaults.for_channel(*c))
        .collect();
    if ratios.is_empty() {
        return 0.0;
    }
    100.0 * ratios.iter().sum::<f64>() / ratios.len() as f64
}

/// Recirculation vacuum for a vacuum percentage.
pub fn vacuum_target(
    percentage: f64,
    defaults: &DefaultOperatingPoint,
    limits: &PercentLimits,
) -> AppResult<f64> {
    check_window(
        "vacuum %",
        percentage,
        limits.vacuum_min,
        limits.vacuum_max,
    )?;
    let value = defaults.v_recirc * percentage / 100.0;
    check_channel(Channel::A, value)?;
    Ok(value)
}

pub fn vacuum_from(setpoints: &Setpoints, defaults: &DefaultOperatingPoint) -> f64 {
    100.0 * setpoints.get(Channel::A) / defaults.v_recirc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(base: Setpoints, targets: &[(Channel, f64)]) -> Setpoints {
        let mut out = base;
        for (channel, value) in targets {
            out.set(*channel, *value);
        }
        out
    }

    #[test]
    fn droplet_size_round_trips_over_window() {
        let defaults = DefaultOperatingPoint::default();
        let limits = PercentLimits::default();
        let mut p = limits.droplet_min;
        while p <= limits.droplet_max {
            let targets = droplet_size_targets(p, &defaults, &limits).unwrap();
            let setpoints = apply(defaults.as_setpoints(), &targets);
            let back = droplet_size_from(&setpoints, &defaults);
            assert!((back - p).abs() < 1e-9, "p={p} back={back}");
            p += 5.0;
        }
    }

    #[test]
    fn droplet_size_100_is_the_default_point() {
        let defaults = DefaultOperatingPoint::default();
        let targets = droplet_size_targets(100.0, &defaults, &PercentLimits::default()).unwrap();
        assert_eq!(targets, [(Channel::D, 190.0), (Channel::A, -115.0)]);
    }

    #[test]
    fn droplet_size_outside_window_is_rejected() {
        let defaults = DefaultOperatingPoint::default();
        let limits = PercentLimits::default();
        assert!(droplet_size_targets(10.0, &defaults, &limits).is_err());
        assert!(droplet_size_targets(200.0, &defaults, &limits).is_err());
        assert!(droplet_size_targets(f64::NAN, &defaults, &limits).is_err());
    }

    #[test]
    fn flow_speed_scales_every_channel() {
        let defaults = DefaultOperatingPoint::default();
        let targets = flow_speed_targets(50.0, &defaults, &PercentLimits::default()).unwrap();
        assert_eq!(targets, Setpoints::new(-57.5, -57.5, 10.5, 95.0));
        assert!((flow_speed_from(&targets, &defaults) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn flow_speed_fails_whole_when_one_channel_overflows() {
        let defaults = DefaultOperatingPoint {
            pon: 400.0,
            ..Default::default()
        };
        // 400 * 1.5 = 600 mbar exceeds channel D.
        let err = flow_speed_targets(150.0, &defaults, &PercentLimits::default()).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn vacuum_only_touches_recirculation() {
        let defaults = DefaultOperatingPoint::default();
        let value = vacuum_target(200.0, &defaults, &PercentLimits::default()).unwrap();
        assert_eq!(value, -230.0);
        let setpoints = Setpoints::new(value, -115.0, 21.0, 190.0);
        assert!((vacuum_from(&setpoints, &defaults) - 200.0).abs() < 1e-9);
    }

    #[test]
    fn default_point_validation() {
        assert!(DefaultOperatingPoint::default().validate().is_ok());
        let bad = DefaultOperatingPoint {
            v_recirc: 10.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let zero = DefaultOperatingPoint {
            pon: 0.0,
            ..Default::default()
        };
        assert!(zero.validate().is_err());
    }
}

//! TOML machine configuration
//!
//! ```toml
//! [motion]
//! acceleration = 3000
//! max_jerk = 20
//!
//! [axis.x]
//! steps_per_mm = 80
//! max_rate = 300
//! step_pin = "gpio11"
//! dir_pin = "gpio10"
//! enable_pin = "!gpio12"
//! endstop_pin = "^!gpio4"
//! ```
//!
//! Missing keys take the firmware defaults. Axes named `x`/`y`/`z` or
//! `alpha`/`beta`/`gamma` map to actuators 0..2; any other name needs an
//! explicit `actuator = <index>`.

use alloc::collections::BTreeMap;
use alloc::string::String;

use cadence_core::config::{AxisConfig, MotionConfig, PinConfig};
use cadence_core::AXES;
use serde::Deserialize;

use crate::LoadError;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFile {
    #[serde(default)]
    motion: RawMotion,
    #[serde(default)]
    axis: BTreeMap<String, RawAxis>,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawMotion {
    queue_size: usize,
    acceleration: f32,
    max_jerk: f32,
    minimum_planner_speed: f32,
    acceleration_ticks_per_second: u32,
    minimum_steps_per_second: u32,
    base_frequency: u32,
    step_pulse_us: u32,
}

impl Default for RawMotion {
    fn default() -> Self {
        let config = MotionConfig::default();
        Self {
            queue_size: config.queue_size,
            acceleration: config.acceleration,
            max_jerk: config.max_jerk,
            minimum_planner_speed: config.minimum_planner_speed,
            acceleration_ticks_per_second: config.acceleration_ticks_per_second,
            minimum_steps_per_second: config.minimum_steps_per_second,
            base_frequency: config.base_frequency,
            step_pulse_us: config.step_pulse_us,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawAxis {
    actuator: Option<usize>,
    steps_per_mm: Option<f32>,
    max_rate: Option<f32>,
    step_pin: Option<String>,
    dir_pin: Option<String>,
    enable_pin: Option<String>,
    endstop_pin: Option<String>,
}

/// Parse TOML text into a motion configuration
///
/// Axis rates the step timer cannot reach are clamped, then the result is
/// validated. Unassigned axes keep their defaults and fail validation for
/// lack of pins.
pub fn parse_config(input: &str) -> Result<MotionConfig, LoadError> {
    let raw: RawFile = toml::from_str(input).map_err(|_| {
        warn!("TOML parse error");
        LoadError::Toml
    })?;

    let motion = raw.motion;
    let mut config = MotionConfig {
        queue_size: motion.queue_size,
        acceleration: motion.acceleration,
        max_jerk: motion.max_jerk,
        minimum_planner_speed: motion.minimum_planner_speed,
        acceleration_ticks_per_second: motion.acceleration_ticks_per_second,
        minimum_steps_per_second: motion.minimum_steps_per_second,
        base_frequency: motion.base_frequency,
        step_pulse_us: motion.step_pulse_us,
        axes: Default::default(),
    };

    let mut assigned = [false; AXES];
    for (name, axis) in raw.axis.iter() {
        let index = actuator_index(name, axis.actuator)?;
        if assigned[index] {
            return Err(LoadError::UnknownAxis);
        }
        assigned[index] = true;
        config.axes[index] = build_axis(name, axis)?;
    }

    config.clamp_axis_rates();
    config.validate()?;
    Ok(config)
}

fn actuator_index(name: &str, explicit: Option<usize>) -> Result<usize, LoadError> {
    let index = match (explicit, name) {
        (Some(index), _) => index,
        (None, "x" | "alpha") => 0,
        (None, "y" | "beta") => 1,
        (None, "z" | "gamma") => 2,
        _ => return Err(LoadError::UnknownAxis),
    };
    if index >= AXES {
        return Err(LoadError::UnknownAxis);
    }
    Ok(index)
}

fn build_axis(name: &str, raw: &RawAxis) -> Result<AxisConfig, LoadError> {
    let mut axis = AxisConfig {
        name: heapless::String::try_from(name).map_err(|_| LoadError::UnknownAxis)?,
        ..Default::default()
    };
    if let Some(steps_per_mm) = raw.steps_per_mm {
        axis.steps_per_mm = steps_per_mm;
    }
    if let Some(max_rate) = raw.max_rate {
        axis.max_rate = max_rate;
    }
    if let Some(pin) = raw.step_pin.as_deref() {
        axis.step_pin = parse_pin(pin)?;
    }
    if let Some(pin) = raw.dir_pin.as_deref() {
        axis.dir_pin = parse_pin(pin)?;
    }
    if let Some(pin) = raw.enable_pin.as_deref() {
        axis.enable_pin = parse_pin(pin)?;
    }
    if let Some(pin) = raw.endstop_pin.as_deref() {
        axis.endstop_pin = Some(parse_pin(pin)?);
    }
    Ok(axis)
}

/// Parse a pin string like "gpio11", "!gpio12", "^gpio4"
///
/// `!` marks the pin active-low, `^` enables the pull-up. Modifiers may be
/// combined in any order.
pub fn parse_pin(value: &str) -> Result<PinConfig, LoadError> {
    let mut pin = PinConfig::unassigned();
    let mut rest = value.trim();
    loop {
        if let Some(s) = rest.strip_prefix('!') {
            pin.inverted = true;
            rest = s;
        } else if let Some(s) = rest.strip_prefix('^') {
            pin.pull_up = true;
            rest = s;
        } else {
            break;
        }
    }

    let number = rest.strip_prefix("gpio").ok_or(LoadError::InvalidPin)?;
    pin.pin = number.parse().map_err(|_| LoadError::InvalidPin)?;
    if !pin.is_assigned() {
        return Err(LoadError::InvalidPin);
    }
    Ok(pin)
}

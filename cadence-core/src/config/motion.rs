//! Motion configuration
//!
//! Planner, queue and step timer parameters. Rates are per second.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::hardware::{AxisConfig, PinConfig, PinRole};
use crate::AXES;

/// Largest queue capacity the firmware is built for
pub const MAX_QUEUE_SIZE: usize = 64;

/// Default number of block slots
pub const DEFAULT_QUEUE_SIZE: usize = 32;

/// Default acceleration in mm/s²
pub const DEFAULT_ACCELERATION: f32 = 100.0;

/// Default maximum junction jerk in mm/s
pub const DEFAULT_MAX_JERK: f32 = 10.0;

/// Default trapezoid generator frequency in Hz
pub const DEFAULT_ACCELERATION_TICKS: u32 = 100;

/// Default minimum step rate in steps/s (3000 steps/min)
pub const DEFAULT_MINIMUM_STEP_RATE: u32 = 50;

/// Default step timer frequency in Hz
pub const DEFAULT_BASE_FREQUENCY: u32 = 100_000;

/// Default step pulse width in microseconds
pub const DEFAULT_STEP_PULSE_US: u32 = 1;

/// Fatal configuration errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    /// Queue size outside `2..=MAX_QUEUE_SIZE` or above the built capacity
    InvalidQueueSize,
    /// Acceleration must be positive and finite
    InvalidAcceleration,
    /// Max jerk must be positive and finite
    InvalidJerk,
    /// Minimum planner speed must be non-negative
    InvalidPlannerSpeed,
    /// Timer frequencies must be non-zero and consistent
    InvalidFrequency,
    /// Minimum step rate must lie in `1..base_frequency`
    InvalidMinimumRate,
    /// Step pulse does not fit inside one step tick
    PulseTooLong,
    /// Steps/mm or max rate not positive for this axis
    InvalidAxis { axis: u8 },
    /// Required pin not assigned
    MissingPin { axis: u8, role: PinRole },
    /// Same pin used twice
    DuplicatePin { pin: u8 },
}

/// Motion core configuration
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MotionConfig {
    /// Number of block slots in the motion queue
    pub queue_size: usize,
    /// Acceleration in mm/s²
    pub acceleration: f32,
    /// Largest speed change allowed at a junction, in mm/s
    pub max_jerk: f32,
    /// Speed the last planned block decelerates to, in mm/s
    pub minimum_planner_speed: f32,
    /// Trapezoid generator tick rate in Hz
    pub acceleration_ticks_per_second: u32,
    /// Lower bound on the step rate during deceleration, in steps/s
    pub minimum_steps_per_second: u32,
    /// Step timer tick rate in Hz
    pub base_frequency: u32,
    /// Step pulse width in microseconds
    pub step_pulse_us: u32,
    /// Per-actuator configuration
    pub axes: [AxisConfig; AXES],
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            queue_size: DEFAULT_QUEUE_SIZE,
            acceleration: DEFAULT_ACCELERATION,
            max_jerk: DEFAULT_MAX_JERK,
            minimum_planner_speed: 0.0,
            acceleration_ticks_per_second: DEFAULT_ACCELERATION_TICKS,
            minimum_steps_per_second: DEFAULT_MINIMUM_STEP_RATE,
            base_frequency: DEFAULT_BASE_FREQUENCY,
            step_pulse_us: DEFAULT_STEP_PULSE_US,
            axes: Default::default(),
        }
    }
}

fn positive(value: f32) -> bool {
    value.is_finite() && value > 0.0
}

impl MotionConfig {
    /// Check the configuration, returning the first fatal problem found
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_size < 2 || self.queue_size > MAX_QUEUE_SIZE {
            return Err(ConfigError::InvalidQueueSize);
        }
        if !positive(self.acceleration) {
            return Err(ConfigError::InvalidAcceleration);
        }
        if !positive(self.max_jerk) {
            return Err(ConfigError::InvalidJerk);
        }
        if !(self.minimum_planner_speed.is_finite() && self.minimum_planner_speed >= 0.0) {
            return Err(ConfigError::InvalidPlannerSpeed);
        }
        if self.base_frequency == 0
            || self.acceleration_ticks_per_second == 0
            || self.acceleration_ticks_per_second > self.base_frequency
        {
            return Err(ConfigError::InvalidFrequency);
        }
        if self.minimum_steps_per_second == 0 || self.minimum_steps_per_second >= self.base_frequency
        {
            return Err(ConfigError::InvalidMinimumRate);
        }
        // The pulse must end before the next step tick can raise it again
        if self.step_pulse_us == 0
            || u64::from(self.step_pulse_us) * u64::from(self.base_frequency) >= 1_000_000
        {
            return Err(ConfigError::PulseTooLong);
        }

        for (index, axis) in self.axes.iter().enumerate() {
            let axis_id = index as u8;
            if !positive(axis.steps_per_mm) || !positive(axis.max_rate) {
                return Err(ConfigError::InvalidAxis { axis: axis_id });
            }
            if !axis.step_pin.is_assigned() {
                return Err(ConfigError::MissingPin {
                    axis: axis_id,
                    role: PinRole::Step,
                });
            }
            if !axis.dir_pin.is_assigned() {
                return Err(ConfigError::MissingPin {
                    axis: axis_id,
                    role: PinRole::Dir,
                });
            }
        }

        self.check_duplicate_pins()
    }

    fn check_duplicate_pins(&self) -> Result<(), ConfigError> {
        let mut seen = [false; 256];
        for (_, pin) in self.axes.iter().flat_map(AxisConfig::pins) {
            let slot = &mut seen[pin.pin as usize];
            if *slot {
                return Err(ConfigError::DuplicatePin { pin: pin.pin });
            }
            *slot = true;
        }
        Ok(())
    }

    /// Lower any axis max rate the step timer cannot keep up with
    ///
    /// Returns the number of axes that were clamped.
    pub fn clamp_axis_rates(&mut self) -> usize {
        let base = self.base_frequency as f32;
        let mut clamped = 0;
        for axis in self.axes.iter_mut() {
            if axis.steps_per_mm > 0.0 && axis.max_step_rate() > base {
                let limit = libm::floorf(base / axis.steps_per_mm);
                warn!(
                    "axis {} max rate {} exceeds step frequency, clamping to {}",
                    axis.name.as_str(),
                    axis.max_rate,
                    limit
                );
                axis.max_rate = limit;
                clamped += 1;
            }
        }
        clamped
    }

    /// Steps/mm for every axis
    pub fn steps_per_mm(&self) -> [f32; AXES] {
        core::array::from_fn(|i| self.axes[i].steps_per_mm)
    }

    /// Max rate (mm/s) for every axis
    pub fn max_rates(&self) -> [f32; AXES] {
        core::array::from_fn(|i| self.axes[i].max_rate)
    }

    /// A ready-to-use configuration with pins 0..9 assigned to step/dir/enable
    pub fn with_default_pins() -> Self {
        let mut config = Self::default();
        for (i, axis) in config.axes.iter_mut().enumerate() {
            let base = (i * 3) as u8;
            axis.step_pin = PinConfig::new(base);
            axis.dir_pin = PinConfig::new(base + 1);
            axis.enable_pin = PinConfig::inverted(base + 2);
        }
        config
    }
}

//! Hardware configuration types
//!
//! Pin assignments and per-axis mechanical parameters.

use heapless::String;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Maximum length of an axis label
pub const MAX_LABEL_LEN: usize = 8;

/// Pin configuration with optional inversion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PinConfig {
    /// GPIO pin number, `PinConfig::UNASSIGNED` when not wired
    pub pin: u8,
    /// Pin is active-low (inverted)
    pub inverted: bool,
    /// Enable internal pull-up
    pub pull_up: bool,
}

impl Default for PinConfig {
    fn default() -> Self {
        Self::unassigned()
    }
}

impl PinConfig {
    /// Marker pin number for an unassigned pin
    pub const UNASSIGNED: u8 = u8::MAX;

    /// Create a new pin config
    pub const fn new(pin: u8) -> Self {
        Self {
            pin,
            inverted: false,
            pull_up: false,
        }
    }

    /// Create an inverted (active-low) pin
    pub const fn inverted(pin: u8) -> Self {
        Self {
            pin,
            inverted: true,
            pull_up: false,
        }
    }

    /// Create a pin with pull-up enabled
    pub const fn with_pullup(pin: u8) -> Self {
        Self {
            pin,
            inverted: false,
            pull_up: true,
        }
    }

    /// A pin that is not wired
    pub const fn unassigned() -> Self {
        Self::new(Self::UNASSIGNED)
    }

    /// Whether a physical pin is assigned
    pub const fn is_assigned(&self) -> bool {
        self.pin != Self::UNASSIGNED
    }

    /// Electrical level that represents the logical `active` state
    pub const fn level(&self, active: bool) -> bool {
        active != self.inverted
    }
}

/// Role of a pin within an axis, used in error reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PinRole {
    /// Step pulse output
    Step,
    /// Direction output
    Dir,
    /// Driver enable output
    Enable,
    /// Endstop input
    Endstop,
}

/// Per-actuator configuration
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AxisConfig {
    /// Axis label (e.g., "x", "alpha")
    pub name: String<MAX_LABEL_LEN>,
    /// Steps per millimetre of actuator travel
    pub steps_per_mm: f32,
    /// Maximum actuator speed in mm/s
    pub max_rate: f32,
    /// Step pulse pin
    pub step_pin: PinConfig,
    /// Direction pin
    pub dir_pin: PinConfig,
    /// Enable pin (active-low on most drivers)
    pub enable_pin: PinConfig,
    /// Endstop input, if fitted
    pub endstop_pin: Option<PinConfig>,
}

impl Default for AxisConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            steps_per_mm: 80.0,
            max_rate: 500.0,
            step_pin: PinConfig::unassigned(),
            dir_pin: PinConfig::unassigned(),
            enable_pin: PinConfig::unassigned(),
            endstop_pin: None,
        }
    }
}

impl AxisConfig {
    /// Iterate over the assigned pins of this axis with their role
    pub fn pins(&self) -> impl Iterator<Item = (PinRole, PinConfig)> + '_ {
        [
            Some((PinRole::Step, self.step_pin)),
            Some((PinRole::Dir, self.dir_pin)),
            Some((PinRole::Enable, self.enable_pin)),
            self.endstop_pin.map(|p| (PinRole::Endstop, p)),
        ]
        .into_iter()
        .flatten()
        .filter(|(_, p)| p.is_assigned())
    }

    /// Highest step rate this axis can be asked for, in steps/s
    pub fn max_step_rate(&self) -> f32 {
        self.max_rate * self.steps_per_mm
    }
}

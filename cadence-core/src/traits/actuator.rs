//! Step/direction actuator trait
//!
//! The step generator drives every actuator of a block together, so the
//! interface works on whole banks: one direction mask and one step mask per
//! step event.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::motion::block::DirectionBits;

/// Actuator travel direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Direction {
    /// Towards positive step counts
    Positive,
    /// Towards negative step counts
    Negative,
}

impl Direction {
    /// Get the opposite direction
    pub fn opposite(self) -> Self {
        match self {
            Direction::Positive => Direction::Negative,
            Direction::Negative => Direction::Positive,
        }
    }

    /// Direction of `axis` in a block's direction mask
    pub fn of_axis(bits: DirectionBits, axis: usize) -> Self {
        if bits.is_negative(axis) {
            Direction::Negative
        } else {
            Direction::Positive
        }
    }

    /// Signed unit step in this direction
    pub fn delta(self) -> i32 {
        match self {
            Direction::Positive => 1,
            Direction::Negative => -1,
        }
    }
}

/// A bank of step/direction actuators
///
/// Implementations translate logical levels to the wiring (inversion, pin
/// numbering). All methods are called from the step interrupt and must not
/// block.
pub trait ActuatorBank {
    /// Pin write error
    type Error;

    /// Latch the direction of every actuator
    ///
    /// Called before the first step of a block.
    fn set_directions(&mut self, directions: DirectionBits) -> Result<(), Self::Error>;

    /// Raise the step line of every actuator whose bit is set in `mask`
    fn step(&mut self, mask: u8) -> Result<(), Self::Error>;

    /// Lower all step lines, ending the pulse
    fn unstep(&mut self) -> Result<(), Self::Error>;

    /// Enable or disable every driver
    ///
    /// When disabled, the motors are free to rotate and do not hold position.
    fn enable(&mut self, enabled: bool) -> Result<(), Self::Error>;

    /// Whether the drivers are enabled
    fn is_enabled(&self) -> bool;
}

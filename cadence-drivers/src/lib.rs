//! Hardware driver implementations
//!
//! Concrete implementations of the traits defined in cadence-core on top of
//! `embedded-hal` 1.0 digital pins:
//!
//! - Step/direction/enable banks driving the actuators
//! - Step pulse set/reset timing
//! - Endstop inputs feeding the motion core's stop signal

#![no_std]
#![deny(unsafe_code)]

#[macro_use]
mod fmt;

pub mod endstop;
pub mod pulse;
pub mod stepdir;

pub use endstop::EndstopMonitor;
pub use pulse::StepPulse;
pub use stepdir::{AxisPins, StepDirBank};

//! Board-agnostic motion core for the Cadence firmware
//!
//! This crate holds the real-time motion pipeline and everything it needs
//! that does not depend on a specific board:
//!
//! - Kinematic blocks and trapezoidal speed profiles
//! - The triple-cursor motion queue shared with the step interrupt
//! - Lookahead planner (reverse/forward pass)
//! - Conveyor (queue sealing and deferred cleanup)
//! - Step generator (Bresenham step accumulation and trapezoid ticks)
//! - Typed event bus for motion followers
//! - Configuration type definitions and validation

#![no_std]
#![deny(unsafe_code)]

#[cfg(test)]
extern crate std;

#[macro_use]
mod fmt;

pub mod config;
pub mod events;
pub mod fixed;
pub mod kinematics;
pub mod motion;
pub mod traits;

/// Number of actuators driven by the motion core
pub const AXES: usize = 3;

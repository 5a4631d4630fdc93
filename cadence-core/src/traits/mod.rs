//! Hardware abstraction traits
//!
//! These traits define the interface between the motion core and the
//! board-specific pin drivers.

pub mod actuator;

pub use actuator::{ActuatorBank, Direction};

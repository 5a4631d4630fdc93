//! Coordinate transforms and move requests
//!
//! The planner works purely in actuator steps. [`MoveBuilder`] sits in front
//! of it: it keeps the Cartesian position, caps the feed rate so no axis
//! exceeds its configured max rate, runs the target through a pluggable
//! [`CoordinateTransform`] and rounds to steps.

use libm::{roundf, sqrtf};

use crate::config::MotionConfig;
use crate::AXES;

/// Maps Cartesian millimetres to actuator millimetres and back
pub trait CoordinateTransform {
    /// Actuator positions for a Cartesian point
    fn cartesian_to_actuator(&self, cartesian: [f32; AXES]) -> [f32; AXES];

    /// Cartesian point for a set of actuator positions
    fn actuator_to_cartesian(&self, actuator: [f32; AXES]) -> [f32; AXES];
}

/// One actuator per Cartesian axis
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CartesianTransform;

impl CoordinateTransform for CartesianTransform {
    fn cartesian_to_actuator(&self, cartesian: [f32; AXES]) -> [f32; AXES] {
        cartesian
    }

    fn actuator_to_cartesian(&self, actuator: [f32; AXES]) -> [f32; AXES] {
        actuator
    }
}

/// A move ready for [`Planner::append_move`](crate::motion::Planner::append_move)
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MoveRequest {
    /// Absolute actuator target in steps
    pub target_steps: [i32; AXES],
    /// Feed rate in mm/s after max-rate capping
    pub feed_rate: f32,
    /// Cartesian length in mm
    pub distance: f32,
    /// Per-axis velocity in mm/s
    pub axis_speeds: [f32; AXES],
}

/// Turns Cartesian targets into step-space move requests
pub struct MoveBuilder<T> {
    transform: T,
    steps_per_mm: [f32; AXES],
    max_rates: [f32; AXES],
    /// Cartesian position after the last planned move
    position: [f32; AXES],
}

impl<T: CoordinateTransform> MoveBuilder<T> {
    /// Builder at the origin using the axis scales and rate limits of `config`
    pub fn new(transform: T, config: &MotionConfig) -> Self {
        Self {
            transform,
            steps_per_mm: config.steps_per_mm(),
            max_rates: config.max_rates(),
            position: [0.0; AXES],
        }
    }

    /// The transform in use
    pub fn transform(&self) -> &T {
        &self.transform
    }

    /// Cartesian position after the last planned move, mm
    pub fn position(&self) -> [f32; AXES] {
        self.position
    }

    /// Set the Cartesian position without moving
    pub fn set_position(&mut self, position: [f32; AXES]) {
        self.position = position;
    }

    /// Actuator step target for a Cartesian point
    pub fn to_steps(&self, cartesian: [f32; AXES]) -> [i32; AXES] {
        let actuator = self.transform.cartesian_to_actuator(cartesian);
        core::array::from_fn(|axis| roundf(actuator[axis] * self.steps_per_mm[axis]) as i32)
    }

    /// Plan a straight move to `target` (mm) at `feed_rate` (mm/s)
    ///
    /// Returns `None` for zero-length moves or a non-positive feed rate.
    pub fn plan_move(&mut self, target: [f32; AXES], feed_rate: f32) -> Option<MoveRequest> {
        if !(feed_rate > 0.0) {
            return None;
        }
        let delta: [f32; AXES] = core::array::from_fn(|axis| target[axis] - self.position[axis]);
        let distance = sqrtf(delta.iter().map(|d| d * d).sum());
        if !(distance > 0.0) {
            return None;
        }

        let mut feed_rate = feed_rate;
        for axis in 0..AXES {
            let share = (delta[axis] / distance).abs();
            if share > 0.0 && feed_rate * share > self.max_rates[axis] {
                feed_rate = self.max_rates[axis] / share;
            }
        }

        let axis_speeds = core::array::from_fn(|axis| delta[axis] / distance * feed_rate);
        let target_steps = self.to_steps(target);
        self.position = target;

        Some(MoveRequest {
            target_steps,
            feed_rate,
            distance,
            axis_speeds,
        })
    }

    /// Re-derive the Cartesian position from executed actuator steps
    ///
    /// Used after a stop cut motion short.
    pub fn reset_from_steps(&mut self, steps: [i32; AXES]) {
        let actuator = core::array::from_fn(|axis| steps[axis] as f32 / self.steps_per_mm[axis]);
        self.position = self.transform.actuator_to_cartesian(actuator);
    }
}

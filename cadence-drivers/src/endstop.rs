//! Endstop inputs
//!
//! Polled from a fast periodic task (or the step interrupt itself). A
//! triggered endstop latches its axis in the motion core's [`StopSignal`];
//! the step generator then stops pulsing that axis on its next tick.

use cadence_core::config::PinConfig;
use cadence_core::motion::StopSignal;
use cadence_core::AXES;
use embedded_hal::digital::InputPin;

struct Endstop<P> {
    pin: P,
    config: PinConfig,
}

/// Watches the endstop of every axis that has one
pub struct EndstopMonitor<'s, P> {
    endstops: [Option<Endstop<P>>; AXES],
    stop: &'s StopSignal,
    armed: bool,
}

impl<'s, P: InputPin> EndstopMonitor<'s, P> {
    /// A monitor with no endstops attached, armed
    pub fn new(stop: &'s StopSignal) -> Self {
        Self {
            endstops: core::array::from_fn(|_| None),
            stop,
            armed: true,
        }
    }

    /// Attach the endstop input of `axis`
    pub fn attach(&mut self, axis: usize, pin: P, config: PinConfig) {
        if let Some(slot) = self.endstops.get_mut(axis) {
            *slot = Some(Endstop { pin, config });
        }
    }

    /// Ignore or honour triggers, e.g. while backing off after homing
    pub fn set_armed(&mut self, armed: bool) {
        self.armed = armed;
    }

    /// Whether triggers stop motion
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Sample every endstop
    ///
    /// Returns the mask of axes whose endstop reads active. Newly active
    /// axes are latched in the stop signal if the monitor is armed.
    pub fn poll(&mut self) -> Result<u8, P::Error> {
        let mut active = 0;
        for (axis, endstop) in self.endstops.iter_mut().enumerate() {
            let Some(endstop) = endstop else {
                continue;
            };
            let high = endstop.pin.is_high()?;
            if high != endstop.config.inverted {
                active |= 1 << axis;
                if self.armed && !self.stop.is_stopped(axis) {
                    warn!("endstop hit on axis {}", axis);
                    self.stop.trigger(axis);
                }
            }
        }
        Ok(active)
    }
}

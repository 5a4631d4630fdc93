//! Step/direction actuator bank
//!
//! Drives the STEP, DIR and optional ENABLE line of every actuator through
//! `embedded-hal` output pins. Logical levels are translated through each
//! pin's [`PinConfig`] so inverted wiring is handled here and nowhere else.
//!
//! # Usage
//!
//! ```ignore
//! let mut bank = StepDirBank::new(pins, &config.axes)?;
//! bank.enable(true)?;
//!
//! // In the step timer interrupt:
//! generator.tick(&mut bank)?;
//! // After the configured pulse width:
//! bank.unstep()?;
//! ```

use cadence_core::config::{AxisConfig, PinConfig};
use cadence_core::motion::DirectionBits;
use cadence_core::traits::ActuatorBank;
use cadence_core::AXES;
use embedded_hal::digital::OutputPin;

/// Output pins of one actuator
pub struct AxisPins<P> {
    /// Step pulse output
    pub step: P,
    /// Direction output
    pub dir: P,
    /// Driver enable output, if wired
    pub enable: Option<P>,
}

struct Axis<P> {
    pins: AxisPins<P>,
    step: PinConfig,
    dir: PinConfig,
    enable: PinConfig,
}

/// Set `pin` to the electrical level for the logical `active` state
fn drive<P: OutputPin>(pin: &mut P, config: PinConfig, active: bool) -> Result<(), P::Error> {
    if config.level(active) {
        pin.set_high()
    } else {
        pin.set_low()
    }
}

/// All actuators of the machine as one [`ActuatorBank`]
pub struct StepDirBank<P> {
    axes: [Axis<P>; AXES],
    /// Last latched direction mask
    directions: Option<DirectionBits>,
    enabled: bool,
}

impl<P: OutputPin> StepDirBank<P> {
    /// Take ownership of the pins and drive them to their idle levels
    ///
    /// Step lines start low and drivers start disabled.
    pub fn new(pins: [AxisPins<P>; AXES], config: &[AxisConfig; AXES]) -> Result<Self, P::Error> {
        let mut index = 0;
        let axes = pins.map(|pins| {
            let axis = &config[index];
            index += 1;
            Axis {
                pins,
                step: axis.step_pin,
                dir: axis.dir_pin,
                enable: axis.enable_pin,
            }
        });
        let mut bank = Self {
            axes,
            directions: None,
            enabled: false,
        };
        bank.unstep()?;
        bank.enable(false)?;
        Ok(bank)
    }

    /// Direction mask currently latched on the DIR lines
    pub fn directions(&self) -> Option<DirectionBits> {
        self.directions
    }

    /// Give the pins back
    pub fn release(self) -> [AxisPins<P>; AXES] {
        self.axes.map(|axis| axis.pins)
    }
}

impl<P: OutputPin> ActuatorBank for StepDirBank<P> {
    type Error = P::Error;

    fn set_directions(&mut self, directions: DirectionBits) -> Result<(), P::Error> {
        if self.directions == Some(directions) {
            return Ok(());
        }
        for (index, axis) in self.axes.iter_mut().enumerate() {
            drive(&mut axis.pins.dir, axis.dir, directions.is_negative(index))?;
        }
        self.directions = Some(directions);
        Ok(())
    }

    fn step(&mut self, mask: u8) -> Result<(), P::Error> {
        for (index, axis) in self.axes.iter_mut().enumerate() {
            if mask & (1 << index) != 0 {
                drive(&mut axis.pins.step, axis.step, true)?;
            }
        }
        Ok(())
    }

    fn unstep(&mut self) -> Result<(), P::Error> {
        for axis in self.axes.iter_mut() {
            drive(&mut axis.pins.step, axis.step, false)?;
        }
        Ok(())
    }

    fn enable(&mut self, enabled: bool) -> Result<(), P::Error> {
        for axis in self.axes.iter_mut() {
            if let Some(pin) = axis.pins.enable.as_mut() {
                drive(pin, axis.enable, enabled)?;
            }
        }
        self.enabled = enabled;
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }
}

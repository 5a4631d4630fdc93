//! Step pulse timing
//!
//! A step tick raises the step lines. They must stay asserted for the
//! configured pulse width and then fall before the next tick. The board
//! arms a one-shot reset timer for [`StepPulse::reset_ticks`] after every
//! tick that stepped, and calls [`StepPulse::end`] from its interrupt.

use cadence_core::config::MotionConfig;
use cadence_core::motion::StepOutput;
use cadence_core::traits::ActuatorBank;
use libm::ceilf;

/// Set/reset helper around an [`ActuatorBank`]
pub struct StepPulse {
    /// Pulse width in reset timer ticks
    reset_ticks: u32,
    /// Step lines currently asserted
    asserted: bool,
}

impl StepPulse {
    /// Pulse helper for a reset timer running at `timer_hz`
    ///
    /// The width is rounded up to at least one timer tick.
    pub fn new(config: &MotionConfig, timer_hz: u32) -> Self {
        let ticks = ceilf(config.step_pulse_us as f32 * timer_hz as f32 / 1_000_000.0) as u32;
        Self {
            reset_ticks: ticks.max(1),
            asserted: false,
        }
    }

    /// Reset timer ticks to hold the step lines high
    pub fn reset_ticks(&self) -> u32 {
        self.reset_ticks
    }

    /// Whether a pulse is waiting to be reset
    pub fn is_asserted(&self) -> bool {
        self.asserted
    }

    /// Drive one step tick's output onto the bank
    ///
    /// Returns the number of reset timer ticks to wait before calling
    /// [`end`](Self::end), or `None` when nothing was stepped.
    pub fn begin<A: ActuatorBank>(
        &mut self,
        bank: &mut A,
        output: StepOutput,
    ) -> Result<Option<u32>, A::Error> {
        if !output.has_steps() {
            return Ok(None);
        }
        if self.asserted {
            // Reset timer was missed, finish the previous pulse first
            bank.unstep()?;
        }
        output.apply(bank)?;
        self.asserted = true;
        Ok(Some(self.reset_ticks))
    }

    /// Lower the step lines if a pulse is in progress
    pub fn end<A: ActuatorBank>(&mut self, bank: &mut A) -> Result<(), A::Error> {
        if self.asserted {
            bank.unstep()?;
            self.asserted = false;
        }
        Ok(())
    }
}

//! Planned motion segments
//!
//! A [`Block`] is one straight-line move across all actuators together with
//! its trapezoidal speed profile. Blocks are prepared in place inside the
//! motion queue, revised by the lookahead planner while they are pending,
//! and become read-only once the step generator starts executing them.

use heapless::{String, Vec};
use libm::{ceilf, floorf, sqrtf};

use crate::AXES;

/// Maximum length of one deferred command
pub const MAX_COMMAND_LEN: usize = 48;

/// Maximum deferred commands riding on one block
pub const MAX_BLOCK_COMMANDS: usize = 4;

/// Errors attaching a deferred command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandError {
    /// Command text longer than `MAX_COMMAND_LEN`
    TooLong,
    /// Block already carries `MAX_BLOCK_COMMANDS` commands
    ListFull,
}

/// An opaque zero-duration action executed when its block completes
///
/// The motion core never interprets the text; it is handed to the
/// `CommandExecute` subscribers in attachment order.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeferredCommand(String<MAX_COMMAND_LEN>);

impl DeferredCommand {
    /// Create a command from text
    pub fn new(text: &str) -> Result<Self, CommandError> {
        let mut inner = String::new();
        inner.push_str(text).map_err(|_| CommandError::TooLong)?;
        Ok(Self(inner))
    }

    /// Command text
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

/// One direction bit per axis, set when the axis moves towards negative
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DirectionBits(u8);

impl DirectionBits {
    /// Build from a raw mask
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Raw mask
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Mark `axis` as moving towards negative
    pub fn set_negative(&mut self, axis: usize, negative: bool) {
        if negative {
            self.0 |= 1 << axis;
        } else {
            self.0 &= !(1 << axis);
        }
    }

    /// Whether `axis` moves towards negative
    pub const fn is_negative(self, axis: usize) -> bool {
        self.0 & (1 << axis) != 0
    }
}

/// Speed a body may have and still slow to `target_velocity` within `distance`
///
/// Deceleration is expressed as a negative `acceleration`.
pub fn max_allowable_speed(acceleration: f32, target_velocity: f32, distance: f32) -> f32 {
    sqrtf((target_velocity * target_velocity - 2.0 * acceleration * distance).max(0.0))
}

/// Steps needed to go from `initial_rate` to `target_rate` at `acceleration` steps/s²
pub fn estimate_acceleration_distance(initial_rate: f32, target_rate: f32, acceleration: f32) -> f32 {
    if acceleration == 0.0 {
        return 0.0;
    }
    (target_rate * target_rate - initial_rate * initial_rate) / (2.0 * acceleration)
}

/// Step at which to stop accelerating and start decelerating when there is
/// no room to reach the nominal rate
pub fn intersection_distance(
    initial_rate: f32,
    final_rate: f32,
    acceleration: f32,
    distance: f32,
) -> f32 {
    if acceleration == 0.0 {
        return 0.0;
    }
    (2.0 * acceleration * distance - initial_rate * initial_rate + final_rate * final_rate)
        / (4.0 * acceleration)
}

fn unit_factor(factor: f32) -> f32 {
    if factor >= 1.0 {
        1.0
    } else if factor > 0.0 {
        factor
    } else {
        0.0
    }
}

/// One planned motion segment
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Block {
    /// Absolute step count per actuator
    pub steps: [u32; AXES],
    /// Largest per-actuator step count; one step event per unit
    pub steps_event_count: u32,
    /// Axes moving towards negative
    pub direction_bits: DirectionBits,
    /// Cartesian travel in mm
    pub millimeters: f32,
    /// Requested speed in mm/s
    pub nominal_speed: f32,
    /// Step event rate at nominal speed, in steps/s
    pub nominal_rate: u32,
    /// Planned speed at the start of the block, mm/s
    pub entry_speed: f32,
    /// Planned speed at the end of the block, mm/s
    pub exit_speed: f32,
    /// Junction speed limit from the jerk constraint, mm/s
    pub max_entry_speed: f32,
    /// Acceleration in mm/s²
    pub acceleration: f32,
    /// Step rate change per trapezoid generator tick
    pub rate_delta: f32,
    /// Step rate at the first step event
    pub initial_rate: u32,
    /// Step rate at the last step event
    pub final_rate: u32,
    /// Step event at which acceleration ends
    pub accelerate_until: u32,
    /// Step event after which deceleration starts
    pub decelerate_after: u32,
    /// Entry speed changed since the last trapezoid computation
    pub recalculate_flag: bool,
    /// Nominal speed is reachable from rest within this block
    pub nominal_length_flag: bool,
    commands: Vec<DeferredCommand, MAX_BLOCK_COMMANDS>,
}

impl Default for Block {
    fn default() -> Self {
        Self::new()
    }
}

impl Block {
    /// An empty block
    pub const fn new() -> Self {
        Self {
            steps: [0; AXES],
            steps_event_count: 0,
            direction_bits: DirectionBits(0),
            millimeters: 0.0,
            nominal_speed: 0.0,
            nominal_rate: 0,
            entry_speed: 0.0,
            exit_speed: 0.0,
            max_entry_speed: 0.0,
            acceleration: 0.0,
            rate_delta: 0.0,
            initial_rate: 0,
            final_rate: 0,
            accelerate_until: 0,
            decelerate_after: 0,
            recalculate_flag: false,
            nominal_length_flag: false,
            commands: Vec::new(),
        }
    }

    /// Reset to the empty state, dropping any attached commands
    pub fn clear(&mut self) {
        *self = Self::new();
    }

    /// Whether this block moves any actuator
    pub fn has_motion(&self) -> bool {
        self.steps_event_count > 0
    }

    /// Whether this block carries deferred commands
    pub fn has_commands(&self) -> bool {
        !self.commands.is_empty()
    }

    /// Deferred commands, in attachment order
    pub fn commands(&self) -> &[DeferredCommand] {
        &self.commands
    }

    /// Attach a deferred command to run when this block completes
    pub fn append_command(&mut self, command: DeferredCommand) -> Result<(), CommandError> {
        self.commands
            .push(command)
            .map_err(|_| CommandError::ListFull)
    }

    /// Entry speed as a fraction of nominal speed
    pub fn entry_factor(&self) -> f32 {
        self.speed_factor(self.entry_speed)
    }

    /// Exit speed as a fraction of nominal speed
    pub fn exit_factor(&self) -> f32 {
        self.speed_factor(self.exit_speed)
    }

    fn speed_factor(&self, speed: f32) -> f32 {
        if self.nominal_speed > 0.0 {
            unit_factor(speed / self.nominal_speed)
        } else {
            0.0
        }
    }

    /// Acceleration in step events per second squared
    pub fn step_acceleration(&self) -> f32 {
        if self.millimeters > 0.0 {
            self.steps_event_count as f32 / self.millimeters * self.acceleration
        } else {
            0.0
        }
    }

    /// Conservative entry and exit factor used before lookahead has run
    pub fn compute_safe_speed_factor(&self, max_jerk: f32) -> f32 {
        // Producers never enqueue zero-speed moves
        if self.nominal_speed <= 0.0 {
            return 1.0;
        }
        unit_factor(max_jerk / self.nominal_speed)
    }

    /// Compute the trapezoid for the given entry and exit speed factors
    ///
    /// Afterwards `accelerate_until <= decelerate_after <= steps_event_count`
    /// and both the initial and the final rate are at most the nominal rate.
    pub fn calculate_trapezoid(&mut self, entry_factor: f32, exit_factor: f32) {
        let nominal = self.nominal_rate as f32;
        self.initial_rate = (ceilf(nominal * unit_factor(entry_factor)) as u32).min(self.nominal_rate);
        self.final_rate = (ceilf(nominal * unit_factor(exit_factor)) as u32).min(self.nominal_rate);

        let count = i64::from(self.steps_event_count);
        let acceleration = self.step_acceleration();
        if count == 0 || acceleration <= 0.0 {
            self.accelerate_until = 0;
            self.decelerate_after = count as u32;
            return;
        }

        let initial = self.initial_rate as f32;
        let final_rate = self.final_rate as f32;

        let mut accelerate_steps =
            ceilf(estimate_acceleration_distance(initial, nominal, acceleration)) as i64;
        let decelerate_steps =
            floorf(estimate_acceleration_distance(nominal, final_rate, -acceleration)) as i64;
        let mut plateau_steps = count - accelerate_steps - decelerate_steps;

        // No room to cruise: meet in the middle
        if plateau_steps < 0 {
            accelerate_steps = ceilf(intersection_distance(
                initial,
                final_rate,
                acceleration,
                count as f32,
            )) as i64;
            accelerate_steps = accelerate_steps.clamp(0, count);
            plateau_steps = 0;
        }

        self.accelerate_until = accelerate_steps as u32;
        self.decelerate_after = (accelerate_steps + plateau_steps) as u32;
    }

    /// Lookahead pass, newest to oldest
    ///
    /// Lowers the entry speed to what still lets the block slow to
    /// `next_entry_speed` (the following block's entry, or the planner's
    /// minimum speed for the newest block) within its own length.
    pub fn reverse_pass(&mut self, next_entry_speed: f32) {
        let constrained = !self.nominal_length_flag && self.max_entry_speed > next_entry_speed;
        // Cruising into a junction it can always slow down for
        if self.entry_speed == self.max_entry_speed && !constrained {
            return;
        }
        let entry = if constrained {
            self.max_entry_speed.min(max_allowable_speed(
                -self.acceleration,
                next_entry_speed,
                self.millimeters,
            ))
        } else {
            self.max_entry_speed
        };
        if entry != self.entry_speed {
            self.entry_speed = entry;
            self.recalculate_flag = true;
        }
    }

    /// Lookahead pass, oldest to newest
    ///
    /// `previous_max_exit` is the fastest the previous block can be going
    /// when it ends: its committed exit speed if it is already executing,
    /// otherwise [`Block::max_exit_speed`].
    pub fn forward_pass(&mut self, previous_max_exit: f32) {
        let reachable = previous_max_exit
            .min(self.nominal_speed)
            .min(self.max_entry_speed);
        if reachable < self.entry_speed {
            self.entry_speed = reachable;
            self.recalculate_flag = true;
        }
    }

    /// Fastest this block can be going at its end given its entry speed
    pub fn max_exit_speed(&self) -> f32 {
        if self.nominal_length_flag {
            return self.nominal_speed;
        }
        max_allowable_speed(-self.acceleration, self.entry_speed, self.millimeters)
            .min(self.nominal_speed)
    }
}

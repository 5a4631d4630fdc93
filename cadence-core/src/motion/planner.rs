//! Lookahead motion planner
//!
//! Turns step-space move requests into blocks and keeps the speed profiles
//! of all pending blocks jerk-limited and physically reachable.
//!
//! Every append replans the whole pending window in three passes:
//!
//! 1. Reverse (newest to oldest): how slow must each block already be so it
//!    can still reach the entry speed the following block commits to.
//! 2. Forward (oldest to newest): how fast can each block actually be going
//!    given what the previous, now fixed, block allows.
//! 3. Trapezoids: turn the resulting entry speeds into step-rate profiles.
//!
//! The forward pass starts from the committed exit speed of the block just
//! before the window, which the queue tracks even after that block has been
//! reclaimed.

use libm::{ceilf, sqrtf};

use super::block::max_allowable_speed;
use super::conveyor::Conveyor;
use crate::config::MotionConfig;
use crate::events::{EventBus, StepperWakeUp};
use crate::kinematics::MoveRequest;
use crate::AXES;

/// Planner tuning, taken from [`MotionConfig`]
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PlannerConfig {
    /// Acceleration in mm/s²
    pub acceleration: f32,
    /// Largest speed change allowed at a junction, mm/s
    pub max_jerk: f32,
    /// Speed the newest block plans to end at, mm/s
    pub minimum_planner_speed: f32,
    /// Trapezoid generator tick rate in Hz
    pub acceleration_ticks_per_second: u32,
}

impl From<&MotionConfig> for PlannerConfig {
    fn from(config: &MotionConfig) -> Self {
        Self {
            acceleration: config.acceleration,
            max_jerk: config.max_jerk,
            minimum_planner_speed: config.minimum_planner_speed,
            acceleration_ticks_per_second: config.acceleration_ticks_per_second,
        }
    }
}

/// Block producer and lookahead planner
pub struct Planner<'e> {
    config: PlannerConfig,
    /// Step position after the last queued move
    position: [i32; AXES],
    /// Per-axis velocity of the last queued move, mm/s
    previous_speeds: [f32; AXES],
    previous_nominal_speed: f32,
    events: &'e EventBus<'e>,
}

impl<'e> Planner<'e> {
    /// Create a planner at step position zero
    pub fn new(config: PlannerConfig, events: &'e EventBus<'e>) -> Self {
        Self {
            config,
            position: [0; AXES],
            previous_speeds: [0.0; AXES],
            previous_nominal_speed: 0.0,
            events,
        }
    }

    /// Planner tuning in use
    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Step position after the last queued move
    pub fn position(&self) -> [i32; AXES] {
        self.position
    }

    /// Resynchronize the logical position, e.g. after an endstop stop
    ///
    /// Also forgets the previous move direction, so the next block starts
    /// from rest.
    pub fn reset_position(&mut self, position: [i32; AXES]) {
        self.position = position;
        self.previous_speeds = [0.0; AXES];
        self.previous_nominal_speed = 0.0;
    }

    /// Queue a move to `target` (absolute steps)
    ///
    /// `feed_rate` is in mm/s, `distance` the Cartesian length in mm and
    /// `axis_speeds` the per-axis velocity vector in mm/s. Waits, calling
    /// `idle`, while the queue is full. Returns `false` if the move was
    /// dropped because it does not move anything.
    pub fn append_block<const N: usize>(
        &mut self,
        conveyor: &mut Conveyor<'_, N>,
        target: [i32; AXES],
        feed_rate: f32,
        distance: f32,
        axis_speeds: [f32; AXES],
        idle: &mut dyn FnMut(),
    ) -> bool {
        if target == self.position {
            return false;
        }
        if !(feed_rate > 0.0 && distance > 0.0) {
            warn!("dropping move with feed {} over {} mm", feed_rate, distance);
            return false;
        }

        // Commands attached after the previous move run before this one
        conveyor.push_command_carrier(idle);
        conveyor.wait_for_space(idle);

        let from_rest = !conveyor.has_pending() || self.previous_nominal_speed <= 0.0;
        let config = self.config;
        let block = conveyor.head_block();
        block.clear();

        for axis in 0..AXES {
            let delta = i64::from(target[axis]) - i64::from(self.position[axis]);
            block.steps[axis] = delta.unsigned_abs() as u32;
            block.direction_bits.set_negative(axis, delta < 0);
        }
        block.steps_event_count = block.steps.iter().copied().max().unwrap_or(0);
        block.millimeters = distance;
        block.nominal_speed = feed_rate;
        block.nominal_rate =
            (ceilf(block.steps_event_count as f32 * feed_rate / distance) as u32).max(1);
        block.acceleration = config.acceleration;
        // Constant acceleration along the path whatever the move angle
        block.rate_delta = block.steps_event_count as f32 / distance * config.acceleration
            / config.acceleration_ticks_per_second as f32;

        let mut vmax_junction = (config.max_jerk / 2.0).min(feed_rate);
        if !from_rest {
            let jerk = sqrtf(
                axis_speeds
                    .iter()
                    .zip(self.previous_speeds.iter())
                    .map(|(current, previous)| (current - previous) * (current - previous))
                    .sum(),
            );
            vmax_junction = self.previous_nominal_speed.min(feed_rate);
            if jerk > config.max_jerk {
                vmax_junction *= config.max_jerk / jerk;
            }
        }
        block.max_entry_speed = vmax_junction;

        let v_allowable = max_allowable_speed(
            -config.acceleration,
            config.minimum_planner_speed,
            distance,
        );
        block.entry_speed = vmax_junction.min(v_allowable);
        block.nominal_length_flag = feed_rate <= v_allowable;
        block.recalculate_flag = true;

        // Executable as-is until the lookahead below revises it
        let safe = block.compute_safe_speed_factor(config.max_jerk);
        block.exit_speed = feed_rate * safe;
        block.calculate_trapezoid(safe, safe);

        self.position = target;
        self.previous_speeds = axis_speeds;
        self.previous_nominal_speed = feed_rate;

        conveyor.queue_head_block(idle);
        self.recalculate(conveyor);
        self.events.publish::<StepperWakeUp>(&());
        true
    }

    /// Queue a move prepared by a [`MoveBuilder`](crate::kinematics::MoveBuilder)
    pub fn append_move<const N: usize>(
        &mut self,
        conveyor: &mut Conveyor<'_, N>,
        request: &MoveRequest,
        idle: &mut dyn FnMut(),
    ) -> bool {
        self.append_block(
            conveyor,
            request.target_steps,
            request.feed_rate,
            request.distance,
            request.axis_speeds,
            idle,
        )
    }

    /// Replan every pending block the step generator has not started
    ///
    /// Running it twice in a row leaves the blocks unchanged the second time.
    pub fn recalculate<const N: usize>(&self, conveyor: &mut Conveyor<'_, N>) {
        let minimum_speed = self.config.minimum_planner_speed;
        let mut window = conveyor.plan_window();
        let count = window.len();
        if count == 0 {
            return;
        }

        let mut next_entry = minimum_speed;
        for position in (0..count).rev() {
            let block = window.block_mut(position);
            if block.has_motion() {
                block.reverse_pass(next_entry);
            } else {
                // Command-only blocks pass the junction speed through
                block.max_entry_speed = next_entry;
                block.entry_speed = next_entry;
            }
            next_entry = block.entry_speed;
        }

        let mut previous_max_exit = window.boundary_exit_speed();
        for position in 0..count {
            let block = window.block_mut(position);
            if block.has_motion() {
                block.forward_pass(previous_max_exit);
                previous_max_exit = block.max_exit_speed();
            } else {
                block.entry_speed = block.entry_speed.min(previous_max_exit);
                previous_max_exit = block.entry_speed;
            }
        }

        for position in 0..count {
            let exit_speed = if position + 1 < count {
                window.block(position + 1).entry_speed
            } else {
                minimum_speed
            };
            let block = window.block_mut(position);
            block.exit_speed = exit_speed;
            let (entry_factor, exit_factor) = (block.entry_factor(), block.exit_factor());
            block.calculate_trapezoid(entry_factor, exit_factor);
            block.recalculate_flag = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motion::block::Block;
    use crate::motion::conveyor::connect;
    use crate::kinematics::{CartesianTransform, MoveBuilder};
    use crate::motion::queue::MotionQueue;
    use crate::motion::stepgen::StepGenerator;
    use crate::motion::stop::StopSignal;
    use core::sync::atomic::{AtomicU32, Ordering};
    use proptest::prelude::*;
    use std::vec::Vec as StdVec;

    fn config() -> PlannerConfig {
        PlannerConfig {
            acceleration: 1000.0,
            max_jerk: 4.0,
            minimum_planner_speed: 0.0,
            acceleration_ticks_per_second: 100,
        }
    }

    /// Pending blocks, oldest first
    fn snapshot<const N: usize>(conveyor: &mut Conveyor<'_, N>) -> StdVec<Block> {
        let window = conveyor.plan_window();
        (0..window.len()).map(|i| window.block(i).clone()).collect()
    }

    /// Move along X by `mm` at `feed` mm/s with 100 steps/mm
    fn move_x<const N: usize>(
        planner: &mut Planner<'_>,
        conveyor: &mut Conveyor<'_, N>,
        mm: f32,
        feed: f32,
    ) -> bool {
        let mut target = planner.position();
        target[0] += (mm * 100.0) as i32;
        let direction = if mm < 0.0 { -1.0 } else { 1.0 };
        planner.append_block(
            conveyor,
            target,
            feed,
            mm.abs(),
            [direction * feed, 0.0, 0.0],
            &mut || {},
        )
    }

    #[test]
    fn test_zero_length_move_is_dropped() {
        let bus = EventBus::new();
        let stop = StopSignal::new();
        let mut queue = MotionQueue::<8>::new(8).unwrap();
        let (mut conveyor, _feed) = connect(&mut queue, &stop);
        let mut planner = Planner::new(config(), &bus);

        assert!(!planner.append_block(&mut conveyor, [0; AXES], 10.0, 0.0, [0.0; AXES], &mut || {}));
        assert!(conveyor.is_queue_empty());
    }

    #[test]
    fn test_block_fields() {
        let bus = EventBus::new();
        let stop = StopSignal::new();
        let mut queue = MotionQueue::<8>::new(8).unwrap();
        let (mut conveyor, _feed) = connect(&mut queue, &stop);
        let mut planner = Planner::new(config(), &bus);

        // 3-4-5 triangle, 100 steps/mm
        assert!(planner.append_block(
            &mut conveyor,
            [-300, 400, 0],
            50.0,
            5.0,
            [-30.0, 40.0, 0.0],
            &mut || {},
        ));
        let blocks = snapshot(&mut conveyor);
        let block = &blocks[0];
        assert_eq!(block.steps, [300, 400, 0]);
        assert_eq!(block.steps_event_count, 400);
        assert!(block.direction_bits.is_negative(0));
        assert!(!block.direction_bits.is_negative(1));
        assert_eq!(block.nominal_rate, 4000);
        // 400 / 5 * 1000 / 100
        assert_eq!(block.rate_delta, 800.0);
        assert_eq!(planner.position(), [-300, 400, 0]);
    }

    #[test]
    fn test_wake_up_published() {
        let wakes = AtomicU32::new(0);
        let on_wake = |_: &()| {
            wakes.fetch_add(1, Ordering::Relaxed);
        };
        let mut bus = EventBus::new();
        bus.subscribe::<StepperWakeUp>(&on_wake).unwrap();

        let stop = StopSignal::new();
        let mut queue = MotionQueue::<8>::new(8).unwrap();
        let (mut conveyor, _feed) = connect(&mut queue, &stop);
        let mut planner = Planner::new(config(), &bus);
        move_x(&mut planner, &mut conveyor, 1.0, 10.0);
        move_x(&mut planner, &mut conveyor, 1.0, 10.0);
        assert_eq!(wakes.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_single_block_starts_and_ends_at_rest() {
        let bus = EventBus::new();
        let stop = StopSignal::new();
        let mut queue = MotionQueue::<8>::new(8).unwrap();
        let (mut conveyor, _feed) = connect(&mut queue, &stop);
        let mut planner = Planner::new(config(), &bus);

        // 1000 steps at 100 steps/s
        move_x(&mut planner, &mut conveyor, 10.0, 1.0);
        let block = &snapshot(&mut conveyor)[0];
        assert_eq!(block.nominal_rate, 100);
        assert_eq!(block.entry_speed, 0.0);
        assert_eq!(block.exit_speed, 0.0);
        // 100² / (2 · 100000 steps/s²) rounds up to one step
        assert_eq!(block.accelerate_until, 1);
        assert_eq!(block.decelerate_after, 1000);
    }

    #[test]
    fn test_collinear_blocks_cruise_through_junctions() {
        let bus = EventBus::new();
        let stop = StopSignal::new();
        let mut queue = MotionQueue::<8>::new(8).unwrap();
        let (mut conveyor, _feed) = connect(&mut queue, &stop);
        let mut planner = Planner::new(config(), &bus);

        for _ in 0..3 {
            move_x(&mut planner, &mut conveyor, 10.0, 10.0);
        }
        let blocks = snapshot(&mut conveyor);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[1].entry_factor(), 1.0);
        assert_eq!(blocks[1].exit_factor(), 1.0);
        assert_eq!(blocks[1].initial_rate, blocks[1].nominal_rate);
        assert_eq!(blocks[1].final_rate, blocks[1].nominal_rate);
        assert_eq!(blocks[0].entry_speed, 0.0);
        assert_eq!(blocks[2].exit_speed, 0.0);
    }

    #[test]
    fn test_reversal_junction_limited_by_jerk() {
        let bus = EventBus::new();
        let stop = StopSignal::new();
        let mut queue = MotionQueue::<8>::new(8).unwrap();
        let (mut conveyor, _feed) = connect(&mut queue, &stop);
        let mut planner = Planner::new(config(), &bus);

        move_x(&mut planner, &mut conveyor, 10.0, 10.0);
        move_x(&mut planner, &mut conveyor, -10.0, 10.0);
        let blocks = snapshot(&mut conveyor);

        let junction = blocks[1].entry_speed;
        assert_eq!(junction, blocks[0].exit_speed);
        // Full reversal: jerk 20 mm/s against a 4 mm/s limit
        assert!(junction <= config().max_jerk / 2.0 + 1e-4);
        assert!(junction <= blocks[1].compute_safe_speed_factor(config().max_jerk) * 10.0);
    }

    #[test]
    fn test_recalculate_is_idempotent() {
        let bus = EventBus::new();
        let stop = StopSignal::new();
        let mut queue = MotionQueue::<8>::new(8).unwrap();
        let (mut conveyor, _feed) = connect(&mut queue, &stop);
        let mut planner = Planner::new(config(), &bus);

        move_x(&mut planner, &mut conveyor, 2.0, 30.0);
        move_x(&mut planner, &mut conveyor, 0.5, 80.0);
        planner.append_block(
            &mut conveyor,
            [250, 300, 0],
            20.0,
            3.0,
            [0.0, 20.0, 0.0],
            &mut || {},
        );
        move_x(&mut planner, &mut conveyor, -1.0, 40.0);

        planner.recalculate(&mut conveyor);
        let first = snapshot(&mut conveyor);
        planner.recalculate(&mut conveyor);
        let second = snapshot(&mut conveyor);
        assert_eq!(first, second);
    }

    #[test]
    fn test_reset_position_starts_from_rest() {
        let bus = EventBus::new();
        let stop = StopSignal::new();
        let mut queue = MotionQueue::<8>::new(8).unwrap();
        let (mut conveyor, _feed) = connect(&mut queue, &stop);
        let mut planner = Planner::new(config(), &bus);

        planner.reset_position([500, 0, 0]);
        assert!(!move_x(&mut planner, &mut conveyor, 0.0, 10.0));
        move_x(&mut planner, &mut conveyor, 1.0, 10.0);
        assert_eq!(planner.position(), [600, 0, 0]);
        assert_eq!(snapshot(&mut conveyor)[0].steps[0], 100);
    }

    #[test]
    fn test_command_carrier_keeps_junction_speed() {
        let bus = EventBus::new();
        let stop = StopSignal::new();
        let mut queue = MotionQueue::<8>::new(8).unwrap();
        let (mut conveyor, mut feed) = connect(&mut queue, &stop);
        let mut planner = Planner::new(config(), &bus);

        move_x(&mut planner, &mut conveyor, 10.0, 10.0);
        conveyor.ensure_running();
        feed.begin().unwrap();
        conveyor
            .append_command(
                crate::motion::block::DeferredCommand::new("M106").unwrap(),
                &mut || {},
            )
            .unwrap();
        move_x(&mut planner, &mut conveyor, 10.0, 10.0);
        move_x(&mut planner, &mut conveyor, 10.0, 10.0);

        let blocks = snapshot(&mut conveyor);
        assert_eq!(blocks.len(), 3);
        assert!(!blocks[0].has_motion());
        assert!(blocks[0].has_commands());
        // Junction speed passes through the carrier unchanged
        assert_eq!(blocks[0].entry_speed, blocks[1].entry_speed);
        assert_eq!(blocks[0].exit_speed, blocks[1].entry_speed);
    }

    #[test]
    fn test_append_waits_for_room_when_queue_full() {
        let bus = EventBus::new();
        let stop = StopSignal::new();
        let timing = MotionConfig {
            base_frequency: 10_000,
            minimum_steps_per_second: 1000,
            ..MotionConfig::default()
        };
        let mut queue = MotionQueue::<4>::new(4).unwrap();
        let (mut conveyor, feed) = connect(&mut queue, &stop);
        let mut generator = StepGenerator::new(feed, &stop, &bus, &timing);
        let mut planner = Planner::new(config(), &bus);

        for _ in 0..3 {
            assert!(move_x(&mut planner, &mut conveyor, 1.0, 10.0));
        }
        assert!(conveyor.is_queue_full());

        let mut ticks = 0u32;
        let target = [300, 50, 0];
        assert!(planner.append_block(
            &mut conveyor,
            target,
            10.0,
            0.5,
            [0.0, 10.0, 0.0],
            &mut || {
                generator.step_tick();
                ticks += 1;
            },
        ));
        assert!(ticks > 0);
        assert_eq!(planner.position(), target);
        assert!(conveyor.queue().cursors_ordered());

        for _ in 0..1_000_000 {
            generator.step_tick();
            conveyor.on_idle();
            conveyor.ensure_running();
            if conveyor.is_queue_empty() && !generator.is_busy() {
                break;
            }
        }
        assert!(conveyor.is_queue_empty());
        assert_eq!(generator.executed_position(), target);
    }

    #[test]
    fn test_append_move_from_builder() {
        let bus = EventBus::new();
        let stop = StopSignal::new();
        let mut queue = MotionQueue::<8>::new(8).unwrap();
        let (mut conveyor, _feed) = connect(&mut queue, &stop);
        let mut planner = Planner::new(config(), &bus);
        let mut builder = MoveBuilder::new(CartesianTransform, &MotionConfig::with_default_pins());

        let request = builder.plan_move([1.0, 2.0, 0.0], 20.0).unwrap();
        assert!(planner.append_move(&mut conveyor, &request, &mut || {}));
        // 80 steps/mm
        assert_eq!(planner.position(), [80, 160, 0]);
        assert_eq!(snapshot(&mut conveyor)[0].steps_event_count, 160);
    }

    proptest! {
        #[test]
        fn prop_junctions_are_reachable(
            moves in proptest::collection::vec(
                (-2000i32..2000, -2000i32..2000, 1.0f32..200.0),
                1..12,
            ),
        ) {
            let bus = EventBus::new();
            let stop = StopSignal::new();
            let mut queue = MotionQueue::<16>::new(16).unwrap();
            let (mut conveyor, _feed) = connect(&mut queue, &stop);
            let mut planner = Planner::new(config(), &bus);

            for (dx, dy, feed) in moves {
                let position = planner.position();
                let target = [position[0] + dx, position[1] + dy, 0];
                let (x, y) = (dx as f32 / 100.0, dy as f32 / 100.0);
                let distance = sqrtf(x * x + y * y);
                if distance <= 0.0 {
                    continue;
                }
                let speeds = [x / distance * feed, y / distance * feed, 0.0];
                planner.append_block(&mut conveyor, target, feed, distance, speeds, &mut || {});
            }

            let acceleration = config().acceleration;
            let blocks = snapshot(&mut conveyor);
            let tolerance = 1e-3;
            for (i, block) in blocks.iter().enumerate() {
                prop_assert!(block.entry_speed <= block.nominal_speed + tolerance);
                prop_assert!(block.entry_speed <= block.max_entry_speed + tolerance);
                let exit = blocks.get(i + 1).map_or(0.0, |next| next.entry_speed);
                prop_assert!((block.exit_speed - exit).abs() <= tolerance);
                // Can slow down to the next junction
                prop_assert!(
                    block.entry_speed
                        <= max_allowable_speed(-acceleration, exit, block.millimeters) + tolerance
                );
                // Can speed up to the next junction
                prop_assert!(
                    exit <= max_allowable_speed(-acceleration, block.entry_speed, block.millimeters)
                        + tolerance
                );
                prop_assert!(block.accelerate_until <= block.decelerate_after);
                prop_assert!(block.decelerate_after <= block.steps_event_count);
            }
        }
    }
}

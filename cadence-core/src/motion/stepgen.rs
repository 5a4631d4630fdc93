//! Step generator
//!
//! Interrupt-side consumer of the motion queue. Two entry points are driven
//! by two periodic timers:
//!
//! - [`StepGenerator::step_tick`] at the base frequency: advances a 16.16
//!   phase accumulator by `rate / base_frequency` and, on every overflow,
//!   runs one Bresenham step event across all actuators
//! - [`StepGenerator::trapezoid_tick`] at the acceleration tick rate: moves
//!   the step rate along the block's trapezoid
//!
//! Neither ever blocks or reports an error. A block the planner is still
//! revising is simply not started until a later tick.

use libm::ceilf;

use super::block::{Block, DirectionBits};
use super::conveyor::BlockFeed;
use super::stop::StopSignal;
use crate::config::MotionConfig;
use crate::events::{BlockBegin, BlockEnd, CommandExecute, EventBus, SpeedChange, StepRate};
use crate::fixed::Fixed16;
use crate::traits::ActuatorBank;
use crate::AXES;

/// Pins to drive after one step tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StepOutput {
    /// One bit per actuator to pulse
    pub step: u8,
    /// Direction mask of the executing block
    pub direction: DirectionBits,
}

impl StepOutput {
    /// Nothing to pulse
    pub const fn idle() -> Self {
        Self {
            step: 0,
            direction: DirectionBits::from_bits(0),
        }
    }

    /// Whether any actuator steps
    pub fn has_steps(&self) -> bool {
        self.step != 0
    }

    /// Latch directions and raise step lines
    ///
    /// The caller lowers them with [`ActuatorBank::unstep`] once the
    /// configured pulse width has elapsed.
    pub fn apply<A: ActuatorBank>(&self, bank: &mut A) -> Result<(), A::Error> {
        if !self.has_steps() {
            return Ok(());
        }
        bank.set_directions(self.direction)?;
        bank.step(self.step)
    }
}

/// Position within the current block's speed profile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RampPhase {
    /// No block executing
    Idle,
    /// Ramping up towards the nominal rate
    Accelerating,
    /// Holding the nominal rate
    Cruising,
    /// Ramping down towards the final rate
    Decelerating,
}

/// Working copy of the executing block
struct Execution {
    index: usize,
    steps: [u32; AXES],
    remaining: [u32; AXES],
    counters: [i64; AXES],
    event_count: u32,
    events_completed: u32,
    direction: DirectionBits,
    nominal_rate: u32,
    final_rate: u32,
    rate_delta: f32,
    accelerate_until: u32,
    decelerate_after: u32,
    rate: f32,
    increment: Fixed16,
    phase: Fixed16,
    interrupted: bool,
}

impl Execution {
    fn new(index: usize, block: &Block) -> Self {
        let event_count = block.steps_event_count;
        Self {
            index,
            steps: block.steps,
            remaining: block.steps,
            counters: [-i64::from(event_count / 2); AXES],
            event_count,
            events_completed: 0,
            direction: block.direction_bits,
            nominal_rate: block.nominal_rate,
            final_rate: block.final_rate,
            rate_delta: block.rate_delta,
            accelerate_until: block.accelerate_until,
            decelerate_after: block.decelerate_after,
            rate: 0.0,
            increment: Fixed16::ZERO,
            phase: Fixed16::ZERO,
            interrupted: false,
        }
    }

    fn ramp_phase(&self) -> RampPhase {
        if self.events_completed < self.accelerate_until {
            RampPhase::Accelerating
        } else if self.events_completed > self.decelerate_after {
            RampPhase::Decelerating
        } else {
            RampPhase::Cruising
        }
    }

    /// One Bresenham step event; returns the step mask
    fn step_event(&mut self) -> u8 {
        let mut mask = 0;
        for axis in 0..AXES {
            if self.remaining[axis] == 0 {
                continue;
            }
            self.counters[axis] += i64::from(self.steps[axis]);
            if self.counters[axis] > 0 {
                self.counters[axis] -= i64::from(self.event_count);
                self.remaining[axis] -= 1;
                mask |= 1 << axis;
            }
        }
        self.events_completed += 1;
        mask
    }

    fn is_complete(&self) -> bool {
        self.events_completed >= self.event_count || self.remaining.iter().all(|&r| r == 0)
    }
}

/// Real-time block executor
pub struct StepGenerator<'q, 'e, const N: usize> {
    feed: BlockFeed<'q, N>,
    stop: &'q StopSignal,
    events: &'e EventBus<'e>,
    base_frequency: u32,
    minimum_rate: u32,
    current: Option<Execution>,
    /// Executed step position
    position: [i32; AXES],
}

impl<'q, 'e, const N: usize> StepGenerator<'q, 'e, N> {
    /// Create an idle step generator
    pub fn new(
        feed: BlockFeed<'q, N>,
        stop: &'q StopSignal,
        events: &'e EventBus<'e>,
        config: &MotionConfig,
    ) -> Self {
        Self {
            feed,
            stop,
            events,
            base_frequency: config.base_frequency,
            minimum_rate: config.minimum_steps_per_second.min(config.base_frequency),
            current: None,
            position: [0; AXES],
        }
    }

    /// Whether a block is executing
    pub fn is_busy(&self) -> bool {
        self.current.is_some()
    }

    /// Ramp phase of the executing block
    pub fn phase(&self) -> RampPhase {
        self.current
            .as_ref()
            .map_or(RampPhase::Idle, Execution::ramp_phase)
    }

    /// Current step event rate in steps/s, zero when idle
    pub fn step_rate(&self) -> u32 {
        self.current
            .as_ref()
            .map_or(0, |execution| ceilf(execution.rate) as u32)
    }

    /// Step position actually emitted so far
    ///
    /// After a stop this is the position to resynchronize the planner to.
    pub fn executed_position(&self) -> [i32; AXES] {
        self.position
    }

    /// Overwrite the executed position, e.g. after homing
    pub fn set_position(&mut self, position: [i32; AXES]) {
        self.position = position;
    }

    /// Step timer tick
    pub fn step_tick(&mut self) -> StepOutput {
        if self.current.is_none() {
            if self.stop.is_active() {
                // Nothing may start while a stop is latched
                if self.feed.has_pending() {
                    self.feed.abort();
                }
                return StepOutput::idle();
            }
            let next = self.feed.begin();
            self.advance(next);
        }

        let stop_mask = self.stop.mask();
        let Some(execution) = self.current.as_mut() else {
            return StepOutput::idle();
        };

        if stop_mask != 0 {
            for axis in 0..AXES {
                if stop_mask & (1 << axis) != 0 && execution.remaining[axis] > 0 {
                    execution.remaining[axis] = 0;
                    execution.interrupted = true;
                }
            }
            if execution.interrupted && execution.is_complete() {
                self.cancel();
                return StepOutput::idle();
            }
        }

        execution.phase = execution.phase.saturating_add(execution.increment);
        if execution.phase < Fixed16::ONE {
            return StepOutput::idle();
        }
        execution.phase = execution.phase.frac();

        let mask = execution.step_event();
        let direction = execution.direction;
        for axis in 0..AXES {
            if mask & (1 << axis) != 0 {
                self.position[axis] += if direction.is_negative(axis) { -1 } else { 1 };
            }
        }
        if execution.is_complete() {
            if execution.interrupted {
                self.cancel();
            } else {
                self.complete_current();
            }
        }

        StepOutput {
            step: mask,
            direction,
        }
    }

    /// Run one step tick and drive the actuators
    pub fn tick<A: ActuatorBank>(&mut self, bank: &mut A) -> Result<StepOutput, A::Error> {
        let output = self.step_tick();
        output.apply(bank)?;
        Ok(output)
    }

    /// Acceleration timer tick
    pub fn trapezoid_tick(&mut self) {
        let minimum_rate = self.minimum_rate as f32;
        let base = self.base_frequency as f32;
        let Some(execution) = self.current.as_mut() else {
            return;
        };

        let nominal = execution.nominal_rate as f32;
        let mut rate = execution.rate;
        match execution.ramp_phase() {
            RampPhase::Accelerating => {
                rate = (rate + execution.rate_delta).min(nominal);
            }
            RampPhase::Decelerating => {
                let floor = (execution.final_rate as f32).max(minimum_rate);
                if rate > floor {
                    rate = (rate - execution.rate_delta).max(floor);
                }
            }
            RampPhase::Cruising => {
                if execution.decelerate_after > execution.accelerate_until {
                    rate = nominal;
                }
            }
            RampPhase::Idle => {}
        }
        let rate = rate.max(minimum_rate).min(base);
        if rate != execution.rate {
            self.set_rate(rate);
        }
    }

    /// Start blocks from `next` until one has motion to execute
    fn advance(&mut self, mut next: Option<usize>) {
        if next.is_some() && self.stop.is_active() {
            // Nothing may start while a stop is latched
            self.current = None;
            self.feed.abort();
            return;
        }
        while let Some(index) = next {
            let block = self.feed.block(index);
            if block.has_motion() {
                self.start(index);
                return;
            }
            // Command-only block
            publish_completion(self.events, block);
            next = self.feed.on_block_end(index);
        }
        self.current = None;
    }

    fn start(&mut self, index: usize) {
        let block = self.feed.block(index);
        self.events.publish::<BlockBegin>(block);
        let rate = (block.initial_rate.max(self.minimum_rate)).min(self.base_frequency) as f32;
        self.current = Some(Execution::new(index, block));
        self.set_rate(rate);
    }

    fn set_rate(&mut self, rate: f32) {
        let base = self.base_frequency;
        let Some(execution) = self.current.as_mut() else {
            return;
        };
        let whole = ceilf(rate) as u32;
        execution.rate = rate;
        execution.increment = Fixed16::from_ratio(whole.min(base), base).unwrap_or(Fixed16::ONE);
        self.events.publish::<SpeedChange>(&StepRate {
            rate: whole,
            nominal_rate: execution.nominal_rate,
        });
    }

    fn complete_current(&mut self) {
        let Some(execution) = self.current.take() else {
            return;
        };
        publish_completion(self.events, self.feed.block(execution.index));
        let next = self.feed.on_block_end(execution.index);
        self.advance(next);
    }

    /// Abandon the executing block and everything queued behind it
    ///
    /// Used whenever a stop cut the block short, even if the remaining axes
    /// ran to completion. Its deferred commands are discarded and no
    /// block-end is published.
    fn cancel(&mut self) {
        if let Some(execution) = self.current.take() {
            warn!(
                "block in slot {} cancelled after {} of {} step events",
                execution.index,
                execution.events_completed,
                execution.event_count
            );
        }
        self.feed.abort();
    }
}

/// Deferred commands first, then the block-end event
fn publish_completion(events: &EventBus<'_>, block: &Block) {
    for command in block.commands() {
        events.publish::<CommandExecute>(command);
    }
    events.publish::<BlockEnd>(block);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motion::block::DeferredCommand;
    use crate::motion::conveyor::{connect, Conveyor, ConveyorState};
    use crate::motion::queue::MotionQueue;
    use core::convert::Infallible;
    use core::sync::atomic::{AtomicU32, Ordering};
    use proptest::prelude::*;
    use std::string::{String, ToString};
    use std::sync::Mutex;
    use std::vec::Vec as StdVec;

    fn config() -> MotionConfig {
        MotionConfig {
            base_frequency: 1000,
            minimum_steps_per_second: 10,
            ..MotionConfig::default()
        }
    }

    /// Queue a block stepping at a constant `rate`
    fn queue_block<const N: usize>(
        conveyor: &mut Conveyor<'_, N>,
        steps: [i32; AXES],
        rate: u32,
    ) {
        let block = conveyor.head_block();
        for axis in 0..AXES {
            block.steps[axis] = steps[axis].unsigned_abs();
            block.direction_bits.set_negative(axis, steps[axis] < 0);
        }
        block.steps_event_count = block.steps.iter().copied().max().unwrap_or(0);
        block.nominal_rate = rate;
        block.initial_rate = rate;
        block.final_rate = rate;
        block.accelerate_until = 0;
        block.decelerate_after = block.steps_event_count;
        conveyor.queue_head_block(&mut || {});
    }

    /// Tick until idle, returning the emitted pulses per axis
    fn run<const N: usize>(generator: &mut StepGenerator<'_, '_, N>, limit: usize) -> [u32; AXES] {
        let mut pulses = [0; AXES];
        for tick in 0..limit {
            let output = generator.step_tick();
            for (axis, count) in pulses.iter_mut().enumerate() {
                if output.step & (1 << axis) != 0 {
                    *count += 1;
                }
            }
            if tick % 10 == 9 {
                generator.trapezoid_tick();
            }
            if !generator.is_busy() && !generator.feed.has_pending() {
                break;
            }
        }
        pulses
    }

    fn exact_steps(steps: [i32; AXES]) -> [u32; AXES] {
        let bus = EventBus::new();
        let stop = StopSignal::new();
        let mut queue = MotionQueue::<4>::new(4).unwrap();
        let (mut conveyor, feed) = connect(&mut queue, &stop);
        let mut generator = StepGenerator::new(feed, &stop, &bus, &config());

        queue_block(&mut conveyor, steps, 1000);
        conveyor.ensure_running();
        let pulses = run(&mut generator, 1_000_000);
        assert_eq!(generator.executed_position(), steps);
        pulses
    }

    #[test]
    fn test_bresenham_axis_ratios() {
        assert_eq!(exact_steps([400, 400, 0]), [400, 400, 0]);
        assert_eq!(exact_steps([1, 1000, 0]), [1, 1000, 0]);
        assert_eq!(exact_steps([0, -250, 0]), [0, 250, 0]);
        assert_eq!(exact_steps([-7, 3, 1000]), [7, 3, 1000]);
    }

    #[test]
    fn test_commands_run_before_block_end() {
        let log: Mutex<StdVec<String>> = Mutex::new(StdVec::new());
        let on_begin = |block: &Block| log.lock().unwrap().push(std::format!("begin {}", block.steps[0]));
        let on_command =
            |command: &DeferredCommand| log.lock().unwrap().push(command.as_str().to_string());
        let on_end = |block: &Block| log.lock().unwrap().push(std::format!("end {}", block.steps[0]));
        let mut bus = EventBus::new();
        bus.subscribe::<BlockBegin>(&on_begin).unwrap();
        bus.subscribe::<CommandExecute>(&on_command).unwrap();
        bus.subscribe::<BlockEnd>(&on_end).unwrap();

        let stop = StopSignal::new();
        let mut queue = MotionQueue::<4>::new(4).unwrap();
        let (mut conveyor, feed) = connect(&mut queue, &stop);
        let mut generator = StepGenerator::new(feed, &stop, &bus, &config());

        queue_block(&mut conveyor, [3, 0, 0], 1000);
        conveyor.append_command(DeferredCommand::new("M106").unwrap(), &mut || {}).unwrap();
        conveyor.append_command(DeferredCommand::new("M107").unwrap(), &mut || {}).unwrap();
        queue_block(&mut conveyor, [2, 0, 0], 1000);
        conveyor.ensure_running();
        run(&mut generator, 100);

        assert_eq!(
            *log.lock().unwrap(),
            ["begin 3", "M106", "M107", "end 3", "begin 2", "end 2"]
        );
    }

    #[test]
    fn test_blocks_end_in_queue_order() {
        let ends: Mutex<StdVec<u32>> = Mutex::new(StdVec::new());
        let on_end = |block: &Block| ends.lock().unwrap().push(block.steps[1]);
        let mut bus = EventBus::new();
        bus.subscribe::<BlockEnd>(&on_end).unwrap();

        let stop = StopSignal::new();
        let mut queue = MotionQueue::<8>::new(8).unwrap();
        let (mut conveyor, feed) = connect(&mut queue, &stop);
        let mut generator = StepGenerator::new(feed, &stop, &bus, &config());

        for steps in [5, 1, 4, 2, 3] {
            queue_block(&mut conveyor, [0, steps, 0], 500);
        }
        conveyor.ensure_running();
        run(&mut generator, 10_000);
        while !conveyor.is_queue_empty() {
            conveyor.on_idle();
        }

        assert_eq!(*ends.lock().unwrap(), [5, 1, 4, 2, 3]);
        assert_eq!(generator.executed_position(), [0, 15, 0]);
    }

    #[test]
    fn test_command_only_block_completes_without_steps() {
        let commands = AtomicU32::new(0);
        let on_command = |_: &DeferredCommand| {
            commands.fetch_add(1, Ordering::Relaxed);
        };
        let mut bus = EventBus::new();
        bus.subscribe::<CommandExecute>(&on_command).unwrap();

        let stop = StopSignal::new();
        let mut queue = MotionQueue::<4>::new(4).unwrap();
        let (mut conveyor, feed) = connect(&mut queue, &stop);
        let mut generator = StepGenerator::new(feed, &stop, &bus, &config());

        conveyor.append_command(DeferredCommand::new("M42 P1").unwrap(), &mut || {}).unwrap();
        conveyor.on_main_loop();
        let output = generator.step_tick();

        assert!(!output.has_steps());
        assert!(!generator.is_busy());
        assert_eq!(commands.load(Ordering::Relaxed), 1);
        assert_eq!(conveyor.state(), crate::motion::conveyor::ConveyorState::Idle);
    }

    #[test]
    fn test_rate_follows_trapezoid_within_bounds() {
        let rates: Mutex<StdVec<u32>> = Mutex::new(StdVec::new());
        let on_speed = |rate: &StepRate| rates.lock().unwrap().push(rate.rate);
        let mut bus = EventBus::new();
        bus.subscribe::<SpeedChange>(&on_speed).unwrap();

        let stop = StopSignal::new();
        let mut queue = MotionQueue::<4>::new(4).unwrap();
        let (mut conveyor, feed) = connect(&mut queue, &stop);
        let config = config();
        let mut generator = StepGenerator::new(feed, &stop, &bus, &config);

        let block = conveyor.head_block();
        block.steps = [60, 0, 0];
        block.steps_event_count = 60;
        block.nominal_rate = 500;
        block.rate_delta = 100.0;
        block.accelerate_until = 20;
        block.decelerate_after = 40;
        conveyor.queue_head_block(&mut || {});
        conveyor.ensure_running();

        generator.step_tick();
        assert_eq!(generator.phase(), RampPhase::Accelerating);
        // Starts at the minimum rate, not at zero
        assert_eq!(generator.step_rate(), config.minimum_steps_per_second);

        let pulses = run(&mut generator, 100_000);
        assert_eq!(pulses, [60, 0, 0]);
        assert_eq!(generator.executed_position(), [60, 0, 0]);

        let rates = rates.lock().unwrap();
        assert!(rates.contains(&500));
        assert!(rates
            .iter()
            .all(|&rate| (config.minimum_steps_per_second..=500).contains(&rate)));
    }

    #[test]
    fn test_unready_block_is_retried() {
        let bus = EventBus::new();
        let stop = StopSignal::new();
        let mut queue = MotionQueue::<4>::new(4).unwrap();
        let (mut conveyor, feed) = connect(&mut queue, &stop);
        let mut generator = StepGenerator::new(feed, &stop, &bus, &config());

        queue_block(&mut conveyor, [10, 0, 0], 1000);
        conveyor.ensure_running();

        let window = conveyor.plan_window();
        assert_eq!(generator.step_tick(), StepOutput::idle());
        assert!(!generator.is_busy());
        drop(window);

        assert!(generator.step_tick().has_steps());
        assert!(generator.is_busy());
    }

    #[test]
    fn test_stop_cancels_block_and_discards_commands() {
        let commands = AtomicU32::new(0);
        let ends = AtomicU32::new(0);
        let on_command = |_: &DeferredCommand| {
            commands.fetch_add(1, Ordering::Relaxed);
        };
        let on_end = |_: &Block| {
            ends.fetch_add(1, Ordering::Relaxed);
        };
        let mut bus = EventBus::new();
        bus.subscribe::<CommandExecute>(&on_command).unwrap();
        bus.subscribe::<BlockEnd>(&on_end).unwrap();

        let stop = StopSignal::new();
        let mut queue = MotionQueue::<8>::new(8).unwrap();
        let (mut conveyor, feed) = connect(&mut queue, &stop);
        let mut generator = StepGenerator::new(feed, &stop, &bus, &config());

        queue_block(&mut conveyor, [100, 0, 0], 1000);
        conveyor.append_command(DeferredCommand::new("M400").unwrap(), &mut || {}).unwrap();
        queue_block(&mut conveyor, [100, 0, 0], 1000);
        conveyor.ensure_running();

        for _ in 0..10 {
            generator.step_tick();
        }
        stop.trigger(0);
        assert_eq!(generator.step_tick(), StepOutput::idle());

        assert!(!generator.is_busy());
        assert_eq!(generator.executed_position(), [10, 0, 0]);
        assert_eq!(commands.load(Ordering::Relaxed), 0);
        assert_eq!(ends.load(Ordering::Relaxed), 0);
        assert!(!conveyor.queue().is_running());
        assert_eq!(conveyor.queue().pending(), 0);

        conveyor.on_idle();
        conveyor.on_idle();
        assert!(conveyor.is_queue_empty());
        assert!(conveyor.queue().cursors_ordered());
    }

    #[test]
    fn test_stopped_axis_lets_others_finish() {
        let bus = EventBus::new();
        let stop = StopSignal::new();
        let mut queue = MotionQueue::<4>::new(4).unwrap();
        let (mut conveyor, feed) = connect(&mut queue, &stop);
        let mut generator = StepGenerator::new(feed, &stop, &bus, &config());

        queue_block(&mut conveyor, [20, 20, 0], 1000);
        conveyor.ensure_running();
        for _ in 0..5 {
            generator.step_tick();
        }
        stop.trigger(1);
        run(&mut generator, 1000);

        assert_eq!(generator.executed_position(), [20, 5, 0]);
        assert!(!generator.is_busy());
    }

    #[test]
    fn test_latched_stop_discards_new_blocks() {
        let bus = EventBus::new();
        let stop = StopSignal::new();
        let mut queue = MotionQueue::<4>::new(4).unwrap();
        let (mut conveyor, feed) = connect(&mut queue, &stop);
        let mut generator = StepGenerator::new(feed, &stop, &bus, &config());

        stop.trigger(2);
        queue_block(&mut conveyor, [5, 0, 0], 1000);
        conveyor.ensure_running();
        assert_eq!(generator.step_tick(), StepOutput::idle());
        assert_eq!(conveyor.queue().pending(), 0);

        stop.clear();
        queue_block(&mut conveyor, [5, 0, 0], 1000);
        conveyor.ensure_running();
        run(&mut generator, 100);
        assert_eq!(generator.executed_position(), [5, 0, 0]);
    }

    #[test]
    fn test_command_waits_for_room_when_queue_full() {
        let log: Mutex<StdVec<String>> = Mutex::new(StdVec::new());
        let on_command = |command: &DeferredCommand| {
            log.lock().unwrap().push(command.as_str().to_string())
        };
        let mut bus = EventBus::new();
        bus.subscribe::<CommandExecute>(&on_command).unwrap();

        let stop = StopSignal::new();
        let mut queue = MotionQueue::<4>::new(4).unwrap();
        let (mut conveyor, feed) = connect(&mut queue, &stop);
        let mut generator = StepGenerator::new(feed, &stop, &bus, &config());

        for _ in 0..3 {
            queue_block(&mut conveyor, [2, 0, 0], 1000);
        }
        assert!(conveyor.is_queue_full());

        // Newest block and head carrier take four each, the ninth needs a slot
        let mut waits = 0;
        for n in 1..=9 {
            let command = DeferredCommand::new(&std::format!("M{}", n)).unwrap();
            let result = conveyor.append_command(command, &mut || {
                waits += 1;
                generator.step_tick();
            });
            assert_eq!(result, Ok(()));
        }
        assert!(waits >= 1);

        run(&mut generator, 1000);
        conveyor.wait_for_empty_queue(&mut || {});
        conveyor.on_main_loop();
        run(&mut generator, 10);

        let expected: StdVec<String> = (1..=9).map(|n| std::format!("M{}", n)).collect();
        assert_eq!(*log.lock().unwrap(), expected);
        assert_eq!(generator.executed_position(), [6, 0, 0]);
    }

    #[test]
    fn test_halt_cancels_executing_block() {
        let commands = AtomicU32::new(0);
        let ends = AtomicU32::new(0);
        let on_command = |_: &DeferredCommand| {
            commands.fetch_add(1, Ordering::Relaxed);
        };
        let on_end = |_: &Block| {
            ends.fetch_add(1, Ordering::Relaxed);
        };
        let mut bus = EventBus::new();
        bus.subscribe::<CommandExecute>(&on_command).unwrap();
        bus.subscribe::<BlockEnd>(&on_end).unwrap();

        let stop = StopSignal::new();
        let mut queue = MotionQueue::<8>::new(8).unwrap();
        let (mut conveyor, feed) = connect(&mut queue, &stop);
        let mut generator = StepGenerator::new(feed, &stop, &bus, &config());

        queue_block(&mut conveyor, [100, 0, 0], 1000);
        conveyor.append_command(DeferredCommand::new("M400").unwrap(), &mut || {}).unwrap();
        queue_block(&mut conveyor, [100, 0, 0], 1000);
        conveyor.ensure_running();
        for _ in 0..10 {
            generator.step_tick();
        }

        conveyor.halt();
        assert_eq!(generator.step_tick(), StepOutput::idle());
        assert!(!generator.is_busy());
        assert_eq!(generator.executed_position(), [10, 0, 0]);
        assert_eq!(commands.load(Ordering::Relaxed), 0);
        assert_eq!(ends.load(Ordering::Relaxed), 0);
        assert_eq!(conveyor.state(), ConveyorState::Halted);

        conveyor.wait_for_empty_queue(&mut || {});
        assert!(conveyor.is_queue_empty());
        assert!(conveyor.queue().cursors_ordered());

        // Moves queued while halted are dropped
        queue_block(&mut conveyor, [50, 0, 0], 1000);
        assert!(conveyor.is_queue_empty());

        conveyor.clear_halt();
        queue_block(&mut conveyor, [5, 0, 0], 1000);
        conveyor.ensure_running();
        run(&mut generator, 100);
        assert_eq!(generator.executed_position(), [15, 0, 0]);
        assert_eq!(ends.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_stop_on_axis_outside_block_finishes_block() {
        let ends = AtomicU32::new(0);
        let on_end = |_: &Block| {
            ends.fetch_add(1, Ordering::Relaxed);
        };
        let mut bus = EventBus::new();
        bus.subscribe::<BlockEnd>(&on_end).unwrap();

        let stop = StopSignal::new();
        let mut queue = MotionQueue::<4>::new(4).unwrap();
        let (mut conveyor, feed) = connect(&mut queue, &stop);
        let mut generator = StepGenerator::new(feed, &stop, &bus, &config());

        queue_block(&mut conveyor, [10, 0, 0], 1000);
        queue_block(&mut conveyor, [10, 0, 0], 1000);
        conveyor.ensure_running();
        generator.step_tick();
        stop.trigger(2);
        run(&mut generator, 100);

        // The executing block completes, the one behind it is discarded
        assert_eq!(generator.executed_position(), [10, 0, 0]);
        assert_eq!(ends.load(Ordering::Relaxed), 1);
        assert_eq!(conveyor.queue().pending(), 0);
    }

    struct RecordingBank {
        directions: DirectionBits,
        pulses: u32,
    }

    impl ActuatorBank for RecordingBank {
        type Error = Infallible;

        fn set_directions(&mut self, directions: DirectionBits) -> Result<(), Infallible> {
            self.directions = directions;
            Ok(())
        }

        fn step(&mut self, mask: u8) -> Result<(), Infallible> {
            self.pulses += mask.count_ones();
            Ok(())
        }

        fn unstep(&mut self) -> Result<(), Infallible> {
            Ok(())
        }

        fn enable(&mut self, _enabled: bool) -> Result<(), Infallible> {
            Ok(())
        }

        fn is_enabled(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_tick_drives_actuators() {
        let bus = EventBus::new();
        let stop = StopSignal::new();
        let mut queue = MotionQueue::<4>::new(4).unwrap();
        let (mut conveyor, feed) = connect(&mut queue, &stop);
        let mut generator = StepGenerator::new(feed, &stop, &bus, &config());
        let mut bank = RecordingBank {
            directions: DirectionBits::default(),
            pulses: 0,
        };

        queue_block(&mut conveyor, [0, -4, 0], 1000);
        conveyor.ensure_running();
        for _ in 0..10 {
            generator.tick(&mut bank).unwrap();
        }
        assert_eq!(bank.pulses, 4);
        assert!(bank.directions.is_negative(1));
    }

    proptest! {
        #[test]
        fn prop_every_axis_reaches_its_step_count(
            x in -3000i32..3000,
            y in -3000i32..3000,
            z in -3000i32..3000,
        ) {
            prop_assume!(x != 0 || y != 0 || z != 0);
            let pulses = exact_steps([x, y, z]);
            prop_assert_eq!(pulses, [x.unsigned_abs(), y.unsigned_abs(), z.unsigned_abs()]);
        }
    }
}

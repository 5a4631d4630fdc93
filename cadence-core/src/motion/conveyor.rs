//! Conveyor: sealing blocks into the queue and cleaning up behind the
//! step interrupt
//!
//! The [`Conveyor`] lives in the main loop. It publishes the block the
//! planner prepared at the queue head, keeps the queue running, reclaims
//! finished blocks in `on_idle` (clearing a block drops its deferred
//! commands, which is never done in interrupt context) and implements the
//! cooperative waits used by callers that must not outrun the machine.
//!
//! The [`BlockFeed`] is the interrupt-side half: it starts the block at
//! `gc_pending` and advances past it when its motion completes.
//!
//! Every wait takes an `idle` callback. It stands in for the rest of the
//! main loop's idle processing and is called once per wait iteration.

use super::block::{Block, CommandError, DeferredCommand};
use super::queue::{Executor, MotionQueue, PlanWindow, Producer, Reclaimer};
use super::stop::StopSignal;

/// Observable conveyor state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConveyorState {
    /// Not consuming blocks
    Idle,
    /// The step interrupt is consuming blocks
    Running,
    /// Halted; new blocks are discarded until the halt is cleared
    Halted,
}

/// Split a queue into a main-loop [`Conveyor`] and an interrupt-side [`BlockFeed`]
pub fn connect<'q, const N: usize>(
    queue: &'q mut MotionQueue<N>,
    stop: &'q StopSignal,
) -> (Conveyor<'q, N>, BlockFeed<'q, N>) {
    let (producer, executor, reclaimer) = queue.split();
    (
        Conveyor::new(producer, reclaimer, stop),
        BlockFeed::new(executor),
    )
}

/// Main-loop side of the motion queue
pub struct Conveyor<'q, const N: usize> {
    producer: Producer<'q, N>,
    reclaimer: Reclaimer<'q, N>,
    stop: &'q StopSignal,
    halted: bool,
}

impl<'q, const N: usize> Conveyor<'q, N> {
    /// Create a conveyor from the producer and reclaimer halves of a queue
    pub fn new(producer: Producer<'q, N>, reclaimer: Reclaimer<'q, N>, stop: &'q StopSignal) -> Self {
        Self {
            producer,
            reclaimer,
            stop,
            halted: false,
        }
    }

    /// The underlying queue
    pub fn queue(&self) -> &'q MotionQueue<N> {
        self.producer.queue()
    }

    /// Current state
    pub fn state(&self) -> ConveyorState {
        if self.halted {
            ConveyorState::Halted
        } else if self.queue().is_running() {
            ConveyorState::Running
        } else {
            ConveyorState::Idle
        }
    }

    /// No blocks queued, executing or awaiting cleanup
    pub fn is_queue_empty(&self) -> bool {
        self.queue().is_empty()
    }

    /// No room for another block
    pub fn is_queue_full(&self) -> bool {
        self.queue().is_full()
    }

    /// Whether any block is pending or executing
    pub fn has_pending(&self) -> bool {
        self.producer.has_pending()
    }

    /// Whether the conveyor is halted
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// The unpublished block at the head of the queue
    pub fn head_block(&mut self) -> &mut Block {
        self.producer.head_ref()
    }

    /// Lock the pending blocks for replanning
    pub fn plan_window(&mut self) -> PlanWindow<'_, 'q, N> {
        self.producer.plan_window()
    }

    /// Wait until there is room for one more block
    pub fn wait_for_space(&mut self, idle: &mut dyn FnMut()) {
        while self.is_queue_full() {
            self.ensure_running();
            self.on_idle();
            idle();
        }
    }

    /// Publish the prepared head block
    ///
    /// Waits for room first. While halted the head block is cleared instead.
    pub fn queue_head_block(&mut self, idle: &mut dyn FnMut()) {
        self.wait_for_space(idle);

        if self.halted {
            self.producer.head_ref().clear();
            return;
        }

        if self.producer.produce_head().is_err() {
            fault!("queue full after waiting for space");
        }
    }

    /// Publish the head block if it only carries deferred commands
    ///
    /// Called before a new move is written into the head slot so that
    /// commands attached after the previous move still run before this one.
    pub fn push_command_carrier(&mut self, idle: &mut dyn FnMut()) {
        if self.producer.head_ref().has_commands() {
            self.queue_head_block(idle);
        }
    }

    /// Start the step interrupt consuming blocks if work is pending
    pub fn ensure_running(&mut self) {
        if self.halted || self.queue().is_running() || !self.producer.has_pending() {
            return;
        }
        self.producer.set_running(true);
    }

    /// Reclaim one finished block
    ///
    /// Called from the main loop's idle processing, never from interrupt
    /// context.
    pub fn on_idle(&mut self) {
        if self.reclaimer.has_finished() {
            if self.is_queue_empty() {
                fault!("finished block behind an empty queue");
            }
            self.reclaimer.consume_tail();
        }
    }

    /// Main-loop housekeeping
    ///
    /// Publishes a head block that picked up deferred commands while the
    /// queue drained, then makes sure the queue is running.
    pub fn on_main_loop(&mut self) {
        if self.halted {
            return;
        }
        if !self.queue().is_running()
            && self.producer.head_ref().has_commands()
            && !self.is_queue_full()
        {
            debug!("publishing command-only block");
            if self.producer.produce_head().is_err() {
                fault!("queue full after checking for space");
            }
        }
        self.ensure_running();
    }

    /// Attach a deferred command behind all motion queued so far
    ///
    /// The command rides on the newest pending block if the step interrupt
    /// has not started it yet, otherwise on the head block, which is then
    /// published as a command-only block by [`Conveyor::on_main_loop`] or
    /// ahead of the next move. When the head carrier is full it is
    /// published, waiting for room like any other block. Commands are
    /// dropped while halted.
    pub fn append_command(
        &mut self,
        command: DeferredCommand,
        idle: &mut dyn FnMut(),
    ) -> Result<(), CommandError> {
        if self.halted {
            return Ok(());
        }

        // Commands already waiting on the head must stay first
        if !self.producer.head_ref().has_commands() {
            if let Some(mut newest) = self.producer.lock_newest() {
                let block = newest.block_mut();
                if block.commands().len() < super::block::MAX_BLOCK_COMMANDS {
                    return block.append_command(command);
                }
            }
        }

        let head = self.producer.head_ref();
        if head.commands().len() < super::block::MAX_BLOCK_COMMANDS {
            return head.append_command(command);
        }

        // Head carrier is full: publish it and start a new one
        self.queue_head_block(idle);
        self.producer.head_ref().append_command(command)
    }

    /// Wait until every queued block has executed and been reclaimed
    pub fn wait_for_empty_queue(&mut self, idle: &mut dyn FnMut()) {
        while !self.is_queue_empty() {
            self.ensure_running();
            self.on_idle();
            idle();
        }
    }

    /// Skip all queued motion as soon as the current block ends
    pub fn flush_queue(&mut self, idle: &mut dyn FnMut()) {
        warn!("flushing motion queue");
        self.producer.set_flush(true);
        self.wait_for_empty_queue(idle);
        self.producer.set_flush(false);
    }

    /// Stop all motion immediately and discard queued blocks
    ///
    /// The step interrupt cancels the executing block on its next tick.
    /// New blocks are dropped until [`Conveyor::clear_halt`].
    pub fn halt(&mut self) {
        warn!("motion halted");
        self.halted = true;
        self.stop.halt();
        self.producer.head_ref().clear();
    }

    /// Leave the halted state and re-arm the stop signal
    pub fn clear_halt(&mut self) {
        info!("motion halt cleared");
        self.halted = false;
        self.stop.clear();
    }
}

/// Interrupt side of the motion queue
pub struct BlockFeed<'q, const N: usize> {
    executor: Executor<'q, N>,
}

impl<'q, const N: usize> BlockFeed<'q, N> {
    /// Wrap the executor half of a queue
    pub fn new(executor: Executor<'q, N>) -> Self {
        Self { executor }
    }

    /// Start the next block if the queue is running
    ///
    /// `None` means nothing to do this tick: the queue is idle, empty, or
    /// the planner is still revising the next block.
    pub fn begin(&mut self) -> Option<usize> {
        if !self.executor.is_running() {
            return None;
        }
        self.executor.try_begin()
    }

    /// The executing block at `index`
    pub fn block(&self, index: usize) -> &Block {
        self.executor.item_ref(index)
    }

    /// Whether blocks are pending or executing
    pub fn has_pending(&self) -> bool {
        self.executor.has_pending()
    }

    /// Hand a completed block to the reclaimer and start the next one
    pub fn on_block_end(&mut self, index: usize) -> Option<usize> {
        if self.executor.finish(index) {
            self.executor.try_begin()
        } else {
            None
        }
    }

    /// Discard every pending block and stop the queue
    pub fn abort(&mut self) {
        self.executor.abort();
    }
}

//! Triple-cursor block queue shared with the step interrupt
//!
//! A fixed arena of [`Block`] slots indexed by three cursors that move
//! forward modulo the capacity:
//!
//! ```text
//!   tail ........ gc_pending ........ head
//!   | finished,    | pending or        | free slot being
//!   | awaiting     | executing         | prepared
//!   | cleanup      |                   |
//! ```
//!
//! `tail <= gc_pending <= head` always holds (modulo wraparound). The queue
//! is full when `next(head) == tail` and empty when `head == tail`.
//!
//! [`MotionQueue::split`] hands out one handle per execution context:
//!
//! - [`Producer`] (main loop): prepares the head slot, publishes it, and
//!   replans pending blocks through a [`PlanWindow`]
//! - [`Executor`] (step interrupt): begins the block at `gc_pending` and
//!   advances `gc_pending` when it completes
//! - [`Reclaimer`] (main loop): clears finished blocks and advances `tail`
//!
//! Each slot also carries an atomic lifecycle state. The planner only writes
//! a pending block after moving it `Ready -> Locked`, and the interrupt only
//! starts a block by moving it `Ready -> Executing`, so a block is never
//! replanned after execution starts and never executed half-planned.

#![allow(unsafe_code)]

use core::cell::UnsafeCell;

use heapless::Vec;
use portable_atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};

use super::block::Block;

/// Queue operation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum QueueError {
    /// Publishing the head would overwrite the tail
    Full,
    /// Resize requested while blocks are still queued
    NotEmpty,
    /// Capacity outside `2..=N`
    InvalidSize,
}

/// Lifecycle state of one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum SlotState {
    /// Cleared, owned by the producer
    Free = 0,
    /// Published and waiting for execution
    Ready = 1,
    /// Being replanned by the producer
    Locked = 2,
    /// Started by the step interrupt; read-only from now on
    Executing = 3,
}

impl SlotState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SlotState::Ready,
            2 => SlotState::Locked,
            3 => SlotState::Executing,
            _ => SlotState::Free,
        }
    }
}

/// Ring buffer of block slots with split ownership
pub struct MotionQueue<const N: usize> {
    slots: [UnsafeCell<Block>; N],
    states: [AtomicU8; N],
    len: usize,
    head: AtomicUsize,
    gc_pending: AtomicUsize,
    tail: AtomicUsize,
    running: AtomicBool,
    flush: AtomicBool,
    /// Exit speed of the most recently reclaimed block, as `f32` bits
    last_exit_speed: AtomicU32,
}

// SAFETY: every slot is accessed by exactly one context at a time. The
// producer owns the head slot and `Locked` slots, the interrupt reads only
// the `Executing` slot it started, and the reclaimer only touches slots in
// `tail..gc_pending`, which the interrupt has released with a `Release`
// store of `gc_pending`.
unsafe impl<const N: usize> Sync for MotionQueue<N> {}

impl<const N: usize> MotionQueue<N> {
    /// Create a queue using `len` of its `N` slots
    pub fn new(len: usize) -> Result<Self, QueueError> {
        if len < 2 || len > N {
            return Err(QueueError::InvalidSize);
        }
        Ok(Self {
            slots: core::array::from_fn(|_| UnsafeCell::new(Block::new())),
            states: core::array::from_fn(|_| AtomicU8::new(SlotState::Free as u8)),
            len,
            head: AtomicUsize::new(0),
            gc_pending: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            running: AtomicBool::new(false),
            flush: AtomicBool::new(false),
            last_exit_speed: AtomicU32::new(0f32.to_bits()),
        })
    }

    /// Change the number of slots in use
    ///
    /// Only allowed while the queue is empty, e.g. on configuration reload.
    pub fn resize(&mut self, len: usize) -> Result<(), QueueError> {
        if !self.is_empty() {
            return Err(QueueError::NotEmpty);
        }
        if len < 2 || len > N {
            return Err(QueueError::InvalidSize);
        }
        for (slot, state) in self.slots.iter_mut().zip(self.states.iter_mut()) {
            slot.get_mut().clear();
            *state.get_mut() = SlotState::Free as u8;
        }
        self.len = len;
        *self.head.get_mut() = 0;
        *self.gc_pending.get_mut() = 0;
        *self.tail.get_mut() = 0;
        info!("motion queue resized to {} slots", len);
        Ok(())
    }

    /// Split into the three per-context handles
    pub fn split(&mut self) -> (Producer<'_, N>, Executor<'_, N>, Reclaimer<'_, N>) {
        let queue = &*self;
        (
            Producer { queue },
            Executor { queue },
            Reclaimer { queue },
        )
    }

    /// Number of slots in use
    pub fn capacity(&self) -> usize {
        self.len
    }

    /// Slot after `index`
    pub fn next(&self, index: usize) -> usize {
        if index + 1 >= self.len {
            0
        } else {
            index + 1
        }
    }

    /// Slot before `index`
    pub fn prev(&self, index: usize) -> usize {
        if index == 0 {
            self.len - 1
        } else {
            index - 1
        }
    }

    fn distance(&self, from: usize, to: usize) -> usize {
        (to + self.len - from) % self.len
    }

    /// No blocks queued, finished or pending
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }

    /// Publishing another block would overwrite the tail
    pub fn is_full(&self) -> bool {
        self.next(self.head.load(Ordering::Acquire)) == self.tail.load(Ordering::Acquire)
    }

    /// Blocks pending or executing
    pub fn pending(&self) -> usize {
        self.distance(
            self.gc_pending.load(Ordering::Acquire),
            self.head.load(Ordering::Acquire),
        )
    }

    /// Whether the step interrupt is consuming blocks
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Snapshot of `(tail, gc_pending, head)`
    pub fn cursors(&self) -> (usize, usize, usize) {
        (
            self.tail.load(Ordering::Acquire),
            self.gc_pending.load(Ordering::Acquire),
            self.head.load(Ordering::Acquire),
        )
    }

    /// Whether `tail <= gc_pending <= head` holds modulo the capacity
    pub fn cursors_ordered(&self) -> bool {
        let (tail, gc_pending, head) = self.cursors();
        self.distance(tail, gc_pending) + self.distance(gc_pending, head)
            == self.distance(tail, head)
    }

    /// Lifecycle state of a slot
    pub fn state(&self, index: usize) -> SlotState {
        SlotState::from_u8(self.states[index].load(Ordering::Acquire))
    }

    fn transition(&self, index: usize, from: SlotState, to: SlotState) -> bool {
        self.states[index]
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn set_state(&self, index: usize, state: SlotState) {
        self.states[index].store(state as u8, Ordering::Release);
    }

    fn last_exit_speed(&self) -> f32 {
        f32::from_bits(self.last_exit_speed.load(Ordering::Acquire))
    }
}

/// Main-loop handle that prepares and publishes blocks
pub struct Producer<'q, const N: usize> {
    queue: &'q MotionQueue<N>,
}

impl<'q, const N: usize> Producer<'q, N> {
    /// The queue this handle belongs to
    pub fn queue(&self) -> &'q MotionQueue<N> {
        self.queue
    }

    /// The free block at `head`, for in-place preparation
    pub fn head_ref(&mut self) -> &mut Block {
        let head = self.queue.head.load(Ordering::Relaxed);
        // SAFETY: the head slot is outside `tail..head`, so neither the
        // interrupt nor the reclaimer touches it, and `&mut self` makes this
        // the only reference the producer hands out.
        unsafe { &mut *self.queue.slots[head].get() }
    }

    /// Publish the prepared head block
    pub fn produce_head(&mut self) -> Result<(), QueueError> {
        let queue = self.queue;
        if queue.is_full() {
            return Err(QueueError::Full);
        }
        let head = queue.head.load(Ordering::Relaxed);
        queue.set_state(head, SlotState::Ready);
        queue.head.store(queue.next(head), Ordering::Release);
        Ok(())
    }

    /// Whether any block is pending or executing
    pub fn has_pending(&self) -> bool {
        self.queue.pending() > 0
    }

    /// Ask the interrupt to consume pending blocks
    pub fn set_running(&self, running: bool) {
        self.queue.running.store(running, Ordering::Release);
    }

    /// Mark every pending block finished as soon as the current one ends
    pub fn set_flush(&self, flush: bool) {
        self.queue.flush.store(flush, Ordering::Release);
    }

    /// Lock the newest pending block for modification
    ///
    /// Fails if there is none, or if the interrupt already started it.
    pub fn lock_newest(&mut self) -> Option<LockedBlock<'_, 'q, N>> {
        let queue = self.queue;
        if queue.pending() == 0 {
            return None;
        }
        let index = queue.prev(queue.head.load(Ordering::Relaxed));
        if !queue.transition(index, SlotState::Ready, SlotState::Locked) {
            return None;
        }
        // Flushed or aborted while we locked it
        if queue.pending() == 0 || !self.in_pending_region(index) {
            queue.set_state(index, SlotState::Ready);
            return None;
        }
        Some(LockedBlock {
            producer: self,
            index,
        })
    }

    fn in_pending_region(&self, index: usize) -> bool {
        let queue = self.queue;
        let gc_pending = queue.gc_pending.load(Ordering::Acquire);
        let head = queue.head.load(Ordering::Relaxed);
        queue.distance(gc_pending, index) < queue.distance(gc_pending, head)
    }

    /// Lock every pending block that has not started executing
    ///
    /// Walks from the newest block backwards and stops at the first block
    /// the interrupt already owns. The locks are released when the window
    /// is dropped.
    pub fn plan_window(&mut self) -> PlanWindow<'_, 'q, N> {
        let queue = self.queue;
        let head = queue.head.load(Ordering::Relaxed);
        let tail = queue.tail.load(Ordering::Acquire);
        let pending = queue.pending();

        let mut locked: Vec<usize, N> = Vec::new();
        let mut index = head;
        for _ in 0..pending {
            index = queue.prev(index);
            if !queue.transition(index, SlotState::Ready, SlotState::Locked) {
                break;
            }
            // `pending < len <= N`, so this never overflows
            let _ = locked.push(index);
        }
        locked.reverse();

        let boundary_exit_speed = match locked.first() {
            Some(&oldest) if oldest != tail => {
                let before = queue.prev(oldest);
                // SAFETY: `before` lies in `tail..oldest` and is not locked by
                // us, so it is executing or finished. Nobody writes such a
                // block until the reclaimer clears it, and the reclaimer runs
                // in this context.
                unsafe { (*queue.slots[before].get()).exit_speed }
            }
            _ => queue.last_exit_speed(),
        };

        PlanWindow {
            producer: self,
            locked,
            boundary_exit_speed,
        }
    }
}

/// A pending block held `Locked` by the producer
pub struct LockedBlock<'p, 'q, const N: usize> {
    producer: &'p mut Producer<'q, N>,
    index: usize,
}

impl<const N: usize> LockedBlock<'_, '_, N> {
    /// Slot index of the locked block
    pub fn index(&self) -> usize {
        self.index
    }

    /// The locked block
    pub fn block_mut(&mut self) -> &mut Block {
        // SAFETY: the slot is `Locked`, which the interrupt never starts, and
        // this guard holds the producer mutably.
        unsafe { &mut *self.producer.queue.slots[self.index].get() }
    }
}

impl<const N: usize> Drop for LockedBlock<'_, '_, N> {
    fn drop(&mut self) {
        self.producer.queue.set_state(self.index, SlotState::Ready);
    }
}

/// Pending blocks locked for replanning, oldest first
pub struct PlanWindow<'p, 'q, const N: usize> {
    producer: &'p mut Producer<'q, N>,
    locked: Vec<usize, N>,
    boundary_exit_speed: f32,
}

impl<const N: usize> PlanWindow<'_, '_, N> {
    /// Number of replannable blocks
    pub fn len(&self) -> usize {
        self.locked.len()
    }

    /// Whether there is nothing to replan
    pub fn is_empty(&self) -> bool {
        self.locked.is_empty()
    }

    /// Committed exit speed of the block just before the oldest locked one
    ///
    /// That block is either executing, finished, or already reclaimed, so
    /// its exit speed can no longer change and seeds the forward pass.
    pub fn boundary_exit_speed(&self) -> f32 {
        self.boundary_exit_speed
    }

    /// Locked block `position` (0 is the oldest)
    pub fn block(&self, position: usize) -> &Block {
        let index = self.locked[position];
        // SAFETY: locked by this window; see `block_mut`.
        unsafe { &*self.producer.queue.slots[index].get() }
    }

    /// Locked block `position` (0 is the oldest), mutably
    pub fn block_mut(&mut self, position: usize) -> &mut Block {
        let index = self.locked[position];
        // SAFETY: the slot is `Locked`, so the interrupt will not start it,
        // and `&mut self` guarantees a single live reference.
        unsafe { &mut *self.producer.queue.slots[index].get() }
    }

    /// Slot indices, oldest first
    pub fn indices(&self) -> &[usize] {
        &self.locked
    }
}

impl<const N: usize> Drop for PlanWindow<'_, '_, N> {
    fn drop(&mut self) {
        for &index in self.locked.iter() {
            self.producer.queue.set_state(index, SlotState::Ready);
        }
    }
}

/// Interrupt-side handle that starts and finishes blocks
pub struct Executor<'q, const N: usize> {
    queue: &'q MotionQueue<N>,
}

impl<'q, const N: usize> Executor<'q, N> {
    /// The queue this handle belongs to
    pub fn queue(&self) -> &'q MotionQueue<N> {
        self.queue
    }

    /// Whether the main loop asked for blocks to be consumed
    pub fn is_running(&self) -> bool {
        self.queue.is_running()
    }

    /// Start the block at `gc_pending`
    ///
    /// Returns `None` when nothing is pending or when the planner is still
    /// revising the block; the caller retries on its next tick.
    pub fn try_begin(&mut self) -> Option<usize> {
        let queue = self.queue;
        let gc_pending = queue.gc_pending.load(Ordering::Relaxed);
        if gc_pending == queue.head.load(Ordering::Acquire) {
            return None;
        }
        if queue.transition(gc_pending, SlotState::Ready, SlotState::Executing) {
            Some(gc_pending)
        } else {
            None
        }
    }

    /// Read an executing block
    pub fn item_ref(&self, index: usize) -> &Block {
        if self.queue.state(index) != SlotState::Executing {
            fault!("step interrupt read slot {} that it does not own", index);
        }
        // SAFETY: `Executing` blocks are never written until reclaimed, and
        // the reclaimer only sees them after `finish` releases them.
        unsafe { &*self.queue.slots[index].get() }
    }

    /// Release the block at `gc_pending` to the reclaimer
    ///
    /// Returns `true` if more blocks are pending. Clears the running flag
    /// once the queue has drained.
    pub fn finish(&mut self, index: usize) -> bool {
        let queue = self.queue;
        let gc_pending = queue.gc_pending.load(Ordering::Relaxed);
        if index != gc_pending {
            fault!("finished slot {} but gc_pending is {}", index, gc_pending);
        }
        let head = queue.head.load(Ordering::Acquire);
        let next = if queue.flush.load(Ordering::Acquire) {
            head
        } else {
            queue.next(gc_pending)
        };
        queue.gc_pending.store(next, Ordering::Release);
        if next == head {
            queue.running.store(false, Ordering::Release);
            false
        } else {
            true
        }
    }

    /// Drop every pending block and stop
    pub fn abort(&mut self) {
        let queue = self.queue;
        let head = queue.head.load(Ordering::Acquire);
        queue.gc_pending.store(head, Ordering::Release);
        queue.running.store(false, Ordering::Release);
    }

    /// Whether any block is waiting at `gc_pending`
    pub fn has_pending(&self) -> bool {
        self.queue.pending() > 0
    }
}

/// Main-loop handle that clears finished blocks
pub struct Reclaimer<'q, const N: usize> {
    queue: &'q MotionQueue<N>,
}

impl<'q, const N: usize> Reclaimer<'q, N> {
    /// The queue this handle belongs to
    pub fn queue(&self) -> &'q MotionQueue<N> {
        self.queue
    }

    /// Whether a finished block waits at `tail`
    pub fn has_finished(&self) -> bool {
        let queue = self.queue;
        queue.tail.load(Ordering::Relaxed) != queue.gc_pending.load(Ordering::Acquire)
    }

    /// The finished block at `tail`, if any
    pub fn tail_ref(&mut self) -> Option<&Block> {
        if !self.has_finished() {
            return None;
        }
        let tail = self.queue.tail.load(Ordering::Relaxed);
        // SAFETY: `tail` is behind `gc_pending`, so the interrupt is done
        // with it, and the producer only writes the head or locked slots.
        Some(unsafe { &*self.queue.slots[tail].get() })
    }

    /// Clear the block at `tail` and advance `tail`
    ///
    /// Must only be called when [`Reclaimer::has_finished`] is true.
    pub fn consume_tail(&mut self) {
        let queue = self.queue;
        if !self.has_finished() {
            fault!("consume_tail with nothing finished");
        }
        let tail = queue.tail.load(Ordering::Relaxed);
        if queue.state(tail) == SlotState::Locked {
            fault!("reclaiming slot {} while it is being planned", tail);
        }
        // SAFETY: as in `tail_ref`; `&mut self` makes this the only access.
        let block = unsafe { &mut *queue.slots[tail].get() };
        queue
            .last_exit_speed
            .store(block.exit_speed.to_bits(), Ordering::Release);
        block.clear();
        queue.set_state(tail, SlotState::Free);
        queue.tail.store(queue.next(tail), Ordering::Release);
    }
}

//! Asynchronous stop requests
//!
//! Endstops, probes and halt commands raise bits in a [`StopSignal`] from
//! any context. The step generator samples it on every tick: a stopped axis
//! emits no further pulses, and once nothing is left moving the block is
//! cancelled and the queue forced idle. A stop on an axis the executing
//! block does not move leaves that block to complete normally; the queue
//! behind it is discarded when it ends. The mask stays latched until the
//! caller has resynchronized its position and calls [`StopSignal::clear`].

use portable_atomic::{AtomicU8, Ordering};

use crate::AXES;

/// Mask with every axis set
pub const ALL_AXES: u8 = ((1u16 << AXES) - 1) as u8;

/// Latched per-axis stop mask
#[derive(Debug, Default)]
pub struct StopSignal {
    mask: AtomicU8,
}

impl StopSignal {
    /// No axis stopped
    pub const fn new() -> Self {
        Self {
            mask: AtomicU8::new(0),
        }
    }

    /// Stop a single axis (endstop or probe hit)
    pub fn trigger(&self, axis: usize) {
        if axis < AXES {
            self.mask.fetch_or(1 << axis, Ordering::AcqRel);
        }
    }

    /// Stop every axis
    pub fn halt(&self) {
        self.mask.store(ALL_AXES, Ordering::Release);
    }

    /// Re-arm after the caller has handled the stop
    pub fn clear(&self) {
        self.mask.store(0, Ordering::Release);
    }

    /// Current mask, one bit per stopped axis
    pub fn mask(&self) -> u8 {
        self.mask.load(Ordering::Acquire)
    }

    /// Whether `axis` is stopped
    pub fn is_stopped(&self, axis: usize) -> bool {
        axis < AXES && self.mask() & (1 << axis) != 0
    }

    /// Whether any stop is latched
    pub fn is_active(&self) -> bool {
        self.mask() != 0
    }
}

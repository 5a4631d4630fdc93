//! Typed publish/subscribe registry for motion events
//!
//! Followers such as extruder-follow, laser power or filament monitoring
//! subscribe to the kinds they care about instead of polling the motion
//! core. Each kind fixes its payload type:
//!
//! | Kind               | Payload            | Raised by                       |
//! |--------------------|--------------------|---------------------------------|
//! | [`BlockBegin`]     | [`Block`]          | step generator, block started   |
//! | [`BlockEnd`]       | [`Block`]          | step generator, block completed |
//! | [`SpeedChange`]    | [`StepRate`]       | step generator, rate changed    |
//! | [`StepperWakeUp`]  | `()`               | planner, new block queued       |
//! | [`CommandExecute`] | [`DeferredCommand`]| step generator, block completed |
//!
//! Handlers run synchronously in the publishing context, which for most
//! kinds is the step interrupt, so they must be short and must not block.

use heapless::Vec;

use crate::motion::block::{Block, DeferredCommand};

/// Maximum handlers per event kind
pub const MAX_SUBSCRIBERS: usize = 4;

/// Registration errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusError {
    /// This kind already has `MAX_SUBSCRIBERS` handlers
    Full,
}

/// Current step rate of the executing block
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StepRate {
    /// Step events per second
    pub rate: u32,
    /// Nominal step rate of the block
    pub nominal_rate: u32,
}

impl StepRate {
    /// Current rate as a fraction of nominal
    pub fn fraction(&self) -> f32 {
        if self.nominal_rate == 0 {
            0.0
        } else {
            self.rate as f32 / self.nominal_rate as f32
        }
    }
}

/// A registered handler
pub type Handler<'h, P> = &'h (dyn Fn(&P) + Sync + 'h);

mod sealed {
    pub trait Sealed {}
}

/// An event kind with a fixed payload type
pub trait Event: sealed::Sealed {
    /// Data handed to every handler
    type Payload: 'static;

    #[doc(hidden)]
    fn handlers<'b, 'h>(bus: &'b EventBus<'h>) -> &'b [Handler<'h, Self::Payload>];

    #[doc(hidden)]
    fn handlers_mut<'b, 'h>(
        bus: &'b mut EventBus<'h>,
    ) -> &'b mut Vec<Handler<'h, Self::Payload>, MAX_SUBSCRIBERS>;
}

macro_rules! event_kind {
    ($(#[$meta:meta])* $kind:ident => $payload:ty, $field:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $kind;

        impl sealed::Sealed for $kind {}

        impl Event for $kind {
            type Payload = $payload;

            fn handlers<'b, 'h>(bus: &'b EventBus<'h>) -> &'b [Handler<'h, $payload>] {
                &bus.$field
            }

            fn handlers_mut<'b, 'h>(
                bus: &'b mut EventBus<'h>,
            ) -> &'b mut Vec<Handler<'h, $payload>, MAX_SUBSCRIBERS> {
                &mut bus.$field
            }
        }
    };
}

event_kind!(
    /// The step generator started executing a block
    BlockBegin => Block, block_begin
);
event_kind!(
    /// A block's motion completed and its deferred commands ran
    BlockEnd => Block, block_end
);
event_kind!(
    /// The instantaneous step rate changed
    SpeedChange => StepRate, speed_change
);
event_kind!(
    /// New work was queued for the step generator
    StepperWakeUp => (), wake_up
);
event_kind!(
    /// A deferred command is due
    CommandExecute => DeferredCommand, command_execute
);

/// Handler registry, one table per event kind
#[derive(Default)]
pub struct EventBus<'h> {
    block_begin: Vec<Handler<'h, Block>, MAX_SUBSCRIBERS>,
    block_end: Vec<Handler<'h, Block>, MAX_SUBSCRIBERS>,
    speed_change: Vec<Handler<'h, StepRate>, MAX_SUBSCRIBERS>,
    wake_up: Vec<Handler<'h, ()>, MAX_SUBSCRIBERS>,
    command_execute: Vec<Handler<'h, DeferredCommand>, MAX_SUBSCRIBERS>,
}

impl<'h> EventBus<'h> {
    /// An empty registry
    pub const fn new() -> Self {
        Self {
            block_begin: Vec::new(),
            block_end: Vec::new(),
            speed_change: Vec::new(),
            wake_up: Vec::new(),
            command_execute: Vec::new(),
        }
    }

    /// Register a handler for `E`
    pub fn subscribe<E: Event>(&mut self, handler: Handler<'h, E::Payload>) -> Result<(), BusError> {
        E::handlers_mut(self)
            .push(handler)
            .map_err(|_| BusError::Full)
    }

    /// Call every handler registered for `E`, in registration order
    pub fn publish<E: Event>(&self, payload: &E::Payload) {
        for handler in E::handlers(self) {
            handler(payload);
        }
    }

    /// Number of handlers registered for `E`
    pub fn subscribers<E: Event>(&self) -> usize {
        E::handlers(self).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::vec::Vec as StdVec;

    #[test]
    fn test_publish_reaches_only_matching_kind() {
        let begins = AtomicU32::new(0);
        let wakes = AtomicU32::new(0);
        let on_begin = |_: &Block| {
            begins.fetch_add(1, Ordering::Relaxed);
        };
        let on_wake = |_: &()| {
            wakes.fetch_add(1, Ordering::Relaxed);
        };

        let mut bus = EventBus::new();
        bus.subscribe::<BlockBegin>(&on_begin).unwrap();
        bus.subscribe::<StepperWakeUp>(&on_wake).unwrap();

        bus.publish::<StepperWakeUp>(&());
        bus.publish::<StepperWakeUp>(&());
        bus.publish::<BlockEnd>(&Block::new());

        assert_eq!(begins.load(Ordering::Relaxed), 0);
        assert_eq!(wakes.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let log: Mutex<StdVec<u8>> = Mutex::new(StdVec::new());
        let first = |_: &StepRate| log.lock().unwrap().push(1);
        let second = |rate: &StepRate| log.lock().unwrap().push(rate.rate as u8);

        let mut bus = EventBus::new();
        bus.subscribe::<SpeedChange>(&first).unwrap();
        bus.subscribe::<SpeedChange>(&second).unwrap();
        bus.publish::<SpeedChange>(&StepRate {
            rate: 7,
            nominal_rate: 10,
        });

        assert_eq!(*log.lock().unwrap(), [1, 7]);
    }

    #[test]
    fn test_subscriber_limit() {
        let noop = |_: &DeferredCommand| {};
        let mut bus = EventBus::new();
        for _ in 0..MAX_SUBSCRIBERS {
            bus.subscribe::<CommandExecute>(&noop).unwrap();
        }
        assert_eq!(
            bus.subscribe::<CommandExecute>(&noop),
            Err(BusError::Full)
        );
        assert_eq!(bus.subscribers::<CommandExecute>(), MAX_SUBSCRIBERS);
        assert_eq!(bus.subscribers::<BlockBegin>(), 0);
    }

    #[test]
    fn test_step_rate_fraction() {
        let rate = StepRate {
            rate: 50,
            nominal_rate: 200,
        };
        assert_eq!(rate.fraction(), 0.25);
        assert_eq!(StepRate { rate: 1, nominal_rate: 0 }.fraction(), 0.0);
    }
}

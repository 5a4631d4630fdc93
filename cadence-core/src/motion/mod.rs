//! Motion pipeline
//!
//! Planner → queue → step generator, with the conveyor bridging the main
//! loop and the step interrupt:
//!
//! ```text
//!   MoveBuilder ──► Planner ──► MotionQueue ──► StepGenerator ──► ActuatorBank
//!                     │            ▲   │             │
//!                     └─ Conveyor ─┘   └─ BlockFeed ◄┘
//! ```

pub mod block;
pub mod conveyor;
pub mod planner;
pub mod queue;
pub mod stepgen;
pub mod stop;

pub use block::{Block, CommandError, DeferredCommand, DirectionBits};
pub use conveyor::{connect, BlockFeed, Conveyor, ConveyorState};
pub use planner::{Planner, PlannerConfig};
pub use queue::{MotionQueue, QueueError, SlotState};
pub use stepgen::{RampPhase, StepGenerator, StepOutput};
pub use stop::{StopSignal, ALL_AXES};

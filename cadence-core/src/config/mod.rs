//! Configuration type definitions
//!
//! These types are loaded once at startup (see the `cadence-config` crate)
//! and validated before motion is enabled. An invalid configuration is
//! fatal: the firmware must not start the step timer with it.

pub mod hardware;
pub mod motion;

pub use hardware::{AxisConfig, PinConfig, PinRole, MAX_LABEL_LEN};
pub use motion::{
    ConfigError, MotionConfig, DEFAULT_ACCELERATION, DEFAULT_ACCELERATION_TICKS,
    DEFAULT_BASE_FREQUENCY, DEFAULT_MAX_JERK, DEFAULT_MINIMUM_STEP_RATE, DEFAULT_QUEUE_SIZE,
    DEFAULT_STEP_PULSE_US, MAX_QUEUE_SIZE,
};

//! Configuration loading for the Cadence motion core
//!
//! The machine configuration is written by hand as TOML and may be
//! persisted in a compact postcard form once validated. [`load`] prefers
//! the TOML text and falls back to the binary copy.

#![no_std]
#![deny(unsafe_code)]

extern crate alloc;

#[macro_use]
mod fmt;

pub mod binary;
pub mod parse;

use cadence_core::config::{ConfigError, MotionConfig};

pub use binary::{from_bytes, to_bytes, CONFIG_VERSION};
pub use parse::{parse_config, parse_pin};

/// Configuration loading errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LoadError {
    /// TOML syntax error, wrong value type or unknown key
    Toml,
    /// Pin string not of the form `[!^]gpioN`
    InvalidPin,
    /// Axis name without a known actuator, or two axes on one actuator
    UnknownAxis,
    /// Parsed configuration failed validation
    Invalid(ConfigError),
    /// Binary encoding failed
    Encode,
    /// Binary data truncated or corrupt
    Decode,
    /// Binary data written by a different format version
    VersionMismatch,
    /// Neither a TOML nor a binary configuration was provided
    NotFound,
}

impl From<ConfigError> for LoadError {
    fn from(e: ConfigError) -> Self {
        LoadError::Invalid(e)
    }
}

/// Load the configuration from TOML text, falling back to binary
pub fn load(toml: Option<&str>, binary: Option<&[u8]>) -> Result<MotionConfig, LoadError> {
    info!("Loading motion configuration...");

    if let Some(text) = toml {
        match parse_config(text) {
            Ok(config) => {
                info!("Loaded configuration from TOML");
                log_config_summary(&config);
                return Ok(config);
            }
            Err(e) => {
                warn!("Failed to load TOML config: {:?}, trying binary", e);
            }
        }
    } else {
        debug!("No TOML config found, trying binary format");
    }

    let bytes = binary.ok_or(LoadError::NotFound)?;
    let config = from_bytes(bytes)?;
    log_config_summary(&config);
    Ok(config)
}

/// Log a summary of the loaded configuration
pub fn log_config_summary(config: &MotionConfig) {
    info!("Configuration loaded successfully");
    debug!("  queue: {} blocks", config.queue_size);
    debug!(
        "  acceleration {} mm/s2, jerk {} mm/s",
        config.acceleration, config.max_jerk
    );
    debug!(
        "  step timer {} Hz, trapezoid {} Hz",
        config.base_frequency, config.acceleration_ticks_per_second
    );
    for axis in config.axes.iter() {
        debug!(
            "  axis {}: {} steps/mm, max {} mm/s",
            axis.name.as_str(),
            axis.steps_per_mm,
            axis.max_rate
        );
    }
}

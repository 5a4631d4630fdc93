//! Compact binary configuration
//!
//! A format version byte followed by the postcard encoding of
//! [`MotionConfig`]. Used to persist a configuration that was already
//! parsed and validated.

use alloc::vec::Vec;

use cadence_core::config::MotionConfig;

use crate::LoadError;

/// Current binary layout version
pub const CONFIG_VERSION: u8 = 1;

/// Encode a configuration
pub fn to_bytes(config: &MotionConfig) -> Result<Vec<u8>, LoadError> {
    let mut bytes = Vec::new();
    bytes.push(CONFIG_VERSION);
    let body = postcard::to_allocvec(config).map_err(|_| LoadError::Encode)?;
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

/// Decode and validate a configuration
pub fn from_bytes(bytes: &[u8]) -> Result<MotionConfig, LoadError> {
    let (&version, body) = bytes.split_first().ok_or(LoadError::Decode)?;
    if version != CONFIG_VERSION {
        warn!(
            "Config version mismatch: found {}, expected {}",
            version, CONFIG_VERSION
        );
        return Err(LoadError::VersionMismatch);
    }
    let config: MotionConfig = postcard::from_bytes(body).map_err(|_| LoadError::Decode)?;
    config.validate()?;
    Ok(config)
}

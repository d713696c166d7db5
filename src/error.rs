//! Custom error types for the sweep engine.
//!
//! This module defines the primary error type, `SweepError`, used across the crate.
//! Using the `thiserror` crate, it gives one consistent place for everything that can
//! go wrong between opening a GPIB device and handing a sample to a sink.
//!
//! ## Error Hierarchy
//!
//! - **`NotConnected`**: an operation was attempted on a closed or never-opened device
//!   handle. No bus traffic happened.
//! - **`OpenFailed`**: the device did not answer at the given bus address, or the address
//!   is outside the GPIB range. Session-fatal.
//! - **`WriteFailed`** / **`ReadFailed`**: bus I/O failed in the middle of an operation.
//!   Reported per step; the session stays steppable.
//! - **`InvalidConfig`**: sweep parameters violate their invariants. Session-fatal.
//! - **`Sink`**: a sample sink refused a sample after the step was already consumed.
//! - **`Settings`** / **`Io`**: wrap `figment` and `std::io` failures while loading or
//!   persisting application settings.
//!
//! Each variant maps to a `Copy` [`ErrorKind`], which is what device handles record as
//! their last error.

use crate::hardware::gpib::DeviceAddress;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type SweepResult<T> = std::result::Result<T, SweepError>;

/// Classification of a [`SweepError`], cheap to copy and store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Operation on a closed handle
    NotConnected,
    /// Device did not respond at its address
    OpenFailed,
    /// Command could not be sent
    WriteFailed,
    /// Measurement could not be read
    ReadFailed,
    /// Sweep parameters are inconsistent
    InvalidConfig,
    /// Sample sink rejected a sample
    Sink,
    /// Settings could not be loaded
    Settings,
    /// Filesystem error
    Io,
}

/// Errors produced by devices, the sweep controller and its collaborators.
#[derive(Error, Debug)]
pub enum SweepError {
    #[error("Device at GPIB address {address} is not connected")]
    NotConnected { address: DeviceAddress },

    #[error("Failed to open device at GPIB address {address}: {reason}")]
    OpenFailed { address: u8, reason: String },

    #[error("Write to GPIB address {address} failed: {reason}")]
    WriteFailed {
        address: DeviceAddress,
        reason: String,
    },

    #[error("Read from GPIB address {address} failed: {reason}")]
    ReadFailed {
        address: DeviceAddress,
        reason: String,
    },

    #[error("Invalid sweep configuration: {0}")]
    InvalidConfig(String),

    #[error("Sample sink error: {0}")]
    Sink(String),

    #[error("Settings error: {0}")]
    Settings(#[from] Box<figment::Error>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SweepError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SweepError::NotConnected { .. } => ErrorKind::NotConnected,
            SweepError::OpenFailed { .. } => ErrorKind::OpenFailed,
            SweepError::WriteFailed { .. } => ErrorKind::WriteFailed,
            SweepError::ReadFailed { .. } => ErrorKind::ReadFailed,
            SweepError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            SweepError::Sink(_) => ErrorKind::Sink,
            SweepError::Settings(_) => ErrorKind::Settings,
            SweepError::Io(_) => ErrorKind::Io,
        }
    }

    /// Whether the error must stop the session before any stepping begins.
    ///
    /// Per-step bus failures are not fatal: the caller decides whether to continue.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::OpenFailed | ErrorKind::InvalidConfig | ErrorKind::Settings
        )
    }
}

impl From<figment::Error> for SweepError {
    fn from(value: figment::Error) -> Self {
        SweepError::Settings(Box::new(value))
    }
}

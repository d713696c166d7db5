//! GPIB device handles
//!
//! The bus itself (a vendor GPIB card, a Prologix USB controller, a simulator) is reached
//! through the [`GpibBus`] trait. A [`DeviceHandle`] is the connection to one instrument
//! on that bus and enforces the connection rules the drivers rely on:
//!
//! - opening performs an identity query; a silent address is `OpenFailed`
//! - every operation on a closed handle fails with `NotConnected` before touching the bus
//! - bus failures surface as `WriteFailed` / `ReadFailed` and are recorded in
//!   [`DeviceHandle::last_error`]; nothing is retried here

use crate::error::{ErrorKind, SweepError, SweepResult};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Highest primary address on a GPIB bus.
pub const MAX_GPIB_ADDRESS: u8 = 30;

/// Primary GPIB address of one instrument (0-30).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct DeviceAddress(u8);

impl DeviceAddress {
    /// Validate a raw bus address.
    pub fn new(address: u8) -> SweepResult<Self> {
        if address > MAX_GPIB_ADDRESS {
            return Err(SweepError::OpenFailed {
                address,
                reason: format!("address must be in 0..={}", MAX_GPIB_ADDRESS),
            });
        }
        Ok(Self(address))
    }

    /// Constructor for compile-time constants.
    pub const fn fixed(address: u8) -> Self {
        assert!(address <= MAX_GPIB_ADDRESS, "GPIB address out of range");
        Self(address)
    }

    /// Raw address value.
    pub fn value(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for DeviceAddress {
    type Error = SweepError;

    fn try_from(value: u8) -> SweepResult<Self> {
        Self::new(value)
    }
}

impl From<DeviceAddress> for u8 {
    fn from(value: DeviceAddress) -> Self {
        value.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport to the physical bus.
///
/// Implementations own the command encoding below the device level (listener addressing,
/// terminators, EOI handling). Errors use `anyhow` because every transport fails in its
/// own way; [`DeviceHandle`] maps them onto the crate taxonomy.
#[async_trait]
pub trait GpibBus: Send + Sync {
    /// Send a device-dependent command string to `address`.
    async fn write(&self, address: DeviceAddress, command: &str) -> Result<()>;

    /// Read one response string from `address`.
    async fn read(&self, address: DeviceAddress) -> Result<String>;

    /// Check that a listener answers at `address`.
    ///
    /// Default implementation performs a read and discards the result.
    async fn identify(&self, address: DeviceAddress) -> Result<()> {
        self.read(address).await.map(|_| ())
    }
}

/// Connection to one instrument on a shared bus.
pub struct DeviceHandle {
    address: DeviceAddress,
    bus: Arc<dyn GpibBus>,
    is_open: bool,
    last_error: Option<ErrorKind>,
}

impl DeviceHandle {
    /// Open the device at `address`, querying it to confirm it is present.
    ///
    /// # Errors
    /// `OpenFailed` when the address is out of range or the device does not answer.
    pub async fn open(bus: Arc<dyn GpibBus>, address: u8) -> SweepResult<Self> {
        let address = DeviceAddress::new(address)?;
        bus.identify(address)
            .await
            .map_err(|e| SweepError::OpenFailed {
                address: address.value(),
                reason: e.to_string(),
            })?;
        debug!(%address, "GPIB device opened");
        Ok(Self {
            address,
            bus,
            is_open: true,
            last_error: None,
        })
    }

    /// Bus address of this device.
    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    /// Whether the handle still accepts operations.
    pub fn is_open(&self) -> bool {
        self.is_open
    }

    /// Classification of the most recent failure, if any.
    pub fn last_error(&self) -> Option<ErrorKind> {
        self.last_error
    }

    /// Mark the device absent. There is no reopen; a new handle must be opened.
    pub fn close(&mut self) {
        if self.is_open {
            debug!(address = %self.address, "GPIB device closed");
        }
        self.is_open = false;
    }

    fn ensure_open(&mut self) -> SweepResult<()> {
        if self.is_open {
            Ok(())
        } else {
            self.last_error = Some(ErrorKind::NotConnected);
            Err(SweepError::NotConnected {
                address: self.address,
            })
        }
    }

    /// Send a command string.
    pub async fn write(&mut self, command: &str) -> SweepResult<()> {
        self.ensure_open()?;
        match self.bus.write(self.address, command).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(address = %self.address, command, error = %e, "GPIB write failed");
                self.last_error = Some(ErrorKind::WriteFailed);
                Err(SweepError::WriteFailed {
                    address: self.address,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Read one response string.
    pub async fn read(&mut self) -> SweepResult<String> {
        self.ensure_open()?;
        match self.bus.read(self.address).await {
            Ok(response) => Ok(response),
            Err(e) => {
                warn!(address = %self.address, error = %e, "GPIB read failed");
                self.last_error = Some(ErrorKind::ReadFailed);
                Err(SweepError::ReadFailed {
                    address: self.address,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Write a command, then read its response.
    pub async fn query(&mut self, command: &str) -> SweepResult<String> {
        self.write(command).await?;
        self.read().await
    }

    /// Best-effort presence probe. A failed probe closes the handle for good.
    pub async fn probe(&mut self) -> bool {
        if !self.is_open {
            return false;
        }
        match self.bus.identify(self.address).await {
            Ok(()) => true,
            Err(e) => {
                warn!(address = %self.address, error = %e, "device marked absent");
                self.last_error = Some(ErrorKind::NotConnected);
                self.close();
                false
            }
        }
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("address", &self.address)
            .field("is_open", &self.is_open)
            .field("last_error", &self.last_error)
            .finish()
    }
}

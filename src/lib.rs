//! # I-V Sweep Library
//!
//! Adaptive current-voltage sweeps on a GPIB bench: a programmable voltage source drives
//! the device under test while a multimeter reads the response. The sweep steps coarsely
//! far from zero and finely inside a configurable window around it, so the interesting
//! part of the curve is densely sampled without wasting time on the flat tails.
//!
//! ## Crate Structure
//!
//! - **`error`**: the `SweepError` taxonomy shared by devices, controller and sinks.
//! - **`hardware`**: GPIB bus boundary, capability traits, the Keithley 196/230 drivers,
//!   and a simulated bench.
//! - **`sweep`**: sweep configuration, the adaptive `SweepController`, and `SweepRunner`.
//! - **`sink`**: where samples go (memory, channel, bench log file, CSV).
//! - **`instruments`**: the `Instruments` facade that opens the bench by address.
//! - **`config`**: layered application settings (figment: defaults, TOML, environment).
//! - **`logging`**: tracing-subscriber initialization.
//!
//! ## Example
//!
//! ```no_run
//! use iv_sweep::hardware::{DeviceModel, SimulatedBench};
//! use iv_sweep::sink::MemorySink;
//! use iv_sweep::sweep::{SweepConfiguration, SweepController};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let bench = SimulatedBench::new(DeviceModel::default());
//! let mut sweep = SweepController::new(
//!     Box::new(bench.source()),
//!     Box::new(bench.meter()),
//!     SweepConfiguration::default(),
//! )?;
//! let mut samples = MemorySink::new();
//! sweep.setup_for_mode().await;
//! while !sweep.done() {
//!     sweep.step_and_acquire(&mut samples).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod hardware;
pub mod instruments;
pub mod logging;
pub mod sink;
pub mod sweep;

pub use error::{ErrorKind, SweepError, SweepResult};
pub use instruments::Instruments;

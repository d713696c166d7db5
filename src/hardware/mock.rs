//! Mock Hardware Implementations
//!
//! Simulated instruments for tests and for running the CLI without a bench.
//!
//! # Available Mocks
//!
//! - [`MockGpibBus`] - string-level bus with attachable listeners, queued replies and a write log
//! - [`SimulatedBench`] - a voltage source and a multimeter wired to a [`DeviceModel`]
//!
//! Failure injection is deterministic (the Nth write or read fails) so tests can target an
//! exact step. All delays use `tokio::time`, never `std::thread::sleep`.

use crate::config::Settings;
use crate::error::{SweepError, SweepResult};
use crate::hardware::capabilities::{
    Configurable, Instrument, Readable, SourceSetting, StimulusOutput,
};
use crate::hardware::gpib::{DeviceAddress, GpibBus};
use crate::hardware::{keithley196, keithley230};
use crate::sweep::config::MeasureFunction;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::{sleep, Duration};
use tracing::debug;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// MockGpibBus - Scripted Bus
// =============================================================================

#[derive(Default)]
struct BusState {
    attached: HashSet<u8>,
    queued: HashMap<u8, VecDeque<String>>,
    standing: HashMap<u8, String>,
    writes: Vec<(u8, String)>,
    fail_write: HashSet<u8>,
    fail_read: HashSet<u8>,
}

/// Scripted GPIB bus for driver tests
///
/// Only attached addresses answer. Reads return queued replies first, then the standing
/// reply set with [`MockGpibBus::set_response`].
///
/// # Example
///
/// ```rust,ignore
/// let bus = Arc::new(MockGpibBus::new());
/// bus.attach(3);
/// bus.push_response(3, "NDCV+1.00000E+0");
/// let meter = Keithley196::open(bus.clone(), 3).await?;
/// ```
#[derive(Default)]
pub struct MockGpibBus {
    state: Mutex<BusState>,
}

impl MockGpibBus {
    /// Create an empty bus with no listeners
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `address` answer
    pub fn attach(&self, address: u8) {
        lock(&self.state).attached.insert(address);
    }

    /// Silence `address`, as if the instrument were unplugged
    pub fn detach(&self, address: u8) {
        lock(&self.state).attached.remove(&address);
    }

    /// Queue one reply for `address`
    pub fn push_response(&self, address: u8, response: &str) {
        lock(&self.state)
            .queued
            .entry(address)
            .or_default()
            .push_back(response.to_string());
    }

    /// Reply returned whenever nothing is queued for `address`
    pub fn set_response(&self, address: u8, response: &str) {
        lock(&self.state)
            .standing
            .insert(address, response.to_string());
    }

    /// Fail the next write to `address`
    pub fn fail_next_write(&self, address: u8) {
        lock(&self.state).fail_write.insert(address);
    }

    /// Fail the next read from `address`
    pub fn fail_next_read(&self, address: u8) {
        lock(&self.state).fail_read.insert(address);
    }

    /// Commands successfully written to `address`, in order
    pub fn writes_to(&self, address: u8) -> Vec<String> {
        lock(&self.state)
            .writes
            .iter()
            .filter(|(a, _)| *a == address)
            .map(|(_, c)| c.clone())
            .collect()
    }
}

#[async_trait]
impl GpibBus for MockGpibBus {
    async fn write(&self, address: DeviceAddress, command: &str) -> Result<()> {
        let mut state = lock(&self.state);
        let raw = address.value();
        if !state.attached.contains(&raw) {
            return Err(anyhow!("no listener at address {}", raw));
        }
        if state.fail_write.remove(&raw) {
            return Err(anyhow!("injected write failure"));
        }
        state.writes.push((raw, command.to_string()));
        Ok(())
    }

    async fn read(&self, address: DeviceAddress) -> Result<String> {
        let mut state = lock(&self.state);
        let raw = address.value();
        if !state.attached.contains(&raw) {
            return Err(anyhow!("no listener at address {}", raw));
        }
        if state.fail_read.remove(&raw) {
            return Err(anyhow!("injected read failure"));
        }
        if let Some(reply) = state.queued.get_mut(&raw).and_then(VecDeque::pop_front) {
            return Ok(reply);
        }
        state
            .standing
            .get(&raw)
            .cloned()
            .ok_or_else(|| anyhow!("read timeout at address {}", raw))
    }

    async fn identify(&self, address: DeviceAddress) -> Result<()> {
        if lock(&self.state).attached.contains(&address.value()) {
            Ok(())
        } else {
            Err(anyhow!("no listener at address {}", address))
        }
    }
}

// =============================================================================
// DeviceModel - Simulated Device Under Test
// =============================================================================

/// Electrical model of the device under test
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceModel {
    /// Ideal amplifier: the response is `gain * v` for either meter function
    Linear {
        /// Transfer gain
        gain: f64,
    },
    /// Ohmic resistor between source and meter
    Resistor {
        /// Resistance in ohms
        ohms: f64,
    },
    /// Shockley diode
    Diode {
        /// Reverse saturation current (amps)
        saturation_current: f64,
        /// Ideality factor
        ideality: f64,
        /// Thermal voltage (volts)
        thermal_voltage: f64,
    },
}

impl Default for DeviceModel {
    fn default() -> Self {
        DeviceModel::Diode {
            saturation_current: 1.0e-12,
            ideality: 1.0,
            thermal_voltage: 0.02585,
        }
    }
}

impl DeviceModel {
    /// Current through the device at bias `v`.
    pub fn current(&self, v: f64) -> f64 {
        match *self {
            DeviceModel::Linear { gain } => gain * v,
            DeviceModel::Resistor { ohms } => v / ohms,
            DeviceModel::Diode {
                saturation_current,
                ideality,
                thermal_voltage,
            } => saturation_current * ((v / (ideality * thermal_voltage)).exp() - 1.0),
        }
    }

    /// What the meter reads at bias `v` with `function` selected.
    pub fn reading(&self, v: f64, function: MeasureFunction) -> f64 {
        match (self, function) {
            (DeviceModel::Linear { gain }, _) => gain * v,
            (_, MeasureFunction::DcVoltage) => v,
            (_, MeasureFunction::DcCurrent) => self.current(v),
        }
    }
}

impl fmt::Display for DeviceModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceModel::Linear { gain } => write!(f, "linear (gain {})", gain),
            DeviceModel::Resistor { ohms } => write!(f, "resistor ({} ohm)", ohms),
            DeviceModel::Diode {
                saturation_current,
                ideality,
                ..
            } => write!(f, "diode (Is {:e} A, n {})", saturation_current, ideality),
        }
    }
}

// =============================================================================
// SimulatedBench - Source + Meter + DUT
// =============================================================================

#[derive(Debug)]
struct BenchState {
    model: DeviceModel,
    latency: Duration,
    source_connected: bool,
    meter_connected: bool,
    output: Option<f64>,
    standby: bool,
    function: MeasureFunction,
    writes: u64,
    reads: u64,
    fail_write_on: Option<u64>,
    fail_read_on: Option<u64>,
    applied: Vec<f64>,
    source_settings: Vec<SourceSetting>,
    meter_functions: Vec<MeasureFunction>,
}

/// Simulated source and meter sharing one device under test
///
/// Cloning the bench shares its state, so a test can keep a handle for inspection and
/// failure injection while the controller owns the drivers.
///
/// # Example
///
/// ```rust,ignore
/// let bench = SimulatedBench::new(DeviceModel::Linear { gain: 2.0 });
/// bench.fail_read_on(5);
/// let controller = SweepController::new(Box::new(bench.source()), Box::new(bench.meter()), config)?;
/// ```
#[derive(Debug, Clone)]
pub struct SimulatedBench {
    state: Arc<Mutex<BenchState>>,
    source_address: DeviceAddress,
    meter_address: DeviceAddress,
}

impl SimulatedBench {
    /// Bench at the factory addresses with no bus latency
    pub fn new(model: DeviceModel) -> Self {
        Self {
            state: Arc::new(Mutex::new(BenchState {
                model,
                latency: Duration::ZERO,
                source_connected: true,
                meter_connected: true,
                output: None,
                standby: true,
                function: MeasureFunction::DcVoltage,
                writes: 0,
                reads: 0,
                fail_write_on: None,
                fail_read_on: None,
                applied: Vec::new(),
                source_settings: Vec::new(),
                meter_functions: Vec::new(),
            })),
            source_address: keithley230::DEFAULT_ADDRESS,
            meter_address: keithley196::DEFAULT_ADDRESS,
        }
    }

    /// Bench at the `[instruments]` addresses running the `[simulation]` model.
    ///
    /// # Errors
    /// `OpenFailed` if an address is outside the GPIB range.
    pub fn from_settings(settings: &Settings) -> SweepResult<Self> {
        let source = DeviceAddress::new(settings.instruments.source_address)?;
        let meter = DeviceAddress::new(settings.instruments.multimeter_address)?;
        Ok(Self::new(settings.simulation.model)
            .with_addresses(source, meter)
            .with_latency(Duration::from_millis(settings.simulation.latency_ms)))
    }

    /// Use other bus addresses
    pub fn with_addresses(mut self, source: DeviceAddress, meter: DeviceAddress) -> Self {
        self.source_address = source;
        self.meter_address = meter;
        self
    }

    /// Delay every simulated bus transaction
    pub fn with_latency(self, latency: Duration) -> Self {
        lock(&self.state).latency = latency;
        self
    }

    /// Driver for the simulated voltage source
    pub fn source(&self) -> SimulatedSource {
        SimulatedSource {
            address: self.source_address,
            state: Arc::clone(&self.state),
        }
    }

    /// Driver for the simulated multimeter
    pub fn meter(&self) -> SimulatedMeter {
        SimulatedMeter {
            address: self.meter_address,
            state: Arc::clone(&self.state),
        }
    }

    /// Swap the device under test
    pub fn set_model(&self, model: DeviceModel) {
        lock(&self.state).model = model;
    }

    /// Fail the `n`th stimulus write (1-based, counted since creation)
    pub fn fail_write_on(&self, n: u64) {
        lock(&self.state).fail_write_on = Some(n);
    }

    /// Fail the `n`th meter read (1-based, counted since creation)
    pub fn fail_read_on(&self, n: u64) {
        lock(&self.state).fail_read_on = Some(n);
    }

    /// Unplug the source
    pub fn disconnect_source(&self) {
        lock(&self.state).source_connected = false;
    }

    /// Unplug the meter
    pub fn disconnect_meter(&self) {
        lock(&self.state).meter_connected = false;
    }

    /// Stimulus writes attempted
    pub fn write_count(&self) -> u64 {
        lock(&self.state).writes
    }

    /// Meter reads attempted
    pub fn read_count(&self) -> u64 {
        lock(&self.state).reads
    }

    /// Stimuli that reached the source, in order
    pub fn applied(&self) -> Vec<f64> {
        lock(&self.state).applied.clone()
    }

    /// Present source output, `None` in standby
    pub fn output(&self) -> Option<f64> {
        let state = lock(&self.state);
        if state.standby {
            None
        } else {
            state.output
        }
    }

    /// Every source configuration received
    pub fn source_settings(&self) -> Vec<SourceSetting> {
        lock(&self.state).source_settings.clone()
    }

    /// Every meter function received
    pub fn meter_functions(&self) -> Vec<MeasureFunction> {
        lock(&self.state).meter_functions.clone()
    }
}

async fn bus_delay(state: &Mutex<BenchState>) {
    let latency = lock(state).latency;
    if !latency.is_zero() {
        sleep(latency).await;
    }
}

/// Voltage source half of a [`SimulatedBench`]
#[derive(Debug)]
pub struct SimulatedSource {
    address: DeviceAddress,
    state: Arc<Mutex<BenchState>>,
}

impl SimulatedSource {
    fn ensure_connected(&self) -> SweepResult<()> {
        if lock(&self.state).source_connected {
            Ok(())
        } else {
            Err(SweepError::NotConnected {
                address: self.address,
            })
        }
    }
}

#[async_trait]
impl Instrument for SimulatedSource {
    fn address(&self) -> DeviceAddress {
        self.address
    }

    fn is_open(&self) -> bool {
        lock(&self.state).source_connected
    }

    async fn check_health(&mut self) -> bool {
        self.is_open()
    }
}

#[async_trait]
impl Configurable for SimulatedSource {
    type Setting = SourceSetting;

    async fn configure(&mut self, setting: &SourceSetting) -> SweepResult<()> {
        self.ensure_connected()?;
        bus_delay(&self.state).await;
        let mut state = lock(&self.state);
        state.source_settings.push(*setting);
        state.standby = false;
        debug!(address = %self.address, limit = setting.current_limit, "simulated source configured");
        Ok(())
    }
}

#[async_trait]
impl StimulusOutput for SimulatedSource {
    async fn set_stimulus(&mut self, value: f64) -> SweepResult<()> {
        self.ensure_connected()?;
        bus_delay(&self.state).await;
        let mut state = lock(&self.state);
        state.writes += 1;
        if state.fail_write_on == Some(state.writes) {
            return Err(SweepError::WriteFailed {
                address: self.address,
                reason: format!("injected failure on write {}", state.writes),
            });
        }
        state.output = Some(value);
        state.standby = false;
        state.applied.push(value);
        Ok(())
    }

    async fn standby(&mut self) -> SweepResult<()> {
        self.ensure_connected()?;
        lock(&self.state).standby = true;
        Ok(())
    }
}

/// Multimeter half of a [`SimulatedBench`]
#[derive(Debug)]
pub struct SimulatedMeter {
    address: DeviceAddress,
    state: Arc<Mutex<BenchState>>,
}

impl SimulatedMeter {
    fn ensure_connected(&self) -> SweepResult<()> {
        if lock(&self.state).meter_connected {
            Ok(())
        } else {
            Err(SweepError::NotConnected {
                address: self.address,
            })
        }
    }
}

#[async_trait]
impl Instrument for SimulatedMeter {
    fn address(&self) -> DeviceAddress {
        self.address
    }

    fn is_open(&self) -> bool {
        lock(&self.state).meter_connected
    }

    async fn check_health(&mut self) -> bool {
        self.is_open()
    }
}

#[async_trait]
impl Configurable for SimulatedMeter {
    type Setting = MeasureFunction;

    async fn configure(&mut self, setting: &MeasureFunction) -> SweepResult<()> {
        self.ensure_connected()?;
        bus_delay(&self.state).await;
        let mut state = lock(&self.state);
        state.function = *setting;
        state.meter_functions.push(*setting);
        Ok(())
    }
}

#[async_trait]
impl Readable for SimulatedMeter {
    async fn read_measurement(&mut self) -> SweepResult<f64> {
        self.ensure_connected()?;
        bus_delay(&self.state).await;
        let mut state = lock(&self.state);
        state.reads += 1;
        if state.fail_read_on == Some(state.reads) {
            return Err(SweepError::ReadFailed {
                address: self.address,
                reason: format!("injected failure on read {}", state.reads),
            });
        }
        let bias = if state.standby {
            0.0
        } else {
            state.output.unwrap_or(0.0)
        };
        Ok(state.model.reading(bias, state.function))
    }
}

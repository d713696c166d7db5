//! CLI Entry Point for iv-sweep
//!
//! Provides command-line interface for:
//! - Running a sweep on the bench or the simulated bench
//! - Checking and printing the effective settings
//! - Previewing the stimulus sequence of a configuration
//! - Summarizing an existing bench log
//!
//! # Usage
//!
//! ```bash
//! iv-sweep run --config bench.toml --output keithley.log
//! iv-sweep run --simulate --csv run.csv
//! iv-sweep plan --config bench.toml
//! iv-sweep show-log keithley.log
//! ```

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use iv_sweep::config::{BusKind, Settings, DEFAULT_SETTINGS_FILE};
use iv_sweep::hardware::SimulatedBench;
use iv_sweep::instruments::Instruments;
use iv_sweep::logging;
use iv_sweep::sink::{read_sweep_log, LogFileSink, MultiSink};
use iv_sweep::sweep::{plan_stimuli, SweepRunner};
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "iv-sweep")]
#[command(about = "Adaptive I-V sweeps on a GPIB source and multimeter", long_about = None)]
struct Cli {
    /// Settings file
    #[arg(long, global = true, default_value = DEFAULT_SETTINGS_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one sweep to completion
    Run {
        /// Bench log file (overrides [run] output)
        #[arg(long)]
        output: Option<PathBuf>,

        /// Also write samples as CSV
        #[arg(long)]
        csv: Option<PathBuf>,

        /// Use the simulated bench regardless of [instruments] bus
        #[arg(long)]
        simulate: bool,
    },

    /// Validate settings and print them as TOML
    CheckConfig,

    /// Print the stimulus sequence without touching hardware
    Plan {
        /// Print as a JSON array
        #[arg(long)]
        json: bool,
    },

    /// Summarize a bench log file
    ShowLog {
        /// Log file written by `run`
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            output,
            csv,
            simulate,
        } => {
            let mut settings = load_settings(&cli.config)?;
            if let Some(output) = output {
                settings.run.output = output;
            }
            if csv.is_some() {
                settings.run.csv_output = csv;
            }
            if simulate {
                settings.instruments.bus = BusKind::Simulated;
            }
            settings.validate().context("Invalid settings")?;
            logging::init_from_settings(&settings).map_err(|e| anyhow!(e))?;
            run_sweep(&settings).await
        }
        Commands::CheckConfig => {
            let settings = load_settings(&cli.config)?;
            settings.validate().context("Invalid settings")?;
            print!("{}", settings.to_toml()?);
            Ok(())
        }
        Commands::Plan { json } => {
            let settings = load_settings(&cli.config)?;
            settings.sweep.validate().context("Invalid sweep")?;
            let plan = plan_stimuli(&settings.sweep);
            if json {
                println!("{}", serde_json::to_string(&plan)?);
                return Ok(());
            }
            println!("# {} steps", plan.len());
            for (index, stimulus) in plan.iter().enumerate() {
                println!("{:>5} {}", index + 1, stimulus);
            }
            Ok(())
        }
        Commands::ShowLog { file } => {
            let log = read_sweep_log(&file)?;
            println!("{}: {} points", file.display(), log.rows.len());
            println!("columns: {}", log.columns.join(" "));
            for (column, title) in log.columns.iter().enumerate() {
                if let Some((lo, hi)) = log.range(column) {
                    println!("{:>6}: {} .. {}", title, lo, hi);
                }
            }
            Ok(())
        }
    }
}

fn load_settings(path: &Path) -> Result<Settings> {
    Settings::load_from(path).with_context(|| format!("Failed to load {}", path.display()))
}

async fn open_instruments(settings: &Settings) -> Result<Instruments> {
    let addresses = &settings.instruments;
    match addresses.bus {
        BusKind::Simulated => {
            info!(model = %settings.simulation.model, "using simulated bench");
            let bench = SimulatedBench::from_settings(settings)?;
            Ok(Instruments::with_drivers(
                Box::new(bench.source()),
                Box::new(bench.meter()),
                settings.sweep.clone(),
            )?)
        }
        BusKind::Prologix => open_prologix(settings).await,
    }
}

#[cfg(feature = "instrument_serial")]
async fn open_prologix(settings: &Settings) -> Result<Instruments> {
    use iv_sweep::hardware::PrologixBus;
    use std::sync::Arc;
    use std::time::Duration;

    let port = settings
        .instruments
        .serial_port
        .as_deref()
        .ok_or_else(|| anyhow!("bus = \"prologix\" requires serial_port"))?;
    let bus = PrologixBus::open(port, Duration::from_millis(settings.instruments.timeout_ms))
        .await?;
    Ok(Instruments::open(
        Arc::new(bus),
        settings.instruments.multimeter_address,
        settings.instruments.source_address,
        settings.sweep.clone(),
    )
    .await?)
}

#[cfg(not(feature = "instrument_serial"))]
async fn open_prologix(_settings: &Settings) -> Result<Instruments> {
    bail!("Prologix support requires the 'instrument_serial' feature")
}

async fn run_sweep(settings: &Settings) -> Result<()> {
    let mut instruments = open_instruments(settings).await?;

    instruments.reset();
    if !instruments.setup_for_mode().await {
        bail!("Instrument setup failed");
    }

    let log = LogFileSink::for_configuration(&settings.run.output, instruments.configuration())?;
    let mut sink = MultiSink::new().with(log);
    #[cfg(feature = "storage_csv")]
    if let Some(path) = &settings.run.csv_output {
        sink = sink.with(iv_sweep::sink::CsvSink::create(path)?);
    }
    #[cfg(not(feature = "storage_csv"))]
    if settings.run.csv_output.is_some() {
        warn!("CSV output requested but the 'storage_csv' feature is disabled");
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current step");
            let _ = stop_tx.send(true);
        }
    });

    let runner =
        SweepRunner::new(settings.run.max_consecutive_failures).with_stop_signal(stop_rx);
    let outcome = instruments.run(&runner, &mut sink).await;
    instruments.shutdown().await;
    let summary = outcome?;

    println!(
        "{} steps, {} failed, log written to {}",
        summary.steps,
        summary.failures,
        settings.run.output.display()
    );
    if summary.aborted {
        error!(failures = summary.failures, "sweep aborted");
        bail!("Sweep aborted after repeated failures");
    }
    if summary.cancelled {
        bail!("Sweep interrupted");
    }
    info!("sweep complete");
    Ok(())
}

//! Bench Run Integration Tests
//!
//! Full runs through the `Instruments` facade on the simulated bench:
//! - settings file -> sweep configuration -> run -> bench log on disk
//! - bench log read back as plot input
//! - CSV output (storage_csv feature)
//! - abort policy on a misbehaving meter

use iv_sweep::config::Settings;
use iv_sweep::hardware::{DeviceModel, SimulatedBench};
use iv_sweep::instruments::Instruments;
use iv_sweep::sink::{read_sweep_log, LogFileSink, MultiSink};
use iv_sweep::sweep::{OperatingMode, SweepConfiguration, SweepRunner};
use std::fs;
use tempfile::TempDir;

fn bench_instruments(bench: &SimulatedBench, config: SweepConfiguration) -> Instruments {
    Instruments::with_drivers(Box::new(bench.source()), Box::new(bench.meter()), config)
        .expect("valid configuration")
}

#[tokio::test(start_paused = true)]
async fn run_from_settings_file_writes_bench_log() {
    let dir = TempDir::new().unwrap();
    let settings_path = dir.path().join("bench.toml");
    fs::write(
        &settings_path,
        r#"
[sweep]
start = -0.5
stop = 0.5
coarse_step = 0.1
fine_step = 0.05
window = 0.2
mode = "test"

[run]
max_consecutive_failures = 2
"#,
    )
    .unwrap();

    let settings = Settings::load_from(&settings_path).unwrap();
    settings.validate().unwrap();
    assert_eq!(settings.sweep.mode, OperatingMode::Test);

    let bench = SimulatedBench::new(DeviceModel::Linear { gain: 3.0 });
    let mut instruments = bench_instruments(&bench, settings.sweep.clone());
    assert_eq!(instruments.window(), 0.2);
    assert_eq!(instruments.fine_step(), 0.05);

    instruments.reset();
    assert!(instruments.setup_for_mode().await);

    let log_path = dir.path().join("keithley.log");
    let log = LogFileSink::for_configuration(&log_path, instruments.configuration()).unwrap();
    let mut sink = MultiSink::new().with(log);

    let runner = SweepRunner::new(settings.run.max_consecutive_failures);
    let summary = instruments.run(&runner, &mut sink).await.unwrap();
    assert!(summary.completed());
    assert!(instruments.done());
    drop(sink);

    let text = fs::read_to_string(&log_path).unwrap();
    assert!(text.starts_with("# V Vout\n"));
    assert!(text.contains("# Start: -0.5, Stop: 0.5"));

    let parsed = read_sweep_log(&log_path).unwrap();
    assert_eq!(parsed.columns, vec!["V", "Vout"]);
    assert_eq!(parsed.rows.len() as u64, summary.steps);
    for (v, out) in parsed.points(1) {
        assert!((out - 3.0 * v).abs() < 1e-9);
    }
    let (lo, hi) = parsed.range(0).unwrap();
    assert_eq!(lo, -0.5);
    assert!(hi > 0.5);
}

#[tokio::test(start_paused = true)]
async fn failed_reads_become_log_comments() {
    let dir = TempDir::new().unwrap();
    let log_path = dir.path().join("gaps.log");

    let bench = SimulatedBench::new(DeviceModel::Resistor { ohms: 100.0 });
    bench.fail_read_on(3);
    let config = SweepConfiguration {
        start: 0.0,
        stop: 0.45,
        coarse_step: 0.1,
        fine_step: 0.1,
        window: 0.0,
        mode: OperatingMode::TrueIV,
        ..Default::default()
    };
    let mut instruments = bench_instruments(&bench, config);
    assert!(instruments.setup_for_mode().await);

    let mut sink = LogFileSink::for_configuration(&log_path, instruments.configuration()).unwrap();
    let summary = instruments
        .run(&SweepRunner::default(), &mut sink)
        .await
        .unwrap();
    drop(sink);

    assert_eq!(summary.steps, 6);
    assert_eq!(summary.failures, 1);

    let text = fs::read_to_string(&log_path).unwrap();
    assert!(text.contains("# step 3 failed, requested 0.2"));
    let parsed = read_sweep_log(&log_path).unwrap();
    assert_eq!(parsed.columns, vec!["V", "I"]);
    assert_eq!(parsed.rows.len(), 5);
}

#[tokio::test(start_paused = true)]
async fn persistent_meter_failure_aborts_run() {
    let bench = SimulatedBench::new(DeviceModel::default());
    bench.fail_read_on(2);
    bench.fail_write_on(3);
    let config = SweepConfiguration {
        mode: OperatingMode::Test,
        ..Default::default()
    };
    let mut instruments = bench_instruments(&bench, config);
    let mut sink = MultiSink::new();

    let summary = instruments
        .run(&SweepRunner::new(2), &mut sink)
        .await
        .unwrap();
    assert!(summary.aborted);
    assert!(!summary.completed());
    assert_eq!(summary.steps, 3);
    assert!(!instruments.done());
}

#[cfg(feature = "storage_csv")]
#[tokio::test(start_paused = true)]
async fn csv_copy_matches_bench_log() {
    use iv_sweep::sink::CsvSink;

    let dir = TempDir::new().unwrap();
    let log_path = dir.path().join("run.log");
    let csv_path = dir.path().join("run.csv");

    let bench = SimulatedBench::new(DeviceModel::Linear { gain: 1.0 });
    let config = SweepConfiguration {
        start: 1.0,
        stop: 0.0,
        window: 0.0,
        mode: OperatingMode::VoltToVolt,
        ..Default::default()
    };
    let mut instruments = bench_instruments(&bench, config);
    let mut sink = MultiSink::new()
        .with(LogFileSink::for_configuration(&log_path, instruments.configuration()).unwrap())
        .with(CsvSink::create(&csv_path).unwrap());

    let summary = instruments
        .run(&SweepRunner::default(), &mut sink)
        .await
        .unwrap();
    drop(sink);

    let mut reader = csv::Reader::from_path(&csv_path).unwrap();
    let records: Vec<csv::StringRecord> = reader.records().map(Result::unwrap).collect();
    assert_eq!(records.len() as u64, summary.steps);
    assert_eq!(&records[0][0], "1");
    assert_eq!(&records[0][1], "1");

    let parsed = read_sweep_log(&log_path).unwrap();
    assert_eq!(parsed.rows.len(), records.len());
}

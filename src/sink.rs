//! Sample sinks.
//!
//! The controller hands every consumed step to a [`SampleSink`] in step order. What
//! happens next is up to the sink: keep it in memory, forward it to a plot, or append it
//! to a file.
//!
//! The bench log format written by [`LogFileSink`] is the one the plotting tools read:
//!
//! ```text
//! # V I
//! # Program Starts: 2024-05-01T12:00:00+00:00
//! # Start: -1, Stop: 1, Step: 0.1, Fine: 0.01, Window: 0.7
//! -1 -0.00012
//! -0.9 -0.00011
//! # step 3 failed, requested -0.8
//! ```

use crate::sweep::config::{OperatingMode, SweepConfiguration};
use crate::sweep::state::Sample;
use anyhow::{anyhow, bail, Context, Result};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc::UnboundedSender;

/// Receiver of the ordered sample stream.
///
/// Implementations must not reorder samples relative to arrival.
pub trait SampleSink: Send {
    /// Take ownership of one sample.
    fn accept(&mut self, sample: Sample) -> Result<()>;
}

/// Keeps every sample in memory.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    samples: Vec<Sample>,
}

impl MemorySink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Samples received so far, in arrival order.
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Consume the sink, returning its samples.
    pub fn into_samples(self) -> Vec<Sample> {
        self.samples
    }

    /// Stimulus values received so far.
    pub fn stimuli(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.stimulus).collect()
    }
}

impl SampleSink for MemorySink {
    fn accept(&mut self, sample: Sample) -> Result<()> {
        self.samples.push(sample);
        Ok(())
    }
}

/// Forwards samples over an unbounded tokio channel (plot or GUI consumers).
pub struct ChannelSink {
    tx: UnboundedSender<Sample>,
}

impl ChannelSink {
    /// Wrap the sending half of a channel.
    pub fn new(tx: UnboundedSender<Sample>) -> Self {
        Self { tx }
    }
}

impl SampleSink for ChannelSink {
    fn accept(&mut self, sample: Sample) -> Result<()> {
        self.tx
            .send(sample)
            .map_err(|_| anyhow!("sample receiver dropped"))
    }
}

/// Delivers each sample to several sinks, in order.
#[derive(Default)]
pub struct MultiSink {
    sinks: Vec<Box<dyn SampleSink>>,
}

impl MultiSink {
    /// Empty fan-out.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink.
    pub fn with(mut self, sink: impl SampleSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl SampleSink for MultiSink {
    fn accept(&mut self, sample: Sample) -> Result<()> {
        for sink in &mut self.sinks {
            sink.accept(sample)?;
        }
        Ok(())
    }
}

// =============================================================================
// Bench log files
// =============================================================================

/// Appends samples to a bench log file.
pub struct LogFileSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl LogFileSink {
    /// Create (truncate) `path` and write the column title line.
    pub fn create(path: impl AsRef<Path>, x_title: &str, y_title: &str) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)
            .with_context(|| format!("Failed to create log file {}", path.display()))?;
        let mut sink = Self {
            path,
            writer: BufWriter::new(file),
        };
        sink.comment(&format!("{} {}", x_title, y_title))?;
        Ok(sink)
    }

    /// Create a log file headed with the sweep parameters.
    pub fn for_configuration(path: impl AsRef<Path>, config: &SweepConfiguration) -> Result<Self> {
        let y_title = match config.mode {
            OperatingMode::TrueIV | OperatingMode::InferredCurrent => "I",
            OperatingMode::Test | OperatingMode::VoltToVolt => "Vout",
        };
        let mut sink = Self::create(path, "V", y_title)?;
        sink.comment(&format!("Program Starts: {}", chrono::Utc::now().to_rfc3339()))?;
        sink.comment(&format!(
            "Start: {}, Stop: {}, Step: {}, Fine: {}, Window: {}",
            config.start, config.stop, config.coarse_step, config.fine_step, config.window
        ))?;
        sink.comment(&format!(
            "Mode: {}, Current limit: {}",
            config.mode, config.current_limit
        ))?;
        Ok(sink)
    }

    /// Path being written.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a `#` comment line.
    pub fn comment(&mut self, text: &str) -> Result<()> {
        writeln!(self.writer, "# {}", text)?;
        self.writer.flush()?;
        Ok(())
    }
}

impl SampleSink for LogFileSink {
    fn accept(&mut self, sample: Sample) -> Result<()> {
        match sample.response {
            Some(response) => writeln!(self.writer, "{} {}", sample.stimulus, response)?,
            None => writeln!(
                self.writer,
                "# step {} failed, requested {}",
                sample.step_index, sample.stimulus
            )?,
        }
        // Steps are slow; keep the file current in case the session dies.
        self.writer.flush()?;
        Ok(())
    }
}

/// Contents of a bench log file.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepLog {
    /// Column titles; the first is the x axis
    pub columns: Vec<String>,
    /// Data rows, one value per column
    pub rows: Vec<Vec<f64>>,
}

impl SweepLog {
    /// `(x, y)` pairs for data column `trace` (1-based, the x column is 0).
    pub fn points(&self, trace: usize) -> Vec<(f64, f64)> {
        self.rows
            .iter()
            .filter_map(|row| Some((*row.first()?, *row.get(trace)?)))
            .collect()
    }

    /// Minimum and maximum of column `column`, if there is data.
    pub fn range(&self, column: usize) -> Option<(f64, f64)> {
        self.rows
            .iter()
            .filter_map(|row| row.get(column).copied())
            .fold(None, |acc, v| match acc {
                None => Some((v, v)),
                Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
            })
    }
}

/// Parse a bench log file.
///
/// The first comment line holds the column titles. A single title is treated as the
/// trace name and the x column is titled `V`. Other comment lines and blank lines are
/// skipped.
pub fn read_sweep_log(path: impl AsRef<Path>) -> Result<SweepLog> {
    let path = path.as_ref();
    let file =
        File::open(path).with_context(|| format!("File not found: {}", path.display()))?;
    parse_sweep_log(BufReader::new(file))
}

fn parse_sweep_log(reader: impl BufRead) -> Result<SweepLog> {
    let mut columns: Option<Vec<String>> = None;
    let mut rows = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(comment) = trimmed.strip_prefix('#') {
            if columns.is_none() {
                let mut titles: Vec<String> =
                    comment.split_whitespace().map(str::to_string).collect();
                if titles.len() == 1 {
                    titles.insert(0, "V".to_string());
                }
                columns = Some(titles);
            }
            continue;
        }

        let row = trimmed
            .split_whitespace()
            .map(|field| {
                field
                    .parse::<f64>()
                    .with_context(|| format!("line {}: bad number '{}'", index + 1, field))
            })
            .collect::<Result<Vec<f64>>>()?;
        rows.push(row);
    }

    let columns = match columns {
        Some(columns) if !columns.is_empty() => columns,
        _ => bail!("Found no comment line with column titles"),
    };
    Ok(SweepLog { columns, rows })
}

// =============================================================================
// CSV
// =============================================================================

/// Writes samples as CSV: `step,stimulus,response,timestamp`.
#[cfg(feature = "storage_csv")]
pub struct CsvSink {
    writer: csv::Writer<File>,
}

#[cfg(feature = "storage_csv")]
impl CsvSink {
    /// Create (truncate) `path` and write the header record.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create CSV file {}", path.display()))?;
        writer.write_record(["step", "stimulus", "response", "timestamp"])?;
        writer.flush()?;
        Ok(Self { writer })
    }
}

#[cfg(feature = "storage_csv")]
impl SampleSink for CsvSink {
    fn accept(&mut self, sample: Sample) -> Result<()> {
        let response = sample.response.map(|r| r.to_string()).unwrap_or_default();
        self.writer.write_record(&[
            sample.step_index.to_string(),
            sample.stimulus.to_string(),
            response,
            chrono::Utc::now().to_rfc3339(),
        ])?;
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample(step: u64, stimulus: f64, response: Option<f64>) -> Sample {
        Sample {
            stimulus,
            response,
            step_index: step,
        }
    }

    #[test]
    fn memory_sink_keeps_arrival_order() {
        let mut sink = MemorySink::new();
        sink.accept(sample(1, -1.0, Some(-2.0))).unwrap();
        sink.accept(sample(2, -0.9, None)).unwrap();
        assert_eq!(sink.stimuli(), vec![-1.0, -0.9]);
        assert!(!sink.samples()[1].is_valid());
    }

    #[tokio::test]
    async fn channel_sink_forwards_and_reports_dropped_receiver() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut sink = ChannelSink::new(tx);
        sink.accept(sample(1, 0.5, Some(1.0))).unwrap();
        assert_eq!(rx.recv().await.unwrap().stimulus, 0.5);

        drop(rx);
        assert!(sink.accept(sample(2, 0.6, Some(1.2))).is_err());
    }

    #[test]
    fn multi_sink_fans_out() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut sink = MultiSink::new().with(MemorySink::new()).with(ChannelSink::new(tx));
        sink.accept(sample(1, 0.1, Some(0.2))).unwrap();
        assert_eq!(rx.try_recv().unwrap().step_index, 1);
    }

    #[test]
    fn parses_titles_and_skips_comments() {
        let text = "# V I\n# Start: -1\n-1 -2\n\n# step 2 failed, requested -0.9\n-0.8 -1.6\n";
        let log = parse_sweep_log(Cursor::new(text)).unwrap();
        assert_eq!(log.columns, vec!["V", "I"]);
        assert_eq!(log.points(1), vec![(-1.0, -2.0), (-0.8, -1.6)]);
        assert_eq!(log.range(0), Some((-1.0, -0.8)));
    }

    #[test]
    fn single_title_gets_voltage_axis() {
        let log = parse_sweep_log(Cursor::new("# I(D1)\n0 0\n")).unwrap();
        assert_eq!(log.columns, vec!["V", "I(D1)"]);
    }

    #[test]
    fn rejects_missing_header_and_bad_numbers() {
        assert!(parse_sweep_log(Cursor::new("0 1\n")).is_err());
        let err = parse_sweep_log(Cursor::new("# V I\n0 abc\n")).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn log_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keithley.log");
        let config = SweepConfiguration::default();
        {
            let mut sink = LogFileSink::for_configuration(&path, &config).unwrap();
            sink.accept(sample(1, -1.0, Some(-0.002))).unwrap();
            sink.accept(sample(2, -0.9, None)).unwrap();
            sink.accept(sample(3, -0.8, Some(-0.0016))).unwrap();
        }
        let log = read_sweep_log(&path).unwrap();
        assert_eq!(log.columns, vec!["V", "I"]);
        assert_eq!(log.points(1), vec![(-1.0, -0.002), (-0.8, -0.0016)]);

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("# step 2 failed, requested -0.9"));
    }

    #[cfg(feature = "storage_csv")]
    #[test]
    fn csv_sink_writes_empty_response_for_failed_reads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sweep.csv");
        {
            let mut sink = CsvSink::create(&path).unwrap();
            sink.accept(sample(1, 0.1, Some(0.2))).unwrap();
            sink.accept(sample(2, 0.2, None)).unwrap();
        }
        let mut reader = csv::Reader::from_path(&path).unwrap();
        let records: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(&records[0][1], "0.1");
        assert_eq!(&records[0][2], "0.2");
        assert_eq!(&records[1][2], "");
    }
}

//! Scalar metrics recording
//!
//! The trainer and validation engine emit `(name, iteration, value)` points
//! through the [`MetricsSink`] trait. [`MemorySink`] backs tests and
//! programmatic runs; [`CsvSink`] appends to a file for offline plotting.
//! Recording is best effort: a sink failure must never abort training.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::Result;

/// Destination for scalar training metrics
pub trait MetricsSink {
    /// Record one scalar at the given iteration
    fn record(&mut self, name: &str, iteration: usize, value: f32);

    /// Flush any buffered points
    fn flush(&mut self) {}
}

/// In-memory sink keyed by metric name
#[derive(Debug, Default)]
pub struct MemorySink {
    series: HashMap<String, Vec<(usize, f32)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded points for one metric, in recording order
    pub fn series(&self, name: &str) -> &[(usize, f32)] {
        self.series.get(name).map_or(&[], Vec::as_slice)
    }

    /// Most recent value for one metric
    pub fn latest(&self, name: &str) -> Option<f32> {
        self.series(name).last().map(|&(_, v)| v)
    }
}

impl MetricsSink for MemorySink {
    fn record(&mut self, name: &str, iteration: usize, value: f32) {
        self.series
            .entry(name.to_string())
            .or_default()
            .push((iteration, value));
    }
}

/// Append-only CSV sink, one `metric,iteration,value` row per point
///
/// Write errors are counted, not propagated: losing a metrics row is not
/// worth losing a training run.
pub struct CsvSink {
    writer: BufWriter<File>,
    write_errors: u64,
}

impl CsvSink {
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "metric,iteration,value")?;
        Ok(Self {
            writer,
            write_errors: 0,
        })
    }

    pub fn write_errors(&self) -> u64 {
        self.write_errors
    }
}

impl MetricsSink for CsvSink {
    fn record(&mut self, name: &str, iteration: usize, value: f32) {
        if writeln!(self.writer, "{name},{iteration},{value}").is_err() {
            self.write_errors += 1;
        }
    }

    fn flush(&mut self) {
        if std::io::Write::flush(&mut self.writer).is_err() {
            self.write_errors += 1;
        }
    }
}

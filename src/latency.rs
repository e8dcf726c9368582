//! Latency sample accounting.
//!
//! One meter per connection measures batch latency (first post to N-th
//! completion); one global meter measures round latency (tick start to the
//! last connection's N-th completion). Samples are appended in memory and
//! flushed to a file once, at poller exit.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::Instant;

/// A growable array of elapsed-time samples with one in-flight start stamp.
#[derive(Debug, Default)]
pub struct LatencyMeter {
    samples: Vec<f64>,
    started: Option<Instant>,
}

impl LatencyMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp the start of a measured interval, discarding any unfinished one.
    pub fn start(&mut self) {
        self.started = Some(Instant::now());
    }

    /// Record the time since the last [`start`](Self::start) in nanoseconds
    /// and return it. Returns `None` if no interval was started.
    pub fn record(&mut self) -> Option<f64> {
        let start = self.started.take()?;
        let ns = start.elapsed().as_nanos() as f64;
        self.samples.push(ns);
        Some(ns)
    }

    /// Number of recorded samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    /// Write all samples to `path`, one decimal nanosecond value per line.
    pub fn write_to(&self, path: &Path) -> io::Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        for s in &self.samples {
            writeln!(out, "{:.6}", s)?;
        }
        out.flush()
    }
}

/// Sample file name for one connection's batch latencies.
pub fn connection_samples_file(index: usize) -> String {
    format!("latency_samples_{}.txt", index)
}

/// Sample file name for global round latencies.
pub const ROUND_SAMPLES_FILE: &str = "read_completion_latency.txt";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_without_start_is_none() {
        let mut lm = LatencyMeter::new();
        assert_eq!(lm.record(), None);
        assert!(lm.is_empty());
    }

    #[test]
    fn samples_accumulate() {
        let mut lm = LatencyMeter::new();
        for _ in 0..3 {
            lm.start();
            let ns = lm.record().unwrap();
            assert!(ns >= 0.0);
        }
        assert_eq!(lm.len(), 3);
        // A start consumed by record does not allow a second record.
        assert_eq!(lm.record(), None);
        assert_eq!(lm.len(), 3);
    }

    #[test]
    fn file_format_is_one_decimal_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(connection_samples_file(3));

        let mut lm = LatencyMeter::new();
        lm.start();
        lm.record();
        lm.start();
        lm.record();
        lm.write_to(&path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            line.parse::<f64>().unwrap();
        }
    }

    #[test]
    fn sample_file_names() {
        assert_eq!(connection_samples_file(0), "latency_samples_0.txt");
        assert_eq!(connection_samples_file(17), "latency_samples_17.txt");
    }
}

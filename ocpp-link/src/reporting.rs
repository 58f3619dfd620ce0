//! Round-trip time records
//!
//! Heartbeat samples are appended to a JSON-lines file, one record per line:
//!
//! ```text
//! {"timestamp":"2026-01-20T12:00:00Z","rttSeconds":0.0123}
//! ```
//!
//! `export_csv` turns such a file into a `timestamp,rtt` table.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One completed heartbeat round trip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RttSample {
    pub timestamp: DateTime<Utc>,
    pub rtt_seconds: f64,
}

impl RttSample {
    pub fn new(timestamp: DateTime<Utc>, round_trip: Duration) -> Self {
        Self {
            timestamp,
            rtt_seconds: round_trip.as_secs_f64(),
        }
    }

    pub fn round_trip(&self) -> Duration {
        Duration::from_secs_f64(self.rtt_seconds.max(0.0))
    }
}

/// Sink for round-trip samples
pub trait Reporter: Send + Sync + 'static {
    fn append(&self, sample: &RttSample) -> Result<(), ReportError>;
}

impl<R: Reporter> Reporter for Arc<R> {
    fn append(&self, sample: &RttSample) -> Result<(), ReportError> {
        (**self).append(sample)
    }
}

/// Append-only JSON-lines file of samples
#[derive(Debug, Clone)]
pub struct RttLog {
    path: PathBuf,
}

impl RttLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every readable record in the file; unparsable lines are skipped
    pub fn read_all(&self) -> Result<Vec<RttSample>, ReportError> {
        read_samples(&self.path)
    }
}

impl Reporter for RttLog {
    fn append(&self, sample: &RttSample) -> Result<(), ReportError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        let mut writer = BufWriter::new(file);
        writeln!(writer, "{}", serde_json::to_string(sample)?)?;
        writer.flush()?;

        debug!("Recorded RTT {:.4}s to {:?}", sample.rtt_seconds, self.path);
        Ok(())
    }
}

fn read_samples(path: &Path) -> Result<Vec<RttSample>, ReportError> {
    let reader = BufReader::new(File::open(path)?);
    let mut samples = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<RttSample>(&line) {
            Ok(sample) => samples.push(sample),
            Err(e) => warn!("{:?} line {}: skipping record: {}", path, index + 1, e),
        }
    }

    Ok(samples)
}

/// Write `input`'s records as CSV to `output`. Returns the row count.
pub fn export_csv(input: &Path, output: &Path) -> Result<usize, ReportError> {
    let samples = read_samples(input)?;
    let mut writer = BufWriter::new(File::create(output)?);

    writeln!(writer, "timestamp,rtt")?;
    for sample in &samples {
        writeln!(
            writer,
            "{},{}",
            sample.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            sample.rtt_seconds
        )?;
    }
    writer.flush()?;

    debug!("Exported {} rows to {:?}", samples.len(), output);
    Ok(samples.len())
}

/// Distribution of a set of round trips
#[derive(Debug, Clone, PartialEq)]
pub struct RttSummary {
    pub count: usize,
    pub min: Duration,
    pub max: Duration,
    pub mean: Duration,
    pub p50: Duration,
    pub p95: Duration,
}

impl RttSummary {
    /// `None` for an empty set
    pub fn from_samples(samples: &[RttSample]) -> Option<Self> {
        let mut sorted: Vec<Duration> = samples.iter().map(RttSample::round_trip).collect();
        if sorted.is_empty() {
            return None;
        }
        sorted.sort_unstable();

        let count = sorted.len();
        let total: Duration = sorted.iter().sum();

        Some(Self {
            count,
            min: sorted[0],
            max: sorted[count - 1],
            mean: total / count as u32,
            p50: nearest_rank(&sorted, 50),
            p95: nearest_rank(&sorted, 95),
        })
    }
}

fn nearest_rank(sorted: &[Duration], percentile: usize) -> Duration {
    let rank = (percentile * sorted.len()).div_ceil(100).max(1);
    sorted[rank.min(sorted.len()) - 1]
}

impl std::fmt::Display for RttSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "n={} min={:?} mean={:?} p50={:?} p95={:?} max={:?}",
            self.count, self.min, self.mean, self.p50, self.p95, self.max
        )
    }
}

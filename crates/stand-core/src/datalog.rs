//! Append-only telemetry persistence and the two-speed sampling cadence.

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingMode {
    #[default]
    Normal,
    HighSpeed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    pub normal: Duration,
    pub high_speed: Duration,
}

impl Default for Cadence {
    fn default() -> Self {
        Self {
            normal: Duration::from_millis(500),
            high_speed: Duration::from_millis(100),
        }
    }
}

/// One device value at one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    /// Monotonic microseconds since process start.
    pub timestamp_us: u64,
    pub unix_us: u64,
    pub tick: u64,
    pub device: String,
    pub value: f64,
    pub unit: String,
}

pub trait TelemetrySink: Send {
    fn append(&mut self, records: &[TelemetryRecord]) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// JSON-lines file, opened in append mode.
pub struct JsonlSink {
    writer: BufWriter<File>,
}

impl JsonlSink {
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::with_capacity(64 * 1024, file),
        })
    }
}

impl TelemetrySink for JsonlSink {
    fn append(&mut self, records: &[TelemetryRecord]) -> io::Result<()> {
        for record in records {
            serde_json::to_writer(&mut self.writer, record)?;
            self.writer.write_all(b"\n")?;
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Shared in-memory sink; clones see the same records.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<TelemetryRecord>>>,
    fail: Arc<Mutex<bool>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TelemetryRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Make subsequent appends fail, to exercise write-fault handling.
    pub fn set_failing(&self, failing: bool) {
        if let Ok(mut f) = self.fail.lock() {
            *f = failing;
        }
    }
}

impl TelemetrySink for MemorySink {
    fn append(&mut self, records: &[TelemetryRecord]) -> io::Result<()> {
        if self.fail.lock().map(|f| *f).unwrap_or(false) {
            return Err(io::Error::new(io::ErrorKind::Other, "sink unavailable"));
        }
        let mut held = self
            .records
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "sink poisoned"))?;
        held.extend_from_slice(records);
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoggerStats {
    pub records_written: u64,
    pub write_failures: u64,
    pub mode_changes: u64,
}

/// Owns the sampling cadence and the telemetry sink.
pub struct DataLogger {
    mode: SamplingMode,
    cadence: Cadence,
    sink: Option<Box<dyn TelemetrySink>>,
    stats: LoggerStats,
}

impl DataLogger {
    pub fn new(cadence: Cadence, sink: Box<dyn TelemetrySink>) -> Self {
        Self {
            mode: SamplingMode::Normal,
            cadence,
            sink: Some(sink),
            stats: LoggerStats::default(),
        }
    }

    /// Cadence control only; records are dropped.
    pub fn without_sink(cadence: Cadence) -> Self {
        Self {
            mode: SamplingMode::Normal,
            cadence,
            sink: None,
            stats: LoggerStats::default(),
        }
    }

    pub fn mode(&self) -> SamplingMode {
        self.mode
    }

    pub fn is_high_speed(&self) -> bool {
        self.mode == SamplingMode::HighSpeed
    }

    pub fn cadence(&self) -> Cadence {
        self.cadence
    }

    pub fn interval(&self) -> Duration {
        match self.mode {
            SamplingMode::Normal => self.cadence.normal,
            SamplingMode::HighSpeed => self.cadence.high_speed,
        }
    }

    /// Returns whether the mode changed.
    pub fn set_mode(&mut self, mode: SamplingMode) -> bool {
        if self.mode == mode {
            return false;
        }
        self.mode = mode;
        self.stats.mode_changes += 1;
        log::info!("sampling mode {:?}, interval {:?}", mode, self.interval());
        true
    }

    pub fn stats(&self) -> &LoggerStats {
        &self.stats
    }

    /// Append one tick's records. A failure is counted and returned; the
    /// records are not retried.
    pub fn log(&mut self, records: &[TelemetryRecord]) -> io::Result<()> {
        let Some(sink) = self.sink.as_mut() else {
            return Ok(());
        };
        match sink.append(records) {
            Ok(()) => {
                self.stats.records_written += records.len() as u64;
                Ok(())
            }
            Err(e) => {
                self.stats.write_failures += 1;
                log::warn!("telemetry write failed ({} records lost): {e}", records.len());
                Err(e)
            }
        }
    }

    pub fn flush(&mut self) -> io::Result<()> {
        match self.sink.as_mut() {
            Some(sink) => sink.flush(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::tempdir;

    fn record(tick: u64, device: &str, value: f64) -> TelemetryRecord {
        TelemetryRecord {
            timestamp_us: tick * 1000,
            unix_us: 1_700_000_000_000_000 + tick,
            tick,
            device: device.to_string(),
            value,
            unit: "psi".to_string(),
        }
    }

    #[test]
    fn cadence_follows_mode() {
        let mut logger = DataLogger::without_sink(Cadence::default());
        assert_eq!(logger.interval(), Duration::from_millis(500));
        assert!(logger.set_mode(SamplingMode::HighSpeed));
        assert!(!logger.set_mode(SamplingMode::HighSpeed));
        assert_eq!(logger.interval(), Duration::from_millis(100));
        assert!(logger.set_mode(SamplingMode::Normal));
        assert_eq!(logger.stats().mode_changes, 2);
    }

    #[test]
    fn jsonl_sink_appends_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("runs/telemetry.jsonl");

        let mut logger = DataLogger::new(Cadence::default(), Box::new(JsonlSink::open(&path).unwrap()));
        logger.log(&[record(1, "PT-N2-01", 10.0), record(1, "PT-N2-02", 11.0)]).unwrap();
        logger.flush().unwrap();
        drop(logger);

        let mut logger = DataLogger::new(Cadence::default(), Box::new(JsonlSink::open(&path).unwrap()));
        logger.log(&[record(2, "PT-N2-01", 12.0)]).unwrap();
        logger.flush().unwrap();

        let mut content = String::new();
        File::open(&path).unwrap().read_to_string(&mut content).unwrap();
        let rows: Vec<TelemetryRecord> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].tick, 2);
        assert_eq!(rows[1].device, "PT-N2-02");
    }

    #[test]
    fn write_failure_is_counted_not_fatal() {
        let sink = MemorySink::new();
        let mut logger = DataLogger::new(Cadence::default(), Box::new(sink.clone()));
        sink.set_failing(true);
        assert!(logger.log(&[record(1, "PT", 1.0)]).is_err());
        sink.set_failing(false);
        logger.log(&[record(2, "PT", 2.0)]).unwrap();
        assert_eq!(logger.stats().write_failures, 1);
        assert_eq!(logger.stats().records_written, 1);
        assert_eq!(sink.records().len(), 1);
    }
}

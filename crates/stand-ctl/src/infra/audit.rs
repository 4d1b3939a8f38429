//! Audit logging for safety-critical events.
//!
//! Every redline breach, shutdown pass, sequence transition, connection
//! change and operator command lands in an append-only JSONL trail.

use serde::{Deserialize, Serialize};
use stand_core::{ShutdownReason, ShutdownReport, StandEvent, StopReason};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

/// Types of events that are logged in the audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    SystemStart,
    SystemShutdown,
    ConnectionLost,
    ConnectionRestored,
    ReconnectFailed,
    /// Window median crossed a redline
    RedlineBreach,
    /// One pass of the emergency shutdown routine
    ShutdownPass,
    /// A valve could not be driven to its safe state
    ValveSafeFailure,
    SequenceStarted,
    SequenceRejected,
    SequenceStopped,
    SequenceCompleted,
    StepDispatched,
    OperatorCommand,
    ValveCommanded,
    Rearmed,
    TelemetryWriteFailed,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Monotonic timestamp in microseconds
    pub timestamp_us: u64,
    /// Wall-clock Unix timestamp in microseconds
    pub unix_us: u64,
    pub event_type: AuditEventType,
    pub details: serde_json::Value,
}

/// Thread-safe audit logger that writes to a JSONL file
pub struct AuditLogger {
    writer: Mutex<BufWriter<File>>,
}

impl AuditLogger {
    /// The file is opened in append mode to preserve existing logs.
    pub fn new(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            writer: Mutex::new(BufWriter::with_capacity(8192, file)),
        })
    }

    pub fn log(&self, entry: AuditEntry) -> std::io::Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| std::io::Error::other("audit writer poisoned"))?;
        serde_json::to_writer(&mut *writer, &entry)?;
        writer.write_all(b"\n")?;
        writer.flush()
    }

    pub fn log_event(
        &self,
        timestamp_us: u64,
        unix_us: u64,
        event_type: AuditEventType,
        details: serde_json::Value,
    ) -> std::io::Result<()> {
        self.log(AuditEntry {
            timestamp_us,
            unix_us,
            event_type,
            details,
        })
    }
}

/// Details for a shutdown pass
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownDetails {
    pub reason: ShutdownReason,
    pub episode: u64,
    pub first_in_episode: bool,
    pub skipped: bool,
    pub sequence_aborted: bool,
    pub safed: Vec<String>,
    pub faults: Vec<String>,
}

impl From<&ShutdownReport> for ShutdownDetails {
    fn from(report: &ShutdownReport) -> Self {
        Self {
            reason: report.reason.clone(),
            episode: report.episode,
            first_in_episode: report.first_in_episode,
            skipped: report.skipped,
            sequence_aborted: report.sequence_aborted,
            safed: report.safed.clone(),
            faults: report.faults.iter().map(ToString::to_string).collect(),
        }
    }
}

/// Audit entries for one loop event. Read faults and mode changes are
/// left to the telemetry log and metrics.
pub fn entries_for(event: &StandEvent) -> Vec<(AuditEventType, serde_json::Value)> {
    use serde_json::json;
    match event {
        StandEvent::ConnectionLost => vec![(AuditEventType::ConnectionLost, json!({}))],
        StandEvent::ConnectionRestored => vec![(AuditEventType::ConnectionRestored, json!({}))],
        StandEvent::ReconnectFailed(e) => vec![(
            AuditEventType::ReconnectFailed,
            json!({ "error": e.to_string() }),
        )],
        StandEvent::RedlineBreach(breach) => vec![(
            AuditEventType::RedlineBreach,
            json!({
                "device": breach.device,
                "median": breach.median,
                "redline": breach.redline,
                "window": breach.window,
            }),
        )],
        StandEvent::Shutdown(report) => {
            let details = ShutdownDetails::from(report);
            let mut entries: Vec<_> = report
                .faults
                .iter()
                .map(|fault| {
                    (
                        AuditEventType::ValveSafeFailure,
                        json!({
                            "valve": fault.device(),
                            "error": fault.to_string(),
                            "episode": report.episode,
                        }),
                    )
                })
                .collect();
            entries.insert(
                0,
                (
                    AuditEventType::ShutdownPass,
                    serde_json::to_value(details).unwrap_or_default(),
                ),
            );
            entries
        }
        StandEvent::SequenceStarted { run, steps, source } => vec![(
            AuditEventType::SequenceStarted,
            json!({ "run": run, "steps": steps, "source": source }),
        )],
        StandEvent::SequenceRejected(e) => vec![(
            AuditEventType::SequenceRejected,
            json!({ "error": e.to_string() }),
        )],
        StandEvent::SequenceStopped(summary) => {
            let event_type = if summary.reason == StopReason::Completed {
                AuditEventType::SequenceCompleted
            } else {
                AuditEventType::SequenceStopped
            };
            vec![(event_type, serde_json::to_value(summary).unwrap_or_default())]
        }
        StandEvent::StepDispatched(outcome) => vec![(
            AuditEventType::StepDispatched,
            json!({
                "index": outcome.index,
                "step": outcome.step.to_string(),
                "error": outcome.result.as_ref().err().map(ToString::to_string),
            }),
        )],
        StandEvent::ValveCommanded {
            valve,
            open,
            result,
        } => vec![(
            AuditEventType::ValveCommanded,
            json!({
                "valve": valve,
                "open": open,
                "error": result.as_ref().err().map(ToString::to_string),
            }),
        )],
        StandEvent::Rearmed { was_latched } => vec![(
            AuditEventType::Rearmed,
            json!({ "was_latched": was_latched }),
        )],
        StandEvent::LogWriteFailed(e) => vec![(
            AuditEventType::TelemetryWriteFailed,
            json!({ "error": e }),
        )],
        StandEvent::ReadFault(_) | StandEvent::ModeChanged(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stand_core::{DeviceError, ProviderError, RunSummary};
    use std::io::Read;
    use tempfile::tempdir;

    #[test]
    fn audit_logger_appends_jsonl() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs/audit.jsonl");

        let logger = AuditLogger::new(&path).unwrap();
        logger
            .log_event(
                1000,
                1704067200000000,
                AuditEventType::SystemStart,
                serde_json::json!({"version": "0.1.0"}),
            )
            .unwrap();
        drop(logger);

        // reopening appends
        let logger = AuditLogger::new(&path).unwrap();
        logger
            .log_event(
                2000,
                1704067201000000,
                AuditEventType::OperatorCommand,
                serde_json::json!({"command": "shutdown"}),
            )
            .unwrap();

        let mut content = String::new();
        File::open(&path)
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();

        let lines: Vec<&str> = content.trim().split('\n').collect();
        assert_eq!(lines.len(), 2);

        let entry1: AuditEntry = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(entry1.timestamp_us, 1000);
        assert_eq!(entry1.event_type, AuditEventType::SystemStart);

        let entry2: AuditEntry = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(entry2.event_type, AuditEventType::OperatorCommand);
        assert_eq!(entry2.details["command"], "shutdown");
    }

    #[test]
    fn shutdown_with_fault_yields_pass_and_failure() {
        let report = ShutdownReport {
            reason: ShutdownReason::Redline {
                device: "PT-FU-01".into(),
            },
            episode: 1,
            first_in_episode: true,
            skipped: false,
            sequence_aborted: true,
            safed: vec!["SN-O2-01".into()],
            faults: vec![DeviceError::Provider {
                device: "SN-H2-01".into(),
                source: ProviderError::NotConnected,
            }],
        };
        let entries = entries_for(&StandEvent::Shutdown(report));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, AuditEventType::ShutdownPass);
        assert_eq!(entries[0].1["reason"]["source"], "redline");
        assert_eq!(entries[0].1["reason"]["device"], "PT-FU-01");
        assert_eq!(entries[1].0, AuditEventType::ValveSafeFailure);
        assert_eq!(entries[1].1["valve"], "SN-H2-01");
    }

    #[test]
    fn completed_run_is_distinguished() {
        let summary = RunSummary {
            run: 3,
            reason: StopReason::Completed,
            dispatched: 4,
            failed: 0,
            discarded: 0,
        };
        let entries = entries_for(&StandEvent::SequenceStopped(summary));
        assert_eq!(entries[0].0, AuditEventType::SequenceCompleted);
        assert_eq!(entries[0].1["reason"], "completed");
        assert!(entries_for(&StandEvent::ModeChanged(stand_core::SamplingMode::Normal)).is_empty());
    }
}

//! Autosequence definitions: parsing, validation against the device
//! registry, and the sources the sequencer loads them from.

use crate::registry::DeviceRegistry;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SequenceError {
    #[error("failed to read {path}: {message}")]
    Io { path: String, message: String },
    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error("invalid JSON sequence: {0}")]
    Json(String),
    #[error("step {step}: unknown device {device}")]
    UnknownDevice { step: usize, device: String },
    #[error("step {step}: {device} cannot be commanded")]
    NotCommandable { step: usize, device: String },
    #[error("step {step}: set on {device} needs a value")]
    MissingValue { step: usize, device: String },
    #[error("sequence has no steps")]
    Empty,
    #[error("no sequence source configured")]
    NoSource,
    #[error("sequencer already running")]
    AlreadyRunning,
    #[error("shutdown latched; reset before starting")]
    ShutdownLatched,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Open,
    Close,
    /// Nonzero value opens, zero closes.
    Set,
    /// Marker only; holds the run open until its offset.
    Wait,
}

impl Action {
    pub fn needs_valve(&self) -> bool {
        !matches!(self, Self::Wait)
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" | "on" => Ok(Self::Open),
            "close" | "off" => Ok(Self::Close),
            "set" => Ok(Self::Set),
            "wait" => Ok(Self::Wait),
            other => Err(format!("unknown action '{other}'")),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Open => "open",
            Self::Close => "close",
            Self::Set => "set",
            Self::Wait => "wait",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SequenceStep {
    pub offset: Duration,
    pub device: String,
    pub action: Action,
    pub value: Option<f64>,
}

impl SequenceStep {
    pub fn new(offset: Duration, device: impl Into<String>, action: Action) -> Self {
        Self {
            offset,
            device: device.into(),
            action,
            value: None,
        }
    }

    pub fn with_value(mut self, value: f64) -> Self {
        self.value = Some(value);
        self
    }
}

impl fmt::Display for SequenceStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "T+{:.3}s {} {}",
            self.offset.as_secs_f64(),
            self.action,
            self.device
        )?;
        if let Some(v) = self.value {
            write!(f, " = {v}")?;
        }
        Ok(())
    }
}

/// On-disk shape of one step; `time` is seconds from sequence start.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StepRecord {
    time: f64,
    device: String,
    action: Action,
    #[serde(default)]
    value: Option<f64>,
}

fn offset_from_secs(secs: f64) -> Result<Duration, String> {
    if !secs.is_finite() || secs < 0.0 {
        return Err(format!("time offset must be a non-negative number, got {secs}"));
    }
    Duration::try_from_secs_f64(secs).map_err(|e| format!("time offset {secs}: {e}"))
}

/// Parse `time,device,action[,value]` lines. Blank lines, `#` comments and
/// a leading header row are ignored.
pub fn parse_csv(text: &str) -> Result<Vec<SequenceStep>, SequenceError> {
    let mut steps = Vec::new();
    let mut seen_data = false;
    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = trimmed.split(',').map(str::trim).collect();
        if !seen_data && fields[0].eq_ignore_ascii_case("time") {
            seen_data = true;
            continue;
        }
        seen_data = true;
        let time = fields[0].parse::<f64>().map_err(|_| SequenceError::Parse {
            line,
            message: format!("bad time offset '{}'", fields[0]),
        })?;
        if fields.len() < 3 {
            return Err(SequenceError::Parse {
                line,
                message: "expected time,device,action[,value]".to_string(),
            });
        }
        let offset = offset_from_secs(time).map_err(|message| SequenceError::Parse { line, message })?;
        let action = fields[2]
            .parse::<Action>()
            .map_err(|message| SequenceError::Parse { line, message })?;
        let value = match fields.get(3).filter(|v| !v.is_empty()) {
            Some(v) => Some(v.parse::<f64>().map_err(|_| SequenceError::Parse {
                line,
                message: format!("bad value '{v}'"),
            })?),
            None => None,
        };
        steps.push(SequenceStep {
            offset,
            device: fields[1].to_string(),
            action,
            value,
        });
    }
    Ok(steps)
}

/// Parse a JSON array of `{time, device, action, value?}` objects.
pub fn parse_json(text: &str) -> Result<Vec<SequenceStep>, SequenceError> {
    let records: Vec<StepRecord> =
        serde_json::from_str(text).map_err(|e| SequenceError::Json(e.to_string()))?;
    records
        .into_iter()
        .map(|r| {
            let offset = offset_from_secs(r.time).map_err(SequenceError::Json)?;
            Ok(SequenceStep {
                offset,
                device: r.device,
                action: r.action,
                value: r.value,
            })
        })
        .collect()
}

/// A validated, time-ordered list of steps.
#[derive(Debug, Clone, PartialEq)]
pub struct Sequence {
    steps: Vec<SequenceStep>,
}

impl Sequence {
    /// Check every step against the registry and sort by offset. Steps that
    /// share an offset keep their listed order.
    pub fn from_steps(
        mut steps: Vec<SequenceStep>,
        registry: &DeviceRegistry,
    ) -> Result<Self, SequenceError> {
        if steps.is_empty() {
            return Err(SequenceError::Empty);
        }
        for (step, s) in steps.iter().enumerate() {
            let Some(device) = registry.get(&s.device) else {
                return Err(SequenceError::UnknownDevice {
                    step,
                    device: s.device.clone(),
                });
            };
            if s.action.needs_valve() && device.as_valve().is_none() {
                return Err(SequenceError::NotCommandable {
                    step,
                    device: s.device.clone(),
                });
            }
            if s.action == Action::Set && s.value.is_none() {
                return Err(SequenceError::MissingValue {
                    step,
                    device: s.device.clone(),
                });
            }
        }
        steps.sort_by_key(|s| s.offset);
        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[SequenceStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Offset of the last step.
    pub fn duration(&self) -> Duration {
        self.steps.last().map(|s| s.offset).unwrap_or_default()
    }

    pub fn into_steps(self) -> Vec<SequenceStep> {
        self.steps
    }
}

/// Where the sequencer gets a fresh sequence on every start.
pub trait SequenceSource: Send {
    fn load(&self, registry: &DeviceRegistry) -> Result<Sequence, SequenceError>;
    fn describe(&self) -> String;
}

/// A `.json` file is read as JSON; anything else as CSV.
#[derive(Debug, Clone)]
pub struct SequenceFile {
    path: PathBuf,
}

impl SequenceFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SequenceSource for SequenceFile {
    fn load(&self, registry: &DeviceRegistry) -> Result<Sequence, SequenceError> {
        let text = std::fs::read_to_string(&self.path).map_err(|e| SequenceError::Io {
            path: self.path.display().to_string(),
            message: e.to_string(),
        })?;
        let is_json = self
            .path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let steps = if is_json {
            parse_json(&text)?
        } else {
            parse_csv(&text)?
        };
        Sequence::from_steps(steps, registry)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Fixed steps, mostly for harnesses.
#[derive(Debug, Clone)]
pub struct StaticSequence(pub Vec<SequenceStep>);

impl SequenceSource for StaticSequence {
    fn load(&self, registry: &DeviceRegistry) -> Result<Sequence, SequenceError> {
        Sequence::from_steps(self.0.clone(), registry)
    }

    fn describe(&self) -> String {
        format!("{} built-in steps", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, SensorKind, Sensor, Valve};
    use std::io::Write;

    fn registry() -> DeviceRegistry {
        DeviceRegistry::from_devices([
            Device::from(Valve::new("V1", Some("EIO0".into()), false)),
            Device::from(Valve::new("V2", Some("EIO1".into()), false)),
            Device::from(Sensor::new("PT1", SensorKind::Pressure, Some("AIN0".into()))),
        ])
        .unwrap()
    }

    #[test]
    fn parses_csv_with_header_and_comments() {
        let text = "time,device,action,value\n# purge\n0.0, V1, open\n\n2.5,V2,SET,1\n3,PT1,wait\n";
        let steps = parse_csv(text).unwrap();
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0], SequenceStep::new(Duration::ZERO, "V1", Action::Open));
        assert_eq!(steps[1].action, Action::Set);
        assert_eq!(steps[1].value, Some(1.0));
        assert_eq!(steps[2].offset, Duration::from_secs(3));
    }

    #[test]
    fn csv_reports_line_numbers() {
        let err = parse_csv("0,V1,open\n1,V1,explode\n").unwrap_err();
        assert!(matches!(err, SequenceError::Parse { line: 2, .. }), "{err}");
        let err = parse_csv("0,V1,open\n-1,V1,close\n").unwrap_err();
        assert!(matches!(err, SequenceError::Parse { line: 2, .. }), "{err}");
    }

    #[test]
    fn malformed_first_step_is_not_taken_for_a_header() {
        let err = parse_csv("0.5s,V1,open\n1.0,V1,close\n").unwrap_err();
        assert!(matches!(err, SequenceError::Parse { line: 1, .. }), "{err}");
        let err = parse_csv("# comment\nTime,device,action\ntime,V1,open\n").unwrap_err();
        assert!(matches!(err, SequenceError::Parse { line: 3, .. }), "{err}");
        assert_eq!(parse_csv("TIME,DEVICE,ACTION\n0,V1,open\n").unwrap().len(), 1);
    }

    #[test]
    fn huge_time_offset_is_an_error() {
        let err = parse_csv("1e20,V1,open\n").unwrap_err();
        assert!(matches!(err, SequenceError::Parse { line: 1, .. }), "{err}");
        let err = parse_json(r#"[{"time": 1e300, "device": "V1", "action": "open"}]"#).unwrap_err();
        assert!(matches!(err, SequenceError::Json(_)), "{err}");
    }

    #[test]
    fn on_off_aliases() {
        assert_eq!("ON".parse::<Action>(), Ok(Action::Open));
        assert_eq!("off".parse::<Action>(), Ok(Action::Close));
    }

    #[test]
    fn parses_json() {
        let text = r#"[{"time":1.0,"device":"V1","action":"close"},{"time":0,"device":"V1","action":"open"}]"#;
        let seq = Sequence::from_steps(parse_json(text).unwrap(), &registry()).unwrap();
        assert_eq!(seq.steps()[0].action, Action::Open);
        assert_eq!(seq.duration(), Duration::from_secs(1));
    }

    #[test]
    fn sorting_is_stable_for_shared_offsets() {
        let steps = vec![
            SequenceStep::new(Duration::from_secs(2), "V1", Action::Close),
            SequenceStep::new(Duration::from_secs(2), "V2", Action::Open),
            SequenceStep::new(Duration::ZERO, "V1", Action::Open),
        ];
        let seq = Sequence::from_steps(steps, &registry()).unwrap();
        let order: Vec<_> = seq.steps().iter().map(|s| (s.device.as_str(), s.action)).collect();
        assert_eq!(
            order,
            [("V1", Action::Open), ("V1", Action::Close), ("V2", Action::Open)]
        );
    }

    #[test]
    fn rejects_unknown_and_uncommandable_devices() {
        let reg = registry();
        let err = Sequence::from_steps(
            vec![SequenceStep::new(Duration::ZERO, "V9", Action::Open)],
            &reg,
        )
        .unwrap_err();
        assert_eq!(err, SequenceError::UnknownDevice { step: 0, device: "V9".into() });

        let err = Sequence::from_steps(
            vec![SequenceStep::new(Duration::ZERO, "PT1", Action::Open)],
            &reg,
        )
        .unwrap_err();
        assert!(matches!(err, SequenceError::NotCommandable { .. }));

        let err = Sequence::from_steps(
            vec![SequenceStep::new(Duration::ZERO, "V1", Action::Set)],
            &reg,
        )
        .unwrap_err();
        assert!(matches!(err, SequenceError::MissingValue { .. }));

        assert_eq!(Sequence::from_steps(Vec::new(), &reg), Err(SequenceError::Empty));
    }

    #[test]
    fn wait_may_target_a_sensor() {
        let seq = Sequence::from_steps(
            vec![SequenceStep::new(Duration::from_secs(4), "PT1", Action::Wait)],
            &registry(),
        );
        assert!(seq.is_ok());
    }

    #[test]
    fn file_source_picks_format_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let csv_path = dir.path().join("hotfire.csv");
        let mut f = std::fs::File::create(&csv_path).unwrap();
        writeln!(f, "0,V1,open\n1,V1,close").unwrap();
        let json_path = dir.path().join("hotfire.json");
        std::fs::write(&json_path, r#"[{"time":0.5,"device":"V2","action":"open"}]"#).unwrap();

        let reg = registry();
        assert_eq!(SequenceFile::new(&csv_path).load(&reg).unwrap().len(), 2);
        assert_eq!(SequenceFile::new(&json_path).load(&reg).unwrap().len(), 1);
        let missing = SequenceFile::new(dir.path().join("nope.csv")).load(&reg);
        assert!(matches!(missing, Err(SequenceError::Io { .. })));
    }
}

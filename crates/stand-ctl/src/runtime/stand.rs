//! Stand definition: which devices exist, how they are wired and calibrated,
//! and which of them carry redlines.

use serde::{Deserialize, Serialize};
use stand_core::{
    Cadence, Calibration, ChannelLink, Device, DeviceKind, DeviceRegistry, RegistryError, Sensor,
    SensorKind, SimulatedStand, Valve,
};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_WINDOW: usize = 5;

#[derive(Debug, Error)]
pub enum StandConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid stand definition {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("{device}: {reason}")]
    Invalid { device: String, reason: String },
    #[error("tracked channel {0} is not a sensor on this stand")]
    Tracked(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub name: String,
    pub kind: DeviceKind,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub normally_open: bool,
    /// Falls back to the stock calibration for the sensor kind.
    #[serde(default)]
    pub calibration: Option<Calibration>,
    #[serde(default)]
    pub redline: Option<f64>,
}

impl DeviceSpec {
    fn sensor_kind(&self) -> Option<SensorKind> {
        match self.kind {
            DeviceKind::Valve => None,
            DeviceKind::PressureSensor => Some(SensorKind::Pressure),
            DeviceKind::Thermocouple => Some(SensorKind::Thermocouple),
            DeviceKind::LoadCell => Some(SensorKind::LoadCell),
        }
    }

    fn invalid(&self, reason: impl Into<String>) -> StandConfigError {
        StandConfigError::Invalid {
            device: self.name.clone(),
            reason: reason.into(),
        }
    }

    fn to_device(&self, window: usize) -> Result<Device, StandConfigError> {
        let Some(kind) = self.sensor_kind() else {
            if self.redline.is_some() || self.calibration.is_some() {
                return Err(self.invalid("valves take no calibration or redline"));
            }
            return Ok(Valve::new(&self.name, self.channel.clone(), self.normally_open).into());
        };
        if self.normally_open {
            return Err(self.invalid("normally_open applies to valves only"));
        }
        let calibration = self
            .calibration
            .unwrap_or_else(|| kind.default_calibration());
        if !calibration.is_valid() {
            return Err(self.invalid("calibration span is degenerate or non-finite"));
        }
        if self.redline.is_some_and(|r| !r.is_finite()) {
            return Err(self.invalid("redline must be finite"));
        }
        Ok(Sensor::new(&self.name, kind, self.channel.clone())
            .with_calibration(calibration)
            .with_redline(self.redline)
            .with_window(window)
            .into())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandConfig {
    pub name: String,
    pub devices: Vec<DeviceSpec>,
    #[serde(default)]
    pub tracked_channels: Vec<String>,
    #[serde(default = "default_window")]
    pub window: usize,
    #[serde(default)]
    pub interval_ms: Option<u64>,
    #[serde(default)]
    pub high_speed_interval_ms: Option<u64>,
}

fn default_window() -> usize {
    DEFAULT_WINDOW
}

impl StandConfig {
    pub fn load(path: &Path) -> Result<Self, StandConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| StandConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| StandConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Normal-speed and high-speed tick intervals, defaults where unset.
    pub fn cadence(&self) -> Cadence {
        let mut cadence = Cadence::default();
        if let Some(ms) = self.interval_ms {
            cadence.normal = Duration::from_millis(ms.max(1));
        }
        if let Some(ms) = self.high_speed_interval_ms {
            cadence.high_speed = Duration::from_millis(ms.max(1));
        }
        cadence
    }

    /// Validate every device and build the registry.
    pub fn build_registry(&self) -> Result<DeviceRegistry, StandConfigError> {
        if self.window == 0 {
            return Err(StandConfigError::Invalid {
                device: self.name.clone(),
                reason: "window must hold at least one sample".into(),
            });
        }
        let mut registry = DeviceRegistry::new();
        for spec in &self.devices {
            registry.insert(spec.to_device(self.window)?)?;
        }
        for name in &self.tracked_channels {
            if registry.sensor(name).is_none() {
                return Err(StandConfigError::Tracked(name.clone()));
            }
        }
        for (channel, valves) in registry.shared_valve_lines() {
            warn!(channel = %channel, valves = ?valves, "Valves share a driver line and move together");
        }
        Ok(registry)
    }

    /// Simulated hardware with every wired sensor idling at its zero point.
    /// Links from the built-in plumbing table are added when both ends are
    /// wired on this stand.
    pub fn simulated_hardware(&self, noise_volts: f64) -> SimulatedStand {
        let mut stand = SimulatedStand::new().with_noise(noise_volts);
        for spec in &self.devices {
            if let (Some(kind), Some(channel)) = (spec.sensor_kind(), &spec.channel) {
                let cal = spec.calibration.unwrap_or_else(|| kind.default_calibration());
                stand.set_voltage(channel, cal.volts_min);
            }
        }
        let wired: Vec<&str> = self.devices.iter().filter_map(|d| d.channel.as_deref()).collect();
        for link in maelstrom_links() {
            if wired.contains(&link.digital.as_str()) && wired.contains(&link.analog.as_str()) {
                stand = stand.with_link(link);
            }
        }
        stand
    }

    /// The Maelstrom stand: H2, O2, N2 and CO2 feed solenoids, two
    /// pneumatic valves sharing one driver line, and the tank transducers.
    /// Devices without a channel are not wired to the LabJack.
    pub fn maelstrom() -> Self {
        let valves = [
            ("SN-H2-01", Some("CIO1"), false),
            ("SN-O2-01", Some("EIO0"), false),
            ("SN-O2-02", Some("EIO1"), false),
            ("SN-N2-02", None, false),
            ("SN-N2-01", None, false),
            ("SN-N2-07", Some("EIO7"), true),
            ("SN-CO2-01", Some("EIO3"), false),
            ("PV-N2-01", Some("CIO2"), false),
            ("PV-FU-01", Some("CIO2"), false),
        ];
        let sensors = [
            ("PT-FU-01", DeviceKind::PressureSensor, Some("AIN0"), Some(1200.0)),
            ("PT-N2-07", DeviceKind::PressureSensor, Some("AIN1"), Some(1200.0)),
            ("PT-TI-01", DeviceKind::PressureSensor, None, None),
            ("TC-FU-01", DeviceKind::Thermocouple, Some("AIN4"), Some(600.0)),
            ("PT-N2-01", DeviceKind::PressureSensor, None, None),
            ("PT-N2-02", DeviceKind::PressureSensor, None, None),
            ("PT-N2-04", DeviceKind::PressureSensor, None, None),
            ("PT-N2-05", DeviceKind::PressureSensor, None, None),
            ("PT-N2-06", DeviceKind::PressureSensor, None, None),
            ("PT-O2-02", DeviceKind::PressureSensor, Some("AIN2"), Some(1200.0)),
            ("PT-O2-03", DeviceKind::PressureSensor, None, None),
            ("PT-N2-03", DeviceKind::PressureSensor, None, None),
            ("PT-O2-05", DeviceKind::PressureSensor, None, None),
            ("PT-O2-04", DeviceKind::PressureSensor, None, None),
            ("TC-O2-05", DeviceKind::Thermocouple, None, None),
            ("TC-O2-04", DeviceKind::Thermocouple, None, None),
            ("PT-H2-01", DeviceKind::PressureSensor, Some("AIN3"), Some(1200.0)),
            ("PT-H2-02", DeviceKind::PressureSensor, None, None),
            ("PT-H2-03", DeviceKind::PressureSensor, None, None),
            ("TC-H2-03", DeviceKind::Thermocouple, None, None),
        ];

        let mut devices: Vec<DeviceSpec> = valves
            .into_iter()
            .map(|(name, channel, normally_open)| DeviceSpec {
                name: name.to_string(),
                kind: DeviceKind::Valve,
                channel: channel.map(str::to_string),
                normally_open,
                calibration: None,
                redline: None,
            })
            .collect();
        devices.extend(sensors.into_iter().map(|(name, kind, channel, redline)| DeviceSpec {
            name: name.to_string(),
            kind,
            channel: channel.map(str::to_string),
            normally_open: false,
            calibration: None,
            redline,
        }));

        Self {
            name: "maelstrom".to_string(),
            devices,
            tracked_channels: vec![
                "PT-N2-07".to_string(),
                "PT-FU-01".to_string(),
                "PT-O2-02".to_string(),
            ],
            window: DEFAULT_WINDOW,
            interval_ms: None,
            high_speed_interval_ms: None,
        }
    }
}

/// Feed valve to downstream transducer couplings used by the simulator.
/// Resting pressures stay well under the tank redlines.
fn maelstrom_links() -> Vec<ChannelLink> {
    let link = |digital: &str, analog: &str, energized_volts: f64, idle_volts: f64| ChannelLink {
        digital: digital.to_string(),
        analog: analog.to_string(),
        energized_volts,
        idle_volts,
        response: 0.3,
    };
    vec![
        // PV-FU-01 / PV-N2-01 driver pressurises the fuel line
        link("CIO2", "AIN0", 2.3, 0.5),
        // SN-N2-07 is normally open: energizing it isolates the N2 line
        link("EIO7", "AIN1", 0.5, 2.1),
        link("EIO0", "AIN2", 2.5, 0.5),
        link("CIO1", "AIN3", 2.0, 0.5),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use stand_core::HardwareProvider;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn maelstrom_builds() {
        let stand = StandConfig::maelstrom();
        let registry = stand.build_registry().unwrap();
        assert_eq!(registry.len(), 29);
        assert!(registry.valve("SN-N2-07").unwrap().normally_open());
        assert!(registry.valve("SN-N2-01").unwrap().channel().is_none());
        assert_eq!(registry.sensor("PT-O2-02").unwrap().redline(), Some(1200.0));
        assert!(registry.sensor("PT-TI-01").unwrap().channel().is_none());
        assert_eq!(
            registry.shared_valve_lines(),
            vec![(
                "CIO2".to_string(),
                vec!["PV-N2-01".to_string(), "PV-FU-01".to_string()]
            )]
        );
    }

    #[test]
    fn simulated_maelstrom_idles_at_zero() {
        let stand = StandConfig::maelstrom();
        let mut hw = stand.simulated_hardware(0.0);
        hw.connect().unwrap();
        // fuel line idles at the transducer zero
        assert_eq!(hw.read_analog("AIN0").unwrap(), 0.5);
        // N2 line is open with its solenoid de-energized
        let n2 = hw.read_analog("AIN1").unwrap();
        assert!(n2 > 0.5 && n2 < 2.1);
    }

    #[test]
    fn loads_json_with_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "name": "bench",
                "devices": [
                    {{"name": "PT-1", "kind": "pressure_sensor", "channel": "AIN0", "redline": 800.0}},
                    {{"name": "V-1", "kind": "valve", "channel": "EIO0", "normally_open": true}}
                ],
                "tracked_channels": ["PT-1"],
                "interval_ms": 250
            }}"#
        )
        .unwrap();
        let stand = StandConfig::load(file.path()).unwrap();
        assert_eq!(stand.window, DEFAULT_WINDOW);
        assert_eq!(stand.cadence().normal, Duration::from_millis(250));
        assert_eq!(stand.cadence().high_speed, Duration::from_millis(100));
        let registry = stand.build_registry().unwrap();
        assert_eq!(
            registry.sensor("PT-1").unwrap().calibration(),
            &SensorKind::Pressure.default_calibration()
        );
    }

    #[test]
    fn rejects_bad_definitions() {
        let mut stand = StandConfig::maelstrom();
        stand.tracked_channels.push("SN-O2-01".into());
        assert!(matches!(
            stand.build_registry(),
            Err(StandConfigError::Tracked(name)) if name == "SN-O2-01"
        ));

        let mut stand = StandConfig::maelstrom();
        stand.devices.push(stand.devices[0].clone());
        assert!(matches!(
            stand.build_registry(),
            Err(StandConfigError::Registry(RegistryError::DuplicateName(_)))
        ));

        let mut stand = StandConfig::maelstrom();
        stand.devices[0].redline = Some(100.0);
        assert!(matches!(
            stand.build_registry(),
            Err(StandConfigError::Invalid { .. })
        ));

        let mut stand = StandConfig::maelstrom();
        stand.window = 0;
        assert!(stand.build_registry().is_err());
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = StandConfig::load(Path::new("/nonexistent/stand.json")).unwrap_err();
        assert!(matches!(err, StandConfigError::Io { .. }));
    }
}

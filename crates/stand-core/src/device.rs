use crate::hal::{HardwareProvider, ProviderError};
use crate::window::RollingWindow;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeviceError {
    #[error("{device}: no hardware channel")]
    NoChannel { device: String },
    #[error("{device}: {source}")]
    Provider {
        device: String,
        #[source]
        source: ProviderError,
    },
    #[error("{device}: non-finite reading {raw}")]
    NonFinite { device: String, raw: f64 },
}

impl DeviceError {
    pub fn device(&self) -> &str {
        match self {
            Self::NoChannel { device }
            | Self::Provider { device, .. }
            | Self::NonFinite { device, .. } => device,
        }
    }
}

/// Linear voltage-to-engineering-unit map.
///
/// The raw reading is clamped to `±input_range` volts, then mapped so that
/// `volts_min` reads `units_min` and `volts_max` reads `units_max`, plus
/// `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub volts_min: f64,
    pub volts_max: f64,
    pub units_min: f64,
    pub units_max: f64,
    #[serde(default)]
    pub offset: f64,
    pub input_range: f64,
}

impl Calibration {
    pub fn convert(&self, raw_volts: f64) -> f64 {
        let volts = raw_volts.clamp(-self.input_range, self.input_range);
        let scale = (self.units_max - self.units_min) / (self.volts_max - self.volts_min);
        self.units_min + (volts - self.volts_min) * scale + self.offset
    }

    pub fn is_valid(&self) -> bool {
        let fields = [
            self.volts_min,
            self.volts_max,
            self.units_min,
            self.units_max,
            self.offset,
            self.input_range,
        ];
        fields.iter().all(|f| f.is_finite())
            && self.volts_max != self.volts_min
            && self.input_range > 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Pressure,
    Thermocouple,
    LoadCell,
}

impl SensorKind {
    pub fn unit(&self) -> &'static str {
        match self {
            Self::Pressure => "psi",
            Self::Thermocouple => "degC",
            Self::LoadCell => "lbf",
        }
    }

    /// Calibration of the stock transducer for this kind.
    pub fn default_calibration(&self) -> Calibration {
        match self {
            // 0.5-4.5 V ratiometric, 1500 psi full scale
            Self::Pressure => Calibration {
                volts_min: 0.5,
                volts_max: 4.5,
                units_min: 0.0,
                units_max: 1500.0,
                offset: 0.0,
                input_range: 10.0,
            },
            // amplified type-K, 5 mV/degC
            Self::Thermocouple => Calibration {
                volts_min: 0.0,
                volts_max: 5.0,
                units_min: 0.0,
                units_max: 1000.0,
                offset: 0.0,
                input_range: 10.0,
            },
            Self::LoadCell => Calibration {
                volts_min: 0.0,
                volts_max: 5.0,
                units_min: 0.0,
                units_max: 1000.0,
                offset: 0.0,
                input_range: 10.0,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Valve,
    PressureSensor,
    Thermocouple,
    LoadCell,
}

impl From<SensorKind> for DeviceKind {
    fn from(kind: SensorKind) -> Self {
        match kind {
            SensorKind::Pressure => Self::PressureSensor,
            SensorKind::Thermocouple => Self::Thermocouple,
            SensorKind::LoadCell => Self::LoadCell,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Sensor {
    name: String,
    kind: SensorKind,
    channel: Option<String>,
    calibration: Calibration,
    redline: Option<f64>,
    window: RollingWindow,
    last_value: Option<f64>,
}

impl Sensor {
    pub fn new(name: impl Into<String>, kind: SensorKind, channel: Option<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            channel: channel.filter(|c| !c.is_empty()),
            calibration: kind.default_calibration(),
            redline: None,
            window: RollingWindow::new(5),
            last_value: None,
        }
    }

    pub fn with_calibration(mut self, calibration: Calibration) -> Self {
        self.calibration = calibration;
        self
    }

    pub fn with_redline(mut self, redline: Option<f64>) -> Self {
        self.redline = redline;
        self
    }

    pub fn with_window(mut self, capacity: usize) -> Self {
        self.window = RollingWindow::new(capacity);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> SensorKind {
        self.kind
    }

    pub fn channel(&self) -> Option<&str> {
        self.channel.as_deref()
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    pub fn redline(&self) -> Option<f64> {
        self.redline
    }

    pub fn window(&self) -> &RollingWindow {
        &self.window
    }

    pub fn last_value(&self) -> Option<f64> {
        self.last_value
    }

    /// Read, convert and record one sample.
    pub fn read(&mut self, io: &mut dyn HardwareProvider) -> Result<f64, DeviceError> {
        let channel = self.channel.as_deref().ok_or_else(|| DeviceError::NoChannel {
            device: self.name.clone(),
        })?;
        let raw = io
            .read_analog(channel)
            .map_err(|source| DeviceError::Provider {
                device: self.name.clone(),
                source,
            })?;
        if !raw.is_finite() {
            return Err(DeviceError::NonFinite {
                device: self.name.clone(),
                raw,
            });
        }
        let value = self.calibration.convert(raw);
        self.record(value);
        Ok(value)
    }

    /// Push an already-converted value, as `read` does on success.
    pub fn record(&mut self, value: f64) {
        self.window.push(value);
        self.last_value = Some(value);
    }
}

#[derive(Debug, Clone)]
pub struct Valve {
    name: String,
    channel: Option<String>,
    normally_open: bool,
    commanded_open: bool,
}

impl Valve {
    /// Starts in its de-energized position.
    pub fn new(name: impl Into<String>, channel: Option<String>, normally_open: bool) -> Self {
        Self {
            name: name.into(),
            channel: channel.filter(|c| !c.is_empty()),
            normally_open,
            commanded_open: normally_open,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channel(&self) -> Option<&str> {
        self.channel.as_deref()
    }

    pub fn normally_open(&self) -> bool {
        self.normally_open
    }

    pub fn commanded_open(&self) -> bool {
        self.commanded_open
    }

    /// Physical position with the coil unpowered.
    pub fn safe_state(&self) -> bool {
        self.normally_open
    }

    /// Coil level that yields the requested position.
    pub fn energize_bit(&self, open: bool) -> bool {
        open != self.normally_open
    }

    /// Coil level behind the current commanded position.
    pub fn energized(&self) -> bool {
        self.energize_bit(self.commanded_open)
    }

    /// Adopt a coil level written through another valve on the same line.
    pub fn follow_line(&mut self, energized: bool) {
        self.commanded_open = energized != self.normally_open;
    }

    pub fn command(&mut self, io: &mut dyn HardwareProvider, open: bool) -> Result<(), DeviceError> {
        match self.channel.as_deref() {
            Some(channel) => {
                io.write_digital(channel, self.energize_bit(open))
                    .map_err(|source| DeviceError::Provider {
                        device: self.name.clone(),
                        source,
                    })?;
            }
            None => log::debug!("{} has no channel; state change is logical only", self.name),
        }
        self.commanded_open = open;
        Ok(())
    }

    /// De-energize regardless of the current commanded state.
    pub fn force_safe(&mut self, io: &mut dyn HardwareProvider) -> Result<(), DeviceError> {
        self.command(io, self.safe_state())
    }
}

#[derive(Debug, Clone)]
pub enum Device {
    Valve(Valve),
    Sensor(Sensor),
}

impl Device {
    pub fn name(&self) -> &str {
        match self {
            Self::Valve(v) => v.name(),
            Self::Sensor(s) => s.name(),
        }
    }

    pub fn kind(&self) -> DeviceKind {
        match self {
            Self::Valve(_) => DeviceKind::Valve,
            Self::Sensor(s) => s.kind().into(),
        }
    }

    pub fn channel(&self) -> Option<&str> {
        match self {
            Self::Valve(v) => v.channel(),
            Self::Sensor(s) => s.channel(),
        }
    }

    pub fn as_sensor(&self) -> Option<&Sensor> {
        match self {
            Self::Sensor(s) => Some(s),
            Self::Valve(_) => None,
        }
    }

    pub fn as_sensor_mut(&mut self) -> Option<&mut Sensor> {
        match self {
            Self::Sensor(s) => Some(s),
            Self::Valve(_) => None,
        }
    }

    pub fn as_valve(&self) -> Option<&Valve> {
        match self {
            Self::Valve(v) => Some(v),
            Self::Sensor(_) => None,
        }
    }

    pub fn as_valve_mut(&mut self) -> Option<&mut Valve> {
        match self {
            Self::Valve(v) => Some(v),
            Self::Sensor(_) => None,
        }
    }
}

impl From<Valve> for Device {
    fn from(valve: Valve) -> Self {
        Self::Valve(valve)
    }
}

impl From<Sensor> for Device {
    fn from(sensor: Sensor) -> Self {
        Self::Sensor(sensor)
    }
}

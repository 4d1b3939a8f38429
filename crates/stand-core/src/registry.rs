use crate::device::{Device, Sensor, Valve};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("duplicate device name: {0}")]
    DuplicateName(String),
    #[error("unknown device: {0}")]
    UnknownDevice(String),
    #[error("{0} is not a valve")]
    NotAValve(String),
}

/// Single owner of every device on the stand, indexed by name.
///
/// Iteration follows insertion order.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Vec<Device>,
    index: HashMap<String, usize>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_devices<I>(devices: I) -> Result<Self, RegistryError>
    where
        I: IntoIterator,
        I::Item: Into<Device>,
    {
        let mut registry = Self::new();
        for device in devices {
            registry.insert(device)?;
        }
        Ok(registry)
    }

    pub fn insert(&mut self, device: impl Into<Device>) -> Result<(), RegistryError> {
        let device = device.into();
        let name = device.name().to_string();
        if self.index.contains_key(&name) {
            return Err(RegistryError::DuplicateName(name));
        }
        self.index.insert(name, self.devices.len());
        self.devices.push(device);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Device> {
        self.index.get(name).map(|&i| &self.devices[i])
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Device> {
        match self.index.get(name) {
            Some(&i) => Some(&mut self.devices[i]),
            None => None,
        }
    }

    /// Positional access in insertion order.
    pub fn at_mut(&mut self, index: usize) -> Option<&mut Device> {
        self.devices.get_mut(index)
    }

    pub fn sensor(&self, name: &str) -> Option<&Sensor> {
        self.get(name).and_then(Device::as_sensor)
    }

    pub fn valve(&self, name: &str) -> Option<&Valve> {
        self.get(name).and_then(Device::as_valve)
    }

    pub fn valve_mut(&mut self, name: &str) -> Result<&mut Valve, RegistryError> {
        self.get_mut(name)
            .ok_or_else(|| RegistryError::UnknownDevice(name.to_string()))?
            .as_valve_mut()
            .ok_or_else(|| RegistryError::NotAValve(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Device> {
        self.devices.iter_mut()
    }

    pub fn sensors(&self) -> impl Iterator<Item = &Sensor> {
        self.devices.iter().filter_map(Device::as_sensor)
    }

    pub fn valves(&self) -> impl Iterator<Item = &Valve> {
        self.devices.iter().filter_map(Device::as_valve)
    }

    /// Copy `name`'s coil level onto every other valve wired to the same
    /// driver line, so their logged positions follow the hardware. Returns
    /// the valves that moved.
    pub fn mirror_shared_line(&mut self, name: &str) -> Vec<String> {
        let Some((channel, energized)) = self
            .valve(name)
            .and_then(|v| Some((v.channel()?.to_string(), v.energized())))
        else {
            return Vec::new();
        };
        let mut moved = Vec::new();
        for valve in self.valves_mut() {
            if valve.name() != name
                && valve.channel() == Some(channel.as_str())
                && valve.energized() != energized
            {
                valve.follow_line(energized);
                log::info!("{} follows shared line {channel} from {name}", valve.name());
                moved.push(valve.name().to_string());
            }
        }
        moved
    }

    /// Channels driving more than one valve, with the valves on each.
    pub fn shared_valve_lines(&self) -> Vec<(String, Vec<String>)> {
        let mut lines: Vec<(String, Vec<String>)> = Vec::new();
        for valve in self.valves() {
            let Some(channel) = valve.channel() else {
                continue;
            };
            match lines.iter_mut().find(|(c, _)| c == channel) {
                Some((_, names)) => names.push(valve.name().to_string()),
                None => lines.push((channel.to_string(), vec![valve.name().to_string()])),
            }
        }
        lines.retain(|(_, names)| names.len() > 1);
        lines
    }

    pub fn valves_mut(&mut self) -> impl Iterator<Item = &mut Valve> {
        self.devices.iter_mut().filter_map(Device::as_valve_mut)
    }
}

use crate::hal::{HardwareProvider, ProviderError};
use std::collections::{HashMap, HashSet};

/// Couples a digital output to an analog input: while the output is
/// energized the input slews toward `energized_volts`, otherwise toward
/// `idle_volts`.
#[derive(Debug, Clone)]
pub struct ChannelLink {
    pub digital: String,
    pub analog: String,
    pub energized_volts: f64,
    pub idle_volts: f64,
    /// Fraction of the remaining distance covered per read, in `0.0..=1.0`.
    pub response: f64,
}

/// In-memory stand for bench runs and tests.
#[derive(Debug, Clone)]
pub struct SimulatedStand {
    connected: bool,
    refuse_connect: bool,
    analog: HashMap<String, f64>,
    failing: HashSet<String>,
    digital: HashMap<String, bool>,
    writes: Vec<(String, bool)>,
    links: Vec<ChannelLink>,
    noise_volts: f64,
    rng_state: u64,
}

impl SimulatedStand {
    pub fn new() -> Self {
        Self {
            connected: false,
            refuse_connect: false,
            analog: HashMap::new(),
            failing: HashSet::new(),
            digital: HashMap::new(),
            writes: Vec::new(),
            links: Vec::new(),
            noise_volts: 0.0,
            rng_state: 0x2545_f491_4f6c_dd1d,
        }
    }

    /// Already connected, for harnesses that skip the connect step.
    pub fn connected() -> Self {
        let mut stand = Self::new();
        stand.connected = true;
        stand
    }

    pub fn with_noise(mut self, volts: f64) -> Self {
        self.noise_volts = volts.abs();
        self
    }

    pub fn with_link(mut self, link: ChannelLink) -> Self {
        self.analog.entry(link.analog.clone()).or_insert(link.idle_volts);
        self.links.push(link);
        self
    }

    pub fn set_voltage(&mut self, channel: &str, volts: f64) {
        self.analog.insert(channel.to_string(), volts);
    }

    pub fn fail_channel(&mut self, channel: &str) {
        self.failing.insert(channel.to_string());
    }

    pub fn heal_channel(&mut self, channel: &str) {
        self.failing.remove(channel);
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    pub fn refuse_connect(&mut self, refuse: bool) {
        self.refuse_connect = refuse;
    }

    /// Current level of a digital output, if it was ever written.
    pub fn digital_state(&self, channel: &str) -> Option<bool> {
        self.digital.get(channel).copied()
    }

    /// Every successful digital write, oldest first.
    pub fn writes(&self) -> &[(String, bool)] {
        &self.writes
    }

    fn next_noise(&mut self) -> f64 {
        if self.noise_volts == 0.0 {
            return 0.0;
        }
        // xorshift64
        let mut x = self.rng_state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng_state = x;
        let unit = (x >> 11) as f64 / (1u64 << 53) as f64;
        (unit * 2.0 - 1.0) * self.noise_volts
    }

    fn apply_links(&mut self, channel: &str) {
        for link in self.links.iter().filter(|l| l.analog == channel) {
            let energized = self.digital.get(&link.digital).copied().unwrap_or(false);
            let target = if energized {
                link.energized_volts
            } else {
                link.idle_volts
            };
            if let Some(volts) = self.analog.get_mut(channel) {
                *volts += (target - *volts) * link.response.clamp(0.0, 1.0);
            }
        }
    }
}

impl Default for SimulatedStand {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareProvider for SimulatedStand {
    fn connect(&mut self) -> Result<(), ProviderError> {
        if self.refuse_connect {
            return Err(ProviderError::Connect("simulated refusal".to_string()));
        }
        self.connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn read_analog(&mut self, channel: &str) -> Result<f64, ProviderError> {
        if !self.connected {
            return Err(ProviderError::NotConnected);
        }
        if self.failing.contains(channel) {
            return Err(ProviderError::Io {
                channel: channel.to_string(),
                message: "simulated fault".to_string(),
            });
        }
        self.apply_links(channel);
        let volts = *self
            .analog
            .get(channel)
            .ok_or_else(|| ProviderError::UnknownChannel(channel.to_string()))?;
        Ok(volts + self.next_noise())
    }

    fn write_digital(&mut self, channel: &str, bit: bool) -> Result<(), ProviderError> {
        if !self.connected {
            return Err(ProviderError::NotConnected);
        }
        if self.failing.contains(channel) {
            return Err(ProviderError::Io {
                channel: channel.to_string(),
                message: "simulated fault".to_string(),
            });
        }
        self.digital.insert(channel.to_string(), bit);
        self.writes.push((channel.to_string(), bit));
        Ok(())
    }

    fn close(&mut self) {
        self.connected = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_require_connection() {
        let mut stand = SimulatedStand::new();
        stand.set_voltage("AIN0", 1.5);
        assert_eq!(stand.read_analog("AIN0"), Err(ProviderError::NotConnected));
        stand.connect().unwrap();
        assert_eq!(stand.read_analog("AIN0"), Ok(1.5));
    }

    #[test]
    fn failing_channel_is_isolated() {
        let mut stand = SimulatedStand::connected();
        stand.set_voltage("AIN0", 1.0);
        stand.set_voltage("AIN1", 2.0);
        stand.fail_channel("AIN0");
        assert!(matches!(stand.read_analog("AIN0"), Err(ProviderError::Io { .. })));
        assert_eq!(stand.read_analog("AIN1"), Ok(2.0));
    }

    #[test]
    fn link_slews_toward_energized_level() {
        let mut stand = SimulatedStand::connected().with_link(ChannelLink {
            digital: "EIO0".to_string(),
            analog: "AIN0".to_string(),
            energized_volts: 4.0,
            idle_volts: 0.5,
            response: 0.5,
        });
        stand.write_digital("EIO0", true).unwrap();
        let first = stand.read_analog("AIN0").unwrap();
        let second = stand.read_analog("AIN0").unwrap();
        assert!((first - 2.25).abs() < 1e-9);
        assert!(second > first && second < 4.0);
    }

    #[test]
    fn noise_stays_within_amplitude() {
        let mut stand = SimulatedStand::connected().with_noise(0.01);
        stand.set_voltage("AIN0", 1.0);
        for _ in 0..100 {
            let v = stand.read_analog("AIN0").unwrap();
            assert!((v - 1.0).abs() <= 0.01);
        }
    }
}

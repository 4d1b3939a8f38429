use crate::device::Sensor;
use crate::shutdown::{ShutdownController, ShutdownReason, ShutdownReport, ShutdownTargets};
use std::fmt;

/// A sensor whose rolling-window median is above its redline.
#[derive(Debug, Clone, PartialEq)]
pub struct RedlineBreach {
    pub device: String,
    pub median: f64,
    pub redline: f64,
    pub window: Vec<f64>,
}

impl fmt::Display for RedlineBreach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} median {:.2} exceeds redline {:.2}",
            self.device, self.median, self.redline
        )
    }
}

#[derive(Debug, Clone)]
pub enum Verdict {
    /// No redline configured, no samples yet, or not a sensor.
    Unmonitored,
    Nominal { median: f64 },
    /// First breach of an episode; the shutdown pass has already run.
    Tripped {
        breach: RedlineBreach,
        report: ShutdownReport,
    },
    /// Breach inside a latched episode; the valve pass ran again.
    Reasserted {
        breach: RedlineBreach,
        report: ShutdownReport,
    },
    /// Breach observed while another shutdown pass was executing.
    Suppressed(RedlineBreach),
}

#[derive(Debug, Clone, Default)]
pub struct SafetyStats {
    pub evaluations: u64,
    pub breaches: u64,
    pub trips: u64,
    pub reasserted: u64,
    pub suppressed: u64,
}

/// Redline watch over every sensor's rolling window.
///
/// Decisions use the window median, never the last sample, so one noisy
/// reading cannot trip the stand on its own. Any trip is global, and every
/// later breach in the same episode re-safes the valves.
#[derive(Debug, Default)]
pub struct SafetyMonitor {
    stats: SafetyStats,
}

impl SafetyMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &SafetyStats {
        &self.stats
    }

    /// Pure redline test for one sensor.
    pub fn check(sensor: &Sensor) -> Option<RedlineBreach> {
        let redline = sensor.redline()?;
        let median = sensor.window().median()?;
        if median > redline {
            Some(RedlineBreach {
                device: sensor.name().to_string(),
                median,
                redline,
                window: sensor.window().to_vec(),
            })
        } else {
            None
        }
    }

    /// Evaluate `device` and run the shutdown pass on any breach.
    pub fn evaluate(
        &mut self,
        device: &str,
        shutdown: &ShutdownController,
        targets: ShutdownTargets<'_>,
    ) -> Verdict {
        let Some(sensor) = targets.registry.sensor(device) else {
            return Verdict::Unmonitored;
        };
        if sensor.redline().is_none() || sensor.window().is_empty() {
            return Verdict::Unmonitored;
        }
        self.stats.evaluations += 1;

        let breach = match Self::check(sensor) {
            Some(breach) => breach,
            None => {
                return Verdict::Nominal {
                    median: sensor.window().median().unwrap_or_default(),
                }
            }
        };
        self.stats.breaches += 1;

        if shutdown.is_executing() {
            self.stats.suppressed += 1;
            log::debug!("{breach} (shutdown pass in progress)");
            return Verdict::Suppressed(breach);
        }

        let reason = ShutdownReason::Redline {
            device: breach.device.clone(),
        };
        if shutdown.is_latched() {
            log::warn!("{breach} while latched; re-safing valves");
            self.stats.reasserted += 1;
            let report = shutdown.execute(reason, targets);
            return Verdict::Reasserted { breach, report };
        }

        log::error!("REDLINE: {breach}; window {:?}; initiating shutdown", breach.window);
        self.stats.trips += 1;
        let report = shutdown.execute(reason, targets);
        Verdict::Tripped { breach, report }
    }
}

use crate::datalog::DataLogger;
use crate::device::DeviceError;
use crate::hal::HardwareProvider;
use crate::registry::DeviceRegistry;
use crate::sequencer::{Sequencer, StopReason};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ShutdownReason {
    Redline { device: String },
    Operator,
    Teardown,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Redline { device } => write!(f, "redline on {device}"),
            Self::Operator => f.write_str("operator command"),
            Self::Teardown => f.write_str("process teardown"),
        }
    }
}

/// Everything a shutdown pass needs mutable access to.
pub struct ShutdownTargets<'a> {
    pub registry: &'a mut DeviceRegistry,
    pub io: &'a mut dyn HardwareProvider,
    pub sequencer: &'a mut Sequencer,
    pub logger: &'a mut DataLogger,
}

#[derive(Debug, Clone)]
pub struct ShutdownReport {
    pub reason: ShutdownReason,
    pub episode: u64,
    /// False when this pass re-ran inside an already latched episode.
    pub first_in_episode: bool,
    /// Another pass was executing; nothing was attempted.
    pub skipped: bool,
    pub sequence_aborted: bool,
    pub safed: Vec<String>,
    pub faults: Vec<DeviceError>,
}

impl ShutdownReport {
    /// At least one valve could not be driven to its safe state.
    pub fn requires_intervention(&self) -> bool {
        !self.faults.is_empty()
    }
}

/// Drives every valve to its de-energized position.
///
/// Redline trips, the operator and process teardown all land here. The
/// first pass latches the episode; later passes re-attempt the same
/// commands. A pass that starts while another is executing returns
/// immediately with `skipped` set.
#[derive(Debug, Default)]
pub struct ShutdownController {
    executing: AtomicBool,
    latched: AtomicBool,
    episodes: AtomicU64,
    passes: AtomicU64,
}

struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ShutdownController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_latched(&self) -> bool {
        self.latched.load(Ordering::Acquire)
    }

    pub fn is_executing(&self) -> bool {
        self.executing.load(Ordering::Acquire)
    }

    pub fn episodes(&self) -> u64 {
        self.episodes.load(Ordering::Relaxed)
    }

    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    /// Clear the episode latch. Returns whether it was set.
    pub fn rearm(&self) -> bool {
        let was = self.latched.swap(false, Ordering::AcqRel);
        if was {
            log::info!("shutdown latch cleared by operator");
        }
        was
    }

    pub fn execute(&self, reason: ShutdownReason, targets: ShutdownTargets<'_>) -> ShutdownReport {
        if self.executing.swap(true, Ordering::AcqRel) {
            log::warn!("shutdown ({reason}) requested while a pass is executing; skipped");
            return ShutdownReport {
                reason,
                episode: self.episodes(),
                first_in_episode: false,
                skipped: true,
                sequence_aborted: false,
                safed: Vec::new(),
                faults: Vec::new(),
            };
        }
        let _guard = PassGuard(&self.executing);

        let first_in_episode = !self.latched.swap(true, Ordering::AcqRel);
        let episode = if first_in_episode {
            self.episodes.fetch_add(1, Ordering::Relaxed) + 1
        } else {
            self.episodes()
        };
        if first_in_episode {
            log::error!("SHUTDOWN ({reason}): safing all valves");
        } else {
            log::warn!("SHUTDOWN ({reason}): re-running valve pass for episode {episode}");
        }

        let ShutdownTargets {
            registry,
            io,
            sequencer,
            logger,
        } = targets;

        let sequence_aborted = sequencer.is_running();
        if sequence_aborted {
            sequencer.stop(logger, StopReason::Shutdown);
        }

        let mut safed = Vec::new();
        let mut faults = Vec::new();
        for valve in registry.valves_mut() {
            match valve.force_safe(io) {
                Ok(()) => {
                    log::info!(
                        "{} safed ({})",
                        valve.name(),
                        if valve.commanded_open() { "open" } else { "closed" }
                    );
                    safed.push(valve.name().to_string());
                }
                Err(e) => {
                    log::error!("{e}: valve not safed, manual intervention required");
                    faults.push(e);
                }
            }
        }

        for name in &safed {
            registry.mirror_shared_line(name);
        }

        self.passes.fetch_add(1, Ordering::Relaxed);
        ShutdownReport {
            reason,
            episode,
            first_in_episode,
            skipped: false,
            sequence_aborted,
            safed,
            faults,
        }
    }
}

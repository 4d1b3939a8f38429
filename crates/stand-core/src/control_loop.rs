use crate::command::OperatorCommand;
use crate::datalog::{Cadence, DataLogger, SamplingMode, TelemetryRecord, TelemetrySink};
use crate::device::{Device, DeviceError};
use crate::hal::{HardwareProvider, ProviderError};
use crate::registry::{DeviceRegistry, RegistryError};
use crate::safety::{RedlineBreach, SafetyMonitor, Verdict};
use crate::sequence::{SequenceError, SequenceSource};
use crate::sequencer::{RunSummary, Sequencer, StepError, StepOutcome, StopReason};
use crate::shutdown::{ShutdownController, ShutdownReason, ShutdownReport, ShutdownTargets};
use crate::sync::{StandSnapshot, StateExchange};
use crate::timebase::TimeBase;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone, Debug, Default)]
pub struct LoopConfig {
    pub cadence: Cadence,
    /// Sensors whose values are captured into trace buffers during a run.
    pub tracked_channels: Vec<String>,
}

#[derive(Clone, Default, Debug)]
pub struct LoopStats {
    pub ticks: u64,
    pub disconnected_ticks: u64,
    pub samples: u64,
    pub read_faults: u64,
    pub log_failures: u64,
    pub overruns: u64,
    pub last_tick_us: u64,
    pub max_tick_us: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickStatus {
    Completed,
    /// Provider not connected; nothing was read or commanded.
    Disconnected,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub device: String,
    pub value: f64,
    pub unit: &'static str,
}

/// Everything an operator or audit trail may need to see.
#[derive(Debug, Clone)]
pub enum StandEvent {
    ConnectionLost,
    ConnectionRestored,
    ReconnectFailed(ProviderError),
    ReadFault(DeviceError),
    RedlineBreach(RedlineBreach),
    Shutdown(ShutdownReport),
    SequenceStarted { run: u64, steps: usize, source: String },
    SequenceRejected(SequenceError),
    StepDispatched(StepOutcome),
    SequenceStopped(RunSummary),
    ModeChanged(SamplingMode),
    ValveCommanded {
        valve: String,
        open: bool,
        result: Result<(), StepError>,
    },
    Rearmed { was_latched: bool },
    LogWriteFailed(String),
}

#[derive(Debug, Clone)]
pub struct TickReport {
    pub tick: u64,
    pub status: TickStatus,
    pub samples: Vec<Sample>,
    pub events: Vec<StandEvent>,
    pub duration: Duration,
}

/// The periodic driver: one `tick` reads every sensor, runs the redline
/// check, advances the sequencer and logs the result.
///
/// `tick_at` takes the monotonic time explicitly so harnesses can drive the
/// loop without a wall clock; `run` drives it from a real timer.
pub struct TelemetryLoop<P: HardwareProvider> {
    io: P,
    registry: DeviceRegistry,
    monitor: SafetyMonitor,
    shutdown: ShutdownController,
    sequencer: Sequencer,
    logger: DataLogger,
    source: Option<Box<dyn SequenceSource>>,
    exchange: Option<Arc<StateExchange>>,
    timebase: TimeBase,
    stats: LoopStats,
    tick: u64,
    was_connected: bool,
    closing: bool,
}

impl<P: HardwareProvider> TelemetryLoop<P> {
    pub fn new(
        io: P,
        registry: DeviceRegistry,
        config: LoopConfig,
        sink: Option<Box<dyn TelemetrySink>>,
    ) -> Result<Self, RegistryError> {
        for name in &config.tracked_channels {
            if registry.sensor(name).is_none() {
                return Err(RegistryError::UnknownDevice(name.clone()));
            }
        }
        let logger = match sink {
            Some(sink) => DataLogger::new(config.cadence, sink),
            None => DataLogger::without_sink(config.cadence),
        };
        let was_connected = io.is_connected();
        Ok(Self {
            io,
            registry,
            monitor: SafetyMonitor::new(),
            shutdown: ShutdownController::new(),
            sequencer: Sequencer::new(config.tracked_channels),
            logger,
            source: None,
            exchange: None,
            timebase: TimeBase::new(),
            stats: LoopStats::default(),
            tick: 0,
            was_connected,
            closing: false,
        })
    }

    pub fn with_sequence_source(mut self, source: Box<dyn SequenceSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_exchange(mut self, exchange: Arc<StateExchange>) -> Self {
        self.exchange = Some(exchange);
        self
    }

    pub fn with_timebase(mut self, timebase: TimeBase) -> Self {
        self.timebase = timebase;
        self
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    pub fn logger(&self) -> &DataLogger {
        &self.logger
    }

    pub fn shutdown_controller(&self) -> &ShutdownController {
        &self.shutdown
    }

    pub fn monitor(&self) -> &SafetyMonitor {
        &self.monitor
    }

    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    pub fn io(&self) -> &P {
        &self.io
    }

    pub fn io_mut(&mut self) -> &mut P {
        &mut self.io
    }

    pub fn is_connected(&self) -> bool {
        self.io.is_connected()
    }

    pub fn now(&self) -> Duration {
        self.timebase.elapsed()
    }

    /// Returns whether this call restored a connection the loop had seen
    /// as missing.
    pub fn connect(&mut self) -> Result<bool, ProviderError> {
        self.io.connect()?;
        log::info!("hardware connected");
        let restored = !self.was_connected;
        self.was_connected = true;
        Ok(restored)
    }

    pub fn tick(&mut self) -> TickReport {
        let now = self.timebase.elapsed();
        self.tick_at(now)
    }

    pub fn tick_at(&mut self, now: Duration) -> TickReport {
        let started = Instant::now();
        self.tick += 1;
        self.stats.ticks += 1;
        let mut events = Vec::new();
        let mut samples = Vec::new();

        if !self.io.is_connected() {
            if self.was_connected {
                log::error!("hardware connection lost; skipping ticks until reconnected");
                events.push(StandEvent::ConnectionLost);
            }
            self.was_connected = false;
            self.stats.disconnected_ticks += 1;
            return self.finish(now, started, TickStatus::Disconnected, samples, events);
        }
        if !self.was_connected {
            log::info!("hardware connection restored");
            events.push(StandEvent::ConnectionRestored);
            self.was_connected = true;
        }

        for idx in 0..self.registry.len() {
            let Some(sensor) = self.registry.at_mut(idx).and_then(Device::as_sensor_mut) else {
                continue;
            };
            if sensor.channel().is_none() {
                continue;
            }
            let value = match sensor.read(&mut self.io) {
                Ok(value) => value,
                Err(e) => {
                    log::warn!("read fault: {e}");
                    self.stats.read_faults += 1;
                    events.push(StandEvent::ReadFault(e));
                    continue;
                }
            };
            let name = sensor.name().to_string();
            let unit = sensor.kind().unit();

            self.sequencer.record_trace(&name, value);
            let verdict = self.monitor.evaluate(
                &name,
                &self.shutdown,
                ShutdownTargets {
                    registry: &mut self.registry,
                    io: &mut self.io,
                    sequencer: &mut self.sequencer,
                    logger: &mut self.logger,
                },
            );
            match verdict {
                Verdict::Tripped { breach, report } => {
                    events.push(StandEvent::RedlineBreach(breach));
                    if report.sequence_aborted {
                        events.push(StandEvent::ModeChanged(self.logger.mode()));
                    }
                    events.push(StandEvent::Shutdown(report));
                }
                Verdict::Reasserted { report, .. } => events.push(StandEvent::Shutdown(report)),
                Verdict::Unmonitored | Verdict::Nominal { .. } | Verdict::Suppressed(_) => {}
            }
            samples.push(Sample {
                device: name,
                value,
                unit,
            });
        }
        self.stats.samples += samples.len() as u64;

        if self.sequencer.is_running() {
            let step = self.sequencer.tick(
                now,
                &mut self.registry,
                &mut self.io,
                &mut self.logger,
            );
            events.extend(step.dispatched.into_iter().map(StandEvent::StepDispatched));
            if let Some(summary) = step.completed {
                events.push(StandEvent::SequenceStopped(summary));
                events.push(StandEvent::ModeChanged(self.logger.mode()));
            }
        }

        let records = self.records(now, &samples);
        if let Err(e) = self.logger.log(&records) {
            self.stats.log_failures += 1;
            events.push(StandEvent::LogWriteFailed(e.to_string()));
        }

        self.finish(now, started, TickStatus::Completed, samples, events)
    }

    fn records(&self, now: Duration, samples: &[Sample]) -> Vec<TelemetryRecord> {
        let timestamp_us = now.as_micros() as u64;
        let unix_us = self.timebase.unix_us();
        let sensors = samples.iter().map(|s| TelemetryRecord {
            timestamp_us,
            unix_us,
            tick: self.tick,
            device: s.device.clone(),
            value: s.value,
            unit: s.unit.to_string(),
        });
        let valves = self.registry.valves().map(|v| TelemetryRecord {
            timestamp_us,
            unix_us,
            tick: self.tick,
            device: v.name().to_string(),
            value: if v.commanded_open() { 1.0 } else { 0.0 },
            unit: "open".to_string(),
        });
        sensors.chain(valves).collect()
    }

    fn finish(
        &mut self,
        now: Duration,
        started: Instant,
        status: TickStatus,
        samples: Vec<Sample>,
        events: Vec<StandEvent>,
    ) -> TickReport {
        let duration = started.elapsed();
        let us = duration.as_micros() as u64;
        self.stats.last_tick_us = us;
        self.stats.max_tick_us = self.stats.max_tick_us.max(us);
        self.publish(now);
        TickReport {
            tick: self.tick,
            status,
            samples,
            events,
            duration,
        }
    }

    fn publish(&self, now: Duration) {
        let Some(exchange) = &self.exchange else {
            return;
        };
        exchange.publish_state(StandSnapshot {
            timestamp_us: now.as_micros() as u64,
            tick: self.tick,
            connected: self.was_connected,
            high_speed: self.logger.is_high_speed(),
            sequencer_running: self.sequencer.is_running(),
            steps_remaining: self.sequencer.remaining() as u32,
            shutdown_latched: self.shutdown.is_latched(),
            shutdown_episodes: self.shutdown.episodes(),
            read_faults: self.stats.read_faults,
            redline_trips: self.monitor.stats().trips,
            last_tick_us: self.stats.last_tick_us,
        });
    }

    /// Load a fresh sequence from the configured source and start it.
    pub fn start_sequence(&mut self, now: Duration) -> Result<usize, SequenceError> {
        if self.shutdown.is_latched() {
            return Err(SequenceError::ShutdownLatched);
        }
        if self.sequencer.is_running() {
            return Err(SequenceError::AlreadyRunning);
        }
        let source = self.source.as_ref().ok_or(SequenceError::NoSource)?;
        let sequence = source.load(&self.registry)?;
        let steps = sequence.len();
        self.sequencer.start(sequence, now, &mut self.logger)?;
        Ok(steps)
    }

    /// Operator or teardown shutdown; redline trips go through the monitor.
    pub fn emergency_shutdown(&mut self, reason: ShutdownReason) -> ShutdownReport {
        self.shutdown.execute(
            reason,
            ShutdownTargets {
                registry: &mut self.registry,
                io: &mut self.io,
                sequencer: &mut self.sequencer,
                logger: &mut self.logger,
            },
        )
    }

    /// Apply one operator command. Call between ticks.
    pub fn apply(&mut self, command: OperatorCommand, now: Duration) -> Vec<StandEvent> {
        log::info!("operator: {command}");
        let mut events = Vec::new();
        match command {
            OperatorCommand::StartSequence => match self.start_sequence(now) {
                Ok(steps) => {
                    events.push(StandEvent::SequenceStarted {
                        run: self.sequencer.runs(),
                        steps,
                        source: self
                            .source
                            .as_ref()
                            .map(|s| s.describe())
                            .unwrap_or_default(),
                    });
                    events.push(StandEvent::ModeChanged(self.logger.mode()));
                }
                Err(e) => {
                    log::warn!("sequence not started: {e}");
                    events.push(StandEvent::SequenceRejected(e));
                }
            },
            OperatorCommand::StopSequence => {
                if let Some(summary) = self.sequencer.stop(&mut self.logger, StopReason::Operator) {
                    events.push(StandEvent::SequenceStopped(summary));
                    events.push(StandEvent::ModeChanged(self.logger.mode()));
                }
            }
            OperatorCommand::EmergencyShutdown => {
                let report = self.emergency_shutdown(ShutdownReason::Operator);
                if report.sequence_aborted {
                    events.push(StandEvent::ModeChanged(self.logger.mode()));
                }
                events.push(StandEvent::Shutdown(report));
            }
            OperatorCommand::Rearm => {
                let was_latched = self.shutdown.rearm();
                events.push(StandEvent::Rearmed { was_latched });
            }
            OperatorCommand::SetValve { name, open } => {
                let result = if self.shutdown.is_latched() {
                    Err(StepError::ShutdownLatched)
                } else {
                    match self.registry.valve_mut(&name) {
                        Ok(valve) => valve.command(&mut self.io, open).map_err(StepError::from),
                        Err(e) => Err(StepError::from(e)),
                    }
                };
                if result.is_ok() {
                    self.registry.mirror_shared_line(&name);
                }
                if let Err(e) = &result {
                    log::warn!("manual valve command failed: {e}");
                }
                events.push(StandEvent::ValveCommanded {
                    valve: name,
                    open,
                    result,
                });
            }
            OperatorCommand::HighSpeed => {
                if self.logger.set_mode(SamplingMode::HighSpeed) {
                    events.push(StandEvent::ModeChanged(SamplingMode::HighSpeed));
                }
            }
            OperatorCommand::NormalSpeed => {
                if self.logger.set_mode(SamplingMode::Normal) {
                    events.push(StandEvent::ModeChanged(SamplingMode::Normal));
                }
            }
            OperatorCommand::Reconnect => match self.connect() {
                Ok(true) => events.push(StandEvent::ConnectionRestored),
                Ok(false) => {}
                Err(e) => {
                    log::error!("reconnect failed: {e}");
                    events.push(StandEvent::ReconnectFailed(e));
                }
            },
        }
        events
    }

    /// Process-exit path: safe every valve once, flush the log, release the
    /// hardware. Later calls return `None`.
    pub fn teardown(&mut self) -> Option<ShutdownReport> {
        if self.closing {
            return None;
        }
        self.closing = true;
        let report = self.emergency_shutdown(ShutdownReason::Teardown);
        if let Err(e) = self.logger.flush() {
            log::warn!("telemetry flush failed: {e}");
        }
        self.io.close();
        Some(report)
    }

    /// Tick on the logger's cadence until `stop` is set. `on_tick` runs
    /// after every tick, which is where operator commands get applied.
    pub fn run<F>(&mut self, stop: &AtomicBool, mut on_tick: F)
    where
        F: FnMut(&mut Self, &TickReport),
    {
        let mut next_tick = Instant::now();
        while !stop.load(Ordering::Relaxed) {
            let now = Instant::now();
            if now < next_tick {
                std::thread::sleep(next_tick - now);
            } else if now.duration_since(next_tick) > self.logger.interval() {
                self.stats.overruns += 1;
                log::debug!("tick overrun by {:?}", now.duration_since(next_tick));
                next_tick = now;
            }

            let report = self.tick();
            on_tick(self, &report);
            next_tick += self.logger.interval();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datalog::MemorySink;
    use crate::device::{SensorKind, Sensor, Valve};
    use crate::hal_sim::SimulatedStand;
    use crate::sequence::{Action, SequenceStep, StaticSequence};

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    // 2.5 V on a default pressure sensor reads 750 psi.
    const V_750_PSI: f64 = 2.5;
    const V_1200_PSI: f64 = 3.7;

    fn stand() -> (SimulatedStand, DeviceRegistry) {
        let mut io = SimulatedStand::connected();
        for ch in ["AIN0", "AIN1", "AIN2"] {
            io.set_voltage(ch, V_750_PSI);
        }
        let registry = DeviceRegistry::from_devices([
            Device::from(Sensor::new("PT-S", SensorKind::Pressure, Some("AIN0".into())).with_redline(Some(1000.0))),
            Device::from(Sensor::new("PT-T", SensorKind::Pressure, Some("AIN1".into()))),
            Device::from(Sensor::new("PT-U", SensorKind::Pressure, Some("AIN2".into()))),
            Device::from(Sensor::new("TC-X", SensorKind::Thermocouple, None)),
            Device::from(Valve::new("V1", Some("EIO0".into()), false)),
            Device::from(Valve::new("V2", Some("EIO1".into()), false)),
            Device::from(Valve::new("VENT", Some("EIO7".into()), true)),
        ])
        .unwrap();
        (io, registry)
    }

    fn build(sink: &MemorySink) -> TelemetryLoop<SimulatedStand> {
        let (io, registry) = stand();
        let config = LoopConfig {
            tracked_channels: vec!["PT-T".to_string()],
            ..LoopConfig::default()
        };
        TelemetryLoop::new(io, registry, config, Some(Box::new(sink.clone())))
            .unwrap()
            .with_sequence_source(Box::new(StaticSequence(vec![
                SequenceStep::new(secs(0.0), "V1", Action::Open),
                SequenceStep::new(secs(2.0), "V1", Action::Close),
                SequenceStep::new(secs(2.0), "V2", Action::Open),
                SequenceStep::new(secs(10.0), "V2", Action::Wait),
            ])))
    }

    fn logged_devices(sink: &MemorySink, tick: u64) -> Vec<String> {
        sink.records()
            .into_iter()
            .filter(|r| r.tick == tick)
            .map(|r| r.device)
            .collect()
    }

    #[test]
    fn read_fault_is_isolated_to_its_device() {
        let sink = MemorySink::new();
        let mut lp = build(&sink);
        lp.io_mut().fail_channel("AIN0");
        let report = lp.tick_at(secs(0.0));
        assert_eq!(report.status, TickStatus::Completed);
        let read: Vec<_> = report.samples.iter().map(|s| s.device.as_str()).collect();
        assert_eq!(read, ["PT-T", "PT-U"]);
        assert!(report
            .events
            .iter()
            .any(|e| matches!(e, StandEvent::ReadFault(err) if err.device() == "PT-S")));
        let logged = logged_devices(&sink, 1);
        assert!(logged.contains(&"PT-T".to_string()));
        assert!(logged.contains(&"PT-U".to_string()));
        assert!(!logged.contains(&"PT-S".to_string()));
        assert_eq!(lp.stats().read_faults, 1);

        lp.io_mut().heal_channel("AIN0");
        let report = lp.tick_at(secs(0.5));
        assert_eq!(report.samples.len(), 3);
        assert!(logged_devices(&sink, 2).contains(&"PT-S".to_string()));
    }

    #[test]
    fn unmapped_sensors_are_not_read() {
        let sink = MemorySink::new();
        let mut lp = build(&sink);
        let report = lp.tick_at(secs(0.0));
        assert!(report.samples.iter().all(|s| s.device != "TC-X"));
        assert!(report.events.is_empty());
    }

    #[test]
    fn disconnected_tick_is_skipped_whole() {
        let sink = MemorySink::new();
        let mut lp = build(&sink);
        lp.tick_at(secs(0.0));
        lp.io_mut().set_connected(false);
        let report = lp.tick_at(secs(0.5));
        assert_eq!(report.status, TickStatus::Disconnected);
        assert!(report.samples.is_empty());
        assert!(matches!(report.events[..], [StandEvent::ConnectionLost]));
        assert!(logged_devices(&sink, 2).is_empty());

        // lost is reported once per transition
        assert!(lp.tick_at(secs(1.0)).events.is_empty());
        lp.io_mut().set_connected(true);
        let back = lp.tick_at(secs(1.5));
        assert!(matches!(back.events[0], StandEvent::ConnectionRestored));
        assert_eq!(lp.stats().disconnected_ticks, 2);
    }

    #[test]
    fn initial_connect_is_not_a_restoration() {
        let sink = MemorySink::new();
        let (mut io, registry) = stand();
        io.set_connected(false);
        let mut lp = TelemetryLoop::new(io, registry, LoopConfig::default(), Some(Box::new(sink)))
            .unwrap();
        assert_eq!(lp.connect(), Ok(true));
        let report = lp.tick_at(secs(0.0));
        assert!(report.events.is_empty(), "{:?}", report.events);

        lp.io_mut().set_connected(false);
        lp.tick_at(secs(0.5));
        let events = lp.apply(OperatorCommand::Reconnect, secs(0.6));
        assert!(matches!(events[..], [StandEvent::ConnectionRestored]));
        assert!(lp.tick_at(secs(1.0)).events.is_empty());
    }

    #[test]
    fn single_spike_does_not_trip() {
        let sink = MemorySink::new();
        let mut lp = build(&sink);
        for i in 0..5 {
            let volts = if i == 2 { 4.4 } else { V_750_PSI };
            lp.io_mut().set_voltage("AIN0", volts);
            lp.tick_at(secs(i as f64 * 0.5));
        }
        assert!(!lp.shutdown_controller().is_latched());
        assert_eq!(lp.monitor().stats().trips, 0);
    }

    #[test]
    fn sustained_overpressure_trips_once_and_safes_everything() {
        let sink = MemorySink::new();
        let mut lp = build(&sink);
        lp.apply(OperatorCommand::StartSequence, secs(0.0));
        lp.tick_at(secs(0.0));
        assert!(lp.registry().valve("V1").unwrap().commanded_open());

        lp.io_mut().set_voltage("AIN0", V_1200_PSI);
        let mut breaches = 0;
        let mut passes = Vec::new();
        for i in 1..=8 {
            for e in lp.tick_at(secs(i as f64 * 0.1)).events {
                match e {
                    StandEvent::RedlineBreach(_) => breaches += 1,
                    StandEvent::Shutdown(report) => passes.push(report.first_in_episode),
                    _ => {}
                }
            }
        }
        assert_eq!(breaches, 1);
        assert_eq!(passes.iter().filter(|first| **first).count(), 1);
        assert!(passes.len() > 1, "latched breaches must re-run the valve pass");
        assert_eq!(lp.shutdown_controller().episodes(), 1);
        assert!(lp.shutdown_controller().is_latched());
        assert!(!lp.sequencer().is_running());
        assert_eq!(lp.logger().mode(), SamplingMode::Normal);
        for valve in lp.registry().valves() {
            assert_eq!(valve.commanded_open(), valve.normally_open(), "{}", valve.name());
        }
        assert_eq!(lp.monitor().stats().trips, 1);
        assert!(lp.monitor().stats().reasserted > 0);
    }

    #[test]
    fn valves_stay_safe_under_a_latched_breach() {
        let sink = MemorySink::new();
        let mut lp = build(&sink);
        lp.io_mut().set_voltage("AIN0", V_1200_PSI);
        for i in 0..3 {
            lp.tick_at(secs(i as f64 * 0.5));
        }
        assert!(lp.shutdown_controller().is_latched());

        let events = lp.apply(
            OperatorCommand::SetValve {
                name: "V1".into(),
                open: true,
            },
            secs(1.5),
        );
        assert!(matches!(
            &events[0],
            StandEvent::ValveCommanded { result: Err(StepError::ShutdownLatched), .. }
        ));
        assert!(!lp.registry().valve("V1").unwrap().commanded_open());

        // a valve moved behind the latch is re-safed on the next breach
        let valve = lp.registry.valve_mut("V1").unwrap();
        valve.command(&mut lp.io, true).unwrap();
        let passes = lp.shutdown_controller().passes();
        for i in 4..14 {
            lp.tick_at(secs(i as f64 * 0.5));
        }
        assert!(!lp.registry().valve("V1").unwrap().commanded_open());
        assert_eq!(lp.shutdown_controller().passes(), passes + 10);
        assert_eq!(lp.shutdown_controller().episodes(), 1);

        lp.io_mut().set_voltage("AIN0", V_750_PSI);
        for i in 15..20 {
            lp.tick_at(secs(i as f64 * 0.5));
        }
        lp.apply(OperatorCommand::Rearm, secs(10.0));
        let events = lp.apply(
            OperatorCommand::SetValve {
                name: "V1".into(),
                open: true,
            },
            secs(10.0),
        );
        assert!(matches!(&events[0], StandEvent::ValveCommanded { result: Ok(()), .. }));
    }

    #[test]
    fn start_is_refused_while_latched() {
        let sink = MemorySink::new();
        let mut lp = build(&sink);
        lp.apply(OperatorCommand::EmergencyShutdown, secs(0.0));
        let events = lp.apply(OperatorCommand::StartSequence, secs(0.0));
        assert!(matches!(
            events[..],
            [StandEvent::SequenceRejected(SequenceError::ShutdownLatched)]
        ));
        lp.apply(OperatorCommand::Rearm, secs(0.0));
        let events = lp.apply(OperatorCommand::StartSequence, secs(0.0));
        assert!(matches!(events[0], StandEvent::SequenceStarted { steps: 4, .. }));
    }

    #[test]
    fn cadence_switches_with_sequencer() {
        let sink = MemorySink::new();
        let mut lp = build(&sink);
        let normal = lp.logger().interval();
        lp.apply(OperatorCommand::StartSequence, secs(0.0));
        assert_eq!(lp.logger().mode(), SamplingMode::HighSpeed);
        assert!(lp.logger().interval() < normal);
        lp.apply(OperatorCommand::StopSequence, secs(1.0));
        assert_eq!(lp.logger().mode(), SamplingMode::Normal);

        lp.apply(OperatorCommand::StartSequence, secs(2.0));
        assert_eq!(lp.logger().mode(), SamplingMode::HighSpeed);
        lp.apply(OperatorCommand::EmergencyShutdown, secs(3.0));
        assert_eq!(lp.logger().mode(), SamplingMode::Normal);
    }

    #[test]
    fn sequence_plays_against_ticks() {
        let sink = MemorySink::new();
        let mut lp = build(&sink);
        lp.apply(OperatorCommand::StartSequence, secs(0.0));
        let mut dispatched = Vec::new();
        for t in [0.0, 1.0, 2.0, 3.0] {
            for e in lp.tick_at(secs(t + 0.1)).events {
                if let StandEvent::StepDispatched(o) = e {
                    dispatched.push(o.index);
                }
            }
        }
        assert_eq!(dispatched, [0, 1, 2]);
        assert!(lp.sequencer().is_running());
        assert_eq!(lp.sequencer().traces().get("PT-T").map(<[f64]>::len), Some(4));
        assert_eq!(
            lp.io().writes(),
            &[
                ("EIO0".to_string(), true),
                ("EIO0".to_string(), false),
                ("EIO1".to_string(), true),
            ]
        );
    }

    #[test]
    fn valve_states_are_logged_every_tick() {
        let sink = MemorySink::new();
        let mut lp = build(&sink);
        lp.apply(
            OperatorCommand::SetValve {
                name: "V2".into(),
                open: true,
            },
            secs(0.0),
        );
        lp.tick_at(secs(0.0));
        let v2 = sink
            .records()
            .into_iter()
            .find(|r| r.device == "V2")
            .unwrap();
        assert_eq!(v2.value, 1.0);
        assert_eq!(v2.unit, "open");
    }

    #[test]
    fn valves_on_a_shared_line_are_logged_together() {
        let sink = MemorySink::new();
        let (io, mut registry) = stand();
        registry
            .insert(Valve::new("V1-TWIN", Some("EIO0".into()), false))
            .unwrap();
        let mut lp = TelemetryLoop::new(io, registry, LoopConfig::default(), Some(Box::new(sink.clone())))
            .unwrap();
        lp.apply(
            OperatorCommand::SetValve {
                name: "V1".into(),
                open: true,
            },
            secs(0.0),
        );
        lp.tick_at(secs(0.0));
        let twin = sink
            .records()
            .into_iter()
            .find(|r| r.device == "V1-TWIN")
            .unwrap();
        assert_eq!(twin.value, 1.0);

        lp.apply(OperatorCommand::EmergencyShutdown, secs(0.5));
        assert!(!lp.registry().valve("V1-TWIN").unwrap().commanded_open());
    }

    #[test]
    fn manual_command_on_sensor_is_rejected() {
        let sink = MemorySink::new();
        let mut lp = build(&sink);
        let events = lp.apply(
            OperatorCommand::SetValve {
                name: "PT-S".into(),
                open: true,
            },
            secs(0.0),
        );
        assert!(matches!(
            &events[0],
            StandEvent::ValveCommanded { result: Err(StepError::Registry(_)), .. }
        ));
    }

    #[test]
    fn log_failure_does_not_stop_the_tick() {
        let sink = MemorySink::new();
        let mut lp = build(&sink);
        sink.set_failing(true);
        let report = lp.tick_at(secs(0.0));
        assert_eq!(report.samples.len(), 3);
        assert!(report
            .events
            .iter()
            .any(|e| matches!(e, StandEvent::LogWriteFailed(_))));
        assert_eq!(lp.stats().log_failures, 1);
    }

    #[test]
    fn teardown_runs_once() {
        let sink = MemorySink::new();
        let mut lp = build(&sink);
        lp.apply(
            OperatorCommand::SetValve {
                name: "VENT".into(),
                open: false,
            },
            secs(0.0),
        );
        let report = lp.teardown().unwrap();
        assert_eq!(report.reason, ShutdownReason::Teardown);
        assert!(lp.registry().valve("VENT").unwrap().commanded_open());
        assert!(lp.teardown().is_none());
        assert!(!lp.is_connected());
    }

    #[test]
    fn unknown_tracked_channel_is_rejected() {
        let (io, registry) = stand();
        let config = LoopConfig {
            tracked_channels: vec!["PT-OX-01".to_string()],
            ..LoopConfig::default()
        };
        let err = TelemetryLoop::new(io, registry, config, None).err();
        assert_eq!(err, Some(RegistryError::UnknownDevice("PT-OX-01".into())));
    }

    #[test]
    fn snapshot_is_published_each_tick() {
        let sink = MemorySink::new();
        let exchange = Arc::new(StateExchange::new());
        let mut lp = build(&sink).with_exchange(Arc::clone(&exchange));
        lp.apply(OperatorCommand::StartSequence, secs(0.0));
        lp.tick_at(secs(0.0));
        let snap = exchange.read_state();
        assert_eq!(snap.tick, 1);
        assert!(snap.connected);
        assert!(snap.high_speed);
        assert!(snap.sequencer_running);
        assert_eq!(snap.steps_remaining, 3);
    }

    #[test]
    fn run_stops_on_flag() {
        let sink = MemorySink::new();
        let mut lp = build(&sink);
        let stop = AtomicBool::new(false);
        let mut seen = 0;
        lp.run(&stop, |_, report| {
            seen = report.tick;
            if report.tick == 2 {
                stop.store(true, Ordering::Relaxed);
            }
        });
        assert_eq!(seen, 2);
    }
}

use crate::datalog::{DataLogger, SamplingMode};
use crate::device::DeviceError;
use crate::hal::HardwareProvider;
use crate::registry::{DeviceRegistry, RegistryError};
use crate::sequence::{Action, Sequence, SequenceError, SequenceStep};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SequencerState {
    #[default]
    Idle,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Operator,
    Completed,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StepError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("shutdown latched; reset before commanding valves")]
    ShutdownLatched,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub index: usize,
    pub step: SequenceStep,
    pub result: Result<(), StepError>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run: u64,
    pub reason: StopReason,
    pub dispatched: usize,
    pub failed: usize,
    pub discarded: usize,
}

/// Per-channel values captured once per tick while a run is active.
#[derive(Debug, Clone, Default)]
pub struct TraceBuffers {
    channels: Vec<(String, Vec<f64>)>,
}

impl TraceBuffers {
    pub fn new(names: impl IntoIterator<Item = String>) -> Self {
        Self {
            channels: names.into_iter().map(|n| (n, Vec::new())).collect(),
        }
    }

    pub fn is_tracked(&self, name: &str) -> bool {
        self.channels.iter().any(|(n, _)| n == name)
    }

    /// Returns false for untracked channels.
    pub fn append(&mut self, name: &str, value: f64) -> bool {
        match self.channels.iter_mut().find(|(n, _)| n == name) {
            Some((_, values)) => {
                values.push(value);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, name: &str) -> Option<&[f64]> {
        self.channels
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.channels.iter().map(|(n, _)| n.as_str())
    }

    pub fn clear(&mut self) {
        for (_, values) in &mut self.channels {
            values.clear();
        }
    }
}

/// Plays a loaded sequence against the registry, one dispatch pass per
/// tick.
#[derive(Debug, Default)]
pub struct Sequencer {
    state: SequencerState,
    steps: Vec<SequenceStep>,
    cursor: usize,
    started_at: Duration,
    failed: usize,
    runs: u64,
    traces: TraceBuffers,
}

#[derive(Debug, Default)]
pub struct SequencerTick {
    pub dispatched: Vec<StepOutcome>,
    pub completed: Option<RunSummary>,
}

impl Sequencer {
    pub fn new(tracked: Vec<String>) -> Self {
        Self {
            traces: TraceBuffers::new(tracked),
            ..Self::default()
        }
    }

    pub fn state(&self) -> SequencerState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == SequencerState::Running
    }

    pub fn runs(&self) -> u64 {
        self.runs
    }

    /// Steps not yet dispatched in the current run.
    pub fn remaining(&self) -> usize {
        self.steps.len().saturating_sub(self.cursor)
    }

    pub fn elapsed(&self, now: Duration) -> Option<Duration> {
        self.is_running().then(|| now.saturating_sub(self.started_at))
    }

    pub fn traces(&self) -> &TraceBuffers {
        &self.traces
    }

    /// Append a tracked channel's value; ignored while idle.
    pub fn record_trace(&mut self, name: &str, value: f64) {
        if self.is_running() {
            self.traces.append(name, value);
        }
    }

    pub fn start(
        &mut self,
        sequence: Sequence,
        now: Duration,
        logger: &mut DataLogger,
    ) -> Result<(), SequenceError> {
        if self.is_running() {
            return Err(SequenceError::AlreadyRunning);
        }
        self.steps = sequence.into_steps();
        self.cursor = 0;
        self.failed = 0;
        self.started_at = now;
        self.runs += 1;
        self.traces.clear();
        self.state = SequencerState::Running;
        logger.set_mode(SamplingMode::HighSpeed);
        log::info!("sequence run {} started with {} steps", self.runs, self.steps.len());
        Ok(())
    }

    /// Dispatch every pending step whose offset has elapsed, in order. A
    /// failed step is reported and never retried. The run stops itself once
    /// the last step is dispatched.
    pub fn tick(
        &mut self,
        now: Duration,
        registry: &mut DeviceRegistry,
        io: &mut dyn HardwareProvider,
        logger: &mut DataLogger,
    ) -> SequencerTick {
        let mut out = SequencerTick::default();
        if !self.is_running() {
            return out;
        }
        let elapsed = now.saturating_sub(self.started_at);
        while let Some(step) = self.steps.get(self.cursor) {
            if step.offset > elapsed {
                break;
            }
            let index = self.cursor;
            self.cursor += 1;
            let result = Self::execute(step, registry, io);
            match &result {
                Ok(()) => log::info!("step {index}: {step}"),
                Err(e) => {
                    self.failed += 1;
                    log::warn!("step {index}: {step} failed: {e}");
                }
            }
            out.dispatched.push(StepOutcome {
                index,
                step: step.clone(),
                result,
            });
        }
        if self.cursor >= self.steps.len() {
            out.completed = self.stop(logger, StopReason::Completed);
        }
        out
    }

    fn execute(
        step: &SequenceStep,
        registry: &mut DeviceRegistry,
        io: &mut dyn HardwareProvider,
    ) -> Result<(), StepError> {
        let open = match step.action {
            Action::Wait => return Ok(()),
            Action::Open => true,
            Action::Close => false,
            Action::Set => step.value.unwrap_or_default() != 0.0,
        };
        registry.valve_mut(&step.device)?.command(io, open)?;
        registry.mirror_shared_line(&step.device);
        Ok(())
    }

    /// Discard the remaining steps and restore normal cadence. No-op when
    /// idle.
    pub fn stop(&mut self, logger: &mut DataLogger, reason: StopReason) -> Option<RunSummary> {
        if !self.is_running() {
            return None;
        }
        let summary = RunSummary {
            run: self.runs,
            reason,
            dispatched: self.cursor,
            failed: self.failed,
            discarded: self.remaining(),
        };
        self.steps.clear();
        self.cursor = 0;
        self.state = SequencerState::Idle;
        logger.set_mode(SamplingMode::Normal);
        log::info!(
            "sequence run {} stopped ({:?}): {} dispatched, {} discarded",
            summary.run,
            reason,
            summary.dispatched,
            summary.discarded
        );
        Some(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datalog::Cadence;
    use crate::device::{Device, SensorKind, Sensor, Valve};
    use crate::hal_sim::SimulatedStand;

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    struct Rig {
        registry: DeviceRegistry,
        io: SimulatedStand,
        logger: DataLogger,
        sequencer: Sequencer,
    }

    impl Rig {
        fn new() -> Self {
            Self {
                registry: DeviceRegistry::from_devices([
                    Device::from(Valve::new("V1", Some("EIO0".into()), false)),
                    Device::from(Valve::new("V2", Some("EIO1".into()), false)),
                    Device::from(Sensor::new("PT1", SensorKind::Pressure, Some("AIN0".into()))),
                ])
                .unwrap(),
                io: SimulatedStand::connected(),
                logger: DataLogger::without_sink(Cadence::default()),
                sequencer: Sequencer::new(vec!["PT1".to_string()]),
            }
        }

        fn start(&mut self, steps: Vec<SequenceStep>) {
            let seq = Sequence::from_steps(steps, &self.registry).unwrap();
            self.sequencer.start(seq, Duration::ZERO, &mut self.logger).unwrap();
        }

        fn tick(&mut self, at: f64) -> SequencerTick {
            self.sequencer
                .tick(secs(at), &mut self.registry, &mut self.io, &mut self.logger)
        }
    }

    fn three_steps() -> Vec<SequenceStep> {
        vec![
            SequenceStep::new(secs(0.0), "V1", Action::Open),
            SequenceStep::new(secs(2.0), "V1", Action::Close),
            SequenceStep::new(secs(2.0), "V2", Action::Open),
        ]
    }

    #[test]
    fn shared_offsets_fire_once_in_listed_order() {
        let mut rig = Rig::new();
        rig.start(three_steps());

        let t0 = rig.tick(0.1);
        assert_eq!(t0.dispatched.len(), 1);
        assert!(rig.tick(1.1).dispatched.is_empty());
        let t2 = rig.tick(2.1);
        let fired: Vec<_> = t2.dispatched.iter().map(|o| o.index).collect();
        assert_eq!(fired, [1, 2]);
        assert!(t2.dispatched.iter().all(|o| o.result.is_ok()));
        assert!(rig.tick(3.1).dispatched.is_empty());

        assert_eq!(
            rig.io.writes(),
            &[
                ("EIO0".to_string(), true),
                ("EIO0".to_string(), false),
                ("EIO1".to_string(), true),
            ]
        );
    }

    #[test]
    fn completion_stops_and_restores_cadence() {
        let mut rig = Rig::new();
        rig.start(three_steps());
        assert_eq!(rig.logger.mode(), SamplingMode::HighSpeed);
        rig.tick(0.0);
        assert!(rig.sequencer.is_running());
        let done = rig.tick(2.0).completed.unwrap();
        assert_eq!(done.reason, StopReason::Completed);
        assert_eq!(done.dispatched, 3);
        assert_eq!(done.discarded, 0);
        assert!(!rig.sequencer.is_running());
        assert_eq!(rig.logger.mode(), SamplingMode::Normal);
    }

    #[test]
    fn late_tick_dispatches_everything_elapsed() {
        let mut rig = Rig::new();
        rig.start(three_steps());
        assert_eq!(rig.tick(5.0).dispatched.len(), 3);
    }

    #[test]
    fn operator_stop_discards_remaining() {
        let mut rig = Rig::new();
        rig.start(three_steps());
        rig.tick(0.5);
        let summary = rig
            .sequencer
            .stop(&mut rig.logger, StopReason::Operator)
            .unwrap();
        assert_eq!(summary.dispatched, 1);
        assert_eq!(summary.discarded, 2);
        assert_eq!(rig.sequencer.remaining(), 0);
        assert!(rig.tick(9.0).dispatched.is_empty());
        assert!(rig.sequencer.stop(&mut rig.logger, StopReason::Operator).is_none());
    }

    #[test]
    fn failed_step_is_not_retried() {
        let mut rig = Rig::new();
        rig.io.fail_channel("EIO1");
        rig.start(vec![
            SequenceStep::new(secs(0.0), "V2", Action::Open),
            SequenceStep::new(secs(1.0), "V1", Action::Open),
        ]);
        let first = rig.tick(0.0);
        assert!(first.dispatched[0].result.is_err());
        let second = rig.tick(1.0);
        assert_eq!(second.dispatched.len(), 1);
        assert_eq!(second.dispatched[0].index, 1);
        assert_eq!(second.completed.unwrap().failed, 1);
    }

    #[test]
    fn set_and_wait_actions() {
        let mut rig = Rig::new();
        rig.start(vec![
            SequenceStep::new(secs(0.0), "V1", Action::Set).with_value(1.0),
            SequenceStep::new(secs(1.0), "V1", Action::Set).with_value(0.0),
            SequenceStep::new(secs(3.0), "PT1", Action::Wait),
        ]);
        rig.tick(1.0);
        assert!(!rig.registry.valve("V1").unwrap().commanded_open());
        assert!(rig.sequencer.is_running(), "wait holds the run open");
        assert!(rig.tick(3.0).completed.is_some());
    }

    #[test]
    fn traces_are_cleared_per_run() {
        let mut rig = Rig::new();
        rig.sequencer.record_trace("PT1", 1.0);
        assert_eq!(rig.sequencer.traces().get("PT1"), Some(&[][..]));

        rig.start(three_steps());
        rig.sequencer.record_trace("PT1", 2.0);
        rig.sequencer.record_trace("PT9", 2.0);
        assert_eq!(rig.sequencer.traces().get("PT1"), Some(&[2.0][..]));
        rig.sequencer.stop(&mut rig.logger, StopReason::Operator);

        rig.start(three_steps());
        assert_eq!(rig.sequencer.traces().get("PT1"), Some(&[][..]));
        assert_eq!(rig.sequencer.runs(), 2);
    }

    #[test]
    fn double_start_is_rejected() {
        let mut rig = Rig::new();
        rig.start(three_steps());
        let seq = Sequence::from_steps(three_steps(), &rig.registry).unwrap();
        assert_eq!(
            rig.sequencer.start(seq, Duration::ZERO, &mut rig.logger),
            Err(SequenceError::AlreadyRunning)
        );
    }
}

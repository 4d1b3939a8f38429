use stand_core::{
    HardwareProvider, ShutdownReason, StandEvent, TelemetryLoop, TickReport, TickStatus,
};
use stand_io::metrics::{
    init_metrics, serve_metrics, CONNECTED, DISCONNECTED_TICKS, HIGH_SPEED, LOG_WRITE_FAILURES,
    READ_FAULTS, REDLINE_TRIPS, SENSOR_VALUE, SEQUENCE_RUNNING, SHUTDOWNS, SHUTDOWN_LATCHED,
    STEPS_DISPATCHED, STEP_FAILURES, TICKS, TICK_DURATION_US, TICK_OVERRUNS, VALVE_FAULTS,
    VALVE_OPEN,
};
use std::thread;
use tracing::info;

pub fn init() {
    init_metrics();
}

pub fn start_metrics_server(addr: &Option<String>) -> Option<thread::JoinHandle<()>> {
    addr.as_ref().map(|addr| {
        info!(addr = %addr, "Starting metrics server");
        serve_metrics(addr.clone())
    })
}

fn shutdown_source(reason: &ShutdownReason) -> &'static str {
    match reason {
        ShutdownReason::Redline { .. } => "redline",
        ShutdownReason::Operator => "operator",
        ShutdownReason::Teardown => "teardown",
    }
}

/// Mirrors loop state into the Prometheus registry from the loop thread.
#[derive(Debug, Default)]
pub struct MetricsRecorder {
    overruns_seen: u64,
}

impl MetricsRecorder {
    pub fn record_tick<P: HardwareProvider>(&mut self, lp: &TelemetryLoop<P>, report: &TickReport) {
        TICKS.inc();
        TICK_DURATION_US.observe(report.duration.as_micros() as f64);
        if report.status == TickStatus::Disconnected {
            DISCONNECTED_TICKS.inc();
        }
        let overruns = lp.stats().overruns;
        if overruns > self.overruns_seen {
            TICK_OVERRUNS.inc_by(overruns - self.overruns_seen);
            self.overruns_seen = overruns;
        }
        for sample in &report.samples {
            SENSOR_VALUE
                .with_label_values(&[sample.device.as_str(), sample.unit])
                .set(sample.value);
        }
        record_events(&report.events);
        record_state(lp);
    }
}

pub fn record_events(events: &[StandEvent]) {
    for event in events {
        match event {
            StandEvent::ReadFault(e) => READ_FAULTS.with_label_values(&[e.device()]).inc(),
            StandEvent::RedlineBreach(_) => REDLINE_TRIPS.inc(),
            StandEvent::Shutdown(report) if !report.skipped => {
                SHUTDOWNS
                    .with_label_values(&[shutdown_source(&report.reason)])
                    .inc();
                VALVE_FAULTS.inc_by(report.faults.len() as u64);
            }
            StandEvent::StepDispatched(outcome) => {
                STEPS_DISPATCHED.inc();
                if outcome.result.is_err() {
                    STEP_FAILURES.inc();
                }
            }
            StandEvent::LogWriteFailed(_) => LOG_WRITE_FAILURES.inc(),
            _ => {}
        }
    }
}

pub fn record_state<P: HardwareProvider>(lp: &TelemetryLoop<P>) {
    let flag = |on: bool| if on { 1.0 } else { 0.0 };
    CONNECTED.set(flag(lp.is_connected()));
    HIGH_SPEED.set(flag(lp.logger().is_high_speed()));
    SEQUENCE_RUNNING.set(flag(lp.sequencer().is_running()));
    SHUTDOWN_LATCHED.set(flag(lp.shutdown_controller().is_latched()));
    for valve in lp.registry().valves() {
        VALVE_OPEN
            .with_label_values(&[valve.name()])
            .set(flag(valve.commanded_open()));
    }
}

use crate::infra::audit::{self, AuditEventType, AuditLogger};
use crate::runtime::config::RuntimeConfig;
use crate::runtime::logging::init_tracing;
use crate::runtime::operator;
use crate::runtime::stand::{StandConfig, StandConfigError};
use crate::runtime::telemetry::{self, MetricsRecorder};
use stand_core::{
    HardwareProvider, JsonlSink, LoopConfig, OperatorCommand, ProviderError, RegistryError,
    SequenceError, SequenceFile, SequenceSource, SimulatedStand, StandEvent, StateExchange,
    TelemetryLoop, TelemetrySink, TimeBase,
};
use stand_io::LabJackModbus;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Stand(#[from] StandConfigError),
    #[error("sequence {path}: {source}")]
    Sequence {
        path: String,
        #[source]
        source: SequenceError,
    },
    #[error("cannot open {what} {path}: {source}")]
    Open {
        what: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("hardware: {0}")]
    Hardware(#[from] ProviderError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("failed to install signal handler: {0}")]
    Signal(#[from] ctrlc::Error),
}

enum StandHardware {
    Simulated(SimulatedStand),
    LabJack(LabJackModbus),
}

impl HardwareProvider for StandHardware {
    fn connect(&mut self) -> Result<(), ProviderError> {
        match self {
            Self::Simulated(hw) => hw.connect(),
            Self::LabJack(hw) => hw.connect(),
        }
    }

    fn is_connected(&self) -> bool {
        match self {
            Self::Simulated(hw) => hw.is_connected(),
            Self::LabJack(hw) => hw.is_connected(),
        }
    }

    fn read_analog(&mut self, channel: &str) -> Result<f64, ProviderError> {
        match self {
            Self::Simulated(hw) => hw.read_analog(channel),
            Self::LabJack(hw) => hw.read_analog(channel),
        }
    }

    fn write_digital(&mut self, channel: &str, bit: bool) -> Result<(), ProviderError> {
        match self {
            Self::Simulated(hw) => hw.write_digital(channel, bit),
            Self::LabJack(hw) => hw.write_digital(channel, bit),
        }
    }

    fn close(&mut self) {
        match self {
            Self::Simulated(hw) => hw.close(),
            Self::LabJack(hw) => hw.close(),
        }
    }
}

struct Audit {
    logger: Option<AuditLogger>,
    timebase: TimeBase,
}

impl Audit {
    fn record(&self, event_type: AuditEventType, details: serde_json::Value) {
        let Some(logger) = &self.logger else {
            return;
        };
        if let Err(e) = logger.log_event(
            self.timebase.now_us(),
            self.timebase.unix_us(),
            event_type,
            details,
        ) {
            warn!(error = %e, "audit write failed");
        }
    }

    fn events(&self, events: &[StandEvent]) {
        for event in events {
            for (event_type, details) in audit::entries_for(event) {
                self.record(event_type, details);
            }
        }
    }
}

pub fn run_from_args() -> Result<(), AppError> {
    let config = RuntimeConfig::from_env();
    if config.show_help {
        RuntimeConfig::print_help();
        return Ok(());
    }
    run(config)
}

fn apply_overrides(stand: &mut StandConfig, config: &RuntimeConfig) {
    if let Some(window) = config.window {
        stand.window = window;
    }
    if config.interval_ms.is_some() {
        stand.interval_ms = config.interval_ms;
    }
    if config.high_speed_interval_ms.is_some() {
        stand.high_speed_interval_ms = config.high_speed_interval_ms;
    }
}

fn open_sink(path: &Path) -> Result<Box<dyn TelemetrySink>, AppError> {
    let sink = JsonlSink::open(path).map_err(|source| AppError::Open {
        what: "telemetry log",
        path: path.display().to_string(),
        source,
    })?;
    info!(path = %path.display(), "Telemetry logging enabled");
    Ok(Box::new(sink))
}

fn init_audit_logger(audit_path: Option<&PathBuf>) -> Result<Option<AuditLogger>, AppError> {
    let Some(path) = audit_path else {
        return Ok(None);
    };
    let logger = AuditLogger::new(path).map_err(|source| AppError::Open {
        what: "audit log",
        path: path.display().to_string(),
        source,
    })?;
    info!(path = %path.display(), "Audit logging enabled");
    Ok(Some(logger))
}

pub fn run(config: RuntimeConfig) -> Result<(), AppError> {
    let _log_guard = init_tracing(config.json_logs, config.log_dir.as_deref());

    telemetry::init();
    let _metrics_handle = telemetry::start_metrics_server(&config.metrics_addr);

    let timebase = TimeBase::new();
    let audit = Audit {
        logger: init_audit_logger(config.audit_path.as_ref())?,
        timebase,
    };

    let mut stand = match &config.stand_path {
        Some(path) => StandConfig::load(path)?,
        None => StandConfig::maelstrom(),
    };
    apply_overrides(&mut stand, &config);
    let registry = stand.build_registry()?;

    let hardware = match &config.labjack_addr {
        Some(addr) => {
            info!(addr = %addr, "Using LabJack T7 over Modbus TCP");
            StandHardware::LabJack(LabJackModbus::new(addr.as_str())?)
        }
        None => {
            info!(noise_volts = config.simulate_noise, "Using simulated stand hardware");
            StandHardware::Simulated(stand.simulated_hardware(config.simulate_noise))
        }
    };
    let sink = config.telemetry_path.as_deref().map(open_sink).transpose()?;

    let loop_config = LoopConfig {
        cadence: stand.cadence(),
        tracked_channels: stand.tracked_channels.clone(),
    };
    let exchange = Arc::new(StateExchange::new());
    let mut lp = TelemetryLoop::new(hardware, registry, loop_config.clone(), sink)?
        .with_exchange(Arc::clone(&exchange))
        .with_timebase(timebase);

    if let Some(path) = &config.sequence_path {
        let source = SequenceFile::new(path);
        // surface a bad file at start-up instead of at the first `start`
        let sequence = source.load(lp.registry()).map_err(|source| AppError::Sequence {
            path: path.display().to_string(),
            source,
        })?;
        info!(
            path = %path.display(),
            steps = sequence.len(),
            duration_s = sequence.duration().as_secs_f64(),
            "Sequence loaded"
        );
        lp = lp.with_sequence_source(Box::new(source));
    }

    lp.connect()?;

    info!(
        stand = %stand.name,
        devices = lp.registry().len(),
        window = stand.window,
        normal_ms = loop_config.cadence.normal.as_millis() as u64,
        high_speed_ms = loop_config.cadence.high_speed.as_millis() as u64,
        tracked = ?loop_config.tracked_channels,
        "Starting telemetry loop"
    );
    audit.record(
        AuditEventType::SystemStart,
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "stand": stand.name,
            "hardware": if config.labjack_addr.is_some() { "labjack" } else { "simulated" },
            "sequence": config.sequence_path.as_ref().map(|p| p.display().to_string()),
        }),
    );

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop_signal = Arc::clone(&stop);
        ctrlc::set_handler(move || {
            stop_signal.store(true, Ordering::Relaxed);
        })?;
    }
    let (tx, rx) = mpsc::channel::<OperatorCommand>();

    if config.console {
        operator::spawn_console(tx, Arc::clone(&exchange), Arc::clone(&stop));
        info!("Operator console ready (type 'status' or a command)");
    } else {
        drop(tx);
    }

    if let Some(seconds) = config.run_seconds {
        info!(seconds, "Running for limited duration");
        let stop_timer = Arc::clone(&stop);
        thread::spawn(move || {
            thread::sleep(Duration::from_secs(seconds));
            stop_timer.store(true, Ordering::Relaxed);
        });
    }

    let mut recorder = MetricsRecorder::default();
    if config.auto_start {
        let events = lp.apply(OperatorCommand::StartSequence, lp.now());
        telemetry::record_events(&events);
        audit.events(&events);
    }

    lp.run(&stop, |lp, report| {
        recorder.record_tick(lp, report);
        audit.events(&report.events);
        while let Ok(command) = rx.try_recv() {
            audit.record(
                AuditEventType::OperatorCommand,
                serde_json::json!({ "command": command.to_string() }),
            );
            let events = lp.apply(command, lp.now());
            telemetry::record_events(&events);
            telemetry::record_state(lp);
            audit.events(&events);
        }
    });

    if let Some(report) = lp.teardown() {
        if report.requires_intervention() {
            error!(
                faults = report.faults.len(),
                "Teardown could not safe every valve; manual intervention required"
            );
        }
        let events = [StandEvent::Shutdown(report)];
        telemetry::record_events(&events);
        audit.events(&events);
    }

    let stats = lp.stats();
    info!(
        ticks = stats.ticks,
        disconnected_ticks = stats.disconnected_ticks,
        samples = stats.samples,
        read_faults = stats.read_faults,
        overruns = stats.overruns,
        max_tick_us = stats.max_tick_us,
        redline_trips = lp.monitor().stats().trips,
        records_written = lp.logger().stats().records_written,
        "Run complete"
    );
    audit.record(
        AuditEventType::SystemShutdown,
        serde_json::json!({
            "ticks": stats.ticks,
            "read_faults": stats.read_faults,
            "shutdown_episodes": lp.shutdown_controller().episodes(),
            "sequence_runs": lp.sequencer().runs(),
        }),
    );
    Ok(())
}

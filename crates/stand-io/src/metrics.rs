//! Prometheus metrics for the test stand.
//!
//! Covers the telemetry loop, redline monitoring, the shutdown controller
//! and the sequencer.

use prometheus::{
    Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use std::sync::LazyLock;
use std::thread;
use tiny_http::{Header, Response, Server};

/// Global metrics registry
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

fn counter(name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("valid counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("counter registered once");
    counter
}

fn gauge(name: &str, help: &str) -> Gauge {
    let gauge = Gauge::new(name, help).expect("valid gauge");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("gauge registered once");
    gauge
}

// ============================================================================
// Telemetry Loop Metrics
// ============================================================================

pub static TICKS: LazyLock<IntCounter> =
    LazyLock::new(|| counter("stand_ticks_total", "Telemetry loop ticks executed"));

pub static TICK_OVERRUNS: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "stand_tick_overruns_total",
        "Ticks started more than one interval late",
    )
});

pub static DISCONNECTED_TICKS: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "stand_disconnected_ticks_total",
        "Ticks skipped because the hardware was not connected",
    )
});

/// Tick execution time in microseconds
pub static TICK_DURATION_US: LazyLock<Histogram> = LazyLock::new(|| {
    let histogram = Histogram::with_opts(
        HistogramOpts::new(
            "stand_tick_duration_us",
            "Telemetry loop tick duration in microseconds",
        )
        .buckets(vec![
            50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 50000.0,
        ]),
    )
    .expect("valid histogram");
    REGISTRY
        .register(Box::new(histogram.clone()))
        .expect("histogram registered once");
    histogram
});

pub static READ_FAULTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let vec = IntCounterVec::new(
        Opts::new("stand_read_faults_total", "Failed sensor reads by device"),
        &["device"],
    )
    .expect("valid counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("counter vec registered once");
    vec
});

pub static LOG_WRITE_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "stand_log_write_failures_total",
        "Telemetry batches the data logger failed to persist",
    )
});

pub static CONNECTED: LazyLock<Gauge> = LazyLock::new(|| {
    gauge(
        "stand_hardware_connected",
        "Hardware connection status (1=connected, 0=disconnected)",
    )
});

pub static HIGH_SPEED: LazyLock<Gauge> = LazyLock::new(|| {
    gauge(
        "stand_high_speed_logging",
        "Data logger cadence (1=high-speed, 0=normal)",
    )
});

// ============================================================================
// Process State Metrics
// ============================================================================

/// Latest converted value of each sensor
pub static SENSOR_VALUE: LazyLock<GaugeVec> = LazyLock::new(|| {
    let vec = GaugeVec::new(
        Opts::new("stand_sensor_value", "Latest engineering-unit sensor reading"),
        &["device", "unit"],
    )
    .expect("valid gauge vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("gauge vec registered once");
    vec
});

pub static VALVE_OPEN: LazyLock<GaugeVec> = LazyLock::new(|| {
    let vec = GaugeVec::new(
        Opts::new("stand_valve_open", "Commanded valve position (1=open, 0=closed)"),
        &["valve"],
    )
    .expect("valid gauge vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("gauge vec registered once");
    vec
});

// ============================================================================
// Safety Metrics
// ============================================================================

pub static REDLINE_TRIPS: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "stand_redline_trips_total",
        "Redline breaches that initiated an emergency shutdown",
    )
});

pub static SHUTDOWNS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let vec = IntCounterVec::new(
        Opts::new("stand_shutdown_passes_total", "Shutdown passes by source"),
        &["source"],
    )
    .expect("valid counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("counter vec registered once");
    vec
});

pub static VALVE_FAULTS: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "stand_shutdown_valve_faults_total",
        "Valves a shutdown pass failed to de-energize",
    )
});

pub static SHUTDOWN_LATCHED: LazyLock<Gauge> = LazyLock::new(|| {
    gauge(
        "stand_shutdown_latched",
        "Emergency shutdown latch (1=latched, 0=armed)",
    )
});

// ============================================================================
// Sequencer Metrics
// ============================================================================

pub static SEQUENCE_RUNNING: LazyLock<Gauge> = LazyLock::new(|| {
    gauge(
        "stand_sequence_running",
        "Autosequencer state (1=running, 0=idle)",
    )
});

pub static STEPS_DISPATCHED: LazyLock<IntCounter> =
    LazyLock::new(|| counter("stand_steps_dispatched_total", "Sequence steps dispatched"));

pub static STEP_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "stand_step_failures_total",
        "Sequence steps whose command failed",
    )
});

// ============================================================================
// Metrics HTTP Server
// ============================================================================

/// Text exposition of every registered metric.
pub fn render() -> Result<Vec<u8>, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(buffer)
}

/// Start the metrics HTTP server on the given address.
/// Returns a join handle for the server thread.
pub fn serve_metrics(bind_addr: String) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let server = match Server::http(&bind_addr) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Failed to start metrics server on {}: {}", bind_addr, e);
                return;
            }
        };

        tracing::info!("Metrics server listening on http://{}/metrics", bind_addr);

        for request in server.incoming_requests() {
            let response = match request.url() {
                "/metrics" => match render() {
                    Ok(buffer) => {
                        let mut response = Response::from_data(buffer);
                        if let Ok(header) = Header::from_bytes(
                            &b"Content-Type"[..],
                            &b"text/plain; version=0.0.4"[..],
                        ) {
                            response = response.with_header(header);
                        }
                        response
                    }
                    Err(e) => {
                        tracing::warn!("Failed to encode metrics: {}", e);
                        Response::from_string("Internal Server Error").with_status_code(500)
                    }
                },
                "/health" => Response::from_string("OK"),
                // Ready once the loop has ticked with hardware attached
                "/ready" if TICKS.get() > 0 && CONNECTED.get() > 0.0 => {
                    Response::from_string("Ready")
                }
                "/ready" => Response::from_string("Not Ready").with_status_code(503),
                _ => Response::from_string("Not Found").with_status_code(404),
            };
            let _ = request.respond(response);
        }
    })
}

/// Initialize all metrics (forces lazy initialization)
pub fn init_metrics() {
    let _ = TICKS.get();
    let _ = TICK_OVERRUNS.get();
    let _ = DISCONNECTED_TICKS.get();
    let _ = TICK_DURATION_US.get_sample_count();
    let _ = LOG_WRITE_FAILURES.get();
    let _ = CONNECTED.get();
    let _ = HIGH_SPEED.get();
    let _ = REDLINE_TRIPS.get();
    let _ = VALVE_FAULTS.get();
    let _ = SHUTDOWN_LATCHED.get();
    let _ = SEQUENCE_RUNNING.get();
    let _ = STEPS_DISPATCHED.get();
    let _ = STEP_FAILURES.get();
    LazyLock::force(&READ_FAULTS);
    LazyLock::force(&SENSOR_VALUE);
    LazyLock::force(&VALVE_OPEN);
    LazyLock::force(&SHUTDOWNS);
}

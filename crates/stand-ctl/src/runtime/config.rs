use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub show_help: bool,
    pub run_seconds: Option<u64>,
    pub stand_path: Option<PathBuf>,
    pub sequence_path: Option<PathBuf>,
    pub labjack_addr: Option<String>,
    pub simulate_noise: f64,
    pub telemetry_path: Option<PathBuf>,
    pub audit_path: Option<PathBuf>,
    pub metrics_addr: Option<String>,
    pub json_logs: bool,
    pub log_dir: Option<PathBuf>,
    pub auto_start: bool,
    pub console: bool,
    pub interval_ms: Option<u64>,
    pub high_speed_interval_ms: Option<u64>,
    pub window: Option<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            show_help: false,
            run_seconds: None,
            stand_path: None,
            sequence_path: None,
            labjack_addr: None,
            simulate_noise: 0.0,
            telemetry_path: None,
            audit_path: None,
            metrics_addr: None,
            json_logs: false,
            log_dir: None,
            auto_start: false,
            console: true,
            interval_ms: None,
            high_speed_interval_ms: None,
            window: None,
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let args: Vec<String> = std::env::args().collect();
        Self::from_args(&args)
    }

    pub fn from_args(args: &[String]) -> Self {
        let mut cfg = RuntimeConfig::default();
        let mut i = 1;
        while i < args.len() {
            let value = args.get(i + 1);
            match (args[i].as_str(), value) {
                ("--run-seconds", Some(v)) => {
                    cfg.run_seconds = v.parse::<u64>().ok();
                    i += 1;
                }
                ("--stand", Some(v)) => {
                    cfg.stand_path = Some(PathBuf::from(v));
                    i += 1;
                }
                ("--sequence", Some(v)) => {
                    cfg.sequence_path = Some(PathBuf::from(v));
                    i += 1;
                }
                ("--labjack", Some(v)) => {
                    cfg.labjack_addr = Some(v.clone());
                    i += 1;
                }
                ("--simulate-noise", Some(v)) => {
                    cfg.simulate_noise = v.parse().unwrap_or(0.0);
                    i += 1;
                }
                ("--telemetry-log", Some(v)) => {
                    cfg.telemetry_path = Some(PathBuf::from(v));
                    i += 1;
                }
                ("--audit-log", Some(v)) => {
                    cfg.audit_path = Some(PathBuf::from(v));
                    i += 1;
                }
                ("--metrics-addr", Some(v)) => {
                    cfg.metrics_addr = Some(v.clone());
                    i += 1;
                }
                ("--log-dir", Some(v)) => {
                    cfg.log_dir = Some(PathBuf::from(v));
                    i += 1;
                }
                ("--interval-ms", Some(v)) => {
                    cfg.interval_ms = v.parse().ok();
                    i += 1;
                }
                ("--high-speed-interval-ms", Some(v)) => {
                    cfg.high_speed_interval_ms = v.parse().ok();
                    i += 1;
                }
                ("--window", Some(v)) => {
                    cfg.window = v.parse().ok();
                    i += 1;
                }
                ("--json-logs", _) => {
                    cfg.json_logs = true;
                }
                ("--auto-start", _) => {
                    cfg.auto_start = true;
                }
                ("--no-console", _) => {
                    cfg.console = false;
                }
                ("--help" | "-h", _) => {
                    cfg.show_help = true;
                    break;
                }
                _ => {}
            }
            i += 1;
        }
        cfg
    }

    pub fn print_help() {
        println!(
            r#"stand-ctl - Test stand telemetry, redline monitoring and autosequencer

USAGE:
    stand-ctl [OPTIONS]

OPTIONS:
    --stand <PATH>                 Stand definition (JSON) [default: built-in Maelstrom stand]
    --sequence <PATH>              Autosequence file (CSV, or JSON with a .json extension)
    --labjack <ADDR>               LabJack T7 Modbus TCP address (e.g. 192.168.1.10:502)
                                   [default: simulated hardware]
    --simulate-noise <VOLTS>       Peak noise added to simulated analog inputs [default: 0]
    --telemetry-log <PATH>         Append telemetry records to a JSONL file
    --audit-log <PATH>             Enable audit logging to specified JSONL file
    --metrics-addr <ADDR>          Enable Prometheus metrics server on address (e.g., 0.0.0.0:9090)
    --json-logs                    Output logs in JSON format (for log aggregation)
    --log-dir <DIR>                Also write daily-rolling log files to this directory
    --run-seconds <SECS>           Run for a fixed duration, then shut down and exit
    --auto-start                   Start the sequence immediately
    --no-console                   Do not read operator commands from stdin
    --interval-ms <MS>             Normal sampling interval [default: 500]
    --high-speed-interval-ms <MS>  Sampling interval while a sequence runs [default: 100]
    --window <N>                   Redline median window length [default: 5]
    -h, --help                     Print this help message

CONSOLE COMMANDS:
    start | stop                   Start or abort the loaded sequence
    shutdown                       Emergency shutdown (all valves to safe state)
    reset                          Re-arm after a shutdown
    open <VALVE> | close <VALVE>   Manual valve command
    high | normal                  Data logger speed
    connect                        Reconnect to the hardware
    status                         Print loop status
    quit                           Shut down and exit

ENVIRONMENT VARIABLES:
    RUST_LOG                       Set log filter (e.g., RUST_LOG=debug,stand_core=trace)

EXAMPLES:
    # Bench run against the simulator with metrics
    stand-ctl --sequence cold_flow.csv --metrics-addr 0.0.0.0:9090

    # Hot fire with full records
    stand-ctl --labjack 192.168.1.10 --sequence hot_fire.csv \
        --telemetry-log data/hot_fire.jsonl --audit-log data/audit.jsonl --json-logs
"#
        );
    }
}

//! Operator console on stdin. Commands are queued for the loop thread and
//! applied between ticks; `status` and `quit` are handled here.

use stand_core::{CommandParseError, OperatorCommand, StandSnapshot, StateExchange};
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleInput {
    Command(OperatorCommand),
    Status,
    Quit,
}

pub fn parse_line(line: &str) -> Result<Option<ConsoleInput>, CommandParseError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let input = match trimmed.to_ascii_lowercase().as_str() {
        "status" => ConsoleInput::Status,
        "quit" | "exit" => ConsoleInput::Quit,
        _ => ConsoleInput::Command(trimmed.parse()?),
    };
    Ok(Some(input))
}

pub fn format_status(snap: &StandSnapshot) -> String {
    format!(
        "tick {} | hardware {} | logging {} | sequencer {} ({} steps left) | shutdown {} (episodes {}) | read faults {} | trips {} | last tick {} us",
        snap.tick,
        if snap.connected { "connected" } else { "CONNECTION MISSING" },
        if snap.high_speed { "high-speed" } else { "normal" },
        if snap.sequencer_running { "running" } else { "idle" },
        snap.steps_remaining,
        if snap.shutdown_latched { "LATCHED" } else { "armed" },
        snap.shutdown_episodes,
        snap.read_faults,
        snap.redline_trips,
        snap.last_tick_us,
    )
}

/// Read stdin until EOF or `quit`. EOF leaves the loop running.
pub fn spawn_console(
    commands: Sender<OperatorCommand>,
    exchange: Arc<StateExchange>,
    stop: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "console read failed");
                    break;
                }
            };
            match parse_line(&line) {
                Ok(None) => {}
                Ok(Some(ConsoleInput::Status)) => println!("{}", format_status(&exchange.read_state())),
                Ok(Some(ConsoleInput::Quit)) => {
                    info!("quit requested from console");
                    stop.store(true, Ordering::Relaxed);
                    break;
                }
                Ok(Some(ConsoleInput::Command(cmd))) => {
                    if commands.send(cmd).is_err() {
                        break;
                    }
                }
                Err(e) => println!("{e}"),
            }
            if stop.load(Ordering::Relaxed) {
                break;
            }
        }
    })
}

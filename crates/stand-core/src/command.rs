use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Operator actions applied by the loop at a tick boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorCommand {
    StartSequence,
    StopSequence,
    EmergencyShutdown,
    /// Clear a latched shutdown episode.
    Rearm,
    SetValve { name: String, open: bool },
    HighSpeed,
    NormalSpeed,
    Reconnect,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandParseError {
    #[error("empty command")]
    Empty,
    #[error("unknown command '{0}'")]
    Unknown(String),
    #[error("'{0}' needs a valve name")]
    MissingValve(String),
}

impl FromStr for OperatorCommand {
    type Err = CommandParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut words = s.split_whitespace();
        let verb = words.next().ok_or(CommandParseError::Empty)?.to_ascii_lowercase();
        let cmd = match verb.as_str() {
            "start" => Self::StartSequence,
            "stop" => Self::StopSequence,
            "shutdown" | "estop" => Self::EmergencyShutdown,
            "reset" | "rearm" => Self::Rearm,
            "high" => Self::HighSpeed,
            "normal" => Self::NormalSpeed,
            "connect" => Self::Reconnect,
            "open" | "close" => {
                let name = words
                    .next()
                    .ok_or_else(|| CommandParseError::MissingValve(verb.clone()))?;
                Self::SetValve {
                    name: name.to_string(),
                    open: verb == "open",
                }
            }
            _ => return Err(CommandParseError::Unknown(verb)),
        };
        Ok(cmd)
    }
}

impl fmt::Display for OperatorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StartSequence => f.write_str("start"),
            Self::StopSequence => f.write_str("stop"),
            Self::EmergencyShutdown => f.write_str("shutdown"),
            Self::Rearm => f.write_str("reset"),
            Self::SetValve { name, open: true } => write!(f, "open {name}"),
            Self::SetValve { name, open: false } => write!(f, "close {name}"),
            Self::HighSpeed => f.write_str("high"),
            Self::NormalSpeed => f.write_str("normal"),
            Self::Reconnect => f.write_str("connect"),
        }
    }
}

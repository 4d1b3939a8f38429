use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("hardware not connected")]
    NotConnected,
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("unknown channel: {0}")]
    UnknownChannel(String),
    #[error("I/O error on {channel}: {message}")]
    Io { channel: String, message: String },
    #[error("timed out on {0}")]
    Timeout(String),
}

/// Synchronous access to the stand's analog inputs and digital outputs.
///
/// Every call is independent: an error on one channel says nothing about
/// the others, and callers must treat it as non-fatal to the loop.
pub trait HardwareProvider: Send {
    fn connect(&mut self) -> Result<(), ProviderError>;
    fn is_connected(&self) -> bool;
    /// Raw voltage on an analog input.
    fn read_analog(&mut self, channel: &str) -> Result<f64, ProviderError>;
    /// Drive a digital output; `true` energizes the line.
    fn write_digital(&mut self, channel: &str, bit: bool) -> Result<(), ProviderError>;
    fn close(&mut self);
}

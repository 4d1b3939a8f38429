//! LabJack T7 over Modbus TCP.
//!
//! The T7 exposes analog inputs as IEEE-754 float32 values spread over two
//! holding registers (high word first) and digital lines as single
//! registers holding 0 or 1.

use stand_core::{HardwareProvider, ProviderError};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tracing::{debug, info, warn};

/// Default Modbus TCP port on the T7.
pub const MODBUS_PORT: u16 = 502;

const DIO_BASE: u16 = 2000;

/// Starting register of an analog input name such as `AIN3`.
pub fn analog_register(channel: &str) -> Option<u16> {
    let n: u16 = channel.strip_prefix("AIN")?.parse().ok()?;
    (n < 14).then_some(n * 2)
}

/// Register of a digital line: `FIO0-7`, `EIO0-7`, `CIO0-3`, `MIO0-2` or
/// the flat `DIO0-22` names.
pub fn digital_register(channel: &str) -> Option<u16> {
    let banks: [(&str, u16, u16); 5] = [
        ("FIO", 0, 8),
        ("EIO", 8, 8),
        ("CIO", 16, 4),
        ("MIO", 20, 3),
        ("DIO", 0, 23),
    ];
    banks.iter().find_map(|&(prefix, offset, width)| {
        let n: u16 = channel.strip_prefix(prefix)?.parse().ok()?;
        (n < width).then_some(DIO_BASE + offset + n)
    })
}

/// Big-endian word order float32.
pub fn decode_f32(words: &[u16]) -> Option<f32> {
    match words {
        [hi, lo, ..] => Some(f32::from_bits(((*hi as u32) << 16) | *lo as u32)),
        _ => None,
    }
}

fn is_link_failure(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

/// Blocking provider over an owned single-threaded Tokio runtime.
///
/// A transport failure drops the Modbus context, so the provider reports
/// disconnected until `connect` succeeds again.
pub struct LabJackModbus {
    addr: String,
    timeout: Duration,
    runtime: Runtime,
    ctx: Option<Context>,
}

impl LabJackModbus {
    pub fn new(addr: impl Into<String>) -> Result<Self, ProviderError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| ProviderError::Connect(format!("tokio runtime: {e}")))?;
        Ok(Self {
            addr: addr.into(),
            timeout: Duration::from_millis(500),
            runtime,
            ctx: None,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn socket_addr(&self) -> Result<SocketAddr, ProviderError> {
        let with_port = if self.addr.contains(':') {
            self.addr.clone()
        } else {
            format!("{}:{MODBUS_PORT}", self.addr)
        };
        with_port
            .parse()
            .map_err(|e| ProviderError::Connect(format!("invalid address {}: {e}", self.addr)))
    }

    fn fail(&mut self, channel: &str, e: io::Error) -> ProviderError {
        if is_link_failure(&e) {
            warn!(addr = %self.addr, "modbus link lost: {e}");
            self.ctx = None;
        }
        ProviderError::Io {
            channel: channel.to_string(),
            message: e.to_string(),
        }
    }

    fn timed_out(&mut self, channel: &str) -> ProviderError {
        warn!(addr = %self.addr, channel, "modbus request timed out; dropping connection");
        self.ctx = None;
        ProviderError::Timeout(channel.to_string())
    }
}

impl HardwareProvider for LabJackModbus {
    fn connect(&mut self) -> Result<(), ProviderError> {
        let socket_addr = self.socket_addr()?;
        let result = self
            .runtime
            .block_on(tokio::time::timeout(self.timeout, tcp::connect(socket_addr)));
        match result {
            Ok(Ok(ctx)) => {
                info!("connected to LabJack at {socket_addr}");
                self.ctx = Some(ctx);
                Ok(())
            }
            Ok(Err(e)) => Err(ProviderError::Connect(format!("{socket_addr}: {e}"))),
            Err(_) => Err(ProviderError::Connect(format!("{socket_addr}: timed out"))),
        }
    }

    fn is_connected(&self) -> bool {
        self.ctx.is_some()
    }

    fn read_analog(&mut self, channel: &str) -> Result<f64, ProviderError> {
        let register = analog_register(channel)
            .ok_or_else(|| ProviderError::UnknownChannel(channel.to_string()))?;
        let ctx = self.ctx.as_mut().ok_or(ProviderError::NotConnected)?;
        let result = self.runtime.block_on(tokio::time::timeout(
            self.timeout,
            ctx.read_holding_registers(register, 2),
        ));
        let words = match result {
            Ok(Ok(words)) => words,
            Ok(Err(e)) => return Err(self.fail(channel, e)),
            Err(_) => return Err(self.timed_out(channel)),
        };
        let volts = decode_f32(&words).ok_or_else(|| ProviderError::Io {
            channel: channel.to_string(),
            message: format!("short response ({} registers)", words.len()),
        })?;
        Ok(f64::from(volts))
    }

    fn write_digital(&mut self, channel: &str, bit: bool) -> Result<(), ProviderError> {
        let register = digital_register(channel)
            .ok_or_else(|| ProviderError::UnknownChannel(channel.to_string()))?;
        let ctx = self.ctx.as_mut().ok_or(ProviderError::NotConnected)?;
        let result = self.runtime.block_on(tokio::time::timeout(
            self.timeout,
            ctx.write_single_register(register, u16::from(bit)),
        ));
        match result {
            Ok(Ok(())) => {
                debug!(channel, register, bit, "digital write");
                Ok(())
            }
            Ok(Err(e)) => Err(self.fail(channel, e)),
            Err(_) => Err(self.timed_out(channel)),
        }
    }

    fn close(&mut self) {
        if let Some(mut ctx) = self.ctx.take() {
            let timeout = self.timeout;
            if let Err(e) = self
                .runtime
                .block_on(async { tokio::time::timeout(timeout, ctx.disconnect()).await })
                .unwrap_or_else(|_| Err(io::Error::from(io::ErrorKind::TimedOut)))
            {
                debug!("modbus disconnect: {e}");
            }
            info!(addr = %self.addr, "LabJack connection closed");
        }
    }
}

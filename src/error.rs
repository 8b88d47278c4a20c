//! Error types for the DPM control engine.

use thiserror::Error;

/// Failure of a single bus transaction.
///
/// These never leave the bus owner: discovery retries them, the poller folds them into the
/// per-device error counter and the write drain logs and drops them.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
    #[error("Serial communication error: {0:?}")]
    Serial(embedded_io::ErrorKind),
    #[error("Communication timeout")]
    Timeout,
    #[error("Device rejected request with exception code {0:#04x}")]
    Nak(u8),
    #[error("Modbus protocol error: {0}")]
    Modbus(rmodbus::ErrorKind),
    #[error("Invalid response received")]
    InvalidResponse,
    #[error("Response did not fit the receive buffer")]
    BufferOverflow,
}

impl From<rmodbus::ErrorKind> for BusError {
    fn from(err: rmodbus::ErrorKind) -> Self {
        BusError::Modbus(err)
    }
}

/// Rejection of a command at the intake boundary. No state is mutated when one of these is returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("Device address {0} is outside the device table")]
    InvalidAddress(u8),
    #[error("Value {value} for {field} exceeds maximum {max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        max: u32,
    },
    #[error("Command queue is full")]
    QueueFull,
    #[error("Device {0} is off or defect and does not accept commands")]
    DeviceUnavailable(u8),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Settings storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Settings serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

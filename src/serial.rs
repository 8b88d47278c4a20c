//! Host serial port as a bus transport, via the `serialport` crate.

use crate::bus::{BUS_CONFIGS, Framing, Reconfigure, SerialConfig};
use serialport::{ClearBuffer, DataBits, Parity, SerialPort, StopBits};
use std::time::Duration;
use thiserror::Error;

/// I/O failure on the host port.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct PortError(#[from] std::io::Error);

impl From<serialport::Error> for PortError {
    fn from(e: serialport::Error) -> Self {
        Self(e.into())
    }
}

impl embedded_io::Error for PortError {
    fn kind(&self) -> embedded_io::ErrorKind {
        use embedded_io::ErrorKind as K;
        use std::io::ErrorKind as Io;
        match self.0.kind() {
            Io::NotFound => K::NotFound,
            Io::PermissionDenied => K::PermissionDenied,
            Io::BrokenPipe => K::BrokenPipe,
            Io::InvalidInput => K::InvalidInput,
            Io::InvalidData => K::InvalidData,
            Io::TimedOut => K::TimedOut,
            Io::Interrupted => K::Interrupted,
            Io::Unsupported => K::Unsupported,
            Io::OutOfMemory => K::OutOfMemory,
            _ => K::Other,
        }
    }
}

/// A `serialport` handle usable as an RTU link interface.
pub struct HostPort(Box<dyn SerialPort>);

impl HostPort {
    /// Open `path` with the first bus configuration. Discovery switches it as needed.
    pub fn open(path: &str, timeout: Duration) -> Result<Self, PortError> {
        let first = &BUS_CONFIGS[0];
        let port = serialport::new(path, first.baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(timeout)
            .open()?;
        Ok(Self(port))
    }

    pub fn name(&self) -> Option<String> {
        self.0.name()
    }
}

fn line_settings(framing: Framing) -> (DataBits, Parity, StopBits) {
    match framing {
        Framing::EightNoneOne => (DataBits::Eight, Parity::None, StopBits::One),
        Framing::EightEvenOne => (DataBits::Eight, Parity::Even, StopBits::One),
        Framing::EightOddOne => (DataBits::Eight, Parity::Odd, StopBits::One),
        Framing::EightNoneTwo => (DataBits::Eight, Parity::None, StopBits::Two),
    }
}

impl embedded_io::ErrorType for HostPort {
    type Error = PortError;
}

impl embedded_io::Read for HostPort {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        Ok(std::io::Read::read(&mut self.0, buf)?)
    }
}

impl embedded_io::Write for HostPort {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        Ok(std::io::Write::write(&mut self.0, buf)?)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(std::io::Write::flush(&mut self.0)?)
    }
}

impl Reconfigure for HostPort {
    fn reconfigure(&mut self, config: &SerialConfig) -> Result<(), Self::Error> {
        let (data_bits, parity, stop_bits) = line_settings(config.framing);
        self.0.set_baud_rate(config.baud)?;
        self.0.set_data_bits(data_bits)?;
        self.0.set_parity(parity)?;
        self.0.set_stop_bits(stop_bits)?;
        Ok(())
    }

    fn discard_input(&mut self) -> Result<(), Self::Error> {
        Ok(self.0.clear(ClearBuffer::Input)?)
    }
}

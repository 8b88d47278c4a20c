//! The serial bus link: configuration list and single Modbus RTU transactions.
//!
//! Everything here is blocking and bounded by the port's read timeout. Only the bus owner
//! holds a [`BusLink`]; every other task goes through the command queue.

use crate::error::BusError;
use embedded_io::Error;
use strum_macros::{Display, EnumIter};
use tracing::debug;

/// Largest block we ever read in one transaction.
pub const MAX_BLOCK: usize = 16;

/// Register values returned by a block read.
pub type Registers = heapless::Vec<u16, MAX_BLOCK>;

/// Character framing of the serial line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter)]
pub enum Framing {
    #[strum(to_string = "8N1")]
    EightNoneOne,
    #[strum(to_string = "8E1")]
    EightEvenOne,
    #[strum(to_string = "8O1")]
    EightOddOne,
    #[strum(to_string = "8N2")]
    EightNoneTwo,
}

/// One (baud rate, framing) pair tried during discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialConfig {
    pub baud: u32,
    pub framing: Framing,
    pub name: &'static str,
}

impl SerialConfig {
    pub const fn new(baud: u32, framing: Framing, name: &'static str) -> Self {
        Self {
            baud,
            framing,
            name,
        }
    }
}

/// Configurations tried during discovery, most likely first. Order matters.
pub const BUS_CONFIGS: [SerialConfig; 5] = [
    SerialConfig::new(57600, Framing::EightNoneOne, "57600 8N1"),
    SerialConfig::new(9600, Framing::EightNoneOne, "9600 8N1"),
    SerialConfig::new(19200, Framing::EightNoneOne, "19200 8N1"),
    SerialConfig::new(38400, Framing::EightNoneOne, "38400 8N1"),
    SerialConfig::new(115200, Framing::EightNoneOne, "115200 8N1"),
];

/// Human readable name of a configuration index, for UIs and logs.
pub fn config_name(index: Option<usize>) -> &'static str {
    index
        .and_then(|idx| BUS_CONFIGS.get(idx))
        .map_or("unknown", |cfg| cfg.name)
}

/// The bus transport the engine depends on.
pub trait BusLink {
    /// Switch the line to `config`. Implementations skip the switch if it is already active.
    fn apply(&mut self, config: &SerialConfig) -> Result<(), BusError>;

    /// Read `count` holding registers starting at `start`.
    fn read_block(&mut self, unit: u8, start: u16, count: u16) -> Result<Registers, BusError>;

    /// Write a single holding register.
    fn write_register(&mut self, unit: u8, register: u16, value: u16) -> Result<(), BusError>;
}

/// A byte transport whose line settings can be changed at runtime.
pub trait Reconfigure: embedded_io::ErrorType {
    /// Apply baud rate and framing.
    fn reconfigure(&mut self, config: &SerialConfig) -> Result<(), Self::Error>;

    /// Drop any stale bytes still sitting in the receive buffer.
    fn discard_input(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Modbus RTU master on top of any interface which implements [embedded_io::Read],
/// [embedded_io::Write] and [Reconfigure].
pub struct RtuLink<S> {
    interface: S,
    active: Option<SerialConfig>,
}

impl<S> RtuLink<S>
where
    S: embedded_io::Read + embedded_io::Write + Reconfigure,
{
    pub fn new(interface: S) -> Self {
        Self {
            interface,
            active: None,
        }
    }

    /// The configuration currently applied to the line, if any.
    pub fn active_config(&self) -> Option<&SerialConfig> {
        self.active.as_ref()
    }

    pub fn interface(&self) -> &S {
        &self.interface
    }

    pub fn into_inner(self) -> S {
        self.interface
    }

    /// Send `request` and collect the reply into `response`.
    ///
    /// Stops once `expected_len` bytes arrived, an exception frame is complete, or the port
    /// times out after delivering at least one byte.
    fn transact(
        &mut self,
        request: &[u8],
        expected_len: usize,
        response: &mut Vec<u8>,
    ) -> Result<(), BusError> {
        self.interface
            .discard_input()
            .map_err(|e| BusError::Serial(e.kind()))?;
        self.interface
            .write_all(request)
            .map_err(|e| BusError::Serial(e.kind()))?;
        self.interface
            .flush()
            .map_err(|e| BusError::Serial(e.kind()))?;

        let mut temp_buf = [0u8; 32];
        loop {
            match self.interface.read(&mut temp_buf) {
                Ok(0) => {
                    if response.is_empty() {
                        return Err(BusError::Timeout);
                    }
                    break;
                }
                Ok(bytes_read) => {
                    response.extend_from_slice(&temp_buf[..bytes_read]);
                    if response.len() > 2 * expected_len.max(8) {
                        return Err(BusError::BufferOverflow);
                    }
                    // Exception replies are unit + function|0x80 + code + 2 CRC bytes.
                    if response.len() >= 5 && response[1] & 0x80 != 0 {
                        break;
                    }
                    if response.len() >= expected_len {
                        break;
                    }
                }
                Err(e) => {
                    let kind = e.kind();
                    match kind {
                        embedded_io::ErrorKind::TimedOut | embedded_io::ErrorKind::Other
                            if !response.is_empty() =>
                        {
                            break;
                        }
                        embedded_io::ErrorKind::TimedOut => return Err(BusError::Timeout),
                        _ => return Err(BusError::Serial(kind)),
                    }
                }
            }
        }

        if response.len() >= 3 && response[0] == request[0] && response[1] & 0x80 != 0 {
            return Err(BusError::Nak(response[2]));
        }
        Ok(())
    }
}

impl<S> BusLink for RtuLink<S>
where
    S: embedded_io::Read + embedded_io::Write + Reconfigure,
{
    fn apply(&mut self, config: &SerialConfig) -> Result<(), BusError> {
        if self.active.as_ref() == Some(config) {
            return Ok(());
        }
        self.interface
            .reconfigure(config)
            .map_err(|e| BusError::Serial(e.kind()))?;
        debug!(config = config.name, "bus reconfigured");
        self.active = Some(*config);
        Ok(())
    }

    fn read_block(&mut self, unit: u8, start: u16, count: u16) -> Result<Registers, BusError> {
        if count as usize > MAX_BLOCK {
            return Err(BusError::BufferOverflow);
        }
        let mut request = Vec::new();
        let mut req = rmodbus::client::ModbusRequest::new(unit, rmodbus::ModbusProto::Rtu);
        req.generate_get_holdings(start, count, &mut request)?;

        // unit_id + function + byte_count + 2 bytes per register + 2 CRC
        let expected_len = 5 + 2 * count as usize;
        let mut response = Vec::with_capacity(expected_len);
        self.transact(&request, expected_len, &mut response)?;

        let mut parsed: Vec<u16> = Vec::new();
        req.parse_u16(&response, &mut parsed)
            .map_err(|_| BusError::InvalidResponse)?;

        let mut values = Registers::new();
        for value in parsed.into_iter().take(count as usize) {
            values.push(value).map_err(|_| BusError::BufferOverflow)?;
        }
        if values.len() != count as usize {
            return Err(BusError::InvalidResponse);
        }
        Ok(values)
    }

    fn write_register(&mut self, unit: u8, register: u16, value: u16) -> Result<(), BusError> {
        let mut request = Vec::new();
        let mut req = rmodbus::client::ModbusRequest::new(unit, rmodbus::ModbusProto::Rtu);
        req.generate_set_holding(register, value, &mut request)?;

        let mut response = Vec::with_capacity(request.len());
        self.transact(&request, request.len(), &mut response)?;

        // A successful single register write echoes the request.
        if request.as_slice() != response.as_slice() {
            Err(BusError::InvalidResponse)
        } else {
            Ok(())
        }
    }
}

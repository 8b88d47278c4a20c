//! Simulated multi-device bus for unit tests. Records every transaction in order.

use crate::bus::{BUS_CONFIGS, BusLink, Registers, SerialConfig};
use crate::error::BusError;
use crate::register::{OutputState, STATUS_BLOCK_LEN, STATUS_BLOCK_START};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transaction {
    Apply { config: usize },
    Read { unit: u8, start: u16, count: u16 },
    Write { unit: u8, register: u16, value: u16 },
}

#[derive(Debug, Clone, Default)]
struct SimDevice {
    configs: Vec<usize>,
    status: [u16; STATUS_BLOCK_LEN as usize],
    holding: BTreeMap<u16, u16>,
    failing_reads: usize,
    offline: bool,
}

#[derive(Debug, Default)]
pub struct SimBus {
    devices: BTreeMap<u8, SimDevice>,
    active: Option<usize>,
    log: Vec<Transaction>,
}

impl SimBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A device answering only under `BUS_CONFIGS[config]`.
    pub fn add_device(&mut self, unit: u8, config: usize) {
        self.add_device_multi(unit, &[config]);
    }

    pub fn add_device_multi(&mut self, unit: u8, configs: &[usize]) {
        self.devices.insert(
            unit,
            SimDevice {
                configs: configs.to_vec(),
                ..Default::default()
            },
        );
    }

    pub fn set_output(&mut self, unit: u8, output: OutputState) {
        self.device(unit).status[0] = output as u16;
    }

    pub fn set_measurement(&mut self, unit: u8, voltage_raw: u16, current_raw: u16) {
        let device = self.device(unit);
        device.status[1] = voltage_raw;
        device.status[2] = current_raw;
    }

    pub fn set_temperature(&mut self, unit: u8, celsius: u16) {
        self.device(unit).status[3] = celsius;
    }

    /// Stop answering entirely.
    pub fn set_offline(&mut self, unit: u8, offline: bool) {
        self.device(unit).offline = offline;
    }

    /// Time out the next `count` reads addressed to `unit`.
    pub fn fail_next_reads(&mut self, unit: u8, count: usize) {
        self.device(unit).failing_reads = count;
    }

    pub fn holding(&self, unit: u8, register: u16) -> Option<u16> {
        self.devices
            .get(&unit)
            .and_then(|device| device.holding.get(&register).copied())
    }

    pub fn log(&self) -> &[Transaction] {
        &self.log
    }

    pub fn clear_log(&mut self) {
        self.log.clear();
    }

    /// Logged writes as (unit, register, value).
    pub fn writes(&self) -> Vec<(u8, u16, u16)> {
        self.log
            .iter()
            .filter_map(|t| match *t {
                Transaction::Write {
                    unit,
                    register,
                    value,
                } => Some((unit, register, value)),
                _ => None,
            })
            .collect()
    }

    fn device(&mut self, unit: u8) -> &mut SimDevice {
        self.devices.entry(unit).or_default()
    }

    fn answering(&mut self, unit: u8) -> Option<&mut SimDevice> {
        let active = self.active?;
        self.devices
            .get_mut(&unit)
            .filter(|device| !device.offline && device.configs.contains(&active))
    }
}

impl BusLink for SimBus {
    fn apply(&mut self, config: &SerialConfig) -> Result<(), BusError> {
        let index = BUS_CONFIGS.iter().position(|c| c == config);
        if index != self.active {
            self.active = index;
            if let Some(config) = index {
                self.log.push(Transaction::Apply { config });
            }
        }
        Ok(())
    }

    fn read_block(&mut self, unit: u8, start: u16, count: u16) -> Result<Registers, BusError> {
        self.log.push(Transaction::Read { unit, start, count });
        let device = self.answering(unit).ok_or(BusError::Timeout)?;
        if device.failing_reads > 0 {
            device.failing_reads -= 1;
            return Err(BusError::Timeout);
        }
        let offset = start
            .checked_sub(STATUS_BLOCK_START.into())
            .ok_or(BusError::Nak(0x02))? as usize;
        let words = device
            .status
            .get(offset..offset + count as usize)
            .ok_or(BusError::Nak(0x02))?;
        Registers::from_slice(words).map_err(|_| BusError::BufferOverflow)
    }

    fn write_register(&mut self, unit: u8, register: u16, value: u16) -> Result<(), BusError> {
        self.log.push(Transaction::Write {
            unit,
            register,
            value,
        });
        let device = self.answering(unit).ok_or(BusError::Timeout)?;
        device.holding.insert(register, value);
        Ok(())
    }
}

//! This module is used to define the registers on the DPM modules.

use strum_macros::EnumIter;

/// Holding registers of a DPM8624-style module.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u16)]
pub enum DpmRegister {
    /// __R/W__ - Voltage setting.
    ///
    /// Value is u16 in centi-volts. E.g. 3.00V => `300`.
    VoltageSet = 0x0000,
    /// __R/W__ - Current setting.
    ///
    /// Value is u16 in milli-amps. E.g. 1.5A => `1500`.
    CurrentSet = 0x0001,
    /// __R/W__ - Switched output.
    /// * `0` - Off.
    /// * `1` - On.
    OutputEnable = 0x0002,
    /// __R__ - Output state, first word of the status block.
    ///
    /// See [`OutputState`].
    OutputState = 0x1000,
    /// __R__ - Output voltage display value.
    VoltageOut = 0x1001,
    /// __R__ - Output current display value.
    CurrentOut = 0x1002,
    /// __R__ - Module temperature in °C.
    Temperature = 0x1003,
}

impl From<DpmRegister> for u16 {
    fn from(value: DpmRegister) -> Self {
        value as u16
    }
}

/// Start of the block read used for polling.
pub const STATUS_BLOCK_START: DpmRegister = DpmRegister::OutputState;
/// Length of the block read used for polling. Words 4-7 are reserved.
pub const STATUS_BLOCK_LEN: u16 = 8;
/// Presence probe used by discovery. One word is enough to prove the device answers.
pub const PROBE_LEN: u16 = 1;

/// Output state as reported by the first word of the status block.
#[derive(Debug, EnumIter, PartialEq, Eq, Clone, Copy, Default)]
#[repr(u16)]
pub enum OutputState {
    /// Output disabled.
    #[default]
    Off = 0x00,
    /// Output enabled, no load current flowing.
    On = 0x01,
    /// Output enabled and load current detected.
    Loaded = 0x02,
}

impl From<u16> for OutputState {
    fn from(value: u16) -> Self {
        match value {
            0x00 => OutputState::Off,
            0x02 => OutputState::Loaded,
            // Anything non-zero means the output is switched on.
            _ => OutputState::On,
        }
    }
}

impl OutputState {
    /// The module reports its output switched on, with or without load.
    pub fn is_on(&self) -> bool {
        !matches!(self, OutputState::Off)
    }

    /// Load current is flowing.
    pub fn current_detected(&self) -> bool {
        matches!(self, OutputState::Loaded)
    }
}

/// Used to be less ambiguous about whether the output is switched on or off.
#[repr(u16)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum State {
    /// Disabled.
    #[default]
    Off = 0x00,
    /// Enabled.
    On = 0x01,
}

impl From<State> for bool {
    fn from(value: State) -> Self {
        match value {
            State::Off => false,
            State::On => true,
        }
    }
}

impl From<bool> for State {
    fn from(value: bool) -> Self {
        match value {
            true => State::On,
            false => State::Off,
        }
    }
}

/// Measured values decoded from one status block read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusBlock {
    pub output: OutputState,
    pub voltage_raw: u16,
    pub current_raw: u16,
    pub temperature_raw: u16,
}

impl StatusBlock {
    /// Decode the block, returning `None` if fewer than the four meaningful words arrived.
    pub fn from_words(words: &[u16]) -> Option<Self> {
        match words {
            [state, voltage, current, temperature, ..] => Some(Self {
                output: OutputState::from(*state),
                voltage_raw: *voltage,
                current_raw: *current,
                temperature_raw: *temperature,
            }),
            _ => None,
        }
    }
}

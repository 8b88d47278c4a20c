//! Engine configuration. Every field has a default, so an empty JSON object is a valid config.

use crate::device::MAX_DEVICES;
use crate::error::ConfigError;
use crate::scaling::ScalingFactors;
use crate::time::Duration;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Size of the device table, addresses `1..=max_devices`.
    pub max_devices: u8,
    /// Serial read timeout for one transaction.
    pub transaction_timeout_ms: u64,
    /// Extra probe attempts per address and configuration during discovery.
    pub retries: u8,
    pub bus_cycle_ms: u64,
    pub poll_period_ms: u64,
    pub fsm_period_ms: u64,
    pub command_queue_capacity: usize,
    /// Settle time for the on/current-present/current-absent conditions.
    pub debounce_ms: u64,
    /// Consecutive failed polls that mark a device as defect.
    pub defect_threshold: u8,
    /// Temperature, in °C, that forces `TempHigh`.
    pub temp_warn: u16,
    /// Temperature, in °C, that forces `Overheat`.
    pub temp_crit: u16,
    pub safe_voltage: u16,
    pub safe_current: u16,
    /// Allowed overrun past the runtime in energy mode, as a percentage of the runtime.
    pub energy_timeout_percent: u32,
    pub anode_threshold_step_joules: f64,
    pub scaling: ScalingFactors,
    pub voltage_set_max: u16,
    pub current_set_max: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_devices: MAX_DEVICES as u8,
            transaction_timeout_ms: 150,
            retries: 1,
            bus_cycle_ms: 5,
            poll_period_ms: 200,
            fsm_period_ms: 100,
            command_queue_capacity: 16,
            debounce_ms: 2000,
            defect_threshold: 5,
            temp_warn: 45,
            temp_crit: 50,
            safe_voltage: 300,
            safe_current: 300,
            energy_timeout_percent: 10,
            anode_threshold_step_joules: 100_000.0,
            scaling: ScalingFactors::default(),
            voltage_set_max: 2000,
            current_set_max: 20000,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_devices == 0 || self.max_devices as usize > MAX_DEVICES {
            return Err(ConfigError::Invalid(format!(
                "max_devices must be between 1 and {MAX_DEVICES}, got {}",
                self.max_devices
            )));
        }
        let periods = [
            ("transaction_timeout_ms", self.transaction_timeout_ms),
            ("bus_cycle_ms", self.bus_cycle_ms),
            ("poll_period_ms", self.poll_period_ms),
            ("fsm_period_ms", self.fsm_period_ms),
        ];
        if let Some((name, _)) = periods.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("{name} must not be zero")));
        }
        if self.command_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "command_queue_capacity must not be zero".into(),
            ));
        }
        if !(self.anode_threshold_step_joules > 0.0 && self.anode_threshold_step_joules.is_finite())
        {
            return Err(ConfigError::Invalid(format!(
                "anode_threshold_step_joules must be positive, got {}",
                self.anode_threshold_step_joules
            )));
        }
        if self.scaling.voltage_mv_per_count == 0 || self.scaling.current_ma_per_count == 0 {
            return Err(ConfigError::Invalid(
                "scaling factors must not be zero".into(),
            ));
        }
        if self.temp_warn >= self.temp_crit {
            return Err(ConfigError::Invalid(format!(
                "temp_warn ({}) must be below temp_crit ({})",
                self.temp_warn, self.temp_crit
            )));
        }
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_ticks(self.debounce_ms)
    }

    pub fn poll_period(&self) -> Duration {
        Duration::from_ticks(self.poll_period_ms)
    }

    pub fn transaction_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.transaction_timeout_ms)
    }
}

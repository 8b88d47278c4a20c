//! Scaling factors for DPM measurements.
//!
//! The modules report voltage and current as raw register counts. This module converts
//! them to standard units and derives the electrical power used for energy integration.

use serde::{Deserialize, Serialize};

/// Scaling factors for converting raw register values to standard units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingFactors {
    /// Multiplier for voltage values (e.g., 10 means raw value is in centivolts, multiply by 10 to get mV)
    pub voltage_mv_per_count: u32,
    /// Multiplier for current values (e.g., 1 means raw value is already in mA)
    pub current_ma_per_count: u32,
}

impl Default for ScalingFactors {
    /// DPM8624: 0.01 V and 0.001 A per count.
    fn default() -> Self {
        Self {
            voltage_mv_per_count: 10,
            current_ma_per_count: 1,
        }
    }
}

impl ScalingFactors {
    /// Create a new `ScalingFactors` instance with the specified multipliers.
    pub const fn new(voltage_mv_per_count: u32, current_ma_per_count: u32) -> Self {
        Self {
            voltage_mv_per_count,
            current_ma_per_count,
        }
    }

    /// Convert raw voltage register value to millivolts, saturating at `u32::MAX`
    #[inline]
    pub const fn raw_to_voltage_mv(&self, raw: u16) -> u32 {
        (raw as u32).saturating_mul(self.voltage_mv_per_count)
    }

    /// Convert raw current register value to milliamps, saturating at `u32::MAX`
    #[inline]
    pub const fn raw_to_current_ma(&self, raw: u16) -> u32 {
        (raw as u32).saturating_mul(self.current_ma_per_count)
    }

    /// Voltage in volts.
    #[inline]
    pub fn volts(&self, raw: u16) -> f64 {
        self.raw_to_voltage_mv(raw) as f64 / 1000.0
    }

    /// Current in amps.
    #[inline]
    pub fn amps(&self, raw: u16) -> f64 {
        self.raw_to_current_ma(raw) as f64 / 1000.0
    }

    /// Electrical power in watts for a raw voltage/current pair.
    pub fn power_w(&self, voltage_raw: u16, current_raw: u16) -> f64 {
        self.volts(voltage_raw) * self.amps(current_raw)
    }
}

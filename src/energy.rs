//! Energy accounting: batch joules plus lifetime and anode kWh counters.

use crate::scaling::ScalingFactors;
use crate::time::{Instant, elapsed_since};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

pub const JOULES_PER_KWH: f64 = 3_600_000.0;

/// Which counter an operator reset targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum EnergyCounter {
    /// Energy of the current batch, in joules.
    #[strum(serialize = "batch", serialize = "temp")]
    Batch,
    /// Lifetime energy in kWh.
    Total,
    /// Energy since the last anode change in kWh.
    Anode,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnergyCounters {
    pub batch_joules: f64,
    pub total_kwh: f64,
    pub anode_kwh: f64,
    /// Batch energy at which an energy-mode run stops.
    pub target_joules: f64,
    /// Anode energy, in joules, that raises a service alert.
    pub anode_threshold_joules: f64,
    pub last_sample: Option<Instant>,
}

impl Default for EnergyCounters {
    fn default() -> Self {
        Self {
            batch_joules: 0.0,
            total_kwh: 0.0,
            anode_kwh: 0.0,
            target_joules: 0.0,
            anode_threshold_joules: 100_000.0,
            last_sample: None,
        }
    }
}

/// Outcome of one integration step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Integration {
    pub joules: f64,
    /// The anode service threshold was crossed and has been raised.
    pub service_due: bool,
}

impl EnergyCounters {
    /// Add the energy delivered since the previous sample.
    ///
    /// The first call after a reset only stamps the time.
    pub fn integrate(
        &mut self,
        voltage_raw: u16,
        current_raw: u16,
        scaling: &ScalingFactors,
        now: Instant,
        threshold_step_joules: f64,
    ) -> Integration {
        let Some(last) = self.last_sample.replace(now) else {
            return Integration {
                joules: 0.0,
                service_due: false,
            };
        };

        let dt_s = elapsed_since(now, last).ticks() as f64 / 1000.0;
        let joules = (scaling.power_w(voltage_raw, current_raw) * dt_s).max(0.0);
        self.batch_joules += joules;
        self.total_kwh += joules / JOULES_PER_KWH;
        self.anode_kwh += joules / JOULES_PER_KWH;

        let anode_joules = self.anode_kwh * JOULES_PER_KWH;
        let service_due = anode_joules > self.anode_threshold_joules;
        if service_due {
            self.raise_threshold(anode_joules, threshold_step_joules);
        }

        Integration {
            joules,
            service_due,
        }
    }

    /// Move the threshold past `anode_joules` in whole steps, so one crossing alerts once.
    fn raise_threshold(&mut self, anode_joules: f64, step_joules: f64) {
        if step_joules > 0.0 && step_joules.is_finite() {
            let behind = anode_joules - self.anode_threshold_joules;
            self.anode_threshold_joules += ((behind / step_joules).floor() + 1.0) * step_joules;
        } else {
            self.anode_threshold_joules = anode_joules;
        }
    }

    /// Zero exactly one counter.
    pub fn reset(&mut self, counter: EnergyCounter) {
        match counter {
            EnergyCounter::Batch => {
                self.batch_joules = 0.0;
                self.last_sample = None;
            }
            EnergyCounter::Total => self.total_kwh = 0.0,
            EnergyCounter::Anode => self.anode_kwh = 0.0,
        }
    }

    /// Forget the previous sample so the next integration only stamps the time.
    pub fn rearm(&mut self) {
        self.last_sample = None;
    }

    pub fn target_reached(&self) -> bool {
        self.batch_joules >= self.target_joules
    }
}

//! Current curve shaping: linear ramps and square-wave pulses applied during a run.

use crate::time::{Duration, Instant, elapsed_since};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

pub const DEFAULT_RAMP_MS: u32 = 5000;
pub const DEFAULT_PULSE_PERIOD_MS: u32 = 2000;

/// Shape of the set-current over time.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumIter, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[repr(u8)]
pub enum CurveKind {
    /// Hold the configured current.
    #[default]
    #[strum(serialize = "none", serialize = "normal")]
    None = 0,
    /// Linear interpolation from start to end current.
    Ramp = 1,
    /// 50% duty square wave between high and low current.
    Pulse = 2,
}

impl CurveKind {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            1 => CurveKind::Ramp,
            2 => CurveKind::Pulse,
            _ => CurveKind::None,
        }
    }
}

/// Curve parameters and progress for one device.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Curve {
    pub active: bool,
    pub kind: CurveKind,
    pub start_current: u16,
    pub end_current: u16,
    /// Ramp duration in milliseconds.
    pub duration_ms: u32,
    pub pulse_high: u16,
    pub pulse_low: u16,
    /// Full pulse period in milliseconds.
    pub period_ms: u32,
    pub started_at: Option<Instant>,
}

/// Result of evaluating a curve at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurveSample {
    pub current: u16,
    /// The ramp reached its end; the curve must be deactivated after this sample is written.
    pub finished: bool,
}

impl Curve {
    pub fn ramp(start_current: u16, end_current: u16, duration_ms: u32) -> Self {
        Self {
            kind: CurveKind::Ramp,
            start_current,
            end_current,
            duration_ms,
            ..Default::default()
        }
    }

    pub fn pulse(pulse_high: u16, pulse_low: u16, period_ms: u32) -> Self {
        Self {
            kind: CurveKind::Pulse,
            pulse_high,
            pulse_low,
            period_ms,
            ..Default::default()
        }
    }

    /// A curve of `kind` built only from the device setpoints.
    ///
    /// A ramp holds the set current for 5 s, a pulse swings between set and idle current
    /// every second.
    pub fn defaults_for(kind: CurveKind, current_set: u16, idle_current: u16) -> Self {
        match kind {
            CurveKind::None => Self::default(),
            CurveKind::Ramp => Self::ramp(current_set, current_set, DEFAULT_RAMP_MS),
            CurveKind::Pulse => Self::pulse(current_set, idle_current, DEFAULT_PULSE_PERIOD_MS),
        }
    }

    /// Arm the curve, counting from `now`. A curve of kind `None` never becomes active.
    pub fn start(&mut self, now: Instant) {
        self.active = self.kind != CurveKind::None;
        self.started_at = Some(now);
    }

    pub fn stop(&mut self) {
        self.active = false;
    }

    /// Evaluate the curve `now`. Returns `None` if no curve is active.
    pub fn sample(&self, now: Instant) -> Option<CurveSample> {
        if !self.active {
            return None;
        }
        let elapsed = self
            .started_at
            .map_or(Duration::from_ticks(0), |start| elapsed_since(now, start))
            .ticks();

        match self.kind {
            CurveKind::None => None,
            CurveKind::Ramp => {
                let duration = self.duration_ms as u64;
                if elapsed >= duration {
                    return Some(CurveSample {
                        current: self.end_current,
                        finished: true,
                    });
                }
                let start = self.start_current as i64;
                let span = self.end_current as i64 - start;
                let current = start + span * elapsed as i64 / duration as i64;
                Some(CurveSample {
                    current: current.clamp(0, u16::MAX as i64) as u16,
                    finished: false,
                })
            }
            CurveKind::Pulse => {
                if self.period_ms == 0 {
                    return Some(CurveSample {
                        current: self.pulse_high,
                        finished: false,
                    });
                }
                let period = self.period_ms as u64;
                let phase = elapsed % period;
                let current = if phase < period / 2 {
                    self.pulse_high
                } else {
                    self.pulse_low
                };
                Some(CurveSample {
                    current,
                    finished: false,
                })
            }
        }
    }
}

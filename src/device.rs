//! Per-device record: process status, live measurements, setpoints and run bookkeeping.

use crate::curve::Curve;
use crate::energy::EnergyCounters;
use crate::register::StatusBlock;
use crate::time::{Debounce, Instant};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString, IntoStaticStr};

/// Upper bound of the device table.
pub const MAX_DEVICES: usize = 8;

/// Process state of one DPM.
///
/// The integer codes are the ones used on persisted settings and exported telemetry.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Display, EnumIter, EnumString, IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum DeviceStatus {
    /// Not yet part of a finished discovery pass.
    #[default]
    Idle = 0,
    /// Safe setpoints are being written.
    Init = 1,
    /// Waiting for load current to appear.
    WaitCurrent = 2,
    /// Run finished, waiting for the load to be removed.
    WaitRemove = 3,
    Run = 4,
    /// Reserved.
    CheckContact = 6,
    ErrorState = 7,
    /// Switched off by an operator. Neither polled nor written.
    Off = 8,
    /// Too many consecutive read failures.
    Defect = 9,
    TempHigh = 10,
    Overheat = 11,
    /// Runtime expired in energy mode before the target was reached.
    CheckEnergy = 12,
}

impl DeviceStatus {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        self.into()
    }

    /// States the bus owner must neither poll nor write.
    pub fn is_unavailable(self) -> bool {
        matches!(self, DeviceStatus::Off | DeviceStatus::Defect)
    }
}

impl TryFrom<u8> for DeviceStatus {
    type Error = u8;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            0 => DeviceStatus::Idle,
            1 => DeviceStatus::Init,
            2 => DeviceStatus::WaitCurrent,
            3 => DeviceStatus::WaitRemove,
            4 => DeviceStatus::Run,
            6 => DeviceStatus::CheckContact,
            7 => DeviceStatus::ErrorState,
            8 => DeviceStatus::Off,
            9 => DeviceStatus::Defect,
            10 => DeviceStatus::TempHigh,
            11 => DeviceStatus::Overheat,
            12 => DeviceStatus::CheckEnergy,
            other => return Err(other),
        })
    }
}

impl Serialize for DeviceStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

/// How a run terminates.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ControlMode {
    /// Stop once the configured runtime has elapsed.
    #[default]
    Time,
    /// Stop once the batch energy reaches the target, with a bounded grace period.
    Energy,
}

/// Operator setpoints, in register units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Setpoints {
    pub voltage_set: u16,
    pub current_set: u16,
    pub idle_current: u16,
    pub runtime_seconds: u32,
}

/// One entry of the device table. `address` equals the table index plus one.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecord {
    pub address: u8,
    pub valid: bool,
    /// Index into [`crate::bus::BUS_CONFIGS`] this device answered to.
    pub config_index: Option<usize>,
    /// Every configuration that answered in the current pass, one bit each.
    pub config_mask: u8,
    pub consecutive_errors: u8,
    pub status: DeviceStatus,
    pub measured: StatusBlock,
    pub setpoints: Setpoints,
    pub energy: EnergyCounters,
    pub curve: Curve,
    pub control_mode: ControlMode,
    pub operator: String,
    pub line_id: String,
    pub remaining_seconds: u32,
    pub percent: u8,
    /// Current last commanded by a curve, kept apart from the operator setpoint.
    pub commanded_current: u16,
    pub run_started_at: Option<Instant>,
    pub debounce: Debounce,
    pub overheat_shutdown_sent: bool,
    /// Status interrupted by `TempHigh`, resumed once the device cools down.
    pub resume_status: Option<DeviceStatus>,
}

impl DeviceRecord {
    pub fn new(address: u8) -> Self {
        Self {
            address,
            valid: false,
            config_index: None,
            config_mask: 0,
            consecutive_errors: 0,
            status: DeviceStatus::Idle,
            measured: StatusBlock::default(),
            setpoints: Setpoints::default(),
            energy: EnergyCounters::default(),
            curve: Curve::default(),
            control_mode: ControlMode::Time,
            operator: String::new(),
            line_id: String::new(),
            remaining_seconds: 0,
            percent: 0,
            commanded_current: 0,
            run_started_at: None,
            debounce: Debounce::new(),
            overheat_shutdown_sent: false,
            resume_status: None,
        }
    }

    /// Move to `status`, dropping any half-armed debounce from the previous state.
    pub fn enter(&mut self, status: DeviceStatus) {
        if self.status != status {
            self.status = status;
            self.debounce.reset();
            self.overheat_shutdown_sent = false;
            if status != DeviceStatus::TempHigh {
                self.resume_status = None;
            }
        }
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            address: self.address,
            valid: self.valid,
            config_index: self.config_index,
            config_name: crate::bus::config_name(self.config_index),
            consecutive_errors: self.consecutive_errors,
            status_code: self.status.code(),
            status: self.status.name(),
            output_state: self.measured.output as u16,
            voltage_raw: self.measured.voltage_raw,
            current_raw: self.measured.current_raw,
            temperature_raw: self.measured.temperature_raw,
            setpoints: self.setpoints,
            batch_joules: self.energy.batch_joules,
            total_kwh: self.energy.total_kwh,
            anode_kwh: self.energy.anode_kwh,
            target_joules: self.energy.target_joules,
            curve: self.curve.kind,
            curve_active: self.curve.active,
            control_mode: self.control_mode,
            operator: self.operator.clone(),
            line_id: self.line_id.clone(),
            remaining_seconds: self.remaining_seconds,
            percent: self.percent,
        }
    }
}

/// Read-only copy of a [`DeviceRecord`] for reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    pub address: u8,
    pub valid: bool,
    pub config_index: Option<usize>,
    pub config_name: &'static str,
    pub consecutive_errors: u8,
    pub status_code: u8,
    pub status: &'static str,
    pub output_state: u16,
    pub voltage_raw: u16,
    pub current_raw: u16,
    pub temperature_raw: u16,
    pub setpoints: Setpoints,
    pub batch_joules: f64,
    pub total_kwh: f64,
    pub anode_kwh: f64,
    pub target_joules: f64,
    pub curve: crate::curve::CurveKind,
    pub curve_active: bool,
    pub control_mode: ControlMode,
    pub operator: String,
    pub line_id: String,
    pub remaining_seconds: u32,
    pub percent: u8,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::millis;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn status_codes_round_trip_at_the_boundary() {
        for status in DeviceStatus::iter() {
            assert_eq!(DeviceStatus::try_from(status.code()), Ok(status));
        }
        assert_eq!(DeviceStatus::try_from(5), Err(5));
        assert_eq!(DeviceStatus::try_from(200), Err(200));
    }

    #[test]
    fn status_names() {
        assert_eq!(DeviceStatus::WaitCurrent.name(), "wait_current");
        assert_eq!(DeviceStatus::CheckEnergy.to_string(), "check_energy");
        assert_eq!(DeviceStatus::from_str("temp_high").unwrap(), DeviceStatus::TempHigh);
    }

    #[test]
    fn unavailable_states() {
        assert!(DeviceStatus::Off.is_unavailable());
        assert!(DeviceStatus::Defect.is_unavailable());
        assert!(!DeviceStatus::Overheat.is_unavailable());
    }

    #[test]
    fn enter_resets_debounce_only_on_change() {
        let mut record = DeviceRecord::new(2);
        record.debounce.update(true, millis(10), crate::time::Duration::from_ticks(2000));

        record.enter(DeviceStatus::Idle);
        assert_eq!(record.debounce.armed_since(), Some(millis(10)));

        record.enter(DeviceStatus::WaitCurrent);
        assert_eq!(record.debounce.armed_since(), None);
    }

    #[test]
    fn snapshot_exports_code_and_name() {
        let mut record = DeviceRecord::new(3);
        record.status = DeviceStatus::Run;
        record.config_index = Some(1);
        let snapshot = record.snapshot();
        assert_eq!(snapshot.status_code, 4);
        assert_eq!(snapshot.status, "run");
        assert_eq!(snapshot.config_name, "9600 8N1");

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["status_code"], 4);
        assert_eq!(json["control_mode"], "time");
    }

    #[test]
    fn control_mode_names() {
        assert_eq!(ControlMode::from_str("Energy").unwrap(), ControlMode::Energy);
        assert_eq!(ControlMode::Time.to_string(), "time");
    }
}

//! Typed command intake for the messaging and UI layers.
//!
//! Every operation checks the device address first and rejects bad input before touching the
//! table. Changes to persisted fields mark the table dirty so the next save picks them up.

use crate::command::{CommandSender, WriteRequest};
use crate::config::EngineConfig;
use crate::curve::{Curve, CurveKind};
use crate::device::{ControlMode, DeviceRecord, DeviceSnapshot, DeviceStatus};
use crate::energy::EnergyCounter;
use crate::error::CommandError;
use crate::notify::{EventKind, Notifier, ProcessEvent};
use crate::register::State;
use crate::registry::{DeviceRegistry, TelemetrySnapshot};
use crate::time::Instant;
use std::sync::Arc;
use tracing::{info, warn};

/// Curve selection. Unset parameters fall back to the device setpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurveRequest {
    None,
    Ramp {
        start: Option<u16>,
        end: Option<u16>,
        duration_ms: Option<u32>,
    },
    Pulse {
        high: Option<u16>,
        low: Option<u16>,
        period_ms: Option<u32>,
    },
}

/// Partial settings update; `None` fields are left alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettingsUpdate {
    pub voltage: Option<u16>,
    pub current: Option<u16>,
    pub runtime_seconds: Option<u32>,
    pub idle_current: Option<u16>,
    pub percent: Option<u8>,
}

#[derive(Clone)]
pub struct Controller {
    registry: DeviceRegistry,
    commands: CommandSender,
    notifier: Arc<dyn Notifier>,
    config: EngineConfig,
}

impl Controller {
    pub fn new(
        registry: DeviceRegistry,
        commands: CommandSender,
        notifier: Arc<dyn Notifier>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            commands,
            notifier,
            config,
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn device(&self, address: u8) -> Result<DeviceSnapshot, CommandError> {
        self.registry.device(address)
    }

    pub fn snapshot(&self, now: Instant) -> TelemetrySnapshot {
        self.registry.snapshot(now)
    }

    pub fn set_operator(&self, address: u8, operator: impl Into<String>) -> Result<(), CommandError> {
        let operator = operator.into();
        self.change(address, EventKind::OperatorChanged, |record| {
            record.operator = operator;
            "Operator changed".into()
        })
    }

    pub fn set_line(&self, address: u8, line: impl Into<String>) -> Result<(), CommandError> {
        let line = line.into();
        self.change(address, EventKind::LineChanged, |record| {
            let message = format!("Line set to {line}");
            record.line_id = line;
            message
        })
    }

    pub fn set_control_mode(&self, address: u8, mode: ControlMode) -> Result<(), CommandError> {
        self.change(address, EventKind::ModeSet, |record| {
            record.control_mode = mode;
            format!("Control mode {mode}")
        })
    }

    /// Select the current curve. It takes effect immediately during a run, otherwise at the
    /// next run start.
    pub fn set_curve(
        &self,
        address: u8,
        request: CurveRequest,
        now: Instant,
    ) -> Result<(), CommandError> {
        self.registry.check_address(address)?;
        let max = self.config.current_set_max;
        let currents = match request {
            CurveRequest::None => [None, None],
            CurveRequest::Ramp { start, end, .. } => [start, end],
            CurveRequest::Pulse { high, low, .. } => [high, low],
        };
        for value in currents.into_iter().flatten() {
            check_range("curve current", value as u32, max as u32)?;
        }

        self.change(address, EventKind::CurveSet, |record| {
            let setpoints = record.setpoints;
            let mut curve = match request {
                CurveRequest::None => Curve::default(),
                CurveRequest::Ramp {
                    start,
                    end,
                    duration_ms,
                } => {
                    let defaults = Curve::defaults_for(
                        CurveKind::Ramp,
                        setpoints.current_set,
                        setpoints.idle_current,
                    );
                    Curve::ramp(
                        start.unwrap_or(defaults.start_current),
                        end.unwrap_or(defaults.end_current),
                        duration_ms.unwrap_or(defaults.duration_ms),
                    )
                }
                CurveRequest::Pulse {
                    high,
                    low,
                    period_ms,
                } => {
                    let defaults = Curve::defaults_for(
                        CurveKind::Pulse,
                        setpoints.current_set,
                        setpoints.idle_current,
                    );
                    Curve::pulse(
                        high.unwrap_or(defaults.pulse_high),
                        low.unwrap_or(defaults.pulse_low),
                        period_ms.unwrap_or(defaults.period_ms),
                    )
                }
            };
            if record.status == DeviceStatus::Run {
                curve.start(now);
            }
            record.curve = curve;
            format!("Curve {}", curve.kind)
        })
    }

    /// Zero one energy counter. Resetting the batch also restarts sampling.
    pub fn reset_energy(&self, address: u8, counter: EnergyCounter) -> Result<(), CommandError> {
        self.change(address, EventKind::EnergyReset, |record| {
            record.energy.reset(counter);
            format!("Reset {counter}")
        })
    }

    pub fn apply_settings(&self, address: u8, update: SettingsUpdate) -> Result<(), CommandError> {
        self.registry.check_address(address)?;
        if let Some(voltage) = update.voltage {
            check_range("voltage", voltage as u32, self.config.voltage_set_max as u32)?;
        }
        if let Some(current) = update.current {
            check_range("current", current as u32, self.config.current_set_max as u32)?;
        }
        if let Some(percent) = update.percent {
            check_range("percent", percent as u32, 100)?;
        }

        self.change(address, EventKind::SettingsChanged, |record| {
            if let Some(voltage) = update.voltage {
                record.setpoints.voltage_set = voltage;
            }
            if let Some(current) = update.current {
                record.setpoints.current_set = current;
                record.commanded_current = current;
            }
            if let Some(runtime) = update.runtime_seconds {
                record.setpoints.runtime_seconds = runtime;
            }
            if let Some(idle) = update.idle_current {
                record.setpoints.idle_current = idle;
            }
            if let Some(percent) = update.percent {
                record.percent = percent;
            }
            "Settings changed".into()
        })?;

        if self.registry.status(address)?.is_unavailable() {
            return Ok(());
        }
        let writes = update
            .voltage
            .map(|v| WriteRequest::voltage(address, v))
            .into_iter()
            .chain(update.current.map(|c| WriteRequest::current(address, c)))
            .chain(Some(WriteRequest::on_off(address, State::On)));
        for request in writes {
            if let Err(e) = self.commands.enqueue(request) {
                warn!(address, kind = %request.kind, error = %e, "settings write dropped");
            }
        }
        Ok(())
    }

    pub fn set_energy_target(&self, address: u8, joules: f64) -> Result<(), CommandError> {
        let joules = if joules.is_finite() { joules.max(0.0) } else { 0.0 };
        self.change(address, EventKind::SettingsChanged, |record| {
            record.energy.target_joules = joules;
            format!("Energy target {joules:.1} J")
        })
    }

    /// Set the energy target to what the setpoints deliver over the runtime. Returns the target.
    pub fn derive_energy_target(&self, address: u8) -> Result<f64, CommandError> {
        let scaling = self.config.scaling;
        let mut target = 0.0;
        self.change(address, EventKind::SettingsChanged, |record| {
            let setpoints = record.setpoints;
            target = scaling.power_w(setpoints.voltage_set, setpoints.current_set)
                * setpoints.runtime_seconds as f64;
            record.energy.target_joules = target;
            format!("Energy target {target:.1} J")
        })?;
        Ok(target)
    }

    /// Relay toggle. Switching on re-arms an `Off` device; switching off parks it in `Off`.
    pub fn set_output(&self, address: u8, on: bool) -> Result<DeviceStatus, CommandError> {
        self.registry.update(address, |record| {
            match (on, record.status) {
                (true, DeviceStatus::Off) => record.enter(DeviceStatus::WaitCurrent),
                (false, _) => {
                    record.curve.stop();
                    record.remaining_seconds = 0;
                    record.enter(DeviceStatus::Off);
                }
                _ => {}
            }
            info!(address, on, status = %record.status, "output toggled");
            record.status
        })
    }

    /// Explicit reset of `Overheat`, `Defect` and `ErrorState` back to `Init`.
    pub fn clear_fault(&self, address: u8) -> Result<DeviceStatus, CommandError> {
        self.registry.update(address, |record| {
            if matches!(
                record.status,
                DeviceStatus::Overheat | DeviceStatus::Defect | DeviceStatus::ErrorState
            ) {
                info!(address, from = %record.status, "fault cleared");
                record.consecutive_errors = 0;
                record.enter(DeviceStatus::Init);
            }
            record.status
        })
    }

    /// Ask the bus owner for a fresh discovery pass.
    pub fn rediscover(&self) {
        info!("rediscovery requested");
        self.registry.request_rediscovery();
    }

    pub fn write_voltage(&self, address: u8, value: u16) -> Result<(), CommandError> {
        check_range("voltage", value as u32, self.config.voltage_set_max as u32)?;
        self.write(WriteRequest::voltage(address, value))
    }

    pub fn write_current(&self, address: u8, value: u16) -> Result<(), CommandError> {
        check_range("current", value as u32, self.config.current_set_max as u32)?;
        self.write(WriteRequest::current(address, value))
    }

    pub fn write_on_off(&self, address: u8, state: State) -> Result<(), CommandError> {
        self.write(WriteRequest::on_off(address, state))
    }

    fn write(&self, request: WriteRequest) -> Result<(), CommandError> {
        if self.registry.status(request.address)?.is_unavailable() {
            return Err(CommandError::DeviceUnavailable(request.address));
        }
        self.commands.enqueue(request)
    }

    /// Mutate one record, mark settings dirty and notify once the lock is released.
    fn change(
        &self,
        address: u8,
        kind: EventKind,
        f: impl FnOnce(&mut DeviceRecord) -> String,
    ) -> Result<(), CommandError> {
        let event = {
            let mut table = self.registry.lock();
            let record = table
                .record_mut(address)
                .ok_or(CommandError::InvalidAddress(address))?;
            let message = f(record);
            let event = ProcessEvent::new(
                kind,
                record.operator.clone(),
                address,
                record.status,
                message,
            );
            table.mark_dirty();
            event
        };
        self.notifier.notify(&event);
        Ok(())
    }
}

fn check_range(field: &'static str, value: u32, max: u32) -> Result<(), CommandError> {
    if value > max {
        return Err(CommandError::OutOfRange { field, value, max });
    }
    Ok(())
}

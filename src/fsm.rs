//! Per-device process state machine.
//!
//! One [`ProcessFsm::tick`] advances every found device by one step. Ticks only touch the device
//! table and the command queue, never the bus, so they never block on I/O. Events are returned
//! to the caller and delivered after the table lock is released.

use crate::command::{CommandSender, WriteRequest};
use crate::config::EngineConfig;
use crate::curve::CurveKind;
use crate::device::{ControlMode, DeviceRecord, DeviceStatus};
use crate::notify::{EventKind, ProcessEvent};
use crate::register::State;
use crate::registry::DeviceRegistry;
use crate::time::{Instant, elapsed_since};
use tracing::{debug, info, warn};

pub struct ProcessFsm {
    config: EngineConfig,
}

impl ProcessFsm {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Advance every found device, in ascending address order.
    pub fn tick(
        &self,
        registry: &DeviceRegistry,
        commands: &CommandSender,
        now: Instant,
    ) -> Vec<ProcessEvent> {
        let mut events = Vec::new();
        let mut table = registry.lock();
        let found = table.found().clone();
        for address in found {
            if let Some(record) = table.record_mut(address) {
                self.step(record, commands, now, &mut events);
            }
        }
        // Runs that just ended carry energy totals worth keeping.
        if events.iter().any(|event| {
            matches!(
                event.kind,
                EventKind::RunStop
                    | EventKind::EnergyReachedLate
                    | EventKind::EnergyTimeout
                    | EventKind::ServiceDue
            )
        }) {
            table.mark_dirty();
        }
        events
    }

    /// Advance one device by one step.
    pub fn step(
        &self,
        record: &mut DeviceRecord,
        commands: &CommandSender,
        now: Instant,
        events: &mut Vec<ProcessEvent>,
    ) {
        let mut cx = Step {
            config: &self.config,
            commands,
            now,
            events,
        };
        match record.status {
            DeviceStatus::Idle => cx.idle(record),
            DeviceStatus::Init => cx.init(record),
            DeviceStatus::WaitCurrent => cx.wait_current(record),
            DeviceStatus::Run => cx.run(record),
            DeviceStatus::CheckEnergy => cx.check_energy(record),
            DeviceStatus::WaitRemove => cx.wait_remove(record),
            DeviceStatus::Overheat => cx.overheat(record),
            DeviceStatus::Off => record.remaining_seconds = 0,
            DeviceStatus::TempHigh
            | DeviceStatus::CheckContact
            | DeviceStatus::ErrorState
            | DeviceStatus::Defect => {}
        }
    }
}

struct Step<'a> {
    config: &'a EngineConfig,
    commands: &'a CommandSender,
    now: Instant,
    events: &'a mut Vec<ProcessEvent>,
}

impl Step<'_> {
    fn write(&self, request: WriteRequest) -> bool {
        match self.commands.enqueue(request) {
            Ok(()) => true,
            Err(e) => {
                debug!(address = request.address, kind = %request.kind, error = %e, "write not queued");
                false
            }
        }
    }

    fn emit(&mut self, record: &DeviceRecord, kind: EventKind, message: impl Into<String>) {
        self.events.push(ProcessEvent::new(
            kind,
            record.operator.clone(),
            record.address,
            record.status,
            message,
        ));
    }

    fn idle(&mut self, record: &mut DeviceRecord) {
        let written = self.write(WriteRequest::voltage(record.address, self.config.safe_voltage));
        let on = record.debounce.update(
            record.measured.output.is_on(),
            self.now,
            self.config.debounce(),
        );
        if written && on {
            info!(address = record.address, "output on, waiting for current");
            record.enter(DeviceStatus::WaitCurrent);
        }
    }

    fn init(&mut self, record: &mut DeviceRecord) {
        let address = record.address;
        if self.write(WriteRequest::voltage(address, self.config.safe_voltage))
            && self.write(WriteRequest::current(address, self.config.safe_current))
            && self.write(WriteRequest::on_off(address, State::On))
        {
            info!(address, "safe defaults written");
            record.enter(DeviceStatus::WaitCurrent);
        }
    }

    fn wait_current(&mut self, record: &mut DeviceRecord) {
        let loaded = record.debounce.update(
            record.measured.output.current_detected(),
            self.now,
            self.config.debounce(),
        );
        if !loaded {
            return;
        }

        let address = record.address;
        let setpoints = record.setpoints;
        if !(self.write(WriteRequest::voltage(address, setpoints.voltage_set))
            && self.write(WriteRequest::current(address, setpoints.current_set))
            && self.write(WriteRequest::on_off(address, State::On)))
        {
            return;
        }

        record.commanded_current = setpoints.current_set;
        record.curve.start(self.now);
        record.run_started_at = Some(self.now);
        record.energy.rearm();
        record.remaining_seconds = setpoints.runtime_seconds;
        record.percent = 0;
        record.enter(DeviceStatus::Run);
        info!(
            address,
            mode = %record.control_mode,
            curve = %record.curve.kind,
            runtime = setpoints.runtime_seconds,
            "run started"
        );
        self.emit(record, EventKind::RunStart, "Process started");
    }

    fn run(&mut self, record: &mut DeviceRecord) {
        self.integrate(record);
        if !self.shape_current(record) {
            self.write(WriteRequest::current(record.address, record.commanded_current));
        }

        let elapsed_ms = self.update_progress(record);
        let runtime_ms = record.setpoints.runtime_seconds as u64 * 1000;

        let mode = record.control_mode;
        match mode {
            ControlMode::Energy if record.energy.target_reached() => {
                self.stop(record, EventKind::RunStop, "Process stopped");
            }
            ControlMode::Energy if elapsed_ms >= runtime_ms => {
                record.enter(DeviceStatus::CheckEnergy);
                info!(
                    address = record.address,
                    batch_joules = record.energy.batch_joules,
                    target_joules = record.energy.target_joules,
                    "runtime over, checking energy"
                );
                self.emit(record, EventKind::CheckEnergyPhase, "Energy phase check");
            }
            ControlMode::Time if elapsed_ms >= runtime_ms => {
                self.stop(record, EventKind::RunStop, "Process stopped");
            }
            _ => {}
        }
    }

    fn check_energy(&mut self, record: &mut DeviceRecord) {
        self.integrate(record);
        let elapsed_ms = self.update_progress(record);

        if record.energy.target_reached() {
            self.stop(
                record,
                EventKind::EnergyReachedLate,
                "Energy target reached (late)",
            );
            return;
        }

        let runtime_ms = record.setpoints.runtime_seconds as u64 * 1000;
        let overrun_ms = elapsed_ms.saturating_sub(runtime_ms);
        let allowed_ms = runtime_ms * self.config.energy_timeout_percent as u64 / 100;
        if overrun_ms > allowed_ms {
            warn!(
                address = record.address,
                batch_joules = record.energy.batch_joules,
                target_joules = record.energy.target_joules,
                "energy target not reached in time"
            );
            self.stop(record, EventKind::EnergyTimeout, "Energy timeout reached");
        }
    }

    fn wait_remove(&mut self, record: &mut DeviceRecord) {
        let removed = record.debounce.update(
            !record.measured.output.current_detected(),
            self.now,
            self.config.debounce(),
        );
        if removed {
            info!(address = record.address, "load removed");
            record.enter(DeviceStatus::WaitCurrent);
        }
    }

    fn overheat(&mut self, record: &mut DeviceRecord) {
        record.remaining_seconds = 0;
        record.curve.stop();
        if !record.overheat_shutdown_sent
            && self.write(WriteRequest::on_off(record.address, State::Off))
        {
            warn!(address = record.address, "output switched off after overheat");
            record.overheat_shutdown_sent = true;
        }
    }

    /// End the run: drop to idle current and wait for the load to go away.
    fn stop(&mut self, record: &mut DeviceRecord, kind: EventKind, message: &str) {
        self.write(WriteRequest::current(
            record.address,
            record.setpoints.idle_current,
        ));
        record.curve.stop();
        record.remaining_seconds = 0;
        record.enter(DeviceStatus::WaitRemove);
        info!(
            address = record.address,
            batch_joules = record.energy.batch_joules,
            reason = %kind,
            "run stopped"
        );
        self.emit(record, kind, message);
    }

    fn integrate(&mut self, record: &mut DeviceRecord) {
        let integration = record.energy.integrate(
            record.measured.voltage_raw,
            record.measured.current_raw,
            &self.config.scaling,
            self.now,
            self.config.anode_threshold_step_joules,
        );
        if integration.service_due {
            warn!(
                address = record.address,
                anode_kwh = record.energy.anode_kwh,
                "anode service due"
            );
            let message = format!(
                "Service threshold reached ({:.3} kWh on anode)",
                record.energy.anode_kwh
            );
            self.emit(record, EventKind::ServiceDue, message);
        }
    }

    /// Apply the active curve. Returns false when no curve is active.
    fn shape_current(&mut self, record: &mut DeviceRecord) -> bool {
        let Some(sample) = record.curve.sample(self.now) else {
            return false;
        };
        match record.curve.kind {
            CurveKind::Pulse if sample.current == record.commanded_current => {}
            _ => {
                if self.write(WriteRequest::current(record.address, sample.current)) {
                    record.commanded_current = sample.current;
                }
            }
        }
        if sample.finished {
            record.commanded_current = sample.current;
            record.curve.stop();
            debug!(address = record.address, current = sample.current, "ramp finished");
        }
        true
    }

    /// Refresh remaining time and percentage. Returns the elapsed run time in milliseconds.
    fn update_progress(&self, record: &mut DeviceRecord) -> u64 {
        let elapsed_ms = record
            .run_started_at
            .map_or(0, |start| elapsed_since(self.now, start).ticks());
        let runtime_s = record.setpoints.runtime_seconds as u64;
        record.remaining_seconds = runtime_s.saturating_sub(elapsed_ms / 1000) as u32;
        record.percent = if runtime_s == 0 {
            100
        } else {
            (elapsed_ms / 10 / runtime_s).min(100) as u8
        };
        elapsed_ms
    }
}

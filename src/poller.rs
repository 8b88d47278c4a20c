//! Cyclic status reads of every found device, error counting and temperature overrides.

use crate::bus::{BUS_CONFIGS, BusLink};
use crate::config::EngineConfig;
use crate::device::DeviceStatus;
use crate::error::BusError;
use crate::notify::{EventKind, ProcessEvent};
use crate::register::{STATUS_BLOCK_LEN, STATUS_BLOCK_START, StatusBlock};
use crate::registry::DeviceRegistry;
use crate::time::{Duration, Instant, elapsed_since};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct Poller {
    period: Duration,
    last_pass: Option<Instant>,
}

/// What one poll pass did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollReport {
    pub polled: usize,
    pub failed: usize,
    pub skipped: usize,
    pub events: Vec<ProcessEvent>,
}

impl Poller {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            last_pass: None,
        }
    }

    /// A pass is due if none ran yet or a full period elapsed since the last one.
    pub fn due(&self, now: Instant) -> bool {
        self.last_pass
            .is_none_or(|last| elapsed_since(now, last) >= self.period)
    }

    /// Read the status block of every found device, in ascending address order.
    pub fn poll_pass<B: BusLink>(
        &mut self,
        link: &mut B,
        registry: &DeviceRegistry,
        config: &EngineConfig,
        now: Instant,
    ) -> PollReport {
        self.last_pass = Some(now);
        let mut report = PollReport::default();

        for address in registry.found() {
            let config_index = {
                let mut table = registry.lock();
                let Some(record) = table.record_mut(address) else {
                    continue;
                };
                if record.status.is_unavailable() {
                    record.valid = false;
                    report.skipped += 1;
                    continue;
                }
                record.config_index
            };
            let Some(bus_config) = config_index.and_then(|idx| BUS_CONFIGS.get(idx)) else {
                continue;
            };

            let result = link.apply(bus_config).and_then(|()| {
                link.read_block(address, STATUS_BLOCK_START.into(), STATUS_BLOCK_LEN)
            });

            let mut table = registry.lock();
            let Some(record) = table.record_mut(address) else {
                continue;
            };
            let outcome = result.and_then(|words| {
                StatusBlock::from_words(&words).ok_or(BusError::InvalidResponse)
            });
            match outcome {
                Ok(block) => {
                    report.polled += 1;
                    record.measured = block;
                    record.valid = true;
                    record.consecutive_errors = 0;
                    debug!(
                        address,
                        output = ?block.output,
                        voltage = block.voltage_raw,
                        current = block.current_raw,
                        temperature = block.temperature_raw,
                        "polled"
                    );

                    let temperature = block.temperature_raw;
                    if temperature >= config.temp_crit {
                        if record.status != DeviceStatus::Overheat {
                            record.enter(DeviceStatus::Overheat);
                            warn!(address, temperature, "overheat");
                            report.events.push(ProcessEvent::new(
                                EventKind::Overheat,
                                record.operator.clone(),
                                address,
                                record.status,
                                format!("Temperature {temperature} °C reached critical limit"),
                            ));
                        }
                    } else if temperature >= config.temp_warn {
                        if !matches!(
                            record.status,
                            DeviceStatus::TempHigh | DeviceStatus::Overheat
                        ) {
                            let interrupted = record.status;
                            info!(address, temperature, from = %interrupted, "temperature high");
                            record.enter(DeviceStatus::TempHigh);
                            record.resume_status = Some(interrupted);
                        }
                    } else if record.status == DeviceStatus::TempHigh {
                        let resume = record.resume_status.take().unwrap_or(DeviceStatus::Init);
                        info!(address, temperature, to = %resume, "temperature back to normal");
                        // The hot period is not integrated.
                        record.energy.rearm();
                        record.enter(resume);
                    }
                }
                Err(error) => {
                    report.failed += 1;
                    // Stale measurements are kept.
                    record.consecutive_errors = record.consecutive_errors.saturating_add(1);
                    debug!(address, errors = record.consecutive_errors, %error, "poll failed");
                    if record.consecutive_errors >= config.defect_threshold {
                        record.enter(DeviceStatus::Defect);
                        record.valid = false;
                        warn!(address, errors = record.consecutive_errors, "device marked defect");
                        report.events.push(ProcessEvent::new(
                            EventKind::Defect,
                            record.operator.clone(),
                            address,
                            record.status,
                            format!(
                                "No response after {} consecutive polls",
                                record.consecutive_errors
                            ),
                        ));
                    }
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::OutputState;
    use crate::sim_bus::{SimBus, Transaction};
    use crate::time::millis;

    fn setup(addresses: &[(u8, usize)]) -> (DeviceRegistry, SimBus) {
        let registry = DeviceRegistry::new(8);
        let mut bus = SimBus::new();
        {
            let mut table = registry.lock();
            for &(address, config) in addresses {
                bus.add_device(address, config);
                let record = table.record_mut(address).unwrap();
                record.valid = true;
                record.config_index = Some(config);
                record.status = DeviceStatus::Run;
                table.mark_found(address);
            }
            table.finish_discovery();
        }
        (registry, bus)
    }

    #[test]
    fn successful_poll_updates_measurements() {
        let (registry, mut bus) = setup(&[(3, 1)]);
        bus.set_output(3, OutputState::Loaded);
        bus.set_measurement(3, 2400, 1500);
        bus.set_temperature(3, 30);
        registry.update(3, |r| r.consecutive_errors = 2).unwrap();

        let mut poller = Poller::new(Duration::from_ticks(200));
        let report = poller.poll_pass(&mut bus, &registry, &EngineConfig::default(), millis(0));
        assert_eq!(report.polled, 1);

        let table = registry.lock();
        let record = table.record(3).unwrap();
        assert_eq!(record.measured.output, OutputState::Loaded);
        assert_eq!(record.measured.voltage_raw, 2400);
        assert_eq!(record.measured.current_raw, 1500);
        assert_eq!(record.consecutive_errors, 0);
        assert_eq!(
            bus.log(),
            &[
                Transaction::Apply { config: 1 },
                Transaction::Read {
                    unit: 3,
                    start: 0x1000,
                    count: 8
                }
            ]
        );
    }

    #[test]
    fn error_counter_escalates_to_defect() {
        let (registry, mut bus) = setup(&[(2, 0)]);
        bus.set_measurement(2, 1000, 200);
        let config = EngineConfig::default();
        let mut poller = Poller::new(config.poll_period());
        poller.poll_pass(&mut bus, &registry, &config, millis(0));

        bus.set_offline(2, true);
        for expected in 1..=4u8 {
            let report = poller.poll_pass(&mut bus, &registry, &config, millis(expected as u64 * 200));
            assert!(report.events.is_empty());
            let table = registry.lock();
            let record = table.record(2).unwrap();
            assert_eq!(record.consecutive_errors, expected);
            assert_eq!(record.status, DeviceStatus::Run);
            assert!(record.valid);
            // Stale data is retained.
            assert_eq!(record.measured.voltage_raw, 1000);
        }

        let report = poller.poll_pass(&mut bus, &registry, &config, millis(1000));
        assert_eq!(report.events.len(), 1);
        assert_eq!(report.events[0].kind, EventKind::Defect);
        {
            let table = registry.lock();
            let record = table.record(2).unwrap();
            assert_eq!(record.status, DeviceStatus::Defect);
            assert!(!record.valid);
        }

        // Defect devices are skipped from now on.
        bus.clear_log();
        bus.set_offline(2, false);
        let report = poller.poll_pass(&mut bus, &registry, &config, millis(1200));
        assert_eq!(report.skipped, 1);
        assert!(bus.log().is_empty());
        assert_eq!(registry.status(2), Ok(DeviceStatus::Defect));
    }

    #[test]
    fn success_resets_error_counter() {
        let (registry, mut bus) = setup(&[(1, 0)]);
        let config = EngineConfig::default();
        let mut poller = Poller::new(config.poll_period());

        bus.fail_next_reads(1, 3);
        for t in 0..3 {
            poller.poll_pass(&mut bus, &registry, &config, millis(t * 200));
        }
        assert_eq!(registry.lock().record(1).unwrap().consecutive_errors, 3);

        poller.poll_pass(&mut bus, &registry, &config, millis(600));
        assert_eq!(registry.lock().record(1).unwrap().consecutive_errors, 0);
    }

    #[test]
    fn off_devices_are_skipped_and_invalid() {
        let (registry, mut bus) = setup(&[(1, 0), (2, 0)]);
        registry.update(1, |r| r.status = DeviceStatus::Off).unwrap();

        let mut poller = Poller::new(Duration::from_ticks(200));
        let report = poller.poll_pass(&mut bus, &registry, &EngineConfig::default(), millis(0));
        assert_eq!(report.skipped, 1);
        assert_eq!(report.polled, 1);

        let table = registry.lock();
        assert!(!table.record(1).unwrap().valid);
        assert_eq!(table.record(1).unwrap().status, DeviceStatus::Off);
        assert!(
            !bus.log()
                .iter()
                .any(|t| matches!(t, Transaction::Read { unit: 1, .. }))
        );
    }

    #[test]
    fn temperature_overrides() {
        let (registry, mut bus) = setup(&[(4, 2)]);
        let config = EngineConfig::default();
        let mut poller = Poller::new(config.poll_period());

        bus.set_temperature(4, 46);
        poller.poll_pass(&mut bus, &registry, &config, millis(0));
        assert_eq!(registry.status(4), Ok(DeviceStatus::TempHigh));

        bus.set_temperature(4, 40);
        poller.poll_pass(&mut bus, &registry, &config, millis(200));
        assert_eq!(registry.status(4), Ok(DeviceStatus::Run));

        bus.set_temperature(4, 50);
        let report = poller.poll_pass(&mut bus, &registry, &config, millis(400));
        assert_eq!(registry.status(4), Ok(DeviceStatus::Overheat));
        assert_eq!(report.events[0].kind, EventKind::Overheat);

        // No automatic recovery from overheat.
        bus.set_temperature(4, 46);
        poller.poll_pass(&mut bus, &registry, &config, millis(600));
        bus.set_temperature(4, 20);
        let report = poller.poll_pass(&mut bus, &registry, &config, millis(800));
        assert!(report.events.is_empty());
        assert_eq!(registry.status(4), Ok(DeviceStatus::Overheat));
    }

    #[test]
    fn cooling_resumes_the_interrupted_status() {
        let (registry, mut bus) = setup(&[(1, 0), (2, 0)]);
        registry
            .update(1, |r| r.status = DeviceStatus::WaitCurrent)
            .unwrap();
        let config = EngineConfig::default();
        let mut poller = Poller::new(config.poll_period());

        bus.set_temperature(1, 46);
        bus.set_temperature(2, 46);
        poller.poll_pass(&mut bus, &registry, &config, millis(0));
        assert_eq!(registry.status(1), Ok(DeviceStatus::TempHigh));
        assert_eq!(registry.status(2), Ok(DeviceStatus::TempHigh));

        bus.set_temperature(1, 30);
        bus.set_temperature(2, 30);
        poller.poll_pass(&mut bus, &registry, &config, millis(200));
        assert_eq!(registry.status(1), Ok(DeviceStatus::WaitCurrent));
        assert_eq!(registry.status(2), Ok(DeviceStatus::Run));
        assert_eq!(registry.lock().record(1).unwrap().resume_status, None);
    }

    #[test]
    fn overheat_drops_the_resume_status() {
        let (registry, mut bus) = setup(&[(1, 0)]);
        let config = EngineConfig::default();
        let mut poller = Poller::new(config.poll_period());

        bus.set_temperature(1, 46);
        poller.poll_pass(&mut bus, &registry, &config, millis(0));
        bus.set_temperature(1, 55);
        poller.poll_pass(&mut bus, &registry, &config, millis(200));

        let table = registry.lock();
        let record = table.record(1).unwrap();
        assert_eq!(record.status, DeviceStatus::Overheat);
        assert_eq!(record.resume_status, None);
    }

    #[test]
    fn pass_is_due_after_period() {
        let mut poller = Poller::new(Duration::from_ticks(200));
        assert!(poller.due(millis(0)));
        let registry = DeviceRegistry::new(1);
        poller.poll_pass(&mut SimBus::new(), &registry, &EngineConfig::default(), millis(50));
        assert!(!poller.due(millis(249)));
        assert!(poller.due(millis(250)));
    }
}

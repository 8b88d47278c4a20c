//! Incremental bus scan.
//!
//! Each [`Discovery::step`] probes at most one address under one configuration, so the bus
//! owner can interleave scanning with writes and polls.

use crate::bus::{BUS_CONFIGS, BusLink};
use crate::device::DeviceStatus;
use crate::register::{PROBE_LEN, STATUS_BLOCK_START};
use crate::registry::DeviceRegistry;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The pass is still running.
    Probing,
    /// The pass is complete. Returned again on every later step until a restart.
    Finished { found: usize },
}

/// Resumable scan position: configuration index, address and completion flag.
#[derive(Debug, Clone)]
pub struct Discovery {
    config_index: usize,
    address: u8,
    done: bool,
    max_devices: u8,
    retries: u8,
}

impl Discovery {
    pub fn new(max_devices: u8, retries: u8) -> Self {
        Self {
            config_index: 0,
            address: 1,
            done: false,
            max_devices,
            retries,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Current (configuration index, address) scan position.
    pub fn position(&self) -> (usize, u8) {
        (self.config_index, self.address)
    }

    /// Start a fresh pass, clearing all discovery results from the table.
    pub fn restart(&mut self, registry: &DeviceRegistry) {
        registry.lock().clear_discovery();
        self.config_index = 0;
        self.address = 1;
        self.done = false;
        info!("discovery restarted");
    }

    /// Advance the scan by one address.
    pub fn step<B: BusLink>(&mut self, link: &mut B, registry: &DeviceRegistry) -> StepOutcome {
        if self.done {
            return StepOutcome::Finished {
                found: registry.device_count(),
            };
        }

        let config = &BUS_CONFIGS[self.config_index];
        let address = self.address;
        let resolved = registry
            .lock()
            .record(address)
            .is_some_and(|record| record.config_index.is_some());

        if resolved {
            debug!(address, config = config.name, "already resolved");
        } else if self.probe(link, address) {
            let mut table = registry.lock();
            if let Some(record) = table.record_mut(address) {
                record.valid = true;
                record.config_index = Some(self.config_index);
                record.config_mask |= 1 << self.config_index;
            }
            table.mark_found(address);
            info!(address, config = config.name, "device found");
        } else {
            debug!(address, config = config.name, "no response");
        }

        self.advance(registry)
    }

    fn probe<B: BusLink>(&self, link: &mut B, address: u8) -> bool {
        let config = &BUS_CONFIGS[self.config_index];
        // The poller may have switched the line since our last step.
        if let Err(e) = link.apply(config) {
            warn!(config = config.name, error = %e, "failed to apply bus configuration");
            return false;
        }

        (0..=self.retries).any(|attempt| {
            match link.read_block(address, STATUS_BLOCK_START.into(), PROBE_LEN) {
                Ok(_) => true,
                Err(e) => {
                    debug!(address, attempt, error = %e, "probe failed");
                    false
                }
            }
        })
    }

    fn advance(&mut self, registry: &DeviceRegistry) -> StepOutcome {
        self.address += 1;
        if self.address <= self.max_devices {
            return StepOutcome::Probing;
        }

        self.address = 1;
        self.config_index += 1;
        if self.config_index < BUS_CONFIGS.len() {
            info!(config = BUS_CONFIGS[self.config_index].name, "switching bus configuration");
            return StepOutcome::Probing;
        }

        self.config_index = 0;
        self.done = true;
        let found = self.finish(registry);
        info!(found, "discovery finished");
        StepOutcome::Finished { found }
    }

    /// Close the pass. Found devices that are still idle, or were defect, start over at `Init`.
    fn finish(&self, registry: &DeviceRegistry) -> usize {
        let mut table = registry.lock();
        let found = table.finish_discovery();
        for record in table.records_mut().filter(|record| record.valid) {
            match record.status {
                DeviceStatus::Idle => record.enter(DeviceStatus::Init),
                DeviceStatus::Defect => {
                    record.consecutive_errors = 0;
                    record.enter(DeviceStatus::Init);
                }
                _ => {}
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim_bus::{SimBus, Transaction};

    fn run_pass(discovery: &mut Discovery, bus: &mut SimBus, registry: &DeviceRegistry) -> usize {
        for _ in 0..BUS_CONFIGS.len() * registry.max_devices() as usize {
            if let StepOutcome::Finished { found } = discovery.step(bus, registry) {
                return found;
            }
        }
        panic!("discovery did not finish");
    }

    #[test]
    fn finds_devices_under_their_configuration() {
        let registry = DeviceRegistry::new(8);
        let mut bus = SimBus::new();
        bus.add_device(3, 1);
        bus.add_device(5, 0);
        let mut discovery = Discovery::new(8, 1);

        assert_eq!(run_pass(&mut discovery, &mut bus, &registry), 2);
        assert!(discovery.is_done());
        assert_eq!(registry.found().as_slice(), &[3, 5]);
        assert_eq!(registry.device_count(), 2);

        let table = registry.lock();
        let three = table.record(3).unwrap();
        assert!(three.valid);
        assert_eq!(three.config_index, Some(1));
        assert_eq!(three.status, DeviceStatus::Init);
        assert_eq!(table.record(5).unwrap().config_index, Some(0));
        assert!(!table.record(4).unwrap().valid);
        assert_eq!(table.record(4).unwrap().status, DeviceStatus::Idle);
    }

    #[test]
    fn first_answering_configuration_wins() {
        let registry = DeviceRegistry::new(4);
        let mut bus = SimBus::new();
        bus.add_device_multi(2, &[1, 3]);
        let mut discovery = Discovery::new(4, 1);
        run_pass(&mut discovery, &mut bus, &registry);

        let table = registry.lock();
        let record = table.record(2).unwrap();
        assert_eq!(record.config_index, Some(1));
        assert_eq!(record.config_mask, 0b10);
        assert_eq!(table.found().as_slice(), &[2]);
        drop(table);

        // Resolved addresses are not probed again under later configurations.
        let probes_of_two = bus
            .log()
            .iter()
            .filter(|t| matches!(t, Transaction::Read { unit: 2, .. }))
            .count();
        // Two attempts under config 0, one under config 1.
        assert_eq!(probes_of_two, 3);
    }

    #[test]
    fn empty_bus_finishes_with_zero() {
        let registry = DeviceRegistry::new(2);
        let mut bus = SimBus::new();
        let mut discovery = Discovery::new(2, 0);
        assert_eq!(run_pass(&mut discovery, &mut bus, &registry), 0);
        assert_eq!(registry.device_count(), 0);
        assert!(registry.discovery_complete());
        assert_eq!(
            discovery.step(&mut bus, &registry),
            StepOutcome::Finished { found: 0 }
        );
    }

    #[test]
    fn retry_recovers_a_dropped_probe() {
        let registry = DeviceRegistry::new(1);
        let mut bus = SimBus::new();
        bus.add_device(1, 0);
        bus.fail_next_reads(1, 1);
        let mut discovery = Discovery::new(1, 1);

        discovery.step(&mut bus, &registry);
        assert_eq!(registry.found().as_slice(), &[1]);
    }

    #[test]
    fn rerun_is_idempotent() {
        let registry = DeviceRegistry::new(8);
        let mut bus = SimBus::new();
        bus.add_device(1, 4);
        bus.add_device(3, 1);
        bus.add_device(8, 2);
        let mut discovery = Discovery::new(8, 1);

        run_pass(&mut discovery, &mut bus, &registry);
        let first_found = registry.found();
        let first_configs: Vec<_> = registry.lock().records().map(|r| r.config_index).collect();

        discovery.restart(&registry);
        assert!(registry.found().is_empty());
        run_pass(&mut discovery, &mut bus, &registry);

        assert_eq!(registry.found(), first_found);
        let second_configs: Vec<_> = registry.lock().records().map(|r| r.config_index).collect();
        assert_eq!(first_configs, second_configs);
    }

    #[test]
    fn rediscovery_recovers_defect() {
        let registry = DeviceRegistry::new(2);
        let mut bus = SimBus::new();
        bus.add_device(2, 0);
        let mut discovery = Discovery::new(2, 0);
        run_pass(&mut discovery, &mut bus, &registry);

        registry
            .update(2, |r| {
                r.status = DeviceStatus::Defect;
                r.consecutive_errors = 5;
                r.valid = false;
            })
            .unwrap();

        discovery.restart(&registry);
        run_pass(&mut discovery, &mut bus, &registry);

        let table = registry.lock();
        let record = table.record(2).unwrap();
        assert_eq!(record.status, DeviceStatus::Init);
        assert_eq!(record.consecutive_errors, 0);
        assert!(record.valid);
    }

    #[test]
    fn running_device_keeps_its_state_across_rediscovery() {
        let registry = DeviceRegistry::new(1);
        let mut bus = SimBus::new();
        bus.add_device(1, 0);
        let mut discovery = Discovery::new(1, 0);
        run_pass(&mut discovery, &mut bus, &registry);
        registry.update(1, |r| r.status = DeviceStatus::Run).unwrap();

        discovery.restart(&registry);
        run_pass(&mut discovery, &mut bus, &registry);
        assert_eq!(registry.status(1), Ok(DeviceStatus::Run));
    }
}

//! The single owner of the serial bus.
//!
//! Each cycle runs under the bus lock and always in this order: drain queued writes, take one
//! discovery step while discovery is incomplete, then run a poll pass if one is due.

use crate::bus::{BUS_CONFIGS, BusLink};
use crate::command::{CommandReceiver, WriteRequest};
use crate::config::EngineConfig;
use crate::discovery::{Discovery, StepOutcome};
use crate::notify::ProcessEvent;
use crate::poller::Poller;
use crate::registry::DeviceRegistry;
use crate::time::Instant;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Shared handle to the bus. Whoever holds the guard owns the line.
pub type BusLock<B> = Arc<Mutex<B>>;

/// What one bus-owner cycle did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    /// Writes taken from the queue.
    pub drained: usize,
    /// Writes the device acknowledged.
    pub written: usize,
    pub discovery: Option<StepOutcome>,
    pub polled: bool,
    /// Events to deliver once the cycle returned.
    pub events: Vec<ProcessEvent>,
}

pub struct BusOwner<B> {
    link: BusLock<B>,
    registry: DeviceRegistry,
    commands: CommandReceiver,
    discovery: Discovery,
    poller: Poller,
    config: EngineConfig,
}

impl<B: BusLink> BusOwner<B> {
    pub fn new(
        link: BusLock<B>,
        registry: DeviceRegistry,
        commands: CommandReceiver,
        config: EngineConfig,
    ) -> Self {
        Self {
            link,
            registry,
            commands,
            discovery: Discovery::new(config.max_devices, config.retries),
            poller: Poller::new(config.poll_period()),
            config,
        }
    }

    pub fn discovery(&self) -> &Discovery {
        &self.discovery
    }

    pub fn run_cycle(&mut self, now: Instant) -> CycleReport {
        let mut report = CycleReport::default();
        let mut link = self.link.lock().unwrap_or_else(|e| e.into_inner());

        if self.registry.take_rediscovery() {
            self.discovery.restart(&self.registry);
        }

        // Bounded so a busy producer cannot starve discovery and polling.
        let budget = self.config.command_queue_capacity.max(self.commands.pending());
        for _ in 0..budget {
            let Some(request) = self.commands.try_next() else {
                break;
            };
            report.drained += 1;
            if self.execute(&mut *link, request) {
                report.written += 1;
            }
        }

        if !self.discovery.is_done() {
            report.discovery = Some(self.discovery.step(&mut *link, &self.registry));
        }

        if self.poller.due(now) && !self.registry.found().is_empty() {
            let poll = self
                .poller
                .poll_pass(&mut *link, &self.registry, &self.config, now);
            report.polled = true;
            report.events = poll.events;
        }

        report
    }

    fn execute(&self, link: &mut B, request: WriteRequest) -> bool {
        let target = self.registry.lock().record(request.address).map(|record| {
            (record.status.is_unavailable(), record.config_index)
        });
        let config = match target {
            Some((false, Some(idx))) => &BUS_CONFIGS[idx],
            Some((true, _)) => {
                debug!(address = request.address, kind = %request.kind, "write to unavailable device ignored");
                return false;
            }
            _ => {
                debug!(address = request.address, kind = %request.kind, "write to unknown device ignored");
                return false;
            }
        };

        let result = link.apply(config).and_then(|()| {
            link.write_register(request.address, request.kind.register().into(), request.value)
        });
        match result {
            Ok(()) => {
                debug!(address = request.address, kind = %request.kind, value = request.value, "write done");
                true
            }
            Err(e) => {
                warn!(address = request.address, kind = %request.kind, error = %e, "write dropped");
                false
            }
        }
    }
}

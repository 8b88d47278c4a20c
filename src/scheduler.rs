//! Tokio tasks driving the bus owner and the process FSM.
//!
//! The bus-owner task moves the [`BusOwner`] onto the blocking pool for one cycle at a time and
//! takes it back afterwards, so serial I/O never blocks the async workers. The FSM task only
//! talks to the bus through the command queue.

use crate::bus::BusLink;
use crate::bus_owner::BusOwner;
use crate::command::{CommandSender, command_channel};
use crate::config::EngineConfig;
use crate::control::Controller;
use crate::error::ConfigError;
use crate::fsm::ProcessFsm;
use crate::notify::Notifier;
use crate::persistence::{SettingsStore, save_if_dirty};
use crate::registry::{DeviceRegistry, TelemetrySnapshot};
use crate::time::{Instant, millis};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tracing::{error, info, warn};

/// Engine clock. Millisecond ticks since the scheduler started.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: tokio::time::Instant,
}

impl Clock {
    pub fn start() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }

    pub fn now(&self) -> Instant {
        millis(self.origin.elapsed().as_millis() as u64)
    }
}

pub struct Scheduler;

impl Scheduler {
    /// Restore stored settings, then start the bus-owner and FSM tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<B>(
        link: B,
        config: EngineConfig,
        notifier: Arc<dyn Notifier>,
        store: Arc<dyn SettingsStore>,
    ) -> Result<SchedulerHandle, ConfigError>
    where
        B: BusLink + Send + 'static,
    {
        config.validate()?;

        let registry = DeviceRegistry::new(config.max_devices);
        match store.load() {
            Ok(settings) => {
                let restored = registry.restore(&settings);
                info!(restored, "settings restored");
            }
            Err(e) => warn!(error = %e, "could not load settings, starting from defaults"),
        }

        let clock = Clock::start();
        let (commands, rx) = command_channel(config.command_queue_capacity);
        let (snapshot_tx, snapshots) = watch::channel(registry.snapshot(clock.now()));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let owner = BusOwner::new(
            Arc::new(Mutex::new(link)),
            registry.clone(),
            rx,
            config.clone(),
        );
        let bus_task = tokio::spawn(bus_task(
            owner,
            registry.clone(),
            notifier.clone(),
            snapshot_tx,
            Duration::from_millis(config.bus_cycle_ms),
            clock,
            shutdown_rx.clone(),
        ));
        let fsm_task = tokio::spawn(fsm_task(
            ProcessFsm::new(config.clone()),
            registry.clone(),
            commands.clone(),
            notifier.clone(),
            store.clone(),
            Duration::from_millis(config.fsm_period_ms),
            clock,
            shutdown_rx,
        ));

        info!(
            max_devices = config.max_devices,
            bus_cycle_ms = config.bus_cycle_ms,
            fsm_period_ms = config.fsm_period_ms,
            "scheduler started"
        );

        Ok(SchedulerHandle {
            controller: Controller::new(registry.clone(), commands, notifier, config),
            registry,
            store,
            snapshots,
            clock,
            shutdown,
            tasks: vec![bus_task, fsm_task],
        })
    }
}

pub struct SchedulerHandle {
    controller: Controller,
    registry: DeviceRegistry,
    store: Arc<dyn SettingsStore>,
    snapshots: watch::Receiver<TelemetrySnapshot>,
    clock: Clock,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    /// Receiver updated after every poll pass.
    pub fn snapshots(&self) -> watch::Receiver<TelemetrySnapshot> {
        self.snapshots.clone()
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Stop both tasks, wait for them and flush pending settings.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "scheduler task failed");
            }
        }
        persist(&self.registry, &self.store).await;
        info!("scheduler stopped");
    }
}

async fn bus_task<B>(
    owner: BusOwner<B>,
    registry: DeviceRegistry,
    notifier: Arc<dyn Notifier>,
    snapshots: watch::Sender<TelemetrySnapshot>,
    period: Duration,
    clock: Clock,
    mut shutdown: watch::Receiver<bool>,
) where
    B: BusLink + Send + 'static,
{
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut owner = Some(owner);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }
        let Some(mut current) = owner.take() else {
            break;
        };
        let now = clock.now();
        let cycle = tokio::task::spawn_blocking(move || {
            let report = current.run_cycle(now);
            (current, report)
        })
        .await;

        match cycle {
            Ok((back, report)) => {
                owner = Some(back);
                notifier.notify_all(&report.events);
                if report.polled {
                    snapshots.send_replace(registry.snapshot(now));
                }
            }
            Err(e) => {
                error!(error = %e, "bus cycle failed, bus owner stopped");
                break;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn fsm_task(
    fsm: ProcessFsm,
    registry: DeviceRegistry,
    commands: CommandSender,
    notifier: Arc<dyn Notifier>,
    store: Arc<dyn SettingsStore>,
    period: Duration,
    clock: Clock,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }
        let events = fsm.tick(&registry, &commands, clock.now());
        notifier.notify_all(&events);
        persist(&registry, &store).await;
    }
}

/// Save changed settings on the blocking pool; stores may do file I/O.
async fn persist(registry: &DeviceRegistry, store: &Arc<dyn SettingsStore>) {
    if !registry.is_dirty() {
        return;
    }
    let registry = registry.clone();
    let store = store.clone();
    match tokio::task::spawn_blocking(move || save_if_dirty(&registry, store.as_ref())).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => warn!(error = %e, "settings save failed"),
        Err(e) => error!(error = %e, "settings save task failed"),
    }
}

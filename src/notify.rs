//! Process events and the side-effect interface they are delivered through.
//!
//! Delivery is fire-and-forget. Events are collected while the device table is locked and
//! handed to the [`Notifier`] only after every lock has been released.

use crate::device::DeviceStatus;
use serde::Serialize;
use strum_macros::{Display, EnumIter, IntoStaticStr};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, EnumIter, IntoStaticStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventKind {
    RunStart,
    RunStop,
    CheckEnergyPhase,
    EnergyReachedLate,
    EnergyTimeout,
    ServiceDue,
    Overheat,
    Defect,
    OperatorChanged,
    LineChanged,
    EnergyReset,
    CurveSet,
    ModeSet,
    SettingsChanged,
}

impl EventKind {
    /// Faults that deserve more than an info line.
    pub fn is_alarm(self) -> bool {
        matches!(
            self,
            EventKind::EnergyTimeout | EventKind::ServiceDue | EventKind::Overheat | EventKind::Defect
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessEvent {
    pub kind: EventKind,
    pub operator: String,
    pub address: u8,
    /// Device status right after the event.
    pub state: DeviceStatus,
    pub message: String,
}

impl ProcessEvent {
    pub fn new(
        kind: EventKind,
        operator: impl Into<String>,
        address: u8,
        state: DeviceStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            operator: operator.into(),
            address,
            state,
            message: message.into(),
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, event: &ProcessEvent);

    fn notify_all(&self, events: &[ProcessEvent]) {
        for event in events {
            self.notify(event);
        }
    }
}

/// Writes every event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, event: &ProcessEvent) {
        let kind: &'static str = event.kind.into();
        if event.kind.is_alarm() {
            warn!(
                event = kind,
                address = event.address,
                operator = %event.operator,
                state = %event.state,
                "{}",
                event.message
            );
        } else {
            info!(
                event = kind,
                address = event.address,
                operator = %event.operator,
                state = %event.state,
                "{}",
                event.message
            );
        }
    }
}

/// Forwards events to an unbounded channel, e.g. towards a message bus publisher.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<ProcessEvent>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProcessEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, event: &ProcessEvent) {
        // A dropped receiver just means nobody is listening any more.
        let _ = self.tx.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names() {
        assert_eq!(EventKind::RunStop.to_string(), "run_stop");
        assert_eq!(EventKind::EnergyReachedLate.to_string(), "energy_reached_late");
        assert_eq!(EventKind::CheckEnergyPhase.to_string(), "check_energy_phase");
        assert!(EventKind::Defect.is_alarm());
        assert!(!EventKind::RunStart.is_alarm());
    }

    #[test]
    fn channel_notifier_forwards() {
        let (notifier, mut rx) = ChannelNotifier::new();
        notifier.notify_all(&[
            ProcessEvent::new(EventKind::RunStart, "op7", 3, DeviceStatus::Run, "Process started"),
            ProcessEvent::new(EventKind::RunStop, "op7", 3, DeviceStatus::WaitRemove, "Process stopped"),
        ]);

        assert_eq!(rx.try_recv().unwrap().kind, EventKind::RunStart);
        let stop = rx.try_recv().unwrap();
        assert_eq!(stop.kind, EventKind::RunStop);
        assert_eq!(stop.state, DeviceStatus::WaitRemove);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn closed_channel_is_ignored() {
        let (notifier, rx) = ChannelNotifier::new();
        drop(rx);
        notifier.notify(&ProcessEvent::new(EventKind::Defect, "", 1, DeviceStatus::Defect, "gone"));
    }

    #[test]
    fn event_serializes_with_names() {
        let event = ProcessEvent::new(EventKind::Overheat, "op", 2, DeviceStatus::Overheat, "hot");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "overheat");
        assert_eq!(json["state"], "overheat");
        assert_eq!(json["address"], 2);
    }
}

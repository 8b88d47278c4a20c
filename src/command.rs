//! The command channel: a bounded FIFO of register writes, drained only by the bus owner.

use crate::error::CommandError;
use crate::register::{DpmRegister, State};
use strum_macros::{Display, EnumIter};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum WriteKind {
    Voltage,
    Current,
    OnOff,
}

impl WriteKind {
    pub fn register(self) -> DpmRegister {
        match self {
            WriteKind::Voltage => DpmRegister::VoltageSet,
            WriteKind::Current => DpmRegister::CurrentSet,
            WriteKind::OnOff => DpmRegister::OutputEnable,
        }
    }
}

/// One pending register write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRequest {
    pub kind: WriteKind,
    pub address: u8,
    pub value: u16,
}

impl WriteRequest {
    pub fn voltage(address: u8, value: u16) -> Self {
        Self {
            kind: WriteKind::Voltage,
            address,
            value,
        }
    }

    pub fn current(address: u8, value: u16) -> Self {
        Self {
            kind: WriteKind::Current,
            address,
            value,
        }
    }

    pub fn on_off(address: u8, state: State) -> Self {
        Self {
            kind: WriteKind::OnOff,
            address,
            value: state as u16,
        }
    }
}

/// Create the channel with room for `capacity` pending writes.
pub fn command_channel(capacity: usize) -> (CommandSender, CommandReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (CommandSender { tx }, CommandReceiver { rx })
}

/// Producer side. Cheap to clone, never blocks.
#[derive(Debug, Clone)]
pub struct CommandSender {
    tx: mpsc::Sender<WriteRequest>,
}

impl CommandSender {
    /// Queue a write, failing immediately if the queue is full.
    pub fn enqueue(&self, request: WriteRequest) -> Result<(), CommandError> {
        match self.tx.try_send(request) {
            Ok(()) => {
                debug!(
                    address = request.address,
                    kind = %request.kind,
                    value = request.value,
                    "write queued"
                );
                Ok(())
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                Err(CommandError::QueueFull)
            }
        }
    }
}

/// Consumer side, owned by the bus owner.
#[derive(Debug)]
pub struct CommandReceiver {
    rx: mpsc::Receiver<WriteRequest>,
}

impl CommandReceiver {
    /// Next pending write, if any.
    pub fn try_next(&mut self) -> Option<WriteRequest> {
        self.rx.try_recv().ok()
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

//! The shared device table.
//!
//! One fixed table of [`DeviceRecord`]s behind a single mutex. Other tasks get snapshots and
//! address-checked mutators; the lock is never held across a bus transaction.

use crate::device::{DeviceRecord, DeviceSnapshot, DeviceStatus, MAX_DEVICES};
use crate::error::CommandError;
use crate::persistence::DeviceSettings;
use crate::time::Instant;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Addresses found by the current discovery pass, ascending.
pub type FoundList = heapless::Vec<u8, MAX_DEVICES>;

#[derive(Debug)]
pub struct DeviceTable {
    records: Vec<DeviceRecord>,
    found: FoundList,
    discovery_complete: bool,
    device_count: usize,
    settings_dirty: bool,
    rediscovery_requested: bool,
}

impl DeviceTable {
    fn new(max_devices: u8) -> Self {
        Self {
            records: (1..=max_devices).map(DeviceRecord::new).collect(),
            found: FoundList::new(),
            discovery_complete: false,
            device_count: 0,
            settings_dirty: false,
            rediscovery_requested: false,
        }
    }

    pub fn max_devices(&self) -> u8 {
        self.records.len() as u8
    }

    pub fn record(&self, address: u8) -> Option<&DeviceRecord> {
        (address as usize)
            .checked_sub(1)
            .and_then(|idx| self.records.get(idx))
    }

    pub fn record_mut(&mut self, address: u8) -> Option<&mut DeviceRecord> {
        (address as usize)
            .checked_sub(1)
            .and_then(|idx| self.records.get_mut(idx))
    }

    pub fn records(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.records.iter()
    }

    pub fn records_mut(&mut self) -> impl Iterator<Item = &mut DeviceRecord> {
        self.records.iter_mut()
    }

    pub fn found(&self) -> &FoundList {
        &self.found
    }

    /// Add `address` to the found list, keeping it sorted. Returns false if already present.
    pub fn mark_found(&mut self, address: u8) -> bool {
        match self.found.binary_search(&address) {
            Ok(_) => false,
            Err(pos) => self.found.insert(pos, address).is_ok(),
        }
    }

    /// Forget everything discovery learned, ready for a fresh pass.
    pub fn clear_discovery(&mut self) {
        self.found.clear();
        self.discovery_complete = false;
        for record in &mut self.records {
            record.valid = false;
            record.config_index = None;
            record.config_mask = 0;
        }
    }

    /// Close a discovery pass. The found count becomes the device count.
    pub fn finish_discovery(&mut self) -> usize {
        self.discovery_complete = true;
        self.device_count = self.found.len();
        self.device_count
    }

    pub fn discovery_complete(&self) -> bool {
        self.discovery_complete
    }

    pub fn device_count(&self) -> usize {
        self.device_count
    }

    pub fn mark_dirty(&mut self) {
        self.settings_dirty = true;
    }
}

/// Snapshot of the whole table for telemetry export.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    pub timestamp_ms: u64,
    pub discovery_complete: bool,
    pub device_count: usize,
    pub devices: Vec<DeviceSnapshot>,
}

/// Cloneable handle to the shared device table.
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    inner: Arc<Mutex<DeviceTable>>,
}

impl DeviceRegistry {
    /// Allocate records for addresses `1..=max_devices`, all invalid and idle.
    pub fn new(max_devices: u8) -> Self {
        let max_devices = max_devices.clamp(1, MAX_DEVICES as u8);
        Self {
            inner: Arc::new(Mutex::new(DeviceTable::new(max_devices))),
        }
    }

    /// Lock the table. Callers must not perform bus I/O or notify while holding the guard.
    pub fn lock(&self) -> MutexGuard<'_, DeviceTable> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn max_devices(&self) -> u8 {
        self.lock().max_devices()
    }

    pub fn check_address(&self, address: u8) -> Result<(), CommandError> {
        if address == 0 || address > self.max_devices() {
            return Err(CommandError::InvalidAddress(address));
        }
        Ok(())
    }

    /// Run `f` on one record after checking the address.
    pub fn update<R>(
        &self,
        address: u8,
        f: impl FnOnce(&mut DeviceRecord) -> R,
    ) -> Result<R, CommandError> {
        let mut table = self.lock();
        table
            .record_mut(address)
            .map(f)
            .ok_or(CommandError::InvalidAddress(address))
    }

    pub fn device(&self, address: u8) -> Result<DeviceSnapshot, CommandError> {
        self.lock()
            .record(address)
            .map(DeviceRecord::snapshot)
            .ok_or(CommandError::InvalidAddress(address))
    }

    pub fn status(&self, address: u8) -> Result<DeviceStatus, CommandError> {
        self.update(address, |record| record.status)
    }

    pub fn found(&self) -> FoundList {
        self.lock().found.clone()
    }

    pub fn discovery_complete(&self) -> bool {
        self.lock().discovery_complete
    }

    pub fn device_count(&self) -> usize {
        self.lock().device_count
    }

    /// Snapshot of every found device.
    pub fn snapshot(&self, now: Instant) -> TelemetrySnapshot {
        let table = self.lock();
        TelemetrySnapshot {
            timestamp_ms: now.ticks(),
            discovery_complete: table.discovery_complete,
            device_count: table.device_count,
            devices: table
                .found
                .iter()
                .filter_map(|&address| table.record(address))
                .map(DeviceRecord::snapshot)
                .collect(),
        }
    }

    /// Current persisted view of every record.
    pub fn settings(&self) -> Vec<DeviceSettings> {
        self.lock().records().map(DeviceSettings::from_record).collect()
    }

    /// Apply stored settings by address. Entries outside the table are ignored.
    pub fn restore(&self, settings: &[DeviceSettings]) -> usize {
        let mut table = self.lock();
        let mut applied = 0;
        for entry in settings {
            match table.record_mut(entry.address) {
                Some(record) => {
                    entry.apply_to(record);
                    applied += 1;
                }
                None => debug!(address = entry.address, "ignoring stored settings"),
            }
        }
        applied
    }

    pub fn mark_dirty(&self) {
        self.lock().settings_dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.lock().settings_dirty
    }

    /// True once per batch of settings changes.
    pub fn take_dirty(&self) -> bool {
        std::mem::take(&mut self.lock().settings_dirty)
    }

    pub fn request_rediscovery(&self) {
        self.lock().rediscovery_requested = true;
    }

    pub fn take_rediscovery(&self) -> bool {
        std::mem::take(&mut self.lock().rediscovery_requested)
    }
}

//! Persisted per-device settings and the stores that keep them.

use crate::curve::{Curve, CurveKind};
use crate::device::{ControlMode, DeviceRecord, Setpoints};
use crate::error::StoreError;
use crate::registry::DeviceRegistry;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Everything about a device that survives a restart, keyed by address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    pub address: u8,
    pub setpoints: Setpoints,
    pub total_kwh: f64,
    pub anode_kwh: f64,
    pub target_joules: f64,
    pub anode_threshold_joules: f64,
    pub curve: CurveKind,
    pub control_mode: ControlMode,
    pub operator: String,
    pub line_id: String,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self::from_record(&DeviceRecord::new(0))
    }
}

impl DeviceSettings {
    pub fn from_record(record: &DeviceRecord) -> Self {
        Self {
            address: record.address,
            setpoints: record.setpoints,
            total_kwh: record.energy.total_kwh,
            anode_kwh: record.energy.anode_kwh,
            target_joules: record.energy.target_joules,
            anode_threshold_joules: record.energy.anode_threshold_joules,
            curve: record.curve.kind,
            control_mode: record.control_mode,
            operator: record.operator.clone(),
            line_id: record.line_id.clone(),
        }
    }

    /// Copy the stored fields onto `record`. The address is not touched.
    pub fn apply_to(&self, record: &mut DeviceRecord) {
        record.setpoints = self.setpoints;
        record.energy.total_kwh = self.total_kwh;
        record.energy.anode_kwh = self.anode_kwh;
        record.energy.target_joules = self.target_joules;
        record.energy.anode_threshold_joules = self.anode_threshold_joules;
        record.curve = Curve::defaults_for(
            self.curve,
            self.setpoints.current_set,
            self.setpoints.idle_current,
        );
        record.control_mode = self.control_mode;
        record.operator = self.operator.clone();
        record.line_id = self.line_id.clone();
    }
}

/// Load/save collaborator. Implementations decide durability.
pub trait SettingsStore: Send + Sync {
    fn load(&self) -> Result<Vec<DeviceSettings>, StoreError>;
    fn save(&self, settings: &[DeviceSettings]) -> Result<(), StoreError>;
}

/// Pretty-printed JSON file. A missing file loads as no settings.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for JsonFileStore {
    fn load(&self) -> Result<Vec<DeviceSettings>, StoreError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&contents)?)
    }

    fn save(&self, settings: &[DeviceSettings]) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(settings)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), devices = settings.len(), "settings saved");
        Ok(())
    }
}

/// Keeps the last saved settings in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    saved: Mutex<Vec<DeviceSettings>>,
    saves: Mutex<usize>,
}

impl MemoryStore {
    pub fn new(initial: Vec<DeviceSettings>) -> Self {
        Self {
            saved: Mutex::new(initial),
            saves: Mutex::new(0),
        }
    }

    /// Number of completed saves.
    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SettingsStore for MemoryStore {
    fn load(&self) -> Result<Vec<DeviceSettings>, StoreError> {
        Ok(self.saved.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn save(&self, settings: &[DeviceSettings]) -> Result<(), StoreError> {
        *self.saved.lock().unwrap_or_else(|e| e.into_inner()) = settings.to_vec();
        *self.saves.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(())
    }
}

/// Save the table if anything changed since the last save. A failed save leaves the table
/// dirty so the next call retries.
pub fn save_if_dirty(registry: &DeviceRegistry, store: &dyn SettingsStore) -> Result<bool, StoreError> {
    if !registry.take_dirty() {
        return Ok(false);
    }
    store.save(&registry.settings()).inspect_err(|_| registry.mark_dirty())?;
    Ok(true)
}

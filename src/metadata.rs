use crate::address::Address;
use crate::device::thermostat::TempUnits;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// Motion-sensor namespace of a device record.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MotionMeta {
    /// Wall-clock seconds of the last battery voltage reading.
    pub battery_voltage_time: Option<f64>,
    /// Low-battery threshold override in volts.
    pub battery_low_voltage: Option<f32>,
}

/// Thermostat namespace of a device record.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ThermostatMeta {
    /// Device-reported unit preference.
    pub units: Option<TempUnits>,
}

/// Full per-device record, one namespace per device family.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DeviceMeta {
    #[serde(default)]
    pub motion: MotionMeta,
    #[serde(default)]
    pub thermostat: ThermostatMeta,
}

/// External database seam. Every namespace update hands the full record to
/// the persister; the store itself keeps no on-disk format.
pub trait MetaPersist: Send + Sync {
    fn save(&self, addr: Address, meta: &DeviceMeta);
}

/// Per-device metadata records.
///
/// Updates are read-modify-write against a single namespace; the other
/// namespace of the record is untouched.
pub struct MetaStore {
    records: RwLock<HashMap<Address, DeviceMeta>>,
    persist: Option<Box<dyn MetaPersist>>,
}

impl MetaStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            persist: None,
        }
    }

    pub fn with_persist(persist: Box<dyn MetaPersist>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            persist: Some(persist),
        }
    }

    /// Restore a record at startup.
    pub fn load(&self, addr: Address, meta: DeviceMeta) {
        crate::write(&self.records).insert(addr, meta);
    }

    pub fn device(&self, addr: Address) -> DeviceMeta {
        crate::read(&self.records)
            .get(&addr)
            .copied()
            .unwrap_or_default()
    }

    pub fn motion(&self, addr: Address) -> MotionMeta {
        self.device(addr).motion
    }

    pub fn thermostat(&self, addr: Address) -> ThermostatMeta {
        self.device(addr).thermostat
    }

    pub fn update_motion(&self, addr: Address, update: impl FnOnce(&mut MotionMeta)) {
        let record = {
            let mut records = crate::write(&self.records);
            let record = records.entry(addr).or_default();
            update(&mut record.motion);
            *record
        };
        self.saved(addr, &record);
    }

    pub fn update_thermostat(&self, addr: Address, update: impl FnOnce(&mut ThermostatMeta)) {
        let record = {
            let mut records = crate::write(&self.records);
            let record = records.entry(addr).or_default();
            update(&mut record.thermostat);
            *record
        };
        self.saved(addr, &record);
    }

    fn saved(&self, addr: Address, record: &DeviceMeta) {
        if let Some(persist) = &self.persist {
            persist.save(addr, record);
        }
    }
}

impl Default for MetaStore {
    fn default() -> Self {
        Self::new()
    }
}

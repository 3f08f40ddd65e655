pub mod motion;
pub mod thermostat;

pub use motion::{Motion, MotionCommand};
pub use thermostat::{Thermostat, ThermostatCommand};

use crate::address::Address;
use crate::handler::CommandError;
use crate::message::RxFrame;
use crate::transport::Link;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, trace};

/// Identity shared by every device kind.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub address: Address,
    pub name: String,
    /// Hardware model string from configuration, e.g. "2842-222".
    pub model: String,
}

impl DeviceInfo {
    pub fn new(address: Address, name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            address,
            name: name.into(),
            model: model.into(),
        }
    }
}

/// Behavior shared across device kinds; concrete state machines implement
/// this and the frame router talks to them through it.
pub trait Device: Send + Sync {
    fn info(&self) -> &DeviceInfo;

    fn address(&self) -> Address {
        self.info().address
    }

    /// Inbound group broadcast addressed from this device.
    fn handle_broadcast(&self, frame: &RxFrame);

    /// The device is known to be listening right now. Battery devices hook
    /// housekeeping here.
    fn awake(&self) {}
}

/// Routes inbound frames: active request handlers and watchers first (via
/// the link), then group broadcasts to the owning device.
pub struct DeviceSet {
    link: Arc<Link>,
    devices: RwLock<HashMap<Address, Arc<dyn Device>>>,
}

impl DeviceSet {
    pub fn new(link: Arc<Link>) -> Self {
        Self {
            link,
            devices: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, device: Arc<dyn Device>) {
        crate::write(&self.devices).insert(device.address(), device);
    }

    pub fn get(&self, addr: Address) -> Option<Arc<dyn Device>> {
        crate::read(&self.devices).get(&addr).cloned()
    }

    pub fn process(&self, frame: &RxFrame) {
        if self.link.process(frame) {
            return;
        }

        let device = self.get(frame.from);
        let Some(device) = device else {
            debug!(from = %frame.from, "frame from unknown device");
            return;
        };

        if frame.flags.is_broadcast() {
            device.awake();
            device.handle_broadcast(frame);
        } else {
            trace!(from = %frame.from, cmd1 = frame.cmd1, "unhandled direct frame");
        }
    }
}

/// Wall-clock seconds.
pub(crate) fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Lenient boolean argument parsing for bridge payloads.
pub(crate) fn parse_bool(field: &str, value: &Value) -> Result<bool, CommandError> {
    let invalid = || CommandError::InvalidArgument {
        field: field.to_string(),
        value: value.to_string(),
    };

    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => match n.as_i64() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(invalid()),
        },
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "true" | "1" | "on" | "yes" => Ok(true),
            "false" | "0" | "off" | "no" => Ok(false),
            _ => Err(invalid()),
        },
        _ => Err(invalid()),
    }
}

pub(crate) fn parse_u32(field: &str, value: &Value) -> Result<u32, CommandError> {
    let invalid = || CommandError::InvalidArgument {
        field: field.to_string(),
        value: value.to_string(),
    };

    match value {
        Value::Number(n) => n
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(invalid),
        Value::String(s) => s.trim().parse().map_err(|_| invalid()),
        _ => Err(invalid()),
    }
}

pub(crate) fn parse_f32(field: &str, value: &Value) -> Result<f32, CommandError> {
    let invalid = || CommandError::InvalidArgument {
        field: field.to_string(),
        value: value.to_string(),
    };

    match value {
        Value::Number(n) => n.as_f64().map(|v| v as f32).ok_or_else(invalid),
        Value::String(s) => s.trim().parse().map_err(|_| invalid()),
        _ => Err(invalid()),
    }
}

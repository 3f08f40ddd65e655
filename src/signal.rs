use crate::address::Address;
use crate::device::thermostat::{FanMode, RunStatus, ThermostatMode};
use serde::Serialize;
use std::sync::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

/// Everything a device can report outward. The MQTT adapter subscribes and
/// maps these onto topics.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum DeviceEvent {
    Motion { on: bool },
    DawnDusk { dawn: bool },
    LowBattery { low: bool },
    BatteryVoltage { volts: f32 },
    Heartbeat,
    AmbientTemp { celsius: f32 },
    AmbientHumidity { percent: u8 },
    ModeChange { mode: ThermostatMode },
    FanModeChange { fan: FanMode },
    CoolSetpoint { celsius: f32 },
    HeatSetpoint { celsius: f32 },
    StatusChange { status: RunStatus },
    HoldChange { on: bool },
    EnergyChange { on: bool },
    HumidityAlarm { high: bool, active: bool },
}

type Subscriber = Box<dyn Fn(Address, &DeviceEvent) + Send + Sync>;

/// In-process publish/subscribe of device events.
///
/// Delivery is synchronous: every subscriber runs before `emit` returns, so
/// an event emitted inside a reply handler is observed before the handler
/// completes. Subscribers must not re-enter the command pipeline.
pub struct EventBus {
    subscribers: RwLock<Vec<Subscriber>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, subscriber: impl Fn(Address, &DeviceEvent) + Send + Sync + 'static) {
        crate::write(&self.subscribers).push(Box::new(subscriber));
    }

    /// Channel tap for async consumers. Events are cloned into the channel
    /// at emit time.
    pub fn watch(&self) -> mpsc::UnboundedReceiver<(Address, DeviceEvent)> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribe(move |addr, event| {
            let _ = tx.send((addr, event.clone()));
        });
        rx
    }

    pub fn emit(&self, addr: Address, event: DeviceEvent) {
        debug!(device = %addr, ?event, "device event");
        let subscribers = crate::read(&self.subscribers);
        for subscriber in subscribers.iter() {
            subscriber(addr, &event);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

//! # Insteon Bridge Core
//!
//! The command-sequencing and device-protocol core of an Insteon home-automation
//! bridge: it turns high-level device intents ("set the cool setpoint to 22 °C",
//! "read the motion sensor operating flags") into a correctly ordered series of
//! Insteon wire messages, waits for each acknowledgement or reply, updates device
//! state from broadcast and direct messages, and reports completion or failure.
//!
//! ## Features
//!
//! - **Sequenced command execution**: one-shot pipelines that run protocol
//!   operations strictly in order with short-circuit failure propagation
//! - **Device state machines**: motion sensor and thermostat handlers that
//!   decode bit-packed payloads into typed events and build outbound frames
//!   with the correct opcodes, unit conversions, and bounds clamping
//! - **Per-request reply handlers**: ACK/NAK matching with retry budgets
//! - **Per-device metadata**: typed namespace records persisted through an
//!   external store
//! - **Event bus**: synchronous in-process publish/subscribe consumed by the
//!   outward MQTT adapter
//!
//! ## Architecture
//!
//! - [`address`] - Insteon device addressing
//! - [`message`] - wire frame codec (standard/extended frames, CRC16)
//! - [`handler`] - per-request reply handlers and the active-request registry
//! - [`sequence`] - ordered command executor
//! - [`transport`] - per-device send queues over the PLM write half
//! - [`signal`] - device event bus
//! - [`metadata`] - per-device metadata records
//! - [`device`] - device state machines (motion, thermostat)
//!
//! The raw serial transport, the MQTT broker bridge, the configuration loader,
//! and link-database manipulation are external collaborators; this crate talks
//! to them through the [`transport::FrameSink`], [`metadata::MetaPersist`], and
//! [`signal::EventBus`] seams.

pub mod address;
pub mod device;
pub mod handler;
pub mod message;
pub mod metadata;
pub mod sequence;
pub mod signal;
pub mod transport;

pub use address::Address;
pub use device::{Device, DeviceInfo, DeviceSet, Motion, Thermostat};
pub use handler::{CommandError, Completion, StepResult};
pub use message::{Flags, MsgKind, RxFrame, TxFrame};
pub use metadata::MetaStore;
pub use sequence::CommandSeq;
pub use signal::{DeviceEvent, EventBus};
pub use transport::Link;

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(rwlock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    rwlock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(rwlock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    rwlock.write().unwrap_or_else(PoisonError::into_inner)
}

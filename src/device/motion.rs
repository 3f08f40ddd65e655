use crate::device::{epoch_now, parse_bool, parse_f32, parse_u32, Device, DeviceInfo};
use crate::handler::{
    CommandError, Completion, ExtendedCmdResponse, ReplyHandler, StandardCmd, StepResult,
};
use crate::message::{RxFrame, TxFrame, CMD_EXT_GET_SET, CMD_OFF, CMD_ON};
use crate::metadata::MetaStore;
use crate::sequence::CommandSeq;
use crate::signal::{DeviceEvent, EventBus};
use crate::transport::Link;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Re-read the battery after this long without a voltage sample.
const BATTERY_TIME_S: f64 = 4.0 * 24.0 * 3600.0;
/// Minimum spacing between auto-requests.
const BATTERY_REQUEST_DEDUPE_S: f64 = 300.0;

const DEFAULT_LOW_VOLTAGE_2842: f32 = 7.0;
const DEFAULT_LOW_VOLTAGE_2844: f32 = 1.85;

const SUB_CMD_TIMEOUT: u8 = 0x03;
const SUB_CMD_LIGHT_SENSITIVITY: u8 = 0x04;
const SUB_CMD_FLAGS: u8 = 0x05;

const FLAG_LED_ON: u8 = 0b0000_1000;
// These two store the inverse of the exposed setting.
const FLAG_ANY_TIME: u8 = 0b0000_0100;
const FLAG_ON_OFF: u8 = 0b0000_0010;

const GROUP_MOTION: u8 = 0x01;
const GROUP_DAWN_DUSK: u8 = 0x02;
const GROUP_BATTERY: u8 = 0x03;
const GROUP_HEARTBEAT: u8 = 0x04;

/// Operating flags held in D6 of the extended get response and written
/// through sub-command 0x05. Undefined bits are written as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperatingFlags {
    pub led_on: bool,
    pub night_only: bool,
    pub on_only: bool,
}

impl OperatingFlags {
    pub fn decode(byte: u8) -> Self {
        Self {
            led_on: byte & FLAG_LED_ON != 0,
            night_only: byte & FLAG_ANY_TIME == 0,
            on_only: byte & FLAG_ON_OFF == 0,
        }
    }

    pub fn encode(&self) -> u8 {
        let mut byte = 0u8;
        if self.led_on {
            byte |= FLAG_LED_ON;
        }
        if !self.night_only {
            byte |= FLAG_ANY_TIME;
        }
        if !self.on_only {
            byte |= FLAG_ON_OFF;
        }
        byte
    }
}

/// Commands the bridge can run against a motion sensor.
#[derive(Debug, Clone, PartialEq)]
pub enum MotionCommand {
    SetLowBatteryVoltage {
        volts: f32,
    },
    GetBatteryVoltage,
    UpdateFlags {
        led_on: Option<bool>,
        night_only: Option<bool>,
        on_only: Option<bool>,
    },
    SetTimeout {
        seconds: u32,
    },
    SetLightSensitivity {
        level: u32,
    },
}

impl MotionCommand {
    /// Build a command from a bridge payload. Unknown names and malformed
    /// arguments are typed errors; nothing reaches the wire.
    pub fn parse(name: &str, args: &Value) -> Result<Self, CommandError> {
        match name {
            "set_low_battery_voltage" => {
                let value = args
                    .get("voltage")
                    .ok_or_else(|| CommandError::MissingArgument("voltage".into()))?;
                Ok(Self::SetLowBatteryVoltage {
                    volts: parse_f32("voltage", value)?,
                })
            }
            "get_battery_voltage" => Ok(Self::GetBatteryVoltage),
            "update_flags" => {
                let field = |key: &str| -> Result<Option<bool>, CommandError> {
                    args.get(key).map(|v| parse_bool(key, v)).transpose()
                };
                Ok(Self::UpdateFlags {
                    led_on: field("led_on")?,
                    night_only: field("night_only")?,
                    on_only: field("on_only")?,
                })
            }
            "set_flags" => {
                if let Some(value) = args.get("timeout") {
                    return Ok(Self::SetTimeout {
                        seconds: parse_u32("timeout", value)?,
                    });
                }
                if let Some(value) = args.get("light_sensitivity") {
                    return Ok(Self::SetLightSensitivity {
                        level: parse_u32("light_sensitivity", value)?,
                    });
                }
                Err(CommandError::MissingArgument(
                    "timeout or light_sensitivity".into(),
                ))
            }
            other => Err(CommandError::UnknownCommand(other.to_string())),
        }
    }
}

/// Decide whether a battery voltage auto-request should fire.
pub fn battery_request_due(
    last_reading: Option<f64>,
    last_request: Option<f64>,
    now: f64,
) -> bool {
    let reading_stale = match last_reading {
        Some(t) => now - t >= BATTERY_TIME_S,
        None => true,
    };
    let request_recent = match last_request {
        Some(t) => now - t < BATTERY_REQUEST_DEDUPE_S,
        None => false,
    };
    reading_stale && !request_recent
}

/// Insteon motion sensor (2842 / 2844 families).
///
/// Battery powered: outbound writes sit in the device queue until the sensor
/// wakes, and the battery level is re-checked opportunistically whenever
/// traffic flows.
pub struct Motion {
    info: DeviceInfo,
    link: Arc<Link>,
    bus: Arc<EventBus>,
    meta: Arc<MetaStore>,
    last_battery_request: Mutex<Option<f64>>,
}

impl Motion {
    pub fn new(
        info: DeviceInfo,
        link: Arc<Link>,
        bus: Arc<EventBus>,
        meta: Arc<MetaStore>,
    ) -> Arc<Self> {
        let device = Arc::new(Self {
            info,
            link,
            bus,
            meta,
            last_battery_request: Mutex::new(None),
        });

        let weak = Arc::downgrade(&device);
        device.link.set_wake_hook(
            device.info.address,
            Arc::new(move || {
                if let Some(device) = weak.upgrade() {
                    device.note_awake();
                }
            }),
        );

        device
    }

    fn is_2842(&self) -> bool {
        self.info.model.starts_with("2842")
    }

    fn battery_powered(&self) -> bool {
        self.is_2842() || self.info.model.starts_with("2844")
    }

    fn default_low_voltage(&self) -> f32 {
        if self.is_2842() {
            DEFAULT_LOW_VOLTAGE_2842
        } else {
            DEFAULT_LOW_VOLTAGE_2844
        }
    }

    /// Effective low-battery threshold: metadata override, else the model
    /// default.
    pub fn low_battery_threshold(&self) -> f32 {
        self.meta
            .motion(self.info.address)
            .battery_low_voltage
            .unwrap_or_else(|| self.default_low_voltage())
    }

    pub async fn run_command(&self, command: MotionCommand) -> StepResult {
        match command {
            MotionCommand::SetLowBatteryVoltage { volts } => {
                self.set_low_battery_voltage(volts).await
            }
            MotionCommand::GetBatteryVoltage => self.get_battery_voltage().await,
            MotionCommand::UpdateFlags {
                led_on,
                night_only,
                on_only,
            } => self.update_flags(led_on, night_only, on_only).await,
            MotionCommand::SetTimeout { seconds } => self.set_timeout(seconds).await,
            MotionCommand::SetLightSensitivity { level } => {
                self.set_light_sensitivity(level).await
            }
        }
    }

    /// Store the low-battery threshold override. Purely a metadata write;
    /// completes locally.
    pub async fn set_low_battery_voltage(&self, volts: f32) -> StepResult {
        self.meta.update_motion(self.info.address, |m| {
            m.battery_low_voltage = Some(volts);
        });
        Ok(Completion::with_message("Motion low battery voltage set"))
    }

    /// Read the operating flags / battery voltage report.
    pub async fn get_battery_voltage(&self) -> StepResult {
        let frame = TxFrame::get_set(self.info.address, 0x00, 0x00);
        let handler = self.flags_response_handler(None);
        self.link.request(frame, handler).await
    }

    /// Read-modify-write of the operating flag bits. Arguments left out keep
    /// their current value.
    pub async fn update_flags(
        &self,
        led_on: Option<bool>,
        night_only: Option<bool>,
        on_only: Option<bool>,
    ) -> StepResult {
        let mut seq = CommandSeq::new(Arc::clone(&self.link), "Motion Set Flags Success");

        let current: Arc<Mutex<Option<u8>>> = Arc::new(Mutex::new(None));
        let frame = TxFrame::get_set(self.info.address, 0x00, 0x00);
        let handler = self.flags_response_handler(Some(Arc::clone(&current)));
        seq.add_msg(frame, handler);

        let link = Arc::clone(&self.link);
        let addr = self.info.address;
        seq.add_task(move || async move {
            let byte = crate::lock(&current)
                .take()
                .ok_or_else(|| CommandError::Failed("no flags reading received".into()))?;
            let mut flags = OperatingFlags::decode(byte);
            if let Some(led_on) = led_on {
                flags.led_on = led_on;
            }
            if let Some(night_only) = night_only {
                flags.night_only = night_only;
            }
            if let Some(on_only) = on_only {
                flags.on_only = on_only;
            }

            let frame = TxFrame::get_set(addr, SUB_CMD_FLAGS, flags.encode());
            let handler = StandardCmd::new(CMD_EXT_GET_SET, move |_| {
                Ok(Completion::with_data(
                    "Motion flags written",
                    json!({ "flags": flags.encode() }),
                ))
            });
            link.request(frame, Box::new(handler)).await
        });

        seq.run().await
    }

    /// Encoded motion report timeout; clamping and scale depend on the model.
    pub fn encode_timeout(&self, seconds: u32) -> u8 {
        if self.is_2842() {
            let seconds = seconds.clamp(30, 14_400);
            (seconds / 30 - 1) as u8
        } else {
            let seconds = seconds.clamp(10, 2_400);
            (seconds / 10) as u8
        }
    }

    pub async fn set_timeout(&self, seconds: u32) -> StepResult {
        let encoded = self.encode_timeout(seconds);
        self.write_setting(SUB_CMD_TIMEOUT, encoded, "Motion timeout set")
            .await
    }

    pub async fn set_light_sensitivity(&self, level: u32) -> StepResult {
        let encoded = level.min(255) as u8;
        self.write_setting(
            SUB_CMD_LIGHT_SENSITIVITY,
            encoded,
            "Motion light sensitivity set",
        )
        .await
    }

    async fn write_setting(&self, sub_cmd: u8, value: u8, success: &str) -> StepResult {
        let frame = TxFrame::get_set(self.info.address, sub_cmd, value);
        let message = success.to_string();
        let handler = StandardCmd::new(CMD_EXT_GET_SET, move |_| {
            Ok(Completion::with_message(message.clone()))
        });
        self.link.request(frame, Box::new(handler)).await
    }

    /// Fire a battery voltage request when the last sample has gone stale.
    /// Runs on every wake and on every dequeue of the device send queue.
    pub fn note_awake(&self) {
        if !self.battery_powered() {
            return;
        }

        let now = epoch_now();
        let last_reading = self.meta.motion(self.info.address).battery_voltage_time;
        let due = {
            let mut last_request = crate::lock(&self.last_battery_request);
            if battery_request_due(last_reading, *last_request, now) {
                *last_request = Some(now);
                true
            } else {
                false
            }
        };
        if !due {
            return;
        }

        info!(device = %self.info.name, "requesting battery voltage");
        let link = Arc::clone(&self.link);
        let name = self.info.name.clone();
        let frame = TxFrame::get_set(self.info.address, 0x00, 0x00);
        let handler = self.flags_response_handler(None);
        tokio::spawn(async move {
            if let Err(err) = link.request(frame, handler).await {
                warn!(device = %name, %err, "battery voltage request failed");
            }
        });
    }

    /// Handler for the extended flags/battery report. When `flags_out` is
    /// given, D6 is stored there for a follow-up write step.
    fn flags_response_handler(
        &self,
        flags_out: Option<Arc<Mutex<Option<u8>>>>,
    ) -> Box<dyn ReplyHandler> {
        let bus = Arc::clone(&self.bus);
        let meta = Arc::clone(&self.meta);
        let addr = self.info.address;
        let tenths_scale = self.is_2842();
        let default_low = self.default_low_voltage();

        Box::new(ExtendedCmdResponse::new(CMD_EXT_GET_SET, move |frame| {
            let flags_byte = frame.d(6);
            if let Some(out) = &flags_out {
                *crate::lock(out) = Some(flags_byte);
            }

            let raw = frame.d(12);
            let volts = if tenths_scale {
                f32::from(raw) / 10.0
            } else {
                (f32::from(raw) / 72.0 * 100.0).round() / 100.0
            };

            meta.update_motion(addr, |m| {
                m.battery_voltage_time = Some(epoch_now());
            });
            let threshold = meta.motion(addr).battery_low_voltage.unwrap_or(default_low);

            bus.emit(addr, DeviceEvent::BatteryVoltage { volts });
            bus.emit(
                addr,
                DeviceEvent::LowBattery {
                    low: volts <= threshold,
                },
            );

            Ok(Completion::with_data(
                "Motion flags received",
                json!({ "flags": flags_byte, "voltage": volts }),
            ))
        }))
    }
}

impl Device for Motion {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn handle_broadcast(&self, frame: &RxFrame) {
        let Some(group) = frame.group() else {
            return;
        };

        match group {
            GROUP_MOTION => match frame.cmd1 {
                CMD_ON => self.bus.emit(self.info.address, DeviceEvent::Motion { on: true }),
                CMD_OFF => self.bus.emit(self.info.address, DeviceEvent::Motion { on: false }),
                other => debug!(cmd1 = other, "unknown motion group command"),
            },
            GROUP_DAWN_DUSK => match frame.cmd1 {
                CMD_ON | CMD_OFF => self.bus.emit(
                    self.info.address,
                    DeviceEvent::DawnDusk {
                        dawn: frame.cmd1 == CMD_ON,
                    },
                ),
                other => debug!(cmd1 = other, "unknown dawn/dusk group command"),
            },
            GROUP_BATTERY => match frame.cmd1 {
                CMD_ON | CMD_OFF => self.bus.emit(
                    self.info.address,
                    DeviceEvent::LowBattery {
                        low: frame.cmd1 == CMD_ON,
                    },
                ),
                other => debug!(cmd1 = other, "unknown battery group command"),
            },
            GROUP_HEARTBEAT => {
                if frame.cmd1 == CMD_ON {
                    self.bus.emit(self.info.address, DeviceEvent::Heartbeat);
                }
            }
            // Newer models only emit group 1; anything else is tolerated.
            other => debug!(group = other, "unhandled motion broadcast group"),
        }
    }

    fn awake(&self) {
        self.note_awake();
    }
}

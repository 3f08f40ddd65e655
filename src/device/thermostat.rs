use crate::address::Address;
use crate::device::{parse_f32, Device, DeviceInfo};
use crate::handler::{
    CommandError, Completion, ExtendedCmdResponse, StandardCmd, StepResult,
};
use crate::message::{MsgKind, RxFrame, TxFrame, CMD_EXT_GET_SET, CMD_OFF, CMD_ON};
use crate::metadata::MetaStore;
use crate::signal::{DeviceEvent, EventBus};
use crate::transport::Link;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Every thermostat request gets this retry budget.
const NUM_RETRY: u8 = 3;

const CMD_CONTROL: u8 = 0x6b;
const CMD_COOL_SETPOINT: u8 = 0x6c;
const CMD_HEAT_SETPOINT: u8 = 0x6d;

const STATUS_REQUEST_CMD2: u8 = 0x02;
const SUB_CMD_ENABLE_BROADCAST: u8 = 0x08;

// Direct status reports sent by the device once broadcast is enabled.
const STATUS_TEMP: u8 = 0x6e;
const STATUS_HUMIDITY: u8 = 0x6f;
const STATUS_MODE: u8 = 0x70;
const STATUS_COOL_SP: u8 = 0x71;
const STATUS_HEAT_SP: u8 = 0x72;

const SETPOINT_MAX: f32 = 127.0;

const FLAG_COOLING: u8 = 0x01;
const FLAG_HEATING: u8 = 0x02;
const FLAG_ENERGY: u8 = 0x04;
const FLAG_UNITS: u8 = 0x08;
const FLAG_HOLD: u8 = 0x10;

/// Temperature units the device reports and expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TempUnits {
    Fahrenheit,
    Celsius,
}

pub fn to_celsius(value: f32, units: TempUnits) -> f32 {
    match units {
        TempUnits::Fahrenheit => (value - 32.0) * 5.0 / 9.0,
        TempUnits::Celsius => value,
    }
}

pub fn from_celsius(value: f32, units: TempUnits) -> f32 {
    match units {
        TempUnits::Fahrenheit => value * 9.0 / 5.0 + 32.0,
        TempUnits::Celsius => value,
    }
}

/// Celsius input to the single-byte wire encoding: device units, clamped to
/// [0, 127], doubled.
pub fn encode_setpoint(temp_c: f32, units: TempUnits) -> u8 {
    let device_units = from_celsius(temp_c, units).clamp(0.0, SETPOINT_MAX);
    (device_units * 2.0).round() as u8
}

pub fn decode_setpoint(cmd2: u8, units: TempUnits) -> f32 {
    to_celsius(f32::from(cmd2) / 2.0, units)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThermostatMode {
    Off,
    Auto,
    Heat,
    Cool,
    Program,
}

impl ThermostatMode {
    /// High nibble of D6 in the status response.
    pub fn from_status_nibble(nibble: u8) -> Option<Self> {
        match nibble {
            0 => Some(Self::Off),
            1 => Some(Self::Auto),
            2 => Some(Self::Heat),
            3 => Some(Self::Cool),
            4 => Some(Self::Program),
            _ => None,
        }
    }

    /// cmd2 of the outbound 0x6b control message.
    pub fn command_code(&self) -> u8 {
        match self {
            Self::Off => 0x09,
            Self::Heat => 0x04,
            Self::Cool => 0x05,
            Self::Auto => 0x06,
            Self::Program => 0x0a,
        }
    }

    pub fn from_command_code(code: u8) -> Option<Self> {
        match code {
            0x09 => Some(Self::Off),
            0x04 => Some(Self::Heat),
            0x05 => Some(Self::Cool),
            0x06 => Some(Self::Auto),
            0x0a => Some(Self::Program),
            _ => None,
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "off" => Some(Self::Off),
            "auto" => Some(Self::Auto),
            "heat" => Some(Self::Heat),
            "cool" => Some(Self::Cool),
            "program" => Some(Self::Program),
            _ => None,
        }
    }
}

impl fmt::Display for ThermostatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Off => "off",
            Self::Auto => "auto",
            Self::Heat => "heat",
            Self::Cool => "cool",
            Self::Program => "program",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FanMode {
    Auto,
    On,
}

impl FanMode {
    pub fn from_status_bit(on: bool) -> Self {
        if on {
            Self::On
        } else {
            Self::Auto
        }
    }

    pub fn command_code(&self) -> u8 {
        match self {
            Self::On => 0x07,
            Self::Auto => 0x08,
        }
    }

    pub fn from_command_code(code: u8) -> Option<Self> {
        match code {
            0x07 => Some(Self::On),
            0x08 => Some(Self::Auto),
            _ => None,
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "on" => Some(Self::On),
            _ => None,
        }
    }
}

impl fmt::Display for FanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::On => write!(f, "on"),
        }
    }
}

/// What the unit is actively doing; cooling wins when both stage bits are
/// set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Off,
    Heating,
    Cooling,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Off => "off",
            Self::Heating => "heating",
            Self::Cooling => "cooling",
        };
        write!(f, "{name}")
    }
}

/// Broadcast groups the thermostat is a controller of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThermostatGroup {
    Cooling,
    Heating,
    HumidHigh,
    HumidLow,
    Broadcast,
}

impl ThermostatGroup {
    pub fn from_group(group: u8) -> Option<Self> {
        match group {
            0x01 => Some(Self::Cooling),
            0x02 => Some(Self::Heating),
            0x03 => Some(Self::HumidHigh),
            0x04 => Some(Self::HumidLow),
            0xef => Some(Self::Broadcast),
            _ => None,
        }
    }
}

/// Commands the bridge can run against a thermostat.
#[derive(Debug, Clone, PartialEq)]
pub enum ThermostatCommand {
    GetStatus,
    SetMode(ThermostatMode),
    SetFan(FanMode),
    SetHeatSetpoint { celsius: f32 },
    SetCoolSetpoint { celsius: f32 },
    EnableBroadcast,
}

impl ThermostatCommand {
    pub fn parse(name: &str, args: &Value) -> Result<Self, CommandError> {
        let mode_arg = |key: &str| -> Result<String, CommandError> {
            let value = args
                .get(key)
                .ok_or_else(|| CommandError::MissingArgument(key.into()))?;
            value
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| CommandError::InvalidArgument {
                    field: key.into(),
                    value: value.to_string(),
                })
        };
        let temp_arg = || -> Result<f32, CommandError> {
            let value = args
                .get("temp")
                .ok_or_else(|| CommandError::MissingArgument("temp".into()))?;
            parse_f32("temp", value)
        };

        match name {
            "get_status" => Ok(Self::GetStatus),
            "mode_command" => {
                let raw = mode_arg("mode")?;
                let mode = ThermostatMode::parse(&raw).ok_or_else(|| {
                    CommandError::InvalidArgument {
                        field: "mode".into(),
                        value: raw,
                    }
                })?;
                Ok(Self::SetMode(mode))
            }
            "fan_command" => {
                let raw = mode_arg("mode")?;
                let fan = FanMode::parse(&raw).ok_or_else(|| CommandError::InvalidArgument {
                    field: "mode".into(),
                    value: raw,
                })?;
                Ok(Self::SetFan(fan))
            }
            "heat_sp_command" => Ok(Self::SetHeatSetpoint { celsius: temp_arg()? }),
            "cool_sp_command" => Ok(Self::SetCoolSetpoint { celsius: temp_arg()? }),
            "enable_broadcast" => Ok(Self::EnableBroadcast),
            other => Err(CommandError::UnknownCommand(other.to_string())),
        }
    }
}

/// Insteon thermostat (2441 family).
///
/// Internal temperatures are Celsius throughout; conversion to the device's
/// reported units happens only when frames are built or decoded.
pub struct Thermostat {
    info: DeviceInfo,
    link: Arc<Link>,
    bus: Arc<EventBus>,
    meta: Arc<MetaStore>,
}

impl Thermostat {
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
        });

        // Status reports arrive as plain direct messages outside any
        // request; intercept them at the link.
        let weak = Arc::downgrade(&device);
        device.link.add_watcher(device.info.address, move |frame| {
            weak.upgrade()
                .map(|device| device.handle_direct_status(frame))
                .unwrap_or(false)
        });

        device
    }

    /// Device-reported units; Fahrenheit until the device says otherwise.
    pub fn units(&self) -> TempUnits {
        self.meta
            .thermostat(self.info.address)
            .units
            .unwrap_or(TempUnits::Fahrenheit)
    }

    pub async fn run_command(&self, command: ThermostatCommand) -> StepResult {
        match command {
            ThermostatCommand::GetStatus => self.get_status().await,
            ThermostatCommand::SetMode(mode) => self.mode_command(mode).await,
            ThermostatCommand::SetFan(fan) => self.fan_command(fan).await,
            ThermostatCommand::SetHeatSetpoint { celsius } => {
                self.heat_sp_command(celsius).await
            }
            ThermostatCommand::SetCoolSetpoint { celsius } => {
                self.cool_sp_command(celsius).await
            }
            ThermostatCommand::EnableBroadcast => self.enable_broadcast().await,
        }
    }

    /// Full status read: extended (0x2e, 0x02) with checksum, reply parsed
    /// field by field into events.
    pub async fn get_status(&self) -> StepResult {
        let frame = TxFrame::direct_ext(
            self.info.address,
            CMD_EXT_GET_SET,
            STATUS_REQUEST_CMD2,
            [0u8; 14],
        )
        .with_crc();

        let bus = Arc::clone(&self.bus);
        let meta = Arc::clone(&self.meta);
        let addr = self.info.address;
        let handler = ExtendedCmdResponse::with_retries(
            CMD_EXT_GET_SET,
            move |frame| process_status(&bus, &meta, addr, frame),
            NUM_RETRY,
        );
        self.link.request(frame, Box::new(handler)).await
    }

    /// Switch the operating mode. The ACK echoes the mode code; a matching
    /// event fires even when the device was already in that mode.
    pub async fn mode_command(&self, mode: ThermostatMode) -> StepResult {
        let frame = TxFrame::direct(self.info.address, CMD_CONTROL, mode.command_code());
        let bus = Arc::clone(&self.bus);
        let addr = self.info.address;
        let handler = StandardCmd::with_retries(
            CMD_CONTROL,
            move |ack| match ThermostatMode::from_command_code(ack.cmd2) {
                Some(mode) => {
                    bus.emit(addr, DeviceEvent::ModeChange { mode });
                    Ok(Completion::with_data(
                        "Thermostat mode set",
                        json!({ "mode": mode.to_string() }),
                    ))
                }
                None => {
                    warn!(cmd2 = ack.cmd2, "unknown mode code in ack");
                    Ok(Completion::with_message("Thermostat mode set"))
                }
            },
            NUM_RETRY,
        );
        self.link.request(frame, Box::new(handler)).await
    }

    pub async fn fan_command(&self, fan: FanMode) -> StepResult {
        let frame = TxFrame::direct(self.info.address, CMD_CONTROL, fan.command_code());
        let bus = Arc::clone(&self.bus);
        let addr = self.info.address;
        let handler = StandardCmd::with_retries(
            CMD_CONTROL,
            move |ack| match FanMode::from_command_code(ack.cmd2) {
                Some(fan) => {
                    bus.emit(addr, DeviceEvent::FanModeChange { fan });
                    Ok(Completion::with_data(
                        "Thermostat fan mode set",
                        json!({ "fan": fan.to_string() }),
                    ))
                }
                None => {
                    warn!(cmd2 = ack.cmd2, "unknown fan code in ack");
                    Ok(Completion::with_message("Thermostat fan mode set"))
                }
            },
            NUM_RETRY,
        );
        self.link.request(frame, Box::new(handler)).await
    }

    pub async fn heat_sp_command(&self, temp_c: f32) -> StepResult {
        self.setpoint_command(CMD_HEAT_SETPOINT, temp_c).await
    }

    pub async fn cool_sp_command(&self, temp_c: f32) -> StepResult {
        self.setpoint_command(CMD_COOL_SETPOINT, temp_c).await
    }

    async fn setpoint_command(&self, cmd1: u8, temp_c: f32) -> StepResult {
        let units = self.units();
        let encoded = encode_setpoint(temp_c, units);
        let frame = TxFrame::direct(self.info.address, cmd1, encoded);

        let bus = Arc::clone(&self.bus);
        let addr = self.info.address;
        let handler = StandardCmd::with_retries(
            cmd1,
            move |ack| {
                let celsius = decode_setpoint(ack.cmd2, units);
                let event = if cmd1 == CMD_COOL_SETPOINT {
                    DeviceEvent::CoolSetpoint { celsius }
                } else {
                    DeviceEvent::HeatSetpoint { celsius }
                };
                bus.emit(addr, event);
                Ok(Completion::with_data(
                    "Thermostat setpoint set",
                    json!({ "setpoint_c": celsius }),
                ))
            },
            NUM_RETRY,
        );
        self.link.request(frame, Box::new(handler)).await
    }

    /// Tell the device to report status changes as direct messages. The last
    /// step of pairing; the link-database steps live outside this crate.
    pub async fn enable_broadcast(&self) -> StepResult {
        let frame = TxFrame::get_set(self.info.address, SUB_CMD_ENABLE_BROADCAST, 0x01)
            .with_crc();
        let handler = StandardCmd::with_retries(
            CMD_EXT_GET_SET,
            |_| Ok(Completion::with_message("Thermostat broadcast enabled")),
            NUM_RETRY,
        );
        self.link.request(frame, Box::new(handler)).await
    }

    /// Direct (non-reply) status reports: one value per message, selected by
    /// cmd1.
    fn handle_direct_status(&self, frame: &RxFrame) -> bool {
        if frame.flags.kind() != MsgKind::Direct || frame.flags.is_extended() {
            return false;
        }

        let addr = self.info.address;
        let units = self.units();
        match frame.cmd1 {
            STATUS_TEMP => {
                let celsius = to_celsius(f32::from(frame.cmd2) / 2.0, units);
                self.bus.emit(addr, DeviceEvent::AmbientTemp { celsius });
            }
            STATUS_HUMIDITY => {
                self.bus.emit(
                    addr,
                    DeviceEvent::AmbientHumidity {
                        percent: frame.cmd2.min(100),
                    },
                );
            }
            STATUS_MODE => match ThermostatMode::from_status_nibble(frame.cmd2 & 0x0f) {
                Some(mode) => self.bus.emit(addr, DeviceEvent::ModeChange { mode }),
                None => warn!(cmd2 = frame.cmd2, "unknown mode in status report"),
            },
            STATUS_COOL_SP => {
                let celsius = to_celsius(f32::from(frame.cmd2) / 2.0, units);
                self.bus.emit(addr, DeviceEvent::CoolSetpoint { celsius });
            }
            STATUS_HEAT_SP => {
                let celsius = to_celsius(f32::from(frame.cmd2) / 2.0, units);
                self.bus.emit(addr, DeviceEvent::HeatSetpoint { celsius });
            }
            _ => return false,
        }
        true
    }

    fn emit_condition(&self, status: RunStatus, cmd1: u8) {
        match cmd1 {
            CMD_ON => self
                .bus
                .emit(self.info.address, DeviceEvent::StatusChange { status }),
            CMD_OFF => self.bus.emit(
                self.info.address,
                DeviceEvent::StatusChange {
                    status: RunStatus::Off,
                },
            ),
            other => debug!(cmd1 = other, "unknown condition command"),
        }
    }
}

impl Device for Thermostat {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn handle_broadcast(&self, frame: &RxFrame) {
        let Some(group) = frame.group() else {
            return;
        };

        match ThermostatGroup::from_group(group) {
            Some(ThermostatGroup::Cooling) => self.emit_condition(RunStatus::Cooling, frame.cmd1),
            Some(ThermostatGroup::Heating) => self.emit_condition(RunStatus::Heating, frame.cmd1),
            Some(ThermostatGroup::HumidHigh) => self.bus.emit(
                self.info.address,
                DeviceEvent::HumidityAlarm {
                    high: true,
                    active: frame.cmd1 == CMD_ON,
                },
            ),
            Some(ThermostatGroup::HumidLow) => self.bus.emit(
                self.info.address,
                DeviceEvent::HumidityAlarm {
                    high: false,
                    active: frame.cmd1 == CMD_ON,
                },
            ),
            Some(ThermostatGroup::Broadcast) => {
                trace!(device = %self.info.name, "pairing broadcast");
            }
            None => debug!(group, "unknown thermostat broadcast group"),
        }
    }
}

/// Decode the extended status response. D11 runs first: it carries the units
/// every later temperature field depends on.
fn process_status(
    bus: &EventBus,
    meta: &MetaStore,
    addr: Address,
    frame: &RxFrame,
) -> StepResult {
    let flag = frame.d(11);
    let cooling = flag & FLAG_COOLING != 0;
    let heating = flag & FLAG_HEATING != 0;
    let energy = flag & FLAG_ENERGY != 0;
    let units = if flag & FLAG_UNITS != 0 {
        TempUnits::Celsius
    } else {
        TempUnits::Fahrenheit
    };
    let hold = flag & FLAG_HOLD != 0;

    // The device report wins over whatever was stored.
    meta.update_thermostat(addr, |t| t.units = Some(units));

    let status = if cooling {
        RunStatus::Cooling
    } else if heating {
        RunStatus::Heating
    } else {
        RunStatus::Off
    };
    bus.emit(addr, DeviceEvent::StatusChange { status });
    bus.emit(addr, DeviceEvent::HoldChange { on: hold });
    bus.emit(addr, DeviceEvent::EnergyChange { on: energy });

    let system = frame.d(6);
    match ThermostatMode::from_status_nibble(system >> 4) {
        Some(mode) => bus.emit(addr, DeviceEvent::ModeChange { mode }),
        None => warn!(nibble = system >> 4, "unknown mode in status response"),
    }
    let fan = FanMode::from_status_bit(system & 0x01 != 0);
    bus.emit(addr, DeviceEvent::FanModeChange { fan });

    let cool_sp = to_celsius(f32::from(frame.d(7)), units);
    bus.emit(addr, DeviceEvent::CoolSetpoint { celsius: cool_sp });

    let humidity = frame.d(8).min(100);
    bus.emit(addr, DeviceEvent::AmbientHumidity { percent: humidity });

    let raw_temp = i16::from_be_bytes([frame.d(9), frame.d(10)]);
    bus.emit(
        addr,
        DeviceEvent::AmbientTemp {
            celsius: f32::from(raw_temp) / 10.0,
        },
    );

    let heat_sp = to_celsius(f32::from(frame.d(12)), units);
    bus.emit(addr, DeviceEvent::HeatSetpoint { celsius: heat_sp });

    Ok(Completion::with_data(
        "Thermostat status received",
        json!({
            "status": status.to_string(),
            "cool_setpoint_c": cool_sp,
            "heat_setpoint_c": heat_sp,
            "humidity": humidity,
        }),
    ))
}

mod common;

use common::*;
use insteon_bridge::device::thermostat::{
    FanMode, RunStatus, TempUnits, Thermostat, ThermostatCommand, ThermostatMode,
};
use insteon_bridge::device::{Device, DeviceInfo, DeviceSet};
use insteon_bridge::handler::CommandError;
use insteon_bridge::message::{MsgKind, RxFrame, CMD_EXT_GET_SET};
use insteon_bridge::metadata::MetaStore;
use insteon_bridge::signal::{DeviceEvent, EventBus};
use insteon_bridge::{Address, Link};
use std::sync::Arc;

fn stat_addr() -> Address {
    Address::new(0x52, 0x07, 0xc1)
}

struct Fixture {
    stat: Arc<Thermostat>,
    link: Arc<Link>,
    sink: RecordingSink,
    bus: Arc<EventBus>,
    meta: Arc<MetaStore>,
}

fn build_thermostat() -> Fixture {
    let (link, sink) = test_link();
    let bus = Arc::new(EventBus::new());
    let meta = Arc::new(MetaStore::new());
    let stat = Thermostat::new(
        DeviceInfo::new(stat_addr(), "upstairs", "2441TH"),
        Arc::clone(&link),
        Arc::clone(&bus),
        Arc::clone(&meta),
    );
    Fixture {
        stat,
        link,
        sink,
        bus,
        meta,
    }
}

fn set_units(meta: &MetaStore, units: TempUnits) {
    meta.update_thermostat(stat_addr(), |t| t.units = Some(units));
}

#[tokio::test]
async fn test_status_request_carries_checksum() {
    let fx = build_thermostat();

    let worker = Arc::clone(&fx.stat);
    let task = tokio::spawn(async move { worker.get_status().await });

    wait_for_frames(&fx.sink, 1).await;
    let request = fx.sink.frame(0);
    assert_eq!(request.cmd1, CMD_EXT_GET_SET);
    assert_eq!(request.cmd2, 0x02);
    let data = request.data.unwrap();
    assert_eq!(&data[..12], &[0u8; 12]);
    assert_eq!(data[12], 0x92);
    assert_eq!(data[13], 0x96);

    // Tear the request down so the task finishes.
    fx.link.notify_send_timeout(stat_addr());
    fx.link.notify_send_timeout(stat_addr());
    fx.link.notify_send_timeout(stat_addr());
    fx.link.notify_send_timeout(stat_addr());
    assert_eq!(task.await.unwrap(), Err(CommandError::Timeout));
}

#[tokio::test]
async fn test_status_decode_fahrenheit_device() {
    let fx = build_thermostat();
    let events = collect_events(&fx.bus);

    let worker = Arc::clone(&fx.stat);
    let task = tokio::spawn(async move { worker.get_status().await });

    wait_for_frames(&fx.sink, 1).await;
    assert!(fx.link.process(&std_ack(&fx.sink.frame(0))));

    // Mode cool + fan on, cool 72 F, humidity 40 %, ambient 22.0 C,
    // cooling stage active with Fahrenheit units, heat 68 F.
    let mut data = [0u8; 14];
    data[5] = 0x31;
    data[6] = 72;
    data[7] = 40;
    data[8] = 0x00;
    data[9] = 0xdc;
    data[10] = 0b0000_0001;
    data[11] = 68;
    assert!(fx
        .link
        .process(&ext_payload(stat_addr(), CMD_EXT_GET_SET, data)));

    assert!(task.await.unwrap().is_ok());

    let events = events_of(&events);
    assert_eq!(
        events.first(),
        Some(&DeviceEvent::StatusChange {
            status: RunStatus::Cooling
        })
    );
    assert!(events.contains(&DeviceEvent::HoldChange { on: false }));
    assert!(events.contains(&DeviceEvent::EnergyChange { on: false }));
    assert!(events.contains(&DeviceEvent::ModeChange {
        mode: ThermostatMode::Cool
    }));
    assert!(events.contains(&DeviceEvent::FanModeChange { fan: FanMode::On }));
    assert!(events.contains(&DeviceEvent::AmbientHumidity { percent: 40 }));
    assert!(events
        .iter()
        .any(|e| matches!(e, DeviceEvent::AmbientTemp { celsius } if (celsius - 22.0).abs() < 1e-4)));
    assert!(events
        .iter()
        .any(|e| matches!(e, DeviceEvent::CoolSetpoint { celsius } if (celsius - 22.2222).abs() < 1e-3)));
    assert!(events
        .iter()
        .any(|e| matches!(e, DeviceEvent::HeatSetpoint { celsius } if (celsius - 20.0).abs() < 1e-4)));

    // The reported units stick in metadata.
    assert_eq!(
        fx.meta.thermostat(stat_addr()).units,
        Some(TempUnits::Fahrenheit)
    );
}

#[tokio::test]
async fn test_cool_setpoint_clamps_low_and_high() {
    let fx = build_thermostat();
    set_units(&fx.meta, TempUnits::Celsius);

    let worker = Arc::clone(&fx.stat);
    let task = tokio::spawn(async move { worker.cool_sp_command(-5.0).await });
    wait_for_frames(&fx.sink, 1).await;
    let frame = fx.sink.frame(0);
    assert_eq!(frame.cmd1, 0x6c);
    assert_eq!(frame.cmd2, 0);
    assert!(fx.link.process(&std_ack(&frame)));
    assert!(task.await.unwrap().is_ok());

    let worker = Arc::clone(&fx.stat);
    let task = tokio::spawn(async move { worker.cool_sp_command(200.0).await });
    wait_for_frames(&fx.sink, 2).await;
    let frame = fx.sink.frame(1);
    assert_eq!(frame.cmd2, 254);
    assert!(fx.link.process(&std_ack(&frame)));
    assert!(task.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_heat_setpoint_converts_to_device_units() {
    let fx = build_thermostat();
    set_units(&fx.meta, TempUnits::Fahrenheit);
    let events = collect_events(&fx.bus);

    let worker = Arc::clone(&fx.stat);
    let task = tokio::spawn(async move { worker.heat_sp_command(20.0).await });

    wait_for_frames(&fx.sink, 1).await;
    let frame = fx.sink.frame(0);
    assert_eq!(frame.cmd1, 0x6d);
    // 20 C is 68 F, doubled on the wire.
    assert_eq!(frame.cmd2, 136);

    assert!(fx.link.process(&std_ack(&frame)));
    assert!(task.await.unwrap().is_ok());

    let events = events_of(&events);
    assert!(events
        .iter()
        .any(|e| matches!(e, DeviceEvent::HeatSetpoint { celsius } if (celsius - 20.0).abs() < 1e-4)));
}

#[tokio::test]
async fn test_mode_command_emits_on_ack() {
    let fx = build_thermostat();
    let events = collect_events(&fx.bus);

    let worker = Arc::clone(&fx.stat);
    let task = tokio::spawn(async move { worker.mode_command(ThermostatMode::Heat).await });

    wait_for_frames(&fx.sink, 1).await;
    let frame = fx.sink.frame(0);
    assert_eq!(frame.cmd1, 0x6b);
    assert_eq!(frame.cmd2, 0x04);

    assert!(fx.link.process(&std_ack(&frame)));
    assert!(task.await.unwrap().is_ok());

    assert!(events_of(&events).contains(&DeviceEvent::ModeChange {
        mode: ThermostatMode::Heat
    }));
}

#[tokio::test]
async fn test_mode_command_wrong_ack_cmd1_fails() {
    let fx = build_thermostat();

    let worker = Arc::clone(&fx.stat);
    let task = tokio::spawn(async move { worker.mode_command(ThermostatMode::Cool).await });

    wait_for_frames(&fx.sink, 1).await;
    assert!(fx.link.process(&std_ack_cmds(stat_addr(), 0x2e, 0x05)));

    let result = task.await.unwrap();
    assert_eq!(result, Err(CommandError::UnexpectedReply));
    assert_eq!(
        result.unwrap_err().to_string(),
        "Wrong direct ack received"
    );
}

#[tokio::test]
async fn test_fan_command_nak_reports_reason() {
    let fx = build_thermostat();

    let worker = Arc::clone(&fx.stat);
    let task = tokio::spawn(async move { worker.fan_command(FanMode::On).await });

    wait_for_frames(&fx.sink, 1).await;
    let frame = fx.sink.frame(0);
    assert_eq!(frame.cmd2, 0x07);
    assert!(fx.link.process(&std_nak(stat_addr(), 0x6b, 0xff)));

    let result = task.await.unwrap();
    assert!(matches!(result, Err(CommandError::Nak(_))));
}

#[tokio::test]
async fn test_status_request_retries_before_failing() {
    let fx = build_thermostat();

    let worker = Arc::clone(&fx.stat);
    let task = tokio::spawn(async move { worker.get_status().await });

    wait_for_frames(&fx.sink, 1).await;
    // Three timeouts re-send the frame; the fourth exhausts the budget.
    fx.link.notify_send_timeout(stat_addr());
    fx.link.notify_send_timeout(stat_addr());
    fx.link.notify_send_timeout(stat_addr());
    assert_eq!(fx.sink.count(), 4);
    fx.link.notify_send_timeout(stat_addr());

    assert_eq!(task.await.unwrap(), Err(CommandError::Timeout));
}

#[tokio::test]
async fn test_enable_broadcast_frame_shape() {
    let fx = build_thermostat();

    let worker = Arc::clone(&fx.stat);
    let task = tokio::spawn(async move { worker.enable_broadcast().await });

    wait_for_frames(&fx.sink, 1).await;
    let frame = fx.sink.frame(0);
    assert_eq!(frame.cmd1, CMD_EXT_GET_SET);
    let data = frame.data.unwrap();
    assert_eq!(data[1], 0x08);
    assert_eq!(data[2], 0x01);
    // Checksummed like every other thermostat extended command.
    assert_ne!((data[12], data[13]), (0, 0));

    assert!(fx.link.process(&std_ack(&frame)));
    assert!(task.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_direct_status_reports_emit_events() {
    let fx = build_thermostat();
    set_units(&fx.meta, TempUnits::Fahrenheit);
    let events = collect_events(&fx.bus);

    // 140 half-degrees is 70 F.
    let report = RxFrame::standard(stat_addr(), hub(), MsgKind::Direct, 0x6e, 140);
    assert!(fx.link.process(&report));

    let humidity = RxFrame::standard(stat_addr(), hub(), MsgKind::Direct, 0x6f, 55);
    assert!(fx.link.process(&humidity));

    let mode = RxFrame::standard(stat_addr(), hub(), MsgKind::Direct, 0x70, 0x03);
    assert!(fx.link.process(&mode));

    let events = events_of(&events);
    assert!(events
        .iter()
        .any(|e| matches!(e, DeviceEvent::AmbientTemp { celsius } if (celsius - 21.1111).abs() < 1e-3)));
    assert!(events.contains(&DeviceEvent::AmbientHumidity { percent: 55 }));
    assert!(events.contains(&DeviceEvent::ModeChange {
        mode: ThermostatMode::Cool
    }));
}

#[tokio::test]
async fn test_condition_broadcasts_drive_run_status() {
    let fx = build_thermostat();
    let events = collect_events(&fx.bus);

    let devices = DeviceSet::new(Arc::clone(&fx.link));
    devices.insert(Arc::clone(&fx.stat) as Arc<dyn Device>);

    devices.process(&group_broadcast(stat_addr(), 0x01, 0x11));
    devices.process(&group_broadcast(stat_addr(), 0x02, 0x11));
    devices.process(&group_broadcast(stat_addr(), 0x01, 0x13));
    devices.process(&group_broadcast(stat_addr(), 0x03, 0x11));
    // Unknown groups are logged, never fatal.
    devices.process(&group_broadcast(stat_addr(), 0x09, 0x11));

    let events = events_of(&events);
    assert_eq!(
        events,
        vec![
            DeviceEvent::StatusChange {
                status: RunStatus::Cooling
            },
            DeviceEvent::StatusChange {
                status: RunStatus::Heating
            },
            DeviceEvent::StatusChange {
                status: RunStatus::Off
            },
            DeviceEvent::HumidityAlarm {
                high: true,
                active: true
            },
        ]
    );
}

#[tokio::test]
async fn test_run_command_parses_and_dispatches() {
    let fx = build_thermostat();
    set_units(&fx.meta, TempUnits::Celsius);

    let cmd =
        ThermostatCommand::parse("cool_sp_command", &serde_json::json!({ "temp": 22.0 })).unwrap();
    let worker = Arc::clone(&fx.stat);
    let task = tokio::spawn(async move { worker.run_command(cmd).await });

    wait_for_frames(&fx.sink, 1).await;
    let frame = fx.sink.frame(0);
    assert_eq!(frame.cmd1, 0x6c);
    assert_eq!(frame.cmd2, 44);
    assert!(fx.link.process(&std_ack(&frame)));
    assert!(task.await.unwrap().is_ok());
}

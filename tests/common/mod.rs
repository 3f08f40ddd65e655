#![allow(dead_code)]

use insteon_bridge::address::Address;
use insteon_bridge::message::{MsgKind, RxFrame, TxFrame, EXT_DATA_LEN};
use insteon_bridge::signal::{DeviceEvent, EventBus};
use insteon_bridge::transport::{FrameSink, Link, SinkError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// The modem's own address, used as the destination of inbound replies.
pub fn hub() -> Address {
    Address::new(0x01, 0x01, 0x01)
}

/// Write half that records every outbound frame.
#[derive(Clone, Default)]
pub struct RecordingSink {
    frames: Arc<Mutex<Vec<TxFrame>>>,
}

impl RecordingSink {
    pub fn frames(&self) -> Vec<TxFrame> {
        self.frames.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    pub fn frame(&self, index: usize) -> TxFrame {
        self.frames.lock().unwrap()[index].clone()
    }
}

impl FrameSink for RecordingSink {
    fn write_frame(&self, frame: &TxFrame) -> Result<(), SinkError> {
        self.frames.lock().unwrap().push(frame.clone());
        Ok(())
    }
}

pub fn test_link() -> (Arc<Link>, RecordingSink) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let sink = RecordingSink::default();
    let link = Link::new(Box::new(sink.clone()));
    (link, sink)
}

/// Standard direct ACK echoing a sent frame.
pub fn std_ack(sent: &TxFrame) -> RxFrame {
    RxFrame::standard(sent.to, hub(), MsgKind::DirectAck, sent.cmd1, sent.cmd2)
}

/// Standard direct ACK with an explicit echoed cmd1/cmd2.
pub fn std_ack_cmds(from: Address, cmd1: u8, cmd2: u8) -> RxFrame {
    RxFrame::standard(from, hub(), MsgKind::DirectAck, cmd1, cmd2)
}

pub fn std_nak(from: Address, cmd1: u8, reason: u8) -> RxFrame {
    RxFrame::standard(from, hub(), MsgKind::DirectNak, cmd1, reason)
}

/// Extended direct payload from a device.
pub fn ext_payload(from: Address, cmd1: u8, data: [u8; EXT_DATA_LEN]) -> RxFrame {
    RxFrame::extended(from, hub(), MsgKind::Direct, cmd1, 0x00, data)
}

/// All-link broadcast from a device on the given group.
pub fn group_broadcast(from: Address, group: u8, cmd1: u8) -> RxFrame {
    RxFrame::standard(
        from,
        Address::new(0x00, 0x00, group),
        MsgKind::AllLinkBroadcast,
        cmd1,
        0x00,
    )
}

/// Spin until the sink holds at least `n` frames.
pub async fn wait_for_frames(sink: &RecordingSink, n: usize) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while sink.count() < n {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("timed out waiting for outbound frames");
}

/// Subscribe a collector to the bus; returns the shared event list.
pub fn collect_events(bus: &EventBus) -> Arc<Mutex<Vec<(Address, DeviceEvent)>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    bus.subscribe(move |addr, event| {
        sink.lock().unwrap().push((addr, event.clone()));
    });
    events
}

pub fn events_of(
    events: &Arc<Mutex<Vec<(Address, DeviceEvent)>>>,
) -> Vec<DeviceEvent> {
    events.lock().unwrap().iter().map(|(_, e)| e.clone()).collect()
}

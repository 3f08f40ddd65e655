use crate::address::Address;
use std::fmt;

pub const EXT_DATA_LEN: usize = 14;

/// Extended get/set opcode shared by the sensor and thermostat families.
pub const CMD_EXT_GET_SET: u8 = 0x2e;

/// Turn-on command byte carried in group broadcasts.
pub const CMD_ON: u8 = 0x11;
/// Turn-off command byte carried in group broadcasts.
pub const CMD_OFF: u8 = 0x13;

const FLAG_EXTENDED: u8 = 0b0001_0000;
const DEFAULT_HOPS: u8 = 0b0000_1111;

/// Message kind encoded in the top three bits of the flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    Direct,
    DirectAck,
    DirectNak,
    AllLinkCleanup,
    CleanupAck,
    CleanupNak,
    AllLinkBroadcast,
    Broadcast,
}

impl MsgKind {
    const fn bits(self) -> u8 {
        match self {
            MsgKind::Direct => 0b000,
            MsgKind::DirectAck => 0b001,
            MsgKind::AllLinkCleanup => 0b010,
            MsgKind::CleanupAck => 0b011,
            MsgKind::Broadcast => 0b100,
            MsgKind::DirectNak => 0b101,
            MsgKind::AllLinkBroadcast => 0b110,
            MsgKind::CleanupNak => 0b111,
        }
    }

    const fn from_bits(bits: u8) -> Self {
        match bits & 0b111 {
            0b000 => MsgKind::Direct,
            0b001 => MsgKind::DirectAck,
            0b010 => MsgKind::AllLinkCleanup,
            0b011 => MsgKind::CleanupAck,
            0b100 => MsgKind::Broadcast,
            0b101 => MsgKind::DirectNak,
            0b110 => MsgKind::AllLinkBroadcast,
            _ => MsgKind::CleanupNak,
        }
    }
}

/// Wire flags byte: message kind in bits 7-5, extended bit 4, hop counts
/// in bits 3-0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flags(u8);

impl Flags {
    pub const fn new(kind: MsgKind, extended: bool) -> Self {
        let ext = if extended { FLAG_EXTENDED } else { 0 };
        Self((kind.bits() << 5) | ext | DEFAULT_HOPS)
    }

    pub const fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    pub const fn byte(&self) -> u8 {
        self.0
    }

    pub const fn kind(&self) -> MsgKind {
        MsgKind::from_bits(self.0 >> 5)
    }

    pub const fn is_extended(&self) -> bool {
        self.0 & FLAG_EXTENDED != 0
    }

    pub const fn is_ack(&self) -> bool {
        matches!(self.kind(), MsgKind::DirectAck)
    }

    pub const fn is_nak(&self) -> bool {
        matches!(self.kind(), MsgKind::DirectNak)
    }

    pub const fn is_broadcast(&self) -> bool {
        matches!(
            self.kind(),
            MsgKind::Broadcast | MsgKind::AllLinkBroadcast | MsgKind::AllLinkCleanup
        )
    }
}

/// Reason code carried in cmd2 of a direct NAK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NakReason {
    /// 0xFF: the sender is not in the responder's link database.
    NotInDatabase,
    /// 0xFE: no load detected on the responder.
    NoLoadDetected,
    /// 0xFD: the extended-message checksum did not verify.
    IncorrectChecksum,
    /// 0xFC: pre-NAK, the responder's database search is still running.
    PreNak,
    Unknown(u8),
}

impl NakReason {
    pub const fn from_cmd2(cmd2: u8) -> Self {
        match cmd2 {
            0xff => NakReason::NotInDatabase,
            0xfe => NakReason::NoLoadDetected,
            0xfd => NakReason::IncorrectChecksum,
            0xfc => NakReason::PreNak,
            other => NakReason::Unknown(other),
        }
    }
}

impl fmt::Display for NakReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NakReason::NotInDatabase => write!(f, "sender not in responder database"),
            NakReason::NoLoadDetected => write!(f, "no load detected"),
            NakReason::IncorrectChecksum => write!(f, "incorrect checksum"),
            NakReason::PreNak => write!(f, "pre-NAK, database search in progress"),
            NakReason::Unknown(code) => write!(f, "unknown NAK code {code:#04x}"),
        }
    }
}

/// Outbound frame addressed to a single device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxFrame {
    pub to: Address,
    pub flags: Flags,
    pub cmd1: u8,
    pub cmd2: u8,
    pub data: Option<[u8; EXT_DATA_LEN]>,
}

impl TxFrame {
    pub fn direct(to: Address, cmd1: u8, cmd2: u8) -> Self {
        Self {
            to,
            flags: Flags::new(MsgKind::Direct, false),
            cmd1,
            cmd2,
            data: None,
        }
    }

    pub fn direct_ext(to: Address, cmd1: u8, cmd2: u8, data: [u8; EXT_DATA_LEN]) -> Self {
        Self {
            to,
            flags: Flags::new(MsgKind::Direct, true),
            cmd1,
            cmd2,
            data: Some(data),
        }
    }

    /// Extended get/set frame: D1 = 0, D2 = sub-command, D3 = argument,
    /// remaining data bytes zero.
    pub fn get_set(to: Address, sub_cmd: u8, arg: u8) -> Self {
        let mut data = [0u8; EXT_DATA_LEN];
        data[1] = sub_cmd;
        data[2] = arg;
        Self::direct_ext(to, CMD_EXT_GET_SET, 0x00, data)
    }

    /// Store the CRC16 over (cmd1, cmd2, D1..D12) into D13 (high) and
    /// D14 (low). Only meaningful on extended frames.
    pub fn with_crc(mut self) -> Self {
        if let Some(data) = &mut self.data {
            let mut bytes = [0u8; EXT_DATA_LEN];
            bytes[0] = self.cmd1;
            bytes[1] = self.cmd2;
            bytes[2..].copy_from_slice(&data[..12]);
            let crc = crc16(&bytes);
            data[12] = (crc >> 8) as u8;
            data[13] = (crc & 0xff) as u8;
        }
        self
    }
}

/// Inbound frame as parsed off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxFrame {
    pub from: Address,
    pub to: Address,
    pub flags: Flags,
    pub cmd1: u8,
    pub cmd2: u8,
    pub data: Option<[u8; EXT_DATA_LEN]>,
}

impl RxFrame {
    pub fn standard(from: Address, to: Address, kind: MsgKind, cmd1: u8, cmd2: u8) -> Self {
        Self {
            from,
            to,
            flags: Flags::new(kind, false),
            cmd1,
            cmd2,
            data: None,
        }
    }

    pub fn extended(
        from: Address,
        to: Address,
        kind: MsgKind,
        cmd1: u8,
        cmd2: u8,
        data: [u8; EXT_DATA_LEN],
    ) -> Self {
        Self {
            from,
            to,
            flags: Flags::new(kind, true),
            cmd1,
            cmd2,
            data: Some(data),
        }
    }

    /// Broadcast group number. Group broadcasts carry it in the low byte of
    /// the destination address; all-link cleanups carry it in cmd2.
    pub fn group(&self) -> Option<u8> {
        match self.flags.kind() {
            MsgKind::Broadcast | MsgKind::AllLinkBroadcast => Some(self.to.low()),
            MsgKind::AllLinkCleanup => Some(self.cmd2),
            _ => None,
        }
    }

    /// Data byte accessor using the wire numbering D1..D14.
    pub fn d(&self, n: usize) -> u8 {
        debug_assert!(
            (1..=EXT_DATA_LEN).contains(&n),
            "data byte index D{} out of range",
            n
        );
        self.data.map_or(0, |data| data[n - 1])
    }

    pub fn nak_reason(&self) -> NakReason {
        NakReason::from_cmd2(self.cmd2)
    }
}

/// Insteon extended-message CRC16.
///
/// Bit-serial, LSB first; feedback taps at crc bits 15, 14, 12 and 3. The
/// checksum covers cmd1, cmd2 and D1..D12 and lands in D13-D14.
pub fn crc16(bytes: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in bytes {
        let mut b = byte;
        for _ in 0..8 {
            let mut fb = b & 1;
            fb ^= u8::from(crc & 0x8000 != 0);
            fb ^= u8::from(crc & 0x4000 != 0);
            fb ^= u8::from(crc & 0x1000 != 0);
            fb ^= u8::from(crc & 0x0008 != 0);
            crc = (crc << 1) | u16::from(fb);
            b >>= 1;
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> Address {
        Address::new(0x11, 0x22, 0x33)
    }

    #[test]
    fn test_crc16_status_request_vector() {
        let mut bytes = [0u8; 14];
        bytes[0] = 0x2e;
        bytes[1] = 0x02;
        assert_eq!(crc16(&bytes), 0x9296);
    }

    #[test]
    fn test_crc16_counting_vector() {
        let bytes: Vec<u8> = (0u8..14).collect();
        assert_eq!(crc16(&bytes), 0x39bb);
    }

    #[test]
    fn test_with_crc_fills_trailing_data_bytes() {
        let frame = TxFrame::direct_ext(addr(), 0x2e, 0x02, [0u8; 14]).with_crc();
        let data = frame.data.unwrap();
        assert_eq!(data[12], 0x92);
        assert_eq!(data[13], 0x96);
    }

    #[test]
    fn test_flags_kind_round_trip() {
        for kind in [
            MsgKind::Direct,
            MsgKind::DirectAck,
            MsgKind::DirectNak,
            MsgKind::AllLinkCleanup,
            MsgKind::CleanupAck,
            MsgKind::CleanupNak,
            MsgKind::AllLinkBroadcast,
            MsgKind::Broadcast,
        ] {
            let flags = Flags::new(kind, false);
            assert_eq!(flags.kind(), kind);
            assert!(!flags.is_extended());
            let ext = Flags::new(kind, true);
            assert!(ext.is_extended());
        }
    }

    #[test]
    fn test_get_set_builder_shape() {
        let frame = TxFrame::get_set(addr(), 0x05, 0x0a);
        assert_eq!(frame.cmd1, CMD_EXT_GET_SET);
        assert_eq!(frame.cmd2, 0x00);
        assert!(frame.flags.is_extended());
        let data = frame.data.unwrap();
        assert_eq!(data[0], 0x00);
        assert_eq!(data[1], 0x05);
        assert_eq!(data[2], 0x0a);
        assert!(data[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_broadcast_group_extraction() {
        let frame = RxFrame::standard(
            addr(),
            Address::new(0x00, 0x00, 0x02),
            MsgKind::AllLinkBroadcast,
            CMD_ON,
            0x00,
        );
        assert_eq!(frame.group(), Some(0x02));

        let direct = RxFrame::standard(addr(), addr(), MsgKind::Direct, CMD_ON, 0x00);
        assert_eq!(direct.group(), None);
    }

    #[test]
    fn test_data_byte_accessor_is_one_based() {
        let mut data = [0u8; 14];
        data[5] = 0xab;
        data[11] = 0xcd;
        let frame = RxFrame::extended(addr(), addr(), MsgKind::Direct, 0x2e, 0x00, data);
        assert_eq!(frame.d(6), 0xab);
        assert_eq!(frame.d(12), 0xcd);
        assert_eq!(frame.d(1), 0x00);
    }

    #[test]
    fn test_nak_reason_table() {
        assert_eq!(NakReason::from_cmd2(0xff), NakReason::NotInDatabase);
        assert_eq!(NakReason::from_cmd2(0xfe), NakReason::NoLoadDetected);
        assert_eq!(NakReason::from_cmd2(0xfd), NakReason::IncorrectChecksum);
        assert_eq!(NakReason::from_cmd2(0xfc), NakReason::PreNak);
        assert_eq!(NakReason::from_cmd2(0x12), NakReason::Unknown(0x12));
    }
}

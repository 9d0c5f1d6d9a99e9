use packed_struct::prelude::*;
use strum_macros::{Display, EnumIter};

use super::types::CodeTable;

/*
    Packet types seen on the CN105 line:

    0x41 = set request        (controller -> heat pump)
    0x42 = info request       (controller -> heat pump)
    0x5a = connect request    (controller -> heat pump)

    0x61 = set response       (heat pump -> controller)
    0x62 = info response      (heat pump -> controller)
    0x7a = connect response   (heat pump -> controller)

    Info types other than 0x02/0x03 (timers 0x05, status 0x06, standby 0x09)
    are answered by some models but not decoded.
*/

pub trait Command {
    const ID: u8;
}

/// Size of the fixed-length set/info payloads.
pub const LONG_PAYLOAD_LEN: usize = 0x10;

/// Smallest payload accepted for a packet type.
///
/// Long packets shorter than this can't carry the fields we read from them.
pub fn min_payload_len(packet_type: u8) -> usize {
    match packet_type {
        SetRequestPayload::ID | InfoRequestPayload::ID | SettingsPayload::ID => LONG_PAYLOAD_LEN,
        _ => 0,
    }
}

/// Unpack the first 16 bytes of a long payload.
pub fn unpack_long<T>(payload: &[u8]) -> Option<T> where
    T: PackedStruct<ByteArray = [u8; LONG_PAYLOAD_LEN]>
{
    let bytes: &[u8; LONG_PAYLOAD_LEN] = payload.get(..LONG_PAYLOAD_LEN)?.try_into().ok()?;

    T::unpack(bytes).ok()
}


/// Packet `0x5a` -- Connect (request).
///
/// The handshake. Some models don't answer until they've seen one,
/// others answer polls regardless.
pub struct ConnectRequest;

impl ConnectRequest {
    pub const PAYLOAD: [u8; 2] = [0xca, 0x01];
}

impl Command for ConnectRequest {
    const ID: u8 = 0x5a;
}

/// Packet `0x7a` -- Connect (response).
pub struct ConnectAck;

impl ConnectAck {
    pub const PAYLOAD: [u8; 1] = [0x00];
}

impl Command for ConnectAck {
    const ID: u8 = 0x7a;
}

/// Packet `0x61` -- Set (response).
///
/// Only says a set request arrived. The new settings show up in a later
/// settings report.
pub struct SetAck;

impl SetAck {
    pub const PAYLOAD: [u8; LONG_PAYLOAD_LEN] = [0x00; LONG_PAYLOAD_LEN];
}

impl Command for SetAck {
    const ID: u8 = 0x61;
}


#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum InfoType {
    Settings,
    RoomTemperature,
}

impl CodeTable for InfoType {
    const CODES: &'static [(Self, u8)] = &[
        (InfoType::Settings, 0x02),
        (InfoType::RoomTemperature, 0x03),
    ];
}


/// Change flags, byte 1 of a set request.
///
/// The heat pump only applies fields whose flag is set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ChangeFlags(u8);

impl ChangeFlags {
    pub const NONE: ChangeFlags = ChangeFlags(0x00);
    pub const POWER: ChangeFlags = ChangeFlags(0x01);
    pub const MODE: ChangeFlags = ChangeFlags(0x02);
    pub const TEMP: ChangeFlags = ChangeFlags(0x04);
    pub const FAN: ChangeFlags = ChangeFlags(0x08);
    pub const VANE: ChangeFlags = ChangeFlags(0x10);
    pub const DIR: ChangeFlags = ChangeFlags(0x80);

    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: ChangeFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: ChangeFlags) {
        self.0 |= other.0;
    }
}


/// Packet `0x41` -- Set (request).
///
/// ```text
///  0   1   2   3   4   5   6   7   8   9  10  11  12  13  14  15
/// 01  FL  xx  PW  MO  TM  FA  VA  xx  xx  DI  xx  xx  xx  xx  xx
/// ```
#[derive(PackedStruct, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[packed_struct(size_bytes="16", bit_numbering="msb0")]
pub struct SetRequestPayload {
    /// Always `0x01`.
    #[packed_field(bytes="0")]
    pub marker: u8,

    /// [ChangeFlags] bits
    #[packed_field(bytes="1")]
    pub flags: u8,

    #[packed_field(bytes="3")]
    pub power: u8,

    #[packed_field(bytes="4")]
    pub mode: u8,

    /// Setpoint, table encoded
    #[packed_field(bytes="5")]
    pub setpoint: u8,

    #[packed_field(bytes="6")]
    pub fan: u8,

    #[packed_field(bytes="7")]
    pub vane: u8,

    #[packed_field(bytes="10")]
    pub wide_vane: u8,
}

impl SetRequestPayload {
    pub const MARKER: u8 = 0x01;
}

impl Command for SetRequestPayload {
    const ID: u8 = 0x41;
}


/// Packet `0x42` -- Info (request).
///
/// The poll. Byte 0 selects which report comes back, the rest is zero.
#[derive(PackedStruct, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[packed_struct(size_bytes="16", bit_numbering="msb0")]
pub struct InfoRequestPayload {
    #[packed_field(bytes="0")]
    pub info_type: u8,
}

impl Command for InfoRequestPayload {
    const ID: u8 = 0x42;
}


/// Packet `0x62` -- Info (response), settings report (info type `0x02`).
///
/// Same field positions as the set request.
#[derive(PackedStruct, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[packed_struct(size_bytes="16", bit_numbering="msb0")]
pub struct SettingsPayload {
    #[packed_field(bytes="0")]
    pub info_type: u8,

    #[packed_field(bytes="3")]
    pub power: u8,

    #[packed_field(bytes="4")]
    pub mode: u8,

    #[packed_field(bytes="5")]
    pub setpoint: u8,

    #[packed_field(bytes="6")]
    pub fan: u8,

    #[packed_field(bytes="7")]
    pub vane: u8,

    #[packed_field(bytes="10")]
    pub wide_vane: u8,

    /// Setpoint as half degrees + 128.
    /// Zero on older units, which only send the table encoded byte 5.
    #[packed_field(bytes="11")]
    pub setpoint_precise: u8,
}

impl Command for SettingsPayload {
    const ID: u8 = 0x62;
}


/// Packet `0x62` -- Info (response), room temperature report (info type `0x03`).
#[derive(PackedStruct, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[packed_struct(size_bytes="16", bit_numbering="msb0")]
pub struct RoomTemperaturePayload {
    #[packed_field(bytes="0")]
    pub info_type: u8,

    /// Whole degrees, minus 10
    #[packed_field(bytes="3")]
    pub room_temp: u8,

    /// Half degrees + 128, zero when unsupported
    #[packed_field(bytes="6")]
    pub room_temp_precise: u8,
}

impl Command for RoomTemperaturePayload {
    const ID: u8 = 0x62;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_request_layout() {
        let payload = SetRequestPayload {
            marker: SetRequestPayload::MARKER,
            flags: ChangeFlags::POWER.bits(),
            power: 0x01,
            mode: 0x03,
            setpoint: 0x0b,
            fan: 0x00,
            vane: 0x07,
            wide_vane: 0x03,
        };

        let bytes = payload.pack().expect("pack");
        assert_eq!(bytes, [
            0x01, 0x01, 0x00, 0x01, 0x03, 0x0b, 0x00, 0x07,
            0x00, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00,
        ]);

        assert_eq!(unpack_long::<SetRequestPayload>(&bytes), Some(payload));
    }

    #[test]
    fn settings_layout() {
        let bytes = [
            0x02, 0x00, 0x00, 0x01, 0x03, 0x0b, 0x00, 0x00,
            0x00, 0x00, 0x03, 0xa8, 0x00, 0x00, 0x00, 0x00,
        ];

        let settings = unpack_long::<SettingsPayload>(&bytes).expect("unpack");
        assert_eq!(settings.info_type, 0x02);
        assert_eq!(settings.power, 0x01);
        assert_eq!(settings.mode, 0x03);
        assert_eq!(settings.setpoint, 0x0b);
        assert_eq!(settings.wide_vane, 0x03);
        assert_eq!(settings.setpoint_precise, 0xa8);
    }

    #[test]
    fn unpack_needs_a_long_payload() {
        assert_eq!(unpack_long::<InfoRequestPayload>(&[0x02; 15]), None);
        assert!(unpack_long::<InfoRequestPayload>(&[0x02; 17]).is_some());
    }

    #[test]
    fn change_flags() {
        let mut flags = ChangeFlags::NONE;
        assert!(flags.is_empty());

        flags.insert(ChangeFlags::POWER);
        flags.insert(ChangeFlags::DIR);
        assert_eq!(flags.bits(), 0x81);
        assert!(flags.contains(ChangeFlags::DIR));
        assert!(!flags.contains(ChangeFlags::TEMP));
    }

    #[test]
    fn minimum_lengths() {
        assert_eq!(min_payload_len(0x62), LONG_PAYLOAD_LEN);
        assert_eq!(min_payload_len(0x41), LONG_PAYLOAD_LEN);
        assert_eq!(min_payload_len(0x7a), 0);
        assert_eq!(min_payload_len(0x99), 0);
    }
}

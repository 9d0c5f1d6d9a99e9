use bytes::Bytes;
use packed_struct::prelude::*;
use tracing::warn;

use super::{
    codec::Frame,
    commands::*,
    types::{CodeTable, Fan, Mode, Power, Temperature, Vane, WideVane},
};


/// The full set of user-facing settings, as carried by a settings report.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Settings {
    pub power: Power,
    pub mode: Mode,
    pub target_temp: Temperature,
    pub fan: Fan,
    pub vane: Vane,
    pub dir: WideVane,
}

/// A set command: every field position carries a value, but the heat pump
/// only applies those named in `changed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SetRequest {
    pub changed: ChangeFlags,
    pub settings: Settings,
}


/// The interpreted contents of one valid frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Packet {
    ConnectRequest,
    ConnectAck,
    /// A poll
    InfoRequest(InfoType),
    StatusReport(Settings),
    TemperatureReport {
        room_temp: Temperature,
    },
    SetRequest(SetRequest),
    SetAck,
    /// Unrecognised packet type or info type, or a payload containing
    /// codes missing from the tables.
    Unknown {
        packet_type: u8,
        payload: Bytes,
    },
}

impl Packet {
    pub fn interpret(frame: &Frame) -> Packet {
        let payload = &frame.payload[..];

        let packet = match frame.packet_type {
            ConnectRequest::ID => Some(Packet::ConnectRequest),
            ConnectAck::ID => Some(Packet::ConnectAck),
            SetAck::ID => Some(Packet::SetAck),
            InfoRequestPayload::ID => decode_info_request(payload),
            SettingsPayload::ID => decode_info_response(payload),
            SetRequestPayload::ID => decode_set_request(payload),
            _ => None,
        };

        packet.unwrap_or_else(|| Packet::Unknown {
            packet_type: frame.packet_type,
            payload: frame.payload.clone(),
        })
    }

    pub fn to_frame(&self) -> Result<Frame, PackingError> {
        let frame = match self {
            Packet::ConnectRequest => Frame::new(ConnectRequest::ID, Bytes::from_static(&ConnectRequest::PAYLOAD)),
            Packet::ConnectAck => Frame::new(ConnectAck::ID, Bytes::from_static(&ConnectAck::PAYLOAD)),
            Packet::SetAck => Frame::new(SetAck::ID, Bytes::from_static(&SetAck::PAYLOAD)),

            Packet::InfoRequest(info_type) => {
                let payload = InfoRequestPayload {
                    info_type: info_type.code(),
                };

                Frame::new(InfoRequestPayload::ID, payload.pack()?.to_vec())
            },

            Packet::StatusReport(settings) => {
                let payload = SettingsPayload {
                    info_type: InfoType::Settings.code(),
                    power: settings.power.code(),
                    mode: settings.mode.code(),
                    setpoint: settings.target_temp.setpoint_code().unwrap_or_default(),
                    fan: settings.fan.code(),
                    vane: settings.vane.code(),
                    wide_vane: settings.dir.code(),
                    setpoint_precise: settings.target_temp.precise(),
                };

                Frame::new(SettingsPayload::ID, payload.pack()?.to_vec())
            },

            Packet::TemperatureReport { room_temp } => {
                let payload = RoomTemperaturePayload {
                    info_type: InfoType::RoomTemperature.code(),
                    room_temp: room_temp.room_code().unwrap_or_default(),
                    room_temp_precise: room_temp.precise(),
                };

                Frame::new(RoomTemperaturePayload::ID, payload.pack()?.to_vec())
            },

            Packet::SetRequest(request) => {
                let settings = &request.settings;

                let payload = SetRequestPayload {
                    marker: SetRequestPayload::MARKER,
                    flags: request.changed.bits(),
                    power: settings.power.code(),
                    mode: settings.mode.code(),
                    setpoint: settings.target_temp.setpoint_code().unwrap_or_default(),
                    fan: settings.fan.code(),
                    vane: settings.vane.code(),
                    wide_vane: settings.dir.code(),
                };

                Frame::new(SetRequestPayload::ID, payload.pack()?.to_vec())
            },

            Packet::Unknown { packet_type, payload } => Frame::new(*packet_type, payload.clone()),
        };

        Ok(frame)
    }
}


fn decode_info_request(payload: &[u8]) -> Option<Packet> {
    let request = unpack_long::<InfoRequestPayload>(payload)?;

    InfoType::from_code(request.info_type).map(Packet::InfoRequest)
}

fn decode_info_response(payload: &[u8]) -> Option<Packet> {
    let info_type = InfoType::from_code(*payload.first()?)?;

    match info_type {
        InfoType::Settings => {
            let report = unpack_long::<SettingsPayload>(payload)?;

            let target_temp = Temperature::from_precise(report.setpoint_precise)
                .or_else(|| Temperature::from_setpoint_code(report.setpoint));

            let settings = decode_settings(
                report.power, report.mode, target_temp, report.fan, report.vane, report.wide_vane
            );

            if settings.is_none() {
                warn!(payload = ?payload, "settings report contains unmapped codes");
            }

            settings.map(Packet::StatusReport)
        },
        InfoType::RoomTemperature => {
            let report = unpack_long::<RoomTemperaturePayload>(payload)?;

            let room_temp = Temperature::from_precise(report.room_temp_precise)
                .or_else(|| Temperature::from_room_code(report.room_temp))?;

            Some(Packet::TemperatureReport { room_temp })
        },
    }
}

fn decode_set_request(payload: &[u8]) -> Option<Packet> {
    let request = unpack_long::<SetRequestPayload>(payload)?;

    let settings = decode_settings(
        request.power,
        request.mode,
        Temperature::from_setpoint_code(request.setpoint),
        request.fan,
        request.vane,
        request.wide_vane,
    )?;

    Some(Packet::SetRequest(SetRequest {
        changed: ChangeFlags::from_bits(request.flags),
        settings,
    }))
}

/// All or nothing: a single unmapped code rejects the whole set of fields.
fn decode_settings(
    power: u8,
    mode: u8,
    target_temp: Option<Temperature>,
    fan: u8,
    vane: u8,
    wide_vane: u8,
) -> Option<Settings> {
    Some(Settings {
        power: Power::from_code(power)?,
        mode: Mode::from_code(mode)?,
        target_temp: target_temp?,
        fan: Fan::from_code(fan)?,
        vane: Vane::from_code(vane)?,
        dir: WideVane::decode(wide_vane),
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::validate;

    fn cool_settings() -> Settings {
        Settings {
            power: Power::On,
            mode: Mode::Cool,
            target_temp: Temperature::whole(20),
            fan: Fan::Auto,
            vane: Vane::Auto,
            dir: WideVane::Center,
        }
    }

    fn long_payload(bytes: &[(usize, u8)]) -> Bytes {
        let mut payload = vec![0x00; LONG_PAYLOAD_LEN];
        for (idx, value) in bytes {
            payload[*idx] = *value;
        }
        payload.into()
    }

    #[test]
    fn settings_report() {
        let payload = long_payload(&[(0, 0x02), (3, 0x01), (4, 0x03), (5, 0x0b), (10, 0x03)]);

        let packet = Packet::interpret(&Frame::new(0x62, payload));
        assert_eq!(packet, Packet::StatusReport(cool_settings()));
    }

    #[test]
    fn settings_report_prefers_precise_setpoint() {
        // table says 20, precise byte says 22.5
        let payload = long_payload(&[(0, 0x02), (3, 0x01), (4, 0x01), (5, 0x0b), (10, 0x03), (11, 128 + 45)]);

        let Packet::StatusReport(settings) = Packet::interpret(&Frame::new(0x62, payload)) else {
            panic!("expected settings report")
        };
        assert_eq!(settings.mode, Mode::Heat);
        assert_eq!(settings.target_temp, Temperature::half_above(22));
    }

    #[test]
    fn settings_report_with_unmapped_code_is_unknown() {
        // mode 0x04 isn't in the table
        let payload = long_payload(&[(0, 0x02), (3, 0x01), (4, 0x04), (5, 0x0b), (10, 0x03)]);

        let packet = Packet::interpret(&Frame::new(0x62, payload.clone()));
        assert_eq!(packet, Packet::Unknown { packet_type: 0x62, payload });
    }

    #[test]
    fn settings_report_with_unmapped_dir_is_kept() {
        let payload = long_payload(&[(0, 0x02), (3, 0x01), (4, 0x03), (5, 0x0b), (10, 0x06)]);

        let Packet::StatusReport(settings) = Packet::interpret(&Frame::new(0x62, payload)) else {
            panic!("expected settings report")
        };
        assert_eq!(settings.dir, WideVane::Unmapped(0x06));
    }

    #[test]
    fn room_temperature_report() {
        let payload = long_payload(&[(0, 0x03), (3, 0x0b)]);
        assert_eq!(
            Packet::interpret(&Frame::new(0x62, payload)),
            Packet::TemperatureReport { room_temp: Temperature::whole(21) }
        );

        let payload = long_payload(&[(0, 0x03), (3, 0x0b), (6, 128 + 43)]);
        assert_eq!(
            Packet::interpret(&Frame::new(0x62, payload)),
            Packet::TemperatureReport { room_temp: Temperature::half_above(21) }
        );
    }

    #[test]
    fn unknown_types_pass_through() {
        let frame = Frame::new(0x99, vec![0x01, 0x02]);
        assert_eq!(
            Packet::interpret(&frame),
            Packet::Unknown { packet_type: 0x99, payload: Bytes::from_static(&[0x01, 0x02]) }
        );

        // timers report
        let payload = long_payload(&[(0, 0x05)]);
        assert!(matches!(Packet::interpret(&Frame::new(0x62, payload)), Packet::Unknown { packet_type: 0x62, .. }));

        // unknown packets re-encode to the same frame
        assert_eq!(Packet::interpret(&frame).to_frame().unwrap(), frame);
    }

    #[test]
    fn short_packets() {
        assert_eq!(Packet::interpret(&Frame::new(0x7a, vec![0x00])), Packet::ConnectAck);
        assert_eq!(Packet::interpret(&Frame::new(0x61, vec![0x00; 16])), Packet::SetAck);

        let connect = Packet::ConnectRequest.to_frame().unwrap();
        assert_eq!(&connect.to_bytes().unwrap()[..], &[0xfc, 0x5a, 0x01, 0x30, 0x02, 0xca, 0x01, 0xa8]);
    }

    #[test]
    fn info_request_encoding() {
        let frame = Packet::InfoRequest(InfoType::Settings).to_frame().unwrap();
        let raw = frame.to_bytes().unwrap();

        assert_eq!(raw.len(), 22);
        assert_eq!(raw[5], 0x02);
        assert_eq!(raw[21], 0x7b);

        let room = Packet::InfoRequest(InfoType::RoomTemperature).to_frame().unwrap();
        assert_eq!(Packet::interpret(&room), Packet::InfoRequest(InfoType::RoomTemperature));
    }

    #[test]
    fn set_request_round_trip() {
        let requests = [
            SetRequest { changed: ChangeFlags::POWER, settings: cool_settings() },
            SetRequest {
                changed: ChangeFlags::from_bits(0x9f),
                settings: Settings {
                    power: Power::Off,
                    mode: Mode::Heat,
                    target_temp: Temperature::half_above(22),
                    fan: Fan::Quiet,
                    vane: Vane::Swing,
                    dir: WideVane::Split,
                },
            },
            SetRequest {
                changed: ChangeFlags::TEMP,
                settings: Settings {
                    target_temp: Temperature::SETPOINT_MAX,
                    fan: Fan::Speed4,
                    mode: Mode::Auto,
                    ..cool_settings()
                },
            },
        ];

        for request in requests {
            let raw = Packet::SetRequest(request).to_frame().unwrap().to_bytes().unwrap();
            let frame = validate(&raw).expect("valid frame");

            assert_eq!(Packet::interpret(&frame), Packet::SetRequest(request));
        }
    }

    #[test]
    fn status_report_round_trip() {
        let settings = Settings { target_temp: Temperature::half_above(18), ..cool_settings() };

        let frame = Packet::StatusReport(settings).to_frame().unwrap();
        assert_eq!(frame.payload[5], 0x1d);
        assert_eq!(frame.payload[11], 128 + 37);

        assert_eq!(Packet::interpret(&frame), Packet::StatusReport(settings));
    }
}

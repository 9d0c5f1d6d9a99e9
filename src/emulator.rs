//! A software heat pump that answers the controller side of the protocol.
//!
//! Used by the `hpemu` binary and by tests that drive a [crate::session::Session]
//! end to end.

use std::io;

use futures::{SinkExt, TryStreamExt};
use rand::Rng;
use tracing::{debug, info};

use crate::{
    config::PortStream,
    protocol::{
        commands::{ChangeFlags, InfoType},
        packets::{Packet, SetRequest, Settings},
        types::{Fan, Mode, Power, Temperature, Vane, WideVane},
    },
};


/// Room temperatures the drift stays within, in half degrees.
const DRIFT_RANGE: std::ops::RangeInclusive<u8> = Temperature::whole(16).half_degrees()..=Temperature::whole(30).half_degrees();

#[derive(Clone, Debug)]
pub struct HeatPump {
    settings: Settings,
    room_temp: Temperature,

    /// Wander the room temperature by half a degree now and then.
    drift: bool,
}

impl Default for HeatPump {
    fn default() -> Self {
        Self::new(Settings {
            power: Power::Off,
            mode: Mode::Auto,
            target_temp: Temperature::whole(22),
            fan: Fan::Auto,
            vane: Vane::Auto,
            dir: WideVane::Center,
        }, Temperature::whole(21))
    }
}

impl HeatPump {
    pub fn new(settings: Settings, room_temp: Temperature) -> Self {
        Self {
            settings,
            room_temp,
            drift: false,
        }
    }

    pub fn with_drift(mut self, drift: bool) -> Self {
        self.drift = drift;
        self
    }

    pub fn settings(&self) -> Settings {
        self.settings
    }

    pub fn room_temp(&self) -> Temperature {
        self.room_temp
    }

    pub fn set_room_temp(&mut self, room_temp: Temperature) {
        self.room_temp = room_temp;
    }

    /// Reply to one packet from the controller, if it warrants a reply.
    pub fn respond(&mut self, packet: &Packet) -> Option<Packet> {
        match packet {
            Packet::ConnectRequest => {
                info!("controller connected");
                Some(Packet::ConnectAck)
            },
            Packet::InfoRequest(InfoType::Settings) => Some(Packet::StatusReport(self.settings)),
            Packet::InfoRequest(InfoType::RoomTemperature) => {
                if self.drift {
                    self.drift_room_temp(&mut rand::thread_rng());
                }

                Some(Packet::TemperatureReport { room_temp: self.room_temp })
            },
            Packet::SetRequest(request) => {
                self.apply(request);
                Some(Packet::SetAck)
            },
            other => {
                debug!(packet = ?other, "no reply");
                None
            }
        }
    }

    /// Apply the flagged fields of a set command. Unflagged positions are
    /// ignored whatever they hold.
    fn apply(&mut self, request: &SetRequest) {
        let (changed, wanted) = (request.changed, &request.settings);
        let settings = &mut self.settings;

        if changed.contains(ChangeFlags::POWER) {
            settings.power = wanted.power;
        }
        if changed.contains(ChangeFlags::MODE) {
            settings.mode = wanted.mode;
        }
        if changed.contains(ChangeFlags::TEMP) {
            settings.target_temp = wanted.target_temp;
        }
        if changed.contains(ChangeFlags::FAN) {
            settings.fan = wanted.fan;
        }
        if changed.contains(ChangeFlags::VANE) {
            settings.vane = wanted.vane;
        }
        if changed.contains(ChangeFlags::DIR) {
            settings.dir = wanted.dir;
        }

        info!(settings = ?self.settings, "settings changed");
    }

    pub fn drift_room_temp<R: Rng>(&mut self, rng: &mut R) {
        if !rng.gen_bool(0.1) {
            return
        }

        let current = self.room_temp.half_degrees();
        let next = if rng.gen() { current.saturating_add(1) } else { current.saturating_sub(1) };

        if DRIFT_RANGE.contains(&next) {
            self.room_temp = Temperature::from_half_degrees(next);
        }
    }
}


/// Answer frames on `port` until it closes.
pub async fn serve<P>(port: &mut P, heat_pump: &mut HeatPump) -> io::Result<()> where
    P: PortStream
{
    while let Some(frame) = port.try_next().await? {
        let packet = Packet::interpret(&frame);

        let Some(reply) = heat_pump.respond(&packet) else { continue };

        let frame = reply.to_frame()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

        port.send(frame).await?;
    }

    Ok(())
}

use std::{mem, str::FromStr};

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::protocol::{
    commands::ChangeFlags,
    packets::{Packet, SetRequest, Settings},
    types::{Fan, Mode, Power, Temperature, Vane, WideVane},
};


/// Rejected `stage` input: an unknown field name, or a value outside the
/// field's domain.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid value {value:?} for field {field:?}")]
pub struct InvalidField {
    pub field: String,
    pub value: String,
}

impl InvalidField {
    fn new(field: &str, value: &str) -> Self {
        Self {
            field: field.to_string(),
            value: value.to_string(),
        }
    }
}


/// Last known state of the heat pump.
///
/// Nothing in here can be trusted until [DeviceState::valid] is true.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceState {
    settings: Option<Settings>,
    room_temp: Option<Temperature>,
}

impl DeviceState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn settings(&self) -> Option<Settings> {
        self.settings
    }

    pub fn room_temp(&self) -> Option<Temperature> {
        self.room_temp
    }

    /// True once both a settings report and a room temperature report have
    /// been applied.
    pub fn valid(&self) -> bool {
        self.settings.is_some() && self.room_temp.is_some()
    }

    /// Apply a received packet. Returns whether anything changed.
    ///
    /// A settings report replaces every setting at once.
    pub fn apply(&mut self, packet: &Packet) -> bool {
        match packet {
            Packet::StatusReport(settings) => {
                mem::replace(&mut self.settings, Some(*settings)) != Some(*settings)
            },
            Packet::TemperatureReport { room_temp } => {
                mem::replace(&mut self.room_temp, Some(*room_temp)) != Some(*room_temp)
            },
            _ => false,
        }
    }

    /// Validate a set of requested changes.
    ///
    /// Doesn't touch the state; the change only shows up once the heat pump
    /// reports it back.
    pub fn stage<I, K, V>(&self, changes: I) -> Result<PendingChange, InvalidField> where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut change = PendingChange::default();

        for (field, value) in changes {
            change.set(field.as_ref(), value.as_ref())?;
        }

        if let Some(settings) = &self.settings {
            debug!(?change, satisfied = change.is_satisfied_by(settings), "staged change");
        }

        Ok(change)
    }

    pub fn snapshot(&self) -> Option<Snapshot> {
        let (settings, room_temp) = (self.settings?, self.room_temp?);

        Some(Snapshot {
            power: settings.power,
            temp: settings.target_temp,
            vane: settings.vane,
            mode: settings.mode,
            fan: settings.fan,
            dir: settings.dir,
            room_temp,
        })
    }
}


/// The published form of a valid [DeviceState].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub power: Power,
    pub temp: Temperature,
    pub vane: Vane,
    pub mode: Mode,
    pub fan: Fan,
    pub dir: WideVane,
    pub room_temp: Temperature,
}


/// Requested settings that haven't been sent yet. `None` fields are left as
/// they are.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PendingChange {
    pub power: Option<Power>,
    pub mode: Option<Mode>,
    pub target_temp: Option<Temperature>,
    pub fan: Option<Fan>,
    pub vane: Option<Vane>,
    pub dir: Option<WideVane>,
}

fn parse_field<T: FromStr>(field: &str, value: &str) -> Result<T, InvalidField> {
    value.trim().parse().map_err(|_| InvalidField::new(field, value))
}

impl PendingChange {
    pub fn is_empty(&self) -> bool {
        *self == PendingChange::default()
    }

    /// Set one field from its name and textual value.
    pub fn set(&mut self, field: &str, value: &str) -> Result<(), InvalidField> {
        match field {
            "power" => self.power = Some(parse_field(field, value)?),
            "mode" => self.mode = Some(parse_field(field, value)?),
            "temp" | "target_temp" => {
                let temp: Temperature = parse_field(field, value)?;

                // only temperatures the device can be set to
                if temp.setpoint_code().is_none() {
                    return Err(InvalidField::new(field, value))
                }

                self.target_temp = Some(temp);
            },
            "fan" => self.fan = Some(parse_field(field, value)?),
            "vane" => self.vane = Some(parse_field(field, value)?),
            "dir" => self.dir = Some(parse_field(field, value)?),
            _ => return Err(InvalidField::new(field, value)),
        }

        Ok(())
    }

    /// Fold a later change into this one; its fields win.
    pub fn merge(&mut self, later: PendingChange) {
        self.power = later.power.or(self.power);
        self.mode = later.mode.or(self.mode);
        self.target_temp = later.target_temp.or(self.target_temp);
        self.fan = later.fan.or(self.fan);
        self.vane = later.vane.or(self.vane);
        self.dir = later.dir.or(self.dir);
    }

    pub fn apply_to(&self, settings: &Settings) -> Settings {
        Settings {
            power: self.power.unwrap_or(settings.power),
            mode: self.mode.unwrap_or(settings.mode),
            target_temp: self.target_temp.unwrap_or(settings.target_temp),
            fan: self.fan.unwrap_or(settings.fan),
            vane: self.vane.unwrap_or(settings.vane),
            dir: self.dir.unwrap_or(settings.dir),
        }
    }

    pub fn is_satisfied_by(&self, settings: &Settings) -> bool {
        self.apply_to(settings) == *settings
    }

    /// Build the set command that takes `current` to the requested settings.
    ///
    /// `None` when there's nothing left to change.
    pub fn command(&self, current: &Settings) -> Option<SetRequest> {
        let wanted = self.apply_to(current);

        let mut changed = ChangeFlags::NONE;
        if wanted.power != current.power {
            changed.insert(ChangeFlags::POWER);
        }
        if wanted.mode != current.mode {
            changed.insert(ChangeFlags::MODE);
        }
        if wanted.target_temp != current.target_temp {
            changed.insert(ChangeFlags::TEMP);
        }
        if wanted.fan != current.fan {
            changed.insert(ChangeFlags::FAN);
        }
        if wanted.vane != current.vane {
            changed.insert(ChangeFlags::VANE);
        }
        if wanted.dir != current.dir {
            changed.insert(ChangeFlags::DIR);
        }

        (!changed.is_empty()).then_some(SetRequest {
            changed,
            settings: wanted,
        })
    }
}

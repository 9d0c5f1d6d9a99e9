use std::{fmt, str::FromStr};

use serde::{Serialize, Serializer};
use strum_macros::{Display, EnumIter, EnumString};
use thiserror::Error;

/// A setting carried on the wire as a single byte from a fixed code table.
///
/// Every variant of an implementing type must appear in `CODES` (except open
/// variants that carry their own code, which override [CodeTable::code]).
pub trait CodeTable: Copy + PartialEq + 'static {
    const CODES: &'static [(Self, u8)];

    /// Look up a raw code. Codes missing from the table are `None`.
    fn from_code(code: u8) -> Option<Self> {
        Self::CODES.iter()
            .find(|(_, c)| *c == code)
            .map(|(value, _)| *value)
    }

    fn code(self) -> u8 {
        Self::CODES.iter()
            .find(|(value, _)| *value == self)
            .map(|(_, code)| *code)
            .unwrap_or_default()
    }
}

macro_rules! serialize_as_display {
    ($($ty:ty),*) => {
        $(
            impl Serialize for $ty {
                fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                    serializer.collect_str(self)
                }
            }
        )*
    }
}

serialize_as_display!(Power, Mode, Fan, Vane, WideVane);


#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString, EnumIter)]
#[strum(ascii_case_insensitive)]
pub enum Power {
    #[strum(serialize = "OFF")]
    Off,
    #[strum(serialize = "ON")]
    On,
}

impl CodeTable for Power {
    const CODES: &'static [(Self, u8)] = &[
        (Power::Off, 0x00),
        (Power::On, 0x01),
    ];
}


#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString, EnumIter)]
#[strum(ascii_case_insensitive)]
pub enum Mode {
    #[strum(serialize = "HEAT")]
    Heat,
    #[strum(serialize = "DRY")]
    Dry,
    #[strum(serialize = "COOL")]
    Cool,
    #[strum(serialize = "FAN")]
    Fan,
    #[strum(serialize = "AUTO")]
    Auto,
}

impl CodeTable for Mode {
    const CODES: &'static [(Self, u8)] = &[
        (Mode::Heat, 0x01),
        (Mode::Dry, 0x02),
        (Mode::Cool, 0x03),
        (Mode::Fan, 0x07),
        (Mode::Auto, 0x08),
    ];
}


/// Fan speed. Note the gap at `0x04` in the code table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString, EnumIter)]
#[strum(ascii_case_insensitive)]
pub enum Fan {
    #[strum(serialize = "AUTO")]
    Auto,
    #[strum(serialize = "QUIET")]
    Quiet,
    #[strum(serialize = "1")]
    Speed1,
    #[strum(serialize = "2")]
    Speed2,
    #[strum(serialize = "3")]
    Speed3,
    #[strum(serialize = "4")]
    Speed4,
}

impl CodeTable for Fan {
    const CODES: &'static [(Self, u8)] = &[
        (Fan::Auto, 0x00),
        (Fan::Quiet, 0x01),
        (Fan::Speed1, 0x02),
        (Fan::Speed2, 0x03),
        (Fan::Speed3, 0x05),
        (Fan::Speed4, 0x06),
    ];
}


/// Vertical vane position.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString, EnumIter)]
#[strum(ascii_case_insensitive)]
pub enum Vane {
    #[strum(serialize = "AUTO")]
    Auto,
    #[strum(serialize = "1")]
    Position1,
    #[strum(serialize = "2")]
    Position2,
    #[strum(serialize = "3")]
    Position3,
    #[strum(serialize = "4")]
    Position4,
    #[strum(serialize = "5")]
    Position5,
    #[strum(serialize = "SWING")]
    Swing,
}

impl CodeTable for Vane {
    const CODES: &'static [(Self, u8)] = &[
        (Vane::Auto, 0x00),
        (Vane::Position1, 0x01),
        (Vane::Position2, 0x02),
        (Vane::Position3, 0x03),
        (Vane::Position4, 0x04),
        (Vane::Position5, 0x05),
        (Vane::Swing, 0x07),
    ];
}


/// Horizontal ("wide") vane direction.
///
/// Only part of this table is known. Codes outside it are kept as
/// `Unmapped` so they can still be reported, but they can't be parsed from a
/// name and so can never be staged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum WideVane {
    #[strum(serialize = "<<")]
    FarLeft,
    #[strum(serialize = "<")]
    Left,
    #[strum(serialize = "|")]
    Center,
    #[strum(serialize = ">")]
    Right,
    #[strum(serialize = ">>")]
    FarRight,
    #[strum(serialize = "<>")]
    Split,
    #[strum(serialize = "SWING")]
    Swing,
    #[strum(disabled)]
    Unmapped(u8),
}

impl WideVane {
    /// Decode a raw code, keeping unknown codes as `Unmapped`.
    pub fn decode(code: u8) -> Self {
        Self::from_code(code).unwrap_or(WideVane::Unmapped(code))
    }
}

impl CodeTable for WideVane {
    const CODES: &'static [(Self, u8)] = &[
        (WideVane::FarLeft, 0x01),
        (WideVane::Left, 0x02),
        (WideVane::Center, 0x03),
        (WideVane::Right, 0x04),
        (WideVane::FarRight, 0x05),
        (WideVane::Split, 0x08),
        (WideVane::Swing, 0x0c),
    ];

    fn code(self) -> u8 {
        match self {
            WideVane::Unmapped(code) => code,
            mapped => Self::CODES.iter()
                .find(|(value, _)| *value == mapped)
                .map(|(_, code)| *code)
                .unwrap_or_default(),
        }
    }
}

impl fmt::Display for WideVane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            WideVane::FarLeft => "<<",
            WideVane::Left => "<",
            WideVane::Center => "|",
            WideVane::Right => ">",
            WideVane::FarRight => ">>",
            WideVane::Split => "<>",
            WideVane::Swing => "SWING",
            WideVane::Unmapped(code) => return write!(f, "UNMAPPED({code:#04x})"),
        };

        f.write_str(symbol)
    }
}


/// A temperature with half-degree Celsius resolution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Temperature(u8);

/// Offset added to half-degrees in the high-precision encoding.
const PRECISE_OFFSET: u8 = 128;

/// Room temperature codes are whole degrees above this value.
const ROOM_TEMP_OFFSET: u8 = 10;
const ROOM_TEMP_MAX_CODE: u8 = 0x1f;

/// Setpoint codes (16.0 to 31.5 degrees).
/// Whole degrees count down from `0x00`, half degrees count down from `0x1f`.
const SETPOINT_CODES: [(Temperature, u8); 32] = [
    (Temperature::whole(31), 0x00),
    (Temperature::whole(30), 0x01),
    (Temperature::whole(29), 0x02),
    (Temperature::whole(28), 0x03),
    (Temperature::whole(27), 0x04),
    (Temperature::whole(26), 0x05),
    (Temperature::whole(25), 0x06),
    (Temperature::whole(24), 0x07),
    (Temperature::whole(23), 0x08),
    (Temperature::whole(22), 0x09),
    (Temperature::whole(21), 0x0a),
    (Temperature::whole(20), 0x0b),
    (Temperature::whole(19), 0x0c),
    (Temperature::whole(18), 0x0d),
    (Temperature::whole(17), 0x0e),
    (Temperature::whole(16), 0x0f),
    (Temperature::half_above(31), 0x10),
    (Temperature::half_above(30), 0x11),
    (Temperature::half_above(29), 0x12),
    (Temperature::half_above(28), 0x13),
    (Temperature::half_above(27), 0x14),
    (Temperature::half_above(26), 0x15),
    (Temperature::half_above(25), 0x16),
    (Temperature::half_above(24), 0x17),
    (Temperature::half_above(23), 0x18),
    (Temperature::half_above(22), 0x19),
    (Temperature::half_above(21), 0x1a),
    (Temperature::half_above(20), 0x1b),
    (Temperature::half_above(19), 0x1c),
    (Temperature::half_above(18), 0x1d),
    (Temperature::half_above(17), 0x1e),
    (Temperature::half_above(16), 0x1f),
];

impl Temperature {
    pub const SETPOINT_MIN: Temperature = Temperature::whole(16);
    pub const SETPOINT_MAX: Temperature = Temperature::half_above(31);

    pub const fn from_half_degrees(half_degrees: u8) -> Self {
        Self(half_degrees)
    }

    /// `celsius` whole degrees (`celsius` must be below 128).
    pub const fn whole(celsius: u8) -> Self {
        Self(celsius * 2)
    }

    /// `celsius` and a half degrees (`celsius` must be below 128).
    pub const fn half_above(celsius: u8) -> Self {
        Self(celsius * 2 + 1)
    }

    /// `None` unless `celsius` is a non-negative multiple of 0.5 that fits.
    pub fn from_celsius(celsius: f32) -> Option<Self> {
        let half_degrees = celsius * 2.0;

        if !half_degrees.is_finite() || half_degrees.fract() != 0.0 {
            return None
        }

        if !(0.0..=f32::from(u8::MAX)).contains(&half_degrees) {
            return None
        }

        Some(Self(half_degrees as u8))
    }

    pub const fn half_degrees(self) -> u8 {
        self.0
    }

    pub fn celsius(self) -> f32 {
        f32::from(self.0) / 2.0
    }

    pub fn from_setpoint_code(code: u8) -> Option<Self> {
        SETPOINT_CODES.iter()
            .find(|(_, c)| *c == code)
            .map(|(temp, _)| *temp)
    }

    /// `None` if the device can't be set to this temperature.
    pub fn setpoint_code(self) -> Option<u8> {
        SETPOINT_CODES.iter()
            .find(|(temp, _)| *temp == self)
            .map(|(_, code)| *code)
    }

    pub fn from_room_code(code: u8) -> Option<Self> {
        (code <= ROOM_TEMP_MAX_CODE).then(|| Self::whole(code + ROOM_TEMP_OFFSET))
    }

    /// Whole-degree room temperature code; half degrees are truncated.
    pub fn room_code(self) -> Option<u8> {
        (self.0 / 2).checked_sub(ROOM_TEMP_OFFSET)
            .filter(|code| *code <= ROOM_TEMP_MAX_CODE)
    }

    /// Decode the high-precision encoding. `0` means the field isn't supported.
    pub fn from_precise(raw: u8) -> Option<Self> {
        raw.checked_sub(PRECISE_OFFSET).map(Self)
    }

    pub fn precise(self) -> u8 {
        self.0.saturating_add(PRECISE_OFFSET)
    }
}

impl fmt::Display for Temperature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / 2;
        if self.0 % 2 == 0 {
            write!(f, "{whole}")
        } else {
            write!(f, "{whole}.5")
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid temperature {0:?}")]
pub struct ParseTemperatureError(String);

impl FromStr for Temperature {
    type Err = ParseTemperatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<f32>()
            .ok()
            .and_then(Temperature::from_celsius)
            .ok_or_else(|| ParseTemperatureError(s.to_string()))
    }
}

impl Serialize for Temperature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f32(self.celsius())
    }
}


#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    fn assert_table_complete<T>() where
        T: CodeTable + IntoEnumIterator + fmt::Debug
    {
        for value in T::iter() {
            let code = value.code();
            assert_eq!(T::from_code(code), Some(value), "{value:?} missing from code table");
        }
    }

    #[test]
    fn code_tables_cover_every_variant() {
        assert_table_complete::<Power>();
        assert_table_complete::<Mode>();
        assert_table_complete::<Fan>();
        assert_table_complete::<Vane>();
    }

    #[test]
    fn code_table_misses_are_none() {
        assert_eq!(Mode::from_code(0x00), None);
        assert_eq!(Mode::from_code(0x04), None);
        assert_eq!(Fan::from_code(0x04), None);
        assert_eq!(Vane::from_code(0x06), None);
        assert_eq!(Power::from_code(0x02), None);
    }

    #[test]
    fn wide_vane_stays_open() {
        assert_eq!(WideVane::decode(0x03), WideVane::Center);
        assert_eq!(WideVane::decode(0x0c), WideVane::Swing);

        let unmapped = WideVane::decode(0x06);
        assert_eq!(unmapped, WideVane::Unmapped(0x06));
        assert_eq!(unmapped.code(), 0x06);
        assert_eq!(unmapped.to_string(), "UNMAPPED(0x06)");

        assert!("UNMAPPED(0x06)".parse::<WideVane>().is_err());
        assert_eq!("|".parse::<WideVane>(), Ok(WideVane::Center));
        assert_eq!("swing".parse::<WideVane>(), Ok(WideVane::Swing));
    }

    #[test]
    fn names_parse_case_insensitively() {
        assert_eq!("on".parse::<Power>(), Ok(Power::On));
        assert_eq!("Cool".parse::<Mode>(), Ok(Mode::Cool));
        assert_eq!("quiet".parse::<Fan>(), Ok(Fan::Quiet));
        assert_eq!("3".parse::<Fan>(), Ok(Fan::Speed3));
        assert_eq!("swing".parse::<Vane>(), Ok(Vane::Swing));
        assert!("WARM".parse::<Mode>().is_err());
        assert!("6".parse::<Vane>().is_err());

        assert_eq!(Mode::Cool.to_string(), "COOL");
        assert_eq!(Fan::Speed1.to_string(), "1");
    }

    #[test]
    fn setpoint_codes() {
        assert_eq!(Temperature::whole(31).setpoint_code(), Some(0x00));
        assert_eq!(Temperature::whole(20).setpoint_code(), Some(0x0b));
        assert_eq!(Temperature::whole(16).setpoint_code(), Some(0x0f));
        assert_eq!(Temperature::half_above(31).setpoint_code(), Some(0x10));
        assert_eq!(Temperature::half_above(20).setpoint_code(), Some(0x1b));
        assert_eq!(Temperature::half_above(16).setpoint_code(), Some(0x1f));

        assert_eq!(Temperature::whole(15).setpoint_code(), None);
        assert_eq!(Temperature::whole(32).setpoint_code(), None);

        for code in 0x00..=0x1f {
            let temp = Temperature::from_setpoint_code(code).unwrap();
            assert_eq!(temp.setpoint_code(), Some(code));
            assert!(temp >= Temperature::SETPOINT_MIN && temp <= Temperature::SETPOINT_MAX);
        }
        assert_eq!(Temperature::from_setpoint_code(0x20), None);
    }

    #[test]
    fn room_temperature_is_linear() {
        assert_eq!(Temperature::from_room_code(0x00), Some(Temperature::whole(10)));
        assert_eq!(Temperature::from_room_code(0x0b), Some(Temperature::whole(21)));
        assert_eq!(Temperature::from_room_code(0x1f), Some(Temperature::whole(41)));
        assert_eq!(Temperature::from_room_code(0x20), None);

        assert_eq!(Temperature::whole(21).room_code(), Some(0x0b));
        assert_eq!(Temperature::half_above(21).room_code(), Some(0x0b));
        assert_eq!(Temperature::whole(9).room_code(), None);
        assert_eq!(Temperature::whole(42).room_code(), None);
    }

    #[test]
    fn precise_encoding() {
        assert_eq!(Temperature::from_precise(0), None);
        assert_eq!(Temperature::from_precise(0x7f), None);
        assert_eq!(Temperature::from_precise(128 + 41), Some(Temperature::half_above(20)));
        assert_eq!(Temperature::whole(22).precise(), 128 + 44);
    }

    #[test]
    fn temperature_text() {
        assert_eq!("20".parse::<Temperature>(), Ok(Temperature::whole(20)));
        assert_eq!(" 20.5 ".parse::<Temperature>(), Ok(Temperature::half_above(20)));
        assert!("20.25".parse::<Temperature>().is_err());
        assert!("-1".parse::<Temperature>().is_err());
        assert!("warm".parse::<Temperature>().is_err());

        assert_eq!(Temperature::whole(20).to_string(), "20");
        assert_eq!(Temperature::half_above(20).to_string(), "20.5");
        assert_eq!(Temperature::half_above(20).celsius(), 20.5);
    }
}

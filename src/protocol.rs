//! Register layout and value encodings of the WE-515 energy meter.
//!
//! The meter exposes its measurements as 16-bit holding registers. A value is
//! read as a single register ([`Width::Byte`]) or as two consecutive registers
//! that are combined either with the byte-pair rule ([`Width::Word`],
//! `(high << 8) | low`) or the word-pair rule ([`Width::Long`],
//! `(high << 16) | low`). The combined integer is multiplied by a fixed
//! per-field scale to obtain the physical quantity.
//!
//! Calendar values (device clock, tariff schedule) pack two 8-bit fields into
//! one register with the byte-pair rule.

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use std::fmt;
use std::str::FromStr;

/// Errors raised while encoding or decoding register values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("Expected {expected} registers in response, got {actual}")]
    ShortResponse { expected: usize, actual: usize },
    #[error("Year {0} cannot be stored on the device, range is 2000..=2255")]
    YearOutOfRange(i32),
    #[error("Device clock registers hold no valid date/time: {0:?}")]
    InvalidClock([u8; 6]),
    #[error("Hour {0} out of range (0..=23)")]
    HourOutOfRange(u8),
    #[error("Minute {0} out of range (0..=59)")]
    MinuteOutOfRange(u8),
    #[error("Invalid time of day '{0}', expected HH:MM")]
    InvalidTimeOfDay(String),
}

/// Splits a register into its high and low byte.
pub const fn word_to_pair(word: u16) -> (u8, u8) {
    ((word >> 8) as u8, (word & 0xFF) as u8)
}

/// Packs two bytes into one register, `high` in the upper half.
pub const fn pair_to_word(high: u8, low: u8) -> u16 {
    ((high as u16) << 8) | low as u16
}

/// Scales a single register value.
pub fn decode_byte(raw: u16, scale: f64) -> f64 {
    raw as f64 * scale
}

/// Combines two registers with the byte-pair rule and scales the result.
///
/// The registers are OR-ed after shifting `high` by 8 bits, so a `low` value
/// above 255 overlaps `high` exactly like the meter firmware expects.
pub fn decode_word(high: u16, low: u16, scale: f64) -> f64 {
    (((high as u32) << 8) | low as u32) as f64 * scale
}

/// Combines two registers with the word-pair rule (32-bit) and scales the result.
pub fn decode_long(high: u16, low: u16, scale: f64) -> f64 {
    (((high as u32) << 16) | low as u32) as f64 * scale
}

/// Number of registers and composition rule of a telemetry field.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    /// One register.
    Byte,
    /// Two registers, byte-pair composition.
    Word,
    /// Two registers, word-pair (32-bit) composition.
    Long,
}

impl Width {
    /// Registers to request for this width.
    pub const fn quantity(self) -> u16 {
        match self {
            Width::Byte => 1,
            Width::Word | Width::Long => 2,
        }
    }
}

/// One entry of the telemetry register table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Field {
    pub name: &'static str,
    pub address: u16,
    pub width: Width,
    pub scale: f64,
    pub unit: &'static str,
}

impl Field {
    /// Decodes the registers returned for this field.
    pub fn decode(&self, words: &[u16]) -> Result<f64, Error> {
        let expected = self.width.quantity() as usize;
        if words.len() < expected {
            return Err(Error::ShortResponse {
                expected,
                actual: words.len(),
            });
        }
        Ok(match self.width {
            Width::Byte => decode_byte(words[0], self.scale),
            Width::Word => decode_word(words[0], words[1], self.scale),
            Width::Long => decode_long(words[0], words[1], self.scale),
        })
    }
}

const fn field(
    name: &'static str,
    address: u16,
    width: Width,
    scale: f64,
    unit: &'static str,
) -> Field {
    Field {
        name,
        address,
        width,
        scale,
        unit,
    }
}

/// Number of fields in a telemetry record.
pub const NUMBER_OF_FIELDS: usize = 13;

/// The telemetry register table, in read order.
pub const TELEMETRY_FIELDS: [Field; NUMBER_OF_FIELDS] = [
    field("freq", 0x130, Width::Byte, 0.01, "Hz"),
    field("voltage", 0x131, Width::Byte, 0.01, "V"),
    field("current", 0x139, Width::Word, 0.001, "A"),
    field("active_power", 0x140, Width::Word, 1.0, "W"),
    field("reactive_power", 0x148, Width::Word, 0.001, "kvar"),
    field("apparent_power", 0x150, Width::Word, 0.001, "kVA"),
    field("power_factor", 0x158, Width::Byte, 0.001, ""),
    field("total_active_energy", 0xA000, Width::Long, 0.01, "kWh"),
    field("rate1_active_energy", 0xA002, Width::Long, 0.01, "kWh"),
    field("rate2_active_energy", 0xA004, Width::Long, 0.01, "kWh"),
    field("total_reactive_energy", 0xA01E, Width::Long, 0.01, "kvarh"),
    field("rate1_reactive_energy", 0xA020, Width::Long, 0.01, "kvarh"),
    field("rate2_reactive_energy", 0xA022, Width::Long, 0.01, "kvarh"),
];

/// The onboard real-time clock.
///
/// Three registers: (year - 2000, month), (day, hour), (minute, second).
#[derive(Debug)]
pub struct DeviceClock;

impl DeviceClock {
    pub const ADDRESS: u16 = 0x8120;
    pub const QUANTITY: u16 = 3;
    pub const YEAR_BASE: i32 = 2000;
    pub const YEAR_MAX: i32 = Self::YEAR_BASE + u8::MAX as i32;

    /// Reassembles the device time from the three clock registers.
    pub fn decode_from_holding_registers(words: &[u16]) -> Result<NaiveDateTime, Error> {
        if words.len() < Self::QUANTITY as usize {
            return Err(Error::ShortResponse {
                expected: Self::QUANTITY as usize,
                actual: words.len(),
            });
        }
        let (year, month) = word_to_pair(words[0]);
        let (day, hour) = word_to_pair(words[1]);
        let (minute, second) = word_to_pair(words[2]);

        NaiveDate::from_ymd_opt(
            Self::YEAR_BASE + year as i32,
            month as u32,
            day as u32,
        )
        .and_then(|date| date.and_hms_opt(hour as u32, minute as u32, second as u32))
        .ok_or(Error::InvalidClock([year, month, day, hour, minute, second]))
    }

    /// Packs a local time into the three clock registers.
    ///
    /// Sub-second precision is dropped.
    pub fn encode_for_write_registers(time: &NaiveDateTime) -> Result<[u16; 3], Error> {
        let year = time.year();
        if !(Self::YEAR_BASE..=Self::YEAR_MAX).contains(&year) {
            return Err(Error::YearOutOfRange(year));
        }
        let year = (year - Self::YEAR_BASE) as u8;
        Ok([
            pair_to_word(year, time.month() as u8),
            pair_to_word(time.day() as u8, time.hour() as u8),
            pair_to_word(time.minute() as u8, time.second() as u8),
        ])
    }
}

/// A time of day at which a tariff rate becomes active.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "(u8, u8)", into = "(u8, u8)"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TariffTime {
    hour: u8,
    minute: u8,
}

impl TariffTime {
    pub const HOUR_MAX: u8 = 23;
    pub const MINUTE_MAX: u8 = 59;

    pub fn hour(&self) -> u8 {
        self.hour
    }

    pub fn minute(&self) -> u8 {
        self.minute
    }
}

impl TryFrom<(u8, u8)> for TariffTime {
    type Error = Error;

    fn try_from((hour, minute): (u8, u8)) -> Result<Self, Self::Error> {
        if hour > Self::HOUR_MAX {
            Err(Error::HourOutOfRange(hour))
        } else if minute > Self::MINUTE_MAX {
            Err(Error::MinuteOutOfRange(minute))
        } else {
            Ok(Self { hour, minute })
        }
    }
}

impl From<TariffTime> for (u8, u8) {
    fn from(time: TariffTime) -> Self {
        (time.hour, time.minute)
    }
}

impl FromStr for TariffTime {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidTimeOfDay(s.to_string());
        let (hour, minute) = s.trim().split_once(':').ok_or_else(invalid)?;
        let hour = hour.parse::<u8>().map_err(|_| invalid())?;
        let minute = minute.parse::<u8>().map_err(|_| invalid())?;
        Self::try_from((hour, minute))
    }
}

impl fmt::Display for TariffTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// Two-rate time-of-use schedule.
///
/// Rate 1 is active from `rate1_start` until `rate2_start`, rate 2 for the
/// rest of the day. All other schedule slots of the meter are cleared.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TariffSchedule {
    pub rate1_start: TariffTime,
    pub rate2_start: TariffTime,
}

impl TariffSchedule {
    pub const ADDRESS: u16 = 0x8100;
    pub const QUANTITY: u16 = 16;

    const RATE_1: u8 = 1;
    const RATE_2: u8 = 2;

    /// Register values for `ADDRESS..ADDRESS + QUANTITY`.
    pub fn encode_for_write_registers(&self) -> [u16; Self::QUANTITY as usize] {
        let mut words = [0u16; Self::QUANTITY as usize];
        words[0] = pair_to_word(self.rate1_start.hour, self.rate1_start.minute);
        words[1] = pair_to_word(0, Self::RATE_1);
        words[2] = pair_to_word(self.rate2_start.hour, self.rate2_start.minute);
        words[3] = pair_to_word(0, Self::RATE_2);
        words
    }
}

impl fmt::Display for TariffSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rate 1 from {}, rate 2 from {}",
            self.rate1_start, self.rate2_start
        )
    }
}

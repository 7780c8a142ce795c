//! Timestamps
//!
//! Every archived value carries the device-reported time of its change. Time is kept
//! exactly as `seconds + attoseconds` since the Unix epoch so that the fixed decimal
//! written into segment lines can be read back without going through a float.
//!
//! ## Representations
//!
//! | Where                      | Form                                   |
//! |----------------------------|----------------------------------------|
//! | segment / index lines      | `1573184400.123456` (six decimals)     |
//! | segment / index lines      | `20191108T034000.123456Z` (compact ISO)|
//! | property index records     | `f64` seconds                          |
//! | schema archive lines       | `seconds attoseconds`                  |

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const ATTOS_PER_SECOND: u64 = 1_000_000_000_000_000_000;
const ATTOS_PER_MICRO: u64 = 1_000_000_000_000;
const ATTOS_PER_NANO: u64 = 1_000_000_000;
const FRACTION_DIGITS: usize = 18;

/// Rounds seconds to the nearest millisecond.
///
/// Index lookups compare timestamps at this resolution.
pub fn round_1ms(x: f64) -> f64 {
    (x * 1000.0 + 0.5).floor() / 1000.0
}

/// Point in time as whole seconds plus attoseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Epochstamp {
    pub seconds: u64,
    /// Attoseconds, always below 10^18.
    pub fractional: u64,
}

impl Epochstamp {
    pub const UNIX_EPOCH: Epochstamp = Epochstamp {
        seconds: 0,
        fractional: 0,
    };

    pub fn new(seconds: u64, fractional: u64) -> Self {
        Self {
            seconds: seconds + fractional / ATTOS_PER_SECOND,
            fractional: fractional % ATTOS_PER_SECOND,
        }
    }

    pub fn now() -> Self {
        let since = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self::new(
            since.as_secs(),
            u64::from(since.subsec_nanos()) * ATTOS_PER_NANO,
        )
    }

    /// Converts float seconds, clamping negative and non-finite input to the epoch.
    pub fn from_f64(value: f64) -> Self {
        if !value.is_finite() || value <= 0.0 {
            return Self::UNIX_EPOCH;
        }
        let seconds = value.trunc();
        let fractional = ((value - seconds) * 1e18).round() as u64;
        Self::new(seconds as u64, fractional.min(ATTOS_PER_SECOND - 1))
    }

    pub fn to_f64(&self) -> f64 {
        self.seconds as f64 + self.fractional as f64 / 1e18
    }

    /// Parses `secs[.digits]` exactly. Digits beyond attosecond precision are dropped.
    pub fn from_decimal_str(text: &str) -> Result<Self> {
        let invalid = || Error::InvalidTimestamp(text.to_string());
        let (secs, frac) = match text.split_once('.') {
            Some((s, f)) => (s, f),
            None => (text, ""),
        };
        if secs.is_empty()
            || !secs.bytes().all(|b| b.is_ascii_digit())
            || !frac.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(invalid());
        }
        let seconds: u64 = secs.parse().map_err(|_| invalid())?;
        let mut digits: String = frac.chars().take(FRACTION_DIGITS).collect();
        while digits.len() < FRACTION_DIGITS {
            digits.push('0');
        }
        let fractional: u64 = digits.parse().map_err(|_| invalid())?;
        Ok(Self::new(seconds, fractional))
    }

    /// Fixed decimal with microsecond precision, as written into archive lines.
    pub fn to_fixed_string(&self) -> String {
        format!("{}.{:06}", self.seconds, self.fractional / ATTOS_PER_MICRO)
    }

    /// Compact ISO-8601 in UTC: `YYYYMMDDTHHMMSS.ffffffZ`.
    pub fn to_iso8601(&self) -> String {
        let nanos = (self.fractional / ATTOS_PER_NANO) as u32;
        let datetime = i64::try_from(self.seconds)
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, nanos))
            .unwrap_or_default();
        format!(
            "{}.{:06}Z",
            datetime.format("%Y%m%dT%H%M%S"),
            self.fractional / ATTOS_PER_MICRO
        )
    }

    /// Parses compact (`20191108T034000.5Z`) or extended (`2019-11-08T03:40:00.5`) ISO-8601.
    pub fn from_iso8601(text: &str) -> Result<Self> {
        const FORMATS: [&str; 4] = [
            "%Y%m%dT%H%M%S%.f",
            "%Y-%m-%dT%H:%M:%S%.f",
            "%Y%m%dT%H%M%S",
            "%Y-%m-%dT%H:%M:%S",
        ];
        let trimmed = text.trim();
        let trimmed = trimmed.strip_suffix('Z').unwrap_or(trimmed);
        let parsed = FORMATS
            .iter()
            .find_map(|format| NaiveDateTime::parse_from_str(trimmed, format).ok())
            .ok_or_else(|| Error::InvalidTimestamp(text.to_string()))?;
        let utc = parsed.and_utc();
        let seconds =
            u64::try_from(utc.timestamp()).map_err(|_| Error::InvalidTimestamp(text.to_string()))?;
        Ok(Self::new(
            seconds,
            u64::from(utc.timestamp_subsec_nanos()) * ATTOS_PER_NANO,
        ))
    }
}

impl fmt::Display for Epochstamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_iso8601())
    }
}

/// Epochstamp plus the sequence id (train id) reported with the change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub epoch: Epochstamp,
    pub sequence_id: u64,
}

impl Timestamp {
    pub fn new(epoch: Epochstamp, sequence_id: u64) -> Self {
        Self { epoch, sequence_id }
    }

    pub fn now() -> Self {
        Self::new(Epochstamp::now(), 0)
    }

    pub fn from_secs(seconds: f64) -> Self {
        Self::new(Epochstamp::from_f64(seconds), 0)
    }
}

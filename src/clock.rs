//! Virtual Clock
//!
//! Simulated time with calendar-quarter period semantics. The clock only
//! moves when told to, and every move reports the ordered list of quarter
//! boundaries it crossed so callers can roll allocation state forward one
//! period at a time.

use chrono::{Datelike, Duration, Months, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{EmulatorError, Result};

/// Latest year the clock may reach
pub const MAX_YEAR: i32 = 9999;

const INSTANT_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
];

/// Parse an instant from `YYYY-MM-DD`, `YYYY-MM-DDTHH:MM:SS` or
/// `YYYY-MM-DD HH:MM:SS`.
pub fn parse_instant(value: &str) -> Result<NaiveDateTime> {
    let value = value.trim();

    for format in INSTANT_FORMATS {
        if let Ok(instant) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(instant);
        }
    }

    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .ok_or_else(|| EmulatorError::InvalidTime(format!("cannot parse instant '{}'", value)))
}

/// Calendar quarter identifier, rendered as `YYYY-Qn`.
///
/// Q1 = Jan–Mar, Q2 = Apr–Jun, Q3 = Jul–Sep, Q4 = Oct–Dec. The key of an
/// instant depends only on that instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeriodKey {
    year: i32,
    quarter: u8,
}

impl PeriodKey {
    /// Create a key for the given year and quarter (1-4)
    pub fn new(year: i32, quarter: u8) -> Result<Self> {
        if !(1..=4).contains(&quarter) {
            return Err(EmulatorError::InvalidTime(format!(
                "quarter must be 1-4, got {}",
                quarter
            )));
        }
        if !(1..=MAX_YEAR + 1).contains(&year) {
            return Err(EmulatorError::InvalidTime(format!(
                "year {} is out of range",
                year
            )));
        }
        Ok(Self { year, quarter })
    }

    /// Period containing the given instant
    pub fn containing(instant: &NaiveDateTime) -> Self {
        Self {
            year: instant.year(),
            quarter: (instant.month0() / 3 + 1) as u8,
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn quarter(&self) -> u8 {
        self.quarter
    }

    /// First day of the quarter
    pub fn first_day(&self) -> NaiveDate {
        ymd(self.year, u32::from(self.quarter - 1) * 3 + 1, 1)
    }

    /// Last calendar day of the quarter
    pub fn last_day(&self) -> NaiveDate {
        match self.quarter {
            1 => ymd(self.year, 3, 31),
            2 => ymd(self.year, 6, 30),
            3 => ymd(self.year, 9, 30),
            _ => ymd(self.year, 12, 31),
        }
    }

    /// Instant at which the quarter opens (midnight of its first day)
    pub fn start(&self) -> NaiveDateTime {
        self.first_day().and_time(chrono::NaiveTime::MIN)
    }

    pub fn next(&self) -> Self {
        if self.quarter == 4 {
            Self {
                year: self.year + 1,
                quarter: 1,
            }
        } else {
            Self {
                year: self.year,
                quarter: self.quarter + 1,
            }
        }
    }

    pub fn prev(&self) -> Self {
        if self.quarter == 1 {
            Self {
                year: self.year - 1,
                quarter: 4,
            }
        } else {
            Self {
                year: self.year,
                quarter: self.quarter - 1,
            }
        }
    }

    /// Periods strictly after `self` up to and including `target`
    pub fn successors_until(&self, target: PeriodKey) -> Vec<PeriodKey> {
        let mut periods = Vec::new();
        let mut cursor = *self;
        while cursor < target {
            cursor = cursor.next();
            periods.push(cursor);
        }
        periods
    }
}

// Years are range-checked by the constructors, so quarter bounds always exist.
fn ymd(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).expect("quarter bounds exist for supported years")
}

impl fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-Q{}", self.year, self.quarter)
    }
}

impl FromStr for PeriodKey {
    type Err = EmulatorError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || EmulatorError::InvalidTime(format!("invalid period key '{}'", s));

        // Exactly `YYYY-Qn`, so parsing and display round-trip
        let bytes = s.as_bytes();
        let well_formed = bytes.len() == 7
            && bytes[..4].iter().all(u8::is_ascii_digit)
            && &bytes[4..6] == b"-Q"
            && (b'1'..=b'4').contains(&bytes[6]);
        if !well_formed {
            return Err(invalid());
        }

        let year: i32 = s[..4].parse().map_err(|_| invalid())?;
        let quarter = bytes[6] - b'0';
        Self::new(year, quarter)
    }
}

impl TryFrom<String> for PeriodKey {
    type Error = EmulatorError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<PeriodKey> for String {
    fn from(key: PeriodKey) -> Self {
        key.to_string()
    }
}

/// Unit for relative clock advances
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    /// Exact 24-hour steps
    Days,
    /// Calendar months, day-of-month clamped to the month's end
    Months,
    /// Three calendar months
    Quarters,
}

impl FromStr for TimeUnit {
    type Err = EmulatorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "d" | "day" | "days" => Ok(TimeUnit::Days),
            "m" | "month" | "months" => Ok(TimeUnit::Months),
            "q" | "quarter" | "quarters" => Ok(TimeUnit::Quarters),
            other => Err(EmulatorError::InvalidTime(format!(
                "unknown time unit '{}': expected days, months or quarters",
                other
            ))),
        }
    }
}

/// A quarter boundary crossed by a clock change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodTransition {
    /// Period being closed
    pub from: PeriodKey,
    /// Period being opened
    pub to: PeriodKey,
    /// Instant of the boundary (start of `to`)
    pub boundary: NaiveDateTime,
}

/// Simulated clock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualClock {
    current: NaiveDateTime,
    epoch_floor: NaiveDateTime,
}

impl VirtualClock {
    /// Create a clock at `start`; `start` must not precede `epoch_floor`
    pub fn new(start: NaiveDateTime, epoch_floor: NaiveDateTime) -> Result<Self> {
        let clock = Self {
            current: epoch_floor,
            epoch_floor,
        };
        clock.check_instant(&start)?;
        Ok(Self {
            current: start,
            epoch_floor,
        })
    }

    pub fn now(&self) -> NaiveDateTime {
        self.current
    }

    pub fn epoch_floor(&self) -> NaiveDateTime {
        self.epoch_floor
    }

    /// Period key of the current instant
    pub fn period_key(&self) -> PeriodKey {
        PeriodKey::containing(&self.current)
    }

    /// Instant reached by advancing from now, without moving the clock
    pub fn peek_advance(&self, amount: u32, unit: TimeUnit) -> Result<NaiveDateTime> {
        let target = match unit {
            TimeUnit::Days => self
                .current
                .checked_add_signed(Duration::days(i64::from(amount))),
            TimeUnit::Months => self.current.checked_add_months(Months::new(amount)),
            TimeUnit::Quarters => amount
                .checked_mul(3)
                .and_then(|months| self.current.checked_add_months(Months::new(months))),
        }
        .ok_or_else(|| {
            EmulatorError::InvalidTime(format!("advancing by {} {:?} overflows", amount, unit))
        })?;

        self.check_instant(&target)?;
        Ok(target)
    }

    /// Advance by a relative amount, returning the boundaries crossed
    pub fn advance(&mut self, amount: u32, unit: TimeUnit) -> Result<Vec<PeriodTransition>> {
        let target = self.peek_advance(amount, unit)?;
        Ok(self.move_to(target))
    }

    /// Jump to an absolute instant, returning the boundaries crossed.
    ///
    /// Moving backwards crosses no boundaries in the forward sense and
    /// returns an empty list.
    pub fn set(&mut self, instant: NaiveDateTime) -> Result<Vec<PeriodTransition>> {
        self.check_instant(&instant)?;
        Ok(self.move_to(instant))
    }

    /// Parse and jump to an absolute instant
    pub fn set_str(&mut self, instant: &str) -> Result<Vec<PeriodTransition>> {
        let instant = parse_instant(instant)?;
        self.set(instant)
    }

    /// Reject instants before the epoch floor or past the supported range
    pub fn check_instant(&self, instant: &NaiveDateTime) -> Result<()> {
        if *instant < self.epoch_floor {
            return Err(EmulatorError::InvalidTime(format!(
                "{} is before the epoch floor {}",
                instant, self.epoch_floor
            )));
        }
        if instant.year() > MAX_YEAR {
            return Err(EmulatorError::InvalidTime(format!(
                "{} is past year {}",
                instant, MAX_YEAR
            )));
        }
        Ok(())
    }

    fn move_to(&mut self, target: NaiveDateTime) -> Vec<PeriodTransition> {
        let transitions = transitions_between(&self.current, &target);
        self.current = target;
        transitions
    }
}

/// Ordered quarter boundaries in `(from, to]`
pub fn transitions_between(from: &NaiveDateTime, to: &NaiveDateTime) -> Vec<PeriodTransition> {
    let start = PeriodKey::containing(from);
    let end = PeriodKey::containing(to);

    let mut closing = start;
    start
        .successors_until(end)
        .into_iter()
        .map(|opening| {
            let transition = PeriodTransition {
                from: closing,
                to: opening,
                boundary: opening.start(),
            };
            closing = opening;
            transition
        })
        .collect()
}

//! Usage decay
//!
//! Past usage counts for less the older it is: its weight halves every
//! `half_life_days`. Elapsed time for a record is measured in whole days
//! from the record's date to the last day of the period being closed.

use chrono::NaiveDateTime;

use crate::clock::PeriodKey;

/// Smallest factor ever returned, so decay never reaches exactly zero
pub const MIN_DECAY_FACTOR: f64 = 5e-324;

/// `2 ^ (-days_elapsed / half_life_days)`
///
/// Equals 1 at zero elapsed days and 0.5 at one half-life. Negative elapsed
/// time is treated as zero.
pub fn decay_factor(days_elapsed: f64, half_life_days: f64) -> f64 {
    let days = days_elapsed.max(0.0);
    2f64.powf(-days / half_life_days).max(MIN_DECAY_FACTOR)
}

/// Whole days from `timestamp` to the closing day of `period`
pub fn days_until_close(timestamp: &NaiveDateTime, period: PeriodKey) -> i64 {
    (period.last_day() - timestamp.date()).num_days().max(0)
}

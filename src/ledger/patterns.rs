//! Usage Patterns
//!
//! Generators that spread a usage budget over simulated days, starting from
//! a given instant. Each pattern expands to a list of `(instant, amount)`
//! pairs which the engine appends as one atomic batch.

use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::error::{EmulatorError, Result};

/// Share of an end-of-period budget spent in the concentration window
pub const END_OF_PERIOD_SHARE: f64 = 0.8;

/// Shape of injected usage over time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UsagePattern {
    /// Equal amount every day for `days` days
    Steady { total: f64, days: u32 },

    /// Explicit `(day offset, amount)` spikes
    Bursty { bursts: Vec<(u32, f64)> },

    /// 20% spread evenly, 80% in the last `concentration_days`
    EndOfPeriod {
        total: f64,
        #[serde(default = "default_period_days")]
        period_days: u32,
        #[serde(default = "default_concentration_days")]
        concentration_days: u32,
    },
}

fn default_period_days() -> u32 {
    90
}

fn default_concentration_days() -> u32 {
    7
}

impl UsagePattern {
    /// Expand into dated amounts starting at `start`
    pub fn expand(&self, start: NaiveDateTime) -> Result<Vec<(NaiveDateTime, f64)>> {
        let day = |offset: u32| start + Duration::days(i64::from(offset));

        match self {
            UsagePattern::Steady { total, days } => {
                if *days == 0 {
                    return Err(EmulatorError::InvalidUsage(
                        "steady pattern needs at least one day".to_string(),
                    ));
                }
                let daily = total / f64::from(*days);
                Ok((0..*days).map(|d| (day(d), daily)).collect())
            }
            UsagePattern::Bursty { bursts } => {
                Ok(bursts.iter().map(|(d, amount)| (day(*d), *amount)).collect())
            }
            UsagePattern::EndOfPeriod {
                total,
                period_days,
                concentration_days,
            } => {
                if *concentration_days == 0 || concentration_days >= period_days {
                    return Err(EmulatorError::InvalidUsage(format!(
                        "concentration window {} must be within 1..{} days",
                        concentration_days, period_days
                    )));
                }
                let regular_days = period_days - concentration_days;
                let daily_regular = total * (1.0 - END_OF_PERIOD_SHARE) / f64::from(regular_days);
                let daily_concentrated =
                    total * END_OF_PERIOD_SHARE / f64::from(*concentration_days);

                Ok((0..*period_days)
                    .map(|d| {
                        let amount = if d < regular_days {
                            daily_regular
                        } else {
                            daily_concentrated
                        };
                        (day(d), amount)
                    })
                    .collect())
            }
        }
    }
}

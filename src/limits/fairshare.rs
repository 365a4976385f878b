//! Fairshare formulas
//!
//! How an account's allocation maps to the scheduler's integer fairshare
//! value is deployment-specific, so it is a configuration point rather
//! than a fixed constant.

use serde::{Deserialize, Serialize};

/// Default integer ceiling for proportional fairshare
pub const DEFAULT_FAIRSHARE_SCALE: u32 = 65535;

/// Divisor used by the fixed-divisor formula when none is configured
pub const DEFAULT_FAIRSHARE_DIVISOR: u32 = 3;

/// Which accounts an allocation share is normalised against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharePopulation {
    /// Accounts with the same parent, the account included
    Siblings,
    /// Every registered account
    All,
}

/// Fairshare formula
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "formula", rename_all = "snake_case")]
pub enum FairshareFormula {
    /// `floor(scale * own / Σ population)`, 0 when the population sums to 0
    Proportional {
        scale: u32,
        population: SharePopulation,
    },
    /// `max(1, floor(own / divisor))`
    FixedDivisor { divisor: u32 },
}

impl Default for FairshareFormula {
    fn default() -> Self {
        FairshareFormula::Proportional {
            scale: DEFAULT_FAIRSHARE_SCALE,
            population: SharePopulation::Siblings,
        }
    }
}

impl FairshareFormula {
    /// Population to normalise against, if the formula needs one
    pub fn population(&self) -> Option<SharePopulation> {
        match self {
            FairshareFormula::Proportional { population, .. } => Some(*population),
            FairshareFormula::FixedDivisor { .. } => None,
        }
    }

    /// Fairshare for an allocation of `own` out of `population_total`
    pub fn compute(&self, own: f64, population_total: f64) -> u32 {
        match self {
            FairshareFormula::Proportional { scale, .. } => {
                if population_total <= 0.0 || own <= 0.0 {
                    return 0;
                }
                let share = (f64::from(*scale) * own / population_total).floor();
                share.min(f64::from(*scale)) as u32
            }
            FairshareFormula::FixedDivisor { divisor } => {
                let divisor = f64::from((*divisor).max(1));
                ((own / divisor).floor() as u32).max(1)
            }
        }
    }

    /// Reason the formula is unusable, if any
    pub fn validation_error(&self) -> Option<String> {
        match self {
            FairshareFormula::Proportional { scale: 0, .. } => {
                Some("fairshare scale must be > 0".to_string())
            }
            FairshareFormula::FixedDivisor { divisor: 0 } => {
                Some("fairshare divisor must be > 0".to_string())
            }
            _ => None,
        }
    }
}

//! Allocation Calculator
//!
//! Computes, for an account and a period, the decay-adjusted usage of the
//! previous period, the carryover it leaves, the resulting total allocation,
//! and the values derived from it (QoS threshold, billing minutes,
//! fairshare).
//!
//! Allocation state is always rolled forward one quarter boundary at a
//! time. Evaluating a period several quarters ahead folds through every
//! intermediate boundary, so the result never depends on how the clock got
//! there.

use serde::{Deserialize, Serialize};

use super::decay::{days_until_close, decay_factor};
use super::fairshare::SharePopulation;
use super::tres::{self, TresUsage};
use crate::accounts::{Account, AccountStore};
use crate::clock::PeriodKey;
use crate::config::LimitsConfig;
use crate::error::Result;
use crate::ledger::{UsageLedger, UsageRecord};

/// One boundary crossing for one account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloverStep {
    /// Period being closed
    pub from: PeriodKey,
    /// Period being opened
    pub to: PeriodKey,
    /// Undecayed usage recorded in `from`
    pub prior_usage: f64,
    /// Usage in `from` after decay to the close of `from`
    pub decayed_prior_usage: f64,
    pub carryover: f64,
    pub total_allocation: f64,
}

/// Allocation numbers for a single period
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub base_allocation: f64,
    pub prior_usage: f64,
    pub decayed_prior_usage: f64,
    pub carryover: f64,
    pub total_allocation: f64,
}

impl Allocation {
    fn base_only(base_allocation: f64) -> Self {
        Self {
            base_allocation,
            prior_usage: 0.0,
            decayed_prior_usage: 0.0,
            carryover: 0.0,
            total_allocation: base_allocation,
        }
    }
}

/// Derived, per-period view of an account's limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodResult {
    pub account: String,
    pub period_key: PeriodKey,
    pub base_allocation: f64,
    pub prior_usage: f64,
    pub decayed_prior_usage: f64,
    pub carryover: f64,
    pub total_allocation: f64,
    pub fairshare: u32,
    /// Soft limit: `total_allocation * (1 + grace_fraction)`
    pub qos_threshold: f64,
    /// Absolute cap; `None` means the account is never blocked
    pub hard_limit: Option<f64>,
    pub billing_minutes: u64,
    /// `qos_threshold` expressed in billing minutes
    pub threshold_billing_minutes: u64,
    /// Usage recorded so far in `period_key`
    pub current_usage: f64,
    /// Raw TRES breakdown of `current_usage`
    pub tres_usage: TresUsage,
    /// `tres_usage` priced with the TRES billing weights
    pub tres_billing_units: f64,
}

/// Decay / carryover / derived-limit arithmetic
#[derive(Debug, Clone, Default)]
pub struct AllocationCalculator {
    config: LimitsConfig,
}

impl AllocationCalculator {
    pub fn new(config: LimitsConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LimitsConfig {
        &self.config
    }

    /// Raw and decayed usage of `account` in `period`, decayed to the
    /// period's last day
    pub fn decayed_usage(&self, account: &Account, ledger: &UsageLedger, period: PeriodKey) -> (f64, f64) {
        ledger
            .records_for(&account.name, Some(period))
            .fold((0.0, 0.0), |(raw, decayed), record| {
                let days = days_until_close(&record.timestamp(), period) as f64;
                let factor = decay_factor(days, account.half_life_days);
                (
                    raw + record.amount_node_hours(),
                    decayed + record.amount_node_hours() * factor,
                )
            })
    }

    /// Roll `account` out of `closing` into the next period
    pub fn rollover(&self, account: &Account, ledger: &UsageLedger, closing: PeriodKey) -> RolloverStep {
        let base = account.base_allocation;
        let (prior_usage, decayed_prior_usage) = self.decayed_usage(account, ledger, closing);

        let carryover = if self.config.carryover_enabled {
            (base - decayed_prior_usage).max(0.0)
        } else {
            0.0
        };

        RolloverStep {
            from: closing,
            to: closing.next(),
            prior_usage,
            decayed_prior_usage,
            carryover,
            total_allocation: base + carryover,
        }
    }

    /// Allocation of `account` for `period`, folding through every
    /// boundary between the account's opening period and `period`
    pub fn allocation_for(&self, account: &Account, ledger: &UsageLedger, period: PeriodKey) -> Allocation {
        let base = account.base_allocation;

        account
            .created_period()
            .successors_until(period)
            .into_iter()
            .fold(Allocation::base_only(base), |_, opening| {
                let step = self.rollover(account, ledger, opening.prev());
                Allocation {
                    base_allocation: base,
                    prior_usage: step.prior_usage,
                    decayed_prior_usage: step.decayed_prior_usage,
                    carryover: step.carryover,
                    total_allocation: step.total_allocation,
                }
            })
    }

    /// Roll the account's stored allocation forward to `target`, one boundary
    /// at a time, returning the steps taken
    pub fn roll_forward(
        &self,
        account: &mut Account,
        ledger: &UsageLedger,
        target: PeriodKey,
    ) -> Vec<RolloverStep> {
        let mut steps = Vec::new();
        while account.last_evaluated_period < target {
            let step = self.rollover(account, ledger, account.last_evaluated_period);
            account.total_allocation = step.total_allocation;
            account.last_evaluated_period = step.to;
            account.rollover_history.insert(step.to, step.clone());
            steps.push(step);
        }
        steps
    }

    /// Recompute the account's stored allocation and rollover history from
    /// scratch for `current`.
    ///
    /// Used after the clock moves backwards, after a backdated injection and
    /// after a policy change.
    pub fn rebuild(&self, account: &mut Account, ledger: &UsageLedger, current: PeriodKey) {
        account.rollover_history.clear();
        account.total_allocation = account.base_allocation;
        account.last_evaluated_period = account.created_period;
        self.roll_forward(account, ledger, current);
    }

    /// Soft limit for a total allocation
    pub fn qos_threshold(total_allocation: f64, grace_fraction: f64) -> f64 {
        total_allocation * (1.0 + grace_fraction)
    }

    /// Node-hours expressed in scheduler billing minutes
    pub fn billing_minutes(&self, node_hours: f64) -> u64 {
        (node_hours * self.config.minutes_per_hour * self.config.billing_weight)
            .max(0.0)
            .floor() as u64
    }

    /// Raw TRES breakdown of a usage record on the configured node profile
    pub fn raw_tres(&self, record: &UsageRecord) -> TresUsage {
        tres::raw_tres(record.amount_node_hours(), &self.config.node_tres)
    }

    /// Billing units for a raw TRES breakdown
    pub fn tres_billing_units(&self, usage: &TresUsage) -> f64 {
        tres::billing_units(usage, &self.config.tres_billing_weights)
    }

    /// Fairshare of `account` in `period` against its configured population
    pub fn fairshare(
        &self,
        accounts: &AccountStore,
        ledger: &UsageLedger,
        account: &Account,
        own_total: f64,
        period: PeriodKey,
    ) -> Result<u32> {
        let formula = self.config.fairshare;
        let population_total = match formula.population() {
            None => 0.0,
            Some(population) => {
                let members = match population {
                    SharePopulation::Siblings => accounts.siblings(&account.name)?,
                    SharePopulation::All => accounts.list(),
                };
                members
                    .into_iter()
                    .map(|member| {
                        if member.name == account.name {
                            own_total
                        } else {
                            self.allocation_for(member, ledger, period).total_allocation
                        }
                    })
                    .sum()
            }
        };
        Ok(formula.compute(own_total, population_total))
    }

    /// Full period evaluation for a registered account
    pub fn evaluate(
        &self,
        accounts: &AccountStore,
        ledger: &UsageLedger,
        name: &str,
        period: PeriodKey,
    ) -> Result<PeriodResult> {
        let account = accounts.get(name)?;
        let allocation = self.allocation_for(account, ledger, period);
        let qos_threshold = Self::qos_threshold(allocation.total_allocation, account.grace_fraction);
        let fairshare = self.fairshare(accounts, ledger, account, allocation.total_allocation, period)?;
        let breakdowns: Vec<TresUsage> = ledger
            .records_for(name, Some(period))
            .map(|record| self.raw_tres(record))
            .collect();
        let tres_usage = tres::sum(&breakdowns);

        Ok(PeriodResult {
            account: account.name.clone(),
            period_key: period,
            base_allocation: allocation.base_allocation,
            prior_usage: allocation.prior_usage,
            decayed_prior_usage: allocation.decayed_prior_usage,
            carryover: allocation.carryover,
            total_allocation: allocation.total_allocation,
            fairshare,
            qos_threshold,
            hard_limit: account.hard_limit,
            billing_minutes: self.billing_minutes(allocation.total_allocation),
            threshold_billing_minutes: self.billing_minutes(qos_threshold),
            current_usage: ledger.total_for(name, period, None),
            tres_billing_units: self.tres_billing_units(&tres_usage),
            tres_usage,
        })
    }
}

//! Usage Ledger
//!
//! Append-only store of node-hour consumption. A record's period is fixed
//! from its timestamp when it is appended; nothing ever rewrites or removes
//! a record afterwards, which is what makes checkpoints and rollovers
//! replayable.

pub mod patterns;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::clock::PeriodKey;
use crate::error::{EmulatorError, Result};

pub use patterns::UsagePattern;

/// One immutable usage event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    id: u64,
    account: String,
    user: String,
    timestamp: NaiveDateTime,
    amount_node_hours: f64,
    period: PeriodKey,
}

impl UsageRecord {
    /// Sequence number, unique within a ledger
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn timestamp(&self) -> NaiveDateTime {
        self.timestamp
    }

    pub fn amount_node_hours(&self) -> f64 {
        self.amount_node_hours
    }

    /// Period the record was bucketed into at insertion
    pub fn period(&self) -> PeriodKey {
        self.period
    }
}

/// Usage waiting to be appended
#[derive(Debug, Clone, PartialEq)]
pub struct PendingUsage {
    pub account: String,
    pub user: String,
    pub amount_node_hours: f64,
    pub at: NaiveDateTime,
}

/// Append-only usage store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageLedger {
    records: Vec<UsageRecord>,
    next_id: u64,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject negative or non-finite amounts
    pub fn validate_amount(amount: f64) -> Result<()> {
        if !amount.is_finite() {
            return Err(EmulatorError::InvalidUsage(format!(
                "amount {} is not finite",
                amount
            )));
        }
        if amount < 0.0 {
            return Err(EmulatorError::InvalidUsage(format!(
                "amount {} is negative",
                amount
            )));
        }
        Ok(())
    }

    /// Append a single record.
    ///
    /// The caller is responsible for checking that the account exists.
    pub fn append(&mut self, usage: PendingUsage) -> Result<UsageRecord> {
        Self::validate_amount(usage.amount_node_hours)?;
        Ok(self.push(usage))
    }

    /// Append a batch atomically: either every entry is valid and all are
    /// appended, or nothing is.
    pub fn append_all(&mut self, batch: Vec<PendingUsage>) -> Result<Vec<UsageRecord>> {
        for usage in &batch {
            Self::validate_amount(usage.amount_node_hours)?;
        }
        Ok(batch.into_iter().map(|usage| self.push(usage)).collect())
    }

    fn push(&mut self, usage: PendingUsage) -> UsageRecord {
        let record = UsageRecord {
            id: self.next_id,
            period: PeriodKey::containing(&usage.at),
            account: usage.account,
            user: usage.user,
            timestamp: usage.at,
            amount_node_hours: usage.amount_node_hours,
        };
        self.next_id += 1;
        self.records.push(record.clone());
        record
    }

    /// Sum of usage for an account in a period, optionally for one user.
    /// A period without records sums to zero.
    pub fn total_for(&self, account: &str, period: PeriodKey, user: Option<&str>) -> f64 {
        self.records
            .iter()
            .filter(|r| r.account == account && r.period == period)
            .filter(|r| user.map_or(true, |u| r.user == u))
            .map(|r| r.amount_node_hours)
            .sum()
    }

    /// Sum of all usage ever recorded for an account
    pub fn lifetime_total(&self, account: &str) -> f64 {
        self.records
            .iter()
            .filter(|r| r.account == account)
            .map(|r| r.amount_node_hours)
            .sum()
    }

    /// Records for an account, optionally restricted to one period
    pub fn records_for<'a>(
        &'a self,
        account: &'a str,
        period: Option<PeriodKey>,
    ) -> impl Iterator<Item = &'a UsageRecord> + 'a {
        self.records
            .iter()
            .filter(move |r| r.account == account && period.map_or(true, |p| r.period == p))
    }

    /// Periods in which an account has any usage
    pub fn periods_with_usage(&self, account: &str) -> BTreeSet<PeriodKey> {
        self.records_for(account, None).map(|r| r.period).collect()
    }

    pub fn records(&self) -> &[UsageRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::parse_instant;

    fn usage(account: &str, user: &str, amount: f64, at: &str) -> PendingUsage {
        PendingUsage {
            account: account.to_string(),
            user: user.to_string(),
            amount_node_hours: amount,
            at: parse_instant(at).unwrap(),
        }
    }

    fn q(key: &str) -> PeriodKey {
        key.parse().unwrap()
    }

    #[test]
    fn test_append_assigns_period_and_id() {
        let mut ledger = UsageLedger::new();
        let first = ledger.append(usage("acct", "alice", 10.0, "2024-03-31")).unwrap();
        let second = ledger.append(usage("acct", "bob", 5.0, "2024-04-01")).unwrap();

        assert_eq!(first.id(), 0);
        assert_eq!(second.id(), 1);
        assert_eq!(first.period(), q("2024-Q1"));
        assert_eq!(second.period(), q("2024-Q2"));
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn test_rejects_invalid_amounts() {
        let mut ledger = UsageLedger::new();
        for amount in [-5.0, f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let err = ledger.append(usage("acct", "alice", amount, "2024-01-01")).unwrap_err();
            assert!(matches!(err, EmulatorError::InvalidUsage(_)));
        }
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_zero_amount_is_accepted() {
        let mut ledger = UsageLedger::new();
        assert!(ledger.append(usage("acct", "alice", 0.0, "2024-01-01")).is_ok());
    }

    #[test]
    fn test_append_all_is_atomic() {
        let mut ledger = UsageLedger::new();
        let batch = vec![
            usage("acct", "alice", 10.0, "2024-01-01"),
            usage("acct", "alice", -1.0, "2024-01-02"),
        ];
        assert!(ledger.append_all(batch).is_err());
        assert!(ledger.is_empty());

        let batch = vec![
            usage("acct", "alice", 10.0, "2024-01-01"),
            usage("acct", "alice", 1.0, "2024-01-02"),
        ];
        assert_eq!(ledger.append_all(batch).unwrap().len(), 2);
    }

    #[test]
    fn test_totals() {
        let mut ledger = UsageLedger::new();
        ledger.append(usage("acct", "alice", 100.0, "2024-01-10")).unwrap();
        ledger.append(usage("acct", "bob", 50.0, "2024-02-10")).unwrap();
        ledger.append(usage("acct", "alice", 25.0, "2024-05-10")).unwrap();
        ledger.append(usage("other", "alice", 999.0, "2024-01-10")).unwrap();

        assert_eq!(ledger.total_for("acct", q("2024-Q1"), None), 150.0);
        assert_eq!(ledger.total_for("acct", q("2024-Q1"), Some("alice")), 100.0);
        assert_eq!(ledger.total_for("acct", q("2024-Q2"), None), 25.0);
        assert_eq!(ledger.total_for("acct", q("2023-Q4"), None), 0.0);
        assert_eq!(ledger.total_for("missing", q("2024-Q1"), None), 0.0);
        assert_eq!(ledger.lifetime_total("acct"), 175.0);

        let periods: Vec<String> = ledger
            .periods_with_usage("acct")
            .into_iter()
            .map(|p| p.to_string())
            .collect();
        assert_eq!(periods, vec!["2024-Q1", "2024-Q2"]);
    }

    #[test]
    fn test_records_for_filters() {
        let mut ledger = UsageLedger::new();
        ledger.append(usage("acct", "alice", 1.0, "2024-01-10")).unwrap();
        ledger.append(usage("acct", "alice", 2.0, "2024-05-10")).unwrap();

        assert_eq!(ledger.records_for("acct", None).count(), 2);
        assert_eq!(ledger.records_for("acct", Some(q("2024-Q2"))).count(), 1);
    }
}

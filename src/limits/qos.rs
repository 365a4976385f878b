//! QoS State Machine
//!
//! Evaluation and enforcement are separate steps. `check` compares the
//! active period's usage with the account's thresholds and reports a
//! recommendation without touching state; `apply` is the only operation
//! that changes an account's QoS state, whether it is called with a
//! recommendation or as an administrative override.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::calculator::PeriodResult;
use crate::accounts::Account;
use crate::clock::PeriodKey;
use crate::error::EmulatorError;

/// Fraction of the soft limit at which usage is reported as approaching it
pub const APPROACHING_THRESHOLD_RATIO: f64 = 0.9;

/// QoS level of an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QosState {
    Normal,
    Slowdown,
    Blocked,
}

/// Scheduler-facing description of a QoS level
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QosLevelInfo {
    pub priority_weight: u32,
    pub max_submit_jobs: Option<u32>,
    pub description: &'static str,
}

impl QosState {
    pub const ALL: [QosState; 3] = [QosState::Normal, QosState::Slowdown, QosState::Blocked];

    pub fn as_str(&self) -> &'static str {
        match self {
            QosState::Normal => "normal",
            QosState::Slowdown => "slowdown",
            QosState::Blocked => "blocked",
        }
    }

    /// 0 for NORMAL, 1 for SLOWDOWN, 2 for BLOCKED
    pub fn severity(&self) -> u8 {
        match self {
            QosState::Normal => 0,
            QosState::Slowdown => 1,
            QosState::Blocked => 2,
        }
    }

    pub fn level_info(&self) -> QosLevelInfo {
        match self {
            QosState::Normal => QosLevelInfo {
                priority_weight: 1000,
                max_submit_jobs: None,
                description: "Normal priority jobs",
            },
            QosState::Slowdown => QosLevelInfo {
                priority_weight: 500_000,
                max_submit_jobs: None,
                description: "Reduced priority for over-threshold usage",
            },
            QosState::Blocked => QosLevelInfo {
                priority_weight: 1_000_000,
                max_submit_jobs: Some(0),
                description: "Jobs blocked due to hard limit exceeded",
            },
        }
    }

    /// Transition table
    pub fn transition_to(self, to: QosState) -> TransitionKind {
        use QosState::*;
        match (self, to) {
            (Normal, Normal) | (Slowdown, Slowdown) | (Blocked, Blocked) => TransitionKind::Unchanged,
            (Normal, Slowdown) | (Normal, Blocked) | (Slowdown, Blocked) => TransitionKind::Escalation,
            (Slowdown, Normal) | (Blocked, Normal) | (Blocked, Slowdown) => TransitionKind::Relaxation,
        }
    }
}

impl fmt::Display for QosState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QosState {
    type Err = EmulatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "normal" => Ok(QosState::Normal),
            "slowdown" => Ok(QosState::Slowdown),
            "blocked" => Ok(QosState::Blocked),
            other => Err(EmulatorError::InvalidConfiguration(format!(
                "unknown QoS state '{}'",
                other
            ))),
        }
    }
}

/// Direction of a QoS change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Unchanged,
    Escalation,
    Relaxation,
}

/// Who asked for a QoS change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionOrigin {
    Recommendation,
    Administrative,
}

/// Where usage sits relative to the limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdStatus {
    Normal,
    ApproachingThreshold,
    SoftLimitExceeded,
    HardLimitExceeded,
}

/// Read-only evaluation of an account's QoS
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QosCheck {
    pub account: String,
    pub period_key: PeriodKey,
    pub current_usage: f64,
    pub qos_threshold: f64,
    pub hard_limit: Option<f64>,
    pub percentage_used: f64,
    pub current: QosState,
    pub recommended: QosState,
    pub changed: bool,
    pub transition: TransitionKind,
    pub threshold_status: ThresholdStatus,
}

/// Applied QoS change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QosTransition {
    pub account: String,
    pub from: QosState,
    pub to: QosState,
    pub kind: TransitionKind,
    pub origin: TransitionOrigin,
    pub at: NaiveDateTime,
}

/// Impact category of a projected QoS change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpactSeverity {
    None,
    Warning,
    Critical,
    Improvement,
}

/// Projected effect of a usage level, computed without mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QosImpact {
    pub account: String,
    pub projected_usage: f64,
    pub current: QosState,
    pub projected: QosState,
    pub change_needed: bool,
    pub severity: ImpactSeverity,
    pub description: String,
    pub affected_users: Vec<String>,
}

/// Per-account line of a QoS report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QosReportEntry {
    pub account: String,
    pub state: QosState,
    pub usage: f64,
    pub priority_weight: u32,
}

/// Number of accounts in each state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QosSummary {
    pub normal: usize,
    pub slowdown: usize,
    pub blocked: usize,
}

impl QosSummary {
    fn count(&mut self, state: QosState) {
        match state {
            QosState::Normal => self.normal += 1,
            QosState::Slowdown => self.slowdown += 1,
            QosState::Blocked => self.blocked += 1,
        }
    }
}

/// QoS status of every account in the active period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QosReport {
    pub timestamp: NaiveDateTime,
    pub period_key: PeriodKey,
    pub accounts: Vec<QosReportEntry>,
    pub summary: QosSummary,
}

/// Threshold-driven QoS evaluation and enforcement
#[derive(Debug, Clone, Copy, Default)]
pub struct QosStateMachine;

impl QosStateMachine {
    pub fn new() -> Self {
        Self
    }

    /// State recommended for `usage` under the given limits
    pub fn recommend(usage: f64, qos_threshold: f64, hard_limit: Option<f64>) -> QosState {
        if hard_limit.map_or(false, |limit| usage >= limit) {
            QosState::Blocked
        } else if usage >= qos_threshold {
            QosState::Slowdown
        } else {
            QosState::Normal
        }
    }

    pub fn threshold_status(usage: f64, qos_threshold: f64, hard_limit: Option<f64>) -> ThresholdStatus {
        if hard_limit.map_or(false, |limit| usage >= limit) {
            ThresholdStatus::HardLimitExceeded
        } else if usage >= qos_threshold {
            ThresholdStatus::SoftLimitExceeded
        } else if usage >= qos_threshold * APPROACHING_THRESHOLD_RATIO {
            ThresholdStatus::ApproachingThreshold
        } else {
            ThresholdStatus::Normal
        }
    }

    /// Compare the period's usage with its limits; never mutates
    pub fn check(&self, account: &Account, result: &PeriodResult) -> QosCheck {
        let usage = result.current_usage;
        let current = account.qos_state();
        let recommended = Self::recommend(usage, result.qos_threshold, result.hard_limit);
        let percentage_used = if result.total_allocation > 0.0 {
            usage / result.total_allocation * 100.0
        } else {
            0.0
        };

        QosCheck {
            account: account.name.clone(),
            period_key: result.period_key,
            current_usage: usage,
            qos_threshold: result.qos_threshold,
            hard_limit: result.hard_limit,
            percentage_used,
            current,
            recommended,
            changed: current != recommended,
            transition: current.transition_to(recommended),
            threshold_status: Self::threshold_status(usage, result.qos_threshold, result.hard_limit),
        }
    }

    /// Set the account's QoS state
    pub fn apply(
        &self,
        account: &mut Account,
        to: QosState,
        origin: TransitionOrigin,
        at: NaiveDateTime,
    ) -> QosTransition {
        let from = account.qos_state;
        account.qos_state = to;

        QosTransition {
            account: account.name.clone(),
            from,
            to,
            kind: from.transition_to(to),
            origin,
            at,
        }
    }

    /// What the account's state would become at `projected_usage`
    pub fn simulate_impact(
        &self,
        account: &Account,
        result: &PeriodResult,
        projected_usage: f64,
        affected_users: Vec<String>,
    ) -> QosImpact {
        let current = account.qos_state();
        let projected = Self::recommend(projected_usage, result.qos_threshold, result.hard_limit);

        let (severity, description) = match current.transition_to(projected) {
            TransitionKind::Unchanged => (
                ImpactSeverity::None,
                format!("No QoS change needed - remains at {}", current),
            ),
            TransitionKind::Escalation if projected == QosState::Blocked => (
                ImpactSeverity::Critical,
                "Account will be blocked due to usage exceeding the hard limit".to_string(),
            ),
            TransitionKind::Escalation => (
                ImpactSeverity::Warning,
                "Account will be slowed down due to usage exceeding the threshold".to_string(),
            ),
            TransitionKind::Relaxation => (
                ImpactSeverity::Improvement,
                format!("Account QoS improved from {} to {}", current, projected),
            ),
        };

        QosImpact {
            account: account.name.clone(),
            projected_usage,
            current,
            projected,
            change_needed: current != projected,
            severity,
            description,
            affected_users,
        }
    }

    /// Summarise states and usage across accounts
    pub fn report(
        &self,
        timestamp: NaiveDateTime,
        period_key: PeriodKey,
        accounts: impl IntoIterator<Item = (QosState, String, f64)>,
    ) -> QosReport {
        let mut summary = QosSummary::default();
        let entries = accounts
            .into_iter()
            .map(|(state, account, usage)| {
                summary.count(state);
                QosReportEntry {
                    account,
                    state,
                    usage,
                    priority_weight: state.level_info().priority_weight,
                }
            })
            .collect();

        QosReport {
            timestamp,
            period_key,
            accounts: entries,
            summary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::AccountSpec;
    use crate::clock::parse_instant;
    use crate::config::LimitsConfig;

    fn account(hard_limit: Option<f64>) -> Account {
        let mut spec = AccountSpec::new("physics", "", 1000.0);
        spec.hard_limit = hard_limit;
        Account::from_spec(spec, &LimitsConfig::default(), "2024-Q1".parse().unwrap()).unwrap()
    }

    fn result(usage: f64, hard_limit: Option<f64>) -> PeriodResult {
        PeriodResult {
            account: "physics".to_string(),
            period_key: "2024-Q1".parse().unwrap(),
            base_allocation: 1000.0,
            prior_usage: 0.0,
            decayed_prior_usage: 0.0,
            carryover: 0.0,
            total_allocation: 1000.0,
            fairshare: 0,
            qos_threshold: 1200.0,
            hard_limit,
            billing_minutes: 60_000,
            threshold_billing_minutes: 72_000,
            current_usage: usage,
            tres_usage: Default::default(),
            tres_billing_units: 0.0,
        }
    }

    #[test]
    fn test_recommend_bands() {
        assert_eq!(QosStateMachine::recommend(1100.0, 1200.0, Some(2000.0)), QosState::Normal);
        assert_eq!(QosStateMachine::recommend(1200.0, 1200.0, Some(2000.0)), QosState::Slowdown);
        assert_eq!(QosStateMachine::recommend(1999.0, 1200.0, Some(2000.0)), QosState::Slowdown);
        assert_eq!(QosStateMachine::recommend(2000.0, 1200.0, Some(2000.0)), QosState::Blocked);
        assert_eq!(QosStateMachine::recommend(1.0e9, 1200.0, None), QosState::Slowdown);
    }

    #[test]
    fn test_check_is_read_only() {
        let machine = QosStateMachine::new();
        let acct = account(Some(2000.0));
        let before = acct.clone();

        let check = machine.check(&acct, &result(1300.0, Some(2000.0)));
        assert_eq!(check.current, QosState::Normal);
        assert_eq!(check.recommended, QosState::Slowdown);
        assert!(check.changed);
        assert_eq!(check.transition, TransitionKind::Escalation);
        assert_eq!(check.threshold_status, ThresholdStatus::SoftLimitExceeded);
        assert!((check.percentage_used - 130.0).abs() < 1e-9);
        assert_eq!(acct, before);
    }

    #[test]
    fn test_threshold_status_approaching() {
        assert_eq!(
            QosStateMachine::threshold_status(1100.0, 1200.0, None),
            ThresholdStatus::ApproachingThreshold
        );
        assert_eq!(
            QosStateMachine::threshold_status(100.0, 1200.0, None),
            ThresholdStatus::Normal
        );
        assert_eq!(
            QosStateMachine::threshold_status(5000.0, 1200.0, Some(4000.0)),
            ThresholdStatus::HardLimitExceeded
        );
    }

    #[test]
    fn test_apply_changes_state() {
        let machine = QosStateMachine::new();
        let mut acct = account(None);
        let at = parse_instant("2024-02-01").unwrap();

        let t = machine.apply(&mut acct, QosState::Blocked, TransitionOrigin::Administrative, at);
        assert_eq!(t.from, QosState::Normal);
        assert_eq!(t.to, QosState::Blocked);
        assert_eq!(t.kind, TransitionKind::Escalation);
        assert_eq!(acct.qos_state(), QosState::Blocked);

        let t = machine.apply(&mut acct, QosState::Normal, TransitionOrigin::Recommendation, at);
        assert_eq!(t.kind, TransitionKind::Relaxation);
        assert_eq!(acct.qos_state(), QosState::Normal);
    }

    #[test]
    fn test_transition_table() {
        for from in QosState::ALL {
            for to in QosState::ALL {
                let kind = from.transition_to(to);
                let expected = match from.severity().cmp(&to.severity()) {
                    std::cmp::Ordering::Equal => TransitionKind::Unchanged,
                    std::cmp::Ordering::Less => TransitionKind::Escalation,
                    std::cmp::Ordering::Greater => TransitionKind::Relaxation,
                };
                assert_eq!(kind, expected, "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_simulate_impact() {
        let machine = QosStateMachine::new();
        let acct = account(Some(2000.0));
        let base = result(0.0, Some(2000.0));

        let impact = machine.simulate_impact(&acct, &base, 2500.0, vec!["alice".into()]);
        assert_eq!(impact.projected, QosState::Blocked);
        assert_eq!(impact.severity, ImpactSeverity::Critical);
        assert_eq!(impact.affected_users, vec!["alice".to_string()]);

        let impact = machine.simulate_impact(&acct, &base, 1500.0, vec![]);
        assert_eq!(impact.severity, ImpactSeverity::Warning);

        let impact = machine.simulate_impact(&acct, &base, 10.0, vec![]);
        assert_eq!(impact.severity, ImpactSeverity::None);
        assert!(!impact.change_needed);
    }

    #[test]
    fn test_state_parse_and_info() {
        assert_eq!("SLOWDOWN".parse::<QosState>().unwrap(), QosState::Slowdown);
        assert!("paused".parse::<QosState>().is_err());
        assert_eq!(QosState::Blocked.level_info().max_submit_jobs, Some(0));
        assert_eq!(QosState::Normal.to_string(), "normal");
    }

    #[test]
    fn test_report_summary() {
        let machine = QosStateMachine::new();
        let report = machine.report(
            parse_instant("2024-02-01").unwrap(),
            "2024-Q1".parse().unwrap(),
            vec![
                (QosState::Normal, "a".to_string(), 10.0),
                (QosState::Blocked, "b".to_string(), 5000.0),
                (QosState::Normal, "c".to_string(), 0.0),
            ],
        );
        assert_eq!(report.summary.normal, 2);
        assert_eq!(report.summary.blocked, 1);
        assert_eq!(report.accounts[1].priority_weight, 1_000_000);
    }
}

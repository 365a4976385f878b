//! Policy Engine
//!
//! [`Engine`] owns the live state (clock, accounts, ledger), the named
//! checkpoints and the calculator, and exposes the strongly-typed operation
//! set the CLI and scenario runner call. Every mutating operation validates
//! fully before touching state, so a failed call leaves state as it was.
//!
//! [`Emulator`] is the shared handle: one engine behind a
//! `tokio::sync::RwLock`, with mutations under the write guard and queries
//! under the read guard.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::accounts::{Account, AccountSpec, AccountUpdate, User};
use crate::clock::{parse_instant, PeriodKey, PeriodTransition, TimeUnit, VirtualClock};
use crate::config::Config;
use crate::error::{EmulatorError, Result};
use crate::ledger::{PendingUsage, UsagePattern, UsageRecord};
use crate::limits::calculator::{AllocationCalculator, PeriodResult};
use crate::limits::qos::{
    QosCheck, QosImpact, QosReport, QosState, QosStateMachine, QosTransition, TransitionKind,
    TransitionOrigin,
};
use crate::metrics;
use crate::scenario::{Scenario, ScenarioError, ScenarioReport};
use crate::state::{CheckpointInfo, CheckpointStore, EngineState, PersistedEngine};

/// Usage and allocation of an account in the active period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub account: String,
    pub period_key: PeriodKey,
    pub current_usage: f64,
    pub lifetime_usage: f64,
    pub total_allocation: f64,
    pub remaining: f64,
    pub percentage_used: f64,
}

/// Synchronous policy engine
#[derive(Debug, Clone)]
pub struct Engine {
    state: EngineState,
    checkpoints: CheckpointStore,
    calculator: AllocationCalculator,
    qos: QosStateMachine,
    strict_users: bool,
}

impl Engine {
    /// Fresh engine at the configured start time
    pub fn new(config: &Config) -> Result<Self> {
        config.engine.validate()?;
        let clock = VirtualClock::new(
            config.engine.start_instant()?,
            config.engine.epoch_floor_instant()?,
        )?;
        Self::from_persisted(config, PersistedEngine::new(EngineState::new(clock), CheckpointStore::new()))
    }

    /// Engine resuming from a persisted snapshot.
    ///
    /// Stored allocations are recomputed under the current limits
    /// configuration, which may differ from the one they were written with.
    pub fn from_persisted(config: &Config, persisted: PersistedEngine) -> Result<Self> {
        config.limits.validate()?;
        let mut engine = Self {
            state: persisted.live,
            checkpoints: persisted.checkpoints,
            calculator: AllocationCalculator::new(config.limits.clone()),
            qos: QosStateMachine::new(),
            strict_users: config.engine.strict_users,
        };
        engine.rebuild_all();
        metrics::ACCOUNTS_ACTIVE.set(engine.state.accounts.len() as i64);
        Ok(engine)
    }

    /// Live state and checkpoints for persistence
    pub fn persisted(&self) -> PersistedEngine {
        PersistedEngine::new(self.state.clone(), self.checkpoints.clone())
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn calculator(&self) -> &AllocationCalculator {
        &self.calculator
    }

    // ------------------------------------------------------------------
    // Clock
    // ------------------------------------------------------------------

    pub fn now(&self) -> NaiveDateTime {
        self.state.clock.now()
    }

    pub fn period_key(&self) -> PeriodKey {
        self.state.clock.period_key()
    }

    /// Advance the clock and roll every account through each boundary crossed
    pub fn advance(&mut self, amount: u32, unit: TimeUnit) -> Result<Vec<PeriodTransition>> {
        let from = self.now();
        let transitions = self.state.clock.advance(amount, unit)?;
        info!(
            from = %from,
            to = %self.now(),
            amount,
            unit = ?unit,
            boundaries = transitions.len(),
            "Advanced simulated time"
        );
        self.roll_through(&transitions);
        Ok(transitions)
    }

    /// Jump to an absolute instant.
    ///
    /// Moving forwards rolls accounts through each boundary crossed. Moving
    /// backwards returns no transitions and recomputes every account's
    /// allocation for the earlier period; ledger records are never touched.
    pub fn set_time(&mut self, instant: NaiveDateTime) -> Result<Vec<PeriodTransition>> {
        let from = self.now();
        let transitions = self.state.clock.set(instant)?;
        info!(from = %from, to = %instant, boundaries = transitions.len(), "Set simulated time");

        if instant < from && PeriodKey::containing(&instant) < PeriodKey::containing(&from) {
            let period = self.period_key();
            warn!(period = %period, "Clock moved back across a period boundary, rebuilding allocations");
            self.rebuild_all();
        } else {
            self.roll_through(&transitions);
        }
        Ok(transitions)
    }

    /// Recompute every account's stored allocation for the active period
    fn rebuild_all(&mut self) {
        let period = self.period_key();
        let ledger = &self.state.ledger;
        for account in self.state.accounts.iter_mut() {
            self.calculator.rebuild(account, ledger, period);
        }
    }

    pub fn set_time_str(&mut self, instant: &str) -> Result<Vec<PeriodTransition>> {
        let instant = parse_instant(instant)?;
        self.set_time(instant)
    }

    fn roll_through(&mut self, transitions: &[PeriodTransition]) {
        let ledger = &self.state.ledger;
        for transition in transitions {
            for account in self.state.accounts.iter_mut() {
                for step in self.calculator.roll_forward(account, ledger, transition.to) {
                    metrics::PERIOD_ROLLOVERS_TOTAL.inc();
                    info!(
                        account = %account.name,
                        from = %step.from,
                        to = %step.to,
                        prior_usage = step.prior_usage,
                        decayed_usage = step.decayed_prior_usage,
                        carryover = step.carryover,
                        total_allocation = step.total_allocation,
                        "Period rollover"
                    );
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Accounts and users
    // ------------------------------------------------------------------

    pub fn create_account(&mut self, spec: AccountSpec) -> Result<Account> {
        let account = Account::from_spec(spec, self.calculator.config(), self.period_key())?;
        let created = self.state.accounts.insert(account)?.clone();
        metrics::ACCOUNTS_ACTIVE.set(self.state.accounts.len() as i64);
        info!(
            account = %created.name,
            base_allocation = created.base_allocation,
            grace_fraction = created.grace_fraction,
            half_life_days = created.half_life_days,
            period = %created.created_period(),
            "Created account"
        );
        Ok(created)
    }

    pub fn get_account(&self, name: &str) -> Result<&Account> {
        self.state.accounts.get(name)
    }

    pub fn list_accounts(&self) -> Vec<&Account> {
        self.state.accounts.list()
    }

    /// Modify an account's policy and recompute its active allocation
    pub fn update_account(&mut self, name: &str, update: &AccountUpdate) -> Result<Account> {
        let mut next = self.state.accounts.get(name)?.updated(update)?;
        if let Some(parent) = next.parent.as_deref() {
            self.check_parent_chain(name, parent)?;
        }

        self.calculator
            .rebuild(&mut next, &self.state.ledger, self.period_key());
        self.state.accounts.replace(next.clone())?;
        info!(account = %name, total_allocation = next.total_allocation(), "Updated account");
        Ok(next)
    }

    // Setting `parent` must not make `name` its own ancestor
    fn check_parent_chain(&self, name: &str, parent: &str) -> Result<()> {
        let mut cursor = Some(parent.to_string());
        while let Some(current) = cursor {
            if current == name {
                return Err(EmulatorError::InvalidConfiguration(format!(
                    "account {} cannot be nested under itself",
                    name
                )));
            }
            cursor = self.state.accounts.get(&current)?.parent.clone();
        }
        Ok(())
    }

    /// Remove an account. Its usage records stay in the ledger.
    pub fn delete_account(&mut self, name: &str) -> Result<Account> {
        let removed = self.state.accounts.remove(name)?;
        metrics::ACCOUNTS_ACTIVE.set(self.state.accounts.len() as i64);
        info!(account = %name, "Deleted account");
        Ok(removed)
    }

    pub fn add_user(&mut self, user: &str, account: &str) -> Result<User> {
        let user = self.state.accounts.add_user(user, account)?.clone();
        debug!(user = %user.name, account = %account, "Associated user");
        Ok(user)
    }

    pub fn get_user(&self, name: &str) -> Result<&User> {
        self.state.accounts.user(name)
    }

    // ------------------------------------------------------------------
    // Usage
    // ------------------------------------------------------------------

    // Everything that can reject a usage entry, checked before any append
    fn check_usage(&self, account: &str, user: &str, amount: f64, at: &NaiveDateTime) -> Result<()> {
        self.state.accounts.get(account)?;
        if user.trim().is_empty() {
            return Err(EmulatorError::InvalidUsage("user must not be empty".to_string()));
        }
        if self.strict_users && !self.state.accounts.is_associated(user, account) {
            self.state.accounts.user(user)?;
            return Err(EmulatorError::UserNotFound(format!(
                "{} is not associated with account {}",
                user, account
            )));
        }
        crate::ledger::UsageLedger::validate_amount(amount)?;
        self.state.clock.check_instant(at)
    }

    /// Record usage at `at`, or at the current simulated time
    pub fn inject(
        &mut self,
        account: &str,
        user: &str,
        amount: f64,
        at: Option<NaiveDateTime>,
    ) -> Result<UsageRecord> {
        let at = at.unwrap_or_else(|| self.now());
        self.check_usage(account, user, amount, &at)?;

        let record = self.state.ledger.append(PendingUsage {
            account: account.to_string(),
            user: user.to_string(),
            amount_node_hours: amount,
            at,
        })?;
        self.after_append(account, user, std::slice::from_ref(&record))?;

        info!(
            account = %account,
            user = %user,
            amount,
            period = %record.period(),
            "Injected usage"
        );
        Ok(record)
    }

    /// Expand a usage pattern from `start` (default: now) and record it as
    /// one atomic batch
    pub fn inject_pattern(
        &mut self,
        account: &str,
        user: &str,
        pattern: &UsagePattern,
        start: Option<NaiveDateTime>,
    ) -> Result<Vec<UsageRecord>> {
        let start = start.unwrap_or_else(|| self.now());
        let entries = pattern.expand(start)?;
        for (at, amount) in &entries {
            self.check_usage(account, user, *amount, at)?;
        }

        let batch = entries
            .into_iter()
            .map(|(at, amount)| PendingUsage {
                account: account.to_string(),
                user: user.to_string(),
                amount_node_hours: amount,
                at,
            })
            .collect();
        let records = self.state.ledger.append_all(batch)?;
        self.after_append(account, user, &records)?;

        info!(
            account = %account,
            user = %user,
            records = records.len(),
            "Injected usage pattern"
        );
        Ok(records)
    }

    fn after_append(&mut self, account: &str, user: &str, records: &[UsageRecord]) -> Result<()> {
        metrics::USAGE_RECORDS_TOTAL.inc_by(records.len() as u64);
        metrics::USAGE_INJECTED_NODE_HOURS_TOTAL
            .inc_by(records.iter().map(UsageRecord::amount_node_hours).sum());

        if !self.strict_users {
            self.state.accounts.add_user(user, account)?;
        }

        // Usage landing in an already closed period changes its carryover
        let current = self.period_key();
        if records.iter().any(|r| r.period() < current) {
            debug!(account = %account, "Backdated usage, rebuilding allocation");
            let ledger = &self.state.ledger;
            let target = self.state.accounts.get_mut(account)?;
            self.calculator.rebuild(target, ledger, current);
        }
        Ok(())
    }

    /// Ledger total for an account in a period (default: the active one)
    pub fn usage_total(&self, account: &str, period: Option<PeriodKey>, user: Option<&str>) -> f64 {
        let period = period.unwrap_or_else(|| self.period_key());
        self.state.ledger.total_for(account, period, user)
    }

    pub fn usage_summary(&self, account: &str) -> Result<UsageSummary> {
        let acct = self.state.accounts.get(account)?;
        let period = self.period_key();
        let current_usage = self.state.ledger.total_for(account, period, None);
        let total_allocation = acct.total_allocation();
        let percentage_used = if total_allocation > 0.0 {
            current_usage / total_allocation * 100.0
        } else {
            0.0
        };

        Ok(UsageSummary {
            account: account.to_string(),
            period_key: period,
            current_usage,
            lifetime_usage: self.state.ledger.lifetime_total(account),
            total_allocation,
            remaining: (total_allocation - current_usage).max(0.0),
            percentage_used,
        })
    }

    // ------------------------------------------------------------------
    // Allocation and QoS
    // ------------------------------------------------------------------

    /// Period result for an account (default: the active period)
    pub fn evaluate(&self, account: &str, period: Option<PeriodKey>) -> Result<PeriodResult> {
        let period = period.unwrap_or_else(|| self.period_key());
        self.calculator
            .evaluate(&self.state.accounts, &self.state.ledger, account, period)
    }

    /// Recommendation for the active period; never mutates
    pub fn check_qos(&self, account: &str) -> Result<QosCheck> {
        let result = self.evaluate(account, None)?;
        Ok(self.qos.check(self.state.accounts.get(account)?, &result))
    }

    /// Administrative override
    pub fn apply_qos(&mut self, account: &str, state: QosState) -> Result<QosTransition> {
        self.apply(account, state, TransitionOrigin::Administrative)
    }

    /// Check and apply the recommendation in one step
    pub fn apply_recommended(&mut self, account: &str) -> Result<QosTransition> {
        let check = self.check_qos(account)?;
        self.apply(account, check.recommended, TransitionOrigin::Recommendation)
    }

    /// Return an account to NORMAL at the start of a new period
    pub fn reset_for_new_period(&mut self, account: &str) -> Result<QosTransition> {
        self.apply(account, QosState::Normal, TransitionOrigin::Administrative)
    }

    fn apply(&mut self, account: &str, to: QosState, origin: TransitionOrigin) -> Result<QosTransition> {
        let at = self.now();
        let target = self.state.accounts.get_mut(account)?;
        let transition = self.qos.apply(target, to, origin, at);

        if transition.kind != TransitionKind::Unchanged {
            metrics::QOS_TRANSITIONS_TOTAL
                .with_label_values(&[transition.from.as_str(), transition.to.as_str()])
                .inc();
            info!(
                account = %account,
                from = %transition.from,
                to = %transition.to,
                origin = ?origin,
                "Applied QoS transition"
            );
        }
        Ok(transition)
    }

    /// Projected QoS at a usage level, without mutation
    pub fn simulate_impact(&self, account: &str, projected_usage: f64) -> Result<QosImpact> {
        crate::ledger::UsageLedger::validate_amount(projected_usage)?;
        let result = self.evaluate(account, None)?;
        let acct = self.state.accounts.get(account)?;
        Ok(self.qos.simulate_impact(
            acct,
            &result,
            projected_usage,
            self.state.accounts.users_of(account),
        ))
    }

    pub fn qos_report(&self) -> QosReport {
        let period = self.period_key();
        let entries = self.state.accounts.list().into_iter().map(|acct| {
            (
                acct.qos_state(),
                acct.name.clone(),
                self.state.ledger.total_for(&acct.name, period, None),
            )
        });
        self.qos.report(self.now(), period, entries)
    }

    // ------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------

    pub fn checkpoint(&mut self, name: &str) -> Result<CheckpointInfo> {
        let info = self.checkpoints.create(name, &self.state)?;
        metrics::CHECKPOINTS_CREATED_TOTAL.inc();
        info!(checkpoint = %name, simulated_time = %info.simulated_time, "Created checkpoint");
        Ok(info)
    }

    /// Replace the live state with a checkpoint's copy
    pub fn restore(&mut self, name: &str) -> Result<CheckpointInfo> {
        let state = self.checkpoints.restore(name)?;
        self.state = state;
        self.rebuild_all();
        metrics::CHECKPOINT_RESTORES_TOTAL.inc();
        metrics::ACCOUNTS_ACTIVE.set(self.state.accounts.len() as i64);

        let info = self.checkpoints.get(name)?.info();
        info!(checkpoint = %name, simulated_time = %info.simulated_time, "Restored checkpoint");
        Ok(info)
    }

    pub fn list_checkpoints(&self) -> Vec<CheckpointInfo> {
        self.checkpoints.list()
    }

    pub fn delete_checkpoint(&mut self, name: &str) -> Result<CheckpointInfo> {
        let info = self.checkpoints.delete(name)?;
        info!(checkpoint = %name, "Deleted checkpoint");
        Ok(info)
    }
}

/// Shared, concurrently accessible engine handle
#[derive(Debug, Clone)]
pub struct Emulator {
    engine: Arc<RwLock<Engine>>,
}

impl Emulator {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine: Arc::new(RwLock::new(engine)),
        }
    }

    /// Fresh emulator from configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(Engine::new(config)?))
    }

    pub async fn now(&self) -> NaiveDateTime {
        self.engine.read().await.now()
    }

    pub async fn period_key(&self) -> PeriodKey {
        self.engine.read().await.period_key()
    }

    pub async fn advance(&self, amount: u32, unit: TimeUnit) -> Result<Vec<PeriodTransition>> {
        self.engine.write().await.advance(amount, unit)
    }

    pub async fn set_time(&self, instant: NaiveDateTime) -> Result<Vec<PeriodTransition>> {
        self.engine.write().await.set_time(instant)
    }

    pub async fn create_account(&self, spec: AccountSpec) -> Result<Account> {
        self.engine.write().await.create_account(spec)
    }

    pub async fn get_account(&self, name: &str) -> Result<Account> {
        self.engine.read().await.get_account(name).cloned()
    }

    pub async fn list_accounts(&self) -> Vec<Account> {
        self.engine
            .read()
            .await
            .list_accounts()
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn update_account(&self, name: &str, update: AccountUpdate) -> Result<Account> {
        self.engine.write().await.update_account(name, &update)
    }

    pub async fn delete_account(&self, name: &str) -> Result<Account> {
        self.engine.write().await.delete_account(name)
    }

    pub async fn inject(
        &self,
        account: &str,
        user: &str,
        amount: f64,
        at: Option<NaiveDateTime>,
    ) -> Result<UsageRecord> {
        self.engine.write().await.inject(account, user, amount, at)
    }

    pub async fn usage_total(&self, account: &str, period: Option<PeriodKey>, user: Option<&str>) -> f64 {
        self.engine.read().await.usage_total(account, period, user)
    }

    pub async fn usage_summary(&self, account: &str) -> Result<UsageSummary> {
        self.engine.read().await.usage_summary(account)
    }

    pub async fn evaluate(&self, account: &str, period: Option<PeriodKey>) -> Result<PeriodResult> {
        self.engine.read().await.evaluate(account, period)
    }

    pub async fn check_qos(&self, account: &str) -> Result<QosCheck> {
        self.engine.read().await.check_qos(account)
    }

    pub async fn apply_qos(&self, account: &str, state: QosState) -> Result<QosTransition> {
        self.engine.write().await.apply_qos(account, state)
    }

    pub async fn apply_recommended(&self, account: &str) -> Result<QosTransition> {
        self.engine.write().await.apply_recommended(account)
    }

    pub async fn checkpoint(&self, name: &str) -> Result<CheckpointInfo> {
        self.engine.write().await.checkpoint(name)
    }

    pub async fn restore(&self, name: &str) -> Result<CheckpointInfo> {
        self.engine.write().await.restore(name)
    }

    pub async fn qos_report(&self) -> QosReport {
        self.engine.read().await.qos_report()
    }

    pub async fn list_checkpoints(&self) -> Vec<CheckpointInfo> {
        self.engine.read().await.list_checkpoints()
    }

    pub async fn delete_checkpoint(&self, name: &str) -> Result<CheckpointInfo> {
        self.engine.write().await.delete_checkpoint(name)
    }

    /// Run a scenario under one write guard, so no other caller observes
    /// its intermediate states
    pub async fn run_scenario(
        &self,
        scenario: &Scenario,
    ) -> std::result::Result<ScenarioReport, ScenarioError> {
        scenario.run(&mut *self.engine.write().await)
    }

    /// Live state and checkpoints, captured under one read guard
    pub async fn persisted(&self) -> PersistedEngine {
        self.engine.read().await.persisted()
    }
}

#[cfg(test)]
mod proptests;

//! Account and User Registry
//!
//! Accounts carry an allocation policy (base allocation, grace fraction,
//! decay half-life, optional hard limit) plus the state the calculator and
//! the QoS state machine maintain for the active period. Users reference
//! accounts by name; an account never owns a user's identity.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::clock::PeriodKey;
use crate::config::LimitsConfig;
use crate::error::{EmulatorError, Result};
use crate::limits::calculator::RolloverStep;
use crate::limits::qos::QosState;

/// Organization tag used when none is given
pub const DEFAULT_ORGANIZATION: &str = "emulator";

/// Request to create an account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_organization")]
    pub organization: String,
    #[serde(default)]
    pub parent: Option<String>,
    /// Node-hours granted per period
    pub base_allocation: f64,
    #[serde(default)]
    pub grace_fraction: Option<f64>,
    #[serde(default)]
    pub half_life_days: Option<f64>,
    /// Absolute node-hour cap for the BLOCKED state
    #[serde(default)]
    pub hard_limit: Option<f64>,
}

fn default_organization() -> String {
    DEFAULT_ORGANIZATION.to_string()
}

impl AccountSpec {
    pub fn new(name: &str, description: &str, base_allocation: f64) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            organization: default_organization(),
            parent: None,
            base_allocation,
            grace_fraction: None,
            half_life_days: None,
            hard_limit: None,
        }
    }

    pub fn with_grace_fraction(mut self, grace_fraction: f64) -> Self {
        self.grace_fraction = Some(grace_fraction);
        self
    }

    pub fn with_half_life_days(mut self, half_life_days: f64) -> Self {
        self.half_life_days = Some(half_life_days);
        self
    }

    pub fn with_hard_limit(mut self, hard_limit: f64) -> Self {
        self.hard_limit = Some(hard_limit);
        self
    }

    pub fn with_parent(mut self, parent: &str) -> Self {
        self.parent = Some(parent.to_string());
        self
    }

    pub fn with_organization(mut self, organization: &str) -> Self {
        self.organization = organization.to_string();
        self
    }
}

/// Partial modification of an existing account
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountUpdate {
    pub description: Option<String>,
    pub base_allocation: Option<f64>,
    pub grace_fraction: Option<f64>,
    pub half_life_days: Option<f64>,
    /// `Some(None)` clears the hard limit
    pub hard_limit: Option<Option<f64>>,
    /// `Some(None)` detaches the account from its parent
    pub parent: Option<Option<String>>,
}

/// Check an allocation policy, rejecting rather than clamping bad values
pub fn validate_policy(
    base_allocation: f64,
    grace_fraction: f64,
    half_life_days: f64,
    hard_limit: Option<f64>,
) -> Result<()> {
    if !base_allocation.is_finite() || base_allocation < 0.0 {
        return Err(EmulatorError::InvalidConfiguration(format!(
            "base allocation must be a finite non-negative number, got {}",
            base_allocation
        )));
    }
    if !grace_fraction.is_finite() || grace_fraction < 0.0 {
        return Err(EmulatorError::InvalidConfiguration(format!(
            "grace fraction must be a finite non-negative number, got {}",
            grace_fraction
        )));
    }
    if !half_life_days.is_finite() || half_life_days <= 0.0 {
        return Err(EmulatorError::InvalidConfiguration(format!(
            "half-life must be a finite positive number of days, got {}",
            half_life_days
        )));
    }
    if let Some(limit) = hard_limit {
        if !limit.is_finite() || limit <= 0.0 {
            return Err(EmulatorError::InvalidConfiguration(format!(
                "hard limit must be a finite positive number, got {}",
                limit
            )));
        }
    }
    Ok(())
}

/// Account record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub name: String,
    pub description: String,
    pub organization: String,
    pub parent: Option<String>,
    pub base_allocation: f64,
    pub grace_fraction: f64,
    pub half_life_days: f64,
    pub hard_limit: Option<f64>,

    /// Allocation for `last_evaluated_period`
    pub(crate) total_allocation: f64,
    pub(crate) qos_state: QosState,
    pub(crate) created_period: PeriodKey,
    pub(crate) last_evaluated_period: PeriodKey,
    pub(crate) rollover_history: BTreeMap<PeriodKey, RolloverStep>,
}

impl Account {
    /// Build an account opened in `period`, filling unset policy from defaults
    pub fn from_spec(spec: AccountSpec, defaults: &LimitsConfig, period: PeriodKey) -> Result<Self> {
        if spec.name.trim().is_empty() {
            return Err(EmulatorError::InvalidConfiguration(
                "account name must not be empty".to_string(),
            ));
        }

        let grace_fraction = spec.grace_fraction.unwrap_or(defaults.default_grace_fraction);
        let half_life_days = spec.half_life_days.unwrap_or(defaults.default_half_life_days);
        let hard_limit = spec.hard_limit.or(defaults.default_hard_limit);
        validate_policy(spec.base_allocation, grace_fraction, half_life_days, hard_limit)?;

        Ok(Self {
            name: spec.name,
            description: spec.description,
            organization: spec.organization,
            parent: spec.parent,
            base_allocation: spec.base_allocation,
            grace_fraction,
            half_life_days,
            hard_limit,
            total_allocation: spec.base_allocation,
            qos_state: QosState::Normal,
            created_period: period,
            last_evaluated_period: period,
            rollover_history: BTreeMap::new(),
        })
    }

    pub fn total_allocation(&self) -> f64 {
        self.total_allocation
    }

    pub fn qos_state(&self) -> QosState {
        self.qos_state
    }

    pub fn created_period(&self) -> PeriodKey {
        self.created_period
    }

    pub fn last_evaluated_period(&self) -> PeriodKey {
        self.last_evaluated_period
    }

    /// Rollover applied when entering `period`, if the account was rolled into it
    pub fn rollover_into(&self, period: PeriodKey) -> Option<&RolloverStep> {
        self.rollover_history.get(&period)
    }

    pub fn rollover_history(&self) -> impl Iterator<Item = &RolloverStep> {
        self.rollover_history.values()
    }

    /// Apply an update to a copy, validating the result before returning it
    pub(crate) fn updated(&self, update: &AccountUpdate) -> Result<Self> {
        let mut next = self.clone();
        if let Some(description) = &update.description {
            next.description = description.clone();
        }
        if let Some(base) = update.base_allocation {
            next.base_allocation = base;
        }
        if let Some(grace) = update.grace_fraction {
            next.grace_fraction = grace;
        }
        if let Some(half_life) = update.half_life_days {
            next.half_life_days = half_life;
        }
        if let Some(hard_limit) = update.hard_limit {
            next.hard_limit = hard_limit;
        }
        if let Some(parent) = &update.parent {
            next.parent = parent.clone();
        }
        validate_policy(
            next.base_allocation,
            next.grace_fraction,
            next.half_life_days,
            next.hard_limit,
        )?;
        Ok(next)
    }
}

/// User record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    pub default_account: String,
    /// Accounts this user may charge usage to
    pub accounts: BTreeSet<String>,
}

/// Registry of accounts and users
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountStore {
    accounts: BTreeMap<String, Account>,
    users: BTreeMap<String, User>,
}

impl AccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new account
    pub fn insert(&mut self, account: Account) -> Result<&Account> {
        if self.accounts.contains_key(&account.name) {
            return Err(EmulatorError::AccountExists(account.name));
        }
        if let Some(parent) = &account.parent {
            if !self.accounts.contains_key(parent) {
                return Err(EmulatorError::AccountNotFound(parent.clone()));
            }
        }
        let name = account.name.clone();
        Ok(self.accounts.entry(name).or_insert(account))
    }

    pub fn get(&self, name: &str) -> Result<&Account> {
        self.accounts
            .get(name)
            .ok_or_else(|| EmulatorError::AccountNotFound(name.to_string()))
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> Result<&mut Account> {
        self.accounts
            .get_mut(name)
            .ok_or_else(|| EmulatorError::AccountNotFound(name.to_string()))
    }

    pub(crate) fn replace(&mut self, account: Account) -> Result<()> {
        if let Some(parent) = &account.parent {
            if parent == &account.name || !self.accounts.contains_key(parent) {
                return Err(EmulatorError::AccountNotFound(parent.clone()));
            }
        }
        let slot = self.get_mut(&account.name)?;
        *slot = account;
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.accounts.contains_key(name)
    }

    /// All accounts in name order
    pub fn list(&self) -> Vec<&Account> {
        self.accounts.values().collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.accounts.keys().cloned().collect()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Account> {
        self.accounts.values_mut()
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Remove an account and its user associations.
    ///
    /// Accounts with children cannot be removed; usage records are kept.
    pub fn remove(&mut self, name: &str) -> Result<Account> {
        self.get(name)?;
        if let Some(child) = self
            .accounts
            .values()
            .find(|a| a.parent.as_deref() == Some(name))
        {
            return Err(EmulatorError::InvalidConfiguration(format!(
                "account {} still has child account {}",
                name, child.name
            )));
        }

        for user in self.users.values_mut() {
            user.accounts.remove(name);
            if user.default_account == name {
                user.default_account = user.accounts.iter().next().cloned().unwrap_or_default();
            }
        }
        self.accounts
            .remove(name)
            .ok_or_else(|| EmulatorError::AccountNotFound(name.to_string()))
    }

    /// Accounts sharing `name`'s parent, including `name` itself
    pub fn siblings(&self, name: &str) -> Result<Vec<&Account>> {
        let parent = self.get(name)?.parent.clone();
        Ok(self
            .accounts
            .values()
            .filter(|a| a.parent == parent)
            .collect())
    }

    /// Register a user (if new) and associate it with an account
    pub fn add_user(&mut self, user: &str, account: &str) -> Result<&User> {
        self.get(account)?;
        if user.trim().is_empty() {
            return Err(EmulatorError::InvalidConfiguration(
                "user name must not be empty".to_string(),
            ));
        }

        let entry = self.users.entry(user.to_string()).or_insert_with(|| User {
            name: user.to_string(),
            default_account: account.to_string(),
            accounts: BTreeSet::new(),
        });
        entry.accounts.insert(account.to_string());
        if entry.default_account.is_empty() {
            entry.default_account = account.to_string();
        }
        Ok(entry)
    }

    pub fn user(&self, name: &str) -> Result<&User> {
        self.users
            .get(name)
            .ok_or_else(|| EmulatorError::UserNotFound(name.to_string()))
    }

    pub fn is_associated(&self, user: &str, account: &str) -> bool {
        self.users
            .get(user)
            .map_or(false, |u| u.accounts.contains(account))
    }

    /// Users associated with an account
    pub fn users_of(&self, account: &str) -> Vec<String> {
        self.users
            .values()
            .filter(|u| u.accounts.contains(account))
            .map(|u| u.name.clone())
            .collect()
    }

    pub fn users(&self) -> Vec<&User> {
        self.users.values().collect()
    }
}

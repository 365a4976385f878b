// Engine State and Checkpoints
//
// The live state is the clock, the account registry and the usage ledger.
// A checkpoint is an immutable, named copy of that state. Restoring a
// checkpoint replaces the live state by value and never touches other
// checkpoints.
//
// Snapshot layout:
// - `EngineState`: what a checkpoint captures
// - `CheckpointStore`: named checkpoints, independent of each other
// - `PersistedEngine`: live state plus every checkpoint, as one JSON document

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::accounts::AccountStore;
use crate::clock::{PeriodKey, VirtualClock};
use crate::error::{EmulatorError, Result};
use crate::ledger::UsageLedger;

/// Snapshot format version
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Everything a checkpoint captures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineState {
    pub clock: VirtualClock,
    pub accounts: AccountStore,
    pub ledger: UsageLedger,
}

impl EngineState {
    pub fn new(clock: VirtualClock) -> Self {
        Self {
            clock,
            accounts: AccountStore::new(),
            ledger: UsageLedger::new(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Named point-in-time copy of the engine state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub name: String,

    /// Wall-clock time the checkpoint was taken
    pub created_at: DateTime<Utc>,

    state: EngineState,
}

impl Checkpoint {
    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn info(&self) -> CheckpointInfo {
        CheckpointInfo {
            name: self.name.clone(),
            simulated_time: self.state.clock.now(),
            period_key: self.state.clock.period_key(),
            created_at: self.created_at,
            accounts: self.state.accounts.len(),
            usage_records: self.state.ledger.len(),
        }
    }
}

/// Checkpoint listing entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointInfo {
    pub name: String,
    pub simulated_time: NaiveDateTime,
    pub period_key: PeriodKey,
    pub created_at: DateTime<Utc>,
    pub accounts: usize,
    pub usage_records: usize,
}

/// Named checkpoints
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointStore {
    checkpoints: BTreeMap<String, Checkpoint>,
}

impl CheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy `state` under `name`. Names are never overwritten.
    pub fn create(&mut self, name: &str, state: &EngineState) -> Result<CheckpointInfo> {
        if name.trim().is_empty() {
            return Err(EmulatorError::InvalidConfiguration(
                "checkpoint name must not be empty".to_string(),
            ));
        }
        if self.checkpoints.contains_key(name) {
            return Err(EmulatorError::DuplicateCheckpoint(name.to_string()));
        }

        let checkpoint = Checkpoint {
            name: name.to_string(),
            created_at: Utc::now(),
            state: state.clone(),
        };
        let info = checkpoint.info();
        self.checkpoints.insert(name.to_string(), checkpoint);
        Ok(info)
    }

    pub fn get(&self, name: &str) -> Result<&Checkpoint> {
        self.checkpoints
            .get(name)
            .ok_or_else(|| EmulatorError::CheckpointNotFound(name.to_string()))
    }

    /// Fresh copy of a checkpoint's state, for installing as the live state
    pub fn restore(&self, name: &str) -> Result<EngineState> {
        self.get(name).map(|checkpoint| checkpoint.state.clone())
    }

    /// Checkpoints in name order
    pub fn list(&self) -> Vec<CheckpointInfo> {
        self.checkpoints.values().map(Checkpoint::info).collect()
    }

    pub fn delete(&mut self, name: &str) -> Result<CheckpointInfo> {
        self.checkpoints
            .remove(name)
            .map(|checkpoint| checkpoint.info())
            .ok_or_else(|| EmulatorError::CheckpointNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.checkpoints.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }
}

/// Live state and checkpoints, for process-restart continuity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedEngine {
    pub version: u32,
    pub live: EngineState,
    pub checkpoints: CheckpointStore,
}

impl PersistedEngine {
    pub fn new(live: EngineState, checkpoints: CheckpointStore) -> Self {
        Self {
            version: SNAPSHOT_FORMAT_VERSION,
            live,
            checkpoints,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let persisted: Self = serde_json::from_str(json)?;
        if persisted.version != SNAPSHOT_FORMAT_VERSION {
            return Err(EmulatorError::InvalidConfiguration(format!(
                "unsupported snapshot version {} (expected {})",
                persisted.version, SNAPSHOT_FORMAT_VERSION
            )));
        }
        Ok(persisted)
    }
}

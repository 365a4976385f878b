//! Scenario Runner
//!
//! A scenario is an ordered list of engine operations loaded from TOML or
//! JSON. Steps run in order against one engine; the first failing step
//! aborts the run and is reported with its index.
//!
//! ```toml
//! name = "q1-to-q2"
//!
//! [[steps]]
//! action = "create_account"
//! account = { name = "physics", base_allocation = 1000.0 }
//!
//! [[steps]]
//! action = "inject"
//! account = "physics"
//! user = "alice"
//! amount = 2000.0
//!
//! [[steps]]
//! action = "advance"
//! amount = 3
//! unit = "months"
//! ```

use anyhow::Context;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::accounts::{Account, AccountSpec};
use crate::clock::{parse_instant, PeriodKey, PeriodTransition, TimeUnit};
use crate::engine::Engine;
use crate::error::EmulatorError;
use crate::ledger::{UsagePattern, UsageRecord};
use crate::limits::calculator::PeriodResult;
use crate::limits::qos::{QosCheck, QosState, QosTransition};
use crate::state::CheckpointInfo;

/// Error types for scenario runs
#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    /// Scenario document could not be parsed
    #[error("Failed to parse scenario: {0}")]
    Parse(String),

    /// Engine rejected a step
    #[error("Step {index} ({action}) failed: {source}")]
    Step {
        index: usize,
        action: &'static str,
        #[source]
        source: EmulatorError,
    },

    /// Step ran but its result differed from the expectation
    #[error("Step {index} ({action}) expectation failed: {message}")]
    Expectation {
        index: usize,
        action: &'static str,
        message: String,
    },
}

impl ScenarioError {
    /// Index of the failing step, if a step failed
    pub fn step_index(&self) -> Option<usize> {
        match self {
            ScenarioError::Parse(_) => None,
            ScenarioError::Step { index, .. } | ScenarioError::Expectation { index, .. } => {
                Some(*index)
            }
        }
    }
}

/// One scenario operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ScenarioStep {
    CreateAccount {
        account: AccountSpec,
    },
    Advance {
        amount: u32,
        unit: TimeUnit,
    },
    SetTime {
        time: String,
    },
    Inject {
        account: String,
        user: String,
        amount: f64,
        #[serde(default)]
        at: Option<String>,
    },
    InjectPattern {
        account: String,
        user: String,
        pattern: UsagePattern,
        #[serde(default)]
        start: Option<String>,
    },
    /// Read-only QoS check, optionally asserting the recommendation
    Check {
        account: String,
        #[serde(default)]
        expect: Option<QosState>,
    },
    ApplyRecommended {
        account: String,
    },
    ApplyQos {
        account: String,
        state: QosState,
    },
    Evaluate {
        account: String,
        #[serde(default)]
        period: Option<String>,
    },
    Checkpoint {
        name: String,
    },
    Restore {
        name: String,
    },
}

impl ScenarioStep {
    pub fn action(&self) -> &'static str {
        match self {
            ScenarioStep::CreateAccount { .. } => "create_account",
            ScenarioStep::Advance { .. } => "advance",
            ScenarioStep::SetTime { .. } => "set_time",
            ScenarioStep::Inject { .. } => "inject",
            ScenarioStep::InjectPattern { .. } => "inject_pattern",
            ScenarioStep::Check { .. } => "check",
            ScenarioStep::ApplyRecommended { .. } => "apply_recommended",
            ScenarioStep::ApplyQos { .. } => "apply_qos",
            ScenarioStep::Evaluate { .. } => "evaluate",
            ScenarioStep::Checkpoint { .. } => "checkpoint",
            ScenarioStep::Restore { .. } => "restore",
        }
    }
}

/// Result of a single step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    AccountCreated { account: Account },
    TimeChanged { now: NaiveDateTime, transitions: Vec<PeriodTransition> },
    UsageRecorded { records: Vec<UsageRecord> },
    Checked { check: QosCheck },
    Applied { transition: QosTransition },
    Evaluated { result: PeriodResult },
    CheckpointCreated { checkpoint: CheckpointInfo },
    Restored { checkpoint: CheckpointInfo },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub index: usize,
    pub action: String,
    #[serde(flatten)]
    pub outcome: StepOutcome,
}

/// Outcome of a complete run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub name: String,
    pub steps: Vec<StepReport>,
    pub final_time: NaiveDateTime,
    pub final_period: PeriodKey,
}

/// Ordered list of steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<ScenarioStep>,
}

impl Scenario {
    pub fn from_toml_str(content: &str) -> Result<Self, ScenarioError> {
        toml::from_str(content).map_err(|e| ScenarioError::Parse(e.to_string()))
    }

    pub fn from_json_str(content: &str) -> Result<Self, ScenarioError> {
        serde_json::from_str(content).map_err(|e| ScenarioError::Parse(e.to_string()))
    }

    /// Load from a file; `.json` files are parsed as JSON, anything else as TOML
    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario file {:?}", path))?;

        let is_json = path
            .extension()
            .map_or(false, |ext| ext.eq_ignore_ascii_case("json"));
        let scenario = if is_json {
            Self::from_json_str(&content)
        } else {
            Self::from_toml_str(&content)
        };
        scenario.with_context(|| format!("Failed to load scenario from {:?}", path))
    }

    /// Run every step against `engine`, stopping at the first failure
    pub fn run(&self, engine: &mut Engine) -> Result<ScenarioReport, ScenarioError> {
        tracing::info!(scenario = %self.name, steps = self.steps.len(), "Running scenario");

        let mut reports = Vec::with_capacity(self.steps.len());
        for (index, step) in self.steps.iter().enumerate() {
            let action = step.action();
            let outcome = run_step(engine, step).map_err(|source| ScenarioError::Step {
                index,
                action,
                source,
            })?;

            if let (ScenarioStep::Check { expect: Some(expected), .. }, StepOutcome::Checked { check }) =
                (step, &outcome)
            {
                if check.recommended != *expected {
                    return Err(ScenarioError::Expectation {
                        index,
                        action,
                        message: format!(
                            "expected {} for {}, got {}",
                            expected, check.account, check.recommended
                        ),
                    });
                }
            }

            tracing::debug!(index, action, "Scenario step completed");
            reports.push(StepReport {
                index,
                action: action.to_string(),
                outcome,
            });
        }

        Ok(ScenarioReport {
            name: self.name.clone(),
            steps: reports,
            final_time: engine.now(),
            final_period: engine.period_key(),
        })
    }
}

fn optional_instant(value: &Option<String>) -> crate::error::Result<Option<NaiveDateTime>> {
    value.as_deref().map(parse_instant).transpose()
}

fn run_step(engine: &mut Engine, step: &ScenarioStep) -> crate::error::Result<StepOutcome> {
    Ok(match step {
        ScenarioStep::CreateAccount { account } => StepOutcome::AccountCreated {
            account: engine.create_account(account.clone())?,
        },
        ScenarioStep::Advance { amount, unit } => {
            let transitions = engine.advance(*amount, *unit)?;
            StepOutcome::TimeChanged {
                now: engine.now(),
                transitions,
            }
        }
        ScenarioStep::SetTime { time } => {
            let transitions = engine.set_time_str(time)?;
            StepOutcome::TimeChanged {
                now: engine.now(),
                transitions,
            }
        }
        ScenarioStep::Inject {
            account,
            user,
            amount,
            at,
        } => {
            let at = optional_instant(at)?;
            StepOutcome::UsageRecorded {
                records: vec![engine.inject(account, user, *amount, at)?],
            }
        }
        ScenarioStep::InjectPattern {
            account,
            user,
            pattern,
            start,
        } => {
            let start = optional_instant(start)?;
            StepOutcome::UsageRecorded {
                records: engine.inject_pattern(account, user, pattern, start)?,
            }
        }
        ScenarioStep::Check { account, .. } => StepOutcome::Checked {
            check: engine.check_qos(account)?,
        },
        ScenarioStep::ApplyRecommended { account } => StepOutcome::Applied {
            transition: engine.apply_recommended(account)?,
        },
        ScenarioStep::ApplyQos { account, state } => StepOutcome::Applied {
            transition: engine.apply_qos(account, *state)?,
        },
        ScenarioStep::Evaluate { account, period } => {
            let period = period.as_deref().map(str::parse::<PeriodKey>).transpose()?;
            StepOutcome::Evaluated {
                result: engine.evaluate(account, period)?,
            }
        }
        ScenarioStep::Checkpoint { name } => StepOutcome::CheckpointCreated {
            checkpoint: engine.checkpoint(name)?,
        },
        ScenarioStep::Restore { name } => StepOutcome::Restored {
            checkpoint: engine.restore(name)?,
        },
    })
}

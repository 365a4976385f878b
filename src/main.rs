// SLURM Emulator - Main Entry Point
//
// Thin CLI over the policy engine:
// - Loads configuration (TOML + env overrides)
// - Resumes the engine from a JSON state file, if one exists
// - Runs one command and prints its result as JSON on stdout
// - Saves the state file again after mutating commands

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use slurm_emulator::accounts::AccountSpec;
use slurm_emulator::clock::{parse_instant, PeriodKey, TimeUnit};
use slurm_emulator::config::Config;
use slurm_emulator::limits::qos::QosState;
use slurm_emulator::scenario::Scenario;
use slurm_emulator::state::PersistedEngine;
use slurm_emulator::{logging, metrics, Emulator, Engine};

/// SLURM Emulator: periodic-limits policy engine
#[derive(Parser, Debug)]
#[command(name = "slurm-emulator")]
#[command(author = "SLURM Emulator Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Emulates a batch scheduler's decay, carryover and QoS limits", long_about = None)]
struct Args {
    /// Configuration file (default: ~/.config/slurm-emulator/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Engine state file (default: engine.state_file from the configuration)
    #[arg(long, global = true)]
    state: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Inspect or move the simulated clock
    Time {
        #[command(subcommand)]
        action: TimeCommand,
    },
    /// Manage accounts
    Account {
        #[command(subcommand)]
        action: AccountCommand,
    },
    /// Record or query usage
    Usage {
        #[command(subcommand)]
        action: UsageCommand,
    },
    /// Allocation, thresholds and fairshare for an account
    Evaluate {
        account: String,

        /// Period key such as 2024-Q2 (default: the active period)
        #[arg(long)]
        period: Option<PeriodKey>,
    },
    /// Check or change QoS state
    Qos {
        #[command(subcommand)]
        action: QosCommand,
    },
    /// Manage named checkpoints of the engine state
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointCommand,
    },
    /// Run a TOML or JSON scenario file
    Scenario {
        file: PathBuf,

        /// Print Prometheus metrics after the run
        #[arg(long)]
        metrics: bool,

        /// Save the resulting state to the state file
        #[arg(long)]
        persist: bool,
    },
}

#[derive(Subcommand, Debug)]
enum TimeCommand {
    /// Current simulated time and period
    Show,
    /// Advance by AMOUNT days, months or quarters
    Advance { amount: u32, unit: TimeUnit },
    /// Jump to an absolute instant (YYYY-MM-DD or YYYY-MM-DDTHH:MM:SS)
    Set { instant: String },
}

#[derive(Subcommand, Debug)]
enum AccountCommand {
    Create {
        name: String,

        /// Base allocation in node-hours per period
        #[arg(long)]
        allocation: f64,

        #[arg(long, default_value = "")]
        description: String,

        #[arg(long)]
        organization: Option<String>,

        #[arg(long)]
        parent: Option<String>,

        #[arg(long)]
        grace_fraction: Option<f64>,

        #[arg(long)]
        half_life_days: Option<f64>,

        /// Hard limit in node-hours
        #[arg(long)]
        hard_limit: Option<f64>,
    },
    Show {
        name: String,
    },
    List,
    Delete {
        name: String,
    },
}

#[derive(Subcommand, Debug)]
enum UsageCommand {
    /// Record node-hours for ACCOUNT and USER
    Inject {
        account: String,
        user: String,
        #[arg(allow_negative_numbers = true)]
        amount: f64,

        /// Timestamp of the usage (default: now)
        #[arg(long)]
        at: Option<String>,
    },
    /// Total usage of ACCOUNT in a period
    Total {
        account: String,

        #[arg(long)]
        period: Option<PeriodKey>,

        #[arg(long)]
        user: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum QosCommand {
    /// Report the recommended state without changing it
    Check { account: String },
    /// Set the QoS state administratively
    Apply { account: String, state: QosState },
    /// Check and apply the recommendation
    ApplyRecommended { account: String },
    /// QoS state of every account
    Report,
}

#[derive(Subcommand, Debug)]
enum CheckpointCommand {
    Create { name: String },
    Restore { name: String },
    List,
    Delete { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    logging::init(&config.logging, args.verbose)?;
    metrics::init().context("Failed to register metrics")?;

    let state_path = args
        .state
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.engine.state_file));
    let emulator = Emulator::new(load_engine(&config, &state_path)?);

    let (output, mutated) = run_command(&emulator, args.command).await?;

    if mutated {
        save_engine(&emulator, &state_path).await?;
    }
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Resume from the state file, or start fresh when there is none
fn load_engine(config: &Config, path: &Path) -> Result<Engine> {
    if !path.exists() {
        debug!("State file {:?} not found, starting a fresh engine", path);
        return Ok(Engine::new(config)?);
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read state file {:?}", path))?;
    let persisted = PersistedEngine::from_json(&content)
        .with_context(|| format!("Failed to parse state file {:?}", path))?;
    debug!("Loaded engine state from {:?}", path);
    Ok(Engine::from_persisted(config, persisted)?)
}

/// Write the state file via a temporary file so a crash never leaves it
/// half-written
async fn save_engine(emulator: &Emulator, path: &Path) -> Result<()> {
    let json = emulator.persisted().await.to_json()?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).with_context(|| format!("Failed to write state file {:?}", tmp))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to replace state file {:?}", path))?;
    debug!("Saved engine state to {:?}", path);
    Ok(())
}

/// Execute one command, returning its JSON output and whether it mutated state
async fn run_command(emulator: &Emulator, command: Commands) -> Result<(Value, bool)> {
    let result = match command {
        Commands::Time { action } => match action {
            TimeCommand::Show => (
                json!({ "now": emulator.now().await, "period_key": emulator.period_key().await }),
                false,
            ),
            TimeCommand::Advance { amount, unit } => {
                let transitions = emulator.advance(amount, unit).await?;
                (
                    json!({
                        "now": emulator.now().await,
                        "period_key": emulator.period_key().await,
                        "transitions": transitions,
                    }),
                    true,
                )
            }
            TimeCommand::Set { instant } => {
                let transitions = emulator.set_time(parse_instant(&instant)?).await?;
                (
                    json!({
                        "now": emulator.now().await,
                        "period_key": emulator.period_key().await,
                        "transitions": transitions,
                    }),
                    true,
                )
            }
        },

        Commands::Account { action } => match action {
            AccountCommand::Create {
                name,
                allocation,
                description,
                organization,
                parent,
                grace_fraction,
                half_life_days,
                hard_limit,
            } => {
                let mut spec = AccountSpec::new(&name, &description, allocation);
                spec.grace_fraction = grace_fraction;
                spec.half_life_days = half_life_days;
                spec.hard_limit = hard_limit;
                spec.parent = parent;
                if let Some(organization) = organization {
                    spec.organization = organization;
                }
                let account = emulator.create_account(spec).await?;
                info!("Created account {}", account.name);
                (serde_json::to_value(account)?, true)
            }
            AccountCommand::Show { name } => {
                let account = emulator.get_account(&name).await?;
                let usage = emulator.usage_summary(&name).await?;
                (json!({ "account": account, "usage": usage }), false)
            }
            AccountCommand::List => (serde_json::to_value(emulator.list_accounts().await)?, false),
            AccountCommand::Delete { name } => {
                let account = emulator.delete_account(&name).await?;
                (json!({ "deleted": account.name }), true)
            }
        },

        Commands::Usage { action } => match action {
            UsageCommand::Inject {
                account,
                user,
                amount,
                at,
            } => {
                let at = at.as_deref().map(parse_instant).transpose()?;
                let record = emulator.inject(&account, &user, amount, at).await?;
                (serde_json::to_value(record)?, true)
            }
            UsageCommand::Total {
                account,
                period,
                user,
            } => {
                let period = match period {
                    Some(period) => period,
                    None => emulator.period_key().await,
                };
                let total = emulator
                    .usage_total(&account, Some(period), user.as_deref())
                    .await;
                (
                    json!({ "account": account, "period_key": period, "user": user, "total": total }),
                    false,
                )
            }
        },

        Commands::Evaluate { account, period } => {
            (serde_json::to_value(emulator.evaluate(&account, period).await?)?, false)
        }

        Commands::Qos { action } => match action {
            QosCommand::Check { account } => {
                (serde_json::to_value(emulator.check_qos(&account).await?)?, false)
            }
            QosCommand::Apply { account, state } => {
                (serde_json::to_value(emulator.apply_qos(&account, state).await?)?, true)
            }
            QosCommand::ApplyRecommended { account } => (
                serde_json::to_value(emulator.apply_recommended(&account).await?)?,
                true,
            ),
            QosCommand::Report => (serde_json::to_value(emulator.qos_report().await)?, false),
        },

        Commands::Checkpoint { action } => match action {
            CheckpointCommand::Create { name } => {
                (serde_json::to_value(emulator.checkpoint(&name).await?)?, true)
            }
            CheckpointCommand::Restore { name } => {
                (serde_json::to_value(emulator.restore(&name).await?)?, true)
            }
            CheckpointCommand::List => {
                (serde_json::to_value(emulator.list_checkpoints().await)?, false)
            }
            CheckpointCommand::Delete { name } => {
                (serde_json::to_value(emulator.delete_checkpoint(&name).await?)?, true)
            }
        },

        Commands::Scenario {
            file,
            metrics: show_metrics,
            persist,
        } => {
            let scenario = Scenario::from_path(&file)?;
            let report = emulator
                .run_scenario(&scenario)
                .await
                .with_context(|| format!("Scenario {:?} failed", file))?;

            let mut output = serde_json::to_value(report)?;
            if show_metrics {
                output["metrics"] = Value::String(metrics::gather_metrics()?);
            }
            (output, persist)
        }
    };

    Ok(result)
}

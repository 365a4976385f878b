//! SLURM Emulator Library
//!
//! Periodic-limits policy engine: a virtual clock with calendar-quarter
//! periods, an append-only usage ledger, decay and carryover allocation
//! arithmetic, a threshold-driven QoS state machine, and named checkpoints
//! of the whole engine state.

pub mod accounts;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod limits;
pub mod logging;
pub mod metrics;
pub mod scenario;
pub mod state;

pub use engine::{Emulator, Engine, UsageSummary};
pub use error::{EmulatorError, Result};

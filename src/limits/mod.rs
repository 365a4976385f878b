//! Periodic allocation limits
//!
//! - `decay`: half-life weighting of past usage
//! - `calculator`: carryover, total allocation and the values derived from it
//! - `fairshare`: allocation to scheduler fairshare mapping
//! - `qos`: threshold-driven QoS state machine
//! - `tres`: node-hour to TRES breakdown and TRES billing

pub mod calculator;
pub mod decay;
pub mod fairshare;
pub mod qos;
pub mod tres;

#[cfg(test)]
mod proptests;

pub use calculator::{Allocation, AllocationCalculator, PeriodResult, RolloverStep};
pub use fairshare::{FairshareFormula, SharePopulation};
pub use qos::{
    QosCheck, QosImpact, QosReport, QosState, QosStateMachine, QosTransition, ThresholdStatus,
    TransitionKind, TransitionOrigin,
};
pub use tres::TresUsage;

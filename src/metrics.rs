// Prometheus metrics for the emulator engine
//
// Counters cover the engine's mutation points:
// - Usage injection (records and node-hours)
// - Period rollovers
// - QoS transitions by source and target state
// - Checkpoint creation and restore
// - Registered accounts (gauge)

use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

lazy_static! {
    pub static ref REGISTRY: Arc<Registry> = Arc::new(Registry::new());

    // Ledger metrics
    pub static ref USAGE_RECORDS_TOTAL: IntCounter = IntCounter::new(
        "usage_records_total",
        "Total number of usage records appended to the ledger"
    ).expect("Failed to create usage records metric");

    pub static ref USAGE_INJECTED_NODE_HOURS_TOTAL: Counter = Counter::new(
        "usage_injected_node_hours_total",
        "Total node-hours injected into the ledger"
    ).expect("Failed to create injected node-hours metric");

    // Allocation metrics
    pub static ref PERIOD_ROLLOVERS_TOTAL: IntCounter = IntCounter::new(
        "period_rollovers_total",
        "Total number of per-account period rollovers"
    ).expect("Failed to create period rollovers metric");

    pub static ref QOS_TRANSITIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("qos_transitions_total", "Total number of applied QoS transitions"),
        &["from", "to"]
    ).expect("Failed to create QoS transitions metric");

    // State metrics
    pub static ref CHECKPOINTS_CREATED_TOTAL: IntCounter = IntCounter::new(
        "checkpoints_created_total",
        "Total number of checkpoints created"
    ).expect("Failed to create checkpoints created metric");

    pub static ref CHECKPOINT_RESTORES_TOTAL: IntCounter = IntCounter::new(
        "checkpoint_restores_total",
        "Total number of checkpoint restores"
    ).expect("Failed to create checkpoint restores metric");

    pub static ref ACCOUNTS_ACTIVE: IntGauge = IntGauge::new(
        "accounts_active",
        "Number of registered accounts in the live state"
    ).expect("Failed to create active accounts metric");
}

/// Register every collector with the registry.
///
/// Safe to call more than once; collectors already registered are skipped.
pub fn init() -> prometheus::Result<()> {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(USAGE_RECORDS_TOTAL.clone()),
        Box::new(USAGE_INJECTED_NODE_HOURS_TOTAL.clone()),
        Box::new(PERIOD_ROLLOVERS_TOTAL.clone()),
        Box::new(QOS_TRANSITIONS_TOTAL.clone()),
        Box::new(CHECKPOINTS_CREATED_TOTAL.clone()),
        Box::new(CHECKPOINT_RESTORES_TOTAL.clone()),
        Box::new(ACCOUNTS_ACTIVE.clone()),
    ];

    for collector in collectors {
        match REGISTRY.register(collector) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| anyhow::anyhow!("Invalid UTF-8 in metrics: {}", e))
}

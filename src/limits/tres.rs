//! Trackable resources (TRES)
//!
//! Usage is recorded in node-hours. The scheduler bills in TRES units, so a
//! node-hour is broken down into raw per-resource amounts from a standard
//! node profile, and each resource is then priced with its billing weight.

use std::collections::BTreeMap;

/// Raw resource amounts keyed by TRES name (`CPU`, `Mem`, `GRES/gpu`, ...)
pub type TresUsage = BTreeMap<String, u64>;

/// Key carrying whole node-hours in a raw TRES breakdown
pub const NODE_HOURS_TRES: &str = "node-hours";

/// Default billing weights: 64 CPUs, 512 GB or 4 GPUs bill as one unit each
pub fn default_billing_weights() -> BTreeMap<String, f64> {
    BTreeMap::from([
        ("CPU".to_string(), 0.015625),
        ("Mem".to_string(), 0.001953125),
        ("GRES/gpu".to_string(), 0.25),
    ])
}

/// Standard node: 64 CPUs, 512 GB of memory, 4 GPUs
pub fn default_node_tres() -> BTreeMap<String, u64> {
    BTreeMap::from([
        ("CPU".to_string(), 64),
        ("Mem".to_string(), 512),
        ("GRES/gpu".to_string(), 4),
    ])
}

/// Raw TRES consumed by `node_hours` on nodes shaped like `node`.
/// Amounts are truncated to whole units.
pub fn raw_tres(node_hours: f64, node: &BTreeMap<String, u64>) -> TresUsage {
    let whole = |amount: f64| amount.max(0.0).floor() as u64;

    let mut usage = TresUsage::new();
    usage.insert(NODE_HOURS_TRES.to_string(), whole(node_hours));
    for (tres, per_node) in node {
        usage.insert(tres.clone(), whole(node_hours * *per_node as f64));
    }
    usage
}

/// Billing units for a raw TRES breakdown. Resources without a weight are
/// not billed.
pub fn billing_units(usage: &TresUsage, weights: &BTreeMap<String, f64>) -> f64 {
    usage
        .iter()
        .filter_map(|(tres, amount)| weights.get(tres).map(|weight| *amount as f64 * weight))
        .sum()
}

/// Element-wise sum of breakdowns
pub fn sum<'a>(breakdowns: impl IntoIterator<Item = &'a TresUsage>) -> TresUsage {
    let mut total = TresUsage::new();
    for usage in breakdowns {
        for (tres, amount) in usage {
            *total.entry(tres.clone()).or_insert(0) += amount;
        }
    }
    total
}

/// Reason the weights or node profile are unusable, if any
pub fn validation_error(
    weights: &BTreeMap<String, f64>,
    node: &BTreeMap<String, u64>,
) -> Option<String> {
    for (tres, weight) in weights {
        if tres.trim().is_empty() {
            return Some("TRES billing weight with an empty name".to_string());
        }
        if !weight.is_finite() || *weight < 0.0 {
            return Some(format!(
                "TRES billing weight for {} must be finite and >= 0, got {}",
                tres, weight
            ));
        }
    }
    for tres in node.keys() {
        if tres.trim().is_empty() {
            return Some("node TRES with an empty name".to_string());
        }
        if tres == NODE_HOURS_TRES {
            return Some(format!("{} is derived and cannot be part of the node profile", tres));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_tres_for_standard_node() {
        let usage = raw_tres(2.5, &default_node_tres());
        assert_eq!(usage[NODE_HOURS_TRES], 2);
        assert_eq!(usage["CPU"], 160);
        assert_eq!(usage["Mem"], 1280);
        assert_eq!(usage["GRES/gpu"], 10);
    }

    #[test]
    fn test_billing_units() {
        let weights = default_billing_weights();
        // One node-hour bills one unit per weighted resource
        let usage = raw_tres(1.0, &default_node_tres());
        assert_eq!(billing_units(&usage, &weights), 3.0);

        let gpu_only = TresUsage::from([("GRES/gpu".to_string(), 8)]);
        assert_eq!(billing_units(&gpu_only, &weights), 2.0);

        let unweighted = TresUsage::from([("license/matlab".to_string(), 100)]);
        assert_eq!(billing_units(&unweighted, &weights), 0.0);
    }

    #[test]
    fn test_sum() {
        let node = default_node_tres();
        let total = sum([&raw_tres(1.0, &node), &raw_tres(3.0, &node)]);
        assert_eq!(total["CPU"], 256);
        assert_eq!(total[NODE_HOURS_TRES], 4);
        assert!(sum(Vec::<&TresUsage>::new()).is_empty());
    }

    #[test]
    fn test_validation() {
        let node = default_node_tres();
        assert!(validation_error(&default_billing_weights(), &node).is_none());

        for bad in [-0.1, f64::NAN, f64::INFINITY] {
            let weights = BTreeMap::from([("CPU".to_string(), bad)]);
            assert!(validation_error(&weights, &node).is_some(), "weight {} accepted", bad);
        }

        let weights = BTreeMap::from([(" ".to_string(), 1.0)]);
        assert!(validation_error(&weights, &node).is_some());

        let node = BTreeMap::from([(NODE_HOURS_TRES.to_string(), 1)]);
        assert!(validation_error(&default_billing_weights(), &node).is_some());
    }
}

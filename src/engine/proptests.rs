//! Property-based tests for the engine's operation set
//!
//! ```bash
//! cargo test --lib engine::proptests
//! ```

use chrono::Duration;
use proptest::prelude::*;
use std::collections::BTreeMap;

use super::Engine;
use crate::accounts::AccountSpec;
use crate::clock::{parse_instant, PeriodKey, TimeUnit};
use crate::config::Config;
use crate::limits::qos::QosState;

const USERS: [&str; 3] = ["alice", "bob", "carol"];

#[derive(Debug, Clone)]
enum Op {
    Inject { user: usize, amount: f64 },
    Backdated { days_back: u16, amount: f64 },
    Rejected { amount: f64 },
    Advance { days: u16 },
    Checkpoint,
    Restore,
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0usize..USERS.len(), 0.0f64..800.0)
            .prop_map(|(user, amount)| Op::Inject { user, amount }),
        2 => (1u16..400, 0.0f64..800.0)
            .prop_map(|(days_back, amount)| Op::Backdated { days_back, amount }),
        1 => (-1000.0f64..-0.001).prop_map(|amount| Op::Rejected { amount }),
        2 => (1u16..120).prop_map(|days| Op::Advance { days }),
        1 => Just(Op::Checkpoint),
        1 => Just(Op::Restore),
    ]
}

type Fingerprint = (String, String, f64, PeriodKey);

/// Identity of every record by id
fn fingerprints(engine: &Engine) -> BTreeMap<u64, Fingerprint> {
    engine
        .state()
        .ledger
        .records()
        .iter()
        .map(|r| {
            (
                r.id(),
                (r.account().to_string(), r.user().to_string(), r.amount_node_hours(), r.period()),
            )
        })
        .collect()
}

fn engine_with_physics(start_time: &str, hard_limit: Option<f64>) -> Engine {
    let mut config = Config::default();
    config.engine.start_time = start_time.to_string();
    let mut engine = Engine::new(&config).unwrap();

    let mut spec = AccountSpec::new("physics", "", 1000.0);
    spec.hard_limit = hard_limit;
    engine.create_account(spec).unwrap();
    engine
}

proptest! {
    #[test]
    fn prop_records_never_change_after_append(ops in prop::collection::vec(arb_op(), 1..40)) {
        let mut engine = engine_with_physics("2024-01-01T00:00:00", None);
        let mut expected = fingerprints(&engine);
        let mut saved: Vec<(String, BTreeMap<u64, Fingerprint>)> = Vec::new();

        for op in ops {
            match op {
                Op::Inject { user, amount } => {
                    engine.inject("physics", USERS[user], amount, None).unwrap();
                }
                Op::Backdated { days_back, amount } => {
                    let at = engine.now() - Duration::days(i64::from(days_back));
                    engine.inject("physics", "alice", amount, Some(at)).unwrap();
                }
                Op::Rejected { amount } => {
                    prop_assert!(engine.inject("physics", "alice", amount, None).is_err());
                }
                Op::Advance { days } => {
                    engine.advance(u32::from(days), TimeUnit::Days).unwrap();
                }
                Op::Checkpoint => {
                    let name = format!("cp-{}", saved.len());
                    engine.checkpoint(&name).unwrap();
                    saved.push((name, expected.clone()));
                }
                Op::Restore => {
                    if let Some((name, records)) = saved.last() {
                        engine.restore(name).unwrap();
                        prop_assert_eq!(&fingerprints(&engine), records);
                        expected = records.clone();
                    }
                }
            }

            let current = fingerprints(&engine);
            for (id, fingerprint) in &expected {
                prop_assert_eq!(current.get(id), Some(fingerprint));
            }
            for record in engine.state().ledger.records() {
                prop_assert_eq!(record.period(), PeriodKey::containing(&record.timestamp()));
            }
            expected = current;
        }
    }

    #[test]
    fn prop_check_severity_never_drops_as_usage_grows(
        hard_factor in prop::option::of(1.3f64..3.0),
        injections in prop::collection::vec((0u16..166, 0.0f64..600.0), 1..30),
    ) {
        // Account opens in 2023-Q4; the clock then sits in 2024-Q1, so
        // injections land both in the active period and in the closed one
        let mut engine = engine_with_physics("2023-10-01T00:00:00", hard_factor.map(|f| 1000.0 * f));
        engine.set_time(parse_instant("2024-03-15").unwrap()).unwrap();
        let origin = parse_instant("2023-10-01").unwrap();

        let mut severity = engine.check_qos("physics").unwrap().recommended.severity();
        for (day, amount) in injections {
            let at = origin + Duration::days(i64::from(day));
            engine.inject("physics", "alice", amount, Some(at)).unwrap();

            let check = engine.check_qos("physics").unwrap();
            prop_assert!(check.recommended.severity() >= severity);
            severity = check.recommended.severity();

            // Checking never applies
            prop_assert_eq!(check.current, QosState::Normal);
        }
    }
}

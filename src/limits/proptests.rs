//! Property-based tests for the allocation arithmetic
//!
//! ```bash
//! cargo test --lib limits::proptests
//! ```

use chrono::{Duration, NaiveDateTime};
use proptest::prelude::*;

use super::calculator::AllocationCalculator;
use super::decay::decay_factor;
use crate::accounts::{Account, AccountSpec};
use crate::clock::{parse_instant, PeriodKey};
use crate::config::LimitsConfig;
use crate::ledger::{PendingUsage, UsageLedger};

fn base_instant() -> NaiveDateTime {
    parse_instant("2024-01-01").unwrap()
}

// Usage entries as (days after 2024-01-01, node-hours)
fn arb_usage() -> impl Strategy<Value = Vec<(u16, f64)>> {
    prop::collection::vec((0u16..730, 0.0f64..5000.0), 0..40)
}

fn ledger_from(entries: &[(u16, f64)]) -> UsageLedger {
    let mut ledger = UsageLedger::new();
    for (day, amount) in entries {
        ledger
            .append(PendingUsage {
                account: "physics".to_string(),
                user: "alice".to_string(),
                amount_node_hours: *amount,
                at: base_instant() + Duration::days(i64::from(*day)),
            })
            .unwrap();
    }
    ledger
}

fn account(base: f64, half_life: f64) -> Account {
    Account::from_spec(
        AccountSpec::new("physics", "", base).with_half_life_days(half_life),
        &LimitsConfig::default(),
        "2024-Q1".parse().unwrap(),
    )
    .unwrap()
}

proptest! {
    #[test]
    fn prop_decay_is_monotonic_in_elapsed_days(
        half_life in 0.5f64..365.0,
        a in 0.0f64..2000.0,
        b in 0.0f64..2000.0,
    ) {
        let (near, far) = if a <= b { (a, b) } else { (b, a) };
        let f_near = decay_factor(near, half_life);
        let f_far = decay_factor(far, half_life);
        prop_assert!(f_far <= f_near);
        prop_assert!(f_far > 0.0);
        prop_assert!(f_near <= 1.0);
    }

    #[test]
    fn prop_total_allocation_never_below_base(
        entries in arb_usage(),
        base in 0.0f64..10000.0,
        half_life in 1.0f64..90.0,
        quarters_ahead in 0u32..9,
    ) {
        let ledger = ledger_from(&entries);
        let acct = account(base, half_life);
        let calc = AllocationCalculator::default();
        let mut target: PeriodKey = "2024-Q1".parse().unwrap();
        for _ in 0..quarters_ahead {
            target = target.next();
        }

        let alloc = calc.allocation_for(&acct, &ledger, target);
        prop_assert!(alloc.carryover >= 0.0);
        prop_assert!(alloc.carryover <= base);
        prop_assert!(alloc.total_allocation >= base);
    }

    #[test]
    fn prop_multi_hop_matches_single_jump(
        entries in arb_usage(),
        base in 0.0f64..10000.0,
        quarters_ahead in 1u32..9,
    ) {
        let ledger = ledger_from(&entries);
        let acct = account(base, 15.0);
        let calc = AllocationCalculator::default();

        let mut period: PeriodKey = "2024-Q1".parse().unwrap();
        let mut last = None;
        for _ in 0..quarters_ahead {
            last = Some(calc.rollover(&acct, &ledger, period));
            period = period.next();
        }
        let stepped = last.unwrap();
        let jumped = calc.allocation_for(&acct, &ledger, period);

        prop_assert_eq!(stepped.total_allocation, jumped.total_allocation);
        prop_assert_eq!(stepped.carryover, jumped.carryover);
    }

    #[test]
    fn prop_negative_usage_rejected_without_effect(
        entries in arb_usage(),
        amount in -1.0e6f64..-1.0e-9,
    ) {
        let mut ledger = ledger_from(&entries);
        let snapshot = ledger.clone();
        let result = ledger.append(PendingUsage {
            account: "physics".to_string(),
            user: "alice".to_string(),
            amount_node_hours: amount,
            at: base_instant(),
        });
        prop_assert!(result.is_err());
        prop_assert_eq!(ledger, snapshot);
    }
}

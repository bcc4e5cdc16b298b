//! Property-based tests for the domain algebra
//!
//! These verify the core invariants over arbitrary inputs:
//! - split totals: shares plus the payer share always equal the amount
//! - no mutual debt: no pair and its reverse are both positive
//! - cancellation: equal opposite debts annihilate
//! - planner: transfers conserve money and are deterministic

use divvy_core::{
    LedgerCore, Money, Participant, SettlementPlanner, SplitCalculator, SplitMode, UserId,
};
use proptest::prelude::*;
use std::collections::BTreeMap;
use uuid::Uuid;

fn user(n: u128) -> UserId {
    UserId::from_uuid(Uuid::from_u128(n + 1))
}

/// Strategy for positive amounts up to $1M
fn amount_strategy() -> impl Strategy<Value = Money> {
    (1i64..100_000_000).prop_map(Money::from_cents)
}

/// Strategy for a pool of 2..=8 distinct participants
fn participants_strategy() -> impl Strategy<Value = Vec<UserId>> {
    (2usize..=8).prop_map(|n| (0..n as u128).map(user).collect())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Property: EQUAL shares plus the payer share reconstruct the amount
    #[test]
    fn prop_equal_split_conserves_amount(
        amount in amount_strategy(),
        users in participants_strategy(),
        payer_index in 0usize..8,
    ) {
        let payer = users[payer_index % users.len()];
        let participants: Vec<Participant> =
            users.iter().map(|u| Participant::of(*u)).collect();

        let outcome = SplitCalculator
            .compute(amount, SplitMode::Equal, &participants, payer)
            .unwrap();

        prop_assert_eq!(outcome.total() + outcome.payer_share, amount);
        prop_assert!(outcome.splits.iter().all(|s| s.amount.is_positive()));
        prop_assert!(outcome.splits.iter().all(|s| s.user_id != payer));
    }

    /// Property: PERCENTAGE at exactly 100% assigns every cent
    #[test]
    fn prop_percentage_full_allocation_conserves_amount(
        amount in amount_strategy(),
        weights in proptest::collection::vec(1u32..5000, 2..=6),
    ) {
        let total: u32 = weights.iter().sum();
        // rescale to exactly 10000bp, dumping the correction on the last
        let mut bps: Vec<u32> = weights
            .iter()
            .map(|w| w * 10_000 / total)
            .collect();
        let assigned: u32 = bps.iter().sum();
        *bps.last_mut().unwrap() += 10_000 - assigned;

        let payer = user(99);
        let participants: Vec<Participant> = bps
            .iter()
            .enumerate()
            .map(|(i, bp)| Participant::percent(user(i as u128), *bp))
            .collect();

        let outcome = SplitCalculator
            .compute(amount, SplitMode::Percentage, &participants, payer)
            .unwrap();

        prop_assert_eq!(outcome.payer_share, Money::ZERO);
        prop_assert_eq!(outcome.total(), amount);
    }

    /// Property: a debt followed by its exact reverse is a no-op
    #[test]
    fn prop_opposite_debts_cancel(amount in amount_strategy()) {
        let (a, b) = (user(0), user(1));
        let mut ledger = LedgerCore::new();
        ledger.add_debt(a, b, amount).unwrap();
        ledger.add_debt(b, a, amount).unwrap();
        prop_assert!(ledger.is_empty());
    }

    /// Property: no pair and its reverse are ever both positive
    #[test]
    fn prop_no_mutual_debt(
        ops in proptest::collection::vec(
            (0u128..5, 0u128..5, 1i64..1_000_000),
            1..60,
        ),
    ) {
        let mut ledger = LedgerCore::new();
        for (d, c, cents) in ops {
            if d == c {
                continue;
            }
            ledger.add_debt(user(d), user(c), Money::from_cents(cents)).unwrap();
        }

        for (debtor, creditor, amount) in ledger.entries() {
            prop_assert!(amount.is_positive());
            prop_assert_eq!(ledger.balance(creditor, debtor), Money::ZERO);
        }
    }

    /// Property: replaying the same debts always yields the same ledger
    #[test]
    fn prop_replay_is_deterministic(
        ops in proptest::collection::vec(
            (0u128..5, 0u128..5, 1i64..1_000_000),
            1..40,
        ),
    ) {
        let rows: Vec<_> = ops
            .into_iter()
            .filter(|(d, c, _)| d != c)
            .map(|(d, c, cents)| (user(d), user(c), Money::from_cents(cents)))
            .collect();

        let first = LedgerCore::from_entries(rows.clone()).unwrap();
        let second = LedgerCore::from_entries(rows).unwrap();
        prop_assert_eq!(first.entries(), second.entries());
    }

    /// Property: planned transfers clear every net and never exceed n - 1
    #[test]
    fn prop_plan_clears_all_nets(
        ops in proptest::collection::vec(
            (0u128..6, 0u128..6, 1i64..1_000_000),
            1..40,
        ),
    ) {
        let rows: Vec<_> = ops
            .into_iter()
            .filter(|(d, c, _)| d != c)
            .map(|(d, c, cents)| (user(d), user(c), Money::from_cents(cents)))
            .collect();
        let ledger = LedgerCore::from_entries(rows).unwrap();
        let entries = ledger.entries();

        let plan = SettlementPlanner.plan(&entries);
        let replanned = SettlementPlanner.plan(&entries);
        prop_assert_eq!(&plan, &replanned);

        let mut net: BTreeMap<UserId, i64> = BTreeMap::new();
        for (debtor, creditor, amount) in &entries {
            *net.entry(*creditor).or_insert(0) += amount.cents();
            *net.entry(*debtor).or_insert(0) -= amount.cents();
        }
        let nonzero = net.values().filter(|v| **v != 0).count();
        prop_assert!(plan.len() <= nonzero.saturating_sub(1));

        for t in &plan {
            prop_assert!(t.amount.is_positive());
            *net.get_mut(&t.from).unwrap() += t.amount.cents();
            *net.get_mut(&t.to).unwrap() -= t.amount.cents();
        }
        prop_assert!(net.values().all(|v| *v == 0));
    }
}

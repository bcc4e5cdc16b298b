//! Greedy settlement planning
//!
//! Collapses a set of pairwise balances into a short list of transfers that
//! clears every non-zero net position. Largest creditor is matched against
//! largest debtor until both sides run out; output cardinality is at most
//! `n - 1` for `n` users with non-zero nets. Minimum-transaction settlement
//! is NP-hard, so the greedy result is an approximation, and that is
//! accepted.
//!
//! The plan is deterministic: nets are accumulated in `UserId` order and
//! ties on amount break by ascending `UserId`.

use crate::money::Money;
use crate::types::UserId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// One planned settlement payment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transfer {
    pub from: UserId,
    pub to: UserId,
    pub amount: Money,
}

/// Ignore net positions below one cent
const EPSILON_CENTS: i64 = 1;

/// Greedy minimum-cardinality settlement planner
pub struct SettlementPlanner;

impl SettlementPlanner {
    /// Plan transfers clearing the nets implied by `(debtor, creditor,
    /// amount)` rows.
    pub fn plan<'a, I>(&self, balances: I) -> Vec<Transfer>
    where
        I: IntoIterator<Item = &'a (UserId, UserId, Money)>,
    {
        let mut net: BTreeMap<UserId, i64> = BTreeMap::new();
        for (debtor, creditor, amount) in balances {
            *net.entry(*creditor).or_insert(0) += amount.cents();
            *net.entry(*debtor).or_insert(0) -= amount.cents();
        }
        self.plan_from_net(&net)
    }

    /// Plan transfers from per-user signed nets (positive = is owed)
    pub fn plan_from_net(&self, net: &BTreeMap<UserId, i64>) -> Vec<Transfer> {
        let mut creditors: Vec<(UserId, i64)> = Vec::new();
        let mut debtors: Vec<(UserId, i64)> = Vec::new();
        for (user, value) in net {
            if *value >= EPSILON_CENTS {
                creditors.push((*user, *value));
            } else if *value <= -EPSILON_CENTS {
                debtors.push((*user, -*value));
            }
        }

        // Descending by amount, ascending user id on ties
        let by_amount_desc = |a: &(UserId, i64), b: &(UserId, i64)| match b.1.cmp(&a.1) {
            Ordering::Equal => a.0.cmp(&b.0),
            other => other,
        };
        creditors.sort_by(by_amount_desc);
        debtors.sort_by(by_amount_desc);

        let mut transfers = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < creditors.len() && j < debtors.len() {
            let step = creditors[i].1.min(debtors[j].1);
            transfers.push(Transfer {
                from: debtors[j].0,
                to: creditors[i].0,
                amount: Money::from_cents(step),
            });
            creditors[i].1 -= step;
            debtors[j].1 -= step;
            if creditors[i].1 == 0 {
                i += 1;
            }
            if debtors[j].1 == 0 {
                j += 1;
            }
        }

        transfers
    }
}

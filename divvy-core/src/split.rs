//! Split calculation
//!
//! Turns an expense amount plus a split mode into per-debtor shares. All
//! arithmetic stays in integer cents; remainder cents from division are
//! handed out deterministically, one each, to the first participants in
//! ascending `UserId` order. A remainder cent that lands on the payer stays
//! with the payer and is never emitted as a split.

use crate::error::{Error, Result};
use crate::money::Money;
use crate::types::{Participant, Split, SplitMode, UserId};
use std::collections::BTreeSet;

const MAX_BASIS_POINTS: u64 = 10_000;

/// Computed shares for one expense
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitOutcome {
    /// Per-debtor shares, payer excluded, every amount strictly positive
    pub splits: Vec<Split>,
    /// The slice of the amount the payer keeps for themselves
    pub payer_share: Money,
}

impl SplitOutcome {
    /// Total assigned to debtors; `total + payer_share` equals the amount
    pub fn total(&self) -> Money {
        self.splits.iter().map(|s| s.amount).sum()
    }
}

/// Split calculation service
pub struct SplitCalculator;

impl SplitCalculator {
    /// Compute per-debtor shares for `amount` under `mode`.
    pub fn compute(
        &self,
        amount: Money,
        mode: SplitMode,
        participants: &[Participant],
        payer_id: UserId,
    ) -> Result<SplitOutcome> {
        if !amount.is_positive() {
            return Err(Error::InvalidSplit("amount must be positive".into()));
        }
        if participants.is_empty() {
            return Err(Error::InvalidSplit("participant list is empty".into()));
        }

        let mut seen = BTreeSet::new();
        for p in participants {
            if !seen.insert(p.user_id) {
                return Err(Error::InvalidSplit(format!(
                    "duplicate participant {}",
                    p.user_id
                )));
            }
        }
        if seen.len() == 1 && seen.contains(&payer_id) {
            return Err(Error::InvalidSplit(
                "no participants other than the payer".into(),
            ));
        }

        let outcome = match mode {
            SplitMode::Equal => self.compute_equal(amount, participants, payer_id),
            SplitMode::Exact => self.compute_exact(amount, participants, payer_id),
            SplitMode::Percentage => self.compute_percentage(amount, participants, payer_id),
        }?;

        debug_assert_eq!(outcome.total() + outcome.payer_share, amount);
        debug_assert!(outcome.splits.iter().all(|s| s.amount.is_positive()));
        debug_assert!(outcome.splits.iter().all(|s| s.user_id != payer_id));

        Ok(outcome)
    }

    fn compute_equal(
        &self,
        amount: Money,
        participants: &[Participant],
        payer_id: UserId,
    ) -> Result<SplitOutcome> {
        let n = participants.len() as i64;
        let base = amount.cents() / n;
        let remainder = amount.cents() % n;

        let mut ordered: Vec<UserId> = participants.iter().map(|p| p.user_id).collect();
        ordered.sort();

        let mut splits = Vec::new();
        let mut payer_share = Money::ZERO;
        let mut assigned: i64 = 0;

        for (i, user_id) in ordered.iter().enumerate() {
            let share = base + i64::from((i as i64) < remainder);
            if *user_id == payer_id {
                payer_share = Money::from_cents(share);
            } else if share > 0 {
                splits.push(Split {
                    user_id: *user_id,
                    amount: Money::from_cents(share),
                });
            }
            assigned += share;
        }

        // The payer keeps any amount not assigned to a listed participant
        // (zero when the payer is in the list, since shares cover the total).
        payer_share += Money::from_cents(amount.cents() - assigned);

        Ok(SplitOutcome { splits, payer_share })
    }

    fn compute_exact(
        &self,
        amount: Money,
        participants: &[Participant],
        payer_id: UserId,
    ) -> Result<SplitOutcome> {
        let mut splits = Vec::new();
        let mut total = Money::ZERO;

        for p in participants {
            if p.user_id == payer_id {
                continue;
            }
            let exact = p.exact_amount.ok_or_else(|| {
                Error::InvalidSplit(format!("participant {} is missing exactAmount", p.user_id))
            })?;
            if !exact.is_positive() {
                return Err(Error::InvalidSplit(format!(
                    "exactAmount for {} must be positive",
                    p.user_id
                )));
            }
            total = total.checked_add(exact)?;
            splits.push(Split {
                user_id: p.user_id,
                amount: exact,
            });
        }

        if total > amount {
            return Err(Error::InvalidSplit(format!(
                "exact amounts total {total} exceeds expense amount {amount}"
            )));
        }

        splits.sort_by_key(|s| s.user_id);
        Ok(SplitOutcome {
            splits,
            payer_share: amount - total,
        })
    }

    fn compute_percentage(
        &self,
        amount: Money,
        participants: &[Participant],
        payer_id: UserId,
    ) -> Result<SplitOutcome> {
        let mut total_bp: u64 = 0;
        for p in participants {
            let bp = p.percent_bp.ok_or_else(|| {
                Error::InvalidSplit(format!("participant {} is missing percentBp", p.user_id))
            })?;
            if u64::from(bp) > MAX_BASIS_POINTS {
                return Err(Error::InvalidSplit(format!(
                    "percentBp for {} exceeds 10000",
                    p.user_id
                )));
            }
            total_bp += u64::from(bp);
        }
        if total_bp > MAX_BASIS_POINTS {
            return Err(Error::InvalidSplit(format!(
                "percentages total {total_bp}bp exceeds 10000bp"
            )));
        }

        // The participant pool is entitled to floor(amount * Σbp / 10000);
        // whatever the floor leaves behind stays with the payer.
        let pool = bp_share(amount, total_bp);

        let mut ordered: Vec<(UserId, u64)> = participants
            .iter()
            .map(|p| (p.user_id, u64::from(p.percent_bp.unwrap_or(0))))
            .collect();
        ordered.sort_by_key(|(user_id, _)| *user_id);

        let mut shares: Vec<(UserId, i64)> = ordered
            .iter()
            .map(|(user_id, bp)| (*user_id, bp_share(amount, *bp).cents()))
            .collect();
        let floored: i64 = shares.iter().map(|(_, c)| c).sum();
        let mut remainder = pool.cents() - floored;

        for (_, cents) in shares.iter_mut() {
            if remainder == 0 {
                break;
            }
            *cents += 1;
            remainder -= 1;
        }

        let mut splits = Vec::new();
        let mut payer_share = amount - pool;
        for (user_id, cents) in shares {
            if user_id == payer_id {
                payer_share += Money::from_cents(cents);
            } else if cents > 0 {
                splits.push(Split {
                    user_id,
                    amount: Money::from_cents(cents),
                });
            }
        }

        Ok(SplitOutcome { splits, payer_share })
    }
}

fn bp_share(amount: Money, bp: u64) -> Money {
    let cents = (i128::from(amount.cents()) * i128::from(bp)) / i128::from(MAX_BASIS_POINTS);
    Money::from_cents(cents as i64)
}

//! Pairwise debt algebra
//!
//! In-memory model of one sub-ledger: `debtor -> creditor -> amount`, all
//! strictly positive integer cents. Two invariants hold after every
//! mutation:
//!
//! - no mutual debt: `(A, B)` and `(B, A)` are never both present
//! - no zero rows: a pair that reaches zero is removed
//!
//! `add_debt` consumes any reverse debt first, which is what keeps the
//! representation mutual-debt free. The same algebra backs the durable
//! balance store; this type is used directly for recompute and tests.

use crate::error::{Error, Result};
use crate::money::Money;
use crate::types::UserId;
use std::collections::BTreeMap;

type PairMap = BTreeMap<UserId, BTreeMap<UserId, Money>>;

/// In-memory pairwise ledger for a single scope
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerCore {
    /// debtor -> creditor -> amount
    debts: PairMap,
    /// creditor -> debtor -> amount, mirror of `debts`
    credits: PairMap,
}

impl LedgerCore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a ledger from `(debtor, creditor, amount)` rows
    pub fn from_entries<I>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (UserId, UserId, Money)>,
    {
        let mut ledger = Self::new();
        for (debtor, creditor, amount) in entries {
            ledger.add_debt(debtor, creditor, amount)?;
        }
        Ok(ledger)
    }

    /// Record that `debtor` owes `creditor` an additional `delta`.
    ///
    /// Reverse debt is consumed before any forward debt is created, so a
    /// mutual pair can never appear.
    pub fn add_debt(&mut self, debtor: UserId, creditor: UserId, delta: Money) -> Result<()> {
        if debtor == creditor {
            return Err(Error::InvalidDebt(format!("{debtor} cannot owe themselves")));
        }
        if !delta.is_positive() {
            return Err(Error::InvalidDebt(format!(
                "debt delta must be positive, got {delta}"
            )));
        }

        let reverse = self.balance(creditor, debtor);
        if reverse >= delta {
            self.set_pair(creditor, debtor, reverse - delta);
        } else {
            self.set_pair(creditor, debtor, Money::ZERO);
            let forward = self.balance(debtor, creditor).checked_add(delta - reverse)?;
            self.set_pair(debtor, creditor, forward);
        }
        Ok(())
    }

    /// Reduce the debt `debtor` owes `creditor` by `delta`.
    pub fn settle_debt(&mut self, debtor: UserId, creditor: UserId, delta: Money) -> Result<()> {
        if !delta.is_positive() {
            return Err(Error::InvalidDebt(format!(
                "settlement must be positive, got {delta}"
            )));
        }
        let current = self.balance(debtor, creditor);
        if current < delta {
            return Err(Error::InsufficientBalance {
                requested: delta,
                available: current,
            });
        }
        self.set_pair(debtor, creditor, current - delta);
        Ok(())
    }

    /// Outstanding amount `debtor` owes `creditor` (zero when no row)
    pub fn balance(&self, debtor: UserId, creditor: UserId) -> Money {
        self.debts
            .get(&debtor)
            .and_then(|row| row.get(&creditor))
            .copied()
            .unwrap_or(Money::ZERO)
    }

    /// Everyone `user` owes, ascending by creditor id
    pub fn user_owes(&self, user: UserId) -> Vec<(UserId, Money)> {
        self.debts
            .get(&user)
            .map(|row| row.iter().map(|(c, m)| (*c, *m)).collect())
            .unwrap_or_default()
    }

    /// Everyone who owes `user`, ascending by debtor id
    pub fn user_owed(&self, user: UserId) -> Vec<(UserId, Money)> {
        self.credits
            .get(&user)
            .map(|row| row.iter().map(|(d, m)| (*d, *m)).collect())
            .unwrap_or_default()
    }

    /// Signed net position of `user`: owed minus owes
    pub fn net_balance(&self, user: UserId) -> Money {
        let owed: Money = self.user_owed(user).into_iter().map(|(_, m)| m).sum();
        let owes: Money = self.user_owes(user).into_iter().map(|(_, m)| m).sum();
        owed - owes
    }

    /// All rows as `(debtor, creditor, amount)`, ascending by pair
    pub fn entries(&self) -> Vec<(UserId, UserId, Money)> {
        self.debts
            .iter()
            .flat_map(|(debtor, row)| row.iter().map(|(creditor, m)| (*debtor, *creditor, *m)))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.debts.is_empty()
    }

    fn set_pair(&mut self, debtor: UserId, creditor: UserId, amount: Money) {
        if amount.is_zero() {
            if let Some(row) = self.debts.get_mut(&debtor) {
                row.remove(&creditor);
                if row.is_empty() {
                    self.debts.remove(&debtor);
                }
            }
            if let Some(row) = self.credits.get_mut(&creditor) {
                row.remove(&debtor);
                if row.is_empty() {
                    self.credits.remove(&creditor);
                }
            }
        } else {
            self.debts.entry(debtor).or_default().insert(creditor, amount);
            self.credits.entry(creditor).or_default().insert(debtor, amount);
        }
    }
}

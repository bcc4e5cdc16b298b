//! In-memory balance store
//!
//! Backs unit and integration tests, and lets the engine run without a
//! database for local experimentation. Same contract as the Postgres
//! store, including zero-row removal and the abort-on-underflow rule.

use super::{BalanceDelta, BalanceStore};
use crate::errors::Result;
use async_trait::async_trait;
use chrono::Utc;
use divvy_core::{BalanceEntry, Money, ScopeId, UserId};
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use uuid::Uuid;

type PairKey = (ScopeId, UserId, UserId);

#[derive(Default)]
pub struct MemoryBalanceStore {
    rows: RwLock<BTreeMap<PairKey, BalanceEntry>>,
}

impl MemoryBalanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Row count across all scopes (test helper)
    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

#[async_trait]
impl BalanceStore for MemoryBalanceStore {
    async fn get_pair(
        &self,
        scope: ScopeId,
        debtor: UserId,
        creditor: UserId,
    ) -> Result<Option<BalanceEntry>> {
        let rows = self.rows.read().await;
        Ok(rows.get(&(scope, debtor, creditor)).cloned())
    }

    async fn upsert_atomic(
        &self,
        scope: ScopeId,
        debtor: UserId,
        creditor: UserId,
        delta: BalanceDelta,
        expense_id: Option<Uuid>,
    ) -> Result<()> {
        let mut rows = self.rows.write().await;
        let key = (scope, debtor, creditor);
        let now = Utc::now();

        match delta {
            BalanceDelta::Increment(amount) => {
                if let Some(entry) = rows.get_mut(&key) {
                    entry.amount += amount;
                    entry.last_expense_id = expense_id.or(entry.last_expense_id);
                    entry.updated_at = now;
                } else {
                    rows.insert(
                        key,
                        BalanceEntry {
                            scope,
                            debtor,
                            creditor,
                            amount,
                            last_expense_id: expense_id,
                            updated_at: now,
                        },
                    );
                }
            }
            BalanceDelta::Decrement(amount) => {
                let drained = {
                    let entry = rows.get_mut(&key).unwrap_or_else(|| {
                        panic!("ledger invariant violated: decrement of missing pair {scope}/{debtor}->{creditor}")
                    });
                    assert!(
                        entry.amount >= amount,
                        "ledger invariant violated: decrement {amount} below balance {} on {scope}/{debtor}->{creditor}",
                        entry.amount
                    );
                    entry.amount -= amount;
                    entry.updated_at = now;
                    entry.amount.is_zero()
                };
                if drained {
                    rows.remove(&key);
                }
            }
            BalanceDelta::Set(amount) => {
                if amount.is_zero() {
                    rows.remove(&key);
                } else {
                    rows.insert(
                        key,
                        BalanceEntry {
                            scope,
                            debtor,
                            creditor,
                            amount,
                            last_expense_id: expense_id,
                            updated_at: now,
                        },
                    );
                }
            }
            BalanceDelta::Delete => {
                rows.remove(&key);
            }
        }

        Ok(())
    }

    async fn scan_by_debtor(&self, user: UserId) -> Result<Vec<BalanceEntry>> {
        let rows = self.rows.read().await;
        Ok(rows
            .values()
            .filter(|e| e.debtor == user)
            .cloned()
            .collect())
    }

    async fn scan_by_creditor(&self, user: UserId) -> Result<Vec<BalanceEntry>> {
        let rows = self.rows.read().await;
        Ok(rows
            .values()
            .filter(|e| e.creditor == user)
            .cloned()
            .collect())
    }

    async fn scan_by_scope(&self, scope: ScopeId) -> Result<Vec<BalanceEntry>> {
        let rows = self.rows.read().await;
        Ok(rows.values().filter(|e| e.scope == scope).cloned().collect())
    }

    async fn bulk_replace(&self, scope: ScopeId, entries: Vec<BalanceEntry>) -> Result<()> {
        let mut rows = self.rows.write().await;
        rows.retain(|(s, _, _), _| *s != scope);
        for entry in entries {
            if entry.amount.is_zero() {
                continue;
            }
            rows.insert((entry.scope, entry.debtor, entry.creditor), entry);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use divvy_core::GroupId;

    fn scope() -> ScopeId {
        ScopeId::Group(GroupId::new())
    }

    fn cents(c: i64) -> Money {
        Money::from_cents(c)
    }

    #[tokio::test]
    async fn test_increment_creates_then_accumulates() {
        let store = MemoryBalanceStore::new();
        let s = scope();
        let (a, b) = (UserId::new(), UserId::new());
        let expense = Uuid::new_v4();

        store
            .upsert_atomic(s, b, a, BalanceDelta::Increment(cents(300)), Some(expense))
            .await
            .unwrap();
        store
            .upsert_atomic(s, b, a, BalanceDelta::Increment(cents(200)), None)
            .await
            .unwrap();

        let entry = store.get_pair(s, b, a).await.unwrap().unwrap();
        assert_eq!(entry.amount, cents(500));
        assert_eq!(entry.last_expense_id, Some(expense));
    }

    #[tokio::test]
    async fn test_decrement_to_zero_removes_row() {
        let store = MemoryBalanceStore::new();
        let s = scope();
        let (a, b) = (UserId::new(), UserId::new());

        store
            .upsert_atomic(s, b, a, BalanceDelta::Increment(cents(500)), None)
            .await
            .unwrap();
        store
            .upsert_atomic(s, b, a, BalanceDelta::Decrement(cents(500)), None)
            .await
            .unwrap();

        assert!(store.get_pair(s, b, a).await.unwrap().is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_set_zero_and_delete_are_idempotent() {
        let store = MemoryBalanceStore::new();
        let s = scope();
        let (a, b) = (UserId::new(), UserId::new());

        store
            .upsert_atomic(s, b, a, BalanceDelta::Set(cents(100)), None)
            .await
            .unwrap();
        store
            .upsert_atomic(s, b, a, BalanceDelta::Set(Money::ZERO), None)
            .await
            .unwrap();
        assert!(store.get_pair(s, b, a).await.unwrap().is_none());

        // deleting an absent pair is fine
        store
            .upsert_atomic(s, b, a, BalanceDelta::Delete, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_scans_are_scope_isolated() {
        let store = MemoryBalanceStore::new();
        let (s1, s2) = (scope(), ScopeId::Direct);
        let (a, b) = (UserId::new(), UserId::new());

        store
            .upsert_atomic(s1, b, a, BalanceDelta::Increment(cents(100)), None)
            .await
            .unwrap();
        store
            .upsert_atomic(s2, b, a, BalanceDelta::Increment(cents(50)), None)
            .await
            .unwrap();

        assert_eq!(store.scan_by_scope(s1).await.unwrap().len(), 1);
        assert_eq!(store.scan_by_scope(s2).await.unwrap().len(), 1);
        // debtor scan crosses scopes
        assert_eq!(store.scan_by_debtor(b).await.unwrap().len(), 2);
        assert_eq!(store.scan_by_creditor(a).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_bulk_replace_swaps_scope_contents() {
        let store = MemoryBalanceStore::new();
        let s = scope();
        let other = ScopeId::Direct;
        let (a, b, c) = (UserId::new(), UserId::new(), UserId::new());

        store
            .upsert_atomic(s, b, a, BalanceDelta::Increment(cents(100)), None)
            .await
            .unwrap();
        store
            .upsert_atomic(other, c, a, BalanceDelta::Increment(cents(70)), None)
            .await
            .unwrap();

        store
            .bulk_replace(
                s,
                vec![BalanceEntry {
                    scope: s,
                    debtor: c,
                    creditor: b,
                    amount: cents(40),
                    last_expense_id: None,
                    updated_at: Utc::now(),
                }],
            )
            .await
            .unwrap();

        let in_scope = store.scan_by_scope(s).await.unwrap();
        assert_eq!(in_scope.len(), 1);
        assert_eq!(in_scope[0].debtor, c);
        // the other scope is untouched
        assert_eq!(store.scan_by_scope(other).await.unwrap().len(), 1);
    }

    #[tokio::test]
    #[should_panic(expected = "ledger invariant violated")]
    async fn test_decrement_below_balance_aborts() {
        let store = MemoryBalanceStore::new();
        let s = scope();
        let (a, b) = (UserId::new(), UserId::new());

        store
            .upsert_atomic(s, b, a, BalanceDelta::Increment(cents(100)), None)
            .await
            .unwrap();
        let _ = store
            .upsert_atomic(s, b, a, BalanceDelta::Decrement(cents(200)), None)
            .await;
    }
}

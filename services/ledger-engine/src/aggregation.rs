//! Balance views and settlement plans
//!
//! Read side of the ledger: per-user cross-scope views, per-scope
//! matrices, and greedy settlement plans. Reads go through the cache with
//! the configured TTL; `fresh = true` bypasses it for read-your-write
//! callers. Cross-scope sums keep their sign per counterparty: owing
//! someone in one group while being owed by them in another is reported on
//! both sides, never cancelled, because each scope is its own ledger.

use crate::cache::{keys as cache_keys, CacheLayer};
use crate::errors::Result;
use crate::models::{CounterpartyAmount, UserBalancesView};
use crate::store::BalanceStore;
use divvy_core::{Money, ScopeId, SettlementPlanner, Transfer, UserId};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Which balances a settlement plan nets over; the policy is explicit in
/// the API because per-scope and global plans give different answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanTarget {
    /// Net only within one scope
    Scope(ScopeId),
    /// Net everything the user is part of, across scopes
    User(UserId),
}

/// Nested `{debtor: {creditor: amount}}` form of one scope's ledger
pub type ScopeMatrix = BTreeMap<UserId, BTreeMap<UserId, Money>>;

pub struct AggregationService {
    store: Arc<dyn BalanceStore>,
    cache: CacheLayer,
}

impl AggregationService {
    pub fn new(store: Arc<dyn BalanceStore>, cache: CacheLayer) -> Self {
        Self { store, cache }
    }

    /// Aggregated position of one user across every scope.
    pub async fn get_user_view(&self, user: UserId, fresh: bool) -> Result<UserBalancesView> {
        if fresh {
            return self.compute_user_view(user).await;
        }
        self.cache
            .get_or_compute(&cache_keys::user_balances(user), || {
                self.compute_user_view(user)
            })
            .await
    }

    /// One scope's ledger folded into a debtor/creditor matrix.
    pub async fn get_scope_matrix(&self, scope: ScopeId, fresh: bool) -> Result<ScopeMatrix> {
        if fresh {
            return self.compute_scope_matrix(scope).await;
        }
        self.cache
            .get_or_compute(&cache_keys::scope_balances(scope), || {
                self.compute_scope_matrix(scope)
            })
            .await
    }

    /// Greedy plan clearing the target's non-zero nets.
    pub async fn settlement_plan(&self, target: PlanTarget, fresh: bool) -> Result<Vec<Transfer>> {
        if fresh {
            return self.compute_plan(target).await;
        }
        let key = match target {
            PlanTarget::Scope(scope) => cache_keys::scope_plan(scope),
            PlanTarget::User(user) => cache_keys::user_plan(user),
        };
        self.cache
            .get_or_compute(&key, || self.compute_plan(target))
            .await
    }

    async fn compute_user_view(&self, user: UserId) -> Result<UserBalancesView> {
        let debit_rows = self.store.scan_by_debtor(user).await?;
        let credit_rows = self.store.scan_by_creditor(user).await?;

        let mut owes: BTreeMap<UserId, Money> = BTreeMap::new();
        for entry in debit_rows {
            *owes.entry(entry.creditor).or_insert(Money::ZERO) += entry.amount;
        }
        let mut owed: BTreeMap<UserId, Money> = BTreeMap::new();
        for entry in credit_rows {
            *owed.entry(entry.debtor).or_insert(Money::ZERO) += entry.amount;
        }

        let total_owes: Money = owes.values().copied().sum();
        let total_owed: Money = owed.values().copied().sum();

        Ok(UserBalancesView {
            owes: owes
                .into_iter()
                .map(|(user_id, amount)| CounterpartyAmount { user_id, amount })
                .collect(),
            owed: owed
                .into_iter()
                .map(|(user_id, amount)| CounterpartyAmount { user_id, amount })
                .collect(),
            total_owes,
            total_owed,
            net_balance: total_owed - total_owes,
        })
    }

    async fn compute_scope_matrix(&self, scope: ScopeId) -> Result<ScopeMatrix> {
        let rows = self.store.scan_by_scope(scope).await?;
        let mut matrix = ScopeMatrix::new();
        for entry in rows {
            matrix
                .entry(entry.debtor)
                .or_default()
                .insert(entry.creditor, entry.amount);
        }
        Ok(matrix)
    }

    async fn compute_plan(&self, target: PlanTarget) -> Result<Vec<Transfer>> {
        let rows = match target {
            PlanTarget::Scope(scope) => self.store.scan_by_scope(scope).await?,
            PlanTarget::User(user) => {
                let mut rows = self.store.scan_by_debtor(user).await?;
                rows.extend(self.store.scan_by_creditor(user).await?);
                rows
            }
        };

        let balances: Vec<(UserId, UserId, Money)> = rows
            .into_iter()
            .map(|e| (e.debtor, e.creditor, e.amount))
            .collect();
        Ok(SettlementPlanner.plan(&balances))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{BalanceDelta, MemoryBalanceStore};
    use divvy_core::GroupId;

    fn cents(c: i64) -> Money {
        Money::from_cents(c)
    }

    async fn seed(
        store: &MemoryBalanceStore,
        scope: ScopeId,
        debtor: UserId,
        creditor: UserId,
        amount: i64,
    ) {
        store
            .upsert_atomic(scope, debtor, creditor, BalanceDelta::Increment(cents(amount)), None)
            .await
            .unwrap();
    }

    fn service(store: Arc<MemoryBalanceStore>) -> AggregationService {
        AggregationService::new(store, CacheLayer::disabled())
    }

    #[tokio::test]
    async fn test_user_view_sums_across_scopes() {
        let store = Arc::new(MemoryBalanceStore::new());
        let group = ScopeId::Group(GroupId::new());
        let (a, b, c) = (UserId::new(), UserId::new(), UserId::new());

        // b owes a in the group and directly; c owes a in the group
        seed(&store, group, b, a, 3000).await;
        seed(&store, ScopeId::Direct, b, a, 500).await;
        seed(&store, group, c, a, 2000).await;

        let view = service(store).get_user_view(a, true).await.unwrap();
        assert_eq!(view.owes, vec![]);
        assert_eq!(view.total_owes, Money::ZERO);
        assert_eq!(view.total_owed, cents(5500));
        assert_eq!(view.net_balance, cents(5500));

        let owed_b = view.owed.iter().find(|x| x.user_id == b).unwrap();
        assert_eq!(owed_b.amount, cents(3500));
        let owed_c = view.owed.iter().find(|x| x.user_id == c).unwrap();
        assert_eq!(owed_c.amount, cents(2000));
    }

    #[tokio::test]
    async fn test_cross_scope_positions_are_not_cancelled() {
        let store = Arc::new(MemoryBalanceStore::new());
        let (g1, g2) = (ScopeId::Group(GroupId::new()), ScopeId::Group(GroupId::new()));
        let (a, b) = (UserId::new(), UserId::new());

        // a owes b in g1, b owes a in g2; both sides must survive
        seed(&store, g1, a, b, 1000).await;
        seed(&store, g2, b, a, 400).await;

        let view = service(store).get_user_view(a, true).await.unwrap();
        assert_eq!(view.owes, vec![CounterpartyAmount { user_id: b, amount: cents(1000) }]);
        assert_eq!(view.owed, vec![CounterpartyAmount { user_id: b, amount: cents(400) }]);
        assert_eq!(view.net_balance, cents(-600));
    }

    #[tokio::test]
    async fn test_scope_matrix_shape() {
        let store = Arc::new(MemoryBalanceStore::new());
        let group = ScopeId::Group(GroupId::new());
        let (a, b, c) = (UserId::new(), UserId::new(), UserId::new());

        seed(&store, group, b, a, 1000).await;
        seed(&store, group, c, a, 2000).await;
        seed(&store, group, c, b, 500).await;
        // another scope's rows stay out
        seed(&store, ScopeId::Direct, b, a, 9999).await;

        let matrix = service(store).get_scope_matrix(group, true).await.unwrap();
        assert_eq!(matrix.len(), 2);
        assert_eq!(matrix[&b][&a], cents(1000));
        assert_eq!(matrix[&c][&a], cents(2000));
        assert_eq!(matrix[&c][&b], cents(500));
    }

    #[tokio::test]
    async fn test_scope_plan_ignores_other_scopes() {
        let store = Arc::new(MemoryBalanceStore::new());
        let group = ScopeId::Group(GroupId::new());
        let (a, b) = (UserId::new(), UserId::new());

        seed(&store, group, b, a, 3000).await;
        seed(&store, ScopeId::Direct, a, b, 500).await;

        let plan = service(store)
            .settlement_plan(PlanTarget::Scope(group), true)
            .await
            .unwrap();
        assert_eq!(
            plan,
            vec![Transfer { from: b, to: a, amount: cents(3000) }]
        );
    }

    #[tokio::test]
    async fn test_user_plan_nets_globally() {
        let store = Arc::new(MemoryBalanceStore::new());
        let group = ScopeId::Group(GroupId::new());
        let (a, b) = (UserId::new(), UserId::new());

        // b owes a 3000 in the group, a owes b 500 directly: global net 2500
        seed(&store, group, b, a, 3000).await;
        seed(&store, ScopeId::Direct, a, b, 500).await;

        let plan = service(store)
            .settlement_plan(PlanTarget::User(a), true)
            .await
            .unwrap();
        assert_eq!(
            plan,
            vec![Transfer { from: b, to: a, amount: cents(2500) }]
        );
    }

    #[tokio::test]
    async fn test_empty_scope_plans_nothing() {
        let store = Arc::new(MemoryBalanceStore::new());
        let plan = service(store)
            .settlement_plan(PlanTarget::Scope(ScopeId::Group(GroupId::new())), true)
            .await
            .unwrap();
        assert_eq!(plan, vec![]);
    }
}

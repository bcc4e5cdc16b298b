//! Durable pairwise balance storage
//!
//! One row per `(scope, debtor, creditor)` with a strictly positive amount.
//! The trait is the only mutation surface; every mutation of a single pair
//! is atomic. Rows that reach zero are removed so scans never see them.

mod memory;
mod postgres;

pub use memory::MemoryBalanceStore;
pub use postgres::PgBalanceStore;

use crate::errors::Result;
use async_trait::async_trait;
use divvy_core::{BalanceEntry, Money, ScopeId, UserId};
use uuid::Uuid;

/// Atomic mutation applied to one balance pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceDelta {
    Increment(Money),
    Decrement(Money),
    Set(Money),
    Delete,
}

#[async_trait]
pub trait BalanceStore: Send + Sync {
    /// Fetch one pair; absent and zero rows both come back as `None`
    async fn get_pair(
        &self,
        scope: ScopeId,
        debtor: UserId,
        creditor: UserId,
    ) -> Result<Option<BalanceEntry>>;

    /// Apply one atomic mutation to a pair.
    ///
    /// Decrementing a missing row, or below zero, is an invariant breach:
    /// all writers are serialized by the scope lock, so it cannot happen in
    /// a correct deployment and the process aborts rather than persist a
    /// corrupt ledger.
    async fn upsert_atomic(
        &self,
        scope: ScopeId,
        debtor: UserId,
        creditor: UserId,
        delta: BalanceDelta,
        expense_id: Option<Uuid>,
    ) -> Result<()>;

    /// All rows where `user` is the debtor, across scopes
    async fn scan_by_debtor(&self, user: UserId) -> Result<Vec<BalanceEntry>>;

    /// All rows where `user` is the creditor, across scopes
    async fn scan_by_creditor(&self, user: UserId) -> Result<Vec<BalanceEntry>>;

    /// All rows in one scope
    async fn scan_by_scope(&self, scope: ScopeId) -> Result<Vec<BalanceEntry>>;

    /// Replace every row of `scope` with `entries`; used only by recompute
    async fn bulk_replace(&self, scope: ScopeId, entries: Vec<BalanceEntry>) -> Result<()>;
}

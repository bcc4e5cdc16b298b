//! Ledger mutation orchestration
//!
//! The only two write paths into the balance store, plus the recompute
//! repair. Every mutation of a scope runs under that scope's lock
//! (`scope:{group}` or `direct:{payer}`), and the lease is revalidated
//! before each store write so a holder that outlived its TTL aborts
//! instead of racing a newer holder. Cache invalidation and event
//! emission ride the job queue after the authoritative write; their
//! failure never fails the operation.

use crate::cache::{keys as cache_keys, InvalidationRequest};
use crate::config::LockConfig;
use crate::errors::{EngineError, Result};
use crate::events::{ActivityEvent, EventEmitter};
use crate::expenses::{new_settlement_record, ExpenseRegistry, SettlementLog, SettlementRecord};
use crate::groups::GroupRegistry;
use crate::jobs::{job_types, JobOptions, JobRunner};
use crate::locks::{Lease, LockService};
use crate::metrics::Metrics;
use crate::models::{PostExpenseRequest, SettleRequest};
use crate::store::{BalanceDelta, BalanceStore};
use chrono::Utc;
use divvy_core::{
    BalanceEntry, Expense, LedgerCore, Money, ScopeId, SplitCalculator, UserId,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

/// Lock name for a scope mutation: group mutations lock the group, direct
/// mutations lock the paying user
fn mutation_lock_name(scope: ScopeId, payer: UserId) -> String {
    match scope {
        ScopeId::Group(group_id) => format!("scope:{group_id}"),
        ScopeId::Direct => format!("direct:{payer}"),
    }
}

pub struct LedgerService {
    store: Arc<dyn BalanceStore>,
    locks: Arc<dyn LockService>,
    jobs: Arc<JobRunner>,
    emitter: EventEmitter,
    expenses: Arc<dyn ExpenseRegistry>,
    settlements: Arc<dyn SettlementLog>,
    groups: Arc<dyn GroupRegistry>,
    lock_config: LockConfig,
    metrics: Metrics,
}

impl LedgerService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn BalanceStore>,
        locks: Arc<dyn LockService>,
        jobs: Arc<JobRunner>,
        emitter: EventEmitter,
        expenses: Arc<dyn ExpenseRegistry>,
        settlements: Arc<dyn SettlementLog>,
        groups: Arc<dyn GroupRegistry>,
        lock_config: LockConfig,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            locks,
            jobs,
            emitter,
            expenses,
            settlements,
            groups,
            lock_config,
            metrics,
        }
    }

    /// Post an expense: validate, split, persist, then fold each share
    /// into the pairwise ledger under the scope lock.
    pub async fn post_expense(&self, request: PostExpenseRequest) -> Result<Expense> {
        let started = Instant::now();
        self.validate_scope_access(&request).await?;

        let outcome = SplitCalculator.compute(
            request.amount,
            request.split_mode,
            &request.participants,
            request.payer_id,
        )?;

        let created_at = Utc::now();
        let expense = Expense {
            id: Uuid::new_v4(),
            scope: request.scope,
            payer_id: request.payer_id,
            amount: request.amount,
            split_mode: request.split_mode,
            participants: request.participants,
            splits: outcome.splits,
            payer_share: outcome.payer_share,
            date: request.date.unwrap_or(created_at),
            created_at,
        };
        self.expenses.insert(&expense).await?;

        let lease = self
            .locks
            .acquire(
                &mutation_lock_name(expense.scope, expense.payer_id),
                self.lock_config.ttl(),
                self.lock_config.wait(),
            )
            .await?;
        let applied = self.apply_splits(&expense, &lease).await;
        self.release(&lease).await;
        applied?;

        let mut affected: BTreeSet<UserId> = expense.splits.iter().map(|s| s.user_id).collect();
        affected.insert(expense.payer_id);
        self.enqueue_invalidations(expense.scope, affected);
        self.emitter.emit(ActivityEvent::expense_added(&expense));

        self.metrics.expenses_posted.inc();
        self.metrics
            .post_expense_duration
            .observe(started.elapsed().as_secs_f64());
        info!(
            expense = %expense.id,
            scope = %expense.scope,
            payer = %expense.payer_id,
            amount = %expense.amount,
            splits = expense.splits.len(),
            "expense posted"
        );

        Ok(expense)
    }

    /// Settle part or all of one pair's outstanding balance.
    pub async fn settle(&self, request: SettleRequest) -> Result<SettlementRecord> {
        if !request.amount.is_positive() {
            return Err(EngineError::InvalidSettlement(
                "amount must be positive".into(),
            ));
        }
        if request.debtor_id == request.creditor_id {
            return Err(EngineError::InvalidSettlement(
                "debtor and creditor are the same user".into(),
            ));
        }

        let lease = self
            .locks
            .acquire(
                &mutation_lock_name(request.scope, request.debtor_id),
                self.lock_config.ttl(),
                self.lock_config.wait(),
            )
            .await?;
        let applied = self.apply_settlement(&request, &lease).await;
        self.release(&lease).await;
        let record = applied?;

        self.enqueue_invalidations(
            request.scope,
            BTreeSet::from([request.debtor_id, request.creditor_id]),
        );
        self.emitter.emit(ActivityEvent::settlement(
            request.scope,
            request.debtor_id,
            request.creditor_id,
            request.amount,
            record.id,
        ));

        self.metrics.settlements.inc();
        info!(
            scope = %request.scope,
            debtor = %request.debtor_id,
            creditor = %request.creditor_id,
            amount = %request.amount,
            "settlement applied"
        );

        Ok(record)
    }

    /// Rebuild a scope's balances from its expense and settlement logs.
    ///
    /// Replays the ordered history through the pure ledger algebra and
    /// swaps the scope's rows in one store operation. Produces the same
    /// final state the incremental writes did, which is what makes it a
    /// repair primitive for interrupted multi-split posts.
    pub async fn recompute(&self, scope: ScopeId) -> Result<()> {
        let lease = self
            .locks
            .acquire(
                &format!("scope:{scope}"),
                self.lock_config.ttl(),
                self.lock_config.wait(),
            )
            .await?;
        let result = self.recompute_locked(scope, &lease).await;
        self.release(&lease).await;
        result?;

        self.enqueue_invalidations(scope, BTreeSet::new());
        self.metrics.recomputes.inc();
        info!(scope = %scope, "scope recomputed from log");
        Ok(())
    }

    async fn validate_scope_access(&self, request: &PostExpenseRequest) -> Result<()> {
        match request.scope {
            ScopeId::Group(group_id) => {
                let group = self
                    .groups
                    .get(group_id)
                    .await?
                    .ok_or(EngineError::GroupNotFound(group_id))?;
                if group.is_deleted() {
                    return Err(EngineError::Validation(format!(
                        "group {group_id} is deleted"
                    )));
                }
                if !group.is_member(request.payer_id) {
                    return Err(EngineError::NotMember {
                        user_id: request.payer_id,
                        group_id,
                    });
                }
                Ok(())
            }
            ScopeId::Direct => {
                let has_counterparty = request
                    .participants
                    .iter()
                    .any(|p| p.user_id != request.payer_id);
                if !has_counterparty {
                    return Err(EngineError::InvalidSplit(
                        "a direct expense needs a participant besides the payer".into(),
                    ));
                }
                Ok(())
            }
        }
    }

    async fn apply_splits(&self, expense: &Expense, lease: &Lease) -> Result<()> {
        for split in &expense.splits {
            check_lease(lease)?;
            self.apply_debt(
                expense.scope,
                split.user_id,
                expense.payer_id,
                split.amount,
                Some(expense.id),
            )
            .await?;
        }
        Ok(())
    }

    /// One `add_debt` in store operations: consume the reverse pair first,
    /// then put the surplus on the forward pair.
    async fn apply_debt(
        &self,
        scope: ScopeId,
        debtor: UserId,
        creditor: UserId,
        amount: Money,
        expense_id: Option<Uuid>,
    ) -> Result<()> {
        let reverse = self
            .store
            .get_pair(scope, creditor, debtor)
            .await?
            .map(|e| e.amount)
            .unwrap_or(Money::ZERO);

        if reverse >= amount {
            self.store
                .upsert_atomic(scope, creditor, debtor, BalanceDelta::Decrement(amount), expense_id)
                .await?;
        } else {
            if reverse.is_positive() {
                self.store
                    .upsert_atomic(scope, creditor, debtor, BalanceDelta::Delete, None)
                    .await?;
            }
            self.store
                .upsert_atomic(
                    scope,
                    debtor,
                    creditor,
                    BalanceDelta::Increment(amount - reverse),
                    expense_id,
                )
                .await?;
        }
        Ok(())
    }

    async fn apply_settlement(
        &self,
        request: &SettleRequest,
        lease: &Lease,
    ) -> Result<SettlementRecord> {
        check_lease(lease)?;
        let entry = self
            .store
            .get_pair(request.scope, request.debtor_id, request.creditor_id)
            .await?
            .ok_or_else(|| {
                EngineError::InvalidSettlement(format!(
                    "{} has no outstanding balance towards {}",
                    request.debtor_id, request.creditor_id
                ))
            })?;
        if entry.amount < request.amount {
            return Err(EngineError::InvalidSettlement(format!(
                "requested {} exceeds outstanding balance {}",
                request.amount, entry.amount
            )));
        }

        check_lease(lease)?;
        self.store
            .upsert_atomic(
                request.scope,
                request.debtor_id,
                request.creditor_id,
                BalanceDelta::Decrement(request.amount),
                None,
            )
            .await?;

        let record = new_settlement_record(
            request.scope,
            request.debtor_id,
            request.creditor_id,
            request.amount,
        );
        self.settlements.insert(&record).await?;
        Ok(record)
    }

    async fn recompute_locked(&self, scope: ScopeId, lease: &Lease) -> Result<()> {
        let expenses = self.expenses.replay_log(scope).await?;
        let settlements = self.settlements.replay_log(scope).await?;

        enum ReplayOp<'a> {
            Expense(&'a Expense),
            Settlement(&'a SettlementRecord),
        }

        let mut history: Vec<(chrono::DateTime<Utc>, u8, Uuid, ReplayOp)> = Vec::new();
        for e in &expenses {
            history.push((e.created_at, 0, e.id, ReplayOp::Expense(e)));
        }
        for s in &settlements {
            history.push((s.created_at, 1, s.id, ReplayOp::Settlement(s)));
        }
        history.sort_by_key(|(at, rank, id, _)| (*at, *rank, *id));

        let mut ledger = LedgerCore::new();
        for (_, _, _, op) in &history {
            match op {
                ReplayOp::Expense(expense) => {
                    for split in &expense.splits {
                        ledger
                            .add_debt(split.user_id, expense.payer_id, split.amount)
                            .map_err(|e| {
                                EngineError::Internal(format!(
                                    "corrupt expense log for {scope}: {e}"
                                ))
                            })?;
                    }
                }
                ReplayOp::Settlement(record) => {
                    ledger
                        .settle_debt(record.debtor_id, record.creditor_id, record.amount)
                        .map_err(|e| {
                            EngineError::Internal(format!(
                                "corrupt settlement log for {scope}: {e}"
                            ))
                        })?;
                }
            }
        }

        check_lease(lease)?;
        let now = Utc::now();
        let entries: Vec<BalanceEntry> = ledger
            .entries()
            .into_iter()
            .map(|(debtor, creditor, amount)| BalanceEntry {
                scope,
                debtor,
                creditor,
                amount,
                last_expense_id: None,
                updated_at: now,
            })
            .collect();
        self.store.bulk_replace(scope, entries).await
    }

    fn enqueue_invalidations(&self, scope: ScopeId, users: BTreeSet<UserId>) {
        let mut keys = Vec::with_capacity(users.len() * 2 + 2);
        for user in users {
            keys.push(cache_keys::user_balances(user));
            keys.push(cache_keys::user_plan(user));
        }
        keys.push(cache_keys::scope_balances(scope));
        keys.push(cache_keys::scope_plan(scope));

        let request = InvalidationRequest {
            keys,
            prefixes: vec![],
        };
        match serde_json::to_value(&request) {
            Ok(payload) => {
                self.jobs
                    .enqueue(job_types::INVALIDATE_CACHE, payload, JobOptions::default());
            }
            Err(e) => warn!("failed to serialize invalidation request: {e}"),
        }
    }

    async fn release(&self, lease: &Lease) {
        if let Err(e) = self.locks.release(lease).await {
            warn!(lock = lease.name(), "lock release failed: {e}");
        }
    }
}

/// Abort once the lease has lapsed; the next holder may already be writing
fn check_lease(lease: &Lease) -> Result<()> {
    if lease.is_valid() {
        Ok(())
    } else {
        Err(EngineError::LockTimeout {
            name: lease.name().to_string(),
            waited_ms: 0,
        })
    }
}

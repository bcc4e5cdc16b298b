//! Postgres balance store
//!
//! Rows live in `balance_entries`, keyed by `(scope, debtor, creditor)`
//! with `amount` in integer minor units and a non-negativity check at the
//! schema level. Increment uses an `ON CONFLICT` upsert; decrement is
//! guarded by an `amount >= delta` predicate so a lost fencing race can
//! never drive a balance negative.

use super::{BalanceDelta, BalanceStore};
use crate::database::DbPool;
use crate::errors::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use divvy_core::{BalanceEntry, Money, ScopeId, UserId};
use tracing::info;
use uuid::Uuid;

pub struct PgBalanceStore {
    pool: DbPool,
}

#[derive(sqlx::FromRow)]
struct BalanceRow {
    scope: String,
    debtor: Uuid,
    creditor: Uuid,
    amount: i64,
    last_expense_id: Option<Uuid>,
    updated_at: DateTime<Utc>,
}

impl BalanceRow {
    fn into_entry(self) -> BalanceEntry {
        BalanceEntry {
            scope: self
                .scope
                .parse()
                .unwrap_or_else(|_| panic!("corrupt scope column: {}", self.scope)),
            debtor: UserId::from_uuid(self.debtor),
            creditor: UserId::from_uuid(self.creditor),
            amount: Money::from_cents(self.amount),
            last_expense_id: self.last_expense_id,
            updated_at: self.updated_at,
        }
    }
}

const SELECT_COLUMNS: &str =
    "scope, debtor, creditor, amount, last_expense_id, updated_at";

impl PgBalanceStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Create the balance table and its indexes if missing
    pub async fn migrate(pool: &DbPool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS balance_entries (
                scope TEXT NOT NULL,
                debtor UUID NOT NULL,
                creditor UUID NOT NULL,
                amount BIGINT NOT NULL CHECK (amount >= 0),
                last_expense_id UUID,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (scope, debtor, creditor),
                CHECK (debtor <> creditor)
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_balance_entries_debtor ON balance_entries (debtor)",
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_balance_entries_creditor ON balance_entries (creditor)",
        )
        .execute(pool)
        .await?;

        info!("balance_entries schema ready");
        Ok(())
    }
}

#[async_trait]
impl BalanceStore for PgBalanceStore {
    async fn get_pair(
        &self,
        scope: ScopeId,
        debtor: UserId,
        creditor: UserId,
    ) -> Result<Option<BalanceEntry>> {
        let row = sqlx::query_as::<_, BalanceRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM balance_entries \
             WHERE scope = $1 AND debtor = $2 AND creditor = $3 AND amount > 0"
        ))
        .bind(scope.to_string())
        .bind(debtor.as_uuid())
        .bind(creditor.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(BalanceRow::into_entry))
    }

    async fn upsert_atomic(
        &self,
        scope: ScopeId,
        debtor: UserId,
        creditor: UserId,
        delta: BalanceDelta,
        expense_id: Option<Uuid>,
    ) -> Result<()> {
        match delta {
            BalanceDelta::Increment(amount) => {
                sqlx::query(
                    r#"
                    INSERT INTO balance_entries
                        (scope, debtor, creditor, amount, last_expense_id, updated_at)
                    VALUES ($1, $2, $3, $4, $5, now())
                    ON CONFLICT (scope, debtor, creditor) DO UPDATE SET
                        amount = balance_entries.amount + EXCLUDED.amount,
                        last_expense_id = COALESCE(EXCLUDED.last_expense_id, balance_entries.last_expense_id),
                        updated_at = now()
                    "#,
                )
                .bind(scope.to_string())
                .bind(debtor.as_uuid())
                .bind(creditor.as_uuid())
                .bind(amount.cents())
                .bind(expense_id)
                .execute(&self.pool)
                .await?;
            }
            BalanceDelta::Decrement(amount) => {
                let result = sqlx::query(
                    r#"
                    UPDATE balance_entries
                    SET amount = amount - $4, updated_at = now()
                    WHERE scope = $1 AND debtor = $2 AND creditor = $3 AND amount >= $4
                    "#,
                )
                .bind(scope.to_string())
                .bind(debtor.as_uuid())
                .bind(creditor.as_uuid())
                .bind(amount.cents())
                .execute(&self.pool)
                .await?;

                assert!(
                    result.rows_affected() == 1,
                    "ledger invariant violated: decrement {amount} on missing or insufficient pair {scope}/{debtor}->{creditor}"
                );

                sqlx::query(
                    "DELETE FROM balance_entries \
                     WHERE scope = $1 AND debtor = $2 AND creditor = $3 AND amount = 0",
                )
                .bind(scope.to_string())
                .bind(debtor.as_uuid())
                .bind(creditor.as_uuid())
                .execute(&self.pool)
                .await?;
            }
            BalanceDelta::Set(amount) => {
                if amount.is_zero() {
                    self.upsert_atomic(scope, debtor, creditor, BalanceDelta::Delete, None)
                        .await?;
                } else {
                    sqlx::query(
                        r#"
                        INSERT INTO balance_entries
                            (scope, debtor, creditor, amount, last_expense_id, updated_at)
                        VALUES ($1, $2, $3, $4, $5, now())
                        ON CONFLICT (scope, debtor, creditor) DO UPDATE SET
                            amount = EXCLUDED.amount,
                            last_expense_id = EXCLUDED.last_expense_id,
                            updated_at = now()
                        "#,
                    )
                    .bind(scope.to_string())
                    .bind(debtor.as_uuid())
                    .bind(creditor.as_uuid())
                    .bind(amount.cents())
                    .bind(expense_id)
                    .execute(&self.pool)
                    .await?;
                }
            }
            BalanceDelta::Delete => {
                sqlx::query(
                    "DELETE FROM balance_entries \
                     WHERE scope = $1 AND debtor = $2 AND creditor = $3",
                )
                .bind(scope.to_string())
                .bind(debtor.as_uuid())
                .bind(creditor.as_uuid())
                .execute(&self.pool)
                .await?;
            }
        }

        Ok(())
    }

    async fn scan_by_debtor(&self, user: UserId) -> Result<Vec<BalanceEntry>> {
        let rows = sqlx::query_as::<_, BalanceRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM balance_entries \
             WHERE debtor = $1 AND amount > 0 ORDER BY scope, creditor"
        ))
        .bind(user.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(BalanceRow::into_entry).collect())
    }

    async fn scan_by_creditor(&self, user: UserId) -> Result<Vec<BalanceEntry>> {
        let rows = sqlx::query_as::<_, BalanceRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM balance_entries \
             WHERE creditor = $1 AND amount > 0 ORDER BY scope, debtor"
        ))
        .bind(user.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(BalanceRow::into_entry).collect())
    }

    async fn scan_by_scope(&self, scope: ScopeId) -> Result<Vec<BalanceEntry>> {
        let rows = sqlx::query_as::<_, BalanceRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM balance_entries \
             WHERE scope = $1 AND amount > 0 ORDER BY debtor, creditor"
        ))
        .bind(scope.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(BalanceRow::into_entry).collect())
    }

    async fn bulk_replace(&self, scope: ScopeId, entries: Vec<BalanceEntry>) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM balance_entries WHERE scope = $1")
            .bind(scope.to_string())
            .execute(&mut *tx)
            .await?;

        for entry in entries {
            if entry.amount.is_zero() {
                continue;
            }
            sqlx::query(
                r#"
                INSERT INTO balance_entries
                    (scope, debtor, creditor, amount, last_expense_id, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(entry.scope.to_string())
            .bind(entry.debtor.as_uuid())
            .bind(entry.creditor.as_uuid())
            .bind(entry.amount.cents())
            .bind(entry.last_expense_id)
            .bind(entry.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

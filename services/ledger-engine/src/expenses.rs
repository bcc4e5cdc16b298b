//! Expense and settlement records
//!
//! Expenses are immutable once stored; the registry exists for the balance
//! drill-down and as the replay log behind recompute. Settlements are
//! recorded alongside so a replay reproduces the full mutation history of
//! a scope, not just its expenses.

use crate::errors::{EngineError, Result};
use crate::models::{Cursor, Page, PageRequest, Pagination};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use divvy_core::{Expense, Money, ScopeId, UserId};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

/// One recorded settlement payment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementRecord {
    pub id: Uuid,
    pub scope: ScopeId,
    pub debtor_id: UserId,
    pub creditor_id: UserId,
    pub amount: Money,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait ExpenseRegistry: Send + Sync {
    /// Store an expense; records are never updated afterwards
    async fn insert(&self, expense: &Expense) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<Expense>>;

    /// Page through a scope's expenses, newest first
    async fn list_by_scope(&self, scope: ScopeId, page: PageRequest) -> Result<Page<Expense>>;

    /// Full expense log of a scope in `created_at` order, for replay
    async fn replay_log(&self, scope: ScopeId) -> Result<Vec<Expense>>;
}

#[async_trait]
pub trait SettlementLog: Send + Sync {
    async fn insert(&self, record: &SettlementRecord) -> Result<()>;

    /// Full settlement log of a scope in `created_at` order, for replay
    async fn replay_log(&self, scope: ScopeId) -> Result<Vec<SettlementRecord>>;
}

/// Build a page from rows already sorted newest-first.
///
/// Works on `limit + 1` fetched rows: the extra row only signals
/// `has_more`. The cursor encodes the sort value and id of the edge rows.
pub(crate) fn paginate<T>(
    mut rows: Vec<T>,
    limit: usize,
    key: impl Fn(&T) -> Cursor,
) -> Page<T> {
    let has_more = rows.len() > limit;
    rows.truncate(limit);

    let next_cursor = if has_more {
        rows.last().map(|r| key(r).encode())
    } else {
        None
    };
    let prev_cursor = rows.first().map(|r| key(r).encode());

    Page {
        data: rows,
        pagination: Pagination {
            limit,
            has_more,
            next_cursor,
            prev_cursor,
        },
    }
}

fn expense_cursor(expense: &Expense) -> Cursor {
    Cursor {
        sort_value: expense.created_at.timestamp_micros(),
        id: expense.id,
    }
}

// =========================================================================
// IN-MEMORY REGISTRY
// =========================================================================

#[derive(Default)]
pub struct MemoryExpenseRegistry {
    expenses: RwLock<Vec<Expense>>,
}

impl MemoryExpenseRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExpenseRegistry for MemoryExpenseRegistry {
    async fn insert(&self, expense: &Expense) -> Result<()> {
        let mut expenses = self.expenses.write().await;
        if expenses.iter().any(|e| e.id == expense.id) {
            return Err(EngineError::Validation(format!(
                "expense {} already stored",
                expense.id
            )));
        }
        expenses.push(expense.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Expense>> {
        let expenses = self.expenses.read().await;
        Ok(expenses.iter().find(|e| e.id == id).cloned())
    }

    async fn list_by_scope(&self, scope: ScopeId, page: PageRequest) -> Result<Page<Expense>> {
        let limit = page.effective_limit();
        let expenses = self.expenses.read().await;

        let mut in_scope: Vec<Expense> = expenses
            .iter()
            .filter(|e| e.scope == scope)
            .cloned()
            .collect();
        // newest first, id as tie-break, matching the cursor ordering
        in_scope.sort_by(|a, b| {
            (b.created_at, b.id).cmp(&(a.created_at, a.id))
        });

        if let Some(cursor) = page.cursor {
            in_scope.retain(|e| {
                let key = expense_cursor(e);
                (key.sort_value, key.id) < (cursor.sort_value, cursor.id)
            });
        }

        in_scope.truncate(limit + 1);
        Ok(paginate(in_scope, limit, expense_cursor))
    }

    async fn replay_log(&self, scope: ScopeId) -> Result<Vec<Expense>> {
        let expenses = self.expenses.read().await;
        let mut log: Vec<Expense> = expenses
            .iter()
            .filter(|e| e.scope == scope)
            .cloned()
            .collect();
        log.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(log)
    }
}

#[derive(Default)]
pub struct MemorySettlementLog {
    records: RwLock<Vec<SettlementRecord>>,
}

impl MemorySettlementLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettlementLog for MemorySettlementLog {
    async fn insert(&self, record: &SettlementRecord) -> Result<()> {
        self.records.write().await.push(record.clone());
        Ok(())
    }

    async fn replay_log(&self, scope: ScopeId) -> Result<Vec<SettlementRecord>> {
        let records = self.records.read().await;
        let mut log: Vec<SettlementRecord> = records
            .iter()
            .filter(|r| r.scope == scope)
            .cloned()
            .collect();
        log.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(log)
    }
}

// =========================================================================
// POSTGRES REGISTRY
// =========================================================================

pub struct PgExpenseRegistry {
    pool: crate::database::DbPool,
}

#[derive(sqlx::FromRow)]
struct ExpenseRow {
    id: Uuid,
    body: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl PgExpenseRegistry {
    pub fn new(pool: crate::database::DbPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(pool: &crate::database::DbPool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS expenses (
                id UUID PRIMARY KEY,
                scope TEXT NOT NULL,
                body JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_expenses_scope \
             ON expenses (scope, created_at DESC, id DESC)",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS settlements (
                id UUID PRIMARY KEY,
                scope TEXT NOT NULL,
                debtor UUID NOT NULL,
                creditor UUID NOT NULL,
                amount BIGINT NOT NULL CHECK (amount > 0),
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_settlements_scope \
             ON settlements (scope, created_at)",
        )
        .execute(pool)
        .await?;

        info!("expenses and settlements schema ready");
        Ok(())
    }

    fn row_to_expense(row: ExpenseRow) -> Result<Expense> {
        serde_json::from_value(row.body)
            .map_err(|e| EngineError::Internal(format!("corrupt expense {}: {e}", row.id)))
    }
}

#[async_trait]
impl ExpenseRegistry for PgExpenseRegistry {
    async fn insert(&self, expense: &Expense) -> Result<()> {
        let body = serde_json::to_value(expense)
            .map_err(|e| EngineError::Internal(format!("unserializable expense: {e}")))?;
        sqlx::query(
            "INSERT INTO expenses (id, scope, body, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(expense.id)
        .bind(expense.scope.to_string())
        .bind(body)
        .bind(expense.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Expense>> {
        let row = sqlx::query_as::<_, ExpenseRow>(
            "SELECT id, body, created_at FROM expenses WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_expense).transpose()
    }

    async fn list_by_scope(&self, scope: ScopeId, page: PageRequest) -> Result<Page<Expense>> {
        let limit = page.effective_limit();

        let rows = match page.cursor {
            Some(cursor) => {
                sqlx::query_as::<_, ExpenseRow>(
                    "SELECT id, body, created_at FROM expenses \
                     WHERE scope = $1 AND (created_at, id) < (to_timestamp($2::double precision / 1000000.0), $3) \
                     ORDER BY created_at DESC, id DESC LIMIT $4",
                )
                .bind(scope.to_string())
                .bind(cursor.sort_value)
                .bind(cursor.id)
                .bind((limit + 1) as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, ExpenseRow>(
                    "SELECT id, body, created_at FROM expenses \
                     WHERE scope = $1 ORDER BY created_at DESC, id DESC LIMIT $2",
                )
                .bind(scope.to_string())
                .bind((limit + 1) as i64)
                .fetch_all(&self.pool)
                .await?
            }
        };

        let expenses = rows
            .into_iter()
            .map(Self::row_to_expense)
            .collect::<Result<Vec<_>>>()?;
        Ok(paginate(expenses, limit, expense_cursor))
    }

    async fn replay_log(&self, scope: ScopeId) -> Result<Vec<Expense>> {
        let rows = sqlx::query_as::<_, ExpenseRow>(
            "SELECT id, body, created_at FROM expenses \
             WHERE scope = $1 ORDER BY created_at ASC, id ASC",
        )
        .bind(scope.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_expense).collect()
    }
}

pub struct PgSettlementLog {
    pool: crate::database::DbPool,
}

#[derive(sqlx::FromRow)]
struct SettlementRow {
    id: Uuid,
    scope: String,
    debtor: Uuid,
    creditor: Uuid,
    amount: i64,
    created_at: DateTime<Utc>,
}

impl PgSettlementLog {
    pub fn new(pool: crate::database::DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SettlementLog for PgSettlementLog {
    async fn insert(&self, record: &SettlementRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO settlements (id, scope, debtor, creditor, amount, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(record.id)
        .bind(record.scope.to_string())
        .bind(record.debtor_id.as_uuid())
        .bind(record.creditor_id.as_uuid())
        .bind(record.amount.cents())
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn replay_log(&self, scope: ScopeId) -> Result<Vec<SettlementRecord>> {
        let rows = sqlx::query_as::<_, SettlementRow>(
            "SELECT id, scope, debtor, creditor, amount, created_at FROM settlements \
             WHERE scope = $1 ORDER BY created_at ASC, id ASC",
        )
        .bind(scope.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(SettlementRecord {
                    scope: row.scope.parse().map_err(|_| {
                        EngineError::Internal(format!("corrupt scope in settlements: {}", row.scope))
                    })?,
                    id: row.id,
                    debtor_id: UserId::from_uuid(row.debtor),
                    creditor_id: UserId::from_uuid(row.creditor),
                    amount: Money::from_cents(row.amount),
                    created_at: row.created_at,
                })
            })
            .collect()
    }
}

/// Shared constructor kept close to the traits so both backends agree on it
pub fn new_settlement_record(
    scope: ScopeId,
    debtor_id: UserId,
    creditor_id: UserId,
    amount: Money,
) -> SettlementRecord {
    SettlementRecord {
        id: Uuid::new_v4(),
        scope,
        debtor_id,
        creditor_id,
        amount,
        created_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use divvy_core::{GroupId, Split, SplitMode};

    fn expense(scope: ScopeId, created_at: DateTime<Utc>) -> Expense {
        let payer = UserId::new();
        let debtor = UserId::new();
        Expense {
            id: Uuid::new_v4(),
            scope,
            payer_id: payer,
            amount: Money::from_cents(1000),
            split_mode: SplitMode::Equal,
            participants: vec![],
            splits: vec![Split {
                user_id: debtor,
                amount: Money::from_cents(500),
            }],
            payer_share: Money::from_cents(500),
            date: created_at,
            created_at,
        }
    }

    #[tokio::test]
    async fn test_insert_is_immutable() {
        let registry = MemoryExpenseRegistry::new();
        let e = expense(ScopeId::Direct, Utc::now());
        registry.insert(&e).await.unwrap();
        assert!(registry.insert(&e).await.is_err());
        assert_eq!(registry.get(e.id).await.unwrap().unwrap().id, e.id);
    }

    #[tokio::test]
    async fn test_pagination_walks_newest_first() {
        let registry = MemoryExpenseRegistry::new();
        let scope = ScopeId::Group(GroupId::new());
        let base = Utc::now();
        for i in 0..5 {
            registry
                .insert(&expense(scope, base + Duration::seconds(i)))
                .await
                .unwrap();
        }

        let first = registry
            .list_by_scope(
                scope,
                PageRequest {
                    limit: Some(2),
                    cursor: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(first.data.len(), 2);
        assert!(first.pagination.has_more);
        assert!(first.data[0].created_at > first.data[1].created_at);

        let cursor = Cursor::decode(first.pagination.next_cursor.as_ref().unwrap()).unwrap();
        let second = registry
            .list_by_scope(
                scope,
                PageRequest {
                    limit: Some(2),
                    cursor: Some(cursor),
                },
            )
            .await
            .unwrap();
        assert_eq!(second.data.len(), 2);
        assert!(second.pagination.has_more);
        // strictly older than everything on the first page
        assert!(second.data[0].created_at < first.data[1].created_at);

        let cursor = Cursor::decode(second.pagination.next_cursor.as_ref().unwrap()).unwrap();
        let third = registry
            .list_by_scope(
                scope,
                PageRequest {
                    limit: Some(2),
                    cursor: Some(cursor),
                },
            )
            .await
            .unwrap();
        assert_eq!(third.data.len(), 1);
        assert!(!third.pagination.has_more);
        assert!(third.pagination.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_replay_log_is_oldest_first() {
        let registry = MemoryExpenseRegistry::new();
        let scope = ScopeId::Group(GroupId::new());
        let base = Utc::now();
        for i in [3, 1, 2] {
            registry
                .insert(&expense(scope, base + Duration::seconds(i)))
                .await
                .unwrap();
        }

        let log = registry.replay_log(scope).await.unwrap();
        assert_eq!(log.len(), 3);
        assert!(log[0].created_at < log[1].created_at);
        assert!(log[1].created_at < log[2].created_at);
    }

    #[tokio::test]
    async fn test_settlement_log_scoped_replay() {
        let log = MemorySettlementLog::new();
        let scope = ScopeId::Group(GroupId::new());
        let record = new_settlement_record(scope, UserId::new(), UserId::new(), Money::from_cents(100));
        log.insert(&record).await.unwrap();
        log.insert(&new_settlement_record(
            ScopeId::Direct,
            UserId::new(),
            UserId::new(),
            Money::from_cents(50),
        ))
        .await
        .unwrap();

        let replay = log.replay_log(scope).await.unwrap();
        assert_eq!(replay, vec![record]);
    }
}

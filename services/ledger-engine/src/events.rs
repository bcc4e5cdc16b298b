//! Domain activity events
//!
//! Append-only records of what happened: expense added, settlement, group
//! lifecycle. Events are emitted after the authoritative write and travel
//! through the job queue, so persistence is at-least-once; the store
//! dedupes on the natural key `(type, entity, created_at_ns)`. A failed
//! emission never fails the write it describes.

use crate::errors::Result;
use crate::jobs::{job_types, JobHandler, JobOptions, JobRunner};
use crate::models::{Cursor, Page, PageRequest};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use divvy_core::{Expense, GroupId, Money, ScopeId, UserId};
use serde::{Deserialize, Serialize};
use sqlx::Row as _;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    ExpenseAdded,
    Settlement,
    GroupCreated,
    GroupDeleted,
    MemberAdded,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::ExpenseAdded => "expense_added",
            ActivityKind::Settlement => "settlement",
            ActivityKind::GroupCreated => "group_created",
            ActivityKind::GroupDeleted => "group_deleted",
            ActivityKind::MemberAdded => "member_added",
        }
    }
}

/// One immutable activity record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEvent {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: ActivityKind,
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<ScopeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expense_id: Option<Uuid>,
    /// Primary identifier of the thing the event describes; part of the
    /// dedup key
    pub entity: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub created_at_ns: i64,
}

impl ActivityEvent {
    fn new(
        kind: ActivityKind,
        user_id: UserId,
        scope: Option<ScopeId>,
        expense_id: Option<Uuid>,
        entity: String,
        payload: serde_json::Value,
    ) -> Self {
        let created_at = Utc::now();
        ActivityEvent {
            id: Uuid::new_v4(),
            kind,
            user_id,
            scope,
            expense_id,
            entity,
            payload,
            created_at,
            created_at_ns: created_at.timestamp_nanos_opt().unwrap_or(0),
        }
    }

    pub fn expense_added(expense: &Expense) -> Self {
        Self::new(
            ActivityKind::ExpenseAdded,
            expense.payer_id,
            Some(expense.scope),
            Some(expense.id),
            expense.id.to_string(),
            serde_json::json!({
                "amount": expense.amount,
                "splitMode": expense.split_mode,
                "participants": expense.splits.len() + 1,
            }),
        )
    }

    pub fn settlement(
        scope: ScopeId,
        debtor: UserId,
        creditor: UserId,
        amount: Money,
        settlement_id: Uuid,
    ) -> Self {
        Self::new(
            ActivityKind::Settlement,
            debtor,
            Some(scope),
            None,
            settlement_id.to_string(),
            serde_json::json!({
                "creditorId": creditor,
                "amount": amount,
            }),
        )
    }

    pub fn group_created(group_id: GroupId, creator: UserId, name: &str) -> Self {
        Self::new(
            ActivityKind::GroupCreated,
            creator,
            Some(ScopeId::Group(group_id)),
            None,
            group_id.to_string(),
            serde_json::json!({ "name": name }),
        )
    }

    pub fn group_deleted(group_id: GroupId, deleted_by: UserId) -> Self {
        Self::new(
            ActivityKind::GroupDeleted,
            deleted_by,
            Some(ScopeId::Group(group_id)),
            None,
            group_id.to_string(),
            serde_json::Value::Null,
        )
    }

    pub fn member_added(group_id: GroupId, member: UserId) -> Self {
        Self::new(
            ActivityKind::MemberAdded,
            member,
            Some(ScopeId::Group(group_id)),
            None,
            format!("{group_id}:{member}"),
            serde_json::Value::Null,
        )
    }

    fn dedup_key(&self) -> String {
        format!("{}:{}:{}", self.kind.as_str(), self.entity, self.created_at_ns)
    }
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append one event; a duplicate of an already-stored event is a no-op
    async fn append(&self, event: &ActivityEvent) -> Result<()>;

    /// Page through events newest-first, optionally restricted to one user
    async fn list(
        &self,
        user: Option<UserId>,
        page: PageRequest,
    ) -> Result<Page<ActivityEvent>>;
}

fn event_cursor(event: &ActivityEvent) -> Cursor {
    Cursor {
        sort_value: event.created_at_ns,
        id: event.id,
    }
}

// =========================================================================
// IN-MEMORY STORE
// =========================================================================

#[derive(Default)]
pub struct MemoryEventStore {
    events: RwLock<Vec<ActivityEvent>>,
    seen: RwLock<HashSet<String>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(&self, event: &ActivityEvent) -> Result<()> {
        let mut seen = self.seen.write().await;
        if !seen.insert(event.dedup_key()) {
            return Ok(());
        }
        self.events.write().await.push(event.clone());
        Ok(())
    }

    async fn list(
        &self,
        user: Option<UserId>,
        page: PageRequest,
    ) -> Result<Page<ActivityEvent>> {
        let limit = page.effective_limit();
        let events = self.events.read().await;

        let mut rows: Vec<ActivityEvent> = events
            .iter()
            .filter(|e| user.map_or(true, |u| e.user_id == u))
            .cloned()
            .collect();
        rows.sort_by(|a, b| (b.created_at_ns, b.id).cmp(&(a.created_at_ns, a.id)));

        if let Some(cursor) = page.cursor {
            rows.retain(|e| (e.created_at_ns, e.id) < (cursor.sort_value, cursor.id));
        }
        rows.truncate(limit + 1);
        Ok(crate::expenses::paginate(rows, limit, event_cursor))
    }
}

// =========================================================================
// POSTGRES STORE
// =========================================================================

pub struct PgEventStore {
    pool: crate::database::DbPool,
}

impl PgEventStore {
    pub fn new(pool: crate::database::DbPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(pool: &crate::database::DbPool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS activity_events (
                id UUID PRIMARY KEY,
                event_type TEXT NOT NULL,
                user_id UUID NOT NULL,
                scope TEXT,
                expense_id UUID,
                entity TEXT NOT NULL,
                payload JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                created_at_ns BIGINT NOT NULL,
                UNIQUE (event_type, entity, created_at_ns)
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_activity_events_user \
             ON activity_events (user_id, created_at DESC)",
        )
        .execute(pool)
        .await?;

        info!("activity_events schema ready");
        Ok(())
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn append(&self, event: &ActivityEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO activity_events
                (id, event_type, user_id, scope, expense_id, entity, payload, created_at, created_at_ns)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (event_type, entity, created_at_ns) DO NOTHING
            "#,
        )
        .bind(event.id)
        .bind(event.kind.as_str())
        .bind(event.user_id.as_uuid())
        .bind(event.scope.map(|s| s.to_string()))
        .bind(event.expense_id)
        .bind(&event.entity)
        .bind(&event.payload)
        .bind(event.created_at)
        .bind(event.created_at_ns)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list(
        &self,
        user: Option<UserId>,
        page: PageRequest,
    ) -> Result<Page<ActivityEvent>> {
        let limit = page.effective_limit();
        let cursor = page
            .cursor
            .unwrap_or(Cursor {
                sort_value: i64::MAX,
                id: Uuid::max(),
            });

        let rows = match user {
            Some(user) => {
                sqlx::query(
                    "SELECT id, event_type, user_id, scope, expense_id, entity, payload, created_at, created_at_ns \
                     FROM activity_events WHERE user_id = $1 AND (created_at_ns, id) < ($2, $3) \
                     ORDER BY created_at_ns DESC, id DESC LIMIT $4",
                )
                .bind(user.as_uuid())
                .bind(cursor.sort_value)
                .bind(cursor.id)
                .bind((limit + 1) as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id, event_type, user_id, scope, expense_id, entity, payload, created_at, created_at_ns \
                     FROM activity_events WHERE (created_at_ns, id) < ($1, $2) \
                     ORDER BY created_at_ns DESC, id DESC LIMIT $3",
                )
                .bind(cursor.sort_value)
                .bind(cursor.id)
                .bind((limit + 1) as i64)
                .fetch_all(&self.pool)
                .await?
            }
        };

        let events = rows.into_iter()
            .map(|row| {
                let kind = match row.get::<String, _>("event_type").as_str() {
                    "expense_added" => ActivityKind::ExpenseAdded,
                    "settlement" => ActivityKind::Settlement,
                    "group_created" => ActivityKind::GroupCreated,
                    "group_deleted" => ActivityKind::GroupDeleted,
                    "member_added" => ActivityKind::MemberAdded,
                    other => {
                        return Err(crate::errors::EngineError::Internal(format!(
                            "unknown event type in store: {other}"
                        )))
                    }
                };
                Ok(ActivityEvent {
                    id: row.get("id"),
                    kind,
                    user_id: UserId::from_uuid(row.get("user_id")),
                    scope: row
                        .get::<Option<String>, _>("scope")
                        .map(|s| {
                            s.parse().map_err(|_| {
                                crate::errors::EngineError::Internal(format!(
                                    "corrupt scope in event store: {s}"
                                ))
                            })
                        })
                        .transpose()?,
                    expense_id: row.get("expense_id"),
                    entity: row.get("entity"),
                    payload: row.get("payload"),
                    created_at: row.get("created_at"),
                    created_at_ns: row.get("created_at_ns"),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(crate::expenses::paginate(events, limit, event_cursor))
    }
}

// =========================================================================
// EMITTER
// =========================================================================

/// Hands events to the job queue for durable persistence
#[derive(Clone)]
pub struct EventEmitter {
    jobs: Arc<JobRunner>,
}

impl EventEmitter {
    pub fn new(jobs: Arc<JobRunner>) -> Self {
        Self { jobs }
    }

    /// Emit an event. Best effort: a full queue or serialization problem is
    /// logged and dropped.
    pub fn emit(&self, event: ActivityEvent) {
        match serde_json::to_value(&event) {
            Ok(payload) => {
                self.jobs
                    .enqueue(job_types::PERSIST_EVENT, payload, JobOptions::default());
            }
            Err(e) => warn!(kind = event.kind.as_str(), "failed to serialize event: {e}"),
        }
    }
}

/// Job handler that writes events into the event store
pub struct PersistEventHandler {
    store: Arc<dyn EventStore>,
}

impl PersistEventHandler {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl JobHandler for PersistEventHandler {
    async fn handle(&self, payload: &serde_json::Value) -> Result<()> {
        let event: ActivityEvent = serde_json::from_value(payload.clone())
            .map_err(|e| crate::errors::EngineError::Internal(format!("bad event payload: {e}")))?;
        self.store.append(&event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use divvy_core::GroupId;

    #[tokio::test]
    async fn test_append_dedupes_on_natural_key() {
        let store = MemoryEventStore::new();
        let event = ActivityEvent::group_created(GroupId::new(), UserId::new(), "trip");

        store.append(&event).await.unwrap();
        store.append(&event).await.unwrap();

        let listed = store.list(None, PageRequest::default()).await.unwrap();
        assert_eq!(listed.data.len(), 1);
        assert!(!listed.pagination.has_more);
    }

    #[tokio::test]
    async fn test_list_filters_by_user() {
        let store = MemoryEventStore::new();
        let (a, b) = (UserId::new(), UserId::new());
        store
            .append(&ActivityEvent::group_created(GroupId::new(), a, "x"))
            .await
            .unwrap();
        store
            .append(&ActivityEvent::group_created(GroupId::new(), b, "y"))
            .await
            .unwrap();

        let for_a = store.list(Some(a), PageRequest::default()).await.unwrap();
        assert_eq!(for_a.data.len(), 1);
        assert_eq!(for_a.data[0].user_id, a);
    }

    #[test]
    fn test_event_wire_shape() {
        let event = ActivityEvent::settlement(
            ScopeId::Direct,
            UserId::new(),
            UserId::new(),
            Money::from_cents(500),
            Uuid::new_v4(),
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "settlement");
        assert_eq!(json["scope"], "direct");
        assert!(json["payload"]["amount"].is_number());
    }

    #[test]
    fn test_member_added_entity_includes_member() {
        let group = GroupId::new();
        let user = UserId::new();
        let event = ActivityEvent::member_added(group, user);
        assert_eq!(event.entity, format!("{group}:{user}"));
    }
}

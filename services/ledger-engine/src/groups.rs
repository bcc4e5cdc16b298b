//! Group registry
//!
//! Groups bound who may post into a scope; they take no part in the
//! balance algebra itself. Members can be added but are never removed by
//! the core, and only the creator may soft-delete a group. Lifecycle
//! changes emit activity events.

use crate::errors::{EngineError, Result};
use crate::events::{ActivityEvent, EventEmitter};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use divvy_core::{Group, GroupId, UserId};
use sqlx::Row as _;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

#[async_trait]
pub trait GroupRegistry: Send + Sync {
    async fn create(&self, group: &Group) -> Result<()>;

    /// Fetch a group, soft-deleted ones included
    async fn get(&self, id: GroupId) -> Result<Option<Group>>;

    async fn add_member(&self, id: GroupId, user: UserId) -> Result<()>;

    async fn soft_delete(&self, id: GroupId, deleted_at: DateTime<Utc>) -> Result<()>;
}

// =========================================================================
// IN-MEMORY REGISTRY
// =========================================================================

#[derive(Default)]
pub struct MemoryGroupRegistry {
    groups: RwLock<HashMap<GroupId, Group>>,
}

impl MemoryGroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GroupRegistry for MemoryGroupRegistry {
    async fn create(&self, group: &Group) -> Result<()> {
        let mut groups = self.groups.write().await;
        if groups.contains_key(&group.id) {
            return Err(EngineError::Validation(format!(
                "group {} already exists",
                group.id
            )));
        }
        groups.insert(group.id, group.clone());
        Ok(())
    }

    async fn get(&self, id: GroupId) -> Result<Option<Group>> {
        Ok(self.groups.read().await.get(&id).cloned())
    }

    async fn add_member(&self, id: GroupId, user: UserId) -> Result<()> {
        let mut groups = self.groups.write().await;
        let group = groups
            .get_mut(&id)
            .ok_or(EngineError::GroupNotFound(id))?;
        group.members.insert(user);
        Ok(())
    }

    async fn soft_delete(&self, id: GroupId, deleted_at: DateTime<Utc>) -> Result<()> {
        let mut groups = self.groups.write().await;
        let group = groups
            .get_mut(&id)
            .ok_or(EngineError::GroupNotFound(id))?;
        group.deleted_at = Some(deleted_at);
        Ok(())
    }
}

// =========================================================================
// POSTGRES REGISTRY
// =========================================================================

pub struct PgGroupRegistry {
    pool: crate::database::DbPool,
}

impl PgGroupRegistry {
    pub fn new(pool: crate::database::DbPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(pool: &crate::database::DbPool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS groups (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL,
                creator_id UUID NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                deleted_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS group_members (
                group_id UUID NOT NULL REFERENCES groups(id),
                user_id UUID NOT NULL,
                PRIMARY KEY (group_id, user_id)
            )
            "#,
        )
        .execute(pool)
        .await?;

        info!("groups schema ready");
        Ok(())
    }
}

#[async_trait]
impl GroupRegistry for PgGroupRegistry {
    async fn create(&self, group: &Group) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO groups (id, name, creator_id, created_at, deleted_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(group.id.as_uuid())
        .bind(&group.name)
        .bind(group.creator_id.as_uuid())
        .bind(group.created_at)
        .bind(group.deleted_at)
        .execute(&mut *tx)
        .await?;

        for member in &group.members {
            sqlx::query(
                "INSERT INTO group_members (group_id, user_id) VALUES ($1, $2) \
                 ON CONFLICT DO NOTHING",
            )
            .bind(group.id.as_uuid())
            .bind(member.as_uuid())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, id: GroupId) -> Result<Option<Group>> {
        let Some(row) = sqlx::query(
            "SELECT id, name, creator_id, created_at, deleted_at FROM groups WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let member_rows =
            sqlx::query("SELECT user_id FROM group_members WHERE group_id = $1")
                .bind(id.as_uuid())
                .fetch_all(&self.pool)
                .await?;
        let members: BTreeSet<UserId> = member_rows
            .into_iter()
            .map(|r| UserId::from_uuid(r.get("user_id")))
            .collect();

        Ok(Some(Group {
            id: GroupId::from_uuid(row.get("id")),
            name: row.get("name"),
            creator_id: UserId::from_uuid(row.get("creator_id")),
            created_at: row.get("created_at"),
            deleted_at: row.get("deleted_at"),
            members,
        }))
    }

    async fn add_member(&self, id: GroupId, user: UserId) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO group_members (group_id, user_id) \
             SELECT $1, $2 WHERE EXISTS (SELECT 1 FROM groups WHERE id = $1) \
             ON CONFLICT DO NOTHING",
        )
        .bind(id.as_uuid())
        .bind(user.as_uuid())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // distinguish missing group from an already-present member
            let exists = sqlx::query("SELECT 1 FROM groups WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await?
                .is_some();
            if !exists {
                return Err(EngineError::GroupNotFound(id));
            }
        }
        Ok(())
    }

    async fn soft_delete(&self, id: GroupId, deleted_at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query("UPDATE groups SET deleted_at = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(deleted_at)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::GroupNotFound(id));
        }
        Ok(())
    }
}

// =========================================================================
// GROUP SERVICE
// =========================================================================

/// Group lifecycle operations with event emission
pub struct GroupService {
    registry: Arc<dyn GroupRegistry>,
    emitter: EventEmitter,
}

impl GroupService {
    pub fn new(registry: Arc<dyn GroupRegistry>, emitter: EventEmitter) -> Self {
        Self { registry, emitter }
    }

    pub fn registry(&self) -> &dyn GroupRegistry {
        self.registry.as_ref()
    }

    pub async fn create_group(
        &self,
        name: &str,
        creator_id: UserId,
        members: BTreeSet<UserId>,
    ) -> Result<Group> {
        if name.trim().is_empty() {
            return Err(EngineError::Validation("group name is empty".into()));
        }
        let mut members = members;
        members.insert(creator_id);

        let group = Group {
            id: GroupId::new(),
            name: name.trim().to_string(),
            members,
            creator_id,
            created_at: Utc::now(),
            deleted_at: None,
        };
        self.registry.create(&group).await?;
        info!(group = %group.id, creator = %creator_id, "group created");

        self.emitter
            .emit(ActivityEvent::group_created(group.id, creator_id, &group.name));
        Ok(group)
    }

    pub async fn add_member(&self, id: GroupId, user: UserId) -> Result<()> {
        let group = self
            .registry
            .get(id)
            .await?
            .ok_or(EngineError::GroupNotFound(id))?;
        if group.is_deleted() {
            return Err(EngineError::Validation(format!("group {id} is deleted")));
        }
        if group.is_member(user) {
            return Ok(());
        }

        self.registry.add_member(id, user).await?;
        self.emitter.emit(ActivityEvent::member_added(id, user));
        Ok(())
    }

    /// Soft-delete; restricted to the group's creator
    pub async fn delete_group(&self, id: GroupId, requested_by: UserId) -> Result<()> {
        let group = self
            .registry
            .get(id)
            .await?
            .ok_or(EngineError::GroupNotFound(id))?;
        if group.creator_id != requested_by {
            return Err(EngineError::Validation(format!(
                "only the creator may delete group {id}"
            )));
        }
        if group.is_deleted() {
            return Ok(());
        }

        self.registry.soft_delete(id, Utc::now()).await?;
        self.emitter
            .emit(ActivityEvent::group_deleted(id, requested_by));
        Ok(())
    }
}

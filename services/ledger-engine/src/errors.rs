use divvy_core::{GroupId, UserId};
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Service errors
///
/// Each variant maps to a stable wire slug via [`EngineError::slug`]; the
/// slugs are part of the public contract. Cache and job failures are
/// internal-only: they are logged and swallowed, never returned from a user
/// operation.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid split: {0}")]
    InvalidSplit(String),

    #[error("user {user_id} is not a member of group {group_id}")]
    NotMember { user_id: UserId, group_id: GroupId },

    #[error("invalid settlement: {0}")]
    InvalidSettlement(String),

    #[error("could not acquire lock {name} within {waited_ms}ms")]
    LockTimeout { name: String, waited_ms: u64 },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("background job failed: {0}")]
    JobFailed(String),

    #[error("group not found: {0}")]
    GroupNotFound(GroupId),

    #[error("expense not found: {0}")]
    ExpenseNotFound(Uuid),

    #[error("invalid pagination cursor")]
    InvalidCursor,

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Stable error slug for the wire contract
    pub fn slug(&self) -> &'static str {
        match self {
            EngineError::InvalidSplit(_) => "invalid_split",
            EngineError::NotMember { .. } => "not_member",
            EngineError::InvalidSettlement(_) => "invalid_settlement",
            EngineError::LockTimeout { .. } => "lock_timeout",
            EngineError::StoreUnavailable(_) => "store_unavailable",
            EngineError::CacheUnavailable(_) => "cache_unavailable",
            EngineError::JobFailed(_) => "job_failed",
            EngineError::GroupNotFound(_) => "group_not_found",
            EngineError::ExpenseNotFound(_) => "expense_not_found",
            EngineError::InvalidCursor => "invalid_cursor",
            EngineError::Configuration(_) => "configuration",
            EngineError::Validation(_) => "validation",
            EngineError::Internal(_) => "internal",
        }
    }

    /// Suggested retry-after, in seconds, for retryable failures
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            EngineError::LockTimeout { .. } => Some(1),
            EngineError::StoreUnavailable(_) => Some(5),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::StoreUnavailable(err.to_string())
    }
}

impl From<redis::RedisError> for EngineError {
    fn from(err: redis::RedisError) -> Self {
        EngineError::CacheUnavailable(err.to_string())
    }
}

impl From<divvy_core::Error> for EngineError {
    fn from(err: divvy_core::Error) -> Self {
        match err {
            divvy_core::Error::InvalidSplit(msg) => EngineError::InvalidSplit(msg),
            divvy_core::Error::InsufficientBalance {
                requested,
                available,
            } => EngineError::InvalidSettlement(format!(
                "requested {requested} exceeds outstanding balance {available}"
            )),
            other => EngineError::Validation(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugs_are_stable() {
        assert_eq!(EngineError::InvalidSplit("x".into()).slug(), "invalid_split");
        assert_eq!(
            EngineError::LockTimeout {
                name: "scope:g".into(),
                waited_ms: 5000
            }
            .slug(),
            "lock_timeout"
        );
        assert_eq!(
            EngineError::StoreUnavailable("down".into()).slug(),
            "store_unavailable"
        );
        assert_eq!(
            EngineError::InvalidSettlement("x".into()).slug(),
            "invalid_settlement"
        );
    }

    #[test]
    fn test_retry_after_only_for_retryable() {
        assert_eq!(
            EngineError::LockTimeout {
                name: "n".into(),
                waited_ms: 1
            }
            .retry_after(),
            Some(1)
        );
        assert_eq!(EngineError::InvalidSplit("x".into()).retry_after(), None);
    }

    #[test]
    fn test_insufficient_balance_maps_to_invalid_settlement() {
        let domain = divvy_core::Error::InsufficientBalance {
            requested: divvy_core::Money::from_cents(600),
            available: divvy_core::Money::from_cents(500),
        };
        let engine: EngineError = domain.into();
        assert_eq!(engine.slug(), "invalid_settlement");
    }
}

//! Wire models
//!
//! Request/response shapes for the service boundary and the cursor
//! pagination used on expense and activity listings. All amounts on the
//! wire are integer cents; decimal formatting belongs to the presentation
//! layer.

use crate::errors::{EngineError, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use divvy_core::{Money, Participant, ScopeId, SplitMode, UserId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const PAGE_LIMIT_DEFAULT: usize = 20;
pub const PAGE_LIMIT_MAX: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostExpenseRequest {
    pub scope: ScopeId,
    pub payer_id: UserId,
    pub amount: Money,
    pub split_mode: SplitMode,
    pub participants: Vec<Participant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleRequest {
    pub scope: ScopeId,
    pub debtor_id: UserId,
    pub creditor_id: UserId,
    pub amount: Money,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterpartyAmount {
    pub user_id: UserId,
    pub amount: Money,
}

/// Aggregated cross-scope view of one user's position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserBalancesView {
    pub owes: Vec<CounterpartyAmount>,
    pub owed: Vec<CounterpartyAmount>,
    pub total_owes: Money,
    pub total_owed: Money,
    pub net_balance: Money,
}

/// Uniform error body; `error` carries the stable slug
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl From<&EngineError> for ErrorResponse {
    fn from(err: &EngineError) -> Self {
        ErrorResponse {
            error: err.slug().to_string(),
            message: Some(err.to_string()),
            retry_after: err.retry_after(),
        }
    }
}

// =========================================================================
// PAGINATION
// =========================================================================

/// Position in a sorted listing: the sort value plus the row id as a
/// tie-break
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    pub sort_value: i64,
    pub id: Uuid,
}

impl Cursor {
    /// Opaque wire form: url-safe base64 over the JSON encoding
    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    pub fn decode(raw: &str) -> Result<Cursor> {
        let bytes = URL_SAFE_NO_PAD
            .decode(raw)
            .map_err(|_| EngineError::InvalidCursor)?;
        serde_json::from_slice(&bytes).map_err(|_| EngineError::InvalidCursor)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PageRequest {
    pub limit: Option<usize>,
    pub cursor: Option<Cursor>,
}

impl PageRequest {
    pub fn effective_limit(&self) -> usize {
        self.limit
            .unwrap_or(PAGE_LIMIT_DEFAULT)
            .clamp(1, PAGE_LIMIT_MAX)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub limit: usize,
    pub has_more: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub pagination: Pagination,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_roundtrip() {
        let cursor = Cursor {
            sort_value: 1_700_000_000_000,
            id: Uuid::new_v4(),
        };
        let encoded = cursor.encode();
        assert!(!encoded.contains('='));
        assert_eq!(Cursor::decode(&encoded).unwrap(), cursor);
    }

    #[test]
    fn test_cursor_rejects_garbage() {
        assert!(matches!(
            Cursor::decode("not base64!!").unwrap_err(),
            EngineError::InvalidCursor
        ));
        let valid_b64 = URL_SAFE_NO_PAD.encode(b"{\"nope\":1}");
        assert!(matches!(
            Cursor::decode(&valid_b64).unwrap_err(),
            EngineError::InvalidCursor
        ));
    }

    #[test]
    fn test_page_limit_clamping() {
        assert_eq!(PageRequest::default().effective_limit(), 20);
        assert_eq!(
            PageRequest {
                limit: Some(0),
                cursor: None
            }
            .effective_limit(),
            1
        );
        assert_eq!(
            PageRequest {
                limit: Some(500),
                cursor: None
            }
            .effective_limit(),
            100
        );
    }

    #[test]
    fn test_post_expense_request_wire_names() {
        let json = serde_json::json!({
            "scope": "direct",
            "payerId": Uuid::new_v4(),
            "amount": 1000,
            "splitMode": "equal",
            "participants": [{"userId": Uuid::new_v4()}],
        });
        let req: PostExpenseRequest = serde_json::from_value(json).unwrap();
        assert_eq!(req.scope, ScopeId::Direct);
        assert_eq!(req.amount, Money::from_cents(1000));
        assert_eq!(req.split_mode, SplitMode::Equal);
        assert!(req.date.is_none());
    }

    #[test]
    fn test_error_response_carries_slug_and_retry() {
        let err = EngineError::LockTimeout {
            name: "scope:g".into(),
            waited_ms: 5000,
        };
        let body = ErrorResponse::from(&err);
        assert_eq!(body.error, "lock_timeout");
        assert_eq!(body.retry_after, Some(1));
        assert!(body.message.is_some());
    }
}

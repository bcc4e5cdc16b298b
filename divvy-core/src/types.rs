//! Core domain types shared across the ledger
//!
//! Identifiers are opaque UUIDs. A `ScopeId` selects an independent
//! sub-ledger: either a group or the reserved `direct` scope for balances
//! between two users outside any group.

use crate::money::Money;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque user identifier
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct UserId(Uuid);

impl UserId {
    pub fn new() -> Self {
        UserId(Uuid::new_v4())
    }

    pub const fn from_uuid(id: Uuid) -> Self {
        UserId(id)
    }

    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque group identifier
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct GroupId(Uuid);

impl GroupId {
    pub fn new() -> Self {
        GroupId(Uuid::new_v4())
    }

    pub const fn from_uuid(id: Uuid) -> Self {
        GroupId(id)
    }

    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for GroupId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The reserved wire literal for the direct scope
pub const DIRECT_SCOPE: &str = "direct";

/// An independent sub-ledger: a group, or direct user-to-user balances
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ScopeId {
    Group(GroupId),
    Direct,
}

impl ScopeId {
    pub const fn is_direct(&self) -> bool {
        matches!(self, ScopeId::Direct)
    }

    pub const fn group_id(&self) -> Option<GroupId> {
        match self {
            ScopeId::Group(id) => Some(*id),
            ScopeId::Direct => None,
        }
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeId::Group(id) => id.fmt(f),
            ScopeId::Direct => f.write_str(DIRECT_SCOPE),
        }
    }
}

impl FromStr for ScopeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case(DIRECT_SCOPE) {
            Ok(ScopeId::Direct)
        } else {
            Uuid::parse_str(s).map(|id| ScopeId::Group(GroupId::from_uuid(id)))
        }
    }
}

impl Serialize for ScopeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ScopeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// How an expense amount is divided among participants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitMode {
    Equal,
    Exact,
    Percentage,
}

/// One participant of an expense, with mode-specific inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exact_amount: Option<Money>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent_bp: Option<u32>,
}

impl Participant {
    pub fn of(user_id: UserId) -> Self {
        Participant {
            user_id,
            exact_amount: None,
            percent_bp: None,
        }
    }

    pub fn exact(user_id: UserId, amount: Money) -> Self {
        Participant {
            user_id,
            exact_amount: Some(amount),
            percent_bp: None,
        }
    }

    pub fn percent(user_id: UserId, bp: u32) -> Self {
        Participant {
            user_id,
            exact_amount: None,
            percent_bp: Some(bp),
        }
    }
}

/// A derived per-debtor share of an expense; never names the payer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Split {
    pub user_id: UserId,
    pub amount: Money,
}

/// An immutable expense record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Expense {
    pub id: Uuid,
    pub scope: ScopeId,
    pub payer_id: UserId,
    pub amount: Money,
    pub split_mode: SplitMode,
    pub participants: Vec<Participant>,
    /// Derived debts, excluding the payer; each strictly positive.
    /// `Σ splits + payer_share = amount` exactly.
    pub splits: Vec<Split>,
    pub payer_share: Money,
    pub date: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// One row of the pairwise balance ledger
///
/// Key is `(scope, debtor, creditor)`. Rows with a zero amount must not
/// exist; a pair and its reverse are never both positive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceEntry {
    pub scope: ScopeId,
    pub debtor: UserId,
    pub creditor: UserId,
    pub amount: Money,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_expense_id: Option<Uuid>,
    pub updated_at: DateTime<Utc>,
}

/// An expense-sharing group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub members: BTreeSet<UserId>,
    pub creator_id: UserId,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Group {
    pub fn is_member(&self, user: UserId) -> bool {
        self.members.contains(&user)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_id_roundtrip() {
        let group = ScopeId::Group(GroupId::new());
        let s = group.to_string();
        assert_eq!(s.parse::<ScopeId>().unwrap(), group);

        assert_eq!("direct".parse::<ScopeId>().unwrap(), ScopeId::Direct);
        assert_eq!("DIRECT".parse::<ScopeId>().unwrap(), ScopeId::Direct);
        assert!("not-a-scope".parse::<ScopeId>().is_err());
    }

    #[test]
    fn test_scope_id_serde() {
        assert_eq!(
            serde_json::to_string(&ScopeId::Direct).unwrap(),
            "\"direct\""
        );
        let gid = GroupId::new();
        let json = serde_json::to_string(&ScopeId::Group(gid)).unwrap();
        assert_eq!(json, format!("\"{gid}\""));
        let back: ScopeId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ScopeId::Group(gid));
    }

    #[test]
    fn test_split_mode_wire_names() {
        assert_eq!(serde_json::to_string(&SplitMode::Equal).unwrap(), "\"equal\"");
        assert_eq!(
            serde_json::to_string(&SplitMode::Percentage).unwrap(),
            "\"percentage\""
        );
        let mode: SplitMode = serde_json::from_str("\"exact\"").unwrap();
        assert_eq!(mode, SplitMode::Exact);
    }

    #[test]
    fn test_group_membership() {
        let creator = UserId::new();
        let other = UserId::new();
        let group = Group {
            id: GroupId::new(),
            name: "trip".into(),
            members: BTreeSet::from([creator, other]),
            creator_id: creator,
            created_at: Utc::now(),
            deleted_at: None,
        };
        assert!(group.is_member(other));
        assert!(!group.is_member(UserId::new()));
        assert!(!group.is_deleted());
    }
}

//! Pure domain algebra for the divvy shared-expense ledger
//!
//! This crate holds everything that needs no I/O: fixed-point money, split
//! calculation, the pairwise debt algebra with mutual-debt simplification,
//! and the greedy settlement planner. The `ledger-engine` service crate
//! layers storage, locking, caching and orchestration on top.

pub mod error;
pub mod ledger;
pub mod money;
pub mod planner;
pub mod split;
pub mod types;

// Re-exports
pub use error::{Error, Result};
pub use ledger::LedgerCore;
pub use money::Money;
pub use planner::{SettlementPlanner, Transfer};
pub use split::{SplitCalculator, SplitOutcome};
pub use types::{
    BalanceEntry, Expense, Group, GroupId, Participant, ScopeId, Split, SplitMode, UserId,
    DIRECT_SCOPE,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Error types for the domain algebra

use crate::money::Money;
use thiserror::Error;

/// Result type for domain operations
pub type Result<T> = std::result::Result<T, Error>;

/// Domain errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Split input rejected (bad totals, empty participants, etc.)
    #[error("invalid split: {0}")]
    InvalidSplit(String),

    /// Debt mutation rejected (self-debt, non-positive delta)
    #[error("invalid debt: {0}")]
    InvalidDebt(String),

    /// Settlement larger than the outstanding pair balance
    #[error("insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance {
        requested: Money,
        available: Money,
    },

    /// Integer arithmetic left the representable range
    #[error("amount overflow")]
    Overflow,

    /// Malformed monetary value
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
}

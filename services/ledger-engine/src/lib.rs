// Ledger Engine Library
// Shared-expense settlement core: stores, locks, cache, jobs and orchestration

pub mod aggregation;
pub mod cache;
pub mod config;
pub mod database;
pub mod errors;
pub mod events;
pub mod expenses;
pub mod groups;
pub mod jobs;
pub mod locks;
pub mod metrics;
pub mod models;
pub mod service;
pub mod store;

// Re-exports
pub use aggregation::{AggregationService, PlanTarget};
pub use cache::CacheLayer;
pub use config::Config;
pub use errors::{EngineError, Result};
pub use jobs::JobRunner;
pub use service::LedgerService;
pub use store::{BalanceDelta, BalanceStore};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const SERVICE_NAME: &str = "ledger-engine";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_service_name() {
        assert_eq!(SERVICE_NAME, "ledger-engine");
    }
}

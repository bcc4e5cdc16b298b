//! Metrics collection for observability
//!
//! Prometheus counters and histograms for the write paths. Each instance
//! carries its own registry so the service can expose it without touching
//! the process-global default.

use prometheus::{Histogram, HistogramOpts, IntCounter, Opts, Registry};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    /// Expenses accepted by the write path
    pub expenses_posted: IntCounter,

    /// Settlements applied
    pub settlements: IntCounter,

    /// Scope recomputes executed
    pub recomputes: IntCounter,

    /// Post-expense latency
    pub post_expense_duration: Histogram,

    pub registry: Arc<Registry>,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let expenses_posted = IntCounter::with_opts(Opts::new(
            "ledger_expenses_posted_total",
            "Expenses accepted by the write path",
        ))?;
        registry.register(Box::new(expenses_posted.clone()))?;

        let settlements = IntCounter::with_opts(Opts::new(
            "ledger_settlements_total",
            "Settlements applied",
        ))?;
        registry.register(Box::new(settlements.clone()))?;

        let recomputes = IntCounter::with_opts(Opts::new(
            "ledger_recomputes_total",
            "Scope recomputes executed",
        ))?;
        registry.register(Box::new(recomputes.clone()))?;

        let post_expense_duration = Histogram::with_opts(
            HistogramOpts::new(
                "ledger_post_expense_duration_seconds",
                "Post-expense latency",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0]),
        )?;
        registry.register(Box::new(post_expense_duration.clone()))?;

        Ok(Self {
            expenses_posted,
            settlements,
            recomputes,
            post_expense_duration,
            registry,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("metrics registry construction cannot fail")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.expenses_posted.get(), 0);
        assert_eq!(metrics.settlements.get(), 0);
    }

    #[test]
    fn test_counters_increment() {
        let metrics = Metrics::new().unwrap();
        metrics.expenses_posted.inc();
        metrics.expenses_posted.inc();
        metrics.settlements.inc();
        assert_eq!(metrics.expenses_posted.get(), 2);
        assert_eq!(metrics.settlements.get(), 1);
    }

    #[test]
    fn test_instances_are_independent() {
        let first = Metrics::new().unwrap();
        let second = Metrics::new().unwrap();
        first.expenses_posted.inc();
        assert_eq!(second.expenses_posted.get(), 0);
    }
}

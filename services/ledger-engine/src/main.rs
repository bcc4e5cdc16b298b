// Ledger Engine - service entrypoint
//
// Wires config, store, cache, locks and the job runner together and keeps
// the service alive until ctrl-c. HTTP routing lives in the gateway, not
// here.

use ledger_engine::cache::{CacheLayer, InvalidateCacheHandler};
use ledger_engine::config::{Config, LockBackend};
use ledger_engine::database;
use ledger_engine::events::{EventEmitter, PersistEventHandler, PgEventStore};
use ledger_engine::expenses::{PgExpenseRegistry, PgSettlementLog};
use ledger_engine::groups::PgGroupRegistry;
use ledger_engine::jobs::{job_types, JobRunner};
use ledger_engine::locks::{LockService, ProcessLockService, RedisLockService};
use ledger_engine::metrics::Metrics;
use ledger_engine::service::LedgerService;
use ledger_engine::store::PgBalanceStore;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting {} v{}", ledger_engine::SERVICE_NAME, ledger_engine::VERSION);

    let config = Config::from_env()?;

    let pool = database::create_pool(&config.store).await?;
    PgBalanceStore::migrate(&pool).await?;
    PgExpenseRegistry::migrate(&pool).await?;
    PgGroupRegistry::migrate(&pool).await?;
    PgEventStore::migrate(&pool).await?;

    let redis = match &config.cache.url {
        Some(url) => {
            let client = redis::Client::open(url.as_str())?;
            Some(redis::aio::ConnectionManager::new(client).await?)
        }
        None => {
            info!("CACHE_URL not set, running without cache");
            None
        }
    };

    let cache = match redis.clone() {
        Some(conn) => CacheLayer::new(conn, config.cache.ttl_seconds),
        None => CacheLayer::disabled(),
    };

    let locks: Arc<dyn LockService> = match config.locks.backend {
        LockBackend::Process => Arc::new(ProcessLockService::new()),
        LockBackend::Distributed => {
            let conn = redis
                .clone()
                .expect("validated by Config: distributed locks require CACHE_URL");
            Arc::new(RedisLockService::new(conn))
        }
    };

    let jobs = Arc::new(JobRunner::start(config.jobs.clone()));
    jobs.register(
        job_types::INVALIDATE_CACHE,
        Arc::new(InvalidateCacheHandler::new(cache.clone())),
    )
    .await;
    jobs.register(
        job_types::PERSIST_EVENT,
        Arc::new(PersistEventHandler::new(Arc::new(PgEventStore::new(
            pool.clone(),
        )))),
    )
    .await;

    let emitter = EventEmitter::new(jobs.clone());
    let service = LedgerService::new(
        Arc::new(PgBalanceStore::new(pool.clone())),
        locks,
        jobs.clone(),
        emitter,
        Arc::new(PgExpenseRegistry::new(pool.clone())),
        Arc::new(PgSettlementLog::new(pool.clone())),
        Arc::new(PgGroupRegistry::new(pool)),
        config.locks.clone(),
        Metrics::default(),
    );

    info!("ledger-engine ready");
    tokio::signal::ctrl_c().await?;

    info!("shutting down");
    drop(service);
    if let Ok(jobs) = Arc::try_unwrap(jobs) {
        jobs.shutdown().await;
    }
    Ok(())
}

use crate::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub store: StoreConfig,
    pub cache: CacheConfig,
    pub locks: LockConfig,
    pub jobs: JobConfig,
    /// More than one instance of the service will run against the store
    pub multi_instance: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Absent URL disables the cache layer entirely
    pub url: Option<String>,
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockBackend {
    Process,
    Distributed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    pub backend: LockBackend,
    pub ttl_ms: u64,
    pub wait_ms: u64,
}

impl LockConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub max_attempts: u32,
    pub concurrency: usize,
    pub attempt_timeout_ms: u64,
    /// Base unit for the 2^attempt backoff; one second in production
    pub backoff_base_ms: u64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            concurrency: 5,
            attempt_timeout_ms: 30_000,
            backoff_base_ms: 1_000,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let store_url = env::var("STORE_URL")
            .map_err(|_| EngineError::Configuration("STORE_URL is required".to_string()))?;

        let lock_backend = match env::var("LOCK_BACKEND").as_deref() {
            Ok("distributed") => LockBackend::Distributed,
            Ok("process") | Err(_) => LockBackend::Process,
            Ok(other) => {
                return Err(EngineError::Configuration(format!(
                    "unknown LOCK_BACKEND: {other}"
                )))
            }
        };

        let config = Config {
            store: StoreConfig {
                url: store_url,
                max_connections: parse_env("STORE_MAX_CONNECTIONS", 20)?,
                min_connections: parse_env("STORE_MIN_CONNECTIONS", 5)?,
            },
            cache: CacheConfig {
                url: env::var("CACHE_URL").ok(),
                ttl_seconds: parse_env("CACHE_TTL_SECONDS", 300)?,
            },
            locks: LockConfig {
                backend: lock_backend,
                ttl_ms: parse_env("LOCK_TTL_MS", 10_000)?,
                wait_ms: parse_env("LOCK_WAIT_MS", 5_000)?,
            },
            jobs: JobConfig {
                max_attempts: parse_env("JOB_MAX_ATTEMPTS", 3)?,
                concurrency: parse_env("JOB_CONCURRENCY", 5)?,
                attempt_timeout_ms: parse_env("JOB_ATTEMPT_TIMEOUT_MS", 30_000)?,
                backoff_base_ms: 1_000,
            },
            multi_instance: env::var("MULTI_INSTANCE")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot uphold the locking contract.
    ///
    /// A process-local lock only serializes writers inside one instance, so
    /// multi-instance deployments must use the distributed backend.
    pub fn validate(&self) -> Result<()> {
        if self.multi_instance && self.locks.backend == LockBackend::Process {
            return Err(EngineError::Configuration(
                "multi-instance deployment requires LOCK_BACKEND=distributed".to_string(),
            ));
        }
        if self.locks.backend == LockBackend::Distributed && self.cache.url.is_none() {
            return Err(EngineError::Configuration(
                "LOCK_BACKEND=distributed requires CACHE_URL".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| EngineError::Configuration(format!("invalid {name}: {raw}"))),
        Err(_) => Ok(default),
    }
}

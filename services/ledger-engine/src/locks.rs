//! Named exclusive locks with TTL and fencing
//!
//! Every scope mutation runs under a named lock: `scope:{group_id}` for
//! group ledgers, `direct:{payer_id}` for direct balances. A lease carries
//! a fencing token and its expiry; holders revalidate the lease before each
//! store mutation and abort once it has lapsed, so a holder that outlives
//! its TTL can never write over a newer holder.
//!
//! Acquisition polls with growing, jittered delays bounded by the caller's
//! wait budget. Fair queueing is not provided; the jitter is what prevents
//! livelock under contention.
//!
//! The process backend serializes writers within one instance only, which
//! is why multi-instance deployments are refused without the distributed
//! (Redis) backend.

use crate::errors::{EngineError, Result};
use async_trait::async_trait;
use rand::Rng;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Granted hold on a named lock
#[derive(Debug, Clone)]
pub struct Lease {
    name: String,
    token: u64,
    expires_at: Instant,
}

impl Lease {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Monotonic fencing token; larger tokens are newer holders
    pub fn token(&self) -> u64 {
        self.token
    }

    /// Whether the holder may still act under this lease
    pub fn is_valid(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

#[async_trait]
pub trait LockService: Send + Sync {
    /// Acquire `name` exclusively, waiting at most `wait`
    async fn acquire(&self, name: &str, ttl: Duration, wait: Duration) -> Result<Lease>;

    /// Release a lease. Idempotent; an expired or superseded lease is
    /// silently ignored.
    async fn release(&self, lease: &Lease) -> Result<()>;

    /// Push the lease expiry out by `ttl`; fails if the lease was lost
    async fn extend(&self, lease: &mut Lease, ttl: Duration) -> Result<()>;
}

/// Poll delay for the nth acquisition attempt: doubling base with jitter
fn poll_delay(attempt: u32) -> Duration {
    let base_ms = (10u64 << attempt.min(4)).min(200);
    let jitter_ms = rand::thread_rng().gen_range(0..=base_ms / 2);
    Duration::from_millis(base_ms + jitter_ms)
}

// =========================================================================
// PROCESS-LOCAL BACKEND
// =========================================================================

struct HeldLock {
    token: u64,
    expires_at: Instant,
}

/// In-process lock table; valid only for single-instance deployments
#[derive(Default)]
pub struct ProcessLockService {
    held: Mutex<HashMap<String, HeldLock>>,
    fence: AtomicU64,
}

impl ProcessLockService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockService for ProcessLockService {
    async fn acquire(&self, name: &str, ttl: Duration, wait: Duration) -> Result<Lease> {
        let deadline = Instant::now() + wait;
        let mut attempt = 0u32;

        loop {
            {
                let mut held = self.held.lock().await;
                let now = Instant::now();
                let free = match held.get(name) {
                    None => true,
                    // A holder past its TTL has lost the lock
                    Some(h) => h.expires_at <= now,
                };
                if free {
                    let token = self.fence.fetch_add(1, Ordering::SeqCst) + 1;
                    let expires_at = now + ttl;
                    held.insert(name.to_string(), HeldLock { token, expires_at });
                    debug!(lock = name, token, "lock acquired");
                    return Ok(Lease {
                        name: name.to_string(),
                        token,
                        expires_at,
                    });
                }
            }

            if Instant::now() >= deadline {
                return Err(EngineError::LockTimeout {
                    name: name.to_string(),
                    waited_ms: wait.as_millis() as u64,
                });
            }
            tokio::time::sleep(poll_delay(attempt)).await;
            attempt += 1;
        }
    }

    async fn release(&self, lease: &Lease) -> Result<()> {
        let mut held = self.held.lock().await;
        if let Some(current) = held.get(&lease.name) {
            if current.token == lease.token {
                held.remove(&lease.name);
                debug!(lock = %lease.name, token = lease.token, "lock released");
            }
        }
        Ok(())
    }

    async fn extend(&self, lease: &mut Lease, ttl: Duration) -> Result<()> {
        let mut held = self.held.lock().await;
        match held.get_mut(&lease.name) {
            Some(current) if current.token == lease.token && current.expires_at > Instant::now() => {
                let expires_at = Instant::now() + ttl;
                current.expires_at = expires_at;
                lease.expires_at = expires_at;
                Ok(())
            }
            _ => Err(EngineError::LockTimeout {
                name: lease.name.clone(),
                waited_ms: 0,
            }),
        }
    }
}

// =========================================================================
// DISTRIBUTED (REDIS) BACKEND
// =========================================================================

const FENCE_COUNTER_KEY: &str = "locks:fence";

const RELEASE_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('pexpire', KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Redis-backed lock service for multi-instance deployments
pub struct RedisLockService {
    redis: ConnectionManager,
}

impl RedisLockService {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    fn key(name: &str) -> String {
        format!("lock:{name}")
    }

    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<u64>> {
        let mut conn = self.redis.clone();
        let token: u64 = redis::cmd("INCR")
            .arg(FENCE_COUNTER_KEY)
            .query_async(&mut conn)
            .await?;

        let granted: Option<String> = redis::cmd("SET")
            .arg(Self::key(name))
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;

        Ok(granted.map(|_| token))
    }
}

#[async_trait]
impl LockService for RedisLockService {
    async fn acquire(&self, name: &str, ttl: Duration, wait: Duration) -> Result<Lease> {
        let deadline = Instant::now() + wait;
        let mut attempt = 0u32;

        loop {
            if let Some(token) = self.try_acquire(name, ttl).await? {
                debug!(lock = name, token, "distributed lock acquired");
                return Ok(Lease {
                    name: name.to_string(),
                    token,
                    expires_at: Instant::now() + ttl,
                });
            }

            if Instant::now() >= deadline {
                return Err(EngineError::LockTimeout {
                    name: name.to_string(),
                    waited_ms: wait.as_millis() as u64,
                });
            }
            tokio::time::sleep(poll_delay(attempt)).await;
            attempt += 1;
        }
    }

    async fn release(&self, lease: &Lease) -> Result<()> {
        let mut conn = self.redis.clone();
        let released: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(Self::key(&lease.name))
            .arg(lease.token.to_string())
            .invoke_async(&mut conn)
            .await?;
        if released == 0 {
            // Already expired or taken over; release stays silent
            warn!(lock = %lease.name, token = lease.token, "released lock no longer held");
        }
        Ok(())
    }

    async fn extend(&self, lease: &mut Lease, ttl: Duration) -> Result<()> {
        let mut conn = self.redis.clone();
        let extended: i64 = redis::Script::new(EXTEND_SCRIPT)
            .key(Self::key(&lease.name))
            .arg(lease.token.to_string())
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        if extended == 0 {
            return Err(EngineError::LockTimeout {
                name: lease.name.clone(),
                waited_ms: 0,
            });
        }
        lease.expires_at = Instant::now() + ttl;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_millis(500);

    #[tokio::test]
    async fn test_acquire_and_release() {
        let locks = ProcessLockService::new();
        let lease = locks
            .acquire("scope:g1", TTL, Duration::from_millis(100))
            .await
            .unwrap();
        assert!(lease.is_valid());
        locks.release(&lease).await.unwrap();

        // released name is immediately reacquirable
        let again = locks
            .acquire("scope:g1", TTL, Duration::from_millis(100))
            .await
            .unwrap();
        assert!(again.token() > lease.token());
    }

    #[tokio::test]
    async fn test_contention_times_out() {
        let locks = ProcessLockService::new();
        let _held = locks
            .acquire("scope:g1", Duration::from_secs(5), Duration::from_millis(50))
            .await
            .unwrap();

        let err = locks
            .acquire("scope:g1", TTL, Duration::from_millis(120))
            .await
            .unwrap_err();
        assert_eq!(err.slug(), "lock_timeout");
    }

    #[tokio::test]
    async fn test_different_names_do_not_contend() {
        let locks = ProcessLockService::new();
        let a = locks
            .acquire("scope:g1", TTL, Duration::from_millis(50))
            .await
            .unwrap();
        let b = locks
            .acquire("scope:g2", TTL, Duration::from_millis(50))
            .await
            .unwrap();
        assert_ne!(a.token(), b.token());
    }

    #[tokio::test]
    async fn test_expired_holder_loses_lock() {
        let locks = ProcessLockService::new();
        let stale = locks
            .acquire("scope:g1", Duration::from_millis(30), Duration::from_millis(50))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!stale.is_valid());

        // a new holder steals the expired lock with a newer token
        let fresh = locks
            .acquire("scope:g1", TTL, Duration::from_millis(200))
            .await
            .unwrap();
        assert!(fresh.token() > stale.token());

        // the stale holder's release must not evict the new holder
        locks.release(&stale).await.unwrap();
        let err = locks
            .acquire("scope:g1", TTL, Duration::from_millis(80))
            .await
            .unwrap_err();
        assert_eq!(err.slug(), "lock_timeout");
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let locks = ProcessLockService::new();
        let lease = locks
            .acquire("scope:g1", TTL, Duration::from_millis(50))
            .await
            .unwrap();
        locks.release(&lease).await.unwrap();
        locks.release(&lease).await.unwrap();
    }

    #[tokio::test]
    async fn test_extend_pushes_expiry() {
        let locks = ProcessLockService::new();
        let mut lease = locks
            .acquire("scope:g1", Duration::from_millis(80), Duration::from_millis(50))
            .await
            .unwrap();

        locks.extend(&mut lease, Duration::from_secs(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(lease.is_valid());
    }

    #[tokio::test]
    async fn test_extend_fails_after_loss() {
        let locks = ProcessLockService::new();
        let mut lease = locks
            .acquire("scope:g1", Duration::from_millis(20), Duration::from_millis(50))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let err = locks.extend(&mut lease, TTL).await.unwrap_err();
        assert_eq!(err.slug(), "lock_timeout");
    }
}

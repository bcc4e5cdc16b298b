//! Background job execution
//!
//! An in-process queue for work that must not block or fail a user
//! operation: cache invalidation, activity-event persistence,
//! notifications. Delivery is at-least-once and handlers are required to
//! be idempotent. Failed attempts retry with exponential backoff
//! (`2^attempt` times the base, capped, with jitter); a job that exhausts
//! its attempts is marked failed and logged, never surfaced to the request
//! that enqueued it.

use crate::config::JobConfig;
use crate::errors::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Job types used by the ledger core
pub mod job_types {
    pub const INVALIDATE_CACHE: &str = "invalidate_cache";
    pub const PERSIST_EVENT: &str = "persist_event";
    pub const NOTIFY: &str = "notify";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub attempt: u32,
    pub max_attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JobOptions {
    /// Override the runner's default attempt budget
    pub max_attempts: Option<u32>,
    /// Hold the job back before its first attempt
    pub delay: Option<Duration>,
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, payload: &serde_json::Value) -> Result<()>;
}

#[derive(Default)]
pub struct JobStats {
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
}

impl JobStats {
    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::SeqCst)
    }
}

struct Inner {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
    config: JobConfig,
    semaphore: Arc<Semaphore>,
    stats: JobStats,
}

pub struct JobRunner {
    tx: mpsc::UnboundedSender<Job>,
    inner: Arc<Inner>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl JobRunner {
    /// Start the dispatcher and its worker pool
    pub fn start(config: JobConfig) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let inner = Arc::new(Inner {
            handlers: RwLock::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(config.concurrency)),
            config,
            stats: JobStats::default(),
        });

        let dispatcher_inner = inner.clone();
        let dispatcher = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let Ok(permit) = dispatcher_inner.semaphore.clone().acquire_owned().await else {
                    break;
                };
                let inner = dispatcher_inner.clone();
                tokio::spawn(async move {
                    run_job(inner, job).await;
                    drop(permit);
                });
            }
        });

        JobRunner {
            tx,
            inner,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    pub async fn register(&self, job_type: &str, handler: Arc<dyn JobHandler>) {
        self.inner
            .handlers
            .write()
            .await
            .insert(job_type.to_string(), handler);
    }

    /// Queue a job. Never fails the caller; enqueue problems are logged.
    pub fn enqueue(&self, job_type: &str, payload: serde_json::Value, options: JobOptions) {
        let job = Job {
            id: Uuid::new_v4(),
            job_type: job_type.to_string(),
            payload,
            attempt: 0,
            max_attempts: options
                .max_attempts
                .unwrap_or(self.inner.config.max_attempts)
                .max(1),
            enqueued_at: Utc::now(),
        };

        match options.delay {
            Some(delay) => {
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if tx.send(job).is_err() {
                        warn!("job queue closed before delayed job could run");
                    }
                });
            }
            None => {
                if self.tx.send(job).is_err() {
                    warn!(job_type, "job queue closed, dropping job");
                }
            }
        }
    }

    pub fn stats(&self) -> &JobStats {
        &self.inner.stats
    }

    /// Stop accepting jobs and wait for in-flight work to finish
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Some(handle) = self.dispatcher.lock().await.take() {
            let _ = handle.await;
        }
        // every worker slot free means every dispatched job completed
        let _ = self
            .inner
            .semaphore
            .acquire_many(self.inner.config.concurrency as u32)
            .await;
    }
}

async fn run_job(inner: Arc<Inner>, mut job: Job) {
    let handler = inner.handlers.read().await.get(&job.job_type).cloned();
    let Some(handler) = handler else {
        error!(job_type = %job.job_type, job_id = %job.id, "no handler registered, job failed");
        inner.stats.failed.fetch_add(1, Ordering::SeqCst);
        return;
    };

    let attempt_timeout = Duration::from_millis(inner.config.attempt_timeout_ms);
    loop {
        job.attempt += 1;
        let outcome = tokio::time::timeout(attempt_timeout, handler.handle(&job.payload)).await;

        match outcome {
            Ok(Ok(())) => {
                debug!(job_type = %job.job_type, job_id = %job.id, attempt = job.attempt, "job succeeded");
                inner.stats.succeeded.fetch_add(1, Ordering::SeqCst);
                return;
            }
            Ok(Err(e)) => {
                warn!(
                    job_type = %job.job_type,
                    job_id = %job.id,
                    attempt = job.attempt,
                    max_attempts = job.max_attempts,
                    "job attempt failed: {e}"
                );
            }
            Err(_) => {
                warn!(
                    job_type = %job.job_type,
                    job_id = %job.id,
                    attempt = job.attempt,
                    "job attempt timed out after {attempt_timeout:?}"
                );
            }
        }

        if job.attempt >= job.max_attempts {
            error!(
                job_type = %job.job_type,
                job_id = %job.id,
                attempts = job.attempt,
                "job failed permanently"
            );
            inner.stats.failed.fetch_add(1, Ordering::SeqCst);
            return;
        }

        inner.stats.retried.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(backoff_delay(inner.config.backoff_base_ms, job.attempt)).await;
    }
}

/// `base * 2^attempt` capped at one minute, with 10% jitter against
/// thundering herds
fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << attempt.min(16));
    let capped = exp.min(60_000);
    let jitter = rand::thread_rng().gen_range(0..=capped / 10);
    Duration::from_millis(capped + jitter)
}

//! Sequence Allocation
//!
//! Hands out the next sequence of a tenant together with the hash it must
//! link to. Allocation for a tenant is serialized by an in-process lock
//! held until the allocated event is committed or rejected; across
//! processes the store's conditional append is the final arbiter.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::audit::event::GENESIS_HASH;
use crate::config::WriterConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::store::LedgerStore;

/// Exponential backoff with full jitter.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    pub fn from_config(config: &WriterConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
        )
    }

    /// Upper bound of the delay after `attempt` failures (1-based).
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// A random delay in `[0, ceiling(attempt)]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt).as_millis() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
    }

    pub async fn wait(&self, attempt: u32) {
        tokio::time::sleep(self.delay(attempt)).await;
    }
}

/// Per-tenant async locks.
///
/// Entries nobody holds or waits on are dropped whenever a new tenant is
/// added, so the map only tracks tenants with work in flight.
#[derive(Default)]
pub struct TenantLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TenantLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for `tenant_id`'s lock. Other tenants are never blocked.
    pub async fn acquire(&self, tenant_id: &str) -> OwnedMutexGuard<()> {
        self.lock_for(tenant_id).await.lock_owned().await
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }

    async fn lock_for(&self, tenant_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        if let Some(lock) = locks.get(tenant_id) {
            return lock.clone();
        }

        // Clones are only taken under the map lock, so a count of one
        // means the entry is idle.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        let lock = Arc::new(Mutex::new(()));
        locks.insert(tenant_id.to_string(), lock.clone());
        lock
    }
}

/// A reserved chain position. The tenant stays locked until this is
/// dropped.
#[derive(Debug)]
pub struct Allocation {
    pub tenant_id: String,
    pub sequence: u64,
    pub prev_hash: String,
    pub prev_timestamp: Option<DateTime<Utc>>,
    _guard: OwnedMutexGuard<()>,
}

pub struct SequenceAllocator {
    store: Arc<dyn LedgerStore>,
    locks: TenantLocks,
    backoff: Backoff,
    max_attempts: u32,
}

impl SequenceAllocator {
    pub fn new(store: Arc<dyn LedgerStore>, config: &WriterConfig) -> Self {
        Self {
            store,
            locks: TenantLocks::new(),
            backoff: Backoff::from_config(config),
            max_attempts: config.max_attempts.max(1),
        }
    }

    /// Reserve the next sequence for `tenant_id`.
    ///
    /// Waits for any in-flight write of the same tenant, then reads the
    /// committed mark. Storage errors are retried with backoff and surface
    /// as `AllocationUnavailable` once attempts run out.
    pub async fn next_sequence(&self, tenant_id: &str) -> LedgerResult<Allocation> {
        let guard = self.locks.acquire(tenant_id).await;

        let mut attempt = 0;
        let head = loop {
            attempt += 1;
            match self.store.head(tenant_id).await {
                Ok(head) => break head,
                Err(e) if attempt < self.max_attempts => {
                    warn!(
                        "Reading mark for {} failed (attempt {}/{}): {}",
                        tenant_id, attempt, self.max_attempts, e
                    );
                    self.backoff.wait(attempt).await;
                }
                Err(e) => {
                    return Err(LedgerError::AllocationUnavailable(format!(
                        "tenant {} after {} attempts: {}",
                        tenant_id, attempt, e
                    )));
                }
            }
        };

        let allocation = match head {
            Some(head) => Allocation {
                tenant_id: tenant_id.to_string(),
                sequence: head.sequence + 1,
                prev_hash: head.event_hash,
                prev_timestamp: Some(head.timestamp),
                _guard: guard,
            },
            None => Allocation {
                tenant_id: tenant_id.to_string(),
                sequence: 1,
                prev_hash: GENESIS_HASH.to_string(),
                prev_timestamp: None,
                _guard: guard,
            },
        };

        debug!("Allocated {}#{}", tenant_id, allocation.sequence);
        Ok(allocation)
    }
}

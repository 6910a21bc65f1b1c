//! Chain Writer
//!
//! Records events: allocate the next position, stamp and seal the event,
//! persist it. Once a position is allocated the commit runs on its own task,
//! so a caller that gives up early never leaves the tenant mid-write.

use chrono::{DateTime, Duration as ChronoDuration, SubsecRound, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::audit::allocator::{Allocation, Backoff, SequenceAllocator};
use crate::audit::clock::Clock;
use crate::audit::event::{AuditEvent, NewEvent};
use crate::config::WriterConfig;
use crate::crypto::SigningKey;
use crate::error::{LedgerError, LedgerResult};
use crate::store::LedgerStore;

/// Millisecond timestamp for the next event: never earlier than one
/// millisecond after its predecessor, whatever the wall clock says.
pub fn next_timestamp(now: DateTime<Utc>, prev: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = now.trunc_subsecs(3);
    match prev {
        Some(prev) => now.max(prev + ChronoDuration::milliseconds(1)),
        None => now,
    }
}

pub struct ChainWriter {
    store: Arc<dyn LedgerStore>,
    allocator: SequenceAllocator,
    key: SigningKey,
    clock: Arc<dyn Clock>,
    config: WriterConfig,
    backoff: Backoff,
}

impl ChainWriter {
    pub fn new(store: Arc<dyn LedgerStore>, key: SigningKey, clock: Arc<dyn Clock>, config: WriterConfig) -> Self {
        Self {
            allocator: SequenceAllocator::new(store.clone(), &config),
            backoff: Backoff::from_config(&config),
            store,
            key,
            clock,
            config,
        }
    }

    /// Record with the configured timeout.
    pub async fn record(&self, draft: NewEvent) -> LedgerResult<AuditEvent> {
        self.record_with_timeout(draft, self.config.timeout()).await
    }

    /// Record an event, giving up with `WriteTimeout` if no position could be
    /// allocated before `timeout` elapses.
    pub async fn record_with_timeout(&self, draft: NewEvent, timeout: Duration) -> LedgerResult<AuditEvent> {
        draft.validate()?;
        let draft = Arc::new(draft);
        let deadline = Instant::now() + timeout;
        let max_attempts = self.config.max_attempts.max(1);

        let mut attempt = 0;
        loop {
            attempt += 1;

            let allocation =
                match tokio::time::timeout_at(deadline, self.allocator.next_sequence(&draft.tenant_id)).await {
                    Ok(allocation) => allocation?,
                    Err(_) => {
                        warn!("Timed out allocating a sequence for {}", draft.tenant_id);
                        return Err(LedgerError::WriteTimeout(timeout.as_millis() as u64));
                    }
                };

            let commit = Commit {
                store: self.store.clone(),
                key: self.key.clone(),
                clock: self.clock.clone(),
                backoff: self.backoff,
                max_attempts,
            };
            let draft_for_task = draft.clone();
            let task = tokio::spawn(async move { commit.run(&draft_for_task, allocation).await });

            match task.await {
                Ok(Ok(event)) => {
                    info!("Recorded {}", event.summary());
                    return Ok(event);
                }
                Ok(Err(LedgerError::WriteConflict(reason))) if attempt < max_attempts => {
                    // Another process moved the mark; take a fresh position.
                    warn!(
                        "Write conflict for {} (attempt {}/{}): {}",
                        draft.tenant_id, attempt, max_attempts, reason
                    );
                    self.backoff.wait(attempt).await;
                }
                Ok(Err(e)) => return Err(e),
                Err(e) => return Err(LedgerError::Storage(format!("commit task failed: {}", e))),
            }
        }
    }
}

/// Everything the detached commit task needs.
struct Commit {
    store: Arc<dyn LedgerStore>,
    key: SigningKey,
    clock: Arc<dyn Clock>,
    backoff: Backoff,
    max_attempts: u32,
}

impl Commit {
    /// Seal and persist. The allocation (and the tenant lock) is released
    /// when this returns.
    async fn run(self, draft: &NewEvent, allocation: Allocation) -> LedgerResult<AuditEvent> {
        let timestamp = next_timestamp(self.clock.now(), allocation.prev_timestamp);
        let event = draft.seal(allocation.sequence, &allocation.prev_hash, timestamp, &self.key)?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.append(&event).await {
                Ok(()) => return Ok(event),
                Err(LedgerError::WriteConflict(reason)) => {
                    // A retried append may already have landed.
                    if attempt > 1 && self.committed(&event).await {
                        return Ok(event);
                    }
                    return Err(LedgerError::WriteConflict(reason));
                }
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    if self.committed(&event).await {
                        return Ok(event);
                    }
                    debug!(
                        "Retrying append of {} (attempt {}/{}): {}",
                        event.summary(),
                        attempt,
                        self.max_attempts,
                        e
                    );
                    self.backoff.wait(attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn committed(&self, event: &AuditEvent) -> bool {
        matches!(
            self.store.get_event(&event.tenant_id, event.sequence).await,
            Ok(Some(stored)) if stored.event_hash == event.event_hash
        )
    }
}

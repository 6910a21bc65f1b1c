//! Signed Checkpoints
//!
//! Periodically seals a tenant's chain: a rolling digest over the event
//! hashes since the previous checkpoint, signed with the checkpoint key and
//! linked to the previous checkpoint's digest. Checkpoints let verification
//! run in independent chunks and let an exported bundle prove where it sits
//! in the chain.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::audit::allocator::TenantLocks;
use crate::audit::clock::Clock;
use crate::audit::event::{millis_rfc3339, AuditEvent, GENESIS_HASH};
use crate::config::CheckpointConfig;
use crate::crypto::SigningKey;
use crate::error::{LedgerError, LedgerResult};
use crate::store::LedgerStore;

/// A signed seal over `[from_sequence, upto_sequence]` of one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditCheckpoint {
    pub tenant_id: String,
    pub from_sequence: u64,
    pub upto_sequence: u64,
    pub entry_count: u64,
    /// Digest of the previous checkpoint, or the genesis sentinel.
    pub prev_digest: String,
    pub digest: String,
    pub signature: String,
    #[serde(with = "millis_rfc3339")]
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SignedFields<'a> {
    tenant_id: &'a str,
    from_sequence: u64,
    upto_sequence: u64,
    entry_count: u64,
    prev_digest: &'a str,
    digest: &'a str,
    #[serde(with = "millis_rfc3339")]
    created_at: DateTime<Utc>,
}

impl AuditCheckpoint {
    /// Canonical bytes covered by `signature`.
    pub fn signing_payload(&self) -> LedgerResult<Vec<u8>> {
        let fields = SignedFields {
            tenant_id: &self.tenant_id,
            from_sequence: self.from_sequence,
            upto_sequence: self.upto_sequence,
            entry_count: self.entry_count,
            prev_digest: &self.prev_digest,
            digest: &self.digest,
            created_at: self.created_at,
        };
        Ok(serde_json::to_vec(&fields)?)
    }

    pub fn verify_signature(&self, key: &SigningKey) -> bool {
        match self.signing_payload() {
            Ok(payload) => key.verify(&payload, &self.signature),
            Err(_) => false,
        }
    }

    /// Whether `[from, to]` fully contains this checkpoint's range.
    pub fn within(&self, from: u64, to: u64) -> bool {
        self.from_sequence >= from && self.upto_sequence <= to
    }
}

/// Rolling SHA-256 over hex event hashes: `d = SHA256(d || h)` per event,
/// starting from `seed`.
pub fn fold_digest<'a, I>(seed: &str, hashes: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    hashes.into_iter().fold(seed.to_string(), |acc, hash| {
        let mut hasher = Sha256::new();
        hasher.update(acc.as_bytes());
        hasher.update(hash.as_bytes());
        hex::encode(hasher.finalize())
    })
}

/// Digest of a run of events, seeded with the previous checkpoint digest.
pub fn digest_events(seed: &str, events: &[AuditEvent]) -> String {
    fold_digest(seed, events.iter().map(|e| e.event_hash.as_str()))
}

/// Per-tenant record of checkpoint attempts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointHealth {
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
}

/// Creates checkpoints on demand or from the background scheduler.
pub struct CheckpointManager {
    store: Arc<dyn LedgerStore>,
    key: SigningKey,
    config: CheckpointConfig,
    clock: Arc<dyn Clock>,
    health: RwLock<HashMap<String, CheckpointHealth>>,
    // One checkpoint in flight per tenant in this process; the store key
    // catches the rest.
    create_locks: TenantLocks,
}

impl CheckpointManager {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        key: SigningKey,
        config: CheckpointConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            key,
            config,
            clock,
            health: RwLock::new(HashMap::new()),
            create_locks: TenantLocks::new(),
        }
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    /// Create a checkpoint if the count or time trigger has fired.
    pub async fn maybe_checkpoint(&self, tenant_id: &str) -> LedgerResult<Option<AuditCheckpoint>> {
        let _guard = self.create_locks.acquire(tenant_id).await;
        let result = self.create(tenant_id, false).await;
        self.record_outcome(tenant_id, &result).await
    }

    /// Seal everything not yet covered, regardless of triggers.
    pub async fn checkpoint_now(&self, tenant_id: &str) -> LedgerResult<Option<AuditCheckpoint>> {
        let _guard = self.create_locks.acquire(tenant_id).await;
        let result = self.create(tenant_id, true).await;
        self.record_outcome(tenant_id, &result).await
    }

    async fn create(&self, tenant_id: &str, force: bool) -> LedgerResult<Option<AuditCheckpoint>> {
        let Some(head) = self.store.head(tenant_id).await? else {
            return Ok(None);
        };
        let last = self.store.last_checkpoint(tenant_id).await?;
        let covered = last.as_ref().map(|c| c.upto_sequence).unwrap_or(0);

        if head.sequence <= covered {
            debug!("No new events for {} since checkpoint {}", tenant_id, covered);
            return Ok(None);
        }

        let now = self.clock.now();
        let from = covered + 1;

        if !force {
            let pending = head.sequence - covered;
            let due_by_count = pending >= self.config.every_events;

            let since = match &last {
                Some(checkpoint) => checkpoint.created_at,
                None => self
                    .store
                    .get_event(tenant_id, from)
                    .await?
                    .map(|e| e.timestamp)
                    .unwrap_or(head.timestamp),
            };
            let due_by_time = now.signed_duration_since(since).num_milliseconds()
                >= self.config.interval().as_millis() as i64;

            if !due_by_count && !due_by_time {
                return Ok(None);
            }
        }

        let events = self.store.events_in_range(tenant_id, from, head.sequence).await?;
        let contiguous = events
            .iter()
            .enumerate()
            .all(|(offset, e)| e.sequence == from + offset as u64);
        if !contiguous || events.len() as u64 != head.sequence - covered {
            return Err(LedgerError::CheckpointFailure(format!(
                "tenant {} range {}..={} is not contiguous",
                tenant_id, from, head.sequence
            )));
        }

        let prev_digest = last
            .map(|c| c.digest)
            .unwrap_or_else(|| GENESIS_HASH.to_string());

        let mut checkpoint = AuditCheckpoint {
            tenant_id: tenant_id.to_string(),
            from_sequence: from,
            upto_sequence: head.sequence,
            entry_count: events.len() as u64,
            digest: digest_events(&prev_digest, &events),
            prev_digest,
            signature: String::new(),
            created_at: now.trunc_subsecs(3),
        };
        checkpoint.signature = self.key.sign(&checkpoint.signing_payload()?);

        self.store.insert_checkpoint(&checkpoint).await?;

        info!(
            "Created checkpoint for {}: sequences {}..={} ({} events)",
            tenant_id, checkpoint.from_sequence, checkpoint.upto_sequence, checkpoint.entry_count
        );
        Ok(Some(checkpoint))
    }

    async fn record_outcome(
        &self,
        tenant_id: &str,
        result: &LedgerResult<Option<AuditCheckpoint>>,
    ) -> LedgerResult<Option<AuditCheckpoint>> {
        let now = self.clock.now();
        let mut health = self.health.write().await;
        let entry = health.entry(tenant_id.to_string()).or_default();

        match result {
            Ok(checkpoint) => {
                if checkpoint.is_some() {
                    entry.last_success_at = Some(now);
                }
                entry.consecutive_failures = 0;
                entry.last_error = None;
                Ok(checkpoint.clone())
            }
            Err(e) => {
                entry.consecutive_failures += 1;
                entry.last_error = Some(e.to_string());
                entry.last_failure_at = Some(now);
                warn!(
                    "Checkpoint for {} failed ({} in a row): {}",
                    tenant_id, entry.consecutive_failures, e
                );
                Err(match e {
                    LedgerError::CheckpointFailure(msg) => LedgerError::CheckpointFailure(msg.clone()),
                    other => LedgerError::CheckpointFailure(other.to_string()),
                })
            }
        }
    }

    pub async fn failure_state(&self, tenant_id: &str) -> CheckpointHealth {
        self.health
            .read()
            .await
            .get(tenant_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Recompute a stored checkpoint's digest from the events it covers.
    pub async fn recompute_digest(&self, checkpoint: &AuditCheckpoint) -> LedgerResult<String> {
        let events = self
            .store
            .events_in_range(&checkpoint.tenant_id, checkpoint.from_sequence, checkpoint.upto_sequence)
            .await?;
        Ok(digest_events(&checkpoint.prev_digest, &events))
    }

    /// One scheduler pass over every tenant. Returns checkpoints created.
    pub async fn run_once(&self) -> usize {
        let tenants = match self.store.list_tenants().await {
            Ok(tenants) => tenants,
            Err(e) => {
                warn!("Checkpoint pass could not list tenants: {}", e);
                return 0;
            }
        };

        let mut created = 0;
        for tenant_id in tenants {
            // Failures are recorded in health and retried next tick.
            if let Ok(Some(_)) = self.maybe_checkpoint(&tenant_id).await {
                created += 1;
            }
        }
        created
    }

    /// Run the scheduler until `shutdown` flips to `true` or is dropped.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.poll_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                "Checkpoint scheduler started (every {} events or {}s)",
                self.config.every_events, self.config.interval_secs
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let created = self.run_once().await;
                        if created > 0 {
                            debug!("Checkpoint pass created {} checkpoints", created);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Checkpoint scheduler stopped");
        })
    }
}

//! Audit Ledger
//!
//! The public face of the ledger: record, verify, export and report on a
//! tenant's chain. Wires the writer, verifier, checkpoint manager and export
//! gateway over one store and one pair of keys.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audit::{
    AuditCheckpoint, AuditEvent, ChainVerifier, ChainWriter, CheckpointManager, Clock,
    EntryVerification, ExportBundle, ExportGateway, IntegrityFailure, NewEvent, SystemClock,
    VerificationReport,
};
use crate::config::LedgerConfig;
use crate::crypto::LedgerKeys;
use crate::error::{LedgerError, LedgerResult};
use crate::store::LedgerStore;

/// Events sampled by `summary` for its integrity spot check.
pub const SUMMARY_SAMPLE_SIZE: u64 = 100;

/// Operational facts about one tenant's chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerHealth {
    pub tenant_id: String,
    pub last_sequence: u64,
    pub last_checkpoint_sequence: Option<u64>,
    /// Milliseconds since the last checkpoint was created.
    pub last_checkpoint_age_ms: Option<i64>,
    pub events_since_checkpoint: u64,
    pub checkpoint_failures: u32,
    pub last_checkpoint_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegritySample {
    pub verified: bool,
    pub sampled_events: u64,
    pub issues: Vec<IntegrityFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerSummary {
    pub tenant_id: String,
    pub total_events: u64,
    pub last_sequence: u64,
    pub last_timestamp: Option<DateTime<Utc>>,
    pub checkpoint_count: u64,
    pub integrity: IntegritySample,
}

pub struct AuditLedger {
    store: Arc<dyn LedgerStore>,
    writer: ChainWriter,
    verifier: ChainVerifier,
    checkpoints: Arc<CheckpointManager>,
    exports: ExportGateway,
    clock: Arc<dyn Clock>,
}

impl AuditLedger {
    pub fn new(store: Arc<dyn LedgerStore>, config: &LedgerConfig) -> LedgerResult<Self> {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn LedgerStore>, config: &LedgerConfig, clock: Arc<dyn Clock>) -> LedgerResult<Self> {
        config.validate()?;
        let keys = LedgerKeys::from_config(&config.keys)?;

        Ok(Self {
            writer: ChainWriter::new(store.clone(), keys.event.clone(), clock.clone(), config.writer.clone()),
            verifier: ChainVerifier::new(store.clone(), keys.clone()),
            checkpoints: Arc::new(CheckpointManager::new(
                store.clone(),
                keys.checkpoint.clone(),
                config.checkpoint.clone(),
                clock.clone(),
            )),
            exports: ExportGateway::new(store.clone(), keys.checkpoint, clock.clone()),
            store,
            clock,
        })
    }

    /// Append an event to its tenant's chain.
    pub async fn record(&self, draft: NewEvent) -> LedgerResult<AuditEvent> {
        let event = self.writer.record(draft).await?;
        self.nudge_checkpoint(&event);
        Ok(event)
    }

    pub async fn record_with_timeout(&self, draft: NewEvent, timeout: Duration) -> LedgerResult<AuditEvent> {
        let event = self.writer.record_with_timeout(draft, timeout).await?;
        self.nudge_checkpoint(&event);
        Ok(event)
    }

    /// Evaluate checkpoint triggers off the write path once enough events
    /// have accumulated.
    fn nudge_checkpoint(&self, event: &AuditEvent) {
        let config = self.checkpoints.config();
        if !config.enabled || event.sequence % config.every_events != 0 {
            return;
        }

        let manager = self.checkpoints.clone();
        let tenant_id = event.tenant_id.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.maybe_checkpoint(&tenant_id).await {
                debug!("Checkpoint after write deferred to scheduler: {}", e);
            }
        });
    }

    pub async fn verify(&self, tenant_id: &str, from: u64, to: u64) -> LedgerResult<VerificationReport> {
        self.verifier.verify(tenant_id, from, to).await
    }

    /// Verify the whole chain up to the current head.
    pub async fn verify_all(&self, tenant_id: &str) -> LedgerResult<VerificationReport> {
        let to = self.last_sequence(tenant_id).await?;
        if to == 0 {
            return Err(LedgerError::NotFound(format!("tenant {} has no events", tenant_id)));
        }
        self.verifier.verify(tenant_id, 1, to).await
    }

    pub async fn verify_entry(&self, tenant_id: &str, sequence: u64) -> LedgerResult<EntryVerification> {
        self.verifier.verify_entry(tenant_id, sequence).await
    }

    pub async fn export(&self, tenant_id: &str, from: u64, to: u64, requester: &str) -> LedgerResult<ExportBundle> {
        self.exports.export(tenant_id, from, to, requester).await
    }

    pub async fn export_since_last(&self, tenant_id: &str, requester: &str) -> LedgerResult<ExportBundle> {
        self.exports.export_since_last(tenant_id, requester).await
    }

    pub async fn checkpoint_now(&self, tenant_id: &str) -> LedgerResult<Option<AuditCheckpoint>> {
        self.checkpoints.checkpoint_now(tenant_id).await
    }

    pub fn checkpoint_manager(&self) -> Arc<CheckpointManager> {
        self.checkpoints.clone()
    }

    async fn last_sequence(&self, tenant_id: &str) -> LedgerResult<u64> {
        Ok(self.store.head(tenant_id).await?.map(|h| h.sequence).unwrap_or(0))
    }

    pub async fn health(&self, tenant_id: &str) -> LedgerResult<LedgerHealth> {
        let last_sequence = self.last_sequence(tenant_id).await?;
        let last_checkpoint = self.store.last_checkpoint(tenant_id).await?;
        let failures = self.checkpoints.failure_state(tenant_id).await;
        let now = self.clock.now();

        let covered = last_checkpoint.as_ref().map(|c| c.upto_sequence).unwrap_or(0);

        Ok(LedgerHealth {
            tenant_id: tenant_id.to_string(),
            last_sequence,
            last_checkpoint_sequence: last_checkpoint.as_ref().map(|c| c.upto_sequence),
            last_checkpoint_age_ms: last_checkpoint
                .as_ref()
                .map(|c| now.signed_duration_since(c.created_at).num_milliseconds()),
            events_since_checkpoint: last_sequence.saturating_sub(covered),
            checkpoint_failures: failures.consecutive_failures,
            last_checkpoint_error: failures.last_error,
        })
    }

    /// Counts plus an integrity spot check over the most recent events.
    pub async fn summary(&self, tenant_id: &str) -> LedgerResult<LedgerSummary> {
        let head = self.store.head(tenant_id).await?;
        let total_events = self.store.count_events(tenant_id).await?;
        let checkpoint_count = self.store.count_checkpoints(tenant_id).await?;

        let integrity = match &head {
            Some(head) => {
                let from = head.sequence.saturating_sub(SUMMARY_SAMPLE_SIZE - 1).max(1);
                let report = self.verifier.verify(tenant_id, from, head.sequence).await?;
                IntegritySample {
                    verified: report.verified,
                    sampled_events: report.checked,
                    issues: report.findings,
                }
            }
            None => IntegritySample {
                verified: true,
                sampled_events: 0,
                issues: Vec::new(),
            },
        };

        Ok(LedgerSummary {
            tenant_id: tenant_id.to_string(),
            total_events,
            last_sequence: head.as_ref().map(|h| h.sequence).unwrap_or(0),
            last_timestamp: head.map(|h| h.timestamp),
            checkpoint_count,
            integrity,
        })
    }

    /// Start the background checkpoint scheduler, if enabled.
    pub fn spawn_checkpoint_scheduler(&self, shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        if !self.checkpoints.config().enabled {
            warn!("Checkpoint scheduler disabled by configuration");
            return None;
        }
        info!("Starting checkpoint scheduler");
        Some(self.checkpoints.clone().spawn(shutdown))
    }
}

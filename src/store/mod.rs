//! Event Store
//!
//! Durable, append-only persistence for events, checkpoints and export
//! manifests, partitioned by tenant.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::checkpoint::AuditCheckpoint;
use crate::audit::event::AuditEvent;
use crate::audit::export::ExportRecord;
use crate::error::LedgerResult;

pub use memory::MemoryLedgerStore;

/// A tenant's committed high-water mark: the last sequence together with
/// the hash and timestamp the next event must link to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainHead {
    pub sequence: u64,
    pub event_hash: String,
    pub timestamp: DateTime<Utc>,
}

impl From<&AuditEvent> for ChainHead {
    fn from(event: &AuditEvent) -> Self {
        Self {
            sequence: event.sequence,
            event_hash: event.event_hash.clone(),
            timestamp: event.timestamp,
        }
    }
}

/// Storage backend for the ledger.
///
/// Implementations must be thread-safe and provide:
/// - `append` as a conditional write: it succeeds only when `event.sequence`
///   is exactly one past the tenant's committed mark and the
///   `(tenant_id, sequence)` key is free, otherwise `WriteConflict`
/// - reads that observe committed records only
/// - no update or delete path for events or checkpoints
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Latest committed event for a tenant, read as one consistent unit.
    async fn head(&self, tenant_id: &str) -> LedgerResult<Option<ChainHead>>;

    /// Conditionally persist the next event of a tenant's chain.
    async fn append(&self, event: &AuditEvent) -> LedgerResult<()>;

    async fn get_event(&self, tenant_id: &str, sequence: u64) -> LedgerResult<Option<AuditEvent>>;

    /// The stored event with the highest sequence below `sequence`.
    async fn event_before(&self, tenant_id: &str, sequence: u64) -> LedgerResult<Option<AuditEvent>>;

    /// Events with `from <= sequence <= to`, ascending. Rows are returned as
    /// stored; missing or repeated sequences are left for the verifier.
    async fn events_in_range(&self, tenant_id: &str, from: u64, to: u64) -> LedgerResult<Vec<AuditEvent>>;

    async fn count_events(&self, tenant_id: &str) -> LedgerResult<u64>;

    /// Every tenant with at least one committed event.
    async fn list_tenants(&self) -> LedgerResult<Vec<String>>;

    async fn last_checkpoint(&self, tenant_id: &str) -> LedgerResult<Option<AuditCheckpoint>>;

    /// Persist a checkpoint; a duplicate `(tenant_id, upto_sequence)` is a
    /// `WriteConflict`.
    async fn insert_checkpoint(&self, checkpoint: &AuditCheckpoint) -> LedgerResult<()>;

    /// Checkpoints whose range overlaps `[from, to]`, ascending.
    async fn checkpoints_overlapping(&self, tenant_id: &str, from: u64, to: u64) -> LedgerResult<Vec<AuditCheckpoint>>;

    async fn count_checkpoints(&self, tenant_id: &str) -> LedgerResult<u64>;

    async fn record_export(&self, record: &ExportRecord) -> LedgerResult<()>;

    async fn last_export(&self, tenant_id: &str) -> LedgerResult<Option<ExportRecord>>;
}

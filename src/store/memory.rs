//! In-memory ledger store.
//!
//! Same contract as the SQLite store, for tests and embedded use. Also
//! exposes out-of-band mutation hooks that bypass every ledger invariant, so
//! tests can simulate an attacker editing storage directly.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use super::{ChainHead, LedgerStore};
use crate::audit::checkpoint::AuditCheckpoint;
use crate::audit::event::AuditEvent;
use crate::audit::export::ExportRecord;
use crate::error::{LedgerError, LedgerResult};

#[derive(Default)]
struct Partition {
    /// Ordered rows. A `Vec` rather than a map so that tampering can
    /// produce duplicates and reorderings the way a raw table edit could.
    events: Vec<AuditEvent>,
    checkpoints: BTreeMap<u64, AuditCheckpoint>,
    exports: Vec<ExportRecord>,
}

impl Partition {
    fn max_sequence(&self) -> u64 {
        self.events.iter().map(|e| e.sequence).max().unwrap_or(0)
    }
}

#[derive(Default)]
pub struct MemoryLedgerStore {
    partitions: RwLock<HashMap<String, Partition>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Out-of-band: rewrite a stored event in place.
    pub async fn tamper_event<F>(&self, tenant_id: &str, sequence: u64, mutate: F) -> bool
    where
        F: FnOnce(&mut AuditEvent),
    {
        let mut partitions = self.partitions.write().await;
        let Some(partition) = partitions.get_mut(tenant_id) else {
            return false;
        };
        match partition.events.iter_mut().find(|e| e.sequence == sequence) {
            Some(event) => {
                mutate(event);
                true
            }
            None => false,
        }
    }

    /// Out-of-band: delete a stored event.
    pub async fn delete_event(&self, tenant_id: &str, sequence: u64) -> bool {
        let mut partitions = self.partitions.write().await;
        let Some(partition) = partitions.get_mut(tenant_id) else {
            return false;
        };
        let before = partition.events.len();
        partition.events.retain(|e| e.sequence != sequence);
        partition.events.len() != before
    }

    /// Out-of-band: insert a row without any checks.
    pub async fn inject_event(&self, event: AuditEvent) {
        let mut partitions = self.partitions.write().await;
        let partition = partitions.entry(event.tenant_id.clone()).or_default();
        partition.events.push(event);
        partition.events.sort_by_key(|e| e.sequence);
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn head(&self, tenant_id: &str) -> LedgerResult<Option<ChainHead>> {
        let partitions = self.partitions.read().await;
        Ok(partitions
            .get(tenant_id)
            .and_then(|p| p.events.iter().max_by_key(|e| e.sequence))
            .map(ChainHead::from))
    }

    async fn append(&self, event: &AuditEvent) -> LedgerResult<()> {
        let mut partitions = self.partitions.write().await;
        let partition = partitions.entry(event.tenant_id.clone()).or_default();

        if partition.events.iter().any(|e| e.sequence == event.sequence) {
            return Err(LedgerError::WriteConflict(format!(
                "sequence {} already committed for tenant {}",
                event.sequence, event.tenant_id
            )));
        }

        let mark = partition.max_sequence();
        if event.sequence != mark + 1 {
            return Err(LedgerError::WriteConflict(format!(
                "tenant {} mark is {}, cannot append sequence {}",
                event.tenant_id, mark, event.sequence
            )));
        }

        partition.events.push(event.clone());
        Ok(())
    }

    async fn get_event(&self, tenant_id: &str, sequence: u64) -> LedgerResult<Option<AuditEvent>> {
        let partitions = self.partitions.read().await;
        Ok(partitions
            .get(tenant_id)
            .and_then(|p| p.events.iter().find(|e| e.sequence == sequence))
            .cloned())
    }

    async fn event_before(&self, tenant_id: &str, sequence: u64) -> LedgerResult<Option<AuditEvent>> {
        let partitions = self.partitions.read().await;
        Ok(partitions.get(tenant_id).and_then(|p| {
            p.events
                .iter()
                .filter(|e| e.sequence < sequence)
                .fold(None::<&AuditEvent>, |best, e| match best {
                    Some(b) if b.sequence >= e.sequence => Some(b),
                    _ => Some(e),
                })
                .cloned()
        }))
    }

    async fn events_in_range(&self, tenant_id: &str, from: u64, to: u64) -> LedgerResult<Vec<AuditEvent>> {
        let partitions = self.partitions.read().await;
        let mut events: Vec<AuditEvent> = partitions
            .get(tenant_id)
            .map(|p| {
                p.events
                    .iter()
                    .filter(|e| e.sequence >= from && e.sequence <= to)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        events.sort_by_key(|e| e.sequence);
        Ok(events)
    }

    async fn count_events(&self, tenant_id: &str) -> LedgerResult<u64> {
        let partitions = self.partitions.read().await;
        Ok(partitions.get(tenant_id).map(|p| p.events.len() as u64).unwrap_or(0))
    }

    async fn list_tenants(&self) -> LedgerResult<Vec<String>> {
        let partitions = self.partitions.read().await;
        let mut tenants: Vec<String> = partitions
            .iter()
            .filter(|(_, p)| !p.events.is_empty())
            .map(|(tenant, _)| tenant.clone())
            .collect();
        tenants.sort();
        Ok(tenants)
    }

    async fn last_checkpoint(&self, tenant_id: &str) -> LedgerResult<Option<AuditCheckpoint>> {
        let partitions = self.partitions.read().await;
        Ok(partitions
            .get(tenant_id)
            .and_then(|p| p.checkpoints.values().next_back())
            .cloned())
    }

    async fn insert_checkpoint(&self, checkpoint: &AuditCheckpoint) -> LedgerResult<()> {
        let mut partitions = self.partitions.write().await;
        let partition = partitions.entry(checkpoint.tenant_id.clone()).or_default();

        if partition.checkpoints.contains_key(&checkpoint.upto_sequence) {
            return Err(LedgerError::WriteConflict(format!(
                "checkpoint up to {} already exists for tenant {}",
                checkpoint.upto_sequence, checkpoint.tenant_id
            )));
        }

        partition
            .checkpoints
            .insert(checkpoint.upto_sequence, checkpoint.clone());
        Ok(())
    }

    async fn checkpoints_overlapping(&self, tenant_id: &str, from: u64, to: u64) -> LedgerResult<Vec<AuditCheckpoint>> {
        let partitions = self.partitions.read().await;
        Ok(partitions
            .get(tenant_id)
            .map(|p| {
                p.checkpoints
                    .values()
                    .filter(|c| c.from_sequence <= to && c.upto_sequence >= from)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn count_checkpoints(&self, tenant_id: &str) -> LedgerResult<u64> {
        let partitions = self.partitions.read().await;
        Ok(partitions
            .get(tenant_id)
            .map(|p| p.checkpoints.len() as u64)
            .unwrap_or(0))
    }

    async fn record_export(&self, record: &ExportRecord) -> LedgerResult<()> {
        let mut partitions = self.partitions.write().await;
        partitions
            .entry(record.tenant_id.clone())
            .or_default()
            .exports
            .push(record.clone());
        Ok(())
    }

    async fn last_export(&self, tenant_id: &str) -> LedgerResult<Option<ExportRecord>> {
        let partitions = self.partitions.read().await;
        Ok(partitions
            .get(tenant_id)
            .and_then(|p| p.exports.iter().max_by_key(|r| r.to_sequence))
            .cloned())
    }
}

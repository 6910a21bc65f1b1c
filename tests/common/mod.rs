#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use audit_ledger::audit::{AuditCheckpoint, AuditEvent, ExportRecord, NewEvent};
use audit_ledger::crypto::LedgerKeys;
use audit_ledger::database::Database;
use audit_ledger::store::ChainHead;
use audit_ledger::{AuditLedger, LedgerConfig, LedgerError, LedgerResult, LedgerStore, MemoryLedgerStore};

pub const EVENT_KEY: &str = "event-key-0123456789abcdef0123456789";
pub const CHECKPOINT_KEY: &str = "checkpoint-key-0123456789abcdef012345";

/// Config with test keys and fast backoff.
pub fn test_config() -> LedgerConfig {
    let mut config = LedgerConfig::new(EVENT_KEY, CHECKPOINT_KEY);
    config.writer.base_backoff_ms = 1;
    config.writer.max_backoff_ms = 20;
    config
}

/// Config with automatic checkpoints off, for tests that create them
/// explicitly.
pub fn manual_checkpoint_config() -> LedgerConfig {
    let mut config = test_config();
    config.checkpoint.enabled = false;
    config
}

pub fn test_keys() -> LedgerKeys {
    LedgerKeys::new(EVENT_KEY, CHECKPOINT_KEY).expect("test keys")
}

/// Setup an in-memory SQLite database for testing
pub async fn setup_test_db() -> Database {
    Database::new_in_memory().await.expect("Failed to create test database")
}

pub fn memory_ledger(config: &LedgerConfig) -> (Arc<MemoryLedgerStore>, AuditLedger) {
    let store = Arc::new(MemoryLedgerStore::new());
    let ledger = AuditLedger::new(store.clone(), config).expect("ledger");
    (store, ledger)
}

pub fn login(tenant: &str, n: usize) -> NewEvent {
    NewEvent::new(tenant, "lab1", "LOGIN", "user", format!("u-{}", n), format!("req-{}", n))
        .with_details(serde_json::json!({ "method": "password", "attempt": n }))
}

/// Record `count` events for `tenant`, one after another.
pub async fn record_many(ledger: &AuditLedger, tenant: &str, count: usize) -> Vec<AuditEvent> {
    let mut events = Vec::with_capacity(count);
    for n in 0..count {
        events.push(ledger.record(login(tenant, n)).await.expect("record"));
    }
    events
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// A store that injects failures in front of an in-memory store.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryLedgerStore,
    /// `head` calls that fail before succeeding. `u32::MAX` never succeeds.
    pub failing_heads: AtomicU32,
    /// `append` calls that commit and then report a storage error.
    pub lost_acks: AtomicU32,
    /// Delay before every append.
    pub append_delay_ms: AtomicU64,
    pub head_calls: AtomicU32,
    pub append_calls: AtomicU32,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                u32::MAX => Some(u32::MAX),
                n => Some(n - 1),
            })
            .is_ok()
    }
}

#[async_trait]
impl LedgerStore for FlakyStore {
    async fn head(&self, tenant_id: &str) -> LedgerResult<Option<ChainHead>> {
        self.head_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take(&self.failing_heads) {
            return Err(LedgerError::Storage("injected head failure".to_string()));
        }
        self.inner.head(tenant_id).await
    }

    async fn append(&self, event: &AuditEvent) -> LedgerResult<()> {
        self.append_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.append_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.inner.append(event).await?;
        if Self::take(&self.lost_acks) {
            return Err(LedgerError::Storage("injected lost acknowledgement".to_string()));
        }
        Ok(())
    }

    async fn get_event(&self, tenant_id: &str, sequence: u64) -> LedgerResult<Option<AuditEvent>> {
        self.inner.get_event(tenant_id, sequence).await
    }

    async fn event_before(&self, tenant_id: &str, sequence: u64) -> LedgerResult<Option<AuditEvent>> {
        self.inner.event_before(tenant_id, sequence).await
    }

    async fn events_in_range(&self, tenant_id: &str, from: u64, to: u64) -> LedgerResult<Vec<AuditEvent>> {
        self.inner.events_in_range(tenant_id, from, to).await
    }

    async fn count_events(&self, tenant_id: &str) -> LedgerResult<u64> {
        self.inner.count_events(tenant_id).await
    }

    async fn list_tenants(&self) -> LedgerResult<Vec<String>> {
        self.inner.list_tenants().await
    }

    async fn last_checkpoint(&self, tenant_id: &str) -> LedgerResult<Option<AuditCheckpoint>> {
        self.inner.last_checkpoint(tenant_id).await
    }

    async fn insert_checkpoint(&self, checkpoint: &AuditCheckpoint) -> LedgerResult<()> {
        self.inner.insert_checkpoint(checkpoint).await
    }

    async fn checkpoints_overlapping(&self, tenant_id: &str, from: u64, to: u64) -> LedgerResult<Vec<AuditCheckpoint>> {
        self.inner.checkpoints_overlapping(tenant_id, from, to).await
    }

    async fn count_checkpoints(&self, tenant_id: &str) -> LedgerResult<u64> {
        self.inner.count_checkpoints(tenant_id).await
    }

    async fn record_export(&self, record: &ExportRecord) -> LedgerResult<()> {
        self.inner.record_export(record).await
    }

    async fn last_export(&self, tenant_id: &str) -> LedgerResult<Option<ExportRecord>> {
        self.inner.last_export(tenant_id).await
    }
}

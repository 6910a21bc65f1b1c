use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::audit::checkpoint::AuditCheckpoint;
use crate::audit::event::AuditEvent;
use crate::audit::export::ExportRecord;
use crate::error::{LedgerError, LedgerResult};

#[derive(Debug, Clone, FromRow)]
pub struct EventRow {
    pub tenant_id: String,
    pub sequence: i64,
    pub actor: String,
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub details: String,
    pub timestamp_ms: i64,
    pub request_id: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub prev_hash: String,
    pub event_hash: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct CheckpointRow {
    pub tenant_id: String,
    pub from_sequence: i64,
    pub upto_sequence: i64,
    pub entry_count: i64,
    pub prev_digest: String,
    pub digest: String,
    pub signature: String,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct ExportRow {
    pub tenant_id: String,
    pub from_sequence: i64,
    pub to_sequence: i64,
    pub event_count: i64,
    pub requester: String,
    pub exported_at_ms: i64,
    pub bundle_digest: String,
}

/// SQLite integers are signed; ledger counters are not.
pub fn to_db(value: u64) -> LedgerResult<i64> {
    i64::try_from(value)
        .map_err(|_| LedgerError::Storage(format!("value {} exceeds storage range", value)))
}

pub fn from_db(value: i64) -> LedgerResult<u64> {
    u64::try_from(value)
        .map_err(|_| LedgerError::Storage(format!("negative stored counter {}", value)))
}

pub fn millis_to_datetime(ms: i64) -> LedgerResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| LedgerError::Storage(format!("stored timestamp {} out of range", ms)))
}

impl TryFrom<EventRow> for AuditEvent {
    type Error = LedgerError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(AuditEvent {
            tenant_id: row.tenant_id,
            sequence: from_db(row.sequence)?,
            actor: row.actor,
            action: row.action,
            entity_type: row.entity_type,
            entity_id: row.entity_id,
            details: serde_json::from_str(&row.details)?,
            timestamp: millis_to_datetime(row.timestamp_ms)?,
            request_id: row.request_id,
            ip_address: row.ip_address,
            user_agent: row.user_agent,
            prev_hash: row.prev_hash,
            event_hash: row.event_hash,
        })
    }
}

impl TryFrom<CheckpointRow> for AuditCheckpoint {
    type Error = LedgerError;

    fn try_from(row: CheckpointRow) -> Result<Self, Self::Error> {
        Ok(AuditCheckpoint {
            tenant_id: row.tenant_id,
            from_sequence: from_db(row.from_sequence)?,
            upto_sequence: from_db(row.upto_sequence)?,
            entry_count: from_db(row.entry_count)?,
            prev_digest: row.prev_digest,
            digest: row.digest,
            signature: row.signature,
            created_at: millis_to_datetime(row.created_at_ms)?,
        })
    }
}

impl TryFrom<ExportRow> for ExportRecord {
    type Error = LedgerError;

    fn try_from(row: ExportRow) -> Result<Self, Self::Error> {
        Ok(ExportRecord {
            tenant_id: row.tenant_id,
            from_sequence: from_db(row.from_sequence)?,
            to_sequence: from_db(row.to_sequence)?,
            event_count: from_db(row.event_count)?,
            requester: row.requester,
            exported_at: millis_to_datetime(row.exported_at_ms)?,
            bundle_digest: row.bundle_digest,
        })
    }
}

use async_trait::async_trait;
use tracing::debug;

use crate::audit::checkpoint::AuditCheckpoint;
use crate::audit::event::AuditEvent;
use crate::audit::export::ExportRecord;
use crate::crypto::to_canonical_string;
use crate::database::models::{to_db, CheckpointRow, EventRow, ExportRow};
use crate::database::Database;
use crate::error::{LedgerError, LedgerResult};
use crate::store::{ChainHead, LedgerStore};

const EVENT_COLUMNS: &str = "tenant_id, sequence, actor, action, entity_type, entity_id, details, \
     timestamp_ms, request_id, ip_address, user_agent, prev_hash, event_hash";

const CHECKPOINT_COLUMNS: &str =
    "tenant_id, from_sequence, upto_sequence, entry_count, prev_digest, digest, signature, created_at_ms";

#[async_trait]
impl LedgerStore for Database {
    async fn head(&self, tenant_id: &str) -> LedgerResult<Option<ChainHead>> {
        let row = sqlx::query_as::<_, EventRow>(&format!(
            "SELECT {} FROM audit_events WHERE tenant_id = ? ORDER BY sequence DESC LIMIT 1",
            EVENT_COLUMNS
        ))
        .bind(tenant_id)
        .fetch_optional(self.pool())
        .await?;

        match row {
            Some(row) => {
                let event = AuditEvent::try_from(row)?;
                Ok(Some(ChainHead::from(&event)))
            }
            None => Ok(None),
        }
    }

    async fn append(&self, event: &AuditEvent) -> LedgerResult<()> {
        // The INSERT only takes effect while the tenant's mark is still
        // sequence - 1; the primary key rejects a second writer for the
        // same sequence.
        let result = sqlx::query(&format!(
            r#"
            INSERT INTO audit_events ({})
            SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?
            WHERE (SELECT COALESCE(MAX(sequence), 0) FROM audit_events WHERE tenant_id = ?) = ?
            "#,
            EVENT_COLUMNS
        ))
        .bind(&event.tenant_id)
        .bind(to_db(event.sequence)?)
        .bind(&event.actor)
        .bind(&event.action)
        .bind(&event.entity_type)
        .bind(&event.entity_id)
        .bind(to_canonical_string(&event.details))
        .bind(event.timestamp.timestamp_millis())
        .bind(&event.request_id)
        .bind(&event.ip_address)
        .bind(&event.user_agent)
        .bind(&event.prev_hash)
        .bind(&event.event_hash)
        .bind(&event.tenant_id)
        .bind(to_db(event.sequence.saturating_sub(1))?)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::WriteConflict(format!(
                "tenant {} mark moved before sequence {} was committed",
                event.tenant_id, event.sequence
            )));
        }

        debug!("Persisted audit event {}", event.summary());
        Ok(())
    }

    async fn get_event(&self, tenant_id: &str, sequence: u64) -> LedgerResult<Option<AuditEvent>> {
        let row = sqlx::query_as::<_, EventRow>(&format!(
            "SELECT {} FROM audit_events WHERE tenant_id = ? AND sequence = ?",
            EVENT_COLUMNS
        ))
        .bind(tenant_id)
        .bind(to_db(sequence)?)
        .fetch_optional(self.pool())
        .await?;

        row.map(AuditEvent::try_from).transpose()
    }

    async fn event_before(&self, tenant_id: &str, sequence: u64) -> LedgerResult<Option<AuditEvent>> {
        let row = sqlx::query_as::<_, EventRow>(&format!(
            "SELECT {} FROM audit_events WHERE tenant_id = ? AND sequence < ? ORDER BY sequence DESC LIMIT 1",
            EVENT_COLUMNS
        ))
        .bind(tenant_id)
        .bind(to_db(sequence)?)
        .fetch_optional(self.pool())
        .await?;

        row.map(AuditEvent::try_from).transpose()
    }

    async fn events_in_range(&self, tenant_id: &str, from: u64, to: u64) -> LedgerResult<Vec<AuditEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(&format!(
            r#"
            SELECT {} FROM audit_events
            WHERE tenant_id = ? AND sequence >= ? AND sequence <= ?
            ORDER BY sequence ASC
            "#,
            EVENT_COLUMNS
        ))
        .bind(tenant_id)
        .bind(to_db(from)?)
        .bind(to_db(to)?)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(AuditEvent::try_from).collect()
    }

    async fn count_events(&self, tenant_id: &str) -> LedgerResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM audit_events WHERE tenant_id = ?")
            .bind(tenant_id)
            .fetch_one(self.pool())
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn list_tenants(&self) -> LedgerResult<Vec<String>> {
        let tenants: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT tenant_id FROM audit_events ORDER BY tenant_id")
                .fetch_all(self.pool())
                .await?;
        Ok(tenants)
    }

    async fn last_checkpoint(&self, tenant_id: &str) -> LedgerResult<Option<AuditCheckpoint>> {
        let row = sqlx::query_as::<_, CheckpointRow>(&format!(
            "SELECT {} FROM audit_checkpoints WHERE tenant_id = ? ORDER BY upto_sequence DESC LIMIT 1",
            CHECKPOINT_COLUMNS
        ))
        .bind(tenant_id)
        .fetch_optional(self.pool())
        .await?;

        row.map(AuditCheckpoint::try_from).transpose()
    }

    async fn insert_checkpoint(&self, checkpoint: &AuditCheckpoint) -> LedgerResult<()> {
        sqlx::query(&format!(
            "INSERT INTO audit_checkpoints ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            CHECKPOINT_COLUMNS
        ))
        .bind(&checkpoint.tenant_id)
        .bind(to_db(checkpoint.from_sequence)?)
        .bind(to_db(checkpoint.upto_sequence)?)
        .bind(to_db(checkpoint.entry_count)?)
        .bind(&checkpoint.prev_digest)
        .bind(&checkpoint.digest)
        .bind(&checkpoint.signature)
        .bind(checkpoint.created_at.timestamp_millis())
        .execute(self.pool())
        .await?;

        Ok(())
    }

    async fn checkpoints_overlapping(&self, tenant_id: &str, from: u64, to: u64) -> LedgerResult<Vec<AuditCheckpoint>> {
        let rows = sqlx::query_as::<_, CheckpointRow>(&format!(
            r#"
            SELECT {} FROM audit_checkpoints
            WHERE tenant_id = ? AND from_sequence <= ? AND upto_sequence >= ?
            ORDER BY upto_sequence ASC
            "#,
            CHECKPOINT_COLUMNS
        ))
        .bind(tenant_id)
        .bind(to_db(to)?)
        .bind(to_db(from)?)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(AuditCheckpoint::try_from).collect()
    }

    async fn count_checkpoints(&self, tenant_id: &str) -> LedgerResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM audit_checkpoints WHERE tenant_id = ?")
            .bind(tenant_id)
            .fetch_one(self.pool())
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn record_export(&self, record: &ExportRecord) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_exports
            (tenant_id, from_sequence, to_sequence, event_count, requester, exported_at_ms, bundle_digest)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.tenant_id)
        .bind(to_db(record.from_sequence)?)
        .bind(to_db(record.to_sequence)?)
        .bind(to_db(record.event_count)?)
        .bind(&record.requester)
        .bind(record.exported_at.timestamp_millis())
        .bind(&record.bundle_digest)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    async fn last_export(&self, tenant_id: &str) -> LedgerResult<Option<ExportRecord>> {
        let row = sqlx::query_as::<_, ExportRow>(
            r#"
            SELECT tenant_id, from_sequence, to_sequence, event_count, requester, exported_at_ms, bundle_digest
            FROM audit_exports
            WHERE tenant_id = ?
            ORDER BY to_sequence DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(self.pool())
        .await?;

        row.map(ExportRecord::try_from).transpose()
    }
}

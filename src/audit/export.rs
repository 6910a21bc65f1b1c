//! Export Bundles
//!
//! Produces self-contained, offline-verifiable bundles of a tenant's events:
//! the events in canonical form, the checkpoints overlapping the range, and
//! a signed header that anchors the range to the chain before it.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::audit::checkpoint::AuditCheckpoint;
use crate::audit::clock::Clock;
use crate::audit::event::{millis_rfc3339, AuditEvent, GENESIS_HASH};
use crate::audit::verify::{verify_range, ChainSegment, VerificationReport};
use crate::crypto::{sha256_hex, LedgerKeys, SigningKey};
use crate::error::{LedgerError, LedgerResult};
use crate::store::LedgerStore;

pub const BUNDLE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportHeader {
    pub format_version: u32,
    pub tenant_id: String,
    pub from_sequence: u64,
    pub to_sequence: u64,
    pub event_count: u64,
    #[serde(with = "millis_rfc3339")]
    pub exported_at: DateTime<Utc>,
    pub requester: String,
    /// `event_hash` of `from_sequence - 1`, or the genesis sentinel.
    pub anchor_hash: String,
    /// SHA-256 over the serialized events.
    pub events_digest: String,
}

impl ExportHeader {
    pub fn signing_payload(&self) -> LedgerResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportBundle {
    pub header: ExportHeader,
    pub header_signature: String,
    pub events: Vec<AuditEvent>,
    pub checkpoints: Vec<AuditCheckpoint>,
}

impl ExportBundle {
    pub fn to_json_vec(&self) -> LedgerResult<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_json_slice(bytes: &[u8]) -> LedgerResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Manifest row kept for every export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRecord {
    pub tenant_id: String,
    pub from_sequence: u64,
    pub to_sequence: u64,
    pub event_count: u64,
    pub requester: String,
    #[serde(with = "millis_rfc3339")]
    pub exported_at: DateTime<Utc>,
    pub bundle_digest: String,
}

/// Digest of the event list as it appears in a bundle.
pub fn events_digest(events: &[AuditEvent]) -> LedgerResult<String> {
    Ok(sha256_hex(&serde_json::to_vec(events)?))
}

pub struct ExportGateway {
    store: Arc<dyn LedgerStore>,
    key: SigningKey,
    clock: Arc<dyn Clock>,
}

impl ExportGateway {
    pub fn new(store: Arc<dyn LedgerStore>, checkpoint_key: SigningKey, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            key: checkpoint_key,
            clock,
        }
    }

    /// Export `[from, to]`. The range must be non-empty and fully committed.
    pub async fn export(&self, tenant_id: &str, from: u64, to: u64, requester: &str) -> LedgerResult<ExportBundle> {
        if requester.trim().is_empty() {
            return Err(LedgerError::ExportRangeInvalid("requester is required".to_string()));
        }
        if from == 0 || from > to {
            return Err(LedgerError::ExportRangeInvalid(format!(
                "invalid range {}..={}",
                from, to
            )));
        }

        let head = self.store.head(tenant_id).await?.ok_or_else(|| {
            LedgerError::ExportRangeInvalid(format!("tenant {} has no events", tenant_id))
        })?;
        if to > head.sequence {
            return Err(LedgerError::ExportRangeInvalid(format!(
                "range ends at {} but tenant {} is at {}",
                to, tenant_id, head.sequence
            )));
        }

        let events = self.store.events_in_range(tenant_id, from, to).await?;
        if events.len() as u64 != to - from + 1 {
            return Err(LedgerError::ExportRangeInvalid(format!(
                "range {}..={} has {} stored events, expected {}",
                from,
                to,
                events.len(),
                to - from + 1
            )));
        }

        let anchor_hash = if from == 1 {
            GENESIS_HASH.to_string()
        } else {
            self.store
                .get_event(tenant_id, from - 1)
                .await?
                .map(|e| e.event_hash)
                .ok_or_else(|| {
                    LedgerError::ExportRangeInvalid(format!("anchor sequence {} missing", from - 1))
                })?
        };

        let checkpoints = self.store.checkpoints_overlapping(tenant_id, from, to).await?;
        let digest = events_digest(&events)?;

        let header = ExportHeader {
            format_version: BUNDLE_FORMAT_VERSION,
            tenant_id: tenant_id.to_string(),
            from_sequence: from,
            to_sequence: to,
            event_count: events.len() as u64,
            exported_at: self.clock.now().trunc_subsecs(3),
            requester: requester.to_string(),
            anchor_hash,
            events_digest: digest.clone(),
        };
        let header_signature = self.key.sign(&header.signing_payload()?);

        self.store
            .record_export(&ExportRecord {
                tenant_id: tenant_id.to_string(),
                from_sequence: from,
                to_sequence: to,
                event_count: header.event_count,
                requester: requester.to_string(),
                exported_at: header.exported_at,
                bundle_digest: digest,
            })
            .await?;

        info!(
            "Exported {} {}..={} ({} events, {} checkpoints) for {}",
            tenant_id,
            from,
            to,
            header.event_count,
            checkpoints.len(),
            requester
        );

        Ok(ExportBundle {
            header,
            header_signature,
            events,
            checkpoints,
        })
    }

    /// Export everything committed since the last recorded export.
    pub async fn export_since_last(&self, tenant_id: &str, requester: &str) -> LedgerResult<ExportBundle> {
        let from = self
            .store
            .last_export(tenant_id)
            .await?
            .map(|r| r.to_sequence + 1)
            .unwrap_or(1);
        let to = self
            .store
            .head(tenant_id)
            .await?
            .map(|h| h.sequence)
            .unwrap_or(0);

        if from > to {
            return Err(LedgerError::ExportRangeInvalid(format!(
                "no events for {} since sequence {}",
                tenant_id,
                from - 1
            )));
        }
        self.export(tenant_id, from, to, requester).await
    }
}

/// Verify a bundle offline with the ledger's keys.
///
/// A bad header signature or a header that does not describe the bundle is
/// an error; chain findings are returned in the report exactly as the live
/// verifier would produce them.
pub fn verify_bundle(bundle: &ExportBundle, keys: &LedgerKeys) -> LedgerResult<VerificationReport> {
    let header = &bundle.header;
    if header.format_version != BUNDLE_FORMAT_VERSION {
        return Err(LedgerError::Crypto(format!(
            "unsupported bundle format {}",
            header.format_version
        )));
    }
    if !keys
        .checkpoint
        .verify(&header.signing_payload()?, &bundle.header_signature)
    {
        return Err(LedgerError::Crypto("bundle header signature invalid".to_string()));
    }
    if events_digest(&bundle.events)? != header.events_digest {
        return Err(LedgerError::Crypto(
            "bundle events do not match header digest".to_string(),
        ));
    }
    if header.event_count != bundle.events.len() as u64 {
        return Err(LedgerError::Crypto(format!(
            "bundle header declares {} events but carries {}",
            header.event_count,
            bundle.events.len()
        )));
    }
    if let Some(foreign) = bundle.events.iter().find(|e| e.tenant_id != header.tenant_id) {
        return Err(LedgerError::Crypto(format!(
            "bundle for {} contains an event of {}",
            header.tenant_id, foreign.tenant_id
        )));
    }

    let segment = ChainSegment {
        from: header.from_sequence,
        to: header.to_sequence,
        anchor_hash: Some(header.anchor_hash.as_str()),
        events: &bundle.events,
        checkpoints: &bundle.checkpoints,
    };
    Ok(verify_range(keys, &header.tenant_id, &segment))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::clock::SystemClock;
    use crate::audit::event::NewEvent;
    use crate::audit::verify::FailureKind;
    use crate::store::MemoryLedgerStore;

    fn keys() -> LedgerKeys {
        LedgerKeys::new(
            b"event-key-0123456789abcdef0123456789",
            b"checkpoint-key-0123456789abcdef012345",
        )
        .unwrap()
    }

    async fn seeded(count: u64) -> Arc<MemoryLedgerStore> {
        let store = Arc::new(MemoryLedgerStore::new());
        let mut prev = GENESIS_HASH.to_string();
        for sequence in 1..=count {
            let event = NewEvent::new("T1", "lab1", "VIEW", "report", "r-9", format!("q{}", sequence))
                .seal(sequence, &prev, Utc::now().trunc_subsecs(3), &keys().event)
                .unwrap();
            prev = event.event_hash.clone();
            store.append(&event).await.unwrap();
        }
        store
    }

    fn gateway(store: Arc<MemoryLedgerStore>) -> ExportGateway {
        ExportGateway::new(store, keys().checkpoint, Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn test_export_verifies_offline() {
        let store = seeded(6).await;
        let bundle = gateway(store).export("T1", 3, 5, "auditor").await.unwrap();

        assert_eq!(bundle.header.event_count, 3);
        assert_eq!(bundle.events.first().unwrap().sequence, 3);

        let bytes = bundle.to_json_vec().unwrap();
        let parsed = ExportBundle::from_json_slice(&bytes).unwrap();
        let report = verify_bundle(&parsed, &keys()).unwrap();
        assert!(report.verified);
        assert_eq!(report.checked, 3);
    }

    #[tokio::test]
    async fn test_invalid_ranges_rejected() {
        let store = seeded(3).await;
        let gateway = gateway(store.clone());

        for (from, to) in [(0, 2), (3, 2), (2, 9)] {
            let result = gateway.export("T1", from, to, "auditor").await;
            assert!(matches!(result, Err(LedgerError::ExportRangeInvalid(_))));
        }
        assert!(matches!(
            gateway.export("T9", 1, 1, "auditor").await,
            Err(LedgerError::ExportRangeInvalid(_))
        ));

        store.delete_event("T1", 2).await;
        assert!(matches!(
            gateway.export("T1", 1, 3, "auditor").await,
            Err(LedgerError::ExportRangeInvalid(_))
        ));
        assert!(store.last_export("T1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_edited_bundle_event_detected() {
        let store = seeded(4).await;
        let mut bundle = gateway(store).export("T1", 1, 4, "auditor").await.unwrap();

        bundle.events[1].actor = "mallory".to_string();
        // Without re-signing the header the digest no longer matches.
        assert!(verify_bundle(&bundle, &keys()).is_err());

        // With a valid header over the edited events the chain check still
        // catches it.
        bundle.header.events_digest = events_digest(&bundle.events).unwrap();
        bundle.header_signature = keys().checkpoint.sign(&bundle.header.signing_payload().unwrap());
        let report = verify_bundle(&bundle, &keys()).unwrap();
        let failure = report.failure.unwrap();
        assert_eq!(failure.sequence, 2);
        assert_eq!(failure.kind, FailureKind::HashMismatch);
    }

    #[tokio::test]
    async fn test_export_since_last() {
        let store = seeded(5).await;
        let gateway = gateway(store.clone());

        let first = gateway.export("T1", 1, 3, "auditor").await.unwrap();
        assert_eq!(first.header.to_sequence, 3);

        let next = gateway.export_since_last("T1", "auditor").await.unwrap();
        assert_eq!(next.header.from_sequence, 4);
        assert_eq!(next.header.to_sequence, 5);
        assert_eq!(next.header.anchor_hash, first.events.last().unwrap().event_hash);

        assert!(matches!(
            gateway.export_since_last("T1", "auditor").await,
            Err(LedgerError::ExportRangeInvalid(_))
        ));
    }
}

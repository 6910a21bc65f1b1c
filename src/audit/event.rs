//! Audit Event
//!
//! Defines the immutable, hash-chained record at the heart of the ledger and
//! the canonical byte form its `event_hash` commits to.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crypto::{canonicalize, SigningKey};
use crate::error::{LedgerError, LedgerResult};

/// `prev_hash` of the first event in every tenant's chain.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// One committed ledger record.
///
/// Field order here is the canonical order: the JSON form of an event is
/// exactly its hashed payload followed by `eventHash`, so an external
/// verifier can recompute hashes from an export without a schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub tenant_id: String,
    pub sequence: u64,
    pub actor: String,
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub details: Value,
    #[serde(with = "millis_rfc3339")]
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub prev_hash: String,
    pub event_hash: String,
}

/// Borrowed view of the hashed fields, in canonical order.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CanonicalEvent<'a> {
    tenant_id: &'a str,
    sequence: u64,
    actor: &'a str,
    action: &'a str,
    entity_type: &'a str,
    entity_id: &'a str,
    details: Value,
    #[serde(with = "millis_rfc3339")]
    timestamp: DateTime<Utc>,
    request_id: &'a str,
    ip_address: Option<&'a str>,
    user_agent: Option<&'a str>,
    prev_hash: &'a str,
}

impl AuditEvent {
    /// Canonical bytes covered by `event_hash`.
    pub fn canonical_payload(&self) -> LedgerResult<Vec<u8>> {
        let view = CanonicalEvent {
            tenant_id: &self.tenant_id,
            sequence: self.sequence,
            actor: &self.actor,
            action: &self.action,
            entity_type: &self.entity_type,
            entity_id: &self.entity_id,
            details: canonicalize(&self.details),
            timestamp: self.timestamp,
            request_id: &self.request_id,
            ip_address: self.ip_address.as_deref(),
            user_agent: self.user_agent.as_deref(),
            prev_hash: &self.prev_hash,
        };
        Ok(serde_json::to_vec(&view)?)
    }

    /// Recompute the HMAC over this event's fields.
    pub fn compute_hash(&self, key: &SigningKey) -> LedgerResult<String> {
        Ok(key.sign(&self.canonical_payload()?))
    }

    /// Whether the stored `event_hash` matches the event's content.
    pub fn verify_hash(&self, key: &SigningKey) -> bool {
        match self.canonical_payload() {
            Ok(payload) => key.verify(&payload, &self.event_hash),
            Err(_) => false,
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.sequence == 1
    }

    /// Get a human-readable summary
    pub fn summary(&self) -> String {
        format!(
            "{}#{} {} by {} on {}:{}",
            self.tenant_id, self.sequence, self.action, self.actor, self.entity_type, self.entity_id
        )
    }
}

/// Caller-supplied content of an event, before sequencing and sealing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEvent {
    pub tenant_id: String,
    pub actor: String,
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    #[serde(default = "empty_details")]
    pub details: Value,
    pub request_id: String,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
}

fn empty_details() -> Value {
    Value::Object(Default::default())
}

impl NewEvent {
    pub fn new(
        tenant_id: impl Into<String>,
        actor: impl Into<String>,
        action: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        request_id: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            actor: actor.into(),
            action: action.into(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            details: empty_details(),
            request_id: request_id.into(),
            ip_address: None,
            user_agent: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_request_context(mut self, ip_address: Option<String>, user_agent: Option<String>) -> Self {
        self.ip_address = ip_address;
        self.user_agent = user_agent;
        self
    }

    /// Reject malformed calls. The ledger never rejects for business reasons.
    pub fn validate(&self) -> LedgerResult<()> {
        let required = [
            ("tenantId", &self.tenant_id),
            ("actor", &self.actor),
            ("action", &self.action),
            ("entityType", &self.entity_type),
            ("entityId", &self.entity_id),
            ("requestId", &self.request_id),
        ];

        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(LedgerError::InvalidEvent(format!("{} is required", name)));
            }
        }

        if !self.details.is_object() {
            return Err(LedgerError::InvalidEvent(
                "details must be a JSON object".to_string(),
            ));
        }

        Ok(())
    }

    /// Bind this draft to its chain position and compute its hash.
    pub fn seal(
        &self,
        sequence: u64,
        prev_hash: &str,
        timestamp: DateTime<Utc>,
        key: &SigningKey,
    ) -> LedgerResult<AuditEvent> {
        let mut event = AuditEvent {
            tenant_id: self.tenant_id.clone(),
            sequence,
            actor: self.actor.clone(),
            action: self.action.clone(),
            entity_type: self.entity_type.clone(),
            entity_id: self.entity_id.clone(),
            details: canonicalize(&self.details),
            timestamp,
            request_id: self.request_id.clone(),
            ip_address: self.ip_address.clone(),
            user_agent: self.user_agent.clone(),
            prev_hash: prev_hash.to_string(),
            event_hash: String::new(),
        };

        event.event_hash = event.compute_hash(key)?;
        Ok(event)
    }
}

/// RFC 3339 with exactly three fractional digits and a `Z` suffix.
pub mod millis_rfc3339 {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn format(value: &DateTime<Utc>) -> String {
        value.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::api::{ApiError, AppState};
use crate::audit::{AuditCheckpoint, AuditEvent, EntryVerification, ExportBundle, NewEvent, VerificationReport};
use crate::ledger::{LedgerHealth, LedgerSummary};

type ApiResult<T> = Result<T, ApiError>;

/// Body of `POST /tenants/:tenant/events`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordRequest {
    pub actor: String,
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    #[serde(default)]
    pub details: Option<Value>,
    /// Generated when absent.
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    pub from: Option<u64>,
    pub to: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    pub from: u64,
    pub to: u64,
    pub requester: String,
}

#[derive(Debug, Deserialize)]
pub struct RequesterQuery {
    pub requester: String,
}

pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "audit-ledger",
        "timestamp": chrono::Utc::now()
    }))
}

pub async fn record_event(
    State(ledger): State<AppState>,
    Path(tenant): Path<String>,
    headers: HeaderMap,
    Json(body): Json<RecordRequest>,
) -> ApiResult<(StatusCode, Json<AuditEvent>)> {
    let request_id = body
        .request_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let ip_address = body.ip_address.or_else(|| forwarded_for(&headers));
    let user_agent = body.user_agent.or_else(|| {
        headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    });

    let mut draft = NewEvent::new(
        tenant,
        body.actor,
        body.action,
        body.entity_type,
        body.entity_id,
        request_id,
    )
    .with_request_context(ip_address, user_agent);
    if let Some(details) = body.details {
        draft = draft.with_details(details);
    }

    let event = ledger.record(draft).await?;
    Ok((StatusCode::CREATED, Json(event)))
}

fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub async fn verify_range(
    State(ledger): State<AppState>,
    Path(tenant): Path<String>,
    Query(range): Query<RangeQuery>,
) -> ApiResult<Json<VerificationReport>> {
    let report = match (range.from, range.to) {
        (None, None) => ledger.verify_all(&tenant).await?,
        (from, to) => {
            let to = match to {
                Some(to) => to,
                None => ledger.health(&tenant).await?.last_sequence,
            };
            ledger.verify(&tenant, from.unwrap_or(1), to).await?
        }
    };
    Ok(Json(report))
}

pub async fn verify_entry(
    State(ledger): State<AppState>,
    Path((tenant, sequence)): Path<(String, u64)>,
) -> ApiResult<Json<EntryVerification>> {
    Ok(Json(ledger.verify_entry(&tenant, sequence).await?))
}

pub async fn tenant_health(
    State(ledger): State<AppState>,
    Path(tenant): Path<String>,
) -> ApiResult<Json<LedgerHealth>> {
    Ok(Json(ledger.health(&tenant).await?))
}

pub async fn tenant_summary(
    State(ledger): State<AppState>,
    Path(tenant): Path<String>,
) -> ApiResult<Json<LedgerSummary>> {
    Ok(Json(ledger.summary(&tenant).await?))
}

pub async fn create_checkpoint(
    State(ledger): State<AppState>,
    Path(tenant): Path<String>,
) -> ApiResult<(StatusCode, Json<Option<AuditCheckpoint>>)> {
    let checkpoint = ledger.checkpoint_now(&tenant).await?;
    let status = if checkpoint.is_some() {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(checkpoint)))
}

pub async fn export_range(
    State(ledger): State<AppState>,
    Path(tenant): Path<String>,
    Query(query): Query<ExportQuery>,
) -> ApiResult<Json<ExportBundle>> {
    info!(
        "Export of {} {}..={} requested by {}",
        tenant, query.from, query.to, query.requester
    );
    let bundle = ledger
        .export(&tenant, query.from, query.to, &query.requester)
        .await?;
    Ok(Json(bundle))
}

pub async fn export_since_last(
    State(ledger): State<AppState>,
    Path(tenant): Path<String>,
    Query(query): Query<RequesterQuery>,
) -> ApiResult<Json<ExportBundle>> {
    Ok(Json(ledger.export_since_last(&tenant, &query.requester).await?))
}

//! HTTP API
//!
//! Thin axum surface over [`AuditLedger`]: record events, verify ranges,
//! read health and summaries, export bundles.

pub mod handlers;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::json;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::error::LedgerError;
use crate::ledger::AuditLedger;

pub type AppState = Arc<AuditLedger>;

pub fn router(ledger: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/tenants/:tenant/events", post(handlers::record_event))
        .route("/tenants/:tenant/events/:sequence/verify", get(handlers::verify_entry))
        .route("/tenants/:tenant/verify", get(handlers::verify_range))
        .route("/tenants/:tenant/health", get(handlers::tenant_health))
        .route("/tenants/:tenant/summary", get(handlers::tenant_summary))
        .route("/tenants/:tenant/checkpoints", post(handlers::create_checkpoint))
        .route("/tenants/:tenant/export", get(handlers::export_range))
        .route("/tenants/:tenant/export/since-last", post(handlers::export_since_last))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .into_inner(),
        )
        .with_state(ledger)
}

/// A ledger error rendered as a JSON response.
pub struct ApiError(pub LedgerError);

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            LedgerError::InvalidEvent(_)
            | LedgerError::InvalidRange(_)
            | LedgerError::ExportRangeInvalid(_) => StatusCode::BAD_REQUEST,
            LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
            LedgerError::WriteConflict(_) => StatusCode::CONFLICT,
            LedgerError::ChainIntegrity(_) => StatusCode::UNPROCESSABLE_ENTITY,
            LedgerError::AllocationUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            LedgerError::WriteTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match &self.0 {
            LedgerError::AllocationUnavailable(_) => "allocation_unavailable",
            LedgerError::WriteConflict(_) => "write_conflict",
            LedgerError::WriteTimeout(_) => "write_timeout",
            LedgerError::ChainIntegrity(_) => "chain_integrity",
            LedgerError::CheckpointFailure(_) => "checkpoint_failure",
            LedgerError::ExportRangeInvalid(_) => "export_range_invalid",
            LedgerError::InvalidEvent(_) => "invalid_event",
            LedgerError::InvalidRange(_) => "invalid_range",
            LedgerError::NotFound(_) => "not_found",
            LedgerError::Config(_) => "config",
            LedgerError::Storage(_) => "storage",
            LedgerError::Serialization(_) => "serialization",
            LedgerError::Crypto(_) => "crypto",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        let body = Json(json!({
            "error": self.code(),
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

use thiserror::Error;

use crate::audit::verify::IntegrityFailure;

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(format!("JSON serialization error: {}", err))
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        if is_unique_violation(&err) {
            return Self::WriteConflict(format!("duplicate key: {}", err));
        }
        Self::Storage(format!("Database error: {}", err))
    }
}

impl From<config::ConfigError> for LedgerError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.is_unique_violation(),
        _ => false,
    }
}

#[derive(Error, Debug)]
pub enum LedgerError {
    /// The sequence allocator could not read or advance the tenant's mark.
    #[error("Sequence allocation unavailable: {0}")]
    AllocationUnavailable(String),

    /// Persistence lost a race on `(tenant_id, sequence)`.
    #[error("Write conflict: {0}")]
    WriteConflict(String),

    #[error("Write timed out after {0} ms")]
    WriteTimeout(u64),

    #[error("Chain integrity error: {0}")]
    ChainIntegrity(IntegrityFailure),

    #[error("Checkpoint failure: {0}")]
    CheckpointFailure(String),

    #[error("Export range invalid: {0}")]
    ExportRangeInvalid(String),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Invalid range: {0}")]
    InvalidRange(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Cryptographic error: {0}")]
    Crypto(String),
}

impl LedgerError {
    /// Whether the failure is a storage transient worth retrying locally.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::AllocationUnavailable(_))
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

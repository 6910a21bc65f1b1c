pub mod api;
pub mod audit;
pub mod config;
pub mod crypto;
pub mod database;
pub mod error;
pub mod ledger;
pub mod store;

pub use config::LedgerConfig;
pub use database::Database;
pub use error::{LedgerError, LedgerResult};
pub use ledger::{AuditLedger, LedgerHealth, LedgerSummary};
pub use store::{LedgerStore, MemoryLedgerStore};
